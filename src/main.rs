// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! uacbridge daemon.
//!
//! Runs the bridge with a paced test tone standing in for the render callback
//! until SIGINT or SIGTERM arrives.

use std::process::ExitCode;
use std::thread;
use tracing::{error, info, warn};
use uacbridge::config::{BridgeConfig, ConfigManager};
use uacbridge::device::backend_for;
use uacbridge::render::PacedRender;
use uacbridge::rt::StopSignal;
use uacbridge::{IoOrchestrator, ThreadScheduler};

fn load_config() -> BridgeConfig {
    let manager = match ConfigManager::new() {
        Ok(manager) => manager,
        Err(e) => {
            warn!("No config directory ({}), using defaults", e);
            return BridgeConfig::default();
        }
    };
    match manager.load_bridge_config() {
        Ok(config) => config,
        Err(e) => {
            warn!("Failed to load config ({}), using defaults", e);
            BridgeConfig::default()
        }
    }
}

fn render_loop(
    mut bridge: IoOrchestrator<ThreadScheduler>,
    config: &BridgeConfig,
    stop: StopSignal,
) -> IoOrchestrator<ThreadScheduler> {
    PacedRender::new(config).run(&mut bridge, &stop, None);
    bridge
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                tracing_subscriber::EnvFilter::new("uacbridge=info,uacbridge_rt=info")
            }),
        )
        .init();

    info!("uacbridge starting...");

    let config = load_config();
    info!(
        "Config: {:?} backend, {} topology, {} Hz, {} frames per block",
        config.device.backend,
        config.threading.topology,
        config.device.sample_rate,
        config.device.block_size
    );

    let backend = match backend_for(&config.device) {
        Ok(backend) => backend,
        Err(e) => {
            error!("No audio backend: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let stop = StopSignal::new();
    let scheduler = ThreadScheduler::new(stop.clone());
    let bridge = match IoOrchestrator::start(&config, backend.as_ref(), scheduler) {
        Ok(bridge) => bridge,
        Err(e) => {
            error!("Failed to start bridge: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let render = {
        let stop = stop.clone();
        let config = config.clone();
        thread::Builder::new()
            .name("render".to_string())
            .spawn(move || render_loop(bridge, &config, stop))
    };
    let render = match render {
        Ok(handle) => handle,
        Err(e) => {
            error!("Failed to spawn render thread: {}", e);
            stop.raise();
            return ExitCode::FAILURE;
        }
    };

    info!("uacbridge ready");

    let signals = (
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()),
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt()),
    );
    match signals {
        (Ok(mut sigterm), Ok(mut sigint)) => {
            tokio::select! {
                _ = sigterm.recv() => info!("Received SIGTERM, shutting down..."),
                _ = sigint.recv() => info!("Received SIGINT, shutting down..."),
            }
        }
        _ => {
            warn!("Signal handlers unavailable, waiting for ctrl-c");
            let _ = tokio::signal::ctrl_c().await;
        }
    }

    stop.raise();
    match render.join() {
        Ok(bridge) => {
            let stats = bridge.shutdown();
            info!(
                "Exchanges: {}, overrun bursts: {}, underrun bursts: {}, device errors: {}",
                stats.exchanges, stats.overrun_bursts, stats.underrun_bursts, stats.device_errors
            );
        }
        Err(_) => {
            error!("Render thread panicked");
            return ExitCode::FAILURE;
        }
    }

    info!("uacbridge stopped");
    ExitCode::SUCCESS
}
