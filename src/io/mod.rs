// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Bridge between the real-time render callback and the audio hardware.

pub mod combined;
pub mod orchestrator;
pub mod split;
pub mod task;
pub mod telemetry;

pub use combined::CombinedTask;
pub use orchestrator::{DriftThresholds, ExchangeReport, IoOrchestrator};
pub use split::{InputTask, OutputTask};
pub use task::{HardwareTask, TaskContext, TaskState};
pub use telemetry::{
    BridgeObserver, BridgeStats, CompensationEvent, Drift, FillReport, SharedLevels,
    StatsSnapshot, TracingObserver,
};

use crate::config::{BridgeConfig, Topology};
use crate::device::{DeviceBackend, DeviceError, DeviceParams};
use crate::scheduler::TaskSpec;
use std::time::Duration;
use uacbridge_rt::HostEndpoint;

/// Non-real-time endpoints of the two bridge channels.
pub struct HostSide {
    /// Carries samples from the render callback toward playback.
    pub to_host: HostEndpoint,
    /// Carries captured samples back to the render callback.
    pub from_host: HostEndpoint,
}

/// Open the devices for `topology` and build its background tasks.
pub fn build_tasks(
    config: &BridgeConfig,
    backend: &dyn DeviceBackend,
    host: HostSide,
    ctx: TaskContext,
) -> Result<Vec<(TaskSpec, Box<dyn HardwareTask>)>, DeviceError> {
    let params = DeviceParams::from_config(&config.device);
    let priority = config.threading.priority;

    let tasks = match config.threading.topology {
        Topology::Combined => {
            let task = CombinedTask::open(
                backend,
                &params,
                host.to_host,
                host.from_host,
                config.staging_capacity(),
                config.channels.chunk_samples,
                ctx,
            )?;
            let task: Box<dyn HardwareTask> = Box::new(task);
            vec![(TaskSpec::new(CombinedTask::NAME, priority), task)]
        }
        Topology::Split => {
            let mut output = OutputTask::open(
                backend,
                &params,
                host.to_host,
                Duration::from_millis(config.threading.read_timeout_ms),
                Duration::from_millis(config.threading.poll_interval_ms),
                ctx.clone(),
            )?;
            let input = match InputTask::open(backend, &params, host.from_host, ctx) {
                Ok(input) => input,
                Err(err) => {
                    // The playback device is already running.
                    output.finish();
                    return Err(err);
                }
            };
            let output: Box<dyn HardwareTask> = Box::new(output);
            let input: Box<dyn HardwareTask> = Box::new(input);
            vec![
                (TaskSpec::new(OutputTask::NAME, priority), output),
                (TaskSpec::new(InputTask::NAME, priority), input),
            ]
        }
    };
    Ok(tasks)
}
