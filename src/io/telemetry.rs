// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Fill-level reporting, drift events and soft-error counters.

use tracing::{info, warn};
use uacbridge_rt::{Counter, FillGauge};

/// Which way the inbound ring was drifting when a burst fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Drift {
    /// Free space fell below the overrun threshold.
    Overrun,
    /// Readable data fell below the underrun threshold.
    Underrun,
}

impl std::fmt::Display for Drift {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Drift::Overrun => write!(f, "overrun"),
            Drift::Underrun => write!(f, "underrun"),
        }
    }
}

/// One compensation burst applied by the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompensationEvent {
    pub drift: Drift,
    /// Inbound samples readable when the threshold was checked.
    pub inbound_before: usize,
    /// Samples discarded from the ring being drained.
    pub dropped: usize,
    /// Silent samples added to the ring being padded.
    pub padded: usize,
}

/// Periodic snapshot of buffer occupancy, as `(fraction, samples)` pairs.
#[derive(Debug, Clone, Copy)]
pub struct FillReport<'a> {
    pub task: &'a str,
    pub cycle: u64,
    pub inbound: (f32, usize),
    pub outbound: (f32, usize),
    /// Only the combined task has a staging ring.
    pub staging: Option<(f32, usize)>,
}

/// Hooks for instrumentation.
///
/// `on_compensation` runs on the real-time thread and must not block.
pub trait BridgeObserver: Send + Sync {
    fn on_fill_levels(&self, _report: &FillReport<'_>) {}

    fn on_compensation(&self, _event: &CompensationEvent) {}
}

/// Observer that writes everything to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl BridgeObserver for TracingObserver {
    fn on_fill_levels(&self, report: &FillReport<'_>) {
        let staging = report
            .staging
            .map(|(fraction, count)| format!(" staging {:.3} ({:5})", fraction, count))
            .unwrap_or_default();
        info!(
            "{} cycle {}: inbound {:.3} ({:5}) outbound {:.3} ({:5}){}",
            report.task,
            report.cycle,
            report.inbound.0,
            report.inbound.1,
            report.outbound.0,
            report.outbound.1,
            staging
        );
    }

    fn on_compensation(&self, event: &CompensationEvent) {
        warn!(
            "About to {} with {} inbound samples: dropped {}, padded {}",
            event.drift, event.inbound_before, event.dropped, event.padded
        );
    }
}

/// Inbound and outbound ring levels, published by the real-time side.
#[derive(Debug, Default)]
pub struct SharedLevels {
    pub inbound: FillGauge,
    pub outbound: FillGauge,
}

/// Soft-error and activity counters.
#[derive(Debug, Default)]
pub struct BridgeStats {
    pub exchanges: Counter,
    pub outbound_overflows: Counter,
    pub inbound_overflows: Counter,
    pub forward_shortfalls: Counter,
    pub inbound_shortfalls: Counter,
    pub send_failures: Counter,
    pub receive_failures: Counter,
    pub overrun_bursts: Counter,
    pub underrun_bursts: Counter,
    pub hardware_cycles: Counter,
    pub short_waits: Counter,
    pub device_errors: Counter,
    pub staging_overflows: Counter,
    pub staging_underruns: Counter,
    pub channel_timeouts: Counter,
}

/// Plain copy of [`BridgeStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub exchanges: u64,
    pub outbound_overflows: u64,
    pub inbound_overflows: u64,
    pub forward_shortfalls: u64,
    pub inbound_shortfalls: u64,
    pub send_failures: u64,
    pub receive_failures: u64,
    pub overrun_bursts: u64,
    pub underrun_bursts: u64,
    pub hardware_cycles: u64,
    pub short_waits: u64,
    pub device_errors: u64,
    pub staging_overflows: u64,
    pub staging_underruns: u64,
    pub channel_timeouts: u64,
}

impl BridgeStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            exchanges: self.exchanges.get(),
            outbound_overflows: self.outbound_overflows.get(),
            inbound_overflows: self.inbound_overflows.get(),
            forward_shortfalls: self.forward_shortfalls.get(),
            inbound_shortfalls: self.inbound_shortfalls.get(),
            send_failures: self.send_failures.get(),
            receive_failures: self.receive_failures.get(),
            overrun_bursts: self.overrun_bursts.get(),
            underrun_bursts: self.underrun_bursts.get(),
            hardware_cycles: self.hardware_cycles.get(),
            short_waits: self.short_waits.get(),
            device_errors: self.device_errors.get(),
            staging_overflows: self.staging_overflows.get(),
            staging_underruns: self.staging_underruns.get(),
            channel_timeouts: self.channel_timeouts.get(),
        }
    }
}
