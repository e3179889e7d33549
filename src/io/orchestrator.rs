// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Real-time side of the bridge.
//!
//! [`IoOrchestrator::exchange`] is called once per render block. It pushes the
//! rendered samples into the outbound ring, drains whatever the hardware side
//! has captured into the inbound ring, and keeps the inbound ring centred by
//! dropping or padding a burst of samples whenever its fill level crosses a
//! threshold. The two hardware clocks are never locked together; these bursts
//! are the only drift correction.
//!
//! Relaying is paced by arrivals: every chunk received from the hardware side
//! releases an equal number of outbound samples toward it.

use crate::config::{BridgeConfig, ControlConfig, Topology};
use crate::device::DeviceBackend;
use crate::error::BridgeError;
use crate::io::task::{HardwareTask, TaskContext};
use crate::io::telemetry::{
    BridgeObserver, BridgeStats, CompensationEvent, Drift, SharedLevels, StatsSnapshot,
    TracingObserver,
};
use crate::io::{build_tasks, HostSide};
use crate::scheduler::{Scheduler, SchedulerError, TaskHandle, TaskSpec};
use std::sync::Arc;
use tracing::{debug, info, trace};
use uacbridge_rt::{ChannelError, ChannelRegistry, RingBuffer, RtEndpoint, StopSignal};

/// Inbound ring thresholds in samples.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DriftThresholds {
    /// Compensate when free space drops below this.
    pub overrun: usize,
    /// Compensate when readable data drops below this.
    pub underrun: usize,
    /// Samples dropped or padded per burst.
    pub compensation: usize,
}

impl DriftThresholds {
    pub fn from_config(control: &ControlConfig, capacity: usize) -> Self {
        let scaled = |fraction: f32| (capacity as f32 * fraction) as usize;
        Self {
            overrun: scaled(control.overrun_threshold),
            underrun: scaled(control.underrun_threshold),
            compensation: scaled(control.compensation),
        }
    }
}

/// What one [`IoOrchestrator::exchange`] call did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExchangeReport {
    /// Outgoing samples accepted by the outbound ring.
    pub written: usize,
    /// Samples written into `incoming`.
    pub delivered: usize,
    /// Samples received from, and relayed to, the hardware side.
    pub relayed: usize,
    pub compensation: Option<CompensationEvent>,
}

pub struct IoOrchestrator<S: Scheduler> {
    outbound: RingBuffer<f32>,
    inbound: RingBuffer<f32>,
    to_host: RtEndpoint,
    from_host: RtEndpoint,
    scratch: Box<[f32]>,
    thresholds: DriftThresholds,
    topology: Topology,
    scheduler: S,
    tasks: Vec<TaskHandle>,
    observer: Arc<dyn BridgeObserver>,
    levels: Arc<SharedLevels>,
    stats: Arc<BridgeStats>,
}

impl<S: Scheduler> IoOrchestrator<S> {
    /// Set up channels, rings and devices, and create the background tasks.
    ///
    /// Fails if the configuration is invalid, a channel cannot be created, or
    /// a device cannot be opened as stereo.
    pub fn start(
        config: &BridgeConfig,
        backend: &dyn DeviceBackend,
        scheduler: S,
    ) -> Result<Self, BridgeError> {
        Self::start_with_observer(config, backend, scheduler, Arc::new(TracingObserver))
    }

    pub fn start_with_observer(
        config: &BridgeConfig,
        backend: &dyn DeviceBackend,
        scheduler: S,
        observer: Arc<dyn BridgeObserver>,
    ) -> Result<Self, BridgeError> {
        config.validate()?;

        let channels = &config.channels;
        let registry = ChannelRegistry::new(channels.registry_root.clone());
        let to_host = registry.create(&channels.to_host, channels.capacity_bytes, false)?;
        let from_host = registry.create(&channels.from_host, channels.capacity_bytes, false)?;
        let host = HostSide {
            to_host: registry.open(registry.path_for(&channels.to_host))?,
            from_host: registry.open(registry.path_for(&channels.from_host))?,
        };

        let mut bridge = Self::with_endpoints(config, to_host, from_host, scheduler, observer)?;
        let ctx = bridge.task_context(config);
        for (spec, task) in build_tasks(config, backend, host, ctx)? {
            bridge.add_task(spec, task)?;
        }

        info!(
            "Bridge started: {} topology, {} tasks, rings of {} samples",
            bridge.topology,
            bridge.tasks.len(),
            bridge.inbound.capacity()
        );
        Ok(bridge)
    }

    /// Build the real-time side around existing endpoints, without tasks.
    ///
    /// Both rings are primed half full with silence.
    pub fn with_endpoints(
        config: &BridgeConfig,
        to_host: RtEndpoint,
        from_host: RtEndpoint,
        scheduler: S,
        observer: Arc<dyn BridgeObserver>,
    ) -> Result<Self, BridgeError> {
        config.validate()?;

        let capacity = config.ring_capacity();
        let mut outbound = RingBuffer::new(capacity);
        let mut inbound = RingBuffer::new(capacity);
        outbound.fill(0.0, capacity / 2);
        inbound.fill(0.0, capacity / 2);

        let thresholds = DriftThresholds::from_config(&config.control, capacity);
        debug!("Drift thresholds: {:?}", thresholds);

        Ok(Self {
            outbound,
            inbound,
            to_host,
            from_host,
            scratch: vec![0.0; config.channels.chunk_samples].into_boxed_slice(),
            thresholds,
            topology: config.threading.topology,
            scheduler,
            tasks: Vec::new(),
            observer,
            levels: Arc::new(SharedLevels::default()),
            stats: Arc::new(BridgeStats::default()),
        })
    }

    /// Context handed to background tasks built for this orchestrator.
    pub fn task_context(&self, config: &BridgeConfig) -> TaskContext {
        TaskContext {
            block_size: config.device.block_size,
            stop: self.scheduler.stop_signal().clone(),
            observer: Arc::clone(&self.observer),
            levels: Arc::clone(&self.levels),
            stats: Arc::clone(&self.stats),
            telemetry_interval: config.telemetry.interval_cycles,
        }
    }

    /// Hand a task to the scheduler. It is triggered on every exchange.
    pub fn add_task(
        &mut self,
        spec: TaskSpec,
        task: Box<dyn HardwareTask>,
    ) -> Result<TaskHandle, SchedulerError> {
        let handle = self.scheduler.create_task(spec, task)?;
        self.tasks.push(handle.clone());
        Ok(handle)
    }

    /// Exchange one render block with the hardware side.
    ///
    /// Writes all of `outgoing` to the outbound ring and fills `incoming` from
    /// the inbound ring. When an underrun burst fires, `incoming` is left
    /// untouched for this block. Never blocks.
    pub fn exchange(&mut self, outgoing: &[f32], incoming: &mut [f32]) -> ExchangeReport {
        let stats = &*self.stats;
        stats.exchanges.increment();
        let mut report = ExchangeReport::default();

        report.written = self.outbound.write(outgoing);
        if report.written < outgoing.len() {
            stats.outbound_overflows.increment();
            debug!(
                "Outbound ring full: {} of {} samples written",
                report.written,
                outgoing.len()
            );
        }

        loop {
            let received = match self.from_host.receive(&mut self.scratch[..]) {
                Ok(count) => count,
                Err(ChannelError::WouldBlock) | Err(ChannelError::Closed) => break,
                Err(err) => {
                    stats.receive_failures.increment();
                    debug!("Receive from hardware side failed: {}", err);
                    break;
                }
            };
            report.relayed += received;
            let chunk = &mut self.scratch[..received];

            let stored = self.inbound.write(chunk);
            if stored < received {
                stats.inbound_overflows.increment();
                debug!("Inbound ring full: dropped {} samples", received - stored);
            }

            let forwarded = self.outbound.read(chunk);
            if forwarded < received {
                stats.forward_shortfalls.increment();
                debug!(
                    "Outbound ring short: {} of {} samples, padding with silence",
                    forwarded, received
                );
                chunk[forwarded..].fill(0.0);
            }

            if let Err(err) = self.to_host.send(&*chunk) {
                stats.send_failures.increment();
                trace!("Relay to hardware side failed: {}", err);
            }
        }

        let filled = self.inbound.available_to_read();
        let overrun = self.inbound.available_to_write() < self.thresholds.overrun;
        let underrun = filled < self.thresholds.underrun;
        let burst = self.thresholds.compensation;

        report.compensation = if overrun {
            stats.overrun_bursts.increment();
            Some(CompensationEvent {
                drift: Drift::Overrun,
                inbound_before: filled,
                dropped: self.inbound.skip(burst),
                padded: self.outbound.fill(0.0, burst),
            })
        } else if underrun {
            stats.underrun_bursts.increment();
            Some(CompensationEvent {
                drift: Drift::Underrun,
                inbound_before: filled,
                padded: self.inbound.fill(0.0, burst),
                dropped: self.outbound.skip(burst),
            })
        } else {
            None
        };
        if let Some(event) = &report.compensation {
            self.observer.on_compensation(event);
        }

        if !underrun {
            report.delivered = self.inbound.read(incoming);
            if report.delivered < incoming.len() {
                stats.inbound_shortfalls.increment();
                debug!(
                    "Inbound ring short: {} of {} samples delivered",
                    report.delivered,
                    incoming.len()
                );
            }
        }

        self.levels
            .inbound
            .publish(self.inbound.available(), self.inbound.available_to_read());
        self.levels
            .outbound
            .publish(self.outbound.available(), self.outbound.available_to_read());

        for handle in &self.tasks {
            self.scheduler.schedule(handle);
        }
        report
    }

    pub fn topology(&self) -> Topology {
        self.topology
    }

    pub fn thresholds(&self) -> DriftThresholds {
        self.thresholds
    }

    /// Samples readable from the inbound ring.
    pub fn inbound_level(&self) -> usize {
        self.inbound.available_to_read()
    }

    /// Samples readable from the outbound ring.
    pub fn outbound_level(&self) -> usize {
        self.outbound.available_to_read()
    }

    pub fn stats(&self) -> &BridgeStats {
        &self.stats
    }

    pub fn stop_signal(&self) -> &StopSignal {
        self.scheduler.stop_signal()
    }

    pub fn tasks(&self) -> &[TaskHandle] {
        &self.tasks
    }

    pub fn scheduler(&self) -> &S {
        &self.scheduler
    }

    pub fn scheduler_mut(&mut self) -> &mut S {
        &mut self.scheduler
    }

    /// Stop every background task and return the final counters.
    pub fn shutdown(mut self) -> StatsSnapshot {
        self.scheduler.shutdown();
        let snapshot = self.stats.snapshot();
        info!("Bridge stopped: {:?}", snapshot);
        snapshot
    }
}

impl<S: Scheduler> Drop for IoOrchestrator<S> {
    fn drop(&mut self) {
        self.scheduler.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackendKind;
    use crate::device::{
        AudioDevice, CaptureSource, DeviceError, DeviceParams, PlaybackTap, SimulatedBackend,
        StreamSide,
    };
    use crate::io::telemetry::FillReport;
    use crate::io::{CombinedTask, StatsSnapshot, TaskState};
    use crate::render::PacedRender;
    use crate::scheduler::{ManualScheduler, ThreadScheduler};
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use uacbridge_rt::{DuplexChannel, HostEndpoint};

    const BLOCK: usize = 256;

    #[derive(Default)]
    struct RecordingObserver {
        events: Mutex<Vec<CompensationEvent>>,
        reports: Mutex<Vec<(String, Option<(f32, usize)>)>>,
    }

    impl BridgeObserver for RecordingObserver {
        fn on_fill_levels(&self, report: &FillReport<'_>) {
            self.reports
                .lock()
                .push((report.task.to_string(), report.staging));
        }

        fn on_compensation(&self, event: &CompensationEvent) {
            self.events.lock().push(*event);
        }
    }

    struct Rig {
        bridge: IoOrchestrator<ManualScheduler>,
        to_host: HostEndpoint,
        from_host: HostEndpoint,
        observer: Arc<RecordingObserver>,
    }

    fn rig() -> Rig {
        let config = BridgeConfig::default();
        let capacity = config.channels.capacity_bytes;
        let (rt_to, to_host) = DuplexChannel::new("UACToHost", capacity, false)
            .unwrap()
            .split();
        let (rt_from, from_host) = DuplexChannel::new("UACFromHost", capacity, false)
            .unwrap()
            .split();
        let observer = Arc::new(RecordingObserver::default());
        let bridge = IoOrchestrator::with_endpoints(
            &config,
            rt_to,
            rt_from,
            ManualScheduler::new(StopSignal::new()),
            observer.clone(),
        )
        .unwrap();
        Rig {
            bridge,
            to_host,
            from_host,
            observer,
        }
    }

    fn drain(endpoint: &mut HostEndpoint) -> Vec<f32> {
        let mut out = Vec::new();
        let mut buf = [0.0f32; 4096];
        while let Ok(count) = endpoint.receive(&mut buf) {
            out.extend_from_slice(&buf[..count]);
        }
        out
    }

    fn ramp(start: usize, len: usize) -> Vec<f32> {
        (start..start + len).map(|v| v as f32).collect()
    }

    /// Values after the leading silence, checked to be consecutive from 1.
    fn ramp_after_silence(samples: &[f32]) -> usize {
        let start = samples.iter().position(|&s| s != 0.0).unwrap_or(samples.len());
        let tail = &samples[start..];
        for (i, &s) in tail.iter().enumerate() {
            assert_eq!(s, (i + 1) as f32, "discontinuity at sample {}", start + i);
        }
        tail.len()
    }

    #[test]
    fn test_thresholds_scale_with_capacity() {
        let thresholds = DriftThresholds::from_config(&ControlConfig::default(), 4096);
        assert_eq!(
            thresholds,
            DriftThresholds {
                overrun: 819,
                underrun: 819,
                compensation: 1228,
            }
        );
    }

    #[test]
    fn test_rings_primed_half_full() {
        let rig = rig();
        assert_eq!(rig.bridge.inbound_level(), 2048);
        assert_eq!(rig.bridge.outbound_level(), 2048);
        assert_eq!(rig.bridge.topology(), Topology::Combined);
    }

    #[test]
    fn test_matched_rates_never_compensate() {
        let mut rig = rig();
        let mut incoming = vec![0.0f32; BLOCK];
        let mut forwarded = 0;

        for round in 0..1000 {
            rig.from_host.send(&vec![0.25f32; BLOCK]).unwrap();
            let report = rig
                .bridge
                .exchange(&ramp(round * BLOCK, BLOCK), &mut incoming);

            assert_eq!(report.compensation, None);
            assert_eq!(report.written, BLOCK);
            assert_eq!(report.relayed, BLOCK);
            assert_eq!(report.delivered, BLOCK);
            assert_eq!(rig.bridge.inbound_level(), 2048);
            forwarded += drain(&mut rig.to_host).len();
        }

        assert_eq!(forwarded, 1000 * BLOCK);
        assert!(incoming.iter().all(|&s| s == 0.25));
        assert!(rig.observer.events.lock().is_empty());
        assert_eq!(rig.bridge.stats().snapshot().overrun_bursts, 0);
    }

    #[test]
    fn test_relay_preserves_outbound_order() {
        let mut rig = rig();
        let mut incoming = vec![0.0f32; BLOCK];
        let mut relayed = Vec::new();
        for round in 0..20 {
            rig.from_host.send(&vec![0.0f32; BLOCK]).unwrap();
            rig.bridge
                .exchange(&ramp(round * BLOCK + 1, BLOCK), &mut incoming);
            relayed.extend(drain(&mut rig.to_host));
        }

        // The primed silence goes out first, then the rendered ramp.
        assert_eq!(relayed.len(), 20 * BLOCK);
        assert!(relayed[..2048].iter().all(|&s| s == 0.0));
        assert_eq!(ramp_after_silence(&relayed), 20 * BLOCK - 2048);
    }

    #[test]
    fn test_overrun_burst() {
        let mut rig = rig();
        let mut incoming = vec![0.0f32; BLOCK];
        rig.from_host.send(&vec![0.5f32; 1400]).unwrap();

        let report = rig.bridge.exchange(&vec![0.1f32; BLOCK], &mut incoming);
        let event = report.compensation.unwrap();
        assert_eq!(event.drift, Drift::Overrun);
        assert_eq!(event.inbound_before, 3448);
        assert_eq!(event.dropped, 1228);
        assert_eq!(event.padded, 1228);

        assert_eq!(report.delivered, BLOCK);
        assert_eq!(rig.bridge.inbound_level(), 3448 - 1228 - BLOCK);
        assert_eq!(rig.bridge.outbound_level(), 2048 + BLOCK - 1400 + 1228);
        assert_eq!(drain(&mut rig.to_host).len(), 1400);
        assert_eq!(rig.bridge.stats().overrun_bursts.get(), 1);
        assert_eq!(rig.observer.events.lock().as_slice(), &[event]);
    }

    #[test]
    fn test_underrun_burst_leaves_incoming_untouched() {
        let mut rig = rig();
        let mut incoming = vec![0.0f32; BLOCK];
        let outgoing = vec![0.1f32; BLOCK];

        for _ in 0..5 {
            let report = rig.bridge.exchange(&outgoing, &mut incoming);
            assert_eq!(report.compensation, None);
            assert_eq!(report.delivered, BLOCK);
        }
        assert_eq!(rig.bridge.inbound_level(), 768);

        incoming.fill(9.0);
        let report = rig.bridge.exchange(&outgoing, &mut incoming);
        let event = report.compensation.unwrap();
        assert_eq!(event.drift, Drift::Underrun);
        assert_eq!(event.inbound_before, 768);
        assert_eq!(event.padded, 1228);
        assert_eq!(event.dropped, 1228);
        assert_eq!(report.delivered, 0);
        assert!(incoming.iter().all(|&s| s == 9.0));
        assert_eq!(rig.bridge.inbound_level(), 768 + 1228);
        assert_eq!(rig.bridge.outbound_level(), 2048 + 6 * BLOCK - 1228);

        let report = rig.bridge.exchange(&outgoing, &mut incoming);
        assert_eq!(report.compensation, None);
        assert_eq!(report.delivered, BLOCK);
        assert!(incoming.iter().all(|&s| s == 0.0));
        assert_eq!(rig.bridge.stats().underrun_bursts.get(), 1);
    }

    #[test]
    fn test_delivery_never_exceeds_request() {
        let mut rig = rig();
        let mut incoming = vec![1.0f32; 8192];
        let report = rig.bridge.exchange(&[], &mut incoming);
        assert_eq!(report.written, 0);
        assert_eq!(report.delivered, 2048);
        assert!(incoming[..2048].iter().all(|&s| s == 0.0));
        assert!(incoming[2048..].iter().all(|&s| s == 1.0));
        assert_eq!(rig.bridge.stats().inbound_shortfalls.get(), 1);
    }

    #[test]
    fn test_outbound_overflow_is_counted() {
        let mut rig = rig();
        let mut incoming = vec![0.0f32; BLOCK];
        let report = rig.bridge.exchange(&vec![0.3f32; 3000], &mut incoming);
        assert_eq!(report.written, 2048);
        assert_eq!(rig.bridge.stats().outbound_overflows.get(), 1);
    }

    fn simulated_config(topology: Topology) -> BridgeConfig {
        let mut config = BridgeConfig::default();
        config.device.backend = BackendKind::Simulated;
        config.threading.topology = topology;
        config.threading.read_timeout_ms = 5;
        config.telemetry.interval_cycles = 0;
        config
    }

    #[test]
    fn test_start_triggers_tasks_every_exchange() {
        let config = simulated_config(Topology::Combined);
        let mut bridge = IoOrchestrator::start(
            &config,
            &SimulatedBackend::immediate(),
            ManualScheduler::new(StopSignal::new()),
        )
        .unwrap();
        assert_eq!(bridge.tasks().len(), 1);
        let handle = bridge.tasks()[0].clone();
        assert_eq!(handle.name(), CombinedTask::NAME);
        assert_eq!(bridge.scheduler().spec(&handle).unwrap().priority, 94);

        // Drain the inbound ring into an underrun; the trigger still fires.
        let mut incoming = vec![0.0f32; BLOCK];
        let mut bursts = 0;
        for _ in 0..8 {
            if bridge.exchange(&[], &mut incoming).compensation.is_some() {
                bursts += 1;
            }
        }
        assert_eq!(bursts, 1);
        assert_eq!(bridge.scheduler().trigger_count(&handle), 8);

        let stop = bridge.stop_signal().clone();
        bridge.shutdown();
        assert!(stop.is_raised());
    }

    #[test]
    fn test_combined_loopback_end_to_end() {
        let tap = PlaybackTap::new();
        let backend = SimulatedBackend {
            tap: Some(tap.clone()),
            source: CaptureSource::Loopback,
            ..SimulatedBackend::immediate()
        };
        let mut config = simulated_config(Topology::Combined);
        config.telemetry.interval_cycles = 10;
        let observer = Arc::new(RecordingObserver::default());
        let mut bridge = IoOrchestrator::start_with_observer(
            &config,
            &backend,
            ManualScheduler::new(StopSignal::new()),
            observer.clone(),
        )
        .unwrap();

        let mut incoming = vec![0.0f32; BLOCK];
        let mut received = Vec::new();
        for round in 0..60 {
            let report = bridge.exchange(&ramp(round * BLOCK + 1, BLOCK), &mut incoming);
            assert_eq!(report.compensation, None);
            received.extend_from_slice(&incoming[..report.delivered]);
            bridge.scheduler_mut().run_all().unwrap();
        }

        // Staging and outbound priming play out first, then the ramp.
        let played = tap.take();
        assert_eq!(played.len(), 60 * BLOCK);
        assert!(played[..2560].iter().all(|&s| s == 0.0));
        assert_eq!(ramp_after_silence(&played), 60 * BLOCK - 2560);

        // The captured loopback comes back in order too.
        assert!(ramp_after_silence(&received) >= 2048);

        let reports = observer.reports.lock();
        assert_eq!(reports.len(), 6);
        assert_eq!(reports[0].0, CombinedTask::NAME);
        assert!(reports[0].1.is_some());
        drop(reports);

        let snapshot = bridge.shutdown();
        assert_eq!(snapshot.hardware_cycles, 60);
        assert_eq!(snapshot.staging_underruns, 0);
    }

    #[test]
    fn test_split_topology_end_to_end() {
        let tap = PlaybackTap::new();
        let backend = SimulatedBackend {
            tap: Some(tap.clone()),
            source: CaptureSource::Silence,
            ..SimulatedBackend::immediate()
        };
        let config = simulated_config(Topology::Split);
        let mut bridge = IoOrchestrator::start(
            &config,
            &backend,
            ManualScheduler::new(StopSignal::new()),
        )
        .unwrap();
        assert_eq!(bridge.tasks().len(), 2);
        assert_eq!(bridge.tasks()[0].name(), "pcm_output");
        assert_eq!(bridge.tasks()[1].name(), "pcm_input");

        let mut incoming = vec![0.0f32; BLOCK];
        for round in 0..40 {
            let report = bridge.exchange(&ramp(round * BLOCK + 1, BLOCK), &mut incoming);
            assert_eq!(report.compensation, None);
            bridge.scheduler_mut().run_all().unwrap();
        }

        // Only the very first output cycle found nothing to play.
        let played = tap.take();
        assert_eq!(played.len(), 40 * BLOCK);
        assert_eq!(bridge.stats().channel_timeouts.get(), 1);
        assert_eq!(ramp_after_silence(&played), 39 * BLOCK - 2048);

        let handle = bridge.tasks()[0].clone();
        bridge.scheduler_mut().shutdown();
        assert_eq!(
            bridge.scheduler().task_state(&handle),
            Some(TaskState::Stopped)
        );
    }

    /// Run `exchanges` blocks with the tasks cycled `cycles(round)` times after
    /// each one, standing in for a hardware clock faster or slower than the
    /// render clock.
    fn skewed_run(
        topology: Topology,
        exchanges: usize,
        cycles: impl Fn(usize) -> usize,
    ) -> StatsSnapshot {
        let backend = SimulatedBackend {
            source: CaptureSource::Loopback,
            ..SimulatedBackend::immediate()
        };
        let config = simulated_config(topology);
        let mut bridge = IoOrchestrator::start(
            &config,
            &backend,
            ManualScheduler::new(StopSignal::new()),
        )
        .unwrap();

        let mut incoming = vec![0.0f32; BLOCK];
        for round in 0..exchanges {
            bridge.exchange(&ramp(round * BLOCK + 1, BLOCK), &mut incoming);
            for _ in 0..cycles(round) {
                bridge.scheduler_mut().run_all().unwrap();
            }
        }
        bridge.shutdown()
    }

    #[test]
    fn test_fast_hardware_drops_bursts() {
        for topology in [Topology::Combined, Topology::Split] {
            // One extra hardware block every ten render blocks.
            let stats = skewed_run(topology, 300, |round| 1 + usize::from(round % 10 == 9));
            assert!(stats.overrun_bursts >= 1, "{}: {:?}", topology, stats);
            assert_eq!(stats.underrun_bursts, 0, "{}: {:?}", topology, stats);
            assert_eq!(stats.exchanges, 300);
        }
    }

    #[test]
    fn test_slow_hardware_pads_bursts() {
        for topology in [Topology::Combined, Topology::Split] {
            // One hardware block missing every ten render blocks.
            let stats = skewed_run(topology, 300, |round| usize::from(round % 10 != 9));
            assert!(stats.underrun_bursts >= 1, "{}: {:?}", topology, stats);
            assert_eq!(stats.overrun_bursts, 0, "{}: {:?}", topology, stats);
        }
    }

    /// Render for `duration` against paced simulated hardware on task threads.
    fn paced_run(topology: Topology, drift_ppm: f64, duration: Duration) -> StatsSnapshot {
        let mut config = simulated_config(topology);
        config.threading.read_timeout_ms = 20;
        config.device.drift_ppm = drift_ppm;
        let backend = SimulatedBackend::from_config(&config.device);
        let mut bridge =
            IoOrchestrator::start(&config, &backend, ThreadScheduler::new(StopSignal::new()))
                .unwrap();

        let blocks = (duration.as_secs_f64() * config.device.sample_rate as f64
            / config.device.block_size as f64) as u64;
        let rendered = PacedRender::new(&config).run(&mut bridge, &StopSignal::new(), Some(blocks));
        assert_eq!(rendered, blocks);
        bridge.shutdown()
    }

    #[test]
    fn test_paced_matched_clocks_never_compensate() {
        for topology in [Topology::Combined, Topology::Split] {
            let stats = paced_run(topology, 0.0, Duration::from_millis(1500));
            assert_eq!(stats.overrun_bursts, 0, "{}: {:?}", topology, stats);
            assert_eq!(stats.underrun_bursts, 0, "{}: {:?}", topology, stats);
            assert!(stats.hardware_cycles > 0);
        }
    }

    #[test]
    fn test_paced_fast_device_overruns() {
        for topology in [Topology::Combined, Topology::Split] {
            // +2% is about 1900 extra samples per second at 48 kHz stereo.
            let stats = paced_run(topology, 20_000.0, Duration::from_millis(2500));
            assert!(stats.overrun_bursts >= 1, "{}: {:?}", topology, stats);
            assert_eq!(stats.underrun_bursts, 0, "{}: {:?}", topology, stats);
        }
    }

    /// Simulated devices that count their stops. Capture-only opens fail.
    struct CaptureBusyBackend {
        inner: SimulatedBackend,
        opened: Arc<AtomicUsize>,
        stopped: Arc<AtomicUsize>,
    }

    struct CountedDevice {
        device: Box<dyn AudioDevice>,
        stopped: Arc<AtomicUsize>,
    }

    impl DeviceBackend for CaptureBusyBackend {
        fn open(&self, params: &DeviceParams) -> Result<Box<dyn AudioDevice>, DeviceError> {
            if params.playback.is_none() {
                return Err(DeviceError::Open {
                    device: params.describe(),
                    reason: "capture busy".to_string(),
                });
            }
            let device = self.inner.open(params)?;
            self.opened.fetch_add(1, Ordering::AcqRel);
            Ok(Box::new(CountedDevice {
                device,
                stopped: Arc::clone(&self.stopped),
            }))
        }
    }

    impl AudioDevice for CountedDevice {
        fn capture_channels(&self) -> usize {
            self.device.capture_channels()
        }

        fn playback_channels(&self) -> usize {
            self.device.playback_channels()
        }

        fn start(&mut self) -> Result<(), DeviceError> {
            self.device.start()
        }

        fn wait_for_block(&mut self) -> Result<usize, DeviceError> {
            self.device.wait_for_block()
        }

        fn begin_capture(&mut self, frames: usize) -> Result<(), DeviceError> {
            self.device.begin_capture(frames)
        }

        fn capture_channel(
            &mut self,
            channel: usize,
            dst: &mut [f32],
            frames: usize,
            stride: usize,
        ) {
            self.device.capture_channel(channel, dst, frames, stride)
        }

        fn end_capture(&mut self, frames: usize) {
            self.device.end_capture(frames)
        }

        fn begin_playback(&mut self, frames: usize) {
            self.device.begin_playback(frames)
        }

        fn play_channel(&mut self, channel: usize, src: &[f32], frames: usize, stride: usize) {
            self.device.play_channel(channel, src, frames, stride)
        }

        fn clear_channel(&mut self, channel: usize, frames: usize) {
            self.device.clear_channel(channel, frames)
        }

        fn end_playback(&mut self, frames: usize) -> Result<(), DeviceError> {
            self.device.end_playback(frames)
        }

        fn stop(&mut self) {
            self.stopped.fetch_add(1, Ordering::AcqRel);
            self.device.stop()
        }
    }

    #[test]
    fn test_split_input_failure_stops_output() {
        let opened = Arc::new(AtomicUsize::new(0));
        let stopped = Arc::new(AtomicUsize::new(0));
        let backend = CaptureBusyBackend {
            inner: SimulatedBackend::immediate(),
            opened: Arc::clone(&opened),
            stopped: Arc::clone(&stopped),
        };

        let err = IoOrchestrator::start(
            &simulated_config(Topology::Split),
            &backend,
            ManualScheduler::new(StopSignal::new()),
        )
        .err()
        .unwrap();
        assert!(matches!(err, BridgeError::Device(DeviceError::Open { .. })));
        assert_eq!(opened.load(Ordering::Acquire), 1);
        assert_eq!(stopped.load(Ordering::Acquire), 1);

        // The combined topology never opens capture alone.
        let bridge = IoOrchestrator::start(
            &simulated_config(Topology::Combined),
            &backend,
            ManualScheduler::new(StopSignal::new()),
        )
        .unwrap();
        assert_eq!(opened.load(Ordering::Acquire), 2);
        bridge.shutdown();
        assert_eq!(stopped.load(Ordering::Acquire), 2);
    }

    #[test]
    fn test_fatal_setup_errors() {
        let config = simulated_config(Topology::Combined);

        let failing = SimulatedBackend {
            fail_open: Some("no such card".to_string()),
            ..SimulatedBackend::immediate()
        };
        let err = IoOrchestrator::start(&config, &failing, ManualScheduler::new(StopSignal::new()))
            .err()
            .unwrap();
        assert!(matches!(err, BridgeError::Device(DeviceError::Open { .. })));

        let mono = SimulatedBackend {
            capture_channels: 1,
            ..SimulatedBackend::immediate()
        };
        let err = IoOrchestrator::start(&config, &mono, ManualScheduler::new(StopSignal::new()))
            .err()
            .unwrap();
        assert!(matches!(
            err,
            BridgeError::Device(DeviceError::ChannelCount {
                side: StreamSide::Capture,
                found: 1
            })
        ));

        let mut bad_name = config.clone();
        bad_name.channels.to_host = "UAC/ToHost".to_string();
        let err = IoOrchestrator::start(
            &bad_name,
            &SimulatedBackend::immediate(),
            ManualScheduler::new(StopSignal::new()),
        )
        .err()
        .unwrap();
        assert!(matches!(
            err,
            BridgeError::Channel(ChannelError::InvalidName(_))
        ));

        let mut invalid = config;
        invalid.buffers.ring_frames = 1000;
        let err = IoOrchestrator::start(
            &invalid,
            &SimulatedBackend::immediate(),
            ManualScheduler::new(StopSignal::new()),
        )
        .err()
        .unwrap();
        assert!(matches!(err, BridgeError::Config(_)));
    }
}
