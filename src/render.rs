// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Wall-clock paced render loop.
//!
//! Stands in for the host's render callback: one [`IoOrchestrator::exchange`]
//! per block, at the nominal sample rate of the configuration.

use crate::config::BridgeConfig;
use crate::io::IoOrchestrator;
use crate::scheduler::Scheduler;
use std::f32::consts::TAU;
use std::thread;
use std::time::{Duration, Instant};
use uacbridge_rt::StopSignal;

/// Frequency of the generated tone.
pub const TONE_HZ: f32 = 300.0;

/// Interleaved stereo tone: sine on the left, cosine on the right.
#[derive(Debug, Clone)]
pub struct TestTone {
    phase: f32,
    step: f32,
}

impl TestTone {
    pub fn new(frequency: f32, sample_rate: u32) -> Self {
        Self {
            phase: 0.0,
            step: TAU * frequency / sample_rate.max(1) as f32,
        }
    }

    pub fn render(&mut self, out: &mut [f32]) {
        for frame in out.chunks_exact_mut(2) {
            frame[0] = self.phase.sin() * 0.25;
            frame[1] = self.phase.cos() * 0.25;
            self.phase = (self.phase + self.step) % TAU;
        }
    }
}

/// Calls `exchange` once per block, paced by the system clock.
pub struct PacedRender {
    period: Duration,
    tone: TestTone,
    outgoing: Box<[f32]>,
    incoming: Box<[f32]>,
}

impl PacedRender {
    pub fn new(config: &BridgeConfig) -> Self {
        let rate = config.device.sample_rate.max(1);
        let block_samples = config.block_samples();
        Self {
            period: Duration::from_secs_f64(config.device.block_size as f64 / rate as f64),
            tone: TestTone::new(TONE_HZ, rate),
            outgoing: vec![0.0; block_samples].into_boxed_slice(),
            incoming: vec![0.0; block_samples].into_boxed_slice(),
        }
    }

    /// Render until `stop` is raised or `limit` blocks have been exchanged.
    /// Returns the number of blocks exchanged.
    ///
    /// A late block is caught up on the next iterations rather than skipped,
    /// so the long-term rate stays at the nominal sample rate.
    pub fn run<S: Scheduler>(
        &mut self,
        bridge: &mut IoOrchestrator<S>,
        stop: &StopSignal,
        limit: Option<u64>,
    ) -> u64 {
        let mut blocks = 0;
        let mut deadline = Instant::now();
        while !stop.is_raised() && limit.map_or(true, |limit| blocks < limit) {
            self.tone.render(&mut self.outgoing);
            bridge.exchange(&self.outgoing, &mut self.incoming);
            blocks += 1;

            deadline += self.period;
            let now = Instant::now();
            if deadline > now {
                thread::sleep(deadline - now);
            }
        }
        blocks
    }
}
