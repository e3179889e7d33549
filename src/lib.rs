// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! uacbridge - elastic audio bridge between a real-time render callback and
//! a USB audio gadget.
//!
//! The render side calls [`IoOrchestrator::exchange`] once per block. Background
//! tasks move the same samples to and from the hardware, and the orchestrator
//! absorbs clock drift between the two by dropping or padding small bursts.

pub mod config;
pub mod device;
pub mod error;
pub mod io;
pub mod render;
pub mod scheduler;

pub use config::{BridgeConfig, ConfigManager, Topology};
pub use error::BridgeError;
pub use io::{ExchangeReport, IoOrchestrator};
pub use scheduler::{ManualScheduler, Scheduler, ThreadScheduler};
pub use uacbridge_rt as rt;
