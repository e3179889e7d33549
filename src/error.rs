// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Errors that stop the bridge from starting.

use crate::config::ConfigError;
use crate::device::DeviceError;
use crate::scheduler::SchedulerError;
use thiserror::Error;
use uacbridge_rt::ChannelError;

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("Audio device error: {0}")]
    Device(#[from] DeviceError),
    #[error("Channel setup failed: {0}")]
    Channel(#[from] ChannelError),
    #[error("Scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),
}
