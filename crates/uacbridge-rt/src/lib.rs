// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Real-time safe building blocks for uacbridge.
//!
//! # Real-Time Safety
//!
//! The audio thread has strict requirements:
//! - No memory allocation
//! - No locks on the hot path
//! - Bounded execution time
//!
//! [`RingBuffer`] is unsynchronized and owned by exactly one context.
//! [`DuplexChannel`] is the only structure shared across scheduling domains;
//! its endpoints hand data over through lock-free SPSC queues and only take a
//! lock when a blocking endpoint goes to sleep.

mod byte_queue;

pub mod atomic_params;
pub mod channel;
pub mod ringbuf;
pub mod stop;

pub use atomic_params::{AtomicF32, Counter, FillGauge};
pub use channel::{
    ChannelError, ChannelRegistry, DuplexChannel, Endpoint, HostEndpoint, NonRealTime, RealTime,
    RtEndpoint,
};
pub use ringbuf::RingBuffer;
pub use stop::StopSignal;
