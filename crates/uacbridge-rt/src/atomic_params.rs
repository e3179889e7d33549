// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Atomic cells for lock-free telemetry between scheduling domains.
//!
//! The real-time side publishes fill levels and soft-error counts; any other
//! thread can sample them without locking.
//!
//! # Usage
//!
//! ```
//! use uacbridge_rt::{AtomicF32, FillGauge};
//!
//! let level = AtomicF32::new(0.5);
//! level.set(0.25);
//! assert_eq!(level.get(), 0.25);
//!
//! let gauge = FillGauge::default();
//! gauge.publish(0.5, 2048);
//! assert_eq!(gauge.load(), (0.5, 2048));
//! ```

use std::sync::atomic::{AtomicU32 as StdAtomicU32, AtomicU64, Ordering};

/// Atomic f32 stored as its bit pattern.
///
/// Uses `Relaxed` ordering: each value is independent telemetry.
#[derive(Debug)]
pub struct AtomicF32 {
    bits: StdAtomicU32,
}

impl AtomicF32 {
    #[inline]
    pub const fn new(value: f32) -> Self {
        Self {
            bits: StdAtomicU32::new(value.to_bits()),
        }
    }

    #[inline]
    pub fn get(&self) -> f32 {
        f32::from_bits(self.bits.load(Ordering::Relaxed))
    }

    #[inline]
    pub fn set(&self, value: f32) {
        self.bits.store(value.to_bits(), Ordering::Relaxed);
    }
}

impl Default for AtomicF32 {
    fn default() -> Self {
        Self::new(0.0)
    }
}

/// Monotonic event counter.
#[derive(Debug, Default)]
pub struct Counter {
    inner: AtomicU64,
}

impl Counter {
    #[inline]
    pub const fn new() -> Self {
        Self {
            inner: AtomicU64::new(0),
        }
    }

    /// Increment and return the new value.
    #[inline]
    pub fn increment(&self) -> u64 {
        self.inner.fetch_add(1, Ordering::Relaxed).wrapping_add(1)
    }

    #[inline]
    pub fn get(&self) -> u64 {
        self.inner.load(Ordering::Relaxed)
    }
}

/// Last published fill level of a buffer: fraction and element count.
///
/// The two fields are published independently, so a reader may briefly pair a
/// fraction with the neighbouring count. Good enough for telemetry.
#[derive(Debug, Default)]
pub struct FillGauge {
    fraction: AtomicF32,
    count: StdAtomicU32,
}

impl FillGauge {
    #[inline]
    pub fn publish(&self, fraction: f32, count: usize) {
        self.fraction.set(fraction);
        self.count
            .store(count.min(u32::MAX as usize) as u32, Ordering::Relaxed);
    }

    #[inline]
    pub fn load(&self) -> (f32, usize) {
        (
            self.fraction.get(),
            self.count.load(Ordering::Relaxed) as usize,
        )
    }
}
