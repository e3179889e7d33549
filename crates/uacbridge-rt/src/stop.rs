// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Cooperative cancellation token.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Shared stop request, observed cooperatively.
///
/// Background tasks poll it between hardware waits and blocking channel
/// operations poll it while they wait. Raising it never interrupts anything
/// mid-transfer.
#[derive(Debug, Clone, Default)]
pub struct StopSignal {
    raised: Arc<AtomicBool>,
}

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request a stop. Idempotent.
    pub fn raise(&self) {
        self.raised.store(true, Ordering::Release);
    }

    #[inline]
    pub fn is_raised(&self) -> bool {
        self.raised.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clones_share_state() {
        let stop = StopSignal::new();
        let observer = stop.clone();
        assert!(!observer.is_raised());
        stop.raise();
        stop.raise();
        assert!(observer.is_raised());
    }
}
