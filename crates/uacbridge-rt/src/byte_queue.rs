// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Lock-free single-producer single-consumer queue of framed byte messages.
//!
//! Each message is stored as a 4-byte little-endian length followed by the
//! payload. A push either stores the whole message or nothing, so the consumer
//! never observes a torn write. The consumer may take a message in several
//! pieces; the unread remainder stays at the front of the queue.

use parking_lot::{Condvar, Mutex};
use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Size of the per-message length prefix.
pub(crate) const HEADER_LEN: usize = 4;

/// Why a push did not store the message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PushError {
    /// Not enough free space right now.
    Full,
    /// The message can never fit, even in an empty queue.
    TooLarge,
    /// The consumer is gone.
    Disconnected,
}

/// Wakeup point for a blocked peer.
///
/// Notifiers never take the lock, so a wakeup can race a waiter that is about
/// to sleep. Waiters therefore always sleep with a bounded timeout and re-check
/// their condition.
#[derive(Default)]
struct Signal {
    lock: Mutex<()>,
    cond: Condvar,
}

impl Signal {
    fn notify(&self) {
        self.cond.notify_all();
    }

    fn wait(&self, timeout: Duration) {
        let mut guard = self.lock.lock();
        self.cond.wait_for(&mut guard, timeout);
    }
}

pub(crate) struct ByteQueue {
    storage: Box<[UnsafeCell<u8>]>,
    mask: usize,
    /// Consumer position (only modified by the consumer).
    head: AtomicUsize,
    /// Producer position (only modified by the producer).
    tail: AtomicUsize,
    producer_closed: AtomicBool,
    consumer_closed: AtomicBool,
    readable: Signal,
    writable: Signal,
}

// SAFETY: SPSC access only. The producer writes bytes in [tail, tail + n)
// before publishing them with a Release store of `tail`; the consumer reads
// bytes in [head, tail) after an Acquire load of `tail`, and frees them with a
// Release store of `head` that the producer Acquire-loads before reuse.
unsafe impl Send for ByteQueue {}
unsafe impl Sync for ByteQueue {}

impl ByteQueue {
    /// Create a queue able to hold at least `capacity` bytes, framing included.
    ///
    /// The capacity is rounded up to the next power of two.
    pub(crate) fn new(capacity: usize) -> Arc<Self> {
        let capacity = capacity.next_power_of_two();
        let storage = (0..capacity)
            .map(|_| UnsafeCell::new(0u8))
            .collect::<Vec<_>>()
            .into_boxed_slice();

        Arc::new(Self {
            storage,
            mask: capacity - 1,
            head: AtomicUsize::new(0),
            tail: AtomicUsize::new(0),
            producer_closed: AtomicBool::new(false),
            consumer_closed: AtomicBool::new(false),
            readable: Signal::default(),
            writable: Signal::default(),
        })
    }

    #[inline]
    pub(crate) fn capacity(&self) -> usize {
        self.storage.len()
    }

    /// Bytes currently stored, framing included.
    #[inline]
    pub(crate) fn used(&self) -> usize {
        let tail = self.tail.load(Ordering::Acquire);
        let head = self.head.load(Ordering::Acquire);
        tail.wrapping_sub(head)
    }

    #[inline]
    fn base(&self) -> *mut u8 {
        // UnsafeCell<u8> has the same layout as u8.
        self.storage.as_ptr() as *mut u8
    }

    /// Copy `src` into the ring starting at logical position `pos`.
    ///
    /// # Safety
    /// Caller must be the single producer and own `[pos, pos + src.len())`.
    unsafe fn copy_in(&self, pos: usize, src: &[u8]) {
        let start = pos & self.mask;
        let first = src.len().min(self.capacity() - start);
        std::ptr::copy_nonoverlapping(src.as_ptr(), self.base().add(start), first);
        std::ptr::copy_nonoverlapping(src.as_ptr().add(first), self.base(), src.len() - first);
    }

    /// Copy bytes at logical position `pos` out into `dst`.
    ///
    /// # Safety
    /// Caller must be the single consumer and `[pos, pos + dst.len())` must be
    /// published by the producer.
    unsafe fn copy_out(&self, pos: usize, dst: &mut [u8]) {
        let start = pos & self.mask;
        let first = dst.len().min(self.capacity() - start);
        std::ptr::copy_nonoverlapping(self.base().add(start), dst.as_mut_ptr(), first);
        std::ptr::copy_nonoverlapping(self.base(), dst.as_mut_ptr().add(first), dst.len() - first);
    }

    pub(crate) fn close_producer(&self) {
        self.producer_closed.store(true, Ordering::Release);
        self.readable.notify();
    }

    pub(crate) fn close_consumer(&self) {
        self.consumer_closed.store(true, Ordering::Release);
        self.writable.notify();
    }

    #[inline]
    pub(crate) fn is_producer_closed(&self) -> bool {
        self.producer_closed.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn is_consumer_closed(&self) -> bool {
        self.consumer_closed.load(Ordering::Acquire)
    }

    pub(crate) fn wait_readable(&self, timeout: Duration) {
        self.readable.wait(timeout);
    }

    pub(crate) fn wait_writable(&self, timeout: Duration) {
        self.writable.wait(timeout);
    }
}

/// Producer half. Exactly one exists per queue.
pub(crate) struct Producer {
    queue: Arc<ByteQueue>,
}

impl Producer {
    pub(crate) fn new(queue: Arc<ByteQueue>) -> Self {
        Self { queue }
    }

    pub(crate) fn queue(&self) -> &ByteQueue {
        &self.queue
    }

    /// Store `payload` as one message, or nothing at all.
    pub(crate) fn push(&mut self, payload: &[u8]) -> Result<(), PushError> {
        let queue = &*self.queue;
        if queue.is_consumer_closed() {
            return Err(PushError::Disconnected);
        }

        let needed = HEADER_LEN + payload.len();
        if needed > queue.capacity() || payload.len() > u32::MAX as usize {
            return Err(PushError::TooLarge);
        }

        let tail = queue.tail.load(Ordering::Relaxed);
        let head = queue.head.load(Ordering::Acquire);
        let free = queue.capacity() - tail.wrapping_sub(head);
        if free < needed {
            return Err(PushError::Full);
        }

        let header = (payload.len() as u32).to_le_bytes();
        // SAFETY: single producer; `needed` bytes from `tail` are free.
        unsafe {
            queue.copy_in(tail, &header);
            queue.copy_in(tail.wrapping_add(HEADER_LEN), payload);
        }
        queue.tail.store(tail.wrapping_add(needed), Ordering::Release);
        queue.readable.notify();
        Ok(())
    }
}

impl Drop for Producer {
    fn drop(&mut self) {
        self.queue.close_producer();
    }
}

/// Consumer half. Exactly one exists per queue.
pub(crate) struct Consumer {
    queue: Arc<ByteQueue>,
    /// Unread payload bytes left in the message at the front of the queue.
    pending: usize,
}

impl Consumer {
    pub(crate) fn new(queue: Arc<ByteQueue>) -> Self {
        Self { queue, pending: 0 }
    }

    pub(crate) fn queue(&self) -> &ByteQueue {
        &self.queue
    }

    /// True when nothing is left to read.
    pub(crate) fn is_drained(&self) -> bool {
        self.pending == 0 && self.queue.used() == 0
    }

    /// Copy bytes from the front message into `dst`.
    ///
    /// Never crosses a message boundary, so a message that fits in `dst` is
    /// returned whole in a single call. Returns 0 when the queue is empty.
    pub(crate) fn pop_into(&mut self, dst: &mut [u8]) -> usize {
        if dst.is_empty() {
            return 0;
        }

        let queue = &*self.queue;
        let head = queue.head.load(Ordering::Relaxed);
        let tail = queue.tail.load(Ordering::Acquire);
        let mut pos = head;

        if self.pending == 0 {
            if tail.wrapping_sub(head) < HEADER_LEN {
                return 0;
            }
            let mut header = [0u8; HEADER_LEN];
            // SAFETY: single consumer; the header was published with the message.
            unsafe { queue.copy_out(pos, &mut header) };
            pos = pos.wrapping_add(HEADER_LEN);
            self.pending = u32::from_le_bytes(header) as usize;
        }

        let count = self.pending.min(dst.len());
        // SAFETY: the whole payload was published together with its header.
        unsafe { queue.copy_out(pos, &mut dst[..count]) };
        pos = pos.wrapping_add(count);
        self.pending -= count;

        queue.head.store(pos, Ordering::Release);
        queue.writable.notify();
        count
    }
}

impl Drop for Consumer {
    fn drop(&mut self) {
        self.queue.close_consumer();
    }
}
