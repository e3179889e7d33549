// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Fixed-capacity circular sample buffer.
//!
//! Used to stage audio between the render callback and the channels that
//! carry it across scheduling domains. Every transfer saturates: it moves as
//! many elements as fit (or are available) and reports the actual count, so a
//! short result is the caller's signal to handle the shortfall.
//!
//! # Example
//!
//! ```
//! use uacbridge_rt::RingBuffer;
//!
//! let mut ring = RingBuffer::<f32>::new(4);
//! assert_eq!(ring.write(&[1.0, 2.0, 3.0]), 3);
//!
//! let mut out = [0.0; 2];
//! assert_eq!(ring.read(&mut out), 2);
//! assert_eq!(out, [1.0, 2.0]);
//! assert_eq!(ring.available_to_read() + ring.available_to_write(), ring.capacity());
//! ```

use std::fmt;

/// A single-producer single-consumer circular buffer with no internal
/// synchronization.
///
/// Mutation requires `&mut self`, so the borrow checker enforces that a
/// writer and a reader never run concurrently on the same instance. Callers
/// that need cross-thread handoff use [`crate::DuplexChannel`] instead.
///
/// `read_pos == write_pos` is ambiguous between empty and full; the `full`
/// flag disambiguates it.
pub struct RingBuffer<T> {
    storage: Box<[T]>,
    read_pos: usize,
    write_pos: usize,
    full: bool,
}

impl<T: Copy + Default> RingBuffer<T> {
    /// Create a buffer holding exactly `capacity` elements.
    pub fn new(capacity: usize) -> Self {
        let mut ring = Self {
            storage: Box::default(),
            read_pos: 0,
            write_pos: 0,
            full: false,
        };
        ring.setup(capacity);
        ring
    }

    /// Reallocate to `capacity` elements and return to the empty state.
    ///
    /// Not real-time safe: allocates.
    pub fn setup(&mut self, capacity: usize) {
        self.storage = vec![T::default(); capacity].into_boxed_slice();
        self.reset();
    }
}

impl<T: Copy> RingBuffer<T> {
    /// Discard all content without touching the storage.
    pub fn reset(&mut self) {
        self.read_pos = 0;
        self.write_pos = 0;
        self.full = false;
    }

    /// Total number of elements the buffer can hold.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.storage.len()
    }

    /// Copy as much of `src` as fits. Returns the number of elements written.
    pub fn write(&mut self, src: &[T]) -> usize {
        let free = self.available_to_write();
        let count = src.len().min(free);
        if count == 0 {
            return 0;
        }

        let capacity = self.capacity();
        let first = count.min(capacity - self.write_pos);
        self.storage[self.write_pos..self.write_pos + first].copy_from_slice(&src[..first]);
        let second = count - first;
        if second > 0 {
            self.storage[..second].copy_from_slice(&src[first..count]);
        }

        self.write_pos = (self.write_pos + count) % capacity;
        if count == free {
            self.full = true;
        }
        count
    }

    /// Write `count` copies of `value`, saturating like [`write`](Self::write).
    pub fn fill(&mut self, value: T, count: usize) -> usize {
        let free = self.available_to_write();
        let count = count.min(free);
        if count == 0 {
            return 0;
        }

        let capacity = self.capacity();
        let first = count.min(capacity - self.write_pos);
        self.storage[self.write_pos..self.write_pos + first].fill(value);
        let second = count - first;
        if second > 0 {
            self.storage[..second].fill(value);
        }

        self.write_pos = (self.write_pos + count) % capacity;
        if count == free {
            self.full = true;
        }
        count
    }

    /// Copy up to `dst.len()` elements out. Returns the number of elements read.
    pub fn read(&mut self, dst: &mut [T]) -> usize {
        let count = dst.len().min(self.available_to_read());
        if count == 0 {
            return 0;
        }

        let capacity = self.capacity();
        let first = count.min(capacity - self.read_pos);
        dst[..first].copy_from_slice(&self.storage[self.read_pos..self.read_pos + first]);
        let second = count - first;
        if second > 0 {
            dst[first..count].copy_from_slice(&self.storage[..second]);
        }

        self.read_pos = (self.read_pos + count) % capacity;
        self.full = false;
        count
    }

    /// Drop up to `count` elements from the read side without copying them.
    pub fn skip(&mut self, count: usize) -> usize {
        let count = count.min(self.available_to_read());
        if count == 0 {
            return 0;
        }
        self.read_pos = (self.read_pos + count) % self.capacity();
        self.full = false;
        count
    }

    /// Number of elements that can be read right now.
    #[inline]
    pub fn available_to_read(&self) -> usize {
        let capacity = self.capacity();
        if self.full {
            capacity
        } else if capacity == 0 {
            0
        } else {
            (self.write_pos + capacity - self.read_pos) % capacity
        }
    }

    /// Number of elements that can be written right now.
    #[inline]
    pub fn available_to_write(&self) -> usize {
        self.capacity() - self.available_to_read()
    }

    /// Fill level as a fraction of capacity, in `[0, 1]`.
    #[inline]
    pub fn available(&self) -> f32 {
        match self.capacity() {
            0 => 0.0,
            capacity => self.available_to_read() as f32 / capacity as f32,
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.available_to_read() == 0
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.full
    }
}

impl<T> fmt::Debug for RingBuffer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RingBuffer")
            .field("capacity", &self.storage.len())
            .field("read_pos", &self.read_pos)
            .field("write_pos", &self.write_pos)
            .field("full", &self.full)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn assert_invariant<T: Copy>(ring: &RingBuffer<T>) {
        assert_eq!(
            ring.available_to_read() + ring.available_to_write(),
            ring.capacity()
        );
    }

    #[test]
    fn test_new_is_empty() {
        let ring = RingBuffer::<f32>::new(16);
        assert_eq!(ring.capacity(), 16);
        assert_eq!(ring.available_to_read(), 0);
        assert_eq!(ring.available_to_write(), 16);
        assert!(ring.is_empty());
        assert!(!ring.is_full());
        assert_eq!(ring.available(), 0.0);
    }

    #[test]
    fn test_fill_and_drain_full_capacity() {
        let capacity = 4096;
        let mut ring = RingBuffer::<f32>::new(capacity);
        let input = vec![0.25f32; capacity];

        assert_eq!(ring.write(&input), capacity);
        assert_eq!(ring.available_to_read(), capacity);
        assert_eq!(ring.available_to_write(), 0);
        assert!(ring.is_full());
        assert_eq!(ring.available(), 1.0);

        let mut output = vec![0.0f32; capacity];
        assert_eq!(ring.read(&mut output), capacity);
        assert_eq!(ring.available_to_read(), 0);
        assert_eq!(ring.available_to_write(), capacity);
        assert_eq!(output, input);
    }

    #[test]
    fn test_saturation() {
        let mut ring = RingBuffer::<i32>::new(8);
        assert_eq!(ring.write(&[1; 8]), 8);
        assert_eq!(ring.available_to_write(), 0);
        assert_eq!(ring.write(&[2]), 0);
        assert_eq!(ring.available_to_read(), 8);

        let mut empty = RingBuffer::<i32>::new(8);
        let mut out = [0; 4];
        assert_eq!(empty.read(&mut out), 0);
    }

    #[test]
    fn test_short_write_reports_count() {
        let mut ring = RingBuffer::<i32>::new(5);
        assert_eq!(ring.write(&[1, 2, 3]), 3);
        assert_eq!(ring.write(&[4, 5, 6, 7]), 2);
        assert!(ring.is_full());

        let mut out = [0; 5];
        assert_eq!(ring.read(&mut out), 5);
        assert_eq!(out, [1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_wraparound_preserves_order() {
        let mut ring = RingBuffer::<u16>::new(10);
        let mut scratch = [0u16; 7];

        // Move both cursors to 7 so the next transfer straddles the boundary.
        assert_eq!(ring.write(&[0; 7]), 7);
        assert_eq!(ring.read(&mut scratch), 7);

        let input: Vec<u16> = (100..108).collect();
        assert_eq!(ring.write(&input), 8);
        assert_invariant(&ring);

        let mut output = vec![0u16; 8];
        assert_eq!(ring.read(&mut output), 8);
        assert_eq!(output, input);
        assert!(ring.is_empty());
    }

    #[test]
    fn test_skip_and_fill() {
        let mut ring = RingBuffer::<i32>::new(6);
        ring.write(&[1, 2, 3, 4]);
        assert_eq!(ring.skip(3), 3);
        assert_eq!(ring.fill(9, 10), 5);
        assert!(ring.is_full());

        let mut out = [0; 6];
        assert_eq!(ring.read(&mut out), 6);
        assert_eq!(out, [4, 9, 9, 9, 9, 9]);
        assert_eq!(ring.skip(1), 0);
    }

    #[test]
    fn test_reset() {
        let mut ring = RingBuffer::<i32>::new(4);
        ring.write(&[1, 2, 3, 4]);
        ring.reset();
        assert!(ring.is_empty());
        assert_eq!(ring.available_to_write(), 4);
    }

    #[test]
    fn test_zero_capacity() {
        let mut ring = RingBuffer::<i32>::new(0);
        assert_eq!(ring.write(&[1]), 0);
        assert_eq!(ring.read(&mut [0]), 0);
        assert_eq!(ring.available(), 0.0);
        assert_invariant(&ring);
    }

    #[test]
    fn test_asymmetric_interleaving_reproduces_sequence() {
        let capacity = 4096;
        let mut ring = RingBuffer::<u32>::new(capacity);
        let mut next_in = 0u32;
        let mut next_out = 0u32;
        let mut written = 0usize;
        let mut read = 0usize;

        for phase in 0..2 {
            for n in 0..1000 {
                let odd = n & 1;
                let write_len = if odd == phase { 4 } else { 1 };
                let read_len = if odd != phase { 4 } else { 1 };

                let chunk: Vec<u32> = (next_in..next_in + write_len).collect();
                let count = ring.write(&chunk);
                assert_eq!(count, write_len as usize);
                next_in += write_len;
                written += count;
                assert_eq!(ring.available_to_read(), written - read);
                assert_invariant(&ring);

                let mut out = vec![0u32; read_len as usize];
                let count = ring.read(&mut out);
                for value in &out[..count] {
                    assert_eq!(*value, next_out);
                    next_out += 1;
                }
                read += count;
                assert_eq!(ring.available_to_read(), written - read);
                assert_invariant(&ring);
            }
        }

        // Whatever is left still comes out in order.
        let mut rest = vec![0u32; ring.available_to_read()];
        let count = ring.read(&mut rest);
        for value in &rest[..count] {
            assert_eq!(*value, next_out);
            next_out += 1;
        }
        assert_eq!(next_out, next_in);
    }

    #[derive(Debug, Clone)]
    enum Op {
        Write(usize),
        Read(usize),
        Skip(usize),
        Fill(usize),
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0usize..40).prop_map(Op::Write),
            (0usize..40).prop_map(Op::Read),
            (0usize..40).prop_map(Op::Skip),
            (0usize..40).prop_map(Op::Fill),
        ]
    }

    proptest! {
        #[test]
        fn prop_capacity_invariant_holds(
            capacity in 1usize..64,
            ops in proptest::collection::vec(op_strategy(), 0..200),
        ) {
            let mut ring = RingBuffer::<u8>::new(capacity);
            let mut occupancy = 0usize;
            for op in ops {
                match op {
                    Op::Write(n) => occupancy += ring.write(&vec![1u8; n]),
                    Op::Read(n) => occupancy -= ring.read(&mut vec![0u8; n]),
                    Op::Skip(n) => occupancy -= ring.skip(n),
                    Op::Fill(n) => occupancy += ring.fill(0, n),
                }
                prop_assert_eq!(ring.available_to_read(), occupancy);
                prop_assert_eq!(ring.available_to_read() + ring.available_to_write(), capacity);
                prop_assert!((0.0..=1.0).contains(&ring.available()));
            }
        }
    }
}
