//! Lock-free ring buffer between a packet consumer and an audio device.
//!
//! One thread pushes interleaved samples taken from `packet` events, the
//! device callback pops them. Neither side allocates or locks.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// How long a blocked [`SampleRing::push`] sleeps between attempts.
const PUSH_RETRY: Duration = Duration::from_millis(2);

/// Single-producer, single-consumer ring of `f32` samples.
pub struct SampleRing {
    slots: Box<[UnsafeCell<f32>]>,
    read_pos: AtomicUsize,
    write_pos: AtomicUsize,
    /// Power of two.
    capacity: usize,
    mask: usize,
}

impl SampleRing {
    /// The capacity is rounded up to the next power of two.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(2).next_power_of_two();
        Self {
            slots: (0..capacity).map(|_| UnsafeCell::new(0.0)).collect(),
            read_pos: AtomicUsize::new(0),
            write_pos: AtomicUsize::new(0),
            capacity,
            mask: capacity - 1,
        }
    }

    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Samples waiting to be read.
    pub fn available(&self) -> usize {
        let write = self.write_pos.load(Ordering::Acquire);
        let read = self.read_pos.load(Ordering::Acquire);
        write.wrapping_sub(read)
    }

    pub fn free(&self) -> usize {
        self.capacity - self.available()
    }

    pub fn is_empty(&self) -> bool {
        self.available() == 0
    }

    /// Write as many samples as fit. Producer side only.
    pub fn write(&self, samples: &[f32]) -> usize {
        let write_pos = self.write_pos.load(Ordering::Relaxed);
        let read_pos = self.read_pos.load(Ordering::Acquire);

        let space = self.capacity - write_pos.wrapping_sub(read_pos);
        let count = samples.len().min(space);
        if count == 0 {
            return 0;
        }

        let start = write_pos & self.mask;
        let first = count.min(self.capacity - start);
        self.copy_in(start, &samples[..first]);
        self.copy_in(0, &samples[first..count]);

        self.write_pos
            .store(write_pos.wrapping_add(count), Ordering::Release);
        count
    }

    /// Write all of `samples`, waiting for room while the reader drains.
    ///
    /// Gives up once `stop` is set and returns how much was written.
    pub fn push(&self, samples: &[f32], stop: &AtomicBool) -> usize {
        let mut written = 0;
        while written < samples.len() {
            if stop.load(Ordering::Acquire) {
                break;
            }
            let n = self.write(&samples[written..]);
            written += n;
            if n == 0 {
                thread::sleep(PUSH_RETRY);
            }
        }
        written
    }

    /// Read up to `output.len()` samples. Consumer side only.
    pub fn read(&self, output: &mut [f32]) -> usize {
        let read_pos = self.read_pos.load(Ordering::Relaxed);
        let write_pos = self.write_pos.load(Ordering::Acquire);

        let count = output.len().min(write_pos.wrapping_sub(read_pos));
        if count == 0 {
            return 0;
        }

        let start = read_pos & self.mask;
        let first = count.min(self.capacity - start);
        let (head, tail) = output[..count].split_at_mut(first);
        self.copy_out(start, head);
        self.copy_out(0, tail);

        self.read_pos
            .store(read_pos.wrapping_add(count), Ordering::Release);
        count
    }

    /// Fill `output` completely, padding with silence on underrun.
    /// Returns the number of real samples.
    pub fn pop_or_silence(&self, output: &mut [f32]) -> usize {
        let read = self.read(output);
        output[read..].fill(0.0);
        read
    }

    /// Drop everything not yet read. Consumer side only.
    pub fn clear(&self) {
        let write_pos = self.write_pos.load(Ordering::Acquire);
        self.read_pos.store(write_pos, Ordering::Release);
    }

    fn slot_ptr(&self, index: usize) -> *mut f32 {
        UnsafeCell::raw_get(self.slots.as_ptr().wrapping_add(index))
    }

    fn copy_in(&self, start: usize, samples: &[f32]) {
        if samples.is_empty() {
            return;
        }
        debug_assert!(start + samples.len() <= self.capacity);
        // SAFETY: only the single producer writes, and only to slots the
        // reader does not touch until write_pos is published. UnsafeCell<f32>
        // has the layout of f32, so the run of slots is a run of f32s.
        #[allow(unsafe_code)]
        unsafe {
            std::ptr::copy_nonoverlapping(samples.as_ptr(), self.slot_ptr(start), samples.len());
        }
    }

    fn copy_out(&self, start: usize, output: &mut [f32]) {
        if output.is_empty() {
            return;
        }
        debug_assert!(start + output.len() <= self.capacity);
        // SAFETY: only the single consumer reads, and only slots published by
        // the producer's release store of write_pos.
        #[allow(unsafe_code)]
        unsafe {
            std::ptr::copy_nonoverlapping(self.slot_ptr(start), output.as_mut_ptr(), output.len());
        }
    }
}

// SAFETY: producer and consumer touch disjoint slot ranges, coordinated by
// the acquire/release positions.
#[allow(unsafe_code)]
unsafe impl Sync for SampleRing {}

pub type SharedSampleRing = Arc<SampleRing>;

pub fn shared_sample_ring(capacity: usize) -> SharedSampleRing {
    Arc::new(SampleRing::new(capacity))
}
