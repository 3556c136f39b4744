//! Lock-free double-buffer handoff between engine producers and the mixer
//!
//! Each engine owns one `DoubleBuffer`: a ping-pong pair of stereo blocks
//! where the atomic `ready` flag on each half is the only cross-thread
//! synchronization. The producer fills the half its write index points at,
//! publishes it, and flips; the audio callback consumes the half its read
//! index points at, releases it, and flips. The half a producer is writing
//! is never visible to the consumer and vice versa.

use parking_lot::{Condvar, Mutex};
use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

/// One audio block with separate left/right channels.
///
/// The channels are always distinct allocations; there is deliberately no
/// mono constructor, so per-channel content (warm/cold split, per-harmonic
/// panning) cannot be silently collapsed on the way to the driver.
pub struct StereoBlock {
    pub left: Box<[f32]>,
    pub right: Box<[f32]>,
}

impl StereoBlock {
    pub fn new(frames: usize) -> Self {
        Self {
            left: vec![0.0; frames].into_boxed_slice(),
            right: vec![0.0; frames].into_boxed_slice(),
        }
    }

    pub fn frames(&self) -> usize {
        self.left.len()
    }

    /// Zero both channels
    pub fn clear(&mut self) {
        self.left.fill(0.0);
        self.right.fill(0.0);
    }
}

struct Half {
    ready: AtomicBool,
    /// Monotonic block counter stamped at publish time
    stamp: AtomicU64,
    block: UnsafeCell<StereoBlock>,
}

// Safety: the `ready` protocol partitions access to `block`. While
// `ready == false` the half belongs exclusively to the producer; the
// Release store of `true` publishes the written samples, and the consumer's
// Acquire load pairs with it before reading. The consumer's Release store of
// `false` hands the half back. Producer only flips false -> true, consumer
// only true -> false, so the two sides never hold the same half.
unsafe impl Sync for Half {}
unsafe impl Send for Half {}

/// Ping-pong pair of stereo blocks with an atomic `ready` flag per half.
///
/// Single producer, single consumer. The consumer side (`consume`) is
/// wait-free and never blocks; the producer may park on `wait_writable`
/// with a bounded timeout so shutdown always makes progress.
pub struct DoubleBuffer {
    halves: [Half; 2],
    /// Next half the producer will fill; owned by the producer thread
    write_index: AtomicUsize,
    /// Next half the consumer will read; owned by the consumer thread
    read_index: AtomicUsize,
    frames: usize,
    blocks_produced: AtomicU64,
    gate: Mutex<()>,
    gate_cv: Condvar,
}

impl DoubleBuffer {
    pub fn new(frames: usize) -> Self {
        let half = |_| Half {
            ready: AtomicBool::new(false),
            stamp: AtomicU64::new(0),
            block: UnsafeCell::new(StereoBlock::new(frames)),
        };
        Self {
            halves: [half(0), half(1)],
            write_index: AtomicUsize::new(0),
            read_index: AtomicUsize::new(0),
            frames,
            blocks_produced: AtomicU64::new(0),
            gate: Mutex::new(()),
            gate_cv: Condvar::new(),
        }
    }

    pub fn frames(&self) -> usize {
        self.frames
    }

    /// Total blocks published so far
    pub fn blocks_produced(&self) -> u64 {
        self.blocks_produced.load(Ordering::Relaxed)
    }

    /// True if the current write half is free for the producer
    pub fn writable(&self) -> bool {
        let w = self.write_index.load(Ordering::Relaxed);
        !self.halves[w].ready.load(Ordering::Acquire)
    }

    /// Producer: park until the current write half is free or the timeout
    /// elapses. Returns whether the half is writable.
    pub fn wait_writable(&self, timeout: Duration) -> bool {
        if self.writable() {
            return true;
        }
        let mut guard = self.gate.lock();
        // Recheck under the lock: the consumer may have flipped between the
        // first check and acquiring the gate.
        if self.writable() {
            return true;
        }
        let _ = self.gate_cv.wait_for(&mut guard, timeout);
        self.writable()
    }

    /// Producer: fill and publish the current write half.
    ///
    /// Returns false without calling `fill` when the consumer has not yet
    /// released the half.
    pub fn produce<F: FnOnce(&mut StereoBlock)>(&self, fill: F) -> bool {
        let w = self.write_index.load(Ordering::Relaxed);
        let half = &self.halves[w];
        if half.ready.load(Ordering::Acquire) {
            return false;
        }
        // Safety: ready == false, so this half is producer-owned (see Half).
        let block = unsafe { &mut *half.block.get() };
        fill(block);
        let stamp = self.blocks_produced.fetch_add(1, Ordering::Relaxed) + 1;
        half.stamp.store(stamp, Ordering::Relaxed);
        half.ready.store(true, Ordering::Release);
        self.write_index.store(w ^ 1, Ordering::Relaxed);
        true
    }

    /// Consumer (RT): read the current read half if it is ready, release it
    /// and wake the producer. Returns false (without touching the output)
    /// when no block is ready; the caller substitutes silence.
    pub fn consume<F: FnOnce(&StereoBlock)>(&self, read: F) -> bool {
        let r = self.read_index.load(Ordering::Relaxed);
        let half = &self.halves[r];
        if !half.ready.load(Ordering::Acquire) {
            return false;
        }
        // Safety: ready == true, so this half is consumer-owned (see Half).
        let block = unsafe { &*half.block.get() };
        read(block);
        half.ready.store(false, Ordering::Release);
        self.read_index.store(r ^ 1, Ordering::Relaxed);
        // notify without taking the gate; parking_lot permits this and the
        // RT thread must not acquire locks.
        self.gate_cv.notify_all();
        true
    }
}
