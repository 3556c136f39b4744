//! Persistent worker pool for the additive partial bank
//!
//! The bank is split into contiguous ranges at init, one per worker; no
//! partial is ever touched by two workers. Each block the conductor (the
//! additive producer thread) writes the shared job, releases the workers
//! through the start barrier, waits on the done barrier, then merges the
//! workers' private scratch buffers into the output block. The barrier pair
//! is the only synchronization; workers take no locks and never allocate
//! after startup.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Barrier};
use std::thread::{self, JoinHandle};

use super::partials::{render_partials, Partial, PartialTarget};
use crate::audio::synth::wavetable::Wavetable;

/// Interior-mutable cell whose cross-thread access is sequenced entirely by
/// the pool's barriers.
///
/// Ownership protocol: between `done.wait()` and the next `start.wait()` the
/// conductor has exclusive access to the job and read access to every
/// scratch; between `start.wait()` and `done.wait()` each worker has
/// exclusive access to its own slot and shared read access to the job.
struct SyncCell<T>(UnsafeCell<T>);

unsafe impl<T: Send> Sync for SyncCell<T> {}

impl<T> SyncCell<T> {
    fn new(value: T) -> Self {
        Self(UnsafeCell::new(value))
    }

    #[allow(clippy::mut_from_ref)]
    unsafe fn get(&self) -> &mut T {
        &mut *self.0.get()
    }
}

struct Job {
    targets: Vec<PartialTarget>,
    frames: usize,
}

struct WorkerSlot {
    partials: SyncCell<Vec<Partial>>,
    scratch_left: SyncCell<Vec<f32>>,
    scratch_right: SyncCell<Vec<f32>>,
}

struct PoolShared {
    start: Barrier,
    done: Barrier,
    job: SyncCell<Job>,
    stop: AtomicBool,
    slots: Vec<WorkerSlot>,
    table: Arc<Wavetable>,
}

/// Worker pool owning the partial bank
pub struct WorkerPool {
    shared: Arc<PoolShared>,
    handles: Vec<JoinHandle<()>>,
    num_partials: usize,
}

impl WorkerPool {
    /// Split `partials` across `num_workers` persistent threads. `max_frames`
    /// sizes the per-worker scratch buffers; blocks may be shorter but never
    /// longer.
    pub fn new(
        partials: Vec<Partial>,
        num_workers: usize,
        table: Arc<Wavetable>,
        max_frames: usize,
    ) -> Result<Self, String> {
        let num_partials = partials.len();
        let num_workers = num_workers.clamp(1, num_partials.max(1));
        let chunk = num_partials.div_ceil(num_workers);

        let mut remaining = partials;
        let mut slots = Vec::with_capacity(num_workers);
        for _ in 0..num_workers {
            let take = chunk.min(remaining.len());
            let rest = remaining.split_off(take);
            slots.push(WorkerSlot {
                partials: SyncCell::new(remaining),
                scratch_left: SyncCell::new(vec![0.0; max_frames]),
                scratch_right: SyncCell::new(vec![0.0; max_frames]),
            });
            remaining = rest;
        }

        let shared = Arc::new(PoolShared {
            start: Barrier::new(num_workers + 1),
            done: Barrier::new(num_workers + 1),
            job: SyncCell::new(Job {
                targets: vec![PartialTarget::SILENT; num_partials],
                frames: 0,
            }),
            stop: AtomicBool::new(false),
            slots,
            table,
        });

        let mut handles = Vec::with_capacity(num_workers);
        for index in 0..num_workers {
            let shared = Arc::clone(&shared);
            let handle = thread::Builder::new()
                .name(format!("additive-worker-{}", index))
                .spawn(move || worker_loop(shared, index))
                .map_err(|e| format!("Failed to spawn additive worker {}: {}", index, e))?;
            handles.push(handle);
        }

        log::info!(
            "Additive worker pool: {} workers, {} partials, chunk {}",
            num_workers,
            num_partials,
            chunk
        );

        Ok(Self {
            shared,
            handles,
            num_partials,
        })
    }

    pub fn num_partials(&self) -> usize {
        self.num_partials
    }

    /// Update the shared per-partial targets. Conductor only, between
    /// renders; `&mut self` enforces that on the Rust side.
    pub fn set_targets_with<F: FnOnce(&mut Vec<PartialTarget>)>(&mut self, fill: F) {
        // Safety: outside a render cycle the job is conductor-owned.
        let job = unsafe { self.shared.job.get() };
        fill(&mut job.targets);
    }

    /// Run one block across the workers and accumulate the merged result
    /// into `left`/`right` (which are not cleared here).
    pub fn render(&mut self, frames: usize, left: &mut [f32], right: &mut [f32]) {
        // Safety: conductor-owned outside the barrier window.
        let frames = {
            let job = unsafe { self.shared.job.get() };
            let scratch_len = unsafe { self.shared.slots[0].scratch_left.get() }.len();
            job.frames = frames.min(scratch_len).min(left.len()).min(right.len());
            job.frames
        };

        self.shared.start.wait();
        // Workers render their ranges into private scratch here.
        self.shared.done.wait();

        for slot in &self.shared.slots {
            // Safety: after done.wait() the workers are parked at the next
            // start barrier; scratches are conductor-readable.
            let scratch_left = unsafe { slot.scratch_left.get() };
            let scratch_right = unsafe { slot.scratch_right.get() };
            for i in 0..frames {
                left[i] += scratch_left[i];
                right[i] += scratch_right[i];
            }
        }
    }

    /// Stop and join every worker
    pub fn shutdown(&mut self) {
        if self.handles.is_empty() {
            return;
        }
        self.shared.stop.store(true, Ordering::SeqCst);
        // Release workers parked at the start barrier so they observe stop.
        self.shared.start.wait();
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
        log::info!("Additive worker pool stopped");
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(shared: Arc<PoolShared>, index: usize) {
    loop {
        shared.start.wait();
        if shared.stop.load(Ordering::SeqCst) {
            break;
        }

        // Safety: between start and done this worker exclusively owns its
        // slot, and the job is read-only for everyone.
        let job = unsafe { &*shared.job.0.get() };
        let slot = &shared.slots[index];
        let partials = unsafe { slot.partials.get() };
        let left = unsafe { slot.scratch_left.get() };
        let right = unsafe { slot.scratch_right.get() };

        let frames = job.frames;
        left[..frames].fill(0.0);
        right[..frames].fill(0.0);
        render_partials(
            partials,
            &job.targets,
            &shared.table,
            &mut left[..frames],
            &mut right[..frames],
        );

        shared.done.wait();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::synth::additive::partials::{build_bank, V_MAX};
    use crate::audio::synth::wavetable::Waveform;
    use crate::config::SynthConfig;

    fn test_config() -> SynthConfig {
        let mut config = SynthConfig::default();
        config.num_partials = 48;
        config
    }

    fn uniform_targets(n: usize, volume: f32) -> Vec<PartialTarget> {
        vec![
            PartialTarget {
                volume,
                ..PartialTarget::SILENT
            };
            n
        ]
    }

    #[test]
    fn test_partition_covers_bank_exactly_once() {
        let config = test_config();
        let bank = build_bank(&config);
        let table = Arc::new(Wavetable::new(Waveform::Sine));
        let pool = WorkerPool::new(bank, 3, table, 512).unwrap();

        let mut seen = vec![0u32; config.num_partials];
        for slot in &pool.shared.slots {
            let partials = unsafe { slot.partials.get() };
            for p in partials.iter() {
                seen[p.note_index] += 1;
            }
        }
        assert!(seen.iter().all(|&count| count == 1));
    }

    #[test]
    fn test_pool_matches_single_threaded_render() {
        let config = test_config();
        let table = Arc::new(Wavetable::new(Waveform::Sine));
        let frames = 256;
        let targets = uniform_targets(config.num_partials, V_MAX / 2.0);

        // Reference: the whole bank rendered on one thread
        let mut reference_bank = build_bank(&config);
        let mut ref_left = vec![0.0; frames];
        let mut ref_right = vec![0.0; frames];
        render_partials(
            &mut reference_bank,
            &targets,
            &table,
            &mut ref_left,
            &mut ref_right,
        );

        // Pool with 3 workers over an identical bank
        let mut pool =
            WorkerPool::new(build_bank(&config), 3, Arc::clone(&table), frames).unwrap();
        pool.set_targets_with(|t| t.copy_from_slice(&targets));
        let mut left = vec![0.0; frames];
        let mut right = vec![0.0; frames];
        pool.render(frames, &mut left, &mut right);

        // Summation order differs between the merged scratches and the
        // sequential reference, so allow float reassociation error.
        let tol = 1.0;
        for i in 0..frames {
            assert!(
                (left[i] - ref_left[i]).abs() < tol,
                "left[{}]: {} vs {}",
                i,
                left[i],
                ref_left[i]
            );
            assert!((right[i] - ref_right[i]).abs() < tol);
        }
    }

    #[test]
    fn test_render_produces_audio_after_slew_in() {
        let config = test_config();
        let table = Arc::new(Wavetable::new(Waveform::Sine));
        let mut pool = WorkerPool::new(build_bank(&config), 2, table, 128).unwrap();
        pool.set_targets_with(|t| {
            for target in t.iter_mut() {
                target.volume = V_MAX;
            }
        });

        let mut left = vec![0.0; 128];
        let mut right = vec![0.0; 128];
        pool.render(128, &mut left, &mut right);
        // Slew starts from zero, so the first sample is silent but the block
        // ramps up.
        assert!(left.iter().any(|&s| s != 0.0));
    }

    #[test]
    fn test_shutdown_is_idempotent() {
        let config = test_config();
        let table = Arc::new(Wavetable::new(Waveform::Sine));
        let mut pool = WorkerPool::new(build_bank(&config), 4, table, 64).unwrap();
        pool.render(64, &mut vec![0.0; 64], &mut vec![0.0; 64]);
        pool.shutdown();
        pool.shutdown(); // second call is a no-op; drop will be too
    }

    #[test]
    fn test_more_workers_than_partials() {
        let mut config = test_config();
        config.num_partials = 2;
        let table = Arc::new(Wavetable::new(Waveform::Sine));
        // Worker count is clamped to the bank size
        let mut pool = WorkerPool::new(build_bank(&config), 8, table, 64).unwrap();
        let mut left = vec![0.0; 64];
        let mut right = vec![0.0; 64];
        pool.render(64, &mut left, &mut right);
    }
}
