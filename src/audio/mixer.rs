//! Real-time mixer: the single consumer of every engine's double buffer
//!
//! Runs on the audio driver's callback thread. Per engine block it consumes
//! the latest ready half (or substitutes silence and counts a miss — never
//! blocks), accumulates with the engine's cached gain, applies the master
//! volume, replaces non-finite samples and hard-clips. A one-block carry
//! buffer decouples the driver's requested frame count from the engine block
//! size. No allocation, no locks, no logging on this path.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use super::buffer::DoubleBuffer;
use crate::config::SynthConfig;

/// The three synthesis engines, in mixer feed order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineId {
    Additive = 0,
    Poly = 1,
    Photowave = 2,
}

pub const NUM_ENGINES: usize = 3;

/// Helper to store f32 in AtomicU32
#[inline]
fn f32_to_u32(f: f32) -> u32 {
    f.to_bits()
}

/// Helper to load f32 from AtomicU32
#[inline]
fn u32_to_f32(u: u32) -> f32 {
    f32::from_bits(u)
}

/// State shared between the mixer callback and control threads
pub struct MixerShared {
    master_volume: AtomicU32,
    engine_levels: [AtomicU32; NUM_ENGINES],
    buffer_misses: [AtomicU64; NUM_ENGINES],
    // Output levels for metering - f32 bit patterns for lock-free access
    output_level_left: AtomicU32,
    output_level_right: AtomicU32,
    // Clipping indicators (set by the callback, cleared when read)
    clipping_left: AtomicBool,
    clipping_right: AtomicBool,
}

impl MixerShared {
    pub fn new(config: &SynthConfig) -> Arc<Self> {
        Arc::new(Self {
            master_volume: AtomicU32::new(f32_to_u32(config.master_volume)),
            engine_levels: [
                AtomicU32::new(f32_to_u32(config.additive_mix_level)),
                AtomicU32::new(f32_to_u32(config.poly_mix_level)),
                AtomicU32::new(f32_to_u32(config.photowave_mix_level)),
            ],
            buffer_misses: Default::default(),
            output_level_left: AtomicU32::new(f32_to_u32(0.0)),
            output_level_right: AtomicU32::new(f32_to_u32(0.0)),
            clipping_left: AtomicBool::new(false),
            clipping_right: AtomicBool::new(false),
        })
    }

    pub fn set_master_volume(&self, volume: f32) {
        self.master_volume
            .store(f32_to_u32(volume.clamp(0.0, 4.0)), Ordering::Relaxed);
    }

    pub fn master_volume(&self) -> f32 {
        u32_to_f32(self.master_volume.load(Ordering::Relaxed))
    }

    pub fn set_engine_level(&self, engine: EngineId, level: f32) {
        self.engine_levels[engine as usize]
            .store(f32_to_u32(level.clamp(0.0, 2.0)), Ordering::Relaxed);
    }

    pub fn engine_level(&self, engine: EngineId) -> f32 {
        u32_to_f32(self.engine_levels[engine as usize].load(Ordering::Relaxed))
    }

    /// Blocks for which this engine had nothing ready
    pub fn buffer_misses(&self, engine: EngineId) -> u64 {
        self.buffer_misses[engine as usize].load(Ordering::Relaxed)
    }

    /// Smoothed output peaks (0.0 - 1.0)
    pub fn output_levels(&self) -> (f32, f32) {
        (
            u32_to_f32(self.output_level_left.load(Ordering::Relaxed)),
            u32_to_f32(self.output_level_right.load(Ordering::Relaxed)),
        )
    }

    /// Read and clear the clipping indicators
    pub fn take_clipping(&self) -> (bool, bool) {
        (
            self.clipping_left.swap(false, Ordering::Relaxed),
            self.clipping_right.swap(false, Ordering::Relaxed),
        )
    }
}

/// Level meter smoothing factor
const LEVEL_SMOOTHING: f32 = 0.1;

/// The mixer itself; owned and driven by the audio callback
pub struct Mixer {
    shared: Arc<MixerShared>,
    buffers: [Arc<DoubleBuffer>; NUM_ENGINES],
    mixed_left: Vec<f32>,
    mixed_right: Vec<f32>,
    cursor: usize,
    block_frames: usize,
}

impl Mixer {
    pub fn new(buffers: [Arc<DoubleBuffer>; NUM_ENGINES], shared: Arc<MixerShared>) -> Self {
        let block_frames = buffers[0].frames();
        Self {
            shared,
            buffers,
            mixed_left: vec![0.0; block_frames],
            mixed_right: vec![0.0; block_frames],
            // Start exhausted so the first render pulls fresh blocks
            cursor: block_frames,
            block_frames,
        }
    }

    pub fn shared(&self) -> Arc<MixerShared> {
        Arc::clone(&self.shared)
    }

    /// Pull one block from every engine into the carry buffer. Engines are
    /// independent: a miss on one never withholds the others.
    fn refill(&mut self) {
        self.mixed_left.fill(0.0);
        self.mixed_right.fill(0.0);

        for (index, buffer) in self.buffers.iter().enumerate() {
            // Gains cached once per block, never re-read per sample
            let level =
                u32_to_f32(self.shared.engine_levels[index].load(Ordering::Relaxed));
            let mixed_left = &mut self.mixed_left;
            let mixed_right = &mut self.mixed_right;
            let consumed = buffer.consume(|block| {
                let frames = block.frames().min(mixed_left.len());
                for i in 0..frames {
                    mixed_left[i] += level * block.left[i];
                    mixed_right[i] += level * block.right[i];
                }
            });
            if !consumed {
                self.shared.buffer_misses[index].fetch_add(1, Ordering::Relaxed);
            }
        }
        self.cursor = 0;
    }

    /// Fill an interleaved output slice with `channels` samples per frame.
    /// Channels beyond stereo are zeroed.
    pub fn render(&mut self, data: &mut [f32], channels: usize) {
        if channels == 0 {
            return;
        }
        let master = u32_to_f32(self.shared.master_volume.load(Ordering::Relaxed));

        let mut peak_left = 0.0f32;
        let mut peak_right = 0.0f32;
        let mut clipped_left = false;
        let mut clipped_right = false;

        for chunk in data.chunks_mut(channels) {
            if self.cursor >= self.block_frames {
                self.refill();
            }
            let mut left = self.mixed_left[self.cursor] * master;
            let mut right = self.mixed_right[self.cursor] * master;
            self.cursor += 1;

            // Replace non-finite samples and hard-clip to [-1, 1]
            if !left.is_finite() {
                left = 0.0;
                clipped_left = true;
            } else if left > 1.0 || left < -1.0 {
                left = left.clamp(-1.0, 1.0);
                clipped_left = true;
            }
            if !right.is_finite() {
                right = 0.0;
                clipped_right = true;
            } else if right > 1.0 || right < -1.0 {
                right = right.clamp(-1.0, 1.0);
                clipped_right = true;
            }

            peak_left = peak_left.max(left.abs());
            peak_right = peak_right.max(right.abs());

            chunk[0] = left;
            if channels > 1 {
                chunk[1] = right;
            }
            for extra in chunk.iter_mut().skip(2) {
                *extra = 0.0;
            }
        }

        if clipped_left {
            self.shared.clipping_left.store(true, Ordering::Relaxed);
        }
        if clipped_right {
            self.shared.clipping_right.store(true, Ordering::Relaxed);
        }

        // Smoothed level metering, lock-free
        {
            let current = u32_to_f32(self.shared.output_level_left.load(Ordering::Relaxed));
            let new_level = current * (1.0 - LEVEL_SMOOTHING) + peak_left * LEVEL_SMOOTHING;
            self.shared
                .output_level_left
                .store(f32_to_u32(new_level), Ordering::Relaxed);
        }
        {
            let current = u32_to_f32(self.shared.output_level_right.load(Ordering::Relaxed));
            let new_level = current * (1.0 - LEVEL_SMOOTHING) + peak_right * LEVEL_SMOOTHING;
            self.shared
                .output_level_right
                .store(f32_to_u32(new_level), Ordering::Relaxed);
        }
    }
}
