//! Shared reference wavetables and octave-stride math
//!
//! One table per shape holds a single period at the base octave; every higher
//! octave reuses it by doubling the phase stride. The table length is a power
//! of two so phase wraps with a mask and `(phase + stride) mod L` is exact for
//! any integer stride, with no per-sample correction.

use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Table length in samples. Power of two; large enough that base-octave
/// strides quantize frequency to well under a cent-relevant error.
pub const TABLE_LEN: usize = 1 << 16;
pub const TABLE_MASK: usize = TABLE_LEN - 1;

/// Reference waveform shapes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Waveform {
    Sine,
    Saw,
    Square,
    Triangle,
}

/// Immutable single-period wavetable, shared read-only after init
pub struct Wavetable {
    shape: Waveform,
    samples: Box<[f32]>,
}

impl Wavetable {
    pub fn new(shape: Waveform) -> Self {
        let mut samples = vec![0.0f32; TABLE_LEN];
        for (i, s) in samples.iter_mut().enumerate() {
            let t = i as f32 / TABLE_LEN as f32;
            *s = match shape {
                Waveform::Sine => (std::f32::consts::TAU * t).sin(),
                Waveform::Saw => 2.0 * t - 1.0,
                Waveform::Square => {
                    if t < 0.5 {
                        1.0
                    } else {
                        -1.0
                    }
                }
                Waveform::Triangle => {
                    if t < 0.25 {
                        4.0 * t
                    } else if t < 0.75 {
                        2.0 - 4.0 * t
                    } else {
                        4.0 * t - 4.0
                    }
                }
            };
        }
        Self {
            shape,
            samples: samples.into_boxed_slice(),
        }
    }

    pub fn shape(&self) -> Waveform {
        self.shape
    }

    /// Sample at a phase index; wraps with the table mask
    #[inline]
    pub fn at(&self, phase: usize) -> f32 {
        self.samples[phase & TABLE_MASK]
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        false
    }
}

/// All shapes, built once at init and shared by the engines
pub struct WavetableSet {
    sine: Arc<Wavetable>,
    saw: Arc<Wavetable>,
    square: Arc<Wavetable>,
    triangle: Arc<Wavetable>,
}

impl WavetableSet {
    pub fn new() -> Self {
        Self {
            sine: Arc::new(Wavetable::new(Waveform::Sine)),
            saw: Arc::new(Wavetable::new(Waveform::Saw)),
            square: Arc::new(Wavetable::new(Waveform::Square)),
            triangle: Arc::new(Wavetable::new(Waveform::Triangle)),
        }
    }

    pub fn get(&self, shape: Waveform) -> Arc<Wavetable> {
        match shape {
            Waveform::Sine => Arc::clone(&self.sine),
            Waveform::Saw => Arc::clone(&self.saw),
            Waveform::Square => Arc::clone(&self.square),
            Waveform::Triangle => Arc::clone(&self.triangle),
        }
    }
}

impl Default for WavetableSet {
    fn default() -> Self {
        Self::new()
    }
}

/// Integer phase stride whose table playback frequency is closest to `freq`
/// at the given sample rate. Never returns 0.
pub fn stride_for_frequency(freq: f32, sample_rate: u32) -> usize {
    let exact = freq as f64 * TABLE_LEN as f64 / sample_rate as f64;
    (exact.round() as usize).max(1)
}

/// Frequency produced by an integer stride at the given sample rate
pub fn frequency_for_stride(stride: usize, sample_rate: u32) -> f32 {
    (stride as f64 * sample_rate as f64 / TABLE_LEN as f64) as f32
}
