//! Additive engine: large-bank wavetable-scan synthesis of the image line
//!
//! Every pixel of the incoming line drives one partial. Per block the engine
//! snapshots the latest line, converts it to per-partial volume targets
//! (mono centered, or warm/cold split into a constant-power pan), renders the
//! bank across the worker pool, then shapes the whole block by a contrast
//! factor derived from the line's variance so near-uniform (blurry) lines
//! recede.

pub mod partials;
pub mod workers;

use std::sync::Arc;

use partials::{PartialTarget, V_MAX};
use workers::WorkerPool;

use crate::audio::buffer::StereoBlock;
use crate::audio::synth::line::{AdditiveLine, LineStage};
use crate::audio::synth::wavetable::Wavetable;
use crate::audio::synth::BlockProducer;
use crate::config::{StereoMode, SynthConfig};

/// Fixed post-sum normalization: headroom for ~64 full-scale partials
const AMP_SCALE: f32 = 1.0 / (V_MAX * 64.0);

/// Downstream drivers differ in native gain
#[cfg(target_os = "macos")]
const PLATFORM_OUTPUT_GAIN: f32 = 1.0;
#[cfg(target_os = "linux")]
const PLATFORM_OUTPUT_GAIN: f32 = 0.8;
#[cfg(not(any(target_os = "macos", target_os = "linux")))]
const PLATFORM_OUTPUT_GAIN: f32 = 1.0;

/// Every Nth pixel enters the variance estimate
const CONTRAST_SAMPLE_STRIDE: usize = 4;

/// Contrast factor in [contrast_min, 1] from the line's variance.
///
/// Normalized intensities have a maximum standard deviation of 0.5 (half the
/// pixels dark, half full), which maps to a ratio of 1.
pub fn compute_contrast(line: &AdditiveLine, contrast_min: f32, power: f32) -> f32 {
    let values = match line {
        AdditiveLine::Mono(v) => v,
        AdditiveLine::WarmCold { warm, .. } => warm,
    };

    let mut sum = 0.0f64;
    let mut sum_sq = 0.0f64;
    let mut count = 0u32;
    for &value in values.iter().step_by(CONTRAST_SAMPLE_STRIDE) {
        let x = value as f64 / V_MAX as f64;
        sum += x;
        sum_sq += x * x;
        count += 1;
    }
    if count == 0 {
        return contrast_min;
    }
    let n = count as f64;
    let mean = sum / n;
    let variance = (sum_sq / n - mean * mean).max(0.0);
    let ratio = ((variance.sqrt() / 0.5) as f32).min(1.0);

    contrast_min + (1.0 - contrast_min) * ratio.powf(power)
}

pub struct AdditiveEngine {
    pool: WorkerPool,
    stage: Arc<LineStage<AdditiveLine>>,
    cached_line: Arc<AdditiveLine>,
    cached_version: u64,
    stereo_mode: StereoMode,
    amplitude_gamma: f32,
    min_audible_amplitude: f32,
    contrast_min: f32,
    contrast_power: f32,
    output_gain: f32,
    num_partials: usize,
    length_mismatch_logged: bool,
}

impl AdditiveEngine {
    pub fn new(
        config: &SynthConfig,
        table: Arc<Wavetable>,
        stage: Arc<LineStage<AdditiveLine>>,
    ) -> Result<Self, String> {
        let bank = partials::build_bank(config);
        let pool = WorkerPool::new(
            bank,
            config.additive_workers,
            table,
            config.audio_buffer_size,
        )?;
        let cached_line = stage.snapshot();
        let cached_version = stage.version();

        let mut engine = Self {
            pool,
            stage,
            cached_line,
            cached_version,
            stereo_mode: config.stereo_mode,
            amplitude_gamma: config.amplitude_gamma,
            min_audible_amplitude: config.min_audible_amplitude,
            contrast_min: config.contrast_min,
            contrast_power: config.contrast_adjustment_power,
            output_gain: AMP_SCALE * PLATFORM_OUTPUT_GAIN,
            num_partials: config.num_partials,
            length_mismatch_logged: false,
        };
        engine.update_targets();
        Ok(engine)
    }

    fn update_targets(&mut self) {
        let line = Arc::clone(&self.cached_line);
        if line.len() != self.num_partials && !self.length_mismatch_logged {
            log::warn!(
                "Image line length {} differs from partial count {}; extra partials stay silent",
                line.len(),
                self.num_partials
            );
            self.length_mismatch_logged = true;
        }

        let gamma = self.amplitude_gamma;
        let min_audible = self.min_audible_amplitude;
        let stereo_mode = self.stereo_mode;

        self.pool.set_targets_with(|targets| {
            for target in targets.iter_mut() {
                *target = PartialTarget::SILENT;
            }
            match (&*line, stereo_mode) {
                (AdditiveLine::Mono(values), _) => {
                    for (target, &value) in targets.iter_mut().zip(values.iter()) {
                        let amp = (value as f32 / V_MAX).powf(gamma);
                        if amp >= min_audible {
                            target.volume = amp * V_MAX;
                        }
                    }
                }
                (AdditiveLine::WarmCold { warm, cold }, StereoMode::WarmCold) => {
                    for ((target, &w), &c) in
                        targets.iter_mut().zip(warm.iter()).zip(cold.iter())
                    {
                        let wn = (w as f32 / V_MAX).powf(gamma);
                        let cn = (c as f32 / V_MAX).powf(gamma);
                        let mag = (wn * wn + cn * cn).sqrt();
                        if mag >= min_audible && mag > 0.0 {
                            target.volume = mag.min(1.0) * V_MAX;
                            target.pan_left = wn / mag;
                            target.pan_right = cn / mag;
                        }
                    }
                }
                // A warm/cold line arriving while configured mono collapses
                // to its warm channel, centered.
                (AdditiveLine::WarmCold { warm, .. }, StereoMode::Mono) => {
                    for (target, &w) in targets.iter_mut().zip(warm.iter()) {
                        let amp = (w as f32 / V_MAX).powf(gamma);
                        if amp >= min_audible {
                            target.volume = amp * V_MAX;
                        }
                    }
                }
            }
        });
    }
}

impl BlockProducer for AdditiveEngine {
    fn process_block(&mut self, block: &mut StereoBlock) {
        block.clear();

        if self
            .stage
            .refresh(&mut self.cached_line, &mut self.cached_version)
        {
            self.update_targets();
        }

        let frames = block.frames();
        self.pool.render(frames, &mut block.left, &mut block.right);

        let contrast = compute_contrast(&self.cached_line, self.contrast_min, self.contrast_power);
        let gain = contrast * self.output_gain;
        for sample in block.left.iter_mut() {
            *sample *= gain;
        }
        for sample in block.right.iter_mut() {
            *sample *= gain;
        }
    }
}
