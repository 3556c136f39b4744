//! Partial bank for the additive engine
//!
//! One partial per image-line pixel, allocated once at init and never
//! reallocated while audio streams. Volume changes are slew-limited per
//! partial by the gap limiter: the maximum per-sample step scales with the
//! partial's phase stride, so low partials move with the inertia of a long
//! string and high ones respond immediately. This suppresses clicks without
//! any global attack time.

use crate::audio::synth::wavetable::{
    frequency_for_stride, stride_for_frequency, Wavetable, TABLE_LEN, TABLE_MASK,
};
use crate::config::SynthConfig;

/// Full-scale partial volume, matching the 16-bit intensity input
pub const V_MAX: f32 = 65535.0;

/// Gap limiter divisors: rise is allowed to move faster than fall
const GAP_RISE_DIVISOR: f32 = 64.0;
const GAP_FALL_DIVISOR: f32 = 96.0;

/// Smallest permitted step so a partial can always converge
const MIN_VOLUME_STEP: f32 = 1e-3;

/// One oscillator of the additive bank
pub struct Partial {
    pub note_index: usize,
    /// Phase advance per sample: base-octave step shifted by the octave
    pub stride: usize,
    pub phase_index: usize,
    pub current_volume: f32,
    pub volume_increment: f32,
    pub volume_decrement: f32,
    /// False above the high-frequency limit; such partials never contribute
    pub audible: bool,
}

impl Partial {
    fn new(note_index: usize, config: &SynthConfig) -> Self {
        let octave = note_index / config.partials_per_octave;
        let semitone = note_index % config.partials_per_octave;
        let base_freq = config.start_frequency
            * 2.0f32.powf(semitone as f32 / config.partials_per_octave as f32);
        let base_step = stride_for_frequency(base_freq, config.sample_rate);
        let stride = base_step << octave;
        let freq = frequency_for_stride(stride, config.sample_rate);

        let gap = (std::f32::consts::TAU * stride as f32 / TABLE_LEN as f32)
            .sin()
            .abs();
        let audible = freq <= config.high_freq_harmonic_limit_hz
            && freq < config.sample_rate as f32 / 2.0;

        Self {
            note_index,
            stride,
            phase_index: 0,
            current_volume: 0.0,
            volume_increment: (gap * V_MAX / GAP_RISE_DIVISOR).max(MIN_VOLUME_STEP),
            volume_decrement: (gap * V_MAX / GAP_FALL_DIVISOR).max(MIN_VOLUME_STEP),
            audible,
        }
    }

    /// One slew step toward `target`, bounded by the gap limits
    #[inline]
    pub fn slew_toward(&mut self, target: f32) {
        let diff = target - self.current_volume;
        if diff > 0.0 {
            self.current_volume += diff.min(self.volume_increment);
        } else if diff < 0.0 {
            self.current_volume += diff.max(-self.volume_decrement);
        }
    }
}

/// Per-block target for one partial: magnitude plus constant-power pan
#[derive(Debug, Clone, Copy)]
pub struct PartialTarget {
    pub volume: f32,
    pub pan_left: f32,
    pub pan_right: f32,
}

impl PartialTarget {
    pub const SILENT: PartialTarget = PartialTarget {
        volume: 0.0,
        pan_left: std::f32::consts::FRAC_1_SQRT_2,
        pan_right: std::f32::consts::FRAC_1_SQRT_2,
    };
}

/// Build the full bank described by the config
pub fn build_bank(config: &SynthConfig) -> Vec<Partial> {
    (0..config.num_partials)
        .map(|i| Partial::new(i, config))
        .collect()
}

/// Render a contiguous range of partials, accumulating into `left`/`right`.
///
/// Targets are indexed by `note_index`, so a worker handed any sub-range of
/// the bank indexes the same shared target array. Buffers are accumulated
/// into, not overwritten; callers zero them first.
pub fn render_partials(
    partials: &mut [Partial],
    targets: &[PartialTarget],
    table: &Wavetable,
    left: &mut [f32],
    right: &mut [f32],
) {
    let frames = left.len().min(right.len());
    for partial in partials.iter_mut() {
        if !partial.audible {
            continue;
        }
        let target = targets
            .get(partial.note_index)
            .copied()
            .unwrap_or(PartialTarget::SILENT);

        // Fully settled silent partials produce nothing; skip the inner
        // loop but keep the phase advancing so re-onset stays coherent.
        if target.volume == 0.0 && partial.current_volume == 0.0 {
            partial.phase_index =
                (partial.phase_index + partial.stride * frames) & TABLE_MASK;
            continue;
        }

        let mut volume = partial.current_volume;
        let mut phase = partial.phase_index;
        for i in 0..frames {
            let diff = target.volume - volume;
            if diff > 0.0 {
                volume += diff.min(partial.volume_increment);
            } else if diff < 0.0 {
                volume += diff.max(-partial.volume_decrement);
            }
            let sample = table.at(phase) * volume;
            left[i] += sample * target.pan_left;
            right[i] += sample * target.pan_right;
            phase = (phase + partial.stride) & TABLE_MASK;
        }
        partial.current_volume = volume;
        partial.phase_index = phase;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::synth::wavetable::Waveform;

    fn test_config() -> SynthConfig {
        let mut config = SynthConfig::default();
        config.num_partials = 64;
        config
    }

    fn center_target(volume: f32) -> PartialTarget {
        PartialTarget {
            volume,
            ..PartialTarget::SILENT
        }
    }

    #[test]
    fn test_bank_layout() {
        let config = test_config();
        let bank = build_bank(&config);
        assert_eq!(bank.len(), 64);
        for (i, p) in bank.iter().enumerate() {
            assert_eq!(p.note_index, i);
            assert!(p.stride >= 1);
            assert_eq!(p.phase_index, 0);
            assert_eq!(p.current_volume, 0.0);
        }
        // Strides grow monotonically with the note index
        for pair in bank.windows(2) {
            assert!(pair[1].stride >= pair[0].stride);
        }
    }

    #[test]
    fn test_octave_stride_doubles() {
        let mut config = test_config();
        config.num_partials = config.partials_per_octave * 2;
        let bank = build_bank(&config);
        let low = &bank[0];
        let up = &bank[config.partials_per_octave];
        assert_eq!(up.stride, low.stride * 2);
    }

    #[test]
    fn test_gap_limit_scales_with_stride() {
        let mut config = test_config();
        config.num_partials = config.partials_per_octave * 3;
        let bank = build_bank(&config);
        let low = &bank[0];
        let high = &bank[config.partials_per_octave * 2];
        assert!(high.volume_increment > low.volume_increment);
        assert!(high.volume_decrement > low.volume_decrement);
        // Rise is faster than fall for the same partial
        assert!(low.volume_increment > low.volume_decrement);
    }

    #[test]
    fn test_slew_converges_and_is_bounded() {
        let config = test_config();
        let mut bank = build_bank(&config);
        let partial = &mut bank[0];
        let step = partial.volume_increment;

        partial.slew_toward(V_MAX);
        assert!(partial.current_volume <= step + 1e-6);

        // Converges without overshoot
        for _ in 0..1_000_000 {
            partial.slew_toward(1000.0);
            if (partial.current_volume - 1000.0).abs() < 1e-2 {
                break;
            }
        }
        assert!((partial.current_volume - 1000.0).abs() < 1e-2);
        assert!(partial.current_volume <= 1000.0 + 1e-2);
    }

    #[test]
    fn test_block_slew_bound_invariant() {
        let config = test_config();
        let mut bank = build_bank(&config);
        let table = Wavetable::new(Waveform::Sine);
        let frames = 512;
        let targets = vec![center_target(V_MAX); config.num_partials];
        let before: Vec<f32> = bank.iter().map(|p| p.current_volume).collect();

        let mut left = vec![0.0; frames];
        let mut right = vec![0.0; frames];
        render_partials(&mut bank, &targets, &table, &mut left, &mut right);

        for (partial, &was) in bank.iter().zip(before.iter()) {
            let bound = partial.volume_increment.max(partial.volume_decrement) * frames as f32;
            assert!(
                (partial.current_volume - was).abs() <= bound + 1e-3,
                "partial {} moved {} > bound {}",
                partial.note_index,
                (partial.current_volume - was).abs(),
                bound
            );
        }
    }

    #[test]
    fn test_phase_stays_in_table_range() {
        let config = test_config();
        let mut bank = build_bank(&config);
        let table = Wavetable::new(Waveform::Sine);
        let targets = vec![center_target(12_000.0); config.num_partials];
        let mut left = vec![0.0; 480];
        let mut right = vec![0.0; 480];
        for _ in 0..10 {
            render_partials(&mut bank, &targets, &table, &mut left, &mut right);
            for p in &bank {
                assert!(p.phase_index < TABLE_LEN);
            }
        }
    }

    #[test]
    fn test_zero_targets_zero_output() {
        let config = test_config();
        let mut bank = build_bank(&config);
        let table = Wavetable::new(Waveform::Sine);
        let targets = vec![PartialTarget::SILENT; config.num_partials];
        let mut left = vec![0.0; 256];
        let mut right = vec![0.0; 256];
        render_partials(&mut bank, &targets, &table, &mut left, &mut right);
        assert!(left.iter().all(|&s| s == 0.0));
        assert!(right.iter().all(|&s| s == 0.0));
    }

    #[test]
    fn test_inaudible_partials_never_contribute() {
        let mut config = test_config();
        config.high_freq_harmonic_limit_hz = 100.0; // mute almost everything
        config.clamp_to_valid();
        let mut bank = build_bank(&config);
        let audible: Vec<bool> = bank.iter().map(|p| p.audible).collect();
        assert!(audible.iter().any(|&a| !a));

        let table = Wavetable::new(Waveform::Sine);
        let targets = vec![center_target(V_MAX); config.num_partials];
        let mut left = vec![0.0; 128];
        let mut right = vec![0.0; 128];
        render_partials(&mut bank, &targets, &table, &mut left, &mut right);
        for (p, &was_audible) in bank.iter().zip(audible.iter()) {
            if !was_audible {
                assert_eq!(p.current_volume, 0.0);
            }
        }
    }
}
