//! Synthesis configuration consumed at init
//!
//! All knobs the synthesis core recognizes, with defaults matching the
//! reference hardware setup. Out-of-range values are clamped (with a warning)
//! rather than rejected, so a hand-edited config file cannot brick startup.

use serde::{Deserialize, Serialize};
use std::path::Path;

/// Stereo mapping of the incoming image line for the additive engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StereoMode {
    /// One intensity channel, centered
    Mono,
    /// Two channels: warm colors feed left, cold colors feed right
    WarmCold,
}

/// Scan direction for the photowave engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanMode {
    Forward,
    Reverse,
    PingPong,
}

/// Sample interpolation for the photowave engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InterpMode {
    Nearest,
    Linear,
}

/// Complete synthesis configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SynthConfig {
    /// Frames per audio block
    pub audio_buffer_size: usize,
    /// Output sample rate in Hz
    pub sample_rate: u32,
    /// Polyphony for the poly and photowave engines (each)
    pub num_voices: usize,
    /// Number of additive partials (one per image-line pixel)
    #[serde(alias = "max_oscillators")]
    pub num_partials: usize,
    /// Partials per octave in the additive bank
    pub partials_per_octave: usize,
    /// Frequency of partial 0 in Hz
    pub start_frequency: f32,
    /// Number of additive worker threads
    pub additive_workers: usize,

    /// Final output gain applied by the mixer
    pub master_volume: f32,
    pub additive_mix_level: f32,
    pub poly_mix_level: f32,
    pub photowave_mix_level: f32,

    /// Gamma applied to image intensities before they become amplitudes
    pub amplitude_gamma: f32,
    /// Normalized amplitudes below this are culled
    pub min_audible_amplitude: f32,
    /// Partials/harmonics above this frequency never contribute
    pub high_freq_harmonic_limit_hz: f32,
    /// Harmonics rendered per poly voice
    pub max_harmonics_per_voice: usize,

    /// Volume envelope (seconds, sustain 0..1)
    pub volume_env_attack: f32,
    pub volume_env_decay: f32,
    pub volume_env_sustain: f32,
    pub volume_env_release: f32,
    /// Filter envelope (seconds, sustain 0..1)
    pub filter_env_attack: f32,
    pub filter_env_decay: f32,
    pub filter_env_sustain: f32,
    pub filter_env_release: f32,

    /// Vibrato LFO rate in Hz
    pub lfo_vibrato_rate: f32,
    /// Vibrato LFO depth in semitones
    pub lfo_vibrato_depth: f32,

    /// Photowave base filter cutoff in Hz
    pub filter_cutoff: f32,
    /// Cutoff added at full filter-envelope level, in Hz
    pub filter_env_depth: f32,

    /// Floor of the additive contrast factor (1.0 disables contrast)
    pub contrast_min: f32,
    /// Exponent shaping the variance-to-contrast curve
    pub contrast_adjustment_power: f32,

    pub stereo_mode: StereoMode,
    pub photowave_scan_mode: ScanMode,
    pub photowave_interp_mode: InterpMode,
}

impl Default for SynthConfig {
    fn default() -> Self {
        Self {
            audio_buffer_size: 512,
            sample_rate: 48000,
            num_voices: 8,
            num_partials: 1024,
            partials_per_octave: 96,
            start_frequency: 65.41,
            additive_workers: 3,
            master_volume: 1.0,
            additive_mix_level: 1.0,
            poly_mix_level: 1.0,
            photowave_mix_level: 1.0,
            amplitude_gamma: 1.0,
            min_audible_amplitude: 0.0005,
            high_freq_harmonic_limit_hz: 18_000.0,
            max_harmonics_per_voice: 32,
            volume_env_attack: 0.01,
            volume_env_decay: 0.1,
            volume_env_sustain: 0.7,
            volume_env_release: 0.3,
            filter_env_attack: 0.02,
            filter_env_decay: 0.2,
            filter_env_sustain: 0.5,
            filter_env_release: 0.3,
            lfo_vibrato_rate: 5.0,
            lfo_vibrato_depth: 0.0,
            filter_cutoff: 1200.0,
            filter_env_depth: 3000.0,
            contrast_min: 0.1,
            contrast_adjustment_power: 1.5,
            stereo_mode: StereoMode::Mono,
            photowave_scan_mode: ScanMode::Forward,
            photowave_interp_mode: InterpMode::Linear,
        }
    }
}

impl SynthConfig {
    /// Load a config from a JSON file and clamp it into range
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, String> {
        let text = std::fs::read_to_string(path.as_ref())
            .map_err(|e| format!("Failed to read config {:?}: {}", path.as_ref(), e))?;
        let mut config: SynthConfig = serde_json::from_str(&text)
            .map_err(|e| format!("Failed to parse config {:?}: {}", path.as_ref(), e))?;
        config.clamp_to_valid();
        Ok(config)
    }

    /// Clamp every parameter into its valid range, warning once per field
    pub fn clamp_to_valid(&mut self) {
        clamp_usize("audio_buffer_size", &mut self.audio_buffer_size, 32, 8192);
        clamp_u32("sample_rate", &mut self.sample_rate, 8_000, 192_000);
        clamp_usize("num_voices", &mut self.num_voices, 1, 64);
        clamp_usize("num_partials", &mut self.num_partials, 1, 8192);
        clamp_usize("partials_per_octave", &mut self.partials_per_octave, 1, 384);
        clamp_f32("start_frequency", &mut self.start_frequency, 8.0, 2000.0);
        clamp_usize("additive_workers", &mut self.additive_workers, 1, 16);
        clamp_f32("master_volume", &mut self.master_volume, 0.0, 4.0);
        clamp_f32("additive_mix_level", &mut self.additive_mix_level, 0.0, 2.0);
        clamp_f32("poly_mix_level", &mut self.poly_mix_level, 0.0, 2.0);
        clamp_f32("photowave_mix_level", &mut self.photowave_mix_level, 0.0, 2.0);
        clamp_f32("amplitude_gamma", &mut self.amplitude_gamma, 0.1, 8.0);
        clamp_f32("min_audible_amplitude", &mut self.min_audible_amplitude, 0.0, 0.5);
        clamp_f32(
            "high_freq_harmonic_limit_hz",
            &mut self.high_freq_harmonic_limit_hz,
            100.0,
            self.sample_rate as f32 / 2.0,
        );
        clamp_usize("max_harmonics_per_voice", &mut self.max_harmonics_per_voice, 1, 128);
        clamp_f32("volume_env_attack", &mut self.volume_env_attack, 0.0, 30.0);
        clamp_f32("volume_env_decay", &mut self.volume_env_decay, 0.0, 30.0);
        clamp_f32("volume_env_sustain", &mut self.volume_env_sustain, 0.0, 1.0);
        clamp_f32("volume_env_release", &mut self.volume_env_release, 0.0, 30.0);
        clamp_f32("filter_env_attack", &mut self.filter_env_attack, 0.0, 30.0);
        clamp_f32("filter_env_decay", &mut self.filter_env_decay, 0.0, 30.0);
        clamp_f32("filter_env_sustain", &mut self.filter_env_sustain, 0.0, 1.0);
        clamp_f32("filter_env_release", &mut self.filter_env_release, 0.0, 30.0);
        clamp_f32("lfo_vibrato_rate", &mut self.lfo_vibrato_rate, 0.0, 40.0);
        clamp_f32("lfo_vibrato_depth", &mut self.lfo_vibrato_depth, 0.0, 12.0);
        clamp_f32(
            "filter_cutoff",
            &mut self.filter_cutoff,
            20.0,
            self.sample_rate as f32 * 0.45,
        );
        clamp_f32("filter_env_depth", &mut self.filter_env_depth, 0.0, 20_000.0);
        clamp_f32("contrast_min", &mut self.contrast_min, 0.0, 1.0);
        clamp_f32("contrast_adjustment_power", &mut self.contrast_adjustment_power, 0.1, 8.0);
    }

    /// Seconds spanned by one audio block
    pub fn block_duration_secs(&self) -> f32 {
        self.audio_buffer_size as f32 / self.sample_rate as f32
    }
}

fn clamp_f32(name: &str, value: &mut f32, min: f32, max: f32) {
    if !value.is_finite() {
        log::warn!("Config {}: non-finite value replaced with {}", name, min);
        *value = min;
    } else if *value < min || *value > max {
        let clamped = value.clamp(min, max);
        log::warn!("Config {}: {} out of range [{}, {}], clamped to {}", name, value, min, max, clamped);
        *value = clamped;
    }
}

fn clamp_usize(name: &str, value: &mut usize, min: usize, max: usize) {
    if *value < min || *value > max {
        let clamped = (*value).clamp(min, max);
        log::warn!("Config {}: {} out of range [{}, {}], clamped to {}", name, value, min, max, clamped);
        *value = clamped;
    }
}

fn clamp_u32(name: &str, value: &mut u32, min: u32, max: u32) {
    if *value < min || *value > max {
        let clamped = (*value).clamp(min, max);
        log::warn!("Config {}: {} out of range [{}, {}], clamped to {}", name, value, min, max, clamped);
        *value = clamped;
    }
}
