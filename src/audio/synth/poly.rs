//! Polyphonic engine driven by the image line's harmonic profile
//!
//! Each note-on snapshots the current preprocessed harmonic profile into the
//! voice: one constant-power gain pair per harmonic, so the color-derived pan
//! of every spectral bin survives all the way to the stereo output. Voices
//! render additively from the shared sine table; the voice sum is scaled by a
//! constant amplitude and hard-clipped. There is deliberately no
//! per-voice-count normalization: dividing by sqrt(active_voices) pumped the
//! level audibly on releases.

use std::sync::Arc;

use crate::audio::buffer::StereoBlock;
use crate::audio::midi::{MidiEvent, MidiEventQueue};
use crate::audio::synth::envelope::AdsrParams;
use crate::audio::synth::line::{HarmonicProfile, LineStage};
use crate::audio::synth::voice::{
    allocate, find_note_off, midi_note_to_freq, NoteOffOutcome, Voice, VoiceCore,
    NOTE_OFF_GRACE_SECS,
};
use crate::audio::synth::wavetable::{Wavetable, TABLE_LEN, TABLE_MASK};
use crate::audio::synth::BlockProducer;
use crate::config::SynthConfig;

/// Constant sum scaling; never derived from the active voice count
const VOICE_SUM_AMP: f32 = 0.3;

struct HarmonicOsc {
    phase: f32,
    step: f32,
    gain_left: f32,
    gain_right: f32,
}

pub struct PolyVoice {
    core: VoiceCore,
    harmonics: Vec<HarmonicOsc>,
}

impl Voice for PolyVoice {
    fn core(&self) -> &VoiceCore {
        &self.core
    }
    fn core_mut(&mut self) -> &mut VoiceCore {
        &mut self.core
    }
}

pub struct PolyEngine {
    voices: Vec<PolyVoice>,
    queue: Arc<MidiEventQueue>,
    stage: Arc<LineStage<HarmonicProfile>>,
    cached_profile: Arc<HarmonicProfile>,
    cached_version: u64,
    table: Arc<Wavetable>,
    sample_rate: f32,
    trigger_counter: u64,
    samples_elapsed: u64,
    grace_samples: u64,
    max_harmonics: usize,
    high_freq_limit: f32,
    amplitude_gamma: f32,
    min_audible_amplitude: f32,
    /// CC 7; scales the whole engine output
    engine_gain: f32,
    lfo_phase: f32,
    lfo_rate: f32,
    lfo_depth_semitones: f32,
    vibrato_scratch: Vec<f32>,
}

impl PolyEngine {
    pub fn new(
        config: &SynthConfig,
        table: Arc<Wavetable>,
        stage: Arc<LineStage<HarmonicProfile>>,
        queue: Arc<MidiEventQueue>,
    ) -> Self {
        let volume_params = AdsrParams::new(
            config.volume_env_attack,
            config.volume_env_decay,
            config.volume_env_sustain,
            config.volume_env_release,
        );
        let filter_params = AdsrParams::new(
            config.filter_env_attack,
            config.filter_env_decay,
            config.filter_env_sustain,
            config.filter_env_release,
        );
        let voices = (0..config.num_voices)
            .map(|_| PolyVoice {
                core: VoiceCore::new(volume_params, filter_params, config.sample_rate),
                harmonics: Vec::with_capacity(config.max_harmonics_per_voice),
            })
            .collect();

        let cached_profile = stage.snapshot();
        let cached_version = stage.version();

        Self {
            voices,
            queue,
            stage,
            cached_profile,
            cached_version,
            table,
            sample_rate: config.sample_rate as f32,
            trigger_counter: 0,
            samples_elapsed: 0,
            grace_samples: (NOTE_OFF_GRACE_SECS * config.sample_rate as f32) as u64,
            max_harmonics: config.max_harmonics_per_voice,
            high_freq_limit: config.high_freq_harmonic_limit_hz,
            amplitude_gamma: config.amplitude_gamma,
            min_audible_amplitude: config.min_audible_amplitude,
            engine_gain: 1.0,
            lfo_phase: 0.0,
            lfo_rate: config.lfo_vibrato_rate,
            lfo_depth_semitones: config.lfo_vibrato_depth,
            vibrato_scratch: vec![1.0; config.audio_buffer_size],
        }
    }

    fn note_on(&mut self, note: u8, velocity: u8) {
        let idx = allocate(&self.voices);
        self.trigger_counter += 1;
        let order = self.trigger_counter;

        let fundamental = midi_note_to_freq(note);
        let profile = Arc::clone(&self.cached_profile);
        let voice = &mut self.voices[idx];

        voice.harmonics.clear();
        let count = self.max_harmonics.min(profile.gains.len());
        for h in 0..count {
            let freq = fundamental * (h + 1) as f32;
            if freq > self.high_freq_limit || freq >= self.sample_rate / 2.0 {
                break;
            }
            let (gl, gr) = profile.gains[h];
            let mag = (gl * gl + gr * gr).sqrt();
            if mag <= 0.0 {
                continue;
            }
            // Gamma reshapes the magnitude; the pan ratio is untouched.
            let shaped = mag.powf(self.amplitude_gamma);
            if shaped < self.min_audible_amplitude {
                continue;
            }
            let scale = shaped / mag;
            voice.harmonics.push(HarmonicOsc {
                phase: 0.0,
                step: freq * TABLE_LEN as f32 / self.sample_rate,
                gain_left: gl * scale,
                gain_right: gr * scale,
            });
        }

        voice.core.note_on(note, velocity, order);
        log::trace!("Poly note on: note={} voice={}", note, idx);
    }

    fn note_off(&mut self, note: u8) {
        match find_note_off(&mut self.voices, note, self.samples_elapsed, self.grace_samples) {
            NoteOffOutcome::Released(idx) => {
                log::trace!("Poly note off: note={} voice={}", note, idx);
            }
            NoteOffOutcome::LateAcknowledged(idx) => {
                log::debug!("Poly late note off for note {} (voice {} releasing)", note, idx);
            }
            NoteOffOutcome::GraceIgnored => {
                log::debug!("Poly note off for note {} inside idle grace window", note);
            }
            NoteOffOutcome::NotFound => {
                log::warn!("Poly note off: no voice found for note {}", note);
            }
        }
    }

    fn handle_event(&mut self, event: MidiEvent) {
        match event {
            MidiEvent::NoteOn { note, velocity } => self.note_on(note, velocity),
            MidiEvent::NoteOff { note } => self.note_off(note),
            MidiEvent::AllNotesOff => {
                for voice in self.voices.iter_mut() {
                    if voice.core.active {
                        voice.core.release();
                    }
                }
            }
            MidiEvent::ControlChange { controller, value } => match controller {
                7 => {
                    self.engine_gain = value as f32 / 127.0;
                    log::debug!("Poly engine gain set to {:.3}", self.engine_gain);
                }
                _ => log::trace!("Poly ignoring CC {}", controller),
            },
        }
    }

    fn fill_vibrato(&mut self, frames: usize) {
        if self.lfo_depth_semitones <= 0.0 || self.lfo_rate <= 0.0 {
            self.vibrato_scratch[..frames].fill(1.0);
            return;
        }
        let phase_step = self.lfo_rate / self.sample_rate;
        for v in self.vibrato_scratch[..frames].iter_mut() {
            let semis = self.lfo_depth_semitones * (std::f32::consts::TAU * self.lfo_phase).sin();
            *v = 2.0f32.powf(semis / 12.0);
            self.lfo_phase += phase_step;
            if self.lfo_phase >= 1.0 {
                self.lfo_phase -= 1.0;
            }
        }
    }
}

impl BlockProducer for PolyEngine {
    fn process_block(&mut self, block: &mut StereoBlock) {
        // Snapshot the newest profile first so note-ons arriving this block
        // voice from the line that is actually current.
        self.stage
            .refresh(&mut self.cached_profile, &mut self.cached_version);
        // Events visible now take effect from the first frame of this block.
        while let Some(event) = self.queue.pop() {
            self.handle_event(event);
        }

        block.clear();
        let frames = block.frames().min(self.vibrato_scratch.len());
        self.fill_vibrato(frames);

        let master = VOICE_SUM_AMP * self.engine_gain;
        for voice in self.voices.iter_mut() {
            if voice.core.volume_adsr.is_idle() {
                continue;
            }
            let velocity_gain = voice.core.velocity as f32 / 127.0;
            for i in 0..frames {
                let env = voice.core.volume_adsr.next();
                voice.core.filter_adsr.next();
                if env <= 0.0 {
                    continue;
                }
                let vib = self.vibrato_scratch[i];
                let mut acc_left = 0.0f32;
                let mut acc_right = 0.0f32;
                for osc in voice.harmonics.iter_mut() {
                    let sample = self.table.at(osc.phase as usize & TABLE_MASK);
                    acc_left += sample * osc.gain_left;
                    acc_right += sample * osc.gain_right;
                    osc.phase += osc.step * vib;
                    if osc.phase >= TABLE_LEN as f32 {
                        osc.phase -= TABLE_LEN as f32;
                    }
                }
                let gain = env * velocity_gain * master;
                block.left[i] += acc_left * gain;
                block.right[i] += acc_right * gain;
            }
        }

        // Constant scale then hard clip; never a dynamic divisor.
        for sample in block.left.iter_mut().chain(block.right.iter_mut()) {
            *sample = sample.clamp(-1.0, 1.0);
        }

        self.samples_elapsed += frames as u64;
        for voice in self.voices.iter_mut() {
            voice.core.settle(self.samples_elapsed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::midi::create_midi_queue;
    use crate::audio::synth::envelope::AdsrState;
    use crate::audio::synth::wavetable::Waveform;

    fn test_config() -> SynthConfig {
        let mut config = SynthConfig::default();
        config.num_voices = 4;
        config.audio_buffer_size = 512;
        config.volume_env_attack = 0.01;
        config.volume_env_decay = 0.0;
        config.volume_env_sustain = 1.0;
        config.volume_env_release = 0.1;
        config.lfo_vibrato_depth = 0.0;
        config
    }

    fn center_profile(harmonics: usize) -> HarmonicProfile {
        let mut gains = vec![(0.0, 0.0); harmonics];
        gains[0] = (std::f32::consts::FRAC_1_SQRT_2, std::f32::consts::FRAC_1_SQRT_2);
        HarmonicProfile { gains }
    }

    fn make_engine(config: &SynthConfig, profile: HarmonicProfile) -> PolyEngine {
        let table = Arc::new(Wavetable::new(Waveform::Sine));
        let stage = Arc::new(LineStage::new(profile));
        PolyEngine::new(config, table, stage, create_midi_queue())
    }

    fn run_blocks(engine: &mut PolyEngine, block: &mut StereoBlock, n: usize) -> (f32, f32) {
        let mut peak_left = 0.0f32;
        let mut peak_right = 0.0f32;
        for _ in 0..n {
            engine.process_block(block);
            for &s in block.left.iter() {
                peak_left = peak_left.max(s.abs());
            }
            for &s in block.right.iter() {
                peak_right = peak_right.max(s.abs());
            }
        }
        (peak_left, peak_right)
    }

    #[test]
    fn test_silent_without_notes() {
        let config = test_config();
        let mut engine = make_engine(&config, center_profile(8));
        let mut block = StereoBlock::new(config.audio_buffer_size);
        engine.process_block(&mut block);
        assert!(block.left.iter().all(|&s| s == 0.0));
        assert!(block.right.iter().all(|&s| s == 0.0));
    }

    #[test]
    fn test_single_note_is_stereo_symmetric() {
        let config = test_config();
        let mut engine = make_engine(&config, center_profile(8));
        let mut block = StereoBlock::new(config.audio_buffer_size);

        engine.queue.note_on(60, 127);
        // ~0.05 s of audio
        let (peak_left, peak_right) = run_blocks(&mut engine, &mut block, 5);
        assert!(peak_left > 0.0);
        // Centered profile: equal peaks within 1%
        assert!((peak_left - peak_right).abs() <= peak_left * 0.01);

        engine.queue.note_off(60);
        // Release is 0.1 s; well after that the engine is silent again
        for _ in 0..20 {
            engine.process_block(&mut block);
        }
        assert!(block.left.iter().all(|&s| s == 0.0));
        assert!(engine.voices.iter().all(|v| v.core.volume_adsr.is_idle()));
    }

    #[test]
    fn test_rapid_notes_steal_oldest_voice() {
        let mut config = test_config();
        config.num_voices = 2;
        let mut engine = make_engine(&config, center_profile(4));
        let mut block = StereoBlock::new(config.audio_buffer_size);

        engine.queue.note_on(60, 100);
        engine.queue.note_on(62, 100);
        engine.queue.note_on(64, 100);
        engine.process_block(&mut block);

        let mut held: Vec<u8> = engine
            .voices
            .iter()
            .filter(|v| v.core.active)
            .map(|v| v.core.midi_note)
            .collect();
        held.sort_unstable();
        assert_eq!(held, vec![62, 64], "oldest trigger (note 60) must be stolen");
    }

    #[test]
    fn test_single_voice_steal_within_one_block() {
        let mut config = test_config();
        config.num_voices = 1;
        let mut engine = make_engine(&config, center_profile(4));
        let mut block = StereoBlock::new(config.audio_buffer_size);

        engine.queue.note_on(60, 100);
        engine.process_block(&mut block);
        engine.queue.note_on(62, 100);
        engine.process_block(&mut block);
        assert_eq!(engine.voices[0].core.midi_note, 62);
        assert!(engine.voices[0].core.active);
    }

    #[test]
    fn test_note_off_without_voice_warns_not_crashes() {
        let config = test_config();
        let mut engine = make_engine(&config, center_profile(4));
        let mut block = StereoBlock::new(config.audio_buffer_size);
        engine.queue.note_off(61);
        engine.process_block(&mut block); // must not panic
    }

    #[test]
    fn test_harmonics_above_limit_are_skipped() {
        let mut config = test_config();
        config.high_freq_harmonic_limit_hz = 1000.0;
        config.clamp_to_valid();
        let mut gains = vec![(0.5, 0.5); 16];
        gains[0] = (0.7, 0.7);
        let mut engine = make_engine(&config, HarmonicProfile { gains });
        let mut block = StereoBlock::new(config.audio_buffer_size);
        // A4 = 440 Hz: harmonics 3+ (1320 Hz) exceed the 1 kHz cap
        engine.queue.note_on(69, 100);
        engine.process_block(&mut block);
        let voice = engine.voices.iter().find(|v| v.core.active).unwrap();
        assert_eq!(voice.harmonics.len(), 2);
    }

    #[test]
    fn test_cc7_scales_output() {
        let config = test_config();
        let mut engine = make_engine(&config, center_profile(4));
        let mut block = StereoBlock::new(config.audio_buffer_size);

        engine.queue.note_on(60, 127);
        let (loud, _) = run_blocks(&mut engine, &mut block, 8);

        engine.queue.push(MidiEvent::ControlChange { controller: 7, value: 32 });
        let (quiet, _) = run_blocks(&mut engine, &mut block, 8);
        assert!(quiet < loud * 0.5, "CC7 at 32/127 should attenuate clearly");
    }

    #[test]
    fn test_all_notes_off_releases_everything() {
        let config = test_config();
        let mut engine = make_engine(&config, center_profile(4));
        let mut block = StereoBlock::new(config.audio_buffer_size);
        engine.queue.note_on(60, 100);
        engine.queue.note_on(64, 100);
        engine.process_block(&mut block);
        engine.queue.all_notes_off();
        engine.process_block(&mut block);
        for voice in engine.voices.iter() {
            let state = voice.core.volume_adsr.state();
            assert!(
                state == AdsrState::Release || state == AdsrState::Idle,
                "voice left in {:?}",
                state
            );
        }
    }

    #[test]
    fn test_output_always_in_range() {
        let mut config = test_config();
        config.num_voices = 8;
        let gains = vec![(0.9, 0.9); 8];
        let mut engine = make_engine(&config, HarmonicProfile { gains });
        let mut block = StereoBlock::new(config.audio_buffer_size);
        for note in [48, 52, 55, 60, 64, 67, 72, 76] {
            engine.queue.note_on(note, 127);
        }
        for _ in 0..10 {
            engine.process_block(&mut block);
            for &s in block.left.iter().chain(block.right.iter()) {
                assert!((-1.0..=1.0).contains(&s));
            }
        }
    }

    #[test]
    fn test_profile_snapshot_taken_at_note_on() {
        let config = test_config();
        let table = Arc::new(Wavetable::new(Waveform::Sine));
        let stage = Arc::new(LineStage::new(center_profile(4)));
        let mut engine = PolyEngine::new(&config, table, Arc::clone(&stage), create_midi_queue());
        let mut block = StereoBlock::new(config.audio_buffer_size);

        engine.queue.note_on(60, 100);
        engine.process_block(&mut block);
        let before = engine.voices[0].harmonics[0].gain_left;

        // Publishing a hard-left profile must not retune the sounding voice
        stage.publish(HarmonicProfile::from_magnitudes(&[1.0, 0.0, 0.0, 0.0], &[0.0; 4]));
        engine.process_block(&mut block);
        assert_eq!(engine.voices[0].harmonics[0].gain_left, before);

        // ...but the next note-on picks it up
        engine.queue.note_on(64, 100);
        engine.process_block(&mut block);
        let voice = engine
            .voices
            .iter()
            .find(|v| v.core.active && v.core.midi_note == 64)
            .unwrap();
        assert!(voice.harmonics[0].gain_right.abs() < 1e-6);
    }
}
