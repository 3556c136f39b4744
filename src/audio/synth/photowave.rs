//! Photowave engine: polyphonic scanning of the image-derived waveform
//!
//! Each voice sweeps a scan position through the staged waveform at a rate
//! set by its note frequency and the waveform length, so one full scan spans
//! one period. A per-voice one-pole low-pass, whose cutoff rides the filter
//! envelope, shapes the raw scan before the volume envelope is applied.
//! The engine produces a block every cycle even when idle; conditional
//! production raced the mixer on the first note after silence.

use std::sync::Arc;

use crate::audio::buffer::StereoBlock;
use crate::audio::midi::{MidiEvent, MidiEventQueue};
use crate::audio::synth::envelope::AdsrParams;
use crate::audio::synth::line::{LineStage, ScanTable};
use crate::audio::synth::voice::{
    allocate, find_note_off, midi_note_to_freq, NoteOffOutcome, Voice, VoiceCore,
    NOTE_OFF_GRACE_SECS,
};
use crate::audio::synth::BlockProducer;
use crate::config::{InterpMode, ScanMode, SynthConfig};

/// Constant sum scaling; never derived from the active voice count
const VOICE_SUM_AMP: f32 = 0.3;

pub struct PhotoVoice {
    core: VoiceCore,
    scan_pos: f64,
    /// +1 / -1, flipped at the edges in ping-pong mode
    direction: f64,
    filter_state: f32,
}

impl Voice for PhotoVoice {
    fn core(&self) -> &VoiceCore {
        &self.core
    }
    fn core_mut(&mut self) -> &mut VoiceCore {
        &mut self.core
    }
}

/// Waveform sample at a fractional position
fn sample_at(samples: &[f32], pos: f64, interp: InterpMode) -> f32 {
    let len = samples.len();
    if len == 0 {
        return 0.0;
    }
    match interp {
        InterpMode::Nearest => samples[(pos.round() as usize) % len],
        InterpMode::Linear => {
            let i0 = pos.floor() as usize % len;
            let i1 = (i0 + 1) % len;
            let frac = (pos - pos.floor()) as f32;
            samples[i0] + (samples[i1] - samples[i0]) * frac
        }
    }
}

pub struct PhotowaveEngine {
    voices: Vec<PhotoVoice>,
    queue: Arc<MidiEventQueue>,
    stage: Arc<LineStage<ScanTable>>,
    cached_table: Arc<ScanTable>,
    cached_version: u64,
    sample_rate: f32,
    trigger_counter: u64,
    samples_elapsed: u64,
    grace_samples: u64,
    scan_mode: ScanMode,
    interp_mode: InterpMode,
    base_cutoff: f32,
    filter_env_depth: f32,
    /// CC 7; scales the whole engine output
    engine_gain: f32,
}

impl PhotowaveEngine {
    pub fn new(
        config: &SynthConfig,
        stage: Arc<LineStage<ScanTable>>,
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
            .map(|_| PhotoVoice {
                core: VoiceCore::new(volume_params, filter_params, config.sample_rate),
                scan_pos: 0.0,
                direction: 1.0,
                filter_state: 0.0,
            })
            .collect();

        let cached_table = stage.snapshot();
        let cached_version = stage.version();

        Self {
            voices,
            queue,
            stage,
            cached_table,
            cached_version,
            sample_rate: config.sample_rate as f32,
            trigger_counter: 0,
            samples_elapsed: 0,
            grace_samples: (NOTE_OFF_GRACE_SECS * config.sample_rate as f32) as u64,
            scan_mode: config.photowave_scan_mode,
            interp_mode: config.photowave_interp_mode,
            base_cutoff: config.filter_cutoff,
            filter_env_depth: config.filter_env_depth,
            engine_gain: 1.0,
        }
    }

    fn note_on(&mut self, note: u8, velocity: u8) {
        let idx = allocate(&self.voices);
        self.trigger_counter += 1;
        let order = self.trigger_counter;

        let table_len = self.cached_table.len() as f64;
        let voice = &mut self.voices[idx];
        voice.scan_pos = match self.scan_mode {
            ScanMode::Forward | ScanMode::PingPong => 0.0,
            ScanMode::Reverse => (table_len - 1.0).max(0.0),
        };
        voice.direction = 1.0;
        voice.filter_state = 0.0;
        voice.core.note_on(note, velocity, order);
        log::trace!("Photowave note on: note={} voice={}", note, idx);
    }

    fn note_off(&mut self, note: u8) {
        match find_note_off(&mut self.voices, note, self.samples_elapsed, self.grace_samples) {
            NoteOffOutcome::Released(idx) => {
                log::trace!("Photowave note off: note={} voice={}", note, idx);
            }
            NoteOffOutcome::LateAcknowledged(idx) => {
                log::debug!(
                    "Photowave late note off for note {} (voice {} releasing)",
                    note,
                    idx
                );
            }
            NoteOffOutcome::GraceIgnored => {
                log::debug!("Photowave note off for note {} inside idle grace window", note);
            }
            NoteOffOutcome::NotFound => {
                log::warn!("Photowave note off: no voice found for note {}", note);
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
                    log::debug!("Photowave engine gain set to {:.3}", self.engine_gain);
                }
                74 => {
                    let norm = value as f32 / 127.0;
                    let max_cutoff = self.sample_rate * 0.45;
                    self.base_cutoff = 20.0 + norm * norm * (max_cutoff - 20.0);
                    log::debug!("Photowave cutoff set to {:.1} Hz", self.base_cutoff);
                }
                _ => log::trace!("Photowave ignoring CC {}", controller),
            },
        }
    }

    fn refresh_table(&mut self) {
        if self
            .stage
            .refresh(&mut self.cached_table, &mut self.cached_version)
        {
            // A shorter replacement waveform could strand scan positions
            // past the end; fold them back in.
            let len = self.cached_table.len() as f64;
            for voice in self.voices.iter_mut() {
                if voice.scan_pos >= len {
                    voice.scan_pos %= len.max(1.0);
                }
            }
        }
    }
}

impl BlockProducer for PhotowaveEngine {
    fn process_block(&mut self, block: &mut StereoBlock) {
        // Table first: a note-on this block should scan the newest waveform.
        self.refresh_table();
        while let Some(event) = self.queue.pop() {
            self.handle_event(event);
        }

        block.clear();
        let frames = block.frames();
        let table = Arc::clone(&self.cached_table);
        let samples = table.samples.as_slice();
        let len = samples.len() as f64;
        let nyquist_guard = self.sample_rate * 0.45;
        let master = VOICE_SUM_AMP * self.engine_gain;

        for voice in self.voices.iter_mut() {
            if voice.core.volume_adsr.is_idle() {
                continue;
            }
            let freq = midi_note_to_freq(voice.core.midi_note) as f64;
            let increment = freq * len / self.sample_rate as f64;
            let velocity_gain = voice.core.velocity as f32 / 127.0;

            for i in 0..frames {
                let env = voice.core.volume_adsr.next();
                let filter_env = voice.core.filter_adsr.next();

                let raw = sample_at(samples, voice.scan_pos, self.interp_mode);

                // One-pole low-pass, cutoff riding the filter envelope;
                // runs before the volume envelope multiply.
                let cutoff = (self.base_cutoff + filter_env * self.filter_env_depth)
                    .clamp(20.0, nyquist_guard);
                let alpha = 1.0
                    - (-std::f32::consts::TAU * cutoff / self.sample_rate).exp();
                voice.filter_state += alpha * (raw - voice.filter_state);

                let out = voice.filter_state * env * velocity_gain * master;
                block.left[i] += out;
                block.right[i] += out;

                match self.scan_mode {
                    ScanMode::Forward => {
                        voice.scan_pos += increment;
                        while voice.scan_pos >= len {
                            voice.scan_pos -= len;
                        }
                    }
                    ScanMode::Reverse => {
                        voice.scan_pos -= increment;
                        while voice.scan_pos < 0.0 {
                            voice.scan_pos += len;
                        }
                    }
                    ScanMode::PingPong => {
                        voice.scan_pos += increment * voice.direction;
                        if voice.scan_pos >= len - 1.0 {
                            voice.scan_pos = (len - 1.0) - (voice.scan_pos - (len - 1.0));
                            voice.direction = -1.0;
                        }
                        if voice.scan_pos <= 0.0 {
                            voice.scan_pos = -voice.scan_pos;
                            voice.direction = 1.0;
                        }
                        voice.scan_pos = voice.scan_pos.clamp(0.0, (len - 1.0).max(0.0));
                    }
                }
            }
        }

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
    use approx::assert_relative_eq;

    fn test_config() -> SynthConfig {
        let mut config = SynthConfig::default();
        config.num_voices = 4;
        config.audio_buffer_size = 512;
        config.volume_env_attack = 0.005;
        config.volume_env_decay = 0.0;
        config.volume_env_sustain = 1.0;
        config.volume_env_release = 0.5;
        config
    }

    fn ramp_table(len: usize) -> ScanTable {
        ScanTable {
            samples: (0..len).map(|i| i as f32 / len as f32 - 0.5).collect(),
        }
    }

    fn make_engine(config: &SynthConfig, table: ScanTable) -> PhotowaveEngine {
        let stage = Arc::new(LineStage::new(table));
        PhotowaveEngine::new(config, stage, create_midi_queue())
    }

    #[test]
    fn test_idle_engine_produces_silence_every_cycle() {
        let config = test_config();
        let mut engine = make_engine(&config, ramp_table(256));
        let mut block = StereoBlock::new(config.audio_buffer_size);
        for _ in 0..3 {
            engine.process_block(&mut block);
            assert!(block.left.iter().all(|&s| s == 0.0));
            assert!(block.right.iter().all(|&s| s == 0.0));
        }
    }

    #[test]
    fn test_note_produces_audio_then_decays() {
        let config = test_config();
        let mut engine = make_engine(&config, ramp_table(256));
        let mut block = StereoBlock::new(config.audio_buffer_size);

        engine.queue.note_on(60, 127);
        let mut peak = 0.0f32;
        for _ in 0..4 {
            engine.process_block(&mut block);
            for &s in block.left.iter() {
                peak = peak.max(s.abs());
            }
        }
        assert!(peak > 0.0);

        engine.queue.note_off(60);
        // Release is 0.5 s = ~47 blocks; run past it
        for _ in 0..60 {
            engine.process_block(&mut block);
        }
        assert!(block.left.iter().all(|&s| s == 0.0));
        assert!(engine.voices.iter().all(|v| v.core.volume_adsr.is_idle()));
    }

    #[test]
    fn test_rapid_retrigger_releases_only_oldest_instance() {
        let config = test_config();
        let mut engine = make_engine(&config, ramp_table(256));
        let mut block = StereoBlock::new(config.audio_buffer_size);

        // Five note-ons of the same note into 4 voices: the first instance
        // is stolen by the fifth, leaving triggers {2, 3, 4, 5}.
        for _ in 0..5 {
            engine.queue.note_on(60, 100);
        }
        engine.process_block(&mut block);
        engine.queue.note_off(60);
        engine.process_block(&mut block);

        let releasing: Vec<u64> = engine
            .voices
            .iter()
            .filter(|v| v.core.volume_adsr.state() == AdsrState::Release)
            .map(|v| v.core.trigger_order)
            .collect();
        assert_eq!(releasing, vec![2], "only the oldest instance releases");

        let sounding = engine
            .voices
            .iter()
            .filter(|v| {
                v.core.active && v.core.volume_adsr.state() != AdsrState::Release
            })
            .count();
        assert_eq!(sounding, 3, "the other instances keep sounding");
    }

    #[test]
    fn test_late_note_off_is_not_a_missing_voice() {
        let config = test_config();
        let mut engine = make_engine(&config, ramp_table(256));
        let mut block = StereoBlock::new(config.audio_buffer_size);

        engine.queue.note_on(60, 100);
        engine.process_block(&mut block);

        // Force the voice to Idle as if a very short envelope completed,
        // with the idle stamp recorded just now.
        engine.voices.iter_mut().for_each(|v| {
            if v.core.active {
                v.core.volume_adsr.reset();
            }
        });
        let now = engine.samples_elapsed;
        engine.voices.iter_mut().for_each(|v| v.core.settle(now));

        // The note-off lands in the grace window: ignored, no release state
        engine.queue.note_off(60);
        engine.process_block(&mut block);
        assert!(engine
            .voices
            .iter()
            .all(|v| v.core.volume_adsr.state() == AdsrState::Idle));
    }

    #[test]
    fn test_forward_scan_wraps() {
        let config = test_config();
        let mut engine = make_engine(&config, ramp_table(64));
        let mut block = StereoBlock::new(config.audio_buffer_size);
        engine.queue.note_on(81, 100); // 880 Hz: many full scans per block
        for _ in 0..4 {
            engine.process_block(&mut block);
        }
        for voice in engine.voices.iter().filter(|v| v.core.active) {
            assert!(voice.scan_pos >= 0.0 && voice.scan_pos < 64.0);
        }
    }

    #[test]
    fn test_ping_pong_stays_in_bounds_and_reverses() {
        let mut config = test_config();
        config.photowave_scan_mode = ScanMode::PingPong;
        let mut engine = make_engine(&config, ramp_table(64));
        let mut block = StereoBlock::new(config.audio_buffer_size);
        engine.queue.note_on(60, 100);
        let mut saw_reverse = false;
        for _ in 0..8 {
            engine.process_block(&mut block);
            for voice in engine.voices.iter().filter(|v| v.core.active) {
                assert!(voice.scan_pos >= 0.0 && voice.scan_pos <= 63.0);
                if voice.direction < 0.0 {
                    saw_reverse = true;
                }
            }
        }
        assert!(saw_reverse, "ping-pong never bounced");
    }

    #[test]
    fn test_reverse_scan_stays_in_bounds() {
        let mut config = test_config();
        config.photowave_scan_mode = ScanMode::Reverse;
        let mut engine = make_engine(&config, ramp_table(64));
        let mut block = StereoBlock::new(config.audio_buffer_size);
        engine.queue.note_on(60, 100);
        for _ in 0..4 {
            engine.process_block(&mut block);
        }
        for voice in engine.voices.iter().filter(|v| v.core.active) {
            assert!(voice.scan_pos >= 0.0 && voice.scan_pos < 64.0);
        }
    }

    #[test]
    fn test_interpolation_modes() {
        let samples = [0.0f32, 1.0, 0.0, -1.0];
        assert_relative_eq!(sample_at(&samples, 0.5, InterpMode::Linear), 0.5);
        assert_relative_eq!(sample_at(&samples, 1.25, InterpMode::Linear), 0.75);
        assert_relative_eq!(sample_at(&samples, 0.5, InterpMode::Nearest), 1.0);
        assert_relative_eq!(sample_at(&samples, 3.75, InterpMode::Nearest), 0.0);
    }

    #[test]
    fn test_table_swap_folds_positions() {
        let config = test_config();
        let stage = Arc::new(LineStage::new(ramp_table(256)));
        let mut engine = PhotowaveEngine::new(&config, Arc::clone(&stage), create_midi_queue());
        let mut block = StereoBlock::new(config.audio_buffer_size);
        engine.queue.note_on(48, 100);
        for _ in 0..2 {
            engine.process_block(&mut block);
        }
        stage.publish(ramp_table(16));
        engine.process_block(&mut block);
        for voice in engine.voices.iter().filter(|v| v.core.active) {
            assert!(voice.scan_pos < 16.0);
        }
    }

    #[test]
    fn test_cc74_moves_cutoff() {
        let config = test_config();
        let mut engine = make_engine(&config, ramp_table(256));
        let mut block = StereoBlock::new(config.audio_buffer_size);
        let before = engine.base_cutoff;
        engine.queue.push(MidiEvent::ControlChange { controller: 74, value: 127 });
        engine.process_block(&mut block);
        assert!(engine.base_cutoff > before);
        assert!(engine.base_cutoff <= engine.sample_rate * 0.45);
    }

    #[test]
    fn test_output_always_in_range() {
        let config = test_config();
        // A deliberately hot waveform: the engine still clips to [-1, 1]
        let table = ScanTable {
            samples: vec![2.0; 128],
        };
        let mut engine = make_engine(&config, table);
        let mut block = StereoBlock::new(config.audio_buffer_size);
        for note in [48, 55, 60, 67] {
            engine.queue.note_on(note, 127);
        }
        for _ in 0..8 {
            engine.process_block(&mut block);
            for &s in block.left.iter().chain(block.right.iter()) {
                assert!((-1.0..=1.0).contains(&s));
            }
        }
    }
}
