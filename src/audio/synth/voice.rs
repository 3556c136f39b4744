//! Common voice record and allocation policy for the MIDI-driven engines
//!
//! Both the poly and photowave engines keep a fixed array of voices and share
//! the same allocation rules: free voices first, then steal the oldest
//! trigger among the voices furthest along their envelope. Note-off resolves
//! through a three-priority search keyed on the volume envelope state, not on
//! the `active` flag, because the two may diverge by up to one block.

use super::envelope::{Adsr, AdsrParams, AdsrState};

/// Grace window for note-offs arriving just after a voice reached Idle
pub const NOTE_OFF_GRACE_SECS: f32 = 0.020;

/// Per-voice state shared by both polyphonic engines
pub struct VoiceCore {
    pub midi_note: u8,
    pub velocity: u8,
    pub active: bool,
    /// Monotonic stamp assigned at note-on; identifies the oldest voice
    pub trigger_order: u64,
    /// Sample clock at the moment the volume envelope reached Idle
    pub idle_stamp: u64,
    pub volume_adsr: Adsr,
    pub filter_adsr: Adsr,
}

impl VoiceCore {
    pub fn new(volume: AdsrParams, filter: AdsrParams, sample_rate: u32) -> Self {
        Self {
            midi_note: 0,
            velocity: 0,
            active: false,
            trigger_order: 0,
            idle_stamp: 0,
            volume_adsr: Adsr::new(volume, sample_rate),
            filter_adsr: Adsr::new(filter, sample_rate),
        }
    }

    /// Free for allocation without stealing
    pub fn is_free(&self) -> bool {
        !self.active && self.volume_adsr.is_idle()
    }

    pub fn note_on(&mut self, note: u8, velocity: u8, order: u64) {
        self.midi_note = note;
        self.velocity = velocity;
        self.active = true;
        self.trigger_order = order;
        self.volume_adsr.note_on();
        self.filter_adsr.note_on();
    }

    /// Enter the release phase of both envelopes
    pub fn release(&mut self) {
        self.volume_adsr.note_off();
        self.filter_adsr.note_off();
    }

    /// Reconcile the active flag with the envelope after a block. Records the
    /// idle stamp used by the note-off grace window.
    pub fn settle(&mut self, now_samples: u64) {
        if self.active && self.volume_adsr.is_idle() {
            self.active = false;
            self.idle_stamp = now_samples;
        }
    }
}

/// Accessor the engines implement for their concrete voice structs
pub trait Voice {
    fn core(&self) -> &VoiceCore;
    fn core_mut(&mut self) -> &mut VoiceCore;
}

/// Steal preference: further along the lifecycle is stolen first
fn steal_rank(state: AdsrState) -> u8 {
    match state {
        AdsrState::Idle => 4,
        AdsrState::Release => 3,
        AdsrState::Sustain => 2,
        AdsrState::Decay => 1,
        AdsrState::Attack => 0,
    }
}

/// Pick the voice for a new note: a free voice when one exists, otherwise the
/// best steal candidate (highest lifecycle rank, oldest trigger on ties).
pub fn allocate<V: Voice>(voices: &[V]) -> usize {
    if let Some(idx) = voices.iter().position(|v| v.core().is_free()) {
        return idx;
    }
    let mut best = 0usize;
    let mut best_key = (0u8, u64::MAX);
    for (idx, voice) in voices.iter().enumerate() {
        let core = voice.core();
        let rank = steal_rank(core.volume_adsr.state());
        // Higher rank wins; within a rank the smallest trigger_order wins.
        let better = rank > best_key.0 || (rank == best_key.0 && core.trigger_order < best_key.1);
        if better {
            best = idx;
            best_key = (rank, core.trigger_order);
        }
    }
    best
}

/// Result of the three-priority note-off search
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoteOffOutcome {
    /// A sounding voice was found and moved to Release
    Released(usize),
    /// The oldest matching voice was already releasing; acknowledged only
    LateAcknowledged(usize),
    /// A matching voice reached Idle within the grace window; ignored
    GraceIgnored,
    NotFound,
}

/// Three-priority note-off search.
///
/// 1. Sounding voices (active, envelope in Attack/Decay/Sustain): release
///    the oldest.
/// 2. Voices already in Release, regardless of the `active` flag: a late or
///    duplicate note-off, acknowledged without action.
/// 3. Voices whose envelope reached Idle within the grace window: ignored.
pub fn find_note_off<V: Voice>(
    voices: &mut [V],
    note: u8,
    now_samples: u64,
    grace_samples: u64,
) -> NoteOffOutcome {
    let mut sounding: Option<(usize, u64)> = None;
    let mut releasing: Option<(usize, u64)> = None;
    let mut in_grace = false;

    for (idx, voice) in voices.iter().enumerate() {
        let core = voice.core();
        if core.midi_note != note {
            continue;
        }
        match core.volume_adsr.state() {
            AdsrState::Attack | AdsrState::Decay | AdsrState::Sustain if core.active => {
                if sounding.map_or(true, |(_, order)| core.trigger_order < order) {
                    sounding = Some((idx, core.trigger_order));
                }
            }
            // Deliberately no `active` check: a voice can reach Idle and
            // drop its flag between note-on and note-off delivery.
            AdsrState::Release => {
                if releasing.map_or(true, |(_, order)| core.trigger_order < order) {
                    releasing = Some((idx, core.trigger_order));
                }
            }
            AdsrState::Idle => {
                if now_samples.saturating_sub(core.idle_stamp) <= grace_samples {
                    in_grace = true;
                }
            }
            _ => {}
        }
    }

    if let Some((idx, _)) = sounding {
        voices[idx].core_mut().release();
        return NoteOffOutcome::Released(idx);
    }
    if let Some((idx, _)) = releasing {
        return NoteOffOutcome::LateAcknowledged(idx);
    }
    if in_grace {
        return NoteOffOutcome::GraceIgnored;
    }
    NoteOffOutcome::NotFound
}

/// Equal-tempered frequency of a MIDI note number
pub fn midi_note_to_freq(note: u8) -> f32 {
    440.0 * 2.0f32.powf((note as f32 - 69.0) / 12.0)
}
