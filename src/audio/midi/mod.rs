//! MIDI event intake: per-engine queues and the device bridge

pub mod events;
pub mod input;

pub use events::{create_midi_queue, MidiEvent, MidiEventQueue};
