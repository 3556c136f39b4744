//! MIDI event types and the per-engine event queue
//!
//! Each MIDI-driven engine owns one queue; the MIDI collaborator pushes,
//! the engine's producer thread drains at block boundaries. The transport is
//! a lock-free ring buffer; on overflow the OLDEST event is dropped so the
//! most recent playing state always wins.

use ringbuf::{traits::*, HeapRb};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Events the synthesis engines consume
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MidiEvent {
    /// Note on event
    NoteOn {
        /// MIDI note number (0-127)
        note: u8,
        /// Velocity (0-127)
        velocity: u8,
    },
    /// Note off event
    NoteOff {
        /// MIDI note number (0-127)
        note: u8,
    },
    /// Release every sounding voice
    AllNotesOff,
    /// CC-driven parameter update, applied at the next block boundary
    ControlChange {
        /// Controller number (0-127)
        controller: u8,
        /// Controller value (0-127)
        value: u8,
    },
}

/// Single-producer single-consumer MIDI event queue.
///
/// Producer side is pushed from the MIDI collaborator; consumer side is
/// drained by the engine's producer thread at block boundaries.
pub struct MidiEventQueue {
    producer: Mutex<ringbuf::HeapProd<MidiEvent>>,
    consumer: Mutex<ringbuf::HeapCons<MidiEvent>>,
    /// Events discarded because the queue was full
    dropped: AtomicU64,
}

impl MidiEventQueue {
    pub fn new(capacity: usize) -> Self {
        let rb = HeapRb::new(capacity);
        let (producer, consumer) = rb.split();
        Self {
            producer: Mutex::new(producer),
            consumer: Mutex::new(consumer),
            dropped: AtomicU64::new(0),
        }
    }

    /// Push an event. On overflow the oldest queued event is discarded and
    /// counted; the new event always lands.
    pub fn push(&self, event: MidiEvent) {
        let mut producer = self.producer.lock();
        if producer.try_push(event).is_err() {
            if self.consumer.lock().try_pop().is_some() {
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
            // A slot is guaranteed free now; if the consumer raced us and
            // emptied the queue entirely, the push succeeds anyway.
            let _ = producer.try_push(event);
        }
    }

    pub fn note_on(&self, note: u8, velocity: u8) {
        self.push(MidiEvent::NoteOn { note, velocity });
    }

    pub fn note_off(&self, note: u8) {
        self.push(MidiEvent::NoteOff { note });
    }

    pub fn all_notes_off(&self) {
        self.push(MidiEvent::AllNotesOff);
    }

    /// Pop one event (engine producer thread)
    pub fn pop(&self) -> Option<MidiEvent> {
        self.consumer.lock().try_pop()
    }

    pub fn is_empty(&self) -> bool {
        self.consumer.lock().is_empty()
    }

    pub fn len(&self) -> usize {
        self.consumer.lock().occupied_len()
    }

    /// Number of events discarded on overflow so far
    pub fn dropped_events(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

// Safe to share across threads: both ends are mutex-wrapped
unsafe impl Send for MidiEventQueue {}
unsafe impl Sync for MidiEventQueue {}

/// Create a shared queue sized for one engine
pub fn create_midi_queue() -> Arc<MidiEventQueue> {
    Arc::new(MidiEventQueue::new(256))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_pop_order() {
        let queue = MidiEventQueue::new(16);
        queue.note_on(60, 100);
        queue.note_on(64, 80);
        queue.note_off(60);

        assert_eq!(queue.len(), 3);
        assert_eq!(queue.pop(), Some(MidiEvent::NoteOn { note: 60, velocity: 100 }));
        assert_eq!(queue.pop(), Some(MidiEvent::NoteOn { note: 64, velocity: 80 }));
        assert_eq!(queue.pop(), Some(MidiEvent::NoteOff { note: 60 }));
        assert_eq!(queue.pop(), None);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_overflow_drops_oldest() {
        let queue = MidiEventQueue::new(2);
        queue.note_on(60, 100);
        queue.note_on(62, 100);
        queue.note_on(64, 100); // overflow: the note 60 event goes

        assert_eq!(queue.dropped_events(), 1);
        assert_eq!(queue.pop(), Some(MidiEvent::NoteOn { note: 62, velocity: 100 }));
        assert_eq!(queue.pop(), Some(MidiEvent::NoteOn { note: 64, velocity: 100 }));
        assert_eq!(queue.pop(), None);
    }

    #[test]
    fn test_control_change() {
        let queue = MidiEventQueue::new(4);
        queue.push(MidiEvent::ControlChange { controller: 74, value: 90 });
        assert_eq!(
            queue.pop(),
            Some(MidiEvent::ControlChange { controller: 74, value: 90 })
        );
    }
}
