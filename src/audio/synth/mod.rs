//! Synthesis core: three producer engines behind lock-free double buffers
//!
//! `Synthesis::start` builds the wavetables, staging areas, MIDI queues and
//! double buffers, then spawns one producer thread per engine. Producers run
//! until the single shutdown token is raised; each one publishes a block
//! every cycle (silence included) so the mixer never races a first note.

pub mod additive;
pub mod envelope;
pub mod line;
pub mod photowave;
pub mod poly;
pub mod voice;
pub mod wavetable;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::audio::buffer::{DoubleBuffer, StereoBlock};
use crate::audio::midi::{create_midi_queue, MidiEventQueue};
use crate::config::SynthConfig;
use additive::AdditiveEngine;
use line::{AdditiveLine, HarmonicProfile, LineStage, ScanTable};
use photowave::PhotowaveEngine;
use poly::PolyEngine;
use wavetable::{Waveform, WavetableSet};

/// Bounded producer wait so shutdown progresses even without consumer wakes
const PRODUCER_WAIT: Duration = Duration::from_millis(10);

/// Single shutdown token observed by every synthesis thread.
///
/// One flag, set once, checked at block boundaries. The audio callback is
/// not a subscriber; it runs until the driver stream is torn down.
#[derive(Clone, Default)]
pub struct Shutdown(Arc<AtomicBool>);

impl Shutdown {
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(false)))
    }

    pub fn request(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_requested(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// One engine as seen by its producer thread
pub trait BlockProducer: Send {
    fn process_block(&mut self, block: &mut StereoBlock);
}

/// Run a producer until shutdown: wait for a writable half, fill, publish.
pub fn spawn_producer<P: BlockProducer + 'static>(
    name: &'static str,
    mut producer: P,
    buffer: Arc<DoubleBuffer>,
    shutdown: Shutdown,
) -> Result<JoinHandle<()>, String> {
    thread::Builder::new()
        .name(format!("{}-producer", name))
        .spawn(move || {
            log::info!("{} producer started", name);
            while !shutdown.is_requested() {
                if buffer.wait_writable(PRODUCER_WAIT) {
                    buffer.produce(|block| producer.process_block(block));
                }
            }
            log::info!("{} producer stopped", name);
        })
        .map_err(|e| format!("Failed to spawn {} producer: {}", name, e))
}

/// The running synthesis core: staging inputs, MIDI queues, output buffers
/// and the producer threads that connect them.
pub struct Synthesis {
    shutdown: Shutdown,
    pub additive_line: Arc<LineStage<AdditiveLine>>,
    pub poly_profile: Arc<LineStage<HarmonicProfile>>,
    pub photowave_table: Arc<LineStage<ScanTable>>,
    pub poly_events: Arc<MidiEventQueue>,
    pub photowave_events: Arc<MidiEventQueue>,
    additive_buffer: Arc<DoubleBuffer>,
    poly_buffer: Arc<DoubleBuffer>,
    photowave_buffer: Arc<DoubleBuffer>,
    threads: Vec<JoinHandle<()>>,
}

impl Synthesis {
    /// Build every shared resource and spawn the three producer threads
    pub fn start(config: &SynthConfig) -> Result<Self, String> {
        let shutdown = Shutdown::new();
        let tables = WavetableSet::new();

        let additive_line = Arc::new(LineStage::new(AdditiveLine::dark(config.num_partials)));
        let poly_profile = Arc::new(LineStage::new(HarmonicProfile::silent(
            config.max_harmonics_per_voice,
        )));
        let photowave_table = Arc::new(LineStage::new(ScanTable::flat(1024)));

        let poly_events = create_midi_queue();
        let photowave_events = create_midi_queue();

        let additive_buffer = Arc::new(DoubleBuffer::new(config.audio_buffer_size));
        let poly_buffer = Arc::new(DoubleBuffer::new(config.audio_buffer_size));
        let photowave_buffer = Arc::new(DoubleBuffer::new(config.audio_buffer_size));

        let additive = AdditiveEngine::new(
            config,
            tables.get(Waveform::Sine),
            Arc::clone(&additive_line),
        )?;
        let poly = PolyEngine::new(
            config,
            tables.get(Waveform::Sine),
            Arc::clone(&poly_profile),
            Arc::clone(&poly_events),
        );
        let photowave = PhotowaveEngine::new(
            config,
            Arc::clone(&photowave_table),
            Arc::clone(&photowave_events),
        );

        let threads = vec![
            spawn_producer(
                "additive",
                additive,
                Arc::clone(&additive_buffer),
                shutdown.clone(),
            )?,
            spawn_producer("poly", poly, Arc::clone(&poly_buffer), shutdown.clone())?,
            spawn_producer(
                "photowave",
                photowave,
                Arc::clone(&photowave_buffer),
                shutdown.clone(),
            )?,
        ];

        log::info!(
            "Synthesis started: {} partials, {} voices, block {} @ {} Hz",
            config.num_partials,
            config.num_voices,
            config.audio_buffer_size,
            config.sample_rate
        );

        Ok(Self {
            shutdown,
            additive_line,
            poly_profile,
            photowave_table,
            poly_events,
            photowave_events,
            additive_buffer,
            poly_buffer,
            photowave_buffer,
            threads,
        })
    }

    /// Output buffers in mixer order: additive, poly, photowave
    pub fn buffers(&self) -> [Arc<DoubleBuffer>; 3] {
        [
            Arc::clone(&self.additive_buffer),
            Arc::clone(&self.poly_buffer),
            Arc::clone(&self.photowave_buffer),
        ]
    }

    pub fn shutdown_token(&self) -> Shutdown {
        self.shutdown.clone()
    }

    /// Raise the shutdown token and join every producer. Buffers outlive the
    /// join, so no thread can touch freed memory.
    pub fn stop(mut self) {
        self.shutdown.request();
        for handle in self.threads.drain(..) {
            let _ = handle.join();
        }
        log::info!("Synthesis stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_config() -> SynthConfig {
        let mut config = SynthConfig::default();
        config.num_partials = 64;
        config.audio_buffer_size = 128;
        config.additive_workers = 2;
        config.num_voices = 2;
        config
    }

    #[test]
    fn test_shutdown_token() {
        let token = Shutdown::new();
        let clone = token.clone();
        assert!(!clone.is_requested());
        token.request();
        assert!(clone.is_requested());
    }

    #[test]
    fn test_synthesis_produces_blocks_and_stops() {
        let config = small_config();
        let synthesis = Synthesis::start(&config).unwrap();
        let buffers = synthesis.buffers();

        // Every engine publishes even while silent; drain a few blocks.
        for buffer in &buffers {
            let mut consumed = 0;
            let deadline = std::time::Instant::now() + Duration::from_secs(2);
            while consumed < 3 && std::time::Instant::now() < deadline {
                if buffer.consume(|_| ()) {
                    consumed += 1;
                } else {
                    thread::sleep(Duration::from_millis(1));
                }
            }
            assert_eq!(consumed, 3, "engine stopped producing");
        }

        synthesis.stop();
    }

    #[test]
    fn test_note_reaches_poly_output() {
        let config = small_config();
        let synthesis = Synthesis::start(&config).unwrap();
        synthesis.poly_profile.publish(HarmonicProfile::from_magnitudes(
            &[1.0, 0.5],
            &[0.5, 0.5],
        ));
        synthesis.poly_events.note_on(60, 127);

        let [_, poly_buffer, _] = synthesis.buffers();
        let mut heard = false;
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while !heard && std::time::Instant::now() < deadline {
            poly_buffer.consume(|block| {
                if block.left.iter().any(|&s| s != 0.0) {
                    heard = true;
                }
            });
            thread::sleep(Duration::from_millis(1));
        }
        assert!(heard, "poly note never produced audio");
        synthesis.stop();
    }
}
