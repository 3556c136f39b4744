//! Audio engine: the cpal output stream driving the mixer callback
//!
//! The mixer is moved into the stream's data callback and owns the consumer
//! side of every engine buffer. Control threads talk to the running stream
//! through `AudioEngineHandle` (gains, metering, miss counters) — the stream
//! itself is not `Send`, so only the handle is stored globally.

use cpal::traits::{DeviceTrait, StreamTrait};
use parking_lot::RwLock;
use std::sync::Arc;

use super::buffer::DoubleBuffer;
use super::device::{get_output_device, get_supported_config};
use super::mixer::{EngineId, Mixer, MixerShared, NUM_ENGINES};
use crate::config::SynthConfig;

/// Handle to control the audio engine from other threads
#[derive(Clone)]
pub struct AudioEngineHandle {
    shared: Arc<MixerShared>,
    sample_rate: u32,
}

impl AudioEngineHandle {
    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn set_master_volume(&self, volume: f32) {
        self.shared.set_master_volume(volume);
    }

    pub fn master_volume(&self) -> f32 {
        self.shared.master_volume()
    }

    pub fn set_mix_level(&self, engine: EngineId, level: f32) {
        self.shared.set_engine_level(engine, level);
    }

    pub fn mix_level(&self, engine: EngineId) -> f32 {
        self.shared.engine_level(engine)
    }

    /// Blocks for which the callback found no ready buffer from this engine
    pub fn buffer_misses(&self, engine: EngineId) -> u64 {
        self.shared.buffer_misses(engine)
    }

    /// Smoothed output peak levels (0.0 - 1.0)
    pub fn output_levels(&self) -> (f32, f32) {
        self.shared.output_levels()
    }

    /// Get and clear the clipping indicators
    pub fn take_clipping(&self) -> (bool, bool) {
        self.shared.take_clipping()
    }

    /// One throttled report line for the miss counters; call from a control
    /// thread, never from the audio path.
    pub fn log_miss_report(&self) {
        let additive = self.buffer_misses(EngineId::Additive);
        let poly = self.buffer_misses(EngineId::Poly);
        let photowave = self.buffer_misses(EngineId::Photowave);
        if additive + poly + photowave > 0 {
            log::debug!(
                "Buffer misses: additive={} poly={} photowave={}",
                additive,
                poly,
                photowave
            );
        }
    }
}

/// The main audio engine
pub struct AudioEngine {
    _stream: cpal::Stream,
    handle: AudioEngineHandle,
}

impl AudioEngine {
    /// Open the output device and start the stream. The mixer takes the
    /// consumer end of the given engine buffers.
    pub fn new(
        device_name: Option<&str>,
        config: &SynthConfig,
        buffers: [Arc<DoubleBuffer>; NUM_ENGINES],
    ) -> Result<Self, String> {
        let device = get_output_device(device_name)?;
        let stream_config = get_supported_config(&device, config)?;

        let sample_rate = stream_config.sample_rate.0;
        let channels = stream_config.channels as usize;

        log::info!(
            "Starting audio engine: {} Hz, {} channels, block {}",
            sample_rate,
            channels,
            config.audio_buffer_size
        );

        let shared = MixerShared::new(config);
        let mut mixer = Mixer::new(buffers, Arc::clone(&shared));

        let stream = device
            .build_output_stream(
                &stream_config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    mixer.render(data, channels);
                },
                move |err| {
                    log::error!("Audio stream error: {}", err);
                },
                None, // No timeout
            )
            .map_err(|e| format!("Failed to build output stream: {}", e))?;

        stream
            .play()
            .map_err(|e| format!("Failed to start stream: {}", e))?;

        let handle = AudioEngineHandle {
            shared,
            sample_rate,
        };

        Ok(Self {
            _stream: stream,
            handle,
        })
    }

    pub fn handle(&self) -> AudioEngineHandle {
        self.handle.clone()
    }
}

// Global engine handle (cpal::Stream isn't Send/Sync, so we store just the handle)
static ENGINE_HANDLE: once_cell::sync::OnceCell<RwLock<Option<AudioEngineHandle>>> =
    once_cell::sync::OnceCell::new();

/// Initialize the global audio engine
pub fn init_engine(
    device_name: Option<&str>,
    config: &SynthConfig,
    buffers: [Arc<DoubleBuffer>; NUM_ENGINES],
) -> Result<(), String> {
    if let Some(cell) = ENGINE_HANDLE.get() {
        if cell.read().is_some() {
            log::debug!("Audio engine already initialized, reusing existing instance");
            return Ok(());
        }
    }

    let engine = AudioEngine::new(device_name, config, buffers)?;
    let handle = engine.handle();

    let cell = ENGINE_HANDLE.get_or_init(|| RwLock::new(None));
    *cell.write() = Some(handle);

    // The stream must stay alive for audio to work; it is leaked on purpose
    // and lives for the process lifetime.
    std::mem::forget(engine);

    log::info!("Audio engine initialized successfully");
    Ok(())
}

/// Get the global engine handle
pub fn get_engine_handle() -> Option<AudioEngineHandle> {
    ENGINE_HANDLE.get().and_then(|cell| cell.read().clone())
}

/// Shutdown the global engine. The leaked stream keeps running silence until
/// process exit; the handle is dropped so controls detach.
pub fn shutdown_engine() {
    if let Some(cell) = ENGINE_HANDLE.get() {
        *cell.write() = None;
    }
}
