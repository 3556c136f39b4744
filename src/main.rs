//! Sp3ctra runner: wire the synthesis core to the audio driver and MIDI
//!
//! Loads an optional JSON config, starts the three engine producers and the
//! output stream, connects the first MIDI input when one exists, stages a
//! static demo line so the additive engine is audible, and runs until stdin
//! closes or a line is entered.

use std::io::BufRead;
use std::sync::Arc;

use sp3ctra::audio::engine::{get_engine_handle, init_engine, shutdown_engine};
use sp3ctra::audio::midi::input::MidiInputManager;
use sp3ctra::audio::synth::line::{AdditiveLine, HarmonicProfile, ScanTable};
use sp3ctra::audio::synth::Synthesis;
use sp3ctra::config::SynthConfig;

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = match std::env::args().nth(1) {
        Some(path) => match SynthConfig::load(&path) {
            Ok(config) => {
                log::info!("Loaded config from {}", path);
                config
            }
            Err(e) => {
                log::error!("{}", e);
                std::process::exit(1);
            }
        },
        None => SynthConfig::default(),
    };

    if let Err(e) = run(config) {
        log::error!("{}", e);
        std::process::exit(1);
    }
}

fn run(config: SynthConfig) -> Result<(), String> {
    let synthesis = Synthesis::start(&config)?;
    init_engine(None, &config, synthesis.buffers())?;

    let midi = MidiInputManager::new(vec![
        Arc::clone(&synthesis.poly_events),
        Arc::clone(&synthesis.photowave_events),
    ]);
    match midi.list_devices() {
        Ok(devices) if !devices.is_empty() => {
            for device in &devices {
                log::info!("MIDI input {}: {}", device.index, device.name);
            }
            if let Err(e) = midi.connect(0) {
                log::warn!("MIDI connect failed: {}", e);
            }
        }
        Ok(_) => log::info!("No MIDI input devices found"),
        Err(e) => log::warn!("MIDI enumeration failed: {}", e),
    }

    stage_demo_inputs(&synthesis, &config);

    println!("sp3ctra running; press Enter to quit");
    let mut line = String::new();
    let _ = std::io::stdin().lock().read_line(&mut line);

    if let Some(handle) = get_engine_handle() {
        handle.log_miss_report();
    }
    midi.disconnect();
    synthesis.stop();
    shutdown_engine();
    Ok(())
}

/// Static stand-ins for the image preprocessor so the engines have input
fn stage_demo_inputs(synthesis: &Synthesis, config: &SynthConfig) {
    // A sparse line: a handful of bright partials over a dark background
    let mut line = vec![0u16; config.num_partials];
    for (offset, level) in [(0usize, 0xE000u16), (96, 0xA000), (192, 0x7000), (288, 0x4000)] {
        let idx = config.num_partials / 4 + offset;
        if idx < line.len() {
            line[idx] = level;
        }
    }
    synthesis.additive_line.publish(AdditiveLine::Mono(line));

    // A gently decaying harmonic series, center-panned
    let harmonics = config.max_harmonics_per_voice;
    let magnitudes: Vec<f32> = (0..harmonics).map(|h| 1.0 / (h + 1) as f32).collect();
    let pans = vec![0.5f32; harmonics];
    synthesis
        .poly_profile
        .publish(HarmonicProfile::from_magnitudes(&magnitudes, &pans));

    // One sine period as the scan waveform
    let len = 512;
    let samples = (0..len)
        .map(|i| (std::f32::consts::TAU * i as f32 / len as f32).sin())
        .collect();
    synthesis.photowave_table.publish(ScanTable { samples });
}
