//! Audio output device enumeration and stream configuration

use cpal::traits::{DeviceTrait, HostTrait};
use serde::{Deserialize, Serialize};

use crate::config::SynthConfig;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioDeviceInfo {
    pub name: String,
    pub is_default: bool,
}

/// Get list of available output devices
pub fn list_output_devices() -> Result<Vec<AudioDeviceInfo>, String> {
    let host = cpal::default_host();
    let default_device = host.default_output_device();
    let default_name = default_device.as_ref().and_then(|d| d.name().ok());

    let devices = host
        .output_devices()
        .map_err(|e| format!("Failed to enumerate devices: {}", e))?;

    let mut result = Vec::new();
    for device in devices {
        if let Ok(name) = device.name() {
            result.push(AudioDeviceInfo {
                is_default: Some(&name) == default_name.as_ref(),
                name,
            });
        }
    }

    Ok(result)
}

/// Get the default output device
pub fn get_default_output_device() -> Result<cpal::Device, String> {
    let host = cpal::default_host();
    host.default_output_device()
        .ok_or_else(|| "No default output device found".to_string())
}

/// Get output device by name, or default if name is None
pub fn get_output_device(name: Option<&str>) -> Result<cpal::Device, String> {
    let host = cpal::default_host();

    match name {
        Some(device_name) => {
            let devices = host
                .output_devices()
                .map_err(|e| format!("Failed to enumerate devices: {}", e))?;

            for device in devices {
                if let Ok(n) = device.name() {
                    if n == device_name {
                        return Ok(device);
                    }
                }
            }
            Err(format!("Device '{}' not found", device_name))
        }
        None => get_default_output_device(),
    }
}

/// Pick a stereo stream config matching the synth's sample rate and block
/// size, falling back to the device default when unsupported.
pub fn get_supported_config(
    device: &cpal::Device,
    config: &SynthConfig,
) -> Result<cpal::StreamConfig, String> {
    let supported_configs = device
        .supported_output_configs()
        .map_err(|e| format!("Failed to get supported configs: {}", e))?;

    for supported in supported_configs {
        let min_rate = supported.min_sample_rate().0;
        let max_rate = supported.max_sample_rate().0;

        if config.sample_rate >= min_rate
            && config.sample_rate <= max_rate
            && supported.channels() >= 2
        {
            return Ok(cpal::StreamConfig {
                channels: 2,
                sample_rate: cpal::SampleRate(config.sample_rate),
                buffer_size: cpal::BufferSize::Fixed(config.audio_buffer_size as u32),
            });
        }
    }

    let default_config = device
        .default_output_config()
        .map_err(|e| format!("Failed to get default config: {}", e))?;

    log::warn!(
        "Requested {} Hz stereo unsupported; using device default {} Hz",
        config.sample_rate,
        default_config.sample_rate().0
    );

    Ok(cpal::StreamConfig {
        channels: default_config.channels().min(2),
        sample_rate: default_config.sample_rate(),
        buffer_size: cpal::BufferSize::Default,
    })
}
