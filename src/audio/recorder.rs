//! Live microphone capture
//!
//! Provides an [`AudioSource`] backed by CPAL (Cross-Platform Audio Library),
//! plus input device enumeration.

use super::{AudioSource, StopSignal, confirm_stop, first_channel};
use crate::capture::SessionRecorder;
use anyhow::{Context, Result, anyhow, bail};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, SampleFormat, StreamConfig};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

/// Room for one callback's worth of folded samples on common backends
const MONO_SCRATCH_CAPACITY: usize = 8192;

/// Microphone input with a fixed device and stream configuration
pub struct CpalSource {
    device: Device,
    config: StreamConfig,
    sample_rate: u32,
    active: Option<ActiveStream>,
}

struct ActiveStream {
    stream: cpal::Stream,
    recorder: Arc<Mutex<Option<SessionRecorder>>>,
}

/// An input device and the f32 capture configurations it offers
#[derive(Debug, Clone, PartialEq)]
pub struct AudioDeviceInfo {
    pub name: String,
    pub is_default: bool,
    /// Inclusive (min, max) sample rate ranges with f32 input, in Hz
    pub rate_ranges: Vec<(u32, u32)>,
    pub max_channels: u16,
}

impl AudioDeviceInfo {
    /// Whether the device can capture f32 input at exactly `sample_rate`
    pub fn supports_rate(&self, sample_rate: u32) -> bool {
        self.rate_ranges
            .iter()
            .any(|&(min, max)| min <= sample_rate && sample_rate <= max)
    }

    /// Whether [`CpalSource`] can open the device at all
    pub fn has_f32_input(&self) -> bool {
        !self.rate_ranges.is_empty()
    }

    /// Rate a [`CpalSource`] opened at `sample_rate` would actually run at
    pub fn effective_rate(&self, sample_rate: u32) -> Option<u32> {
        if self.supports_rate(sample_rate) {
            return Some(sample_rate);
        }
        self.rate_ranges
            .iter()
            .map(|&(_, max)| max)
            .min_by_key(|max| max.abs_diff(sample_rate))
    }
}

impl CpalSource {
    /// Open an input device at the requested sample rate
    ///
    /// # Arguments
    /// * `device_name` - Optional device name. If None, uses system default.
    /// * `sample_rate` - Target sample rate in Hz (e.g., 44100, 48000)
    pub fn new(device_name: Option<&str>, sample_rate: u32) -> Result<Self> {
        let host = cpal::default_host();

        let device = if let Some(name) = device_name {
            host.input_devices()?
                .find(|d| d.name().map(|n| n == name).unwrap_or(false))
                .ok_or_else(|| anyhow!("Audio device '{}' not found", name))?
        } else {
            host.default_input_device()
                .ok_or_else(|| anyhow!("No default input device found"))?
        };

        let config = Self::get_optimal_config(&device, sample_rate)?;
        let sample_rate = config.sample_rate.0;

        info!(
            device = %device.name().unwrap_or_else(|_| "Unknown Device".to_string()),
            sample_rate,
            channels = config.channels,
            "audio input opened"
        );

        Ok(Self {
            device,
            config,
            sample_rate,
            active: None,
        })
    }

    /// Find the best f32 input configuration for the target sample rate
    ///
    /// Prefers a range that contains the target rate; otherwise falls back to the
    /// range whose maximum rate is closest and runs at that rate.
    fn get_optimal_config(device: &Device, target_sample_rate: u32) -> Result<StreamConfig> {
        let supported_configs: Vec<_> = device
            .supported_input_configs()?
            .filter(|c| c.sample_format() == SampleFormat::F32)
            .collect();

        if let Some(range) = supported_configs.iter().find(|c| {
            c.min_sample_rate().0 <= target_sample_rate && target_sample_rate <= c.max_sample_rate().0
        }) {
            let config = range
                .clone()
                .with_sample_rate(cpal::SampleRate(target_sample_rate));
            return Ok(config.into());
        }

        // Find config closest to target sample rate
        let mut best_config = None;
        let mut best_diff = u32::MAX;

        for config in supported_configs {
            let diff = config.max_sample_rate().0.abs_diff(target_sample_rate);
            if diff < best_diff {
                best_diff = diff;
                best_config = Some(config);
            }
        }

        let config = best_config
            .ok_or_else(|| anyhow!("No f32 input configuration found".to_string()))?
            .with_max_sample_rate();

        warn!(
            requested = target_sample_rate,
            actual = config.sample_rate().0,
            "requested sample rate unsupported, using closest"
        );
        Ok(config.into())
    }

    /// Describe every input device on the default host
    pub fn list_devices() -> Result<Vec<AudioDeviceInfo>> {
        let host = cpal::default_host();
        let default_name = host.default_input_device().and_then(|d| d.name().ok());

        let mut devices = Vec::new();
        for device in host.input_devices()? {
            let name = device
                .name()
                .unwrap_or_else(|_| "Unknown Device".to_string());

            let mut rate_ranges = Vec::new();
            let mut max_channels = 0;
            match device.supported_input_configs() {
                Ok(configs) => {
                    for range in configs.filter(|c| c.sample_format() == SampleFormat::F32) {
                        rate_ranges.push((range.min_sample_rate().0, range.max_sample_rate().0));
                        max_channels = max_channels.max(range.channels());
                    }
                }
                Err(e) => debug!(device = %name, "Skipping input configs: {}", e),
            }
            rate_ranges.sort_unstable();
            rate_ranges.dedup();

            devices.push(AudioDeviceInfo {
                is_default: default_name.as_deref() == Some(name.as_str()),
                name,
                rate_ranges,
                max_channels,
            });
        }

        Ok(devices)
    }

    pub fn device_name(&self) -> String {
        self.device
            .name()
            .unwrap_or_else(|_| "Unknown Device".to_string())
    }

    /// Build the input stream that feeds `recorder` from the audio thread
    fn build_stream(&self, recorder: Arc<Mutex<Option<SessionRecorder>>>) -> Result<cpal::Stream> {
        let channels = usize::from(self.config.channels);
        let mut mono = Vec::with_capacity(MONO_SCRATCH_CAPACITY);

        let stream = self.device.build_input_stream(
            &self.config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                let Ok(mut guard) = recorder.lock() else {
                    return;
                };
                let Some(recorder) = guard.as_mut() else {
                    return;
                };

                if channels <= 1 {
                    recorder.write_frames(data);
                } else {
                    first_channel(data, channels, &mut mono);
                    recorder.write_frames(&mono);
                }
            },
            |err| {
                warn!("Audio input stream error: {}", err);
            },
            None,
        )?;

        Ok(stream)
    }
}

impl AudioSource for CpalSource {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn start(&mut self, recorder: SessionRecorder) -> Result<()> {
        if self.active.is_some() {
            bail!("Audio input is already streaming");
        }

        let recorder = Arc::new(Mutex::new(Some(recorder)));
        let stream = self.build_stream(Arc::clone(&recorder))?;
        stream.play().context("Failed to start audio input stream")?;

        self.active = Some(ActiveStream { stream, recorder });
        Ok(())
    }

    fn stop(&mut self) -> Result<StopSignal> {
        let Some(active) = self.active.take() else {
            bail!("Audio input is not streaming");
        };

        if let Err(e) = active.stream.pause() {
            debug!("Pausing input stream failed: {}", e);
        }
        // Dropping the stream tears down the callback; no samples arrive after this
        drop(active.stream);

        let recorder = active
            .recorder
            .lock()
            .map_err(|_| anyhow!("Audio callback panicked while recording"))?
            .take()
            .ok_or_else(|| anyhow!("Recorder already taken"))?;

        Ok(confirm_stop(recorder))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device(rate_ranges: Vec<(u32, u32)>) -> AudioDeviceInfo {
        AudioDeviceInfo {
            name: "USB Mic".to_string(),
            is_default: true,
            rate_ranges,
            max_channels: 2,
        }
    }

    #[test]
    fn test_supports_rate_within_ranges() {
        let info = device(vec![(8_000, 16_000), (44_100, 48_000)]);
        assert!(info.supports_rate(48_000));
        assert!(info.supports_rate(8_000));
        assert!(!info.supports_rate(32_000));
        assert_eq!(info.effective_rate(48_000), Some(48_000));
    }

    #[test]
    fn test_effective_rate_falls_back_to_closest_maximum() {
        let info = device(vec![(8_000, 16_000), (44_100, 44_100)]);
        assert_eq!(info.effective_rate(48_000), Some(44_100));
        assert_eq!(info.effective_rate(22_050), Some(16_000));
    }

    #[test]
    fn test_device_without_f32_input() {
        let info = device(Vec::new());
        assert!(!info.has_f32_input());
        assert!(!info.supports_rate(48_000));
        assert_eq!(info.effective_rate(48_000), None);
    }
}
