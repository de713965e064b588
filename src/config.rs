use crate::capture::{DEFAULT_FRAME_DURATION, DEFAULT_SAMPLE_RATE, Threshold};
use crate::meter::{DEFAULT_POLL_INTERVAL, DEFAULT_PRODUCT_ID, DEFAULT_VENDOR_ID};
use anyhow::Context;
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

const APP_NAME: &str = "noisetimer";

#[derive(Error, Debug, PartialEq)]
pub enum ConfigError {
    #[error("sample_rate must be greater than zero")]
    ZeroSampleRate,
    #[error("frame_ms must be greater than zero")]
    ZeroFrameDuration,
    #[error("poll_interval_ms must be greater than zero")]
    ZeroPollInterval,
    #[error("threshold {0} must be within [0, 1]")]
    InvalidThreshold(f32),
    #[error("frame of {frame_ms}ms holds no samples at {sample_rate} Hz")]
    FrameTooShort { frame_ms: u64, sample_rate: u32 },
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Settings {
    /// Audio sample rate in Hz
    /// The closest supported rate is used when the device cannot provide it
    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,

    /// Envelope frame length in milliseconds
    #[serde(default = "default_frame_ms")]
    pub frame_ms: u64,

    /// Preferred audio input device name
    /// If None, uses system default device
    #[serde(default)]
    pub audio_device: Option<String>,

    /// Normalized loudness a frame must exceed to count as noise
    #[serde(default = "default_threshold")]
    pub threshold: f32,

    /// Sound level meter polling cadence in milliseconds
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    #[serde(default = "default_meter_vendor_id")]
    pub meter_vendor_id: u16,

    #[serde(default = "default_meter_product_id")]
    pub meter_product_id: u16,

    /// Where trial recordings are saved
    /// If None, uses the data directory
    #[serde(default)]
    pub recordings_dir: Option<PathBuf>,

    /// CSV file trial records are appended to
    #[serde(default = "default_trial_log")]
    pub trial_log: PathBuf,
}

fn default_sample_rate() -> u32 {
    DEFAULT_SAMPLE_RATE
}

fn default_frame_ms() -> u64 {
    DEFAULT_FRAME_DURATION.as_millis() as u64
}

fn default_threshold() -> f32 {
    0.25
}

fn default_poll_interval_ms() -> u64 {
    DEFAULT_POLL_INTERVAL.as_millis() as u64
}

fn default_meter_vendor_id() -> u16 {
    DEFAULT_VENDOR_ID
}

fn default_meter_product_id() -> u16 {
    DEFAULT_PRODUCT_ID
}

fn default_trial_log() -> PathBuf {
    PathBuf::from("trials.csv")
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            sample_rate: default_sample_rate(),
            frame_ms: default_frame_ms(),
            audio_device: None,
            threshold: default_threshold(),
            poll_interval_ms: default_poll_interval_ms(),
            meter_vendor_id: default_meter_vendor_id(),
            meter_product_id: default_meter_product_id(),
            recordings_dir: None,
            trial_log: default_trial_log(),
        }
    }
}

impl Settings {
    /// Load config from ~/.config/noisetimer/config.toml
    /// Returns default settings if the file doesn't exist
    pub fn load() -> anyhow::Result<Self> {
        let Some(path) = config_path() else {
            info!("Could not determine config directory, using defaults");
            return Ok(Self::default());
        };
        if !path.exists() {
            info!("No config file found at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        Self::load_from(&path)
    }

    /// Load config from an explicit path, which must exist and parse
    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let settings: Self = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        settings
            .validate()
            .with_context(|| format!("Invalid config file: {}", path.display()))?;

        debug!("Loaded settings from: {}", path.display());
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sample_rate == 0 {
            return Err(ConfigError::ZeroSampleRate);
        }
        if self.frame_ms == 0 {
            return Err(ConfigError::ZeroFrameDuration);
        }
        if self.poll_interval_ms == 0 {
            return Err(ConfigError::ZeroPollInterval);
        }
        if Threshold::new(self.threshold).is_err() {
            return Err(ConfigError::InvalidThreshold(self.threshold));
        }
        if u64::from(self.sample_rate) * self.frame_ms < 1000 {
            return Err(ConfigError::FrameTooShort {
                frame_ms: self.frame_ms,
                sample_rate: self.sample_rate,
            });
        }
        Ok(())
    }

    pub fn frame_duration(&self) -> Duration {
        Duration::from_millis(self.frame_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Resolve the recordings directory, creating it if needed
    pub fn recordings_dir(&self) -> anyhow::Result<PathBuf> {
        let dir = match &self.recordings_dir {
            Some(dir) => dir.clone(),
            None => ProjectDirs::from("", "", APP_NAME)
                .map(|dirs| dirs.data_local_dir().join("recordings"))
                .context("Could not determine data directory")?,
        };

        fs::create_dir_all(&dir).with_context(|| {
            format!("Failed to create recordings directory: {}", dir.display())
        })?;
        Ok(dir)
    }
}

/// Get the path to the config file: ~/.config/noisetimer/config.toml
pub fn config_path() -> Option<PathBuf> {
    ProjectDirs::from("", "", APP_NAME).map(|dirs| dirs.config_dir().join("config.toml"))
}

/// File name for a new trial recording, e.g. `rec-2025-01-31_14-05-09.wav`
pub fn recording_name() -> String {
    format!(
        "rec-{}.wav",
        jiff::Zoned::now().strftime("%Y-%m-%d_%H-%M-%S")
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_settings() {
        let settings = Settings::default();
        assert_eq!(settings.sample_rate, 48000);
        assert_eq!(settings.frame_duration(), Duration::from_millis(10));
        assert_eq!(settings.poll_interval(), Duration::from_millis(250));
        assert_eq!(settings.meter_vendor_id, 0x10c4);
        assert_eq!(settings.meter_product_id, 0x82cd);
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let settings: Settings = toml::from_str(
            r#"
            threshold = 0.5
            audio_device = "USB Mic"
            "#,
        )
        .unwrap();

        assert_eq!(settings.threshold, 0.5);
        assert_eq!(settings.audio_device.as_deref(), Some("USB Mic"));
        assert_eq!(settings.sample_rate, 48000);
        assert_eq!(settings.trial_log, PathBuf::from("trials.csv"));
    }

    #[test]
    fn test_serialize_deserialize() {
        let settings = Settings {
            sample_rate: 44100,
            frame_ms: 20,
            recordings_dir: Some(PathBuf::from("/tmp/recs")),
            ..Settings::default()
        };

        let toml = toml::to_string(&settings).unwrap();
        let deserialized: Settings = toml::from_str(&toml).unwrap();
        assert_eq!(deserialized, settings);
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        let cases = [
            (Settings { sample_rate: 0, ..Settings::default() }, ConfigError::ZeroSampleRate),
            (Settings { frame_ms: 0, ..Settings::default() }, ConfigError::ZeroFrameDuration),
            (
                Settings { poll_interval_ms: 0, ..Settings::default() },
                ConfigError::ZeroPollInterval,
            ),
            (
                Settings { threshold: 1.5, ..Settings::default() },
                ConfigError::InvalidThreshold(1.5),
            ),
            (
                Settings { sample_rate: 500, frame_ms: 1, ..Settings::default() },
                ConfigError::FrameTooShort { frame_ms: 1, sample_rate: 500 },
            ),
        ];

        for (settings, expected) in cases {
            assert_eq!(settings.validate(), Err(expected));
        }
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "poll_interval_ms = 100\nmeter_vendor_id = 4292\n").unwrap();

        let settings = Settings::load_from(&path).unwrap();
        assert_eq!(settings.poll_interval(), Duration::from_millis(100));
        assert_eq!(settings.meter_vendor_id, 0x10c4);
    }

    #[test]
    fn test_unparsable_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "sample_rate = \"fast\"\n").unwrap();
        assert!(Settings::load_from(&path).is_err());

        fs::write(&path, "threshold = -0.1\n").unwrap();
        assert!(Settings::load_from(&path).is_err());
    }

    #[test]
    fn test_explicit_recordings_dir_is_created() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("nested").join("recs");
        let settings = Settings {
            recordings_dir: Some(target.clone()),
            ..Settings::default()
        };
        assert_eq!(settings.recordings_dir().unwrap(), target);
        assert!(target.is_dir());
    }

    #[test]
    fn test_recording_name_format() {
        let name = recording_name();
        assert!(name.starts_with("rec-"));
        assert!(name.ends_with(".wav"));
        assert_eq!(name.len(), "rec-2025-01-31_14-05-09.wav".len());
    }
}
