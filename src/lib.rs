//! Acoustic timing harness for actuator calibration
//!
//! Captures microphone audio around an actuator move, reduces it to a loudness
//! envelope, and measures how long the move was audible. A sound-level meter can
//! be sampled in the background over the same interval.

pub mod audio;
pub mod capture;
pub mod config;
pub mod meter;
pub mod trial;

pub use audio::{AudioSource, CpalSource, StopSignal, WavFileSource};
pub use capture::{Capture, CaptureError, CaptureSession, NoiseWindow, Report, Threshold};
pub use config::Settings;
pub use meter::{HidMeter, LevelDevice, LevelSample, LevelSampler, LevelSummary, MonitorRun};
pub use trial::{Direction, TrialLog, TrialRecord};
