//! Noise window detection
//!
//! Finds the span between the first and last frame whose normalized amplitude
//! exceeds a caller-supplied threshold. Different actuator and microphone
//! pairings sit at different noise floors, so the threshold is never fixed here.

use super::CaptureError;
use super::envelope::Envelope;
use std::fmt;
use std::time::Duration;

/// Fraction of the session's dynamic range a frame must exceed to count as noise
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd)]
pub struct Threshold(f32);

impl Threshold {
    pub fn new(value: f32) -> Result<Self, CaptureError> {
        if value.is_finite() && (0.0..=1.0).contains(&value) {
            Ok(Self(value))
        } else {
            Err(CaptureError::InvalidThreshold(value))
        }
    }

    pub fn value(self) -> f32 {
        self.0
    }
}

impl TryFrom<f32> for Threshold {
    type Error = CaptureError;

    fn try_from(value: f32) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl fmt::Display for Threshold {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Outcome of a window search
///
/// Every variant except `Detected` maps to a zero duration; the distinction only
/// exists for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoiseWindow {
    /// The session produced no complete frames
    NoData,
    /// Every frame has the same amplitude
    FlatSignal,
    /// No frame rose above the threshold
    BelowThreshold,
    /// Inclusive frame indices of the first and last loud frame
    Detected { start: usize, end: usize },
}

impl NoiseWindow {
    /// Number of frame steps between the window edges
    pub fn span(&self) -> usize {
        match *self {
            NoiseWindow::Detected { start, end } => end - start,
            _ => 0,
        }
    }

    pub fn duration(&self, frame_duration: Duration) -> Duration {
        frame_duration.saturating_mul(u32::try_from(self.span()).unwrap_or(u32::MAX))
    }

    pub fn is_detected(&self) -> bool {
        matches!(self, NoiseWindow::Detected { .. })
    }
}

impl fmt::Display for NoiseWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NoiseWindow::NoData => write!(f, "no data"),
            NoiseWindow::FlatSignal => write!(f, "flat signal"),
            NoiseWindow::BelowThreshold => write!(f, "below threshold"),
            NoiseWindow::Detected { start, end } => write!(f, "frames {}..={}", start, end),
        }
    }
}

/// Locate the noise window in a finalized peak sequence with known extrema
pub fn detect(peaks: &[f32], min: f32, max: f32, threshold: Threshold) -> NoiseWindow {
    if peaks.is_empty() {
        return NoiseWindow::NoData;
    }

    let range = max - min;
    if !range.is_finite() || range <= 0.0 {
        return NoiseWindow::FlatSignal;
    }

    let exceeds = |peak: &f32| (peak - min) / range > threshold.value();

    let Some(start) = peaks.iter().position(exceeds) else {
        return NoiseWindow::BelowThreshold;
    };
    let Some(end) = peaks.iter().rposition(exceeds) else {
        return NoiseWindow::BelowThreshold;
    };

    NoiseWindow::Detected { start, end }
}

/// Window search over a finalized envelope
pub fn detect_envelope(envelope: &Envelope, threshold: Threshold) -> NoiseWindow {
    let (min, max) = envelope.bounds();
    detect(envelope.peaks(), min, max, threshold)
}

/// Elapsed noise duration; zero when nothing was detected
pub fn noise_period(envelope: &Envelope, threshold: Threshold) -> Duration {
    detect_envelope(envelope, threshold).duration(envelope.frame_duration())
}
