//! Text rendering of a finalized capture session

use super::CaptureSession;
use std::fmt;
use std::time::Duration;

/// Width of the envelope bar chart
pub const BAR_WIDTH: u8 = 20;

/// Diagnostic view of one capture session
#[derive(Debug, Clone, PartialEq)]
pub enum Report {
    NoData,
    Envelope(EnvelopeReport),
}

/// Summary of a non-empty session
#[derive(Debug, Clone, PartialEq)]
pub struct EnvelopeReport {
    /// Per-frame bar length in `0..=BAR_WIDTH`
    pub levels: Vec<u8>,
    pub min: f32,
    pub max: f32,
    /// Audio covered by complete frames
    pub captured: Duration,
    /// Wall-clock time between start and stop
    pub elapsed: Duration,
}

impl Report {
    pub fn from_session(session: &CaptureSession) -> Self {
        let envelope = session.envelope();
        let (Some(min), Some(max)) = (envelope.min(), envelope.max()) else {
            return Report::NoData;
        };

        let levels = match envelope.normalized() {
            Some(normalized) => normalized.map(bar_level).collect(),
            None => vec![0; envelope.len()],
        };

        Report::Envelope(EnvelopeReport {
            levels,
            min,
            max,
            captured: envelope.captured_duration(),
            elapsed: session.elapsed(),
        })
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Report::NoData)
    }
}

fn bar_level(normalized: f32) -> u8 {
    (normalized * f32::from(BAR_WIDTH))
        .round()
        .clamp(0.0, f32::from(BAR_WIDTH)) as u8
}

impl fmt::Display for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Report::NoData => writeln!(f, "No data recorded!"),
            Report::Envelope(report) => report.fmt(f),
        }
    }
}

impl fmt::Display for EnvelopeReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let width = usize::from(BAR_WIDTH);
        for &level in &self.levels {
            let filled = usize::from(level);
            writeln!(
                f,
                "{}{}{}",
                "|".repeat(filled),
                " ".repeat(width - filled),
                level
            )?;
        }
        writeln!(f, "Range {}-{}", self.min, self.max)?;
        writeln!(f, "Recorded {:.2}s of data", self.captured.as_secs_f64())?;
        writeln!(f, "Realtime {:.3}s of data", self.elapsed.as_secs_f64())
    }
}
