//! Capture session lifecycle
//!
//! A [`Capture`] drives an [`AudioSource`] through start/stop cycles. While a
//! session is recording, its [`SessionRecorder`] belongs to the source's delivery
//! path; the source hands it back through the stop signal once delivery has fully
//! ceased, and only then is the session finalized and readable.

mod envelope;
mod report;
mod window;

pub use envelope::{
    DEFAULT_FRAME_DURATION, DEFAULT_SAMPLE_RATE, Envelope, EnvelopeError, EnvelopeExtractor,
    FrameConfig, PeakFrame,
};
pub use report::{BAR_WIDTH, EnvelopeReport, Report};
pub use window::{NoiseWindow, Threshold, detect, detect_envelope, noise_period};

use crate::audio::{AudioSource, WavRecording};
use jiff::Timestamp;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Capture error types
#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("Invalid threshold {0}: must be within [0, 1]")]
    InvalidThreshold(f32),
    #[error(transparent)]
    Envelope(#[from] EnvelopeError),
    #[error("A capture session is already recording")]
    AlreadyRecording,
    #[error("No capture session is recording")]
    NotRecording,
    #[error("Capture session is still recording; stop it before reading results")]
    StillRecording,
    #[error("Audio source dropped the session without confirming stop")]
    StopSignalLost,
    #[error("Failed to write raw recording: {0}")]
    Recording(#[from] hound::Error),
    #[error(transparent)]
    Source(#[from] anyhow::Error),
}

/// Sample sink handed to an audio source for the duration of one session
///
/// Feeds the envelope extractor and, optionally, appends the raw samples to a
/// WAV file.
#[derive(Debug)]
pub struct SessionRecorder {
    extractor: EnvelopeExtractor,
    raw: Option<WavRecording>,
}

impl SessionRecorder {
    pub fn new(config: FrameConfig) -> Self {
        Self {
            extractor: EnvelopeExtractor::new(config),
            raw: None,
        }
    }

    pub fn with_recording(config: FrameConfig, raw: WavRecording) -> Self {
        Self {
            extractor: EnvelopeExtractor::new(config),
            raw: Some(raw),
        }
    }

    /// Deliver a burst of mono samples in arrival order
    #[inline]
    pub fn write_frames(&mut self, samples: &[f32]) {
        self.extractor.push_slice(samples);
        if let Some(raw) = self.raw.as_mut() {
            raw.append(samples);
        }
    }

    pub fn frame_count(&self) -> usize {
        self.extractor.frame_count()
    }

    fn finish(self) -> (Envelope, Option<Result<PathBuf, hound::Error>>) {
        let raw = self.raw.map(WavRecording::finalize);
        (self.extractor.finish(), raw)
    }
}

/// Finalized, immutable result of one start/stop cycle
#[derive(Debug, Clone, PartialEq)]
pub struct CaptureSession {
    started: Timestamp,
    stopped: Timestamp,
    envelope: Envelope,
    recording: Option<PathBuf>,
}

impl CaptureSession {
    pub fn new(
        started: Timestamp,
        stopped: Timestamp,
        envelope: Envelope,
        recording: Option<PathBuf>,
    ) -> Self {
        Self {
            started,
            stopped,
            envelope,
            recording,
        }
    }

    pub fn started(&self) -> Timestamp {
        self.started
    }

    pub fn stopped(&self) -> Timestamp {
        self.stopped
    }

    pub fn envelope(&self) -> &Envelope {
        &self.envelope
    }

    /// Raw WAV written during the session, if one was requested and finalized
    pub fn recording(&self) -> Option<&Path> {
        self.recording.as_deref()
    }

    /// Wall-clock time between start and confirmed stop
    pub fn elapsed(&self) -> Duration {
        let millis = self.stopped.as_millisecond() - self.started.as_millisecond();
        Duration::from_millis(u64::try_from(millis).unwrap_or(0))
    }

    pub fn noise_window(&self, threshold: Threshold) -> NoiseWindow {
        detect_envelope(&self.envelope, threshold)
    }

    pub fn noise_period(&self, threshold: Threshold) -> Duration {
        let window = self.noise_window(threshold);
        debug!(%threshold, %window, frames = self.envelope.len(), "noise window");
        window.duration(self.envelope.frame_duration())
    }

    pub fn report(&self) -> Report {
        Report::from_session(self)
    }
}

enum Lifecycle {
    Idle,
    Recording { started: Timestamp },
    Finalized(CaptureSession),
}

/// Start/stop controller around an audio source
pub struct Capture<S: AudioSource> {
    source: S,
    frames: FrameConfig,
    state: Lifecycle,
}

impl<S: AudioSource> Capture<S> {
    /// Create a controller with the default 10ms frames
    pub fn new(source: S) -> Result<Self, CaptureError> {
        Self::with_frame_duration(source, DEFAULT_FRAME_DURATION)
    }

    pub fn with_frame_duration(source: S, frame_duration: Duration) -> Result<Self, CaptureError> {
        let frames = FrameConfig::new(source.sample_rate(), frame_duration)?;
        Ok(Self {
            source,
            frames,
            state: Lifecycle::Idle,
        })
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    pub fn frame_config(&self) -> FrameConfig {
        self.frames
    }

    pub fn is_recording(&self) -> bool {
        matches!(self.state, Lifecycle::Recording { .. })
    }

    /// The last finalized session, if any
    pub fn session(&self) -> Option<&CaptureSession> {
        match &self.state {
            Lifecycle::Finalized(session) => Some(session),
            _ => None,
        }
    }

    /// Begin a new session, discarding the previous one
    ///
    /// When `recording` is given, raw samples are also written to that WAV file.
    pub fn start(&mut self, recording: Option<&Path>) -> Result<(), CaptureError> {
        if self.is_recording() {
            return Err(CaptureError::AlreadyRecording);
        }

        let recorder = match recording {
            Some(path) => {
                let raw = WavRecording::create(path, self.frames.sample_rate())?;
                SessionRecorder::with_recording(self.frames, raw)
            }
            None => SessionRecorder::new(self.frames),
        };

        self.state = Lifecycle::Idle;
        let started = Timestamp::now();
        self.source.start(recorder)?;
        self.state = Lifecycle::Recording { started };

        info!(
            sample_rate = self.frames.sample_rate(),
            frame_samples = self.frames.frame_samples(),
            recording = ?recording,
            "capture started"
        );
        Ok(())
    }

    /// Stop the source and block until it confirms delivery has ceased
    pub fn stop(&mut self) -> Result<&CaptureSession, CaptureError> {
        let Lifecycle::Recording { started } = self.state else {
            return Err(CaptureError::NotRecording);
        };

        let signal = match self.source.stop() {
            Ok(signal) => signal,
            Err(e) => {
                self.state = Lifecycle::Idle;
                return Err(e.into());
            }
        };
        let recorder = signal.blocking_recv().map_err(|_| {
            self.state = Lifecycle::Idle;
            CaptureError::StopSignalLost
        })?;
        let stopped = Timestamp::now();

        let (envelope, raw) = recorder.finish();
        let recording = match raw {
            Some(Ok(path)) => Some(path),
            Some(Err(e)) => {
                warn!("Raw recording could not be finalized: {}", e);
                None
            }
            None => None,
        };

        info!(
            frames = envelope.len(),
            captured_ms = envelope.captured_duration().as_millis() as u64,
            "capture stopped"
        );

        self.state = Lifecycle::Finalized(CaptureSession::new(started, stopped, envelope, recording));
        self.session().ok_or(CaptureError::NotRecording)
    }

    /// Noise duration of the last session at the given threshold
    ///
    /// Returns zero when no session has been captured yet.
    pub fn noise_period(&self, threshold: f32) -> Result<Duration, CaptureError> {
        let threshold = Threshold::new(threshold)?;
        match &self.state {
            Lifecycle::Idle => Ok(Duration::ZERO),
            Lifecycle::Recording { .. } => Err(CaptureError::StillRecording),
            Lifecycle::Finalized(session) => Ok(session.noise_period(threshold)),
        }
    }

    pub fn report(&self) -> Result<Report, CaptureError> {
        match &self.state {
            Lifecycle::Idle => Ok(Report::NoData),
            Lifecycle::Recording { .. } => Err(CaptureError::StillRecording),
            Lifecycle::Finalized(session) => Ok(session.report()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::StopSignal;
    use anyhow::bail;
    use std::thread;
    use tokio::sync::oneshot;

    /// Delivers scripted bursts on start and confirms stop from another thread
    struct ScriptedSource {
        sample_rate: u32,
        bursts: Vec<Vec<f32>>,
        recorder: Option<SessionRecorder>,
    }

    impl ScriptedSource {
        fn new(sample_rate: u32, bursts: Vec<Vec<f32>>) -> Self {
            Self {
                sample_rate,
                bursts,
                recorder: None,
            }
        }
    }

    impl AudioSource for ScriptedSource {
        fn sample_rate(&self) -> u32 {
            self.sample_rate
        }

        fn start(&mut self, mut recorder: SessionRecorder) -> anyhow::Result<()> {
            for burst in &self.bursts {
                recorder.write_frames(burst);
            }
            self.recorder = Some(recorder);
            Ok(())
        }

        fn stop(&mut self) -> anyhow::Result<StopSignal> {
            let Some(recorder) = self.recorder.take() else {
                bail!("not started");
            };
            let (tx, rx) = oneshot::channel();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(5));
                let _ = tx.send(recorder);
            });
            Ok(rx)
        }
    }

    /// Never confirms stop
    struct LossySource(Option<SessionRecorder>);

    impl AudioSource for LossySource {
        fn sample_rate(&self) -> u32 {
            1000
        }

        fn start(&mut self, recorder: SessionRecorder) -> anyhow::Result<()> {
            self.0 = Some(recorder);
            Ok(())
        }

        fn stop(&mut self) -> anyhow::Result<StopSignal> {
            let (_tx, rx) = oneshot::channel();
            self.0 = None;
            Ok(rx)
        }
    }

    /// One 10-sample frame per peak, at 1 kHz so frames are 10ms
    fn frames_of(peaks: &[f32]) -> Vec<Vec<f32>> {
        peaks.iter().map(|&p| vec![p; 10]).collect()
    }

    #[test]
    fn test_start_stop_finalizes_session() {
        let source = ScriptedSource::new(1000, frames_of(&[0.0, 0.0, 0.0, 1.0, 1.0, 1.0, 0.0, 0.0, 0.0]));
        let mut capture = Capture::new(source).unwrap();
        assert_eq!(capture.frame_config().frame_samples(), 10);

        capture.start(None).unwrap();
        assert!(capture.is_recording());

        let session = capture.stop().unwrap().clone();
        assert_eq!(session.envelope().len(), 9);
        assert!(session.stopped() >= session.started());
        assert!(session.recording().is_none());
        assert_eq!(capture.session(), Some(&session));

        assert_eq!(capture.noise_period(0.5).unwrap(), Duration::from_millis(20));
        assert_eq!(
            capture.session().unwrap().noise_window(Threshold::new(0.5).unwrap()),
            NoiseWindow::Detected { start: 3, end: 5 }
        );
    }

    #[test]
    fn test_results_are_repeatable() {
        let source = ScriptedSource::new(1000, frames_of(&[0.1, 0.9, 0.9, 0.1]));
        let mut capture = Capture::new(source).unwrap();
        capture.start(None).unwrap();
        capture.stop().unwrap();

        let first = capture.noise_period(0.25).unwrap();
        assert_eq!(first, capture.noise_period(0.25).unwrap());
        assert_eq!(capture.report().unwrap(), capture.report().unwrap());
    }

    #[test]
    fn test_before_start_is_no_data() {
        let capture = Capture::new(ScriptedSource::new(1000, vec![])).unwrap();
        assert_eq!(capture.noise_period(0.5).unwrap(), Duration::ZERO);
        assert_eq!(capture.report().unwrap(), Report::NoData);
        assert!(capture.session().is_none());
    }

    #[test]
    fn test_invalid_threshold_fails_fast() {
        let capture = Capture::new(ScriptedSource::new(1000, vec![])).unwrap();
        assert!(matches!(
            capture.noise_period(1.2),
            Err(CaptureError::InvalidThreshold(_))
        ));
        assert!(matches!(
            capture.noise_period(f32::NAN),
            Err(CaptureError::InvalidThreshold(_))
        ));
    }

    #[test]
    fn test_lifecycle_misuse_is_reported() {
        let mut capture = Capture::new(ScriptedSource::new(1000, frames_of(&[0.5]))).unwrap();
        assert!(matches!(capture.stop(), Err(CaptureError::NotRecording)));

        capture.start(None).unwrap();
        assert!(matches!(capture.start(None), Err(CaptureError::AlreadyRecording)));
        assert!(matches!(capture.noise_period(0.5), Err(CaptureError::StillRecording)));
        assert!(matches!(capture.report(), Err(CaptureError::StillRecording)));

        capture.stop().unwrap();
        assert!(matches!(capture.stop(), Err(CaptureError::NotRecording)));
    }

    #[test]
    fn test_next_start_discards_previous_session() {
        let mut capture = Capture::new(ScriptedSource::new(1000, frames_of(&[0.2, 0.8]))).unwrap();
        capture.start(None).unwrap();
        capture.stop().unwrap();
        assert_eq!(capture.session().unwrap().envelope().len(), 2);

        capture.start(None).unwrap();
        assert!(capture.session().is_none());
        let session = capture.stop().unwrap();
        assert_eq!(session.envelope().len(), 2);
    }

    #[test]
    fn test_trailing_samples_dropped_at_stop() {
        let source = ScriptedSource::new(1000, vec![vec![0.5; 10], vec![0.9; 7]]);
        let mut capture = Capture::new(source).unwrap();
        capture.start(None).unwrap();
        assert_eq!(capture.stop().unwrap().envelope().peaks(), &[0.5]);
    }

    #[test]
    fn test_lost_stop_signal_is_an_error() {
        let mut capture = Capture::new(LossySource(None)).unwrap();
        capture.start(None).unwrap();
        assert!(matches!(capture.stop(), Err(CaptureError::StopSignalLost)));
        assert!(!capture.is_recording());
        assert_eq!(capture.noise_period(0.5).unwrap(), Duration::ZERO);
    }

    #[test]
    fn test_raw_recording_is_written() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rec-test.wav");

        let source = ScriptedSource::new(1000, vec![vec![0.5; 25]]);
        let mut capture = Capture::new(source).unwrap();
        capture.start(Some(&path)).unwrap();
        let session = capture.stop().unwrap();
        assert_eq!(session.recording(), Some(path.as_path()));

        let reader = hound::WavReader::open(&path).unwrap();
        assert_eq!(reader.spec().sample_rate, 1000);
        assert_eq!(reader.spec().channels, 1);
        assert_eq!(reader.len(), 25);
    }

    #[test]
    fn test_zero_sample_rate_source_is_rejected() {
        let result = Capture::new(ScriptedSource::new(0, vec![]));
        assert!(matches!(
            result,
            Err(CaptureError::Envelope(EnvelopeError::ZeroSampleRate))
        ));
    }
}
