//! Peak envelope extraction
//!
//! Downsamples a raw sample stream into one peak amplitude per fixed-size frame.
//! The extractor runs inline on the audio delivery thread, so every push is O(1)
//! and never blocks or logs.

use std::time::Duration;
use thiserror::Error;

/// Native rate of the calibration microphone
pub const DEFAULT_SAMPLE_RATE: u32 = 48_000;

/// Length of one downsampling window
pub const DEFAULT_FRAME_DURATION: Duration = Duration::from_millis(10);

/// Initial frame capacity, roughly ten seconds at the default frame duration
const INITIAL_FRAME_CAPACITY: usize = 1024;

/// Invalid frame geometry
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EnvelopeError {
    #[error("Invalid sample rate: must be positive")]
    ZeroSampleRate,
    #[error("Invalid frame size: must be at least one sample")]
    ZeroFrameSize,
    #[error("Invalid frame duration: {duration:?} is shorter than one sample at {sample_rate} Hz")]
    FrameTooShort { duration: Duration, sample_rate: u32 },
}

/// Frame geometry shared by the extractor and everything that reads its output
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameConfig {
    sample_rate: u32,
    frame_samples: usize,
}

impl FrameConfig {
    /// Derive the frame size from a sample rate and a target window length
    pub fn new(sample_rate: u32, frame_duration: Duration) -> Result<Self, EnvelopeError> {
        if sample_rate == 0 {
            return Err(EnvelopeError::ZeroSampleRate);
        }

        let frame_samples = (u128::from(sample_rate) * frame_duration.as_nanos() / 1_000_000_000)
            as usize;
        if frame_samples == 0 {
            return Err(EnvelopeError::FrameTooShort {
                duration: frame_duration,
                sample_rate,
            });
        }

        Ok(Self {
            sample_rate,
            frame_samples,
        })
    }

    /// Use an explicit number of samples per frame
    pub fn with_frame_samples(sample_rate: u32, frame_samples: usize) -> Result<Self, EnvelopeError> {
        if sample_rate == 0 {
            return Err(EnvelopeError::ZeroSampleRate);
        }
        if frame_samples == 0 {
            return Err(EnvelopeError::ZeroFrameSize);
        }
        Ok(Self {
            sample_rate,
            frame_samples,
        })
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn frame_samples(&self) -> usize {
        self.frame_samples
    }

    /// Wall-clock span covered by one frame
    pub fn frame_duration(&self) -> Duration {
        let nanos = self.frame_samples as u128 * 1_000_000_000 / u128::from(self.sample_rate);
        Duration::from_nanos(nanos as u64)
    }
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            sample_rate: DEFAULT_SAMPLE_RATE,
            frame_samples: (DEFAULT_SAMPLE_RATE / 100) as usize,
        }
    }
}

/// One downsampled frame: arrival ordinal and peak absolute amplitude
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PeakFrame {
    pub index: usize,
    pub amplitude: f32,
}

/// Streaming peak detector for a single capture session
///
/// Owned exclusively by the sample delivery path while recording; consumed by
/// [`EnvelopeExtractor::finish`] once the source has stopped.
#[derive(Debug)]
pub struct EnvelopeExtractor {
    config: FrameConfig,
    accumulator: f32,
    count: usize,
    peaks: Vec<f32>,
    max: f32,
    min: f32,
}

impl EnvelopeExtractor {
    pub fn new(config: FrameConfig) -> Self {
        Self {
            config,
            accumulator: 0.0,
            count: 0,
            peaks: Vec::with_capacity(INITIAL_FRAME_CAPACITY),
            max: 0.0,
            min: f32::INFINITY,
        }
    }

    /// Feed one sample
    #[inline]
    pub fn push(&mut self, sample: f32) {
        // NaN/inf from a misbehaving driver would poison the running extrema
        let amplitude = if sample.is_finite() { sample.abs() } else { 0.0 };
        self.accumulator = self.accumulator.max(amplitude);
        self.count += 1;

        if self.count >= self.config.frame_samples {
            self.close_frame();
        }
    }

    /// Feed a burst of samples in arrival order
    pub fn push_slice(&mut self, samples: &[f32]) {
        for &sample in samples {
            self.push(sample);
        }
    }

    fn close_frame(&mut self) {
        let peak = self.accumulator;
        self.peaks.push(peak);
        self.max = self.max.max(peak);
        self.min = self.min.min(peak);
        self.accumulator = 0.0;
        self.count = 0;
    }

    pub fn frame_count(&self) -> usize {
        self.peaks.len()
    }

    /// Samples accumulated toward the next, still incomplete, frame
    pub fn pending_samples(&self) -> usize {
        self.count
    }

    pub fn config(&self) -> FrameConfig {
        self.config
    }

    /// Close the session; samples that did not complete a frame are dropped
    pub fn finish(self) -> Envelope {
        Envelope {
            config: self.config,
            peaks: self.peaks,
            max: self.max,
            min: self.min,
        }
    }
}

/// Finalized peak sequence of one capture session
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    config: FrameConfig,
    peaks: Vec<f32>,
    max: f32,
    min: f32,
}

impl Envelope {
    /// Build an envelope from an already downsampled peak sequence
    pub fn from_peaks(config: FrameConfig, peaks: Vec<f32>) -> Self {
        let max = peaks.iter().copied().fold(0.0_f32, f32::max);
        let min = peaks.iter().copied().fold(f32::INFINITY, f32::min);
        Self {
            config,
            peaks,
            max,
            min,
        }
    }

    pub fn peaks(&self) -> &[f32] {
        &self.peaks
    }

    pub fn frames(&self) -> impl Iterator<Item = PeakFrame> + '_ {
        self.peaks
            .iter()
            .enumerate()
            .map(|(index, &amplitude)| PeakFrame { index, amplitude })
    }

    pub fn len(&self) -> usize {
        self.peaks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peaks.is_empty()
    }

    pub fn config(&self) -> FrameConfig {
        self.config
    }

    pub fn frame_duration(&self) -> Duration {
        self.config.frame_duration()
    }

    /// Largest peak, `None` for an empty envelope
    pub fn max(&self) -> Option<f32> {
        (!self.is_empty()).then_some(self.max)
    }

    /// Smallest peak, `None` for an empty envelope
    pub fn min(&self) -> Option<f32> {
        (!self.is_empty()).then_some(self.min)
    }

    /// Raw running extrema as tracked by the extractor (min starts at +inf)
    pub fn bounds(&self) -> (f32, f32) {
        (self.min, self.max)
    }

    /// Audio time covered by the complete frames
    pub fn captured_duration(&self) -> Duration {
        self.frame_duration()
            .saturating_mul(u32::try_from(self.peaks.len()).unwrap_or(u32::MAX))
    }

    /// Peaks rescaled to [0, 1]; `None` when empty or without dynamic range
    pub fn normalized(&self) -> Option<impl Iterator<Item = f32> + '_> {
        let range = self.max - self.min;
        if self.is_empty() || !range.is_finite() || range <= 0.0 {
            return None;
        }
        let min = self.min;
        Some(self.peaks.iter().map(move |&p| (p - min) / range))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn ten_sample_frames() -> FrameConfig {
        FrameConfig::with_frame_samples(1000, 10).unwrap()
    }

    #[test]
    fn test_default_frame_is_ten_milliseconds() {
        let config = FrameConfig::default();
        assert_eq!(config.frame_samples(), 480);
        assert_eq!(config.frame_duration(), Duration::from_millis(10));
        assert_eq!(
            FrameConfig::new(DEFAULT_SAMPLE_RATE, DEFAULT_FRAME_DURATION).unwrap(),
            config
        );
    }

    #[test]
    fn test_invalid_frame_geometry_is_rejected() {
        assert_eq!(
            FrameConfig::new(0, DEFAULT_FRAME_DURATION),
            Err(EnvelopeError::ZeroSampleRate)
        );
        assert_eq!(
            FrameConfig::with_frame_samples(48_000, 0),
            Err(EnvelopeError::ZeroFrameSize)
        );
        assert!(matches!(
            FrameConfig::new(8_000, Duration::from_micros(50)),
            Err(EnvelopeError::FrameTooShort { .. })
        ));
    }

    #[test]
    fn test_exactly_one_frame() {
        let mut extractor = EnvelopeExtractor::new(ten_sample_frames());
        for i in 0..10 {
            extractor.push(if i == 4 { -0.8 } else { 0.1 });
        }
        assert_eq!(extractor.frame_count(), 1);
        assert_eq!(extractor.pending_samples(), 0);

        let envelope = extractor.finish();
        assert_eq!(envelope.peaks(), &[0.8]);
        assert_eq!(envelope.max(), Some(0.8));
        assert_eq!(envelope.min(), Some(0.8));
    }

    #[test]
    fn test_trailing_samples_are_dropped() {
        let mut extractor = EnvelopeExtractor::new(ten_sample_frames());
        extractor.push_slice(&[0.5; 25]);
        assert_eq!(extractor.frame_count(), 2);
        assert_eq!(extractor.pending_samples(), 5);
        assert_eq!(extractor.finish().len(), 2);
    }

    #[test]
    fn test_accumulator_resets_between_frames() {
        let mut extractor = EnvelopeExtractor::new(ten_sample_frames());
        extractor.push_slice(&[0.9; 10]);
        extractor.push_slice(&[0.2; 10]);
        let envelope = extractor.finish();
        assert_eq!(envelope.peaks(), &[0.9, 0.2]);
        assert_eq!(envelope.bounds(), (0.2, 0.9));
    }

    #[test]
    fn test_empty_session_has_no_extrema() {
        let envelope = EnvelopeExtractor::new(ten_sample_frames()).finish();
        assert!(envelope.is_empty());
        assert_eq!(envelope.max(), None);
        assert_eq!(envelope.min(), None);
        assert_eq!(envelope.bounds().0, f32::INFINITY);
        assert_eq!(envelope.captured_duration(), Duration::ZERO);
    }

    #[test]
    fn test_non_finite_samples_count_as_silence() {
        let mut extractor = EnvelopeExtractor::new(ten_sample_frames());
        extractor.push(f32::NAN);
        extractor.push(f32::INFINITY);
        extractor.push_slice(&[0.25; 8]);
        assert_eq!(extractor.finish().peaks(), &[0.25]);
    }

    #[test]
    fn test_burst_sizes_do_not_change_output() {
        let samples: Vec<f32> = (0..10).map(|i| i as f32 / 10.0 - 0.5).collect();

        let mut whole = EnvelopeExtractor::new(ten_sample_frames());
        whole.push_slice(&samples);

        let mut bursts = EnvelopeExtractor::new(ten_sample_frames());
        bursts.push_slice(&samples[..3]);
        bursts.push_slice(&samples[3..8]);
        bursts.push_slice(&samples[8..]);

        assert_eq!(whole.frame_count(), 1);
        assert_eq!(whole.finish(), bursts.finish());
    }

    #[test]
    fn test_flat_envelope_does_not_normalize() {
        let envelope = Envelope::from_peaks(ten_sample_frames(), vec![5.0; 4]);
        assert!(envelope.normalized().is_none());
    }

    proptest! {
        #[test]
        fn prop_chunking_is_bit_identical(
            samples in prop::collection::vec(-1.0f32..=1.0, 0..400),
            cuts in prop::collection::vec(1usize..37, 1..20),
        ) {
            let config = FrameConfig::with_frame_samples(1000, 10).unwrap();

            let mut reference = EnvelopeExtractor::new(config);
            reference.push_slice(&samples);

            let mut chunked = EnvelopeExtractor::new(config);
            let mut rest = samples.as_slice();
            for cut in cuts.iter().cycle() {
                if rest.is_empty() {
                    break;
                }
                let (head, tail) = rest.split_at((*cut).min(rest.len()));
                chunked.push_slice(head);
                rest = tail;
            }

            let reference = reference.finish();
            let chunked = chunked.finish();
            prop_assert_eq!(reference.len(), samples.len() / 10);
            let reference_bits: Vec<u32> = reference.peaks().iter().map(|p| p.to_bits()).collect();
            let chunked_bits: Vec<u32> = chunked.peaks().iter().map(|p| p.to_bits()).collect();
            prop_assert_eq!(reference_bits, chunked_bits);
        }

        #[test]
        fn prop_normalized_values_stay_in_unit_range(
            peaks in prop::collection::vec(0.0f32..=1.0, 1..200),
        ) {
            let envelope = Envelope::from_peaks(FrameConfig::default(), peaks);
            if let Some(normalized) = envelope.normalized() {
                for value in normalized {
                    prop_assert!((0.0..=1.0).contains(&value), "out of range: {}", value);
                }
            } else {
                prop_assert_eq!(envelope.max(), envelope.min());
            }
        }
    }
}
