//! Background sound-level monitoring
//!
//! A [`LevelSampler`] polls a [`LevelDevice`] from a dedicated worker thread while
//! a trial runs. The worker owns the run's buffer and hands it back through its
//! join handle, so samples reach the caller only after the loop has exited.

mod hid;

pub use hid::{DEFAULT_PRODUCT_ID, DEFAULT_VENDOR_ID, HidMeter, decode_report};

use jiff::Timestamp;
use std::fmt;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, trace, warn};

/// Polling cadence of the sound-level meter
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// One timestamped ambient level reading, in decibels
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LevelSample {
    pub timestamp: Timestamp,
    pub level: f64,
}

/// Outcome of a single device read that produced no sample
#[derive(Error, Debug)]
pub enum ReadError {
    #[error("Level device is not connected")]
    Disconnected,
    #[error("Short report from level device ({0} bytes)")]
    ShortReport(usize),
    #[error("Level device reported an invalid timestamp ({0})")]
    Timestamp(u32),
    #[error("No report available")]
    NoReport,
    #[error("Unexpected report id {0:#04x}")]
    UnexpectedReport(u8),
    #[error("Level device I/O error: {0}")]
    Io(#[from] io::Error),
}

/// External device reporting ambient sound levels
pub trait LevelDevice: Send + Sync + 'static {
    /// Take one reading without blocking for longer than a report period
    fn read(&self) -> Result<LevelSample, ReadError>;

    fn is_connected(&self) -> bool {
        true
    }
}

/// Monitor error types
#[derive(Error, Debug)]
pub enum MeterError {
    #[error("Poll interval must be greater than zero")]
    ZeroInterval,
    #[error("Failed to spawn level monitor thread: {0}")]
    Spawn(#[source] io::Error),
}

/// Aggregate statistics over one monitor run
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LevelSummary {
    pub max: f64,
    pub average: f64,
    pub min: f64,
    pub samples: usize,
}

impl LevelSummary {
    /// Summarize a run, or `None` when it holds no samples
    pub fn from_samples(samples: &[LevelSample]) -> Option<Self> {
        if samples.is_empty() {
            return None;
        }

        let mut max = f64::NEG_INFINITY;
        let mut min = f64::INFINITY;
        let mut sum = 0.0;
        for sample in samples {
            max = max.max(sample.level);
            min = min.min(sample.level);
            sum += sample.level;
        }

        Some(Self {
            max,
            average: sum / samples.len() as f64,
            min,
            samples: samples.len(),
        })
    }
}

impl fmt::Display for LevelSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "max {:.1} dB, avg {:.1} dB, min {:.1} dB ({} samples)",
            self.max, self.average, self.min, self.samples
        )
    }
}

/// Samples collected between one start and end of the monitor
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MonitorRun {
    samples: Vec<LevelSample>,
}

impl MonitorRun {
    pub fn samples(&self) -> &[LevelSample] {
        &self.samples
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn summary(&self) -> Option<LevelSummary> {
        LevelSummary::from_samples(&self.samples)
    }

    pub fn into_samples(self) -> Vec<LevelSample> {
        self.samples
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorState {
    Idle,
    Running,
    Stopping,
}

struct Worker {
    handle: JoinHandle<Vec<LevelSample>>,
    stop: Arc<AtomicBool>,
}

/// Start/stop controller for the level polling loop
pub struct LevelSampler<D: LevelDevice> {
    device: Arc<D>,
    interval: Duration,
    state: MonitorState,
    worker: Option<Worker>,
}

impl<D: LevelDevice> LevelSampler<D> {
    pub fn new(device: D) -> Self {
        Self {
            device: Arc::new(device),
            interval: DEFAULT_POLL_INTERVAL,
            state: MonitorState::Idle,
            worker: None,
        }
    }

    pub fn with_interval(device: D, interval: Duration) -> Result<Self, MeterError> {
        if interval.is_zero() {
            return Err(MeterError::ZeroInterval);
        }
        Ok(Self {
            device: Arc::new(device),
            interval,
            state: MonitorState::Idle,
            worker: None,
        })
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn state(&self) -> MonitorState {
        self.state
    }

    /// Begin a fresh monitor run
    ///
    /// A run already in progress is stopped and joined first; its samples are
    /// discarded.
    pub fn start_monitor(&mut self) -> Result<(), MeterError> {
        if let Some(previous) = self.finish_run() {
            info!(
                discarded = previous.samples.len(),
                "level monitor restarted"
            );
        }

        if !self.device.is_connected() {
            warn!("Level device not connected; monitor will record no data");
        }

        let stop = Arc::new(AtomicBool::new(false));
        let handle = thread::Builder::new()
            .name("level-monitor".to_string())
            .spawn({
                let device = Arc::clone(&self.device);
                let stop = Arc::clone(&stop);
                let interval = self.interval;
                move || poll_loop(device.as_ref(), interval, &stop)
            })
            .map_err(MeterError::Spawn)?;

        self.worker = Some(Worker { handle, stop });
        self.state = MonitorState::Running;
        debug!(interval_ms = self.interval.as_millis() as u64, "level monitor started");
        Ok(())
    }

    /// Stop the loop and take ownership of its run
    ///
    /// Returns `None` when no run was active.
    pub fn finish_run(&mut self) -> Option<MonitorRun> {
        let worker = self.worker.take()?;

        self.state = MonitorState::Stopping;
        worker.stop.store(true, Ordering::Release);
        worker.handle.thread().unpark();

        let samples = match worker.handle.join() {
            Ok(samples) => samples,
            Err(_) => {
                warn!("Level monitor thread panicked; run discarded");
                Vec::new()
            }
        };
        self.state = MonitorState::Idle;

        debug!(samples = samples.len(), "level monitor stopped");
        Some(MonitorRun { samples })
    }

    /// Stop the loop and summarize its run
    ///
    /// Returns `None` when no run was active or the run recorded nothing.
    pub fn end_monitor(&mut self) -> Option<LevelSummary> {
        self.finish_run().and_then(|run| run.summary())
    }
}

impl<D: LevelDevice> Drop for LevelSampler<D> {
    fn drop(&mut self) {
        self.finish_run();
    }
}

fn poll_loop<D: LevelDevice + ?Sized>(
    device: &D,
    interval: Duration,
    stop: &AtomicBool,
) -> Vec<LevelSample> {
    let mut samples = Vec::new();
    while !stop.load(Ordering::Acquire) {
        match device.read() {
            Ok(sample) => samples.push(sample),
            Err(e) => trace!(error = %e, "level read skipped"),
        }
        if !wait_for_tick(interval, stop) {
            break;
        }
    }
    samples
}

/// Sleep one cadence, returning false as soon as a stop is requested
fn wait_for_tick(interval: Duration, stop: &AtomicBool) -> bool {
    let deadline = Instant::now() + interval;
    loop {
        if stop.load(Ordering::Acquire) {
            return false;
        }
        let now = Instant::now();
        if now >= deadline {
            return true;
        }
        thread::park_timeout(deadline - now);
    }
}
