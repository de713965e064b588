//! WAV persistence and replay
//!
//! [`WavRecording`] appends a session's raw samples to a 16-bit mono file while it
//! records. [`WavFileSource`] replays such a file through the capture pipeline for
//! offline re-analysis.

use super::{AudioSource, StopSignal, confirm_stop, first_channel};
use crate::capture::SessionRecorder;
use anyhow::{Context, Result, anyhow, bail};
use hound::{SampleFormat, WavReader, WavSpec, WavWriter};
use std::fmt;
use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver};
use std::thread::{self, JoinHandle};
use tracing::{debug, warn};

/// Frames handed to the recorder per replay burst
const REPLAY_CHUNK_FRAMES: usize = 1024;

/// Buffered raw sample sink for one capture session
pub struct WavRecording {
    path: PathBuf,
    writer: WavWriter<BufWriter<File>>,
    error: Option<hound::Error>,
}

impl WavRecording {
    /// Create a 16-bit PCM mono WAV file at `path`
    pub fn create<P: AsRef<Path>>(path: P, sample_rate: u32) -> Result<Self, hound::Error> {
        let spec = WavSpec {
            channels: 1,
            sample_rate,
            bits_per_sample: 16,
            sample_format: SampleFormat::Int,
        };
        let path = path.as_ref().to_path_buf();
        let writer = WavWriter::create(&path, spec)?;
        Ok(Self {
            path,
            writer,
            error: None,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append samples; after the first write error the rest of the session is skipped
    pub fn append(&mut self, samples: &[f32]) {
        if self.error.is_some() {
            return;
        }
        for &sample in samples {
            let sample_i16 = (sample.clamp(-1.0, 1.0) * i16::MAX as f32) as i16;
            if let Err(e) = self.writer.write_sample(sample_i16) {
                self.error = Some(e);
                return;
            }
        }
    }

    /// Flush the header and buffered samples
    pub fn finalize(self) -> Result<PathBuf, hound::Error> {
        if let Some(e) = self.error {
            return Err(e);
        }
        self.writer.finalize()?;
        Ok(self.path)
    }
}

impl fmt::Debug for WavRecording {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WavRecording")
            .field("path", &self.path)
            .field("failed", &self.error.is_some())
            .finish()
    }
}

/// Replays a recorded WAV file as if it were a live source
pub struct WavFileSource {
    path: PathBuf,
    spec: WavSpec,
    finished: Arc<AtomicBool>,
    playback: Option<Playback>,
}

struct Playback {
    handle: JoinHandle<SessionRecorder>,
    halt: Arc<AtomicBool>,
    /// Disconnects once the whole file has been delivered
    done: Receiver<()>,
}

impl WavFileSource {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let reader = WavReader::open(&path)
            .with_context(|| format!("Failed to open recording {}", path.display()))?;
        let spec = reader.spec();
        if spec.channels == 0 {
            bail!("Recording {} has no channels", path.display());
        }

        Ok(Self {
            path,
            spec,
            finished: Arc::new(AtomicBool::new(false)),
            playback: None,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn spec(&self) -> WavSpec {
        self.spec
    }

    /// Whether the whole file has been delivered
    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    /// Block until the current replay has delivered the whole file
    ///
    /// Returns immediately when no replay is running.
    pub fn wait_finished(&self) {
        if let Some(playback) = &self.playback {
            // Err only means the replay thread already dropped its sender
            let _ = playback.done.recv();
        }
    }
}

impl AudioSource for WavFileSource {
    fn sample_rate(&self) -> u32 {
        self.spec.sample_rate
    }

    fn start(&mut self, mut recorder: SessionRecorder) -> Result<()> {
        if self.playback.is_some() {
            bail!("Replay of {} is already running", self.path.display());
        }

        let reader = WavReader::open(&self.path)
            .with_context(|| format!("Failed to open recording {}", self.path.display()))?;
        let halt = Arc::new(AtomicBool::new(false));
        let (done_tx, done) = mpsc::channel();
        self.finished.store(false, Ordering::Release);

        let handle = thread::Builder::new()
            .name("wav-replay".to_string())
            .spawn({
                let halt = Arc::clone(&halt);
                let finished = Arc::clone(&self.finished);
                let path = self.path.clone();
                move || {
                    if let Err(e) = replay(reader, &mut recorder, &halt) {
                        warn!("Replay of {} stopped early: {}", path.display(), e);
                    }
                    finished.store(true, Ordering::Release);
                    drop(done_tx);
                    recorder
                }
            })
            .context("Failed to spawn replay thread")?;

        self.playback = Some(Playback { handle, halt, done });
        Ok(())
    }

    fn stop(&mut self) -> Result<StopSignal> {
        let Some(playback) = self.playback.take() else {
            bail!("Replay is not running");
        };

        playback.halt.store(true, Ordering::Release);
        let recorder = playback
            .handle
            .join()
            .map_err(|_| anyhow!("Replay thread panicked"))?;

        Ok(confirm_stop(recorder))
    }
}

fn replay<R: std::io::Read>(
    mut reader: WavReader<R>,
    recorder: &mut SessionRecorder,
    halt: &AtomicBool,
) -> Result<(), hound::Error> {
    let spec = reader.spec();
    let channels = usize::from(spec.channels);
    let mut interleaved = Vec::with_capacity(REPLAY_CHUNK_FRAMES * channels);
    let mut mono = Vec::with_capacity(REPLAY_CHUNK_FRAMES);

    let mut delivered = 0usize;
    let mut deliver = |interleaved: &mut Vec<f32>| {
        first_channel(interleaved, channels, &mut mono);
        recorder.write_frames(&mono);
        delivered += mono.len();
        interleaved.clear();
    };

    match spec.sample_format {
        SampleFormat::Float => {
            for sample in reader.samples::<f32>() {
                interleaved.push(sample?);
                if interleaved.len() == REPLAY_CHUNK_FRAMES * channels {
                    deliver(&mut interleaved);
                    if halt.load(Ordering::Acquire) {
                        break;
                    }
                }
            }
        }
        SampleFormat::Int => {
            let scale = (1i64 << (spec.bits_per_sample.saturating_sub(1))) as f32;
            for sample in reader.samples::<i32>() {
                interleaved.push(sample? as f32 / scale);
                if interleaved.len() == REPLAY_CHUNK_FRAMES * channels {
                    deliver(&mut interleaved);
                    if halt.load(Ordering::Acquire) {
                        break;
                    }
                }
            }
        }
    }
    if !interleaved.is_empty() && !halt.load(Ordering::Acquire) {
        deliver(&mut interleaved);
    }

    debug!(samples = delivered, "replay finished");
    Ok(())
}
