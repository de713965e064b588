//! Audio sources feeding capture sessions
//!
//! A source owns the delivery path for one session at a time: it receives a
//! [`SessionRecorder`] on start, pushes mono samples into it from whatever thread
//! the platform delivers on, and returns it through a one-shot [`StopSignal`] once
//! delivery has fully ceased.

mod recorder;
mod wav;

pub use recorder::{AudioDeviceInfo, CpalSource};
pub use wav::{WavFileSource, WavRecording};

use crate::capture::SessionRecorder;
use anyhow::Result;
use tokio::sync::oneshot;

/// One-shot stop confirmation carrying the session's sink back to its owner
///
/// Receive it from synchronous code only (`blocking_recv`).
pub type StopSignal = oneshot::Receiver<SessionRecorder>;

/// Upstream provider of a mono sample stream at a fixed rate
pub trait AudioSource {
    /// Native sample rate of the delivered stream, in Hz
    fn sample_rate(&self) -> u32;

    /// Begin delivering samples into `recorder`
    fn start(&mut self, recorder: SessionRecorder) -> Result<()>;

    /// Request the stream to stop
    ///
    /// The returned signal resolves with the recorder once no further samples
    /// will be delivered.
    fn stop(&mut self) -> Result<StopSignal>;
}

/// Hand a recorder back through an already-resolved stop signal
pub(crate) fn confirm_stop(recorder: SessionRecorder) -> StopSignal {
    let (tx, rx) = oneshot::channel();
    // The receiver is still held here, so the send cannot fail
    let _ = tx.send(recorder);
    rx
}

/// Fold interleaved frames to their first channel
pub(crate) fn first_channel(interleaved: &[f32], channels: usize, mono: &mut Vec<f32>) {
    mono.clear();
    mono.extend(interleaved.chunks_exact(channels.max(1)).map(|frame| frame[0]));
}
