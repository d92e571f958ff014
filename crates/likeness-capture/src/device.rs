//! Media device seam and the replay device used by the daemon.

use crate::frame::StillFrame;
use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("media device unavailable: {0}")]
    DeviceUnavailable(String),
    #[error("still capture failed: {0}")]
    StillFailed(String),
    #[error("recorder exited before flushing")]
    RecorderLost,
}

/// A camera-like device: a continuous chunk stream plus single-frame capture.
///
/// The device is owned by exactly one [`CaptureSession`](crate::CaptureSession).
#[async_trait]
pub trait MediaDevice: Send {
    /// Open a fresh chunk stream. Called once per recording.
    fn open_stream(&mut self) -> Result<mpsc::UnboundedReceiver<Vec<u8>>, CaptureError>;

    async fn capture_still(&mut self) -> Result<StillFrame, CaptureError>;

    /// MIME type of the recorded chunks.
    fn mime_type(&self) -> String;
}

#[derive(Default)]
struct ReplayShared {
    stream: Option<mpsc::UnboundedSender<Vec<u8>>>,
    still: Option<StillFrame>,
}

fn lock(shared: &Mutex<ReplayShared>) -> std::sync::MutexGuard<'_, ReplayShared> {
    shared.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Media device fed from outside the process: chunks and stills are pushed
/// through a [`ReplayFeed`] (for example, a clip and a photo received over
/// IPC).
pub struct ReplayDevice {
    shared: Arc<Mutex<ReplayShared>>,
    mime_type: String,
}

/// Producer side of a [`ReplayDevice`].
#[derive(Clone)]
pub struct ReplayFeed {
    shared: Arc<Mutex<ReplayShared>>,
}

impl ReplayDevice {
    pub fn new(mime_type: impl Into<String>) -> (Self, ReplayFeed) {
        let shared = Arc::new(Mutex::new(ReplayShared::default()));
        let device = Self {
            shared: shared.clone(),
            mime_type: mime_type.into(),
        };
        (device, ReplayFeed { shared })
    }
}

impl ReplayFeed {
    /// Push a chunk into the active recording. Returns `false` when no
    /// recording is listening.
    pub fn push_chunk(&self, chunk: Vec<u8>) -> bool {
        match &lock(&self.shared).stream {
            Some(tx) => tx.send(chunk).is_ok(),
            None => false,
        }
    }

    /// Push a whole clip split into `chunk_size` pieces.
    pub fn push_clip(&self, clip: &[u8], chunk_size: usize) -> usize {
        clip.chunks(chunk_size.max(1))
            .filter(|c| self.push_chunk(c.to_vec()))
            .count()
    }

    /// Frame returned by the next still capture.
    pub fn set_still(&self, frame: StillFrame) {
        lock(&self.shared).still = Some(frame);
    }
}

#[async_trait]
impl MediaDevice for ReplayDevice {
    fn open_stream(&mut self) -> Result<mpsc::UnboundedReceiver<Vec<u8>>, CaptureError> {
        let (tx, rx) = mpsc::unbounded_channel();
        // Replacing the sender closes the previous recording's stream.
        lock(&self.shared).stream = Some(tx);
        Ok(rx)
    }

    async fn capture_still(&mut self) -> Result<StillFrame, CaptureError> {
        lock(&self.shared)
            .still
            .take()
            .ok_or_else(|| CaptureError::StillFailed("no frame available".into()))
    }

    fn mime_type(&self) -> String {
        self.mime_type.clone()
    }
}
