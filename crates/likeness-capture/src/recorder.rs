//! Continuous recorder. A spawned task owns the chunk stream and resolves a
//! single oneshot exactly once, after every buffered chunk has been flushed
//! into the artifact.

use crate::device::CaptureError;
use crate::frame::VideoArtifact;
use chrono::Utc;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

/// Default cap on one recording (10 MiB).
pub const DEFAULT_MAX_VIDEO_BYTES: usize = 10 * 1024 * 1024;

/// Handle to a running recording.
pub struct RecorderHandle {
    stop: oneshot::Sender<()>,
    done: oneshot::Receiver<VideoArtifact>,
}

impl RecorderHandle {
    /// Start recording `stream` on a new task.
    pub fn start(
        stream: mpsc::UnboundedReceiver<Vec<u8>>,
        mime_type: String,
        max_bytes: usize,
    ) -> Self {
        let (stop_tx, stop_rx) = oneshot::channel();
        let (done_tx, done_rx) = oneshot::channel();
        tokio::spawn(record(stream, stop_rx, done_tx, mime_type, max_bytes));
        Self {
            stop: stop_tx,
            done: done_rx,
        }
    }

    /// Stop recording and wait for the flushed artifact.
    pub async fn stop(self) -> Result<VideoArtifact, CaptureError> {
        // The task may already have exited; the receiver below reports that.
        let _ = self.stop.send(());
        self.done.await.map_err(|_| CaptureError::RecorderLost)
    }
}

struct Buffer {
    data: Vec<u8>,
    chunks: usize,
    truncated: bool,
    max_bytes: usize,
}

impl Buffer {
    fn append(&mut self, chunk: Vec<u8>) {
        if self.truncated {
            return;
        }
        if chunk.is_empty() {
            tracing::debug!("empty chunk ignored");
            return;
        }
        let room = self.max_bytes - self.data.len();
        if chunk.len() > room {
            // Keep the contiguous prefix up to the cap; nothing after it.
            self.data.extend_from_slice(&chunk[..room]);
            if room > 0 {
                self.chunks += 1;
            }
            self.truncated = true;
            tracing::warn!(
                size = self.data.len(),
                max = self.max_bytes,
                "recording size cap reached; dropping further chunks"
            );
            return;
        }
        self.data.extend_from_slice(&chunk);
        self.chunks += 1;
    }
}

async fn record(
    mut stream: mpsc::UnboundedReceiver<Vec<u8>>,
    mut stop: oneshot::Receiver<()>,
    done: oneshot::Sender<VideoArtifact>,
    mime_type: String,
    max_bytes: usize,
) {
    let started_at = Utc::now();
    let mut buffer = Buffer {
        data: Vec::new(),
        chunks: 0,
        truncated: false,
        max_bytes,
    };
    let mut stream_open = true;

    tracing::debug!(mime_type = %mime_type, "recording started");
    loop {
        tokio::select! {
            // Stop requested, or the handle was dropped.
            _ = &mut stop => break,
            chunk = stream.recv(), if stream_open => match chunk {
                Some(chunk) => buffer.append(chunk),
                None => stream_open = false,
            },
        }
    }

    while let Ok(chunk) = stream.try_recv() {
        buffer.append(chunk);
    }

    let artifact = VideoArtifact {
        id: Uuid::new_v4(),
        mime_type,
        data: buffer.data,
        chunk_count: buffer.chunks,
        started_at,
        stopped_at: Utc::now(),
        truncated: buffer.truncated,
    };
    tracing::debug!(
        id = %artifact.id,
        size = artifact.len(),
        chunks = artifact.chunk_count,
        "recording flushed"
    );
    let _ = done.send(artifact);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_stop_flushes_buffered_chunks() {
        let (tx, rx) = mpsc::unbounded_channel();
        let recorder = RecorderHandle::start(rx, "video/webm".into(), 1024);
        tx.send(vec![1, 2]).unwrap();
        tx.send(vec![3]).unwrap();
        tx.send(Vec::new()).unwrap();

        let artifact = recorder.stop().await.unwrap();
        assert_eq!(artifact.data, vec![1, 2, 3]);
        assert_eq!(artifact.chunk_count, 2);
        assert_eq!(artifact.mime_type, "video/webm");
        assert!(!artifact.truncated);
    }

    #[tokio::test]
    async fn test_size_cap_truncates() {
        let (tx, rx) = mpsc::unbounded_channel();
        let recorder = RecorderHandle::start(rx, "video/webm".into(), 4);
        tx.send(vec![1, 1, 1]).unwrap();
        tx.send(vec![2, 2]).unwrap();
        tx.send(vec![3]).unwrap();

        let artifact = recorder.stop().await.unwrap();
        // Cut inside the second chunk; the third never follows it.
        assert_eq!(artifact.data, vec![1, 1, 1, 2]);
        assert_eq!(artifact.chunk_count, 2);
        assert!(artifact.truncated);
    }

    #[tokio::test]
    async fn test_oversized_first_chunk_keeps_prefix() {
        let (tx, rx) = mpsc::unbounded_channel();
        let recorder = RecorderHandle::start(rx, "video/webm".into(), 3);
        tx.send(vec![4, 4, 4, 4, 4]).unwrap();
        tx.send(vec![5]).unwrap();

        let artifact = recorder.stop().await.unwrap();
        assert_eq!(artifact.data, vec![4, 4, 4]);
        assert!(artifact.truncated);
        assert!(!artifact.is_empty());
    }

    #[tokio::test]
    async fn test_closed_stream_still_resolves_on_stop() {
        let (tx, rx) = mpsc::unbounded_channel();
        let recorder = RecorderHandle::start(rx, "video/mp4".into(), 1024);
        tx.send(vec![5]).unwrap();
        drop(tx);
        tokio::task::yield_now().await;

        let artifact = recorder.stop().await.unwrap();
        assert_eq!(artifact.data, vec![5]);
    }
}
