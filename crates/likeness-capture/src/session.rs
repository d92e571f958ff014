//! Capture session controller for one registration attempt.
//!
//! State machine: `Idle → Recording → Stopping → Stopped`, with `reset`
//! returning to `Recording` so a rejected sample can be retaken on the same
//! device.

use crate::device::{CaptureError, MediaDevice};
use crate::frame::{StillFrame, VideoArtifact};
use crate::recorder::RecorderHandle;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordingState {
    Idle,
    Recording,
    Stopping,
    Stopped,
}

/// Where a session's video ended up in object storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadedVideo {
    pub video_id: Uuid,
    pub url: String,
}

pub struct CaptureSession {
    id: Uuid,
    identity_id: String,
    device: Box<dyn MediaDevice>,
    state: RecordingState,
    recorder: Option<RecorderHandle>,
    still: Option<StillFrame>,
    video: Option<VideoArtifact>,
    uploads: HashMap<Uuid, String>,
    started_at: DateTime<Utc>,
    max_video_bytes: usize,
}

impl CaptureSession {
    /// Open a session on `device` and start recording immediately.
    pub fn open(
        identity_id: impl Into<String>,
        device: Box<dyn MediaDevice>,
        max_video_bytes: usize,
    ) -> Result<Self, CaptureError> {
        let mut session = Self {
            id: Uuid::new_v4(),
            identity_id: identity_id.into(),
            device,
            state: RecordingState::Idle,
            recorder: None,
            still: None,
            video: None,
            uploads: HashMap::new(),
            started_at: Utc::now(),
            max_video_bytes,
        };
        session.start_recording()?;
        tracing::info!(session = %session.id, identity = %session.identity_id, "capture session opened");
        Ok(session)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn identity_id(&self) -> &str {
        &self.identity_id
    }

    pub fn state(&self) -> RecordingState {
        self.state
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn still(&self) -> Option<&StillFrame> {
        self.still.as_ref()
    }

    /// The most recent flushed recording.
    pub fn video(&self) -> Option<&VideoArtifact> {
        self.video.as_ref()
    }

    fn start_recording(&mut self) -> Result<(), CaptureError> {
        let stream = self.device.open_stream()?;
        self.recorder = Some(RecorderHandle::start(
            stream,
            self.device.mime_type(),
            self.max_video_bytes,
        ));
        self.state = RecordingState::Recording;
        Ok(())
    }

    /// Stop the active recording and wait until it is fully flushed. A lost
    /// recorder is logged and treated as no recording.
    pub async fn stop_recording(&mut self) -> Option<&VideoArtifact> {
        if let Some(recorder) = self.recorder.take() {
            self.state = RecordingState::Stopping;
            match recorder.stop().await {
                Ok(artifact) if artifact.is_empty() => {
                    tracing::debug!(session = %self.id, "recording produced no data");
                }
                Ok(artifact) => self.video = Some(artifact),
                Err(e) => tracing::warn!(session = %self.id, error = %e, "recording abandoned"),
            }
            self.state = RecordingState::Stopped;
        }
        self.video.as_ref()
    }

    /// Capture the still frame. Any active recording is stopped and flushed
    /// first so the frame and the video cover the same moment.
    pub async fn capture_still(&mut self) -> Result<StillFrame, CaptureError> {
        self.stop_recording().await;
        let frame = self.device.capture_still().await?;
        tracing::debug!(session = %self.id, size = frame.data.len(), "still captured");
        self.still = Some(frame.clone());
        Ok(frame)
    }

    /// Discard the still frame and resume recording for a retake.
    ///
    /// The previous recording stays available through [`Self::video`] until
    /// the next one is flushed, and its upload record is kept.
    pub fn reset(&mut self) -> Result<(), CaptureError> {
        self.still = None;
        if self.recorder.is_none() {
            self.start_recording()?;
        }
        tracing::info!(session = %self.id, "capture session reset");
        Ok(())
    }

    pub fn mark_uploaded(&mut self, video_id: Uuid, url: impl Into<String>) {
        self.uploads.insert(video_id, url.into());
    }

    pub fn uploaded(&self, video_id: Uuid) -> Option<UploadedVideo> {
        self.uploads.get(&video_id).map(|url| UploadedVideo {
            video_id,
            url: url.clone(),
        })
    }

    /// Close the session without completing capture. Returns the recording
    /// if it has not been uploaded yet, so the caller can keep it as partial
    /// evidence.
    pub async fn abandon(mut self) -> Option<VideoArtifact> {
        self.stop_recording().await;
        tracing::info!(session = %self.id, identity = %self.identity_id, "capture session abandoned");
        let video = self.video.take()?;
        if self.uploads.contains_key(&video.id) {
            return None;
        }
        Some(video)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::ReplayDevice;
    use crate::recorder::DEFAULT_MAX_VIDEO_BYTES;

    fn open() -> (CaptureSession, crate::device::ReplayFeed) {
        let (device, feed) = ReplayDevice::new("video/webm");
        let session = CaptureSession::open("alice", Box::new(device), DEFAULT_MAX_VIDEO_BYTES).unwrap();
        (session, feed)
    }

    #[tokio::test]
    async fn test_open_starts_recording() {
        let (session, _feed) = open();
        assert_eq!(session.state(), RecordingState::Recording);
        assert!(session.still().is_none());
        assert!(session.video().is_none());
    }

    #[tokio::test]
    async fn test_still_waits_for_flushed_video() {
        let (mut session, feed) = open();
        feed.push_clip(&[1, 2, 3, 4, 5], 2);
        feed.set_still(StillFrame::new(vec![0xFFu8, 0xD8], None));

        let frame = session.capture_still().await.unwrap();
        assert_eq!(&*frame.data, &[0xFF, 0xD8]);
        assert_eq!(session.state(), RecordingState::Stopped);
        let video = session.video().unwrap();
        assert_eq!(video.data, vec![1, 2, 3, 4, 5]);
        assert_eq!(video.chunk_count, 3);
        assert!(video.stopped_at <= frame.captured_at);
    }

    #[tokio::test]
    async fn test_still_without_recording_proceeds() {
        let (mut session, feed) = open();
        session.stop_recording().await;
        assert_eq!(session.state(), RecordingState::Stopped);
        assert!(session.video().is_none());

        feed.set_still(StillFrame::new(vec![1u8], None));
        assert!(session.capture_still().await.is_ok());
    }

    #[tokio::test]
    async fn test_reset_resumes_recording() {
        let (mut session, feed) = open();
        feed.push_chunk(vec![1]);
        feed.set_still(StillFrame::new(vec![1u8], None));
        session.capture_still().await.unwrap();
        let first = session.video().unwrap().id;

        session.reset().unwrap();
        assert_eq!(session.state(), RecordingState::Recording);
        assert!(session.still().is_none());
        assert_eq!(session.video().unwrap().id, first);

        feed.push_chunk(vec![2]);
        session.stop_recording().await;
        assert_ne!(session.video().unwrap().id, first);
        assert_eq!(session.video().unwrap().data, vec![2]);
    }

    #[tokio::test]
    async fn test_abandon_returns_unuploaded_recording() {
        let (session, feed) = open();
        feed.push_chunk(vec![4, 2]);
        let video = session.abandon().await.unwrap();
        assert_eq!(video.data, vec![4, 2]);
    }

    #[tokio::test]
    async fn test_abandon_skips_uploaded_recording() {
        let (mut session, feed) = open();
        feed.push_chunk(vec![4, 2]);
        let id = session.stop_recording().await.unwrap().id;
        session.mark_uploaded(id, "memory://v");
        assert_eq!(session.uploaded(id).unwrap().url, "memory://v");
        assert!(session.abandon().await.is_none());
    }

    #[tokio::test]
    async fn test_failed_still_keeps_session_usable() {
        let (mut session, feed) = open();
        assert!(session.capture_still().await.is_err());
        session.reset().unwrap();
        feed.set_still(StillFrame::new(vec![1u8], None));
        assert!(session.capture_still().await.is_ok());
    }
}
