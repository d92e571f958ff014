//! Capture artifacts: the still frame and the flushed video recording.

use chrono::{DateTime, Utc};
use likeness_core::binary::{BinaryInput, BlobHandle};
use likeness_core::normalize;
use std::sync::Arc;
use uuid::Uuid;

/// A single still frame taken from the media device.
#[derive(Debug, Clone)]
pub struct StillFrame {
    pub data: Arc<[u8]>,
    /// Content type reported by the device, if any.
    pub content_type: Option<String>,
    pub captured_at: DateTime<Utc>,
}

impl StillFrame {
    pub fn new(data: impl Into<Arc<[u8]>>, content_type: Option<String>) -> Self {
        Self {
            data: data.into(),
            content_type,
            captured_at: Utc::now(),
        }
    }

    /// Binary input sharing this frame's buffer.
    pub fn to_input(&self) -> BinaryInput {
        BinaryInput::Buffer(self.data.clone())
    }
}

/// One finished recording: every buffered chunk concatenated in arrival order.
#[derive(Debug, Clone)]
pub struct VideoArtifact {
    pub id: Uuid,
    pub mime_type: String,
    pub data: Vec<u8>,
    pub chunk_count: usize,
    pub started_at: DateTime<Utc>,
    pub stopped_at: DateTime<Utc>,
    /// Chunks arrived after the size cap and were dropped.
    pub truncated: bool,
}

impl VideoArtifact {
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Build an artifact from a clip recorded elsewhere (caller-supplied
    /// video). Content type comes from the blob handle or is sniffed.
    pub fn from_input(input: &BinaryInput) -> Option<Self> {
        let normalized = normalize(input);
        if normalized.is_degenerate() {
            return None;
        }
        let now = Utc::now();
        let mime_type = match input {
            BinaryInput::Blob(BlobHandle {
                content_type: Some(ct),
                ..
            }) => ct.clone(),
            _ => normalized.content_type.clone(),
        };
        Some(Self {
            id: Uuid::new_v4(),
            mime_type,
            data: normalized.into_bytes(),
            chunk_count: 1,
            started_at: now,
            stopped_at: now,
            truncated: false,
        })
    }
}
