//! Seam to the external face-recognition provider.
//!
//! The provider owns detection, indexing and similarity search. This crate
//! only sequences calls and interprets results.

use crate::types::{FaceAttributes, PHOTO_EXTERNAL_PREFIX};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Fixed similarity threshold (0–100) for historical matching and ad hoc
/// search. No per-request override.
pub const FACE_MATCH_THRESHOLD: f32 = 80.0;

/// Upper bound on candidates returned by one similarity search.
pub const MAX_SEARCH_RESULTS: u32 = 1000;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProviderError {
    /// The provider call failed; the message is the provider's own.
    #[error("{0}")]
    Call(String),
    #[error("provider returned malformed response: {0}")]
    Malformed(String),
}

/// Outcome of an indexing call that indexed a face.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexedFace {
    pub face_id: String,
    pub attributes: FaceAttributes,
}

/// One similarity-search candidate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimilarityHit {
    /// External identity the face was indexed under, when present.
    pub identity_id: Option<String>,
    pub face_id: String,
    pub similarity: f32,
}

impl SimilarityHit {
    /// The photo this face was indexed from, for photo faces.
    pub fn photo_id(&self) -> Option<&str> {
        self.identity_id
            .as_deref()
            .and_then(|id| id.strip_prefix(PHOTO_EXTERNAL_PREFIX))
    }
}

/// External id under which faces of `photo_id` are indexed.
pub fn photo_external_id(photo_id: &str) -> String {
    format!("{PHOTO_EXTERNAL_PREFIX}{photo_id}")
}

#[async_trait]
pub trait RecognitionProvider: Send + Sync {
    /// Detect every face in an image.
    async fn detect_faces(&self, image: Vec<u8>) -> Result<Vec<FaceAttributes>, ProviderError>;

    /// Index at most one face from `image` under `identity_id`. `Ok(None)`
    /// when the provider indexed nothing.
    async fn index_face(
        &self,
        image: Vec<u8>,
        identity_id: &str,
    ) -> Result<Option<IndexedFace>, ProviderError>;

    /// Index every face in a group photo under `external_id`.
    async fn index_photo_faces(
        &self,
        image: Vec<u8>,
        external_id: &str,
    ) -> Result<Vec<IndexedFace>, ProviderError>;

    /// Remove an indexed face from the collection.
    async fn delete_face(&self, face_id: &str) -> Result<(), ProviderError>;

    /// Faces in the collection similar to an already indexed face.
    async fn search_by_similarity(
        &self,
        face_id: &str,
        threshold: f32,
        max_results: u32,
    ) -> Result<Vec<SimilarityHit>, ProviderError>;

    /// Faces in the collection similar to the largest face in `image`.
    async fn search_by_image(
        &self,
        image: Vec<u8>,
        threshold: f32,
        max_results: u32,
    ) -> Result<Vec<SimilarityHit>, ProviderError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_photo_hit_is_recognised() {
        let hit = SimilarityHit {
            identity_id: Some(photo_external_id("p-7")),
            face_id: "f".into(),
            similarity: 90.0,
        };
        assert_eq!(hit.photo_id(), Some("p-7"));

        let person = SimilarityHit {
            identity_id: Some("alice".into()),
            ..hit
        };
        assert_eq!(person.photo_id(), None);
    }
}
