//! Face indexing client: stores the image, submits the sample to the
//! provider, and records the resulting [`FaceRecord`].
//!
//! The image goes to object storage before the provider call, so a storage
//! outage never leaves an indexed face behind. A face whose record cannot be
//! written is deleted from the provider again.

use crate::binary::{Degenerate, NormalizedBinary};
use crate::persistence::Persistence;
use crate::provider::{photo_external_id, ProviderError, RecognitionProvider};
use crate::store::{ObjectStore, StoreError};
use crate::types::{is_valid_identity, is_valid_photo_id, FailureKind, FaceRecord, PhotoRecord};
use chrono::Utc;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum IndexError {
    #[error("invalid identity id {0:?}")]
    InvalidIdentity(String),
    #[error("image unusable: {0}")]
    Degenerate(Degenerate),
    #[error("{0}")]
    Provider(#[from] ProviderError),
    #[error("no face indexed")]
    NoFaceIndexed,
    #[error("{0}")]
    Storage(#[from] StoreError),
}

impl IndexError {
    pub fn kind(&self) -> FailureKind {
        match self {
            IndexError::InvalidIdentity(_) => FailureKind::InvalidIdentity,
            IndexError::Degenerate(_) => FailureKind::InvalidImage,
            IndexError::Provider(_) => FailureKind::Provider,
            IndexError::NoFaceIndexed => FailureKind::NoFaceIndexed,
            IndexError::Storage(_) => FailureKind::Storage,
        }
    }
}

pub struct FaceIndexer {
    provider: Arc<dyn RecognitionProvider>,
    objects: Arc<dyn ObjectStore>,
    persistence: Arc<Persistence>,
}

impl FaceIndexer {
    pub fn new(
        provider: Arc<dyn RecognitionProvider>,
        objects: Arc<dyn ObjectStore>,
        persistence: Arc<Persistence>,
    ) -> Self {
        Self {
            provider,
            objects,
            persistence,
        }
    }

    /// Index one face from `image` under `identity_id`.
    ///
    /// The provider call is the authoritative face check: a response with no
    /// indexed face is [`IndexError::NoFaceIndexed`] even if validation
    /// passed. On success a new [`FaceRecord`] is persisted.
    pub async fn index(
        &self,
        image: &NormalizedBinary,
        identity_id: &str,
    ) -> Result<FaceRecord, IndexError> {
        if !is_valid_identity(identity_id) {
            return Err(IndexError::InvalidIdentity(identity_id.to_string()));
        }
        if let Some(reason) = image.degenerate {
            return Err(IndexError::Degenerate(reason));
        }

        let indexed_at = Utc::now();
        let key = format!(
            "faces/{identity_id}/{}.{}",
            indexed_at.timestamp_millis(),
            image.extension()
        );
        let image_url = self
            .objects
            .put(&key, image.copy_bytes(), &image.content_type)
            .await?;
        tracing::debug!(identity = identity_id, key, "face image stored");

        let indexed = self
            .provider
            .index_face(image.copy_bytes(), identity_id)
            .await?
            .ok_or(IndexError::NoFaceIndexed)?;

        tracing::info!(
            identity = identity_id,
            face_id = %indexed.face_id,
            confidence = indexed.attributes.confidence,
            "face indexed"
        );

        let record = FaceRecord {
            identity_id: identity_id.to_string(),
            face_id: indexed.face_id,
            attributes: indexed.attributes,
            indexed_at,
            image_url: Some(image_url),
        };
        if let Err(e) = self.persistence.save_face(&record).await {
            self.forget(&record.face_id).await;
            return Err(e.into());
        }

        Ok(record)
    }

    /// Index every face of a group photo under `photo:<photo_id>` and store
    /// the photo record. A photo without any indexable face is still stored,
    /// with no face ids.
    pub async fn index_photo(
        &self,
        image: &NormalizedBinary,
        photo_id: &str,
    ) -> Result<PhotoRecord, IndexError> {
        if !is_valid_photo_id(photo_id) {
            return Err(StoreError::InvalidPhoto(photo_id.to_string()).into());
        }
        if let Some(reason) = image.degenerate {
            return Err(IndexError::Degenerate(reason));
        }

        let key = format!("photos/{photo_id}.{}", image.extension());
        let image_url = self
            .objects
            .put(&key, image.copy_bytes(), &image.content_type)
            .await?;

        let faces = self
            .provider
            .index_photo_faces(image.copy_bytes(), &photo_external_id(photo_id))
            .await?;
        tracing::info!(photo_id, faces = faces.len(), "photo indexed");

        let now = Utc::now();
        let record = PhotoRecord {
            photo_id: photo_id.to_string(),
            image_url: Some(image_url),
            face_ids: faces.into_iter().map(|f| f.face_id).collect(),
            matched_users: Vec::new(),
            indexed_at: now,
            updated_at: now,
        };
        if let Err(e) = self.persistence.save_photo(&record).await {
            for face_id in &record.face_ids {
                self.forget(face_id).await;
            }
            return Err(e.into());
        }
        Ok(record)
    }

    /// Best-effort removal of a face whose record could not be written.
    async fn forget(&self, face_id: &str) {
        match self.provider.delete_face(face_id).await {
            Ok(()) => tracing::info!(face_id, "unrecorded face removed from provider"),
            Err(e) => tracing::error!(face_id, error = %e, "unrecorded face left in provider"),
        }
    }
}
