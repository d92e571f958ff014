//! AWS Rekognition implementation of [`RecognitionProvider`].
//!
//! Faces are indexed with the identity id as `ExternalImageId`, so search
//! hits carry the identity they belong to. Group photo faces carry
//! `photo:<id>` instead.

use crate::provider::{IndexedFace, ProviderError, RecognitionProvider, SimilarityHit};
use crate::types::{BoundingBox, FaceAttributes, Landmark, Pose, Quality};
use async_trait::async_trait;
use aws_sdk_rekognition::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_rekognition::primitives::Blob;
use aws_sdk_rekognition::types::{Attribute, FaceDetail, FaceMatch, Image, QualityFilter};
use aws_sdk_rekognition::Client;

pub struct RekognitionProvider {
    client: Client,
    collection_id: String,
}

impl RekognitionProvider {
    pub fn new(client: Client, collection_id: impl Into<String>) -> Self {
        Self {
            client,
            collection_id: collection_id.into(),
        }
    }

    pub fn collection_id(&self) -> &str {
        &self.collection_id
    }
}

fn image_of(bytes: Vec<u8>) -> Image {
    Image::builder().bytes(Blob::new(bytes)).build()
}

/// Surface the provider's own message when it sent one.
fn call_error<E>(err: SdkError<E>) -> ProviderError
where
    E: ProvideErrorMetadata + std::error::Error + 'static,
{
    let message = err
        .message()
        .map(str::to_string)
        .unwrap_or_else(|| DisplayErrorContext(&err).to_string());
    ProviderError::Call(message)
}

fn attributes_from(detail: &FaceDetail) -> FaceAttributes {
    let bounding_box = detail
        .bounding_box()
        .map(|b| BoundingBox {
            left: b.left().unwrap_or(0.0),
            top: b.top().unwrap_or(0.0),
            width: b.width().unwrap_or(0.0),
            height: b.height().unwrap_or(0.0),
        })
        .unwrap_or_default();

    FaceAttributes {
        bounding_box,
        confidence: detail.confidence().unwrap_or(0.0),
        pose: detail.pose().map(|p| Pose {
            roll: p.roll().unwrap_or(0.0),
            yaw: p.yaw().unwrap_or(0.0),
            pitch: p.pitch().unwrap_or(0.0),
        }),
        quality: detail.quality().map(|q| Quality {
            brightness: q.brightness().unwrap_or(0.0),
            sharpness: q.sharpness().unwrap_or(0.0),
        }),
        landmarks: detail
            .landmarks()
            .iter()
            .map(|l| Landmark {
                kind: l.r#type().map(|t| t.as_str().to_string()).unwrap_or_default(),
                x: l.x().unwrap_or(0.0),
                y: l.y().unwrap_or(0.0),
            })
            .collect(),
    }
}

fn hit_from(m: &FaceMatch) -> Option<SimilarityHit> {
    let face = m.face()?;
    Some(SimilarityHit {
        identity_id: face.external_image_id().map(str::to_string),
        face_id: face.face_id()?.to_string(),
        similarity: m.similarity().unwrap_or(0.0),
    })
}

#[async_trait]
impl RecognitionProvider for RekognitionProvider {
    async fn detect_faces(&self, image: Vec<u8>) -> Result<Vec<FaceAttributes>, ProviderError> {
        let out = self
            .client
            .detect_faces()
            .image(image_of(image))
            .attributes(Attribute::Default)
            .send()
            .await
            .map_err(call_error)?;

        Ok(out.face_details().iter().map(attributes_from).collect())
    }

    async fn index_face(
        &self,
        image: Vec<u8>,
        identity_id: &str,
    ) -> Result<Option<IndexedFace>, ProviderError> {
        let out = self
            .client
            .index_faces()
            .collection_id(&self.collection_id)
            .image(image_of(image))
            .external_image_id(identity_id)
            .max_faces(1)
            .quality_filter(QualityFilter::Auto)
            .detection_attributes(Attribute::All)
            .send()
            .await
            .map_err(call_error)?;

        let Some(record) = out.face_records().first() else {
            tracing::debug!(
                identity = identity_id,
                unindexed = out.unindexed_faces().len(),
                "index_faces returned no face records"
            );
            return Ok(None);
        };

        let face_id = record
            .face()
            .and_then(|f| f.face_id())
            .ok_or_else(|| ProviderError::Malformed("face record without face id".into()))?;

        Ok(Some(IndexedFace {
            face_id: face_id.to_string(),
            attributes: record.face_detail().map(attributes_from).unwrap_or_default(),
        }))
    }

    async fn index_photo_faces(
        &self,
        image: Vec<u8>,
        external_id: &str,
    ) -> Result<Vec<IndexedFace>, ProviderError> {
        let out = self
            .client
            .index_faces()
            .collection_id(&self.collection_id)
            .image(image_of(image))
            .external_image_id(external_id)
            .quality_filter(QualityFilter::Auto)
            .detection_attributes(Attribute::All)
            .send()
            .await
            .map_err(call_error)?;

        tracing::debug!(
            external_id,
            indexed = out.face_records().len(),
            unindexed = out.unindexed_faces().len(),
            "photo faces indexed"
        );
        Ok(out
            .face_records()
            .iter()
            .filter_map(|record| {
                Some(IndexedFace {
                    face_id: record.face()?.face_id()?.to_string(),
                    attributes: record.face_detail().map(attributes_from).unwrap_or_default(),
                })
            })
            .collect())
    }

    async fn delete_face(&self, face_id: &str) -> Result<(), ProviderError> {
        let out = self
            .client
            .delete_faces()
            .collection_id(&self.collection_id)
            .face_ids(face_id)
            .send()
            .await
            .map_err(call_error)?;

        if !out.deleted_faces().iter().any(|id| id == face_id) {
            tracing::debug!(face_id, "face was not in the collection");
        }
        Ok(())
    }

    async fn search_by_similarity(
        &self,
        face_id: &str,
        threshold: f32,
        max_results: u32,
    ) -> Result<Vec<SimilarityHit>, ProviderError> {
        let out = self
            .client
            .search_faces()
            .collection_id(&self.collection_id)
            .face_id(face_id)
            .face_match_threshold(threshold)
            .max_faces(max_results.min(i32::MAX as u32) as i32)
            .send()
            .await
            .map_err(call_error)?;

        Ok(out.face_matches().iter().filter_map(hit_from).collect())
    }

    async fn search_by_image(
        &self,
        image: Vec<u8>,
        threshold: f32,
        max_results: u32,
    ) -> Result<Vec<SimilarityHit>, ProviderError> {
        let out = self
            .client
            .search_faces_by_image()
            .collection_id(&self.collection_id)
            .image(image_of(image))
            .face_match_threshold(threshold)
            .max_faces(max_results.min(i32::MAX as u32) as i32)
            .quality_filter(QualityFilter::Auto)
            .send()
            .await
            .map_err(call_error)?;

        Ok(out.face_matches().iter().filter_map(hit_from).collect())
    }
}
