//! Registration orchestrator.
//!
//! Sequence for one attempt: capture (still + location concurrently) →
//! video upload → validate → index → historical match → persist, propagate
//! and attribute photos → result. Only capture, validation and indexing
//! failures fail the attempt; video, location and fingerprint problems leave
//! their result fields empty.

use chrono::Utc;
use likeness_capture::location::{LocationResolver, Resolution};
use likeness_capture::session::UploadedVideo;
use likeness_capture::{CaptureError, CaptureSession, DeviceFingerprint, VideoArtifact};
use likeness_core::indexer::{FaceIndexer, IndexError};
use likeness_core::matcher::{HistoricalMatcher, HistoricalSearch};
use likeness_core::persistence::Persistence;
use likeness_core::provider::{ProviderError, SimilarityHit};
use likeness_core::validator::FaceSampleValidator;
use likeness_core::{
    load, BinaryInput, CaptureVideoRecord, FaceRecord, FailureKind, LocationRecord,
    NormalizedBinary, ObjectStore, PhotoMatch, PhotoRecord, RecognitionProvider,
    RegistrationResult,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RegistrationError {
    /// The sample was inspected and refused; the message is user-facing.
    #[error("{message}")]
    Rejected {
        kind: FailureKind,
        message: &'static str,
    },
    #[error("{0}")]
    Provider(#[from] ProviderError),
    #[error(transparent)]
    Index(#[from] IndexError),
    #[error("capture failed: {0}")]
    Capture(#[from] CaptureError),
}

impl RegistrationError {
    pub fn kind(&self) -> FailureKind {
        match self {
            RegistrationError::Rejected { kind, .. } => *kind,
            RegistrationError::Provider(_) => FailureKind::Provider,
            RegistrationError::Index(e) => e.kind(),
            RegistrationError::Capture(_) => FailureKind::Capture,
        }
    }

    pub fn into_result(self) -> RegistrationResult {
        RegistrationResult::failed(self.kind(), self.to_string())
    }
}

/// One registration from caller-supplied material.
#[derive(Debug, Clone)]
pub struct RegistrationRequest {
    pub identity_id: String,
    pub image: BinaryInput,
    pub location_hint: Option<LocationRecord>,
    pub video: Option<VideoArtifact>,
    pub fingerprint: Option<DeviceFingerprint>,
}

/// Out-of-band context for a session-driven registration.
#[derive(Debug, Clone, Default)]
pub struct SessionRequest {
    pub location_hint: Option<LocationRecord>,
    pub fingerprint: Option<DeviceFingerprint>,
}

pub struct Orchestrator {
    validator: FaceSampleValidator,
    indexer: FaceIndexer,
    matcher: HistoricalMatcher,
    persistence: Arc<Persistence>,
    objects: Arc<dyn ObjectStore>,
    resolver: Arc<LocationResolver>,
}

fn video_extension(mime_type: &str) -> &'static str {
    match mime_type.split(';').next().map(str::trim) {
        Some("video/webm") => "webm",
        Some("video/mp4") => "mp4",
        Some("video/quicktime") => "mov",
        _ => "bin",
    }
}

impl Orchestrator {
    pub fn new(
        provider: Arc<dyn RecognitionProvider>,
        objects: Arc<dyn ObjectStore>,
        persistence: Arc<Persistence>,
        resolver: Arc<LocationResolver>,
    ) -> Self {
        Self {
            validator: FaceSampleValidator::new(provider.clone()),
            indexer: FaceIndexer::new(provider.clone(), objects.clone(), persistence.clone()),
            matcher: HistoricalMatcher::new(provider),
            persistence,
            objects,
            resolver,
        }
    }

    pub fn persistence(&self) -> &Persistence {
        &self.persistence
    }

    pub fn resolver(&self) -> &LocationResolver {
        &self.resolver
    }

    /// Register from an image supplied directly by the caller.
    pub async fn register_face(&self, request: RegistrationRequest) -> RegistrationResult {
        let RegistrationRequest {
            identity_id,
            image,
            location_hint,
            video,
            fingerprint,
        } = request;
        tracing::info!(identity = %identity_id, "registration requested");

        let location = self.resolver.resolve_hint(location_hint).await;
        let uploaded = match &video {
            Some(artifact) => self.upload_video(&identity_id, artifact, false).await,
            None => None,
        };
        self.complete(&identity_id, &image, location, uploaded, fingerprint.as_ref())
            .await
    }

    /// Register from a live capture session.
    ///
    /// The still frame and the location are acquired concurrently; the still
    /// request itself waits for the recording to flush. On failure the
    /// session is reset so the caller can retry, and a recording that was
    /// already uploaded is not uploaded again.
    pub async fn register_from_session(
        &self,
        session: &mut CaptureSession,
        request: SessionRequest,
    ) -> RegistrationResult {
        let identity_id = session.identity_id().to_string();
        tracing::info!(identity = %identity_id, session = %session.id(), "session registration requested");

        let (still, location) = tokio::join!(
            session.capture_still(),
            self.resolver.resolve_hint(request.location_hint)
        );
        let result = match still {
            Ok(frame) => {
                let uploaded = self.upload_session_video(session).await;
                self.complete(
                    &identity_id,
                    &frame.to_input(),
                    location,
                    uploaded,
                    request.fingerprint.as_ref(),
                )
                .await
            }
            Err(e) => {
                tracing::warn!(identity = %identity_id, error = %e, "still capture failed");
                RegistrationError::from(e).into_result()
            }
        };

        if !result.success {
            if let Err(e) = session.reset() {
                tracing::warn!(identity = %identity_id, error = %e, "session reset failed");
            }
        }
        result
    }

    /// Ad hoc search: faces of other identities resembling `image`. Nothing
    /// is indexed or persisted.
    pub async fn search_face_by_image(
        &self,
        image: &BinaryInput,
        exclude_identity: Option<&str>,
    ) -> Result<Vec<SimilarityHit>, RegistrationError> {
        let normalized = load(image).await;
        if let Some(reason) = normalized.degenerate {
            return Err(IndexError::Degenerate(reason).into());
        }
        let hits = self
            .matcher
            .search_by_image(&normalized, exclude_identity)
            .await?;
        tracing::info!(exclude = ?exclude_identity, hits = hits.len(), "image search complete");
        Ok(hits)
    }

    /// Index a group photo and attribute every registered identity whose
    /// face appears in it. Search failures for one photo face are logged and
    /// skip that face.
    pub async fn index_photo(
        &self,
        photo_id: &str,
        image: &BinaryInput,
    ) -> Result<PhotoRecord, RegistrationError> {
        let normalized = load(image).await;
        let mut photo = self.indexer.index_photo(&normalized, photo_id).await?;

        let mut found: BTreeMap<String, PhotoMatch> = BTreeMap::new();
        for photo_face in &photo.face_ids {
            let hits = match self.matcher.identities_like(photo_face).await {
                Ok(hits) => hits,
                Err(e) => {
                    tracing::warn!(photo_id, face_id = %photo_face, error = %e, "photo face search failed");
                    continue;
                }
            };
            for hit in hits {
                let Some(identity_id) = hit.identity_id else {
                    continue;
                };
                if found
                    .get(&identity_id)
                    .is_some_and(|m| m.similarity >= hit.similarity)
                {
                    continue;
                }
                found.insert(
                    identity_id.clone(),
                    PhotoMatch {
                        identity_id,
                        face_id: hit.face_id,
                        photo_face_id: photo_face.clone(),
                        similarity: hit.similarity,
                        matched_at: Utc::now(),
                    },
                );
            }
        }

        if !found.is_empty() {
            photo.matched_users.extend(found.into_values());
            photo.updated_at = Utc::now();
            if let Err(e) = self.persistence.save_photo(&photo).await {
                tracing::warn!(photo_id, error = %e, "photo attribution not saved");
            }
        }
        tracing::info!(
            photo_id,
            faces = photo.face_ids.len(),
            identities = photo.matched_users.len(),
            "photo registered"
        );
        Ok(photo)
    }

    /// Close a session without registering. A recording that was never
    /// uploaded is stored as a partial side record.
    pub async fn abandon(&self, session: CaptureSession) -> Option<UploadedVideo> {
        let identity_id = session.identity_id().to_string();
        let video = session.abandon().await?;
        self.upload_video(&identity_id, &video, true).await
    }

    async fn complete(
        &self,
        identity_id: &str,
        image: &BinaryInput,
        location: Resolution,
        video: Option<UploadedVideo>,
        fingerprint: Option<&DeviceFingerprint>,
    ) -> RegistrationResult {
        let normalized = load(image).await;
        let face = match self.validate_and_index(identity_id, &normalized).await {
            Ok(face) => face,
            Err(e) => {
                tracing::warn!(identity = identity_id, kind = ?e.kind(), error = %e, "registration failed");
                return e.into_result();
            }
        };

        let HistoricalSearch {
            matches,
            photo_hits,
        } = match self.matcher.find_matches(identity_id, &face.face_id).await {
            Ok(found) => found,
            Err(e) => {
                tracing::warn!(identity = identity_id, face_id = %face.face_id, error = %e, "historical search failed");
                HistoricalSearch::default()
            }
        };
        self.persistence.record_matches(identity_id, &matches).await;
        let attributed_photos = self
            .persistence
            .attribute_photos(identity_id, &face.face_id, &photo_hits)
            .await;

        let device_fingerprint = match fingerprint {
            Some(fp) => self.save_fingerprint(identity_id, fp).await,
            None => None,
        };

        tracing::info!(
            identity = identity_id,
            face_id = %face.face_id,
            matches = matches.len(),
            photos = attributed_photos.len(),
            provenance = ?location.record.provenance,
            video = video.is_some(),
            "registration complete"
        );
        RegistrationResult {
            success: true,
            face_id: Some(face.face_id),
            image_url: face.image_url,
            historical_matches: matches,
            video_url: video.as_ref().map(|v| v.url.clone()),
            video_id: video.map(|v| v.video_id.to_string()),
            location: Some(location.record),
            location_error: location.error.map(|e| e.user_message().to_string()),
            device_fingerprint,
            attributed_photos,
            error: None,
            failure: None,
        }
    }

    async fn validate_and_index(
        &self,
        identity_id: &str,
        image: &NormalizedBinary,
    ) -> Result<FaceRecord, RegistrationError> {
        if let Some(reason) = image.degenerate {
            return Err(IndexError::Degenerate(reason).into());
        }
        let verdict = self.validator.validate(image).await?;
        if let Some((kind, message)) = verdict.rejection() {
            return Err(RegistrationError::Rejected { kind, message });
        }
        Ok(self.indexer.index(image, identity_id).await?)
    }

    async fn upload_session_video(&self, session: &mut CaptureSession) -> Option<UploadedVideo> {
        let identity_id = session.identity_id().to_string();
        let video = session.video()?;
        if let Some(previous) = session.uploaded(video.id) {
            tracing::debug!(identity = %identity_id, video_id = %video.id, "recording already uploaded");
            return Some(previous);
        }
        let uploaded = self.upload_video(&identity_id, video, false).await?;
        session.mark_uploaded(uploaded.video_id, uploaded.url.clone());
        Some(uploaded)
    }

    /// Store a recording and its side record. Failures are logged and the
    /// video is reported absent.
    async fn upload_video(
        &self,
        identity_id: &str,
        video: &VideoArtifact,
        abandoned: bool,
    ) -> Option<UploadedVideo> {
        if video.is_empty() {
            return None;
        }
        let key = format!(
            "videos/{identity_id}/{}.{}",
            video.id,
            video_extension(&video.mime_type)
        );
        let url = match self
            .objects
            .put(&key, video.data.clone(), &video.mime_type)
            .await
        {
            Ok(url) => url,
            Err(e) => {
                tracing::warn!(identity = identity_id, video_id = %video.id, error = %e, "video upload failed");
                return None;
            }
        };

        let record = CaptureVideoRecord {
            identity_id: identity_id.to_string(),
            video_id: video.id.to_string(),
            url: url.clone(),
            content_type: video.mime_type.clone(),
            size_bytes: video.len(),
            chunk_count: video.chunk_count,
            truncated: video.truncated,
            abandoned,
            recorded_at: video.stopped_at,
        };
        if let Err(e) = self.persistence.save_video(&record).await {
            tracing::warn!(identity = identity_id, video_id = %video.id, error = %e, "video record not saved");
        }
        tracing::info!(identity = identity_id, video_id = %video.id, size = video.len(), abandoned, "video stored");
        Some(UploadedVideo {
            video_id: video.id,
            url,
        })
    }

    async fn save_fingerprint(&self, identity_id: &str, fingerprint: &DeviceFingerprint) -> Option<String> {
        let digest = fingerprint.digest()?;
        let details = match serde_json::to_value(fingerprint) {
            Ok(details) => details,
            Err(e) => {
                tracing::warn!(identity = identity_id, error = %e, "fingerprint not serializable");
                return None;
            }
        };
        match self
            .persistence
            .save_fingerprint(identity_id, &digest, details)
            .await
        {
            Ok(()) => Some(digest),
            Err(e) => {
                tracing::warn!(identity = identity_id, error = %e, "fingerprint not saved");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use likeness_capture::location::{
        DeviceSource, IpLocation, IpLocator, IpSource, LocationError, NoGeolocation,
        PositionOptions, StaticGeolocation,
    };
    use likeness_capture::{ReplayDevice, ReplayFeed, StillFrame, DEFAULT_MAX_VIDEO_BYTES};
    use likeness_core::store::tables;
    use likeness_core::testing::{MemoryKvStore, MemoryObjectStore, ScriptedProvider};
    use likeness_core::{Provenance, FACE_MATCH_THRESHOLD};

    const JPEG: &[u8] = &[0xFF, 0xD8, 0xFF, 0xE0, 0x00, 0x10, 0x4A, 0x46];

    struct FixedIp;

    #[async_trait]
    impl IpLocator for FixedIp {
        async fn locate(&self) -> Result<IpLocation, LocationError> {
            Ok(IpLocation {
                latitude: 40.4,
                longitude: -3.7,
                address: Some("Madrid, Madrid, Spain".into()),
            })
        }
    }

    struct Harness {
        provider: Arc<ScriptedProvider>,
        kv: Arc<MemoryKvStore>,
        objects: Arc<MemoryObjectStore>,
        orchestrator: Orchestrator,
    }

    fn harness_with(provider: ScriptedProvider, resolver: LocationResolver) -> Harness {
        let provider = Arc::new(provider);
        let kv = Arc::new(MemoryKvStore::new());
        let objects = Arc::new(MemoryObjectStore::new());
        let orchestrator = Orchestrator::new(
            provider.clone(),
            objects.clone(),
            Arc::new(Persistence::new(kv.clone())),
            Arc::new(resolver),
        );
        Harness {
            provider,
            kv,
            objects,
            orchestrator,
        }
    }

    fn kiosk_resolver() -> LocationResolver {
        LocationResolver::new(vec![
            Box::new(DeviceSource::new(
                Arc::new(StaticGeolocation {
                    latitude: 48.85,
                    longitude: 2.35,
                    accuracy: 15.0,
                }),
                None,
                PositionOptions::default(),
            )),
            Box::new(IpSource::new(Arc::new(FixedIp))),
        ])
    }

    fn harness(faces: usize) -> Harness {
        harness_with(ScriptedProvider::with_faces(faces), kiosk_resolver())
    }

    fn request(identity: &str) -> RegistrationRequest {
        RegistrationRequest {
            identity_id: identity.into(),
            image: BinaryInput::Raw(JPEG.to_vec()),
            location_hint: None,
            video: None,
            fingerprint: None,
        }
    }

    fn open_session(identity: &str) -> (CaptureSession, ReplayFeed) {
        let (device, feed) = ReplayDevice::new("video/webm");
        let session = CaptureSession::open(identity, Box::new(device), DEFAULT_MAX_VIDEO_BYTES).unwrap();
        (session, feed)
    }

    fn video_keys(h: &Harness) -> Vec<String> {
        h.objects
            .keys()
            .into_iter()
            .filter(|k| k.starts_with("videos/"))
            .collect()
    }

    #[tokio::test]
    async fn test_one_face_registers() {
        let h = harness(1);
        let result = h.orchestrator.register_face(request("alice")).await;

        assert!(result.success, "{:?}", result.error);
        assert_eq!(result.face_id.as_deref(), Some("face-1"));
        assert!(result.image_url.as_deref().unwrap().starts_with("memory://faces/alice/"));
        assert!(result.historical_matches.is_empty());
        assert_eq!(
            result.location.unwrap().provenance,
            Some(Provenance::DeviceGeolocation)
        );
        assert_eq!(h.kv.count(tables::FACES), 1);
    }

    #[tokio::test]
    async fn test_multiple_faces_rejected_before_indexing() {
        let h = harness(2);
        let result = h.orchestrator.register_face(request("alice")).await;

        assert!(!result.success);
        assert_eq!(result.failure, Some(FailureKind::MultipleFaces));
        assert!(result.error.unwrap().contains("multiple faces"));
        assert_eq!(h.provider.calls().index, 0);
        assert_eq!(h.kv.count(tables::FACES), 0);
    }

    #[tokio::test]
    async fn test_zero_faces_rejected_before_indexing() {
        let h = harness(0);
        let result = h.orchestrator.register_face(request("alice")).await;
        assert_eq!(result.failure, Some(FailureKind::ZeroFaces));
        assert_eq!(h.provider.calls().index, 0);
    }

    #[tokio::test]
    async fn test_index_failure_surfaces_provider_message() {
        let h = harness(1);
        h.provider.fail_index("Connection reset by peer");
        let result = h.orchestrator.register_face(request("alice")).await;

        assert!(!result.success);
        assert_eq!(result.failure, Some(FailureKind::Provider));
        assert_eq!(result.error.as_deref(), Some("Connection reset by peer"));
        assert_eq!(h.kv.count(tables::FACES), 0);
    }

    #[tokio::test]
    async fn test_nothing_indexed_fails() {
        let h = harness(1);
        h.provider.index_nothing();
        let result = h.orchestrator.register_face(request("alice")).await;
        assert_eq!(result.failure, Some(FailureKind::NoFaceIndexed));
    }

    #[tokio::test]
    async fn test_empty_image_fails_without_provider_calls() {
        let h = harness(1);
        let mut req = request("alice");
        req.image = BinaryInput::Raw(Vec::new());
        let result = h.orchestrator.register_face(req).await;
        assert_eq!(result.failure, Some(FailureKind::InvalidImage));
        assert_eq!(h.provider.calls().detect, 0);
    }

    #[tokio::test]
    async fn test_match_excludes_self_and_propagates_to_linked() {
        let h = harness(1);
        h.provider.push_hit("bob", "bob-face", 93.5);
        h.provider.push_hit("alice", "alice-old", 99.0);
        h.provider.push_hit("carol", "carol-face", FACE_MATCH_THRESHOLD - 1.0);
        let persistence = h.orchestrator.persistence();
        persistence.link_identities("bob", "bob-alt").await.unwrap();

        let result = h.orchestrator.register_face(request("alice")).await;
        assert!(result.success);
        assert_eq!(result.historical_matches.len(), 1);
        let m = &result.historical_matches[0];
        assert_eq!(m.target_identity_id, "bob");
        assert!(m.similarity >= FACE_MATCH_THRESHOLD);

        let under_alt = persistence.matches_for("bob-alt").await.unwrap();
        assert_eq!(under_alt.len(), 1);
        assert_eq!(under_alt[0].target_identity_id, "alice");
        assert_eq!(persistence.matches_for("bob").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_search_failure_is_not_fatal() {
        let h = harness(1);
        h.provider.fail_search("throttled");
        let result = h.orchestrator.register_face(request("alice")).await;
        assert!(result.success);
        assert!(result.historical_matches.is_empty());
    }

    #[tokio::test]
    async fn test_side_channel_failures_do_not_fail_registration() {
        let h = harness_with(
            ScriptedProvider::with_faces(1),
            LocationResolver::new(vec![Box::new(DeviceSource::new(
                Arc::new(NoGeolocation),
                None,
                PositionOptions::default(),
            ))]),
        );
        h.kv.fail_table(tables::DEVICE_FINGERPRINTS);
        let mut req = request("alice");
        req.fingerprint = Some(DeviceFingerprint {
            user_agent: Some("kiosk".into()),
            ..Default::default()
        });
        req.video = Some(VideoArtifact::from_input(&BinaryInput::Raw(vec![0x1A, 0x45, 0xDF, 0xA3, 1])).unwrap());
        h.kv.fail_table(tables::CAPTURE_VIDEOS);

        let result = h.orchestrator.register_face(req).await;
        assert!(result.success);
        assert!(result.location.unwrap().is_none());
        assert!(result.location_error.is_some());
        assert!(result.device_fingerprint.is_none());
        // the object was stored even though its side record was not
        assert!(result.video_url.is_some());
    }

    #[tokio::test]
    async fn test_video_upload_failure_leaves_video_absent() {
        let h = harness(1);
        h.objects.fail_with("bucket gone");
        let mut req = request("alice");
        req.video = Some(VideoArtifact::from_input(&BinaryInput::Raw(vec![0x1A, 0x45, 0xDF, 0xA3, 1])).unwrap());
        let result = h.orchestrator.register_face(req).await;
        // the face image upload shares the failing store, so indexing fails
        assert_eq!(result.failure, Some(FailureKind::Storage));
        assert!(result.video_url.is_none());
    }

    #[tokio::test]
    async fn test_fingerprint_digest_returned() {
        let h = harness(1);
        let fp = DeviceFingerprint {
            platform: Some("Linux".into()),
            ..Default::default()
        };
        let mut req = request("alice");
        req.fingerprint = Some(fp.clone());
        let result = h.orchestrator.register_face(req).await;
        assert_eq!(result.device_fingerprint, fp.digest());
        assert_eq!(h.kv.count(tables::DEVICE_FINGERPRINTS), 1);
    }

    #[tokio::test]
    async fn test_ip_fallback_when_device_unavailable() {
        let h = harness_with(
            ScriptedProvider::with_faces(1),
            LocationResolver::new(vec![
                Box::new(DeviceSource::new(Arc::new(NoGeolocation), None, PositionOptions::default())),
                Box::new(IpSource::new(Arc::new(FixedIp))),
            ]),
        );
        let result = h.orchestrator.register_face(request("alice")).await;
        assert!(result.success);
        assert_eq!(
            result.location_error.as_deref(),
            Some(LocationError::Unsupported.user_message())
        );
        let location = result.location.unwrap();
        assert_eq!(location.provenance, Some(Provenance::IpGeolocationFallback));
        assert!(location.has_coordinates());
        assert_eq!(location.address.as_deref(), Some("Madrid, Madrid, Spain"));
    }

    #[tokio::test]
    async fn test_device_location_has_no_error() {
        let h = harness(1);
        let result = h.orchestrator.register_face(request("alice")).await;
        assert!(result.location_error.is_none());
    }

    #[tokio::test]
    async fn test_invalid_identity_fails_without_indexing() {
        let h = harness(1);
        let result = h.orchestrator.register_face(request("alice#2")).await;
        assert_eq!(result.failure, Some(FailureKind::InvalidIdentity));
        assert_eq!(h.provider.calls().index, 0);
        assert!(h.objects.keys().is_empty());
    }

    #[tokio::test]
    async fn test_missing_still_is_a_capture_failure() {
        let h = harness(1);
        let (mut session, _feed) = open_session("alice");
        let result = h
            .orchestrator
            .register_from_session(&mut session, SessionRequest::default())
            .await;
        assert!(!result.success);
        assert_eq!(result.failure, Some(FailureKind::Capture));
        assert_eq!(h.provider.calls().detect, 0);
    }

    #[tokio::test]
    async fn test_index_photo_attributes_registered_identities() {
        let h = harness(1);
        let alice = h.orchestrator.register_face(request("alice")).await;
        let alice_face = alice.face_id.unwrap();
        h.provider.push_hit("alice", &alice_face, 95.0);

        h.provider.set_faces(2);
        let photo = h
            .orchestrator
            .index_photo("party", &BinaryInput::Raw(JPEG.to_vec()))
            .await
            .unwrap();
        assert_eq!(photo.face_ids.len(), 2);
        assert_eq!(photo.matched_users.len(), 1);
        assert_eq!(photo.matched_users[0].identity_id, "alice");
        assert_eq!(photo.matched_users[0].face_id, alice_face);

        let stored = h.orchestrator.persistence().photos_for("alice").await.unwrap();
        assert_eq!(stored, vec![photo]);
    }

    #[tokio::test]
    async fn test_registration_attributes_known_photos() {
        let h = harness(2);
        let photo = h
            .orchestrator
            .index_photo("party", &BinaryInput::Raw(JPEG.to_vec()))
            .await
            .unwrap();
        assert!(photo.matched_users.is_empty());
        h.provider.push_photo_hit("party", &photo.face_ids[1], 92.0);

        h.provider.set_faces(1);
        let result = h.orchestrator.register_face(request("bob")).await;
        assert!(result.success);
        assert!(result.historical_matches.is_empty());
        assert_eq!(result.attributed_photos, vec!["party"]);

        let again = h.orchestrator.register_face(request("bob")).await;
        assert!(again.attributed_photos.is_empty());
    }

    #[tokio::test]
    async fn test_session_registration_uploads_flushed_video() {
        let h = harness(1);
        let (mut session, feed) = open_session("alice");
        feed.push_clip(&[1, 2, 3, 4], 2);
        feed.set_still(StillFrame::new(JPEG.to_vec(), None));

        let result = h
            .orchestrator
            .register_from_session(&mut session, SessionRequest::default())
            .await;
        assert!(result.success);
        let video_id = result.video_id.unwrap();
        assert_eq!(video_keys(&h), vec![format!("videos/alice/{video_id}.webm")]);
        assert_eq!(h.kv.count(tables::CAPTURE_VIDEOS), 1);
    }

    #[tokio::test]
    async fn test_retry_after_rejection_does_not_reupload() {
        let h = harness(0);
        let (mut session, feed) = open_session("alice");
        feed.push_clip(&[1, 2, 3, 4], 2);
        feed.set_still(StillFrame::new(JPEG.to_vec(), None));

        let first = h
            .orchestrator
            .register_from_session(&mut session, SessionRequest::default())
            .await;
        assert_eq!(first.failure, Some(FailureKind::ZeroFaces));
        assert_eq!(video_keys(&h).len(), 1);

        h.provider.set_faces(1);
        feed.set_still(StillFrame::new(JPEG.to_vec(), None));
        let second = h
            .orchestrator
            .register_from_session(&mut session, SessionRequest::default())
            .await;
        assert!(second.success);
        assert_eq!(video_keys(&h).len(), 1);
        assert!(second.video_url.is_some());
    }

    #[tokio::test]
    async fn test_session_index_error_is_retryable() {
        let h = harness(1);
        h.provider.fail_index("network unreachable");
        let (mut session, feed) = open_session("alice");
        feed.set_still(StillFrame::new(JPEG.to_vec(), None));

        let first = h
            .orchestrator
            .register_from_session(&mut session, SessionRequest::default())
            .await;
        assert_eq!(first.error.as_deref(), Some("network unreachable"));

        h.provider.clear_failures();
        feed.set_still(StillFrame::new(JPEG.to_vec(), None));
        let second = h
            .orchestrator
            .register_from_session(&mut session, SessionRequest::default())
            .await;
        assert!(second.success);
    }

    #[tokio::test]
    async fn test_abandon_stores_partial_video() {
        let h = harness(1);
        let (session, feed) = open_session("alice");
        feed.push_chunk(vec![9, 9, 9]);

        let uploaded = h.orchestrator.abandon(session).await.unwrap();
        assert!(uploaded.url.starts_with("memory://videos/alice/"));
        let records = h
            .orchestrator
            .persistence()
            .videos_for("alice")
            .await
            .unwrap();
        assert_eq!(records.len(), 1);
        assert!(records[0].abandoned);
    }

    #[tokio::test]
    async fn test_search_by_image_excludes_identity() {
        let h = harness(1);
        h.provider.push_hit("alice", "a1", 95.0);
        h.provider.push_hit("bob", "b1", 90.0);
        let hits = h
            .orchestrator
            .search_face_by_image(&BinaryInput::Raw(JPEG.to_vec()), Some("alice"))
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].identity_id.as_deref(), Some("bob"));
        assert_eq!(h.provider.calls().index, 0);
    }

    #[test]
    fn test_video_extension() {
        assert_eq!(video_extension("video/webm;codecs=vp9"), "webm");
        assert_eq!(video_extension("video/mp4"), "mp4");
        assert_eq!(video_extension("application/octet-stream"), "bin");
    }
}
