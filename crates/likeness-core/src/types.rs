use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Bounding box for a detected face, in ratios of the image dimensions.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub left: f32,
    pub top: f32,
    pub width: f32,
    pub height: f32,
}

impl BoundingBox {
    pub fn area(&self) -> f32 {
        self.width * self.height
    }
}

/// Head pose in degrees.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Pose {
    pub roll: f32,
    pub yaw: f32,
    pub pitch: f32,
}

/// Image quality as scored by the provider (0–100).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Quality {
    pub brightness: f32,
    pub sharpness: f32,
}

/// A named facial landmark, in ratios of the image dimensions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Landmark {
    pub kind: String,
    pub x: f32,
    pub y: f32,
}

/// Detection attributes for one face. Opaque to the pipeline; stored and
/// echoed back but never interpreted beyond logging.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FaceAttributes {
    pub bounding_box: BoundingBox,
    pub confidence: f32,
    pub pose: Option<Pose>,
    pub quality: Option<Quality>,
    #[serde(default)]
    pub landmarks: Vec<Landmark>,
}

/// A face indexed by the recognition provider. Never updated once persisted;
/// each capture produces a new record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaceRecord {
    pub identity_id: String,
    pub face_id: String,
    pub attributes: FaceAttributes,
    pub indexed_at: DateTime<Utc>,
    /// Object-storage URL of the indexed image.
    pub image_url: Option<String>,
}

/// "This identity's new face resembles that identity's prior face."
///
/// `source_identity_id` never equals `target_identity_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchRecord {
    pub source_identity_id: String,
    pub source_face_id: String,
    pub target_identity_id: String,
    pub target_face_id: String,
    /// Provider similarity, 0–100.
    pub similarity: f32,
    pub matched_at: DateTime<Utc>,
}

impl MatchRecord {
    /// The same match seen from the target's side.
    pub fn reversed(&self) -> MatchRecord {
        MatchRecord {
            source_identity_id: self.target_identity_id.clone(),
            source_face_id: self.target_face_id.clone(),
            target_identity_id: self.source_identity_id.clone(),
            target_face_id: self.source_face_id.clone(),
            similarity: self.similarity,
            matched_at: self.matched_at,
        }
    }

    /// Re-express this match under another source identity.
    pub fn with_source(&self, identity_id: &str) -> MatchRecord {
        MatchRecord {
            source_identity_id: identity_id.to_string(),
            ..self.clone()
        }
    }

    pub fn is_self_match(&self) -> bool {
        self.source_identity_id == self.target_identity_id
    }
}

/// Side record for a capture-session video stored in object storage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaptureVideoRecord {
    pub identity_id: String,
    pub video_id: String,
    pub url: String,
    pub content_type: String,
    pub size_bytes: usize,
    pub chunk_count: usize,
    pub truncated: bool,
    /// Stored because the session was closed before a still frame existed.
    pub abandoned: bool,
    pub recorded_at: DateTime<Utc>,
}

/// Prefix of the provider external id under which photo faces are indexed.
pub const PHOTO_EXTERNAL_PREFIX: &str = "photo:";

const MAX_ID_LEN: usize = 255;

/// Ids are used verbatim as provider external ids and as the leading
/// component of `#`-separated record keys.
fn is_valid_external_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= MAX_ID_LEN
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-' | ':'))
}

/// Whether `id` can name an identity: 1 to 255 characters from
/// `[A-Za-z0-9_.:-]`, not starting with the photo prefix.
pub fn is_valid_identity(id: &str) -> bool {
    is_valid_external_id(id) && !id.starts_with(PHOTO_EXTERNAL_PREFIX)
}

/// Whether `id` can name a photo. The external id `photo:<id>` must fit the
/// same length bound.
pub fn is_valid_photo_id(id: &str) -> bool {
    is_valid_external_id(id) && id.len() + PHOTO_EXTERNAL_PREFIX.len() <= MAX_ID_LEN
}

/// An identity found in a photo.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhotoMatch {
    pub identity_id: String,
    /// The identity's registered face that matched.
    pub face_id: String,
    /// The photo face it matched.
    pub photo_face_id: String,
    pub similarity: f32,
    pub matched_at: DateTime<Utc>,
}

/// A group photo whose faces are indexed for attribution. `matched_users`
/// holds at most one entry per identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhotoRecord {
    pub photo_id: String,
    pub image_url: Option<String>,
    pub face_ids: Vec<String>,
    #[serde(default)]
    pub matched_users: Vec<PhotoMatch>,
    pub indexed_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PhotoRecord {
    pub fn has_identity(&self, identity_id: &str) -> bool {
        self.matched_users.iter().any(|m| m.identity_id == identity_id)
    }
}

/// Which source produced a [`LocationRecord`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Provenance {
    DeviceGeolocation,
    ReverseGeocoded,
    IpGeolocationFallback,
    None,
}

/// Best-effort geolocation of a capture event.
///
/// When `provenance` is [`Provenance::None`] every coordinate field is `None`;
/// use [`LocationRecord::none`] to build that case.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationRecord {
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    /// Accuracy radius in meters.
    pub accuracy: Option<f64>,
    pub timestamp: DateTime<Utc>,
    pub address: Option<String>,
    pub provenance: Option<Provenance>,
}

impl LocationRecord {
    pub fn new(
        latitude: f64,
        longitude: f64,
        accuracy: f64,
        timestamp: DateTime<Utc>,
        provenance: Provenance,
    ) -> Self {
        Self {
            latitude: Some(latitude),
            longitude: Some(longitude),
            accuracy: Some(accuracy),
            timestamp,
            address: None,
            provenance: Some(provenance),
        }
    }

    /// The explicit "no location" record.
    pub fn none() -> Self {
        Self {
            latitude: None,
            longitude: None,
            accuracy: None,
            timestamp: Utc::now(),
            address: None,
            provenance: Some(Provenance::None),
        }
    }

    pub fn has_coordinates(&self) -> bool {
        self.latitude.is_some() && self.longitude.is_some()
    }

    pub fn is_none(&self) -> bool {
        self.provenance == Some(Provenance::None)
    }

    /// Attach a provenance tag if the record carries none. An existing tag is
    /// never overwritten.
    pub fn ensure_provenance(&mut self, provenance: Provenance) {
        if self.provenance.is_none() {
            self.provenance = Some(provenance);
        }
    }
}

/// Why a registration attempt failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailureKind {
    ZeroFaces,
    MultipleFaces,
    NoFaceIndexed,
    InvalidImage,
    /// The identity id cannot be used as a record key or external id.
    InvalidIdentity,
    /// The capture device could not deliver a still frame.
    Capture,
    Provider,
    Storage,
}

/// Terminal artifact of one registration attempt.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RegistrationResult {
    pub success: bool,
    pub face_id: Option<String>,
    pub image_url: Option<String>,
    pub historical_matches: Vec<MatchRecord>,
    pub video_url: Option<String>,
    pub video_id: Option<String>,
    pub location: Option<LocationRecord>,
    /// Why the device position was unavailable, when it was. Set even if a
    /// fallback source produced `location`.
    pub location_error: Option<String>,
    pub device_fingerprint: Option<String>,
    /// Photos this registration newly attributed the identity to.
    #[serde(default)]
    pub attributed_photos: Vec<String>,
    pub error: Option<String>,
    pub failure: Option<FailureKind>,
}

impl RegistrationResult {
    pub fn failed(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(message.into()),
            failure: Some(kind),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_match() -> MatchRecord {
        MatchRecord {
            source_identity_id: "alice".into(),
            source_face_id: "f-new".into(),
            target_identity_id: "bob".into(),
            target_face_id: "f-old".into(),
            similarity: 97.5,
            matched_at: Utc::now(),
        }
    }

    #[test]
    fn test_reversed_swaps_sides() {
        let m = sample_match();
        let r = m.reversed();
        assert_eq!(r.source_identity_id, "bob");
        assert_eq!(r.source_face_id, "f-old");
        assert_eq!(r.target_identity_id, "alice");
        assert_eq!(r.target_face_id, "f-new");
        assert_eq!(r.similarity, m.similarity);
    }

    #[test]
    fn test_with_source_keeps_target() {
        let m = sample_match().with_source("carol");
        assert_eq!(m.source_identity_id, "carol");
        assert_eq!(m.target_identity_id, "bob");
        assert!(!m.is_self_match());
        assert!(sample_match().with_source("bob").is_self_match());
    }

    #[test]
    fn test_none_location_has_no_coordinates() {
        let loc = LocationRecord::none();
        assert!(loc.is_none());
        assert!(!loc.has_coordinates());
        assert!(loc.accuracy.is_none());
    }

    #[test]
    fn test_ensure_provenance_does_not_overwrite() {
        let mut loc = LocationRecord::new(1.0, 2.0, 5.0, Utc::now(), Provenance::IpGeolocationFallback);
        loc.ensure_provenance(Provenance::DeviceGeolocation);
        assert_eq!(loc.provenance, Some(Provenance::IpGeolocationFallback));

        loc.provenance = None;
        loc.ensure_provenance(Provenance::DeviceGeolocation);
        assert_eq!(loc.provenance, Some(Provenance::DeviceGeolocation));
    }

    #[test]
    fn test_provenance_serializes_kebab_case() {
        let json = serde_json::to_string(&Provenance::IpGeolocationFallback).unwrap();
        assert_eq!(json, "\"ip-geolocation-fallback\"");
    }

    #[test]
    fn test_identity_charset() {
        assert!(is_valid_identity("alice"));
        assert!(is_valid_identity("9f1c2d3e-aaaa-bbbb-cccc-0123456789ab"));
        assert!(is_valid_identity("org:dept.user_1"));
        assert!(!is_valid_identity(""));
        assert!(!is_valid_identity("a#b"));
        assert!(!is_valid_identity("alice bob"));
        assert!(!is_valid_identity("photo:123"));
        assert!(!is_valid_identity(&"x".repeat(256)));
    }

    #[test]
    fn test_photo_id_leaves_room_for_prefix() {
        assert!(is_valid_photo_id("p-1"));
        assert!(!is_valid_photo_id(&"p".repeat(250)));
        assert!(!is_valid_photo_id("p#1"));
    }

    #[test]
    fn test_failure_kinds_serialize_kebab_case() {
        assert_eq!(
            serde_json::to_string(&FailureKind::InvalidIdentity).unwrap(),
            "\"invalid-identity\""
        );
        assert_eq!(serde_json::to_string(&FailureKind::Capture).unwrap(), "\"capture\"");
    }

    #[test]
    fn test_failed_result() {
        let r = RegistrationResult::failed(FailureKind::MultipleFaces, "multiple faces detected");
        assert!(!r.success);
        assert!(r.face_id.is_none());
        assert_eq!(r.failure, Some(FailureKind::MultipleFaces));
    }
}
