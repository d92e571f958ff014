//! Face registration pipeline primitives.
//!
//! Normalizes captured images, validates and indexes faces through an
//! external recognition provider, searches for historical matches and
//! persists face, match, identity-link and group photo records.

pub mod binary;
pub mod indexer;
pub mod matcher;
pub mod persistence;
pub mod provider;
pub mod rekognition;
pub mod store;
pub mod types;
pub mod validator;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use binary::{load, normalize, BinaryInput, BlobHandle, NormalizedBinary};
pub use provider::{RecognitionProvider, FACE_MATCH_THRESHOLD};
pub use store::{KvStore, ObjectStore, StoreError};
pub use types::{
    is_valid_identity, is_valid_photo_id, CaptureVideoRecord, FaceRecord, FailureKind,
    LocationRecord, MatchRecord, PhotoMatch, PhotoRecord, Provenance, RegistrationResult,
};
