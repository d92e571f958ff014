//! Face sample validation: a sample is accepted only when the provider
//! detects exactly one face.

use crate::binary::NormalizedBinary;
use crate::provider::{ProviderError, RecognitionProvider};
use crate::types::{FailureKind, FaceAttributes};
use std::sync::Arc;

pub const ZERO_FACES_MESSAGE: &str = "no face detected; retry in better lighting";
pub const MULTIPLE_FACES_MESSAGE: &str = "multiple faces detected; ensure only one face is in frame";

#[derive(Debug, Clone, PartialEq)]
pub enum SampleVerdict {
    ZeroFaces,
    MultipleFaces(usize),
    ExactlyOneFace(FaceAttributes),
}

impl SampleVerdict {
    pub fn is_accepted(&self) -> bool {
        matches!(self, SampleVerdict::ExactlyOneFace(_))
    }

    /// User-facing reason for a rejected sample.
    pub fn rejection(&self) -> Option<(FailureKind, &'static str)> {
        match self {
            SampleVerdict::ZeroFaces => Some((FailureKind::ZeroFaces, ZERO_FACES_MESSAGE)),
            SampleVerdict::MultipleFaces(_) => {
                Some((FailureKind::MultipleFaces, MULTIPLE_FACES_MESSAGE))
            }
            SampleVerdict::ExactlyOneFace(_) => None,
        }
    }
}

pub struct FaceSampleValidator {
    provider: Arc<dyn RecognitionProvider>,
}

impl FaceSampleValidator {
    pub fn new(provider: Arc<dyn RecognitionProvider>) -> Self {
        Self { provider }
    }

    /// Run provider detection on the sample. Provider failures propagate
    /// unchanged and are not retried.
    pub async fn validate(&self, image: &NormalizedBinary) -> Result<SampleVerdict, ProviderError> {
        let mut faces = self.provider.detect_faces(image.copy_bytes()).await?;
        tracing::debug!(faces = faces.len(), "sample detection complete");

        Ok(match faces.len() {
            0 => SampleVerdict::ZeroFaces,
            1 => SampleVerdict::ExactlyOneFace(faces.remove(0)),
            n => SampleVerdict::MultipleFaces(n),
        })
    }
}
