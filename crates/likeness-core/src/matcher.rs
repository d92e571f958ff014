//! Historical matching: similarity search for a newly indexed face, with
//! self-matches removed. Group photo faces found by the same search are
//! returned apart from identity matches.

use crate::binary::NormalizedBinary;
use crate::provider::{
    ProviderError, RecognitionProvider, SimilarityHit, FACE_MATCH_THRESHOLD, MAX_SEARCH_RESULTS,
};
use crate::types::MatchRecord;
use chrono::Utc;
use std::sync::Arc;

/// Keep only candidates at or above the threshold that belong to another
/// identity and are not the searched face itself. Photo faces are dropped.
pub fn filter_candidates(
    hits: Vec<SimilarityHit>,
    searching_identity: Option<&str>,
    searched_face: Option<&str>,
) -> Vec<SimilarityHit> {
    hits.into_iter()
        .filter(|hit| {
            if hit.similarity < FACE_MATCH_THRESHOLD {
                return false;
            }
            if searched_face == Some(hit.face_id.as_str()) {
                return false;
            }
            if hit.photo_id().is_some() {
                return false;
            }
            match (&hit.identity_id, searching_identity) {
                (None, _) => {
                    tracing::debug!(face_id = %hit.face_id, "skipping candidate without identity");
                    false
                }
                (Some(id), Some(me)) => id != me,
                (Some(_), None) => true,
            }
        })
        .collect()
}

/// Result of one historical search.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HistoricalSearch {
    pub matches: Vec<MatchRecord>,
    /// Group photo faces at or above the threshold.
    pub photo_hits: Vec<SimilarityHit>,
}

pub struct HistoricalMatcher {
    provider: Arc<dyn RecognitionProvider>,
}

impl HistoricalMatcher {
    pub fn new(provider: Arc<dyn RecognitionProvider>) -> Self {
        Self { provider }
    }

    /// Prior faces of other identities resembling `face_id`, plus the group
    /// photo faces it resembles.
    pub async fn find_matches(
        &self,
        identity_id: &str,
        face_id: &str,
    ) -> Result<HistoricalSearch, ProviderError> {
        let hits = self
            .provider
            .search_by_similarity(face_id, FACE_MATCH_THRESHOLD, MAX_SEARCH_RESULTS)
            .await?;
        let total = hits.len();
        let now = Utc::now();
        let photo_hits: Vec<SimilarityHit> = hits
            .iter()
            .filter(|hit| hit.photo_id().is_some() && hit.similarity >= FACE_MATCH_THRESHOLD)
            .cloned()
            .collect();

        let matches: Vec<MatchRecord> = filter_candidates(hits, Some(identity_id), Some(face_id))
            .into_iter()
            .filter_map(|hit| {
                Some(MatchRecord {
                    source_identity_id: identity_id.to_string(),
                    source_face_id: face_id.to_string(),
                    target_identity_id: hit.identity_id?,
                    target_face_id: hit.face_id,
                    similarity: hit.similarity,
                    matched_at: now,
                })
            })
            .collect();

        tracing::info!(
            identity = identity_id,
            face_id,
            candidates = total,
            matches = matches.len(),
            photos = photo_hits.len(),
            "historical search complete"
        );
        Ok(HistoricalSearch {
            matches,
            photo_hits,
        })
    }

    /// Registered identities whose faces resemble the indexed face
    /// `face_id`. Used to attribute a newly indexed photo face.
    pub async fn identities_like(&self, face_id: &str) -> Result<Vec<SimilarityHit>, ProviderError> {
        let hits = self
            .provider
            .search_by_similarity(face_id, FACE_MATCH_THRESHOLD, MAX_SEARCH_RESULTS)
            .await?;
        Ok(filter_candidates(hits, None, Some(face_id)))
    }

    /// Ad hoc lookup outside registration. Nothing is indexed or persisted.
    pub async fn search_by_image(
        &self,
        image: &NormalizedBinary,
        exclude_identity: Option<&str>,
    ) -> Result<Vec<SimilarityHit>, ProviderError> {
        let hits = self
            .provider
            .search_by_image(image.copy_bytes(), FACE_MATCH_THRESHOLD, MAX_SEARCH_RESULTS)
            .await?;
        Ok(filter_candidates(hits, exclude_identity, None))
    }
}
