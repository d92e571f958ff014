//! Face, match and identity-link persistence on top of a [`KvStore`].
//!
//! Keys are `<identity>#<millis>#<suffix>` so every record of one identity
//! can be listed by prefix in chronological order. Identity ids are checked
//! with [`is_valid_identity`] on every call, which keeps `#` out of them and
//! one identity's prefix from covering another's records.

use crate::provider::SimilarityHit;
use crate::store::{tables, KvStore, StoreError};
use crate::types::{
    is_valid_identity, is_valid_photo_id, CaptureVideoRecord, FaceRecord, MatchRecord,
    PhotoMatch, PhotoRecord,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

/// Stored form of one identity's link group (excluding itself).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct LinkItem {
    identity_id: String,
    linked: Vec<String>,
}

/// Counts from one [`Persistence::record_matches`] call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PropagationReport {
    /// Records written for the match pairs themselves (both directions).
    pub direct: usize,
    /// Records written under linked identities.
    pub propagated: usize,
    pub failed: usize,
}

fn identity_prefix(identity_id: &str) -> String {
    format!("{identity_id}#")
}

fn check_identity(identity_id: &str) -> Result<(), StoreError> {
    if is_valid_identity(identity_id) {
        Ok(())
    } else {
        Err(StoreError::InvalidIdentity(identity_id.to_string()))
    }
}

fn check_photo(photo_id: &str) -> Result<(), StoreError> {
    if is_valid_photo_id(photo_id) {
        Ok(())
    } else {
        Err(StoreError::InvalidPhoto(photo_id.to_string()))
    }
}

pub struct Persistence {
    store: Arc<dyn KvStore>,
}

impl Persistence {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self { store }
    }

    pub async fn save_face(&self, record: &FaceRecord) -> Result<(), StoreError> {
        check_identity(&record.identity_id)?;
        let key = format!(
            "{}#{:013}#{}",
            record.identity_id,
            record.indexed_at.timestamp_millis(),
            record.face_id
        );
        self.store
            .put(tables::FACES, &key, serde_json::to_value(record)?)
            .await
    }

    pub async fn faces_for(&self, identity_id: &str) -> Result<Vec<FaceRecord>, StoreError> {
        self.list_as(tables::FACES, identity_id).await
    }

    /// Write one match. Repeated matches of the same pair each get their own
    /// record.
    pub async fn save_match(&self, record: &MatchRecord) -> Result<(), StoreError> {
        check_identity(&record.source_identity_id)?;
        check_identity(&record.target_identity_id)?;
        let key = format!(
            "{}#{:013}#{}",
            record.source_identity_id,
            record.matched_at.timestamp_millis(),
            uuid::Uuid::new_v4()
        );
        self.store
            .put(tables::MATCHES, &key, serde_json::to_value(record)?)
            .await
    }

    /// Matches whose source is `identity_id`.
    pub async fn matches_for(&self, identity_id: &str) -> Result<Vec<MatchRecord>, StoreError> {
        self.list_as(tables::MATCHES, identity_id).await
    }

    pub async fn save_video(&self, record: &CaptureVideoRecord) -> Result<(), StoreError> {
        check_identity(&record.identity_id)?;
        let key = format!("{}#{}", record.identity_id, record.video_id);
        self.store
            .put(tables::CAPTURE_VIDEOS, &key, serde_json::to_value(record)?)
            .await
    }

    pub async fn videos_for(&self, identity_id: &str) -> Result<Vec<CaptureVideoRecord>, StoreError> {
        self.list_as(tables::CAPTURE_VIDEOS, identity_id).await
    }

    pub async fn save_fingerprint(
        &self,
        identity_id: &str,
        digest: &str,
        details: serde_json::Value,
    ) -> Result<(), StoreError> {
        check_identity(identity_id)?;
        let item = serde_json::json!({
            "identity_id": identity_id,
            "digest": digest,
            "details": details,
            "recorded_at": chrono::Utc::now(),
        });
        self.store
            .put(tables::DEVICE_FINGERPRINTS, &format!("{identity_id}#{digest}"), item)
            .await
    }

    /// Identities linked to `identity_id`, excluding itself.
    pub async fn linked_identities(&self, identity_id: &str) -> Result<Vec<String>, StoreError> {
        check_identity(identity_id)?;
        let item = self.store.get(tables::LINKED_IDENTITIES, identity_id).await?;
        match item {
            Some(value) => {
                let link: LinkItem = serde_json::from_value(value)?;
                Ok(link.linked.into_iter().filter(|id| id != identity_id).collect())
            }
            None => Ok(Vec::new()),
        }
    }

    /// Merge the link groups of `a` and `b`. Every member ends up linked to
    /// every other member.
    pub async fn link_identities(&self, a: &str, b: &str) -> Result<Vec<String>, StoreError> {
        check_identity(a)?;
        check_identity(b)?;
        let mut group: BTreeSet<String> = BTreeSet::new();
        group.insert(a.to_string());
        group.insert(b.to_string());
        group.extend(self.linked_identities(a).await?);
        group.extend(self.linked_identities(b).await?);

        for member in &group {
            self.write_links(member, group.iter().filter(|id| *id != member).cloned().collect())
                .await?;
        }
        tracing::info!(a, b, members = group.len(), "identities linked");
        Ok(group.into_iter().collect())
    }

    /// Remove `identity_id` from its link group.
    pub async fn unlink_identity(&self, identity_id: &str) -> Result<(), StoreError> {
        let former = self.linked_identities(identity_id).await?;
        for other in &former {
            let remaining = self
                .linked_identities(other)
                .await?
                .into_iter()
                .filter(|id| id != identity_id)
                .collect();
            self.write_links(other, remaining).await?;
        }
        self.write_links(identity_id, Vec::new()).await?;
        tracing::info!(identity = identity_id, former = former.len(), "identity unlinked");
        Ok(())
    }

    /// Persist historical matches found for `identity_id` and propagate them.
    ///
    /// For each match A→C this writes A→C and C→A, then L→C for every L
    /// linked to A and M→A for every M linked to C. Records that would match
    /// an identity to itself are skipped. A failed link lookup means no
    /// propagation for that identity; a failed write is counted and logged.
    pub async fn record_matches(
        &self,
        identity_id: &str,
        matches: &[MatchRecord],
    ) -> PropagationReport {
        let mut report = PropagationReport::default();
        if matches.is_empty() {
            return report;
        }

        let mut direct = Vec::with_capacity(matches.len() * 2);
        for m in matches {
            direct.push(m.clone());
            direct.push(m.reversed());
        }

        let mut propagated = Vec::new();
        for linked in self.linked_or_empty(identity_id).await {
            propagated.extend(matches.iter().map(|m| m.with_source(&linked)));
        }
        for m in matches {
            let reversed = m.reversed();
            for linked in self.linked_or_empty(&m.target_identity_id).await {
                propagated.push(reversed.with_source(&linked));
            }
        }

        for (record, is_direct) in direct
            .into_iter()
            .map(|r| (r, true))
            .chain(propagated.into_iter().map(|r| (r, false)))
        {
            if record.is_self_match() {
                continue;
            }
            match self.save_match(&record).await {
                Ok(()) if is_direct => report.direct += 1,
                Ok(()) => report.propagated += 1,
                Err(e) => {
                    report.failed += 1;
                    tracing::warn!(
                        source = %record.source_identity_id,
                        target = %record.target_identity_id,
                        error = %e,
                        "failed to persist match"
                    );
                }
            }
        }

        tracing::info!(
            identity = identity_id,
            direct = report.direct,
            propagated = report.propagated,
            failed = report.failed,
            "matches recorded"
        );
        report
    }

    pub async fn save_photo(&self, record: &PhotoRecord) -> Result<(), StoreError> {
        check_photo(&record.photo_id)?;
        self.store
            .put(tables::PHOTOS, &record.photo_id, serde_json::to_value(record)?)
            .await
    }

    pub async fn photo(&self, photo_id: &str) -> Result<Option<PhotoRecord>, StoreError> {
        check_photo(photo_id)?;
        self.store
            .get(tables::PHOTOS, photo_id)
            .await?
            .map(|v| serde_json::from_value(v).map_err(StoreError::from))
            .transpose()
    }

    /// Photos `identity_id` has been attributed to. Scans the photo table.
    pub async fn photos_for(&self, identity_id: &str) -> Result<Vec<PhotoRecord>, StoreError> {
        check_identity(identity_id)?;
        let mut photos = Vec::new();
        for value in self.store.list(tables::PHOTOS, "").await? {
            let photo: PhotoRecord = serde_json::from_value(value)?;
            if photo.has_identity(identity_id) {
                photos.push(photo);
            }
        }
        Ok(photos)
    }

    /// Attribute `identity_id` to the photos its face `face_id` was found in.
    ///
    /// Hits are grouped per photo and the most similar one is kept. A photo
    /// that already lists the identity is left alone. Returns the ids of the
    /// photos that were updated; lookup and write failures are logged and
    /// skip that photo.
    pub async fn attribute_photos(
        &self,
        identity_id: &str,
        face_id: &str,
        photo_hits: &[SimilarityHit],
    ) -> Vec<String> {
        let mut best: BTreeMap<&str, &SimilarityHit> = BTreeMap::new();
        for hit in photo_hits {
            let Some(photo_id) = hit.photo_id() else {
                continue;
            };
            let entry = best.entry(photo_id).or_insert(hit);
            if hit.similarity > entry.similarity {
                *entry = hit;
            }
        }

        let mut updated = Vec::new();
        for (photo_id, hit) in best {
            let mut photo = match self.photo(photo_id).await {
                Ok(Some(photo)) => photo,
                Ok(None) => {
                    tracing::debug!(photo_id, "matched face belongs to an unknown photo");
                    continue;
                }
                Err(e) => {
                    tracing::warn!(photo_id, error = %e, "photo lookup failed");
                    continue;
                }
            };
            if photo.has_identity(identity_id) {
                continue;
            }
            let now = Utc::now();
            photo.matched_users.push(PhotoMatch {
                identity_id: identity_id.to_string(),
                face_id: face_id.to_string(),
                photo_face_id: hit.face_id.clone(),
                similarity: hit.similarity,
                matched_at: now,
            });
            photo.updated_at = now;
            match self.save_photo(&photo).await {
                Ok(()) => updated.push(photo.photo_id),
                Err(e) => tracing::warn!(photo_id, identity = identity_id, error = %e, "photo attribution not saved"),
            }
        }

        if !updated.is_empty() {
            tracing::info!(identity = identity_id, photos = updated.len(), "photos attributed");
        }
        updated
    }

    async fn linked_or_empty(&self, identity_id: &str) -> Vec<String> {
        match self.linked_identities(identity_id).await {
            Ok(ids) => ids,
            Err(e) => {
                tracing::warn!(identity = identity_id, error = %e, "linked identity lookup failed");
                Vec::new()
            }
        }
    }

    async fn write_links(&self, identity_id: &str, linked: Vec<String>) -> Result<(), StoreError> {
        let item = LinkItem {
            identity_id: identity_id.to_string(),
            linked,
        };
        self.store
            .put(tables::LINKED_IDENTITIES, identity_id, serde_json::to_value(item)?)
            .await
    }

    async fn list_as<T: serde::de::DeserializeOwned>(
        &self,
        table: &str,
        identity_id: &str,
    ) -> Result<Vec<T>, StoreError> {
        check_identity(identity_id)?;
        self.store
            .list(table, &identity_prefix(identity_id))
            .await?
            .into_iter()
            .map(|v| serde_json::from_value(v).map_err(StoreError::from))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MemoryKvStore;
    use chrono::Utc;

    fn setup() -> (Arc<MemoryKvStore>, Persistence) {
        let kv = Arc::new(MemoryKvStore::new());
        let persistence = Persistence::new(kv.clone());
        (kv, persistence)
    }

    fn m(source: &str, target: &str) -> MatchRecord {
        MatchRecord {
            source_identity_id: source.into(),
            source_face_id: format!("{source}-face"),
            target_identity_id: target.into(),
            target_face_id: format!("{target}-face"),
            similarity: 91.0,
            matched_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_link_is_symmetric_and_transitive() {
        let (_, p) = setup();
        p.link_identities("a", "b").await.unwrap();
        p.link_identities("b", "c").await.unwrap();

        let mut a = p.linked_identities("a").await.unwrap();
        a.sort();
        assert_eq!(a, vec!["b", "c"]);
        let mut c = p.linked_identities("c").await.unwrap();
        c.sort();
        assert_eq!(c, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_unlink_removes_from_every_member() {
        let (_, p) = setup();
        p.link_identities("a", "b").await.unwrap();
        p.link_identities("a", "c").await.unwrap();
        p.unlink_identity("a").await.unwrap();

        assert!(p.linked_identities("a").await.unwrap().is_empty());
        assert_eq!(p.linked_identities("b").await.unwrap(), vec!["c"]);
        assert_eq!(p.linked_identities("c").await.unwrap(), vec!["b"]);
    }

    #[tokio::test]
    async fn test_record_matches_writes_both_directions() {
        let (_, p) = setup();
        let report = p.record_matches("alice", &[m("alice", "bob")]).await;
        assert_eq!(report, PropagationReport { direct: 2, propagated: 0, failed: 0 });

        let alice = p.matches_for("alice").await.unwrap();
        assert_eq!(alice.len(), 1);
        assert_eq!(alice[0].target_identity_id, "bob");
        let bob = p.matches_for("bob").await.unwrap();
        assert_eq!(bob.len(), 1);
        assert_eq!(bob[0].target_identity_id, "alice");
    }

    #[tokio::test]
    async fn test_record_matches_propagates_to_linked_identities() {
        let (_, p) = setup();
        p.link_identities("alice", "alice-work").await.unwrap();
        p.link_identities("bob", "bob-old").await.unwrap();

        let report = p.record_matches("alice", &[m("alice", "bob")]).await;
        assert_eq!(report.direct, 2);
        assert_eq!(report.propagated, 2);

        let work = p.matches_for("alice-work").await.unwrap();
        assert_eq!(work.len(), 1);
        assert_eq!(work[0].target_identity_id, "bob");

        let old = p.matches_for("bob-old").await.unwrap();
        assert_eq!(old.len(), 1);
        assert_eq!(old[0].target_identity_id, "alice");
    }

    #[tokio::test]
    async fn test_propagation_never_creates_self_match() {
        let (_, p) = setup();
        // bob is linked to alice, so re-expressing alice→bob under bob is skipped
        p.link_identities("alice", "bob").await.unwrap();
        let report = p.record_matches("alice", &[m("alice", "bob")]).await;
        assert_eq!(report.direct, 2);
        assert_eq!(report.propagated, 0);
        for id in ["alice", "bob"] {
            assert!(p.matches_for(id).await.unwrap().iter().all(|r| !r.is_self_match()));
        }
    }

    #[tokio::test]
    async fn test_link_lookup_failure_degrades_to_no_propagation() {
        let (kv, p) = setup();
        kv.fail_table(tables::LINKED_IDENTITIES);
        let report = p.record_matches("alice", &[m("alice", "bob")]).await;
        assert_eq!(report, PropagationReport { direct: 2, propagated: 0, failed: 0 });
    }

    #[tokio::test]
    async fn test_repeated_matches_are_not_deduplicated() {
        let (_, p) = setup();
        p.record_matches("alice", &[m("alice", "bob")]).await;
        p.record_matches("alice", &[m("alice", "bob")]).await;
        assert_eq!(p.matches_for("alice").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_separator_in_identity_is_rejected() {
        let (kv, p) = setup();
        let err = p.save_match(&m("a#b", "carol")).await.unwrap_err();
        assert!(matches!(err, StoreError::InvalidIdentity(ref id) if id == "a#b"));
        assert_eq!(kv.count(tables::MATCHES), 0);

        p.save_match(&m("a", "carol")).await.unwrap();
        assert_eq!(p.matches_for("a").await.unwrap().len(), 1);
        assert!(p.matches_for("a#b").await.is_err());
        assert!(p.link_identities("a", "").await.is_err());
    }

    fn photo(id: &str) -> PhotoRecord {
        PhotoRecord {
            photo_id: id.into(),
            image_url: None,
            face_ids: vec![format!("{id}-f1"), format!("{id}-f2")],
            matched_users: Vec::new(),
            indexed_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn photo_hit(photo_id: &str, face: &str, similarity: f32) -> SimilarityHit {
        SimilarityHit {
            identity_id: Some(crate::provider::photo_external_id(photo_id)),
            face_id: face.into(),
            similarity,
        }
    }

    #[tokio::test]
    async fn test_attribute_photos_once_per_identity() {
        let (_, p) = setup();
        p.save_photo(&photo("party")).await.unwrap();
        let hits = [
            photo_hit("party", "party-f1", 88.0),
            photo_hit("party", "party-f2", 97.0),
            photo_hit("unknown", "u-f1", 99.0),
        ];

        let updated = p.attribute_photos("alice", "a-face", &hits).await;
        assert_eq!(updated, vec!["party"]);
        let stored = p.photo("party").await.unwrap().unwrap();
        assert_eq!(stored.matched_users.len(), 1);
        assert_eq!(stored.matched_users[0].photo_face_id, "party-f2");
        assert_eq!(stored.matched_users[0].similarity, 97.0);

        assert!(p.attribute_photos("alice", "a-face-2", &hits).await.is_empty());
        assert_eq!(p.photos_for("alice").await.unwrap().len(), 1);
        assert!(p.photos_for("bob").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_write_failures_are_counted() {
        let (kv, p) = setup();
        kv.fail_table(tables::MATCHES);
        let report = p.record_matches("alice", &[m("alice", "bob")]).await;
        assert_eq!(report.failed, 2);
        assert_eq!(report.direct, 0);
    }
}
