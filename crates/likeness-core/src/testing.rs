//! In-memory doubles for the provider and storage seams.
//!
//! Enabled by the `testing` feature so downstream crates can use them in
//! their own tests.

use crate::provider::{
    photo_external_id, IndexedFace, ProviderError, RecognitionProvider, SimilarityHit,
};
use crate::store::{KvStore, ObjectStore, StoreError};
use crate::types::{BoundingBox, FaceAttributes};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashSet};
use std::sync::Mutex;

/// Per-operation call counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProviderCalls {
    pub detect: usize,
    pub index: usize,
    pub search: usize,
    pub search_by_image: usize,
    pub delete: usize,
}

#[derive(Default)]
struct ProviderState {
    faces: usize,
    detect_error: Option<String>,
    index_error: Option<String>,
    index_nothing: bool,
    search_error: Option<String>,
    hits: Vec<SimilarityHit>,
    next_face: u32,
    calls: ProviderCalls,
    indexed: Vec<(String, String)>,
    deleted: Vec<String>,
}

/// Recognition provider whose answers are scripted by the test.
#[derive(Default)]
pub struct ScriptedProvider {
    state: Mutex<ProviderState>,
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl ScriptedProvider {
    /// A provider that detects `faces` faces in every image.
    pub fn with_faces(faces: usize) -> Self {
        let provider = Self::default();
        lock(&provider.state).faces = faces;
        provider
    }

    pub fn set_faces(&self, faces: usize) {
        lock(&self.state).faces = faces;
    }

    pub fn fail_detect(&self, message: &str) {
        lock(&self.state).detect_error = Some(message.to_string());
    }

    pub fn fail_index(&self, message: &str) {
        lock(&self.state).index_error = Some(message.to_string());
    }

    pub fn clear_failures(&self) {
        let mut state = lock(&self.state);
        state.detect_error = None;
        state.index_error = None;
        state.search_error = None;
    }

    /// Make indexing succeed without indexing any face.
    pub fn index_nothing(&self) {
        lock(&self.state).index_nothing = true;
    }

    pub fn fail_search(&self, message: &str) {
        lock(&self.state).search_error = Some(message.to_string());
    }

    /// Add a face already present in the collection.
    pub fn push_hit(&self, identity_id: &str, face_id: &str, similarity: f32) {
        lock(&self.state).hits.push(SimilarityHit {
            identity_id: Some(identity_id.to_string()),
            face_id: face_id.to_string(),
            similarity,
        });
    }

    /// Add a group photo face already present in the collection.
    pub fn push_photo_hit(&self, photo_id: &str, face_id: &str, similarity: f32) {
        self.push_hit(&photo_external_id(photo_id), face_id, similarity);
    }

    pub fn calls(&self) -> ProviderCalls {
        lock(&self.state).calls
    }

    /// `(face_id, identity_id)` for every face indexed so far.
    pub fn indexed(&self) -> Vec<(String, String)> {
        lock(&self.state).indexed.clone()
    }

    /// Face ids removed through `delete_face`.
    pub fn deleted(&self) -> Vec<String> {
        lock(&self.state).deleted.clone()
    }

    fn next_face_id(state: &mut ProviderState, external_id: &str) -> String {
        state.next_face += 1;
        let face_id = format!("face-{}", state.next_face);
        state.indexed.push((face_id.clone(), external_id.to_string()));
        face_id
    }

    fn hits_above(state: &ProviderState, threshold: f32, max_results: u32, skip_face: Option<&str>) -> Vec<SimilarityHit> {
        state
            .hits
            .iter()
            .filter(|h| h.similarity >= threshold && Some(h.face_id.as_str()) != skip_face)
            .take(max_results as usize)
            .cloned()
            .collect()
    }
}

fn detected_face(i: usize) -> FaceAttributes {
    FaceAttributes {
        bounding_box: BoundingBox {
            left: 0.1 * i as f32,
            top: 0.2,
            width: 0.3,
            height: 0.4,
        },
        confidence: 99.5,
        ..Default::default()
    }
}

#[async_trait]
impl RecognitionProvider for ScriptedProvider {
    async fn detect_faces(&self, _image: Vec<u8>) -> Result<Vec<FaceAttributes>, ProviderError> {
        let mut state = lock(&self.state);
        state.calls.detect += 1;
        if let Some(msg) = &state.detect_error {
            return Err(ProviderError::Call(msg.clone()));
        }
        Ok((0..state.faces).map(detected_face).collect())
    }

    async fn index_face(
        &self,
        _image: Vec<u8>,
        identity_id: &str,
    ) -> Result<Option<IndexedFace>, ProviderError> {
        let mut state = lock(&self.state);
        state.calls.index += 1;
        if let Some(msg) = &state.index_error {
            return Err(ProviderError::Call(msg.clone()));
        }
        if state.index_nothing {
            return Ok(None);
        }
        let face_id = Self::next_face_id(&mut state, identity_id);
        Ok(Some(IndexedFace {
            face_id,
            attributes: detected_face(0),
        }))
    }

    async fn index_photo_faces(
        &self,
        _image: Vec<u8>,
        external_id: &str,
    ) -> Result<Vec<IndexedFace>, ProviderError> {
        let mut state = lock(&self.state);
        state.calls.index += 1;
        if let Some(msg) = &state.index_error {
            return Err(ProviderError::Call(msg.clone()));
        }
        if state.index_nothing {
            return Ok(Vec::new());
        }
        Ok((0..state.faces)
            .map(|i| IndexedFace {
                face_id: Self::next_face_id(&mut state, external_id),
                attributes: detected_face(i),
            })
            .collect())
    }

    async fn delete_face(&self, face_id: &str) -> Result<(), ProviderError> {
        let mut state = lock(&self.state);
        state.calls.delete += 1;
        state.deleted.push(face_id.to_string());
        state.indexed.retain(|(id, _)| id != face_id);
        Ok(())
    }

    async fn search_by_similarity(
        &self,
        face_id: &str,
        threshold: f32,
        max_results: u32,
    ) -> Result<Vec<SimilarityHit>, ProviderError> {
        let mut state = lock(&self.state);
        state.calls.search += 1;
        if let Some(msg) = &state.search_error {
            return Err(ProviderError::Call(msg.clone()));
        }
        Ok(Self::hits_above(&state, threshold, max_results, Some(face_id)))
    }

    async fn search_by_image(
        &self,
        _image: Vec<u8>,
        threshold: f32,
        max_results: u32,
    ) -> Result<Vec<SimilarityHit>, ProviderError> {
        let mut state = lock(&self.state);
        state.calls.search_by_image += 1;
        if let Some(msg) = &state.search_error {
            return Err(ProviderError::Call(msg.clone()));
        }
        Ok(Self::hits_above(&state, threshold, max_results, None))
    }
}

/// Key-value store backed by a `BTreeMap`.
#[derive(Default)]
pub struct MemoryKvStore {
    items: Mutex<BTreeMap<(String, String), serde_json::Value>>,
    failing_tables: Mutex<HashSet<String>>,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every operation on `table` fail.
    pub fn fail_table(&self, table: &str) {
        lock(&self.failing_tables).insert(table.to_string());
    }

    pub fn count(&self, table: &str) -> usize {
        lock(&self.items).keys().filter(|(t, _)| t == table).count()
    }

    fn check(&self, table: &str) -> Result<(), StoreError> {
        if lock(&self.failing_tables).contains(table) {
            return Err(StoreError::Backend(format!("table {table} unavailable")));
        }
        Ok(())
    }
}

#[async_trait]
impl KvStore for MemoryKvStore {
    async fn put(&self, table: &str, key: &str, item: serde_json::Value) -> Result<(), StoreError> {
        self.check(table)?;
        lock(&self.items).insert((table.to_string(), key.to_string()), item);
        Ok(())
    }

    async fn get(&self, table: &str, key: &str) -> Result<Option<serde_json::Value>, StoreError> {
        self.check(table)?;
        Ok(lock(&self.items).get(&(table.to_string(), key.to_string())).cloned())
    }

    async fn list(&self, table: &str, key_prefix: &str) -> Result<Vec<serde_json::Value>, StoreError> {
        self.check(table)?;
        Ok(lock(&self.items)
            .iter()
            .filter(|((t, k), _)| t == table && k.starts_with(key_prefix))
            .map(|(_, v)| v.clone())
            .collect())
    }
}

/// Object store that keeps objects in memory and hands out `memory://` URLs.
#[derive(Default)]
pub struct MemoryObjectStore {
    objects: Mutex<BTreeMap<String, (Vec<u8>, String)>>,
    failing: Mutex<Option<String>>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_with(&self, message: &str) {
        *lock(&self.failing) = Some(message.to_string());
    }

    pub fn keys(&self) -> Vec<String> {
        lock(&self.objects).keys().cloned().collect()
    }

    pub fn get(&self, key: &str) -> Option<(Vec<u8>, String)> {
        lock(&self.objects).get(key).cloned()
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn put(&self, key: &str, bytes: Vec<u8>, content_type: &str) -> Result<String, StoreError> {
        if let Some(msg) = lock(&self.failing).as_ref() {
            return Err(StoreError::Object(msg.clone()));
        }
        lock(&self.objects).insert(key.to_string(), (bytes, content_type.to_string()));
        Ok(format!("memory://{key}"))
    }
}
