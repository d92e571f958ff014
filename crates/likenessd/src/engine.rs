use crate::orchestrator::{Orchestrator, RegistrationError, SessionRequest};
use likeness_capture::{
    CaptureSession, DeviceFingerprint, ReplayDevice, ReplayFeed, StillFrame,
};
use likeness_core::provider::SimilarityHit;
use likeness_core::{
    is_valid_identity, load, BinaryInput, FailureKind, LocationRecord, MatchRecord, PhotoRecord,
    RegistrationResult, StoreError, FACE_MATCH_THRESHOLD,
};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

/// Chunk size used when replaying a received clip into a recording.
const CLIP_CHUNK_BYTES: usize = 64 * 1024;

/// Floor on the idle sweep period.
const MIN_SWEEP_PERIOD: Duration = Duration::from_secs(1);

#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Registration(#[from] RegistrationError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("engine task exited")]
    ChannelClosed,
}

/// Optional context sent with a registration over IPC.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RegisterOptions {
    pub location: Option<LocationRecord>,
    pub fingerprint: Option<DeviceFingerprint>,
    pub video_mime_type: Option<String>,
}

/// Outcome of closing a capture session.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CloseOutcome {
    pub closed: bool,
    pub video_url: Option<String>,
}

/// Session-independent settings the engine applies to every request.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub video_mime_type: String,
    pub max_video_bytes: usize,
    pub host_fingerprint: bool,
    pub collection_id: String,
    /// Open sessions untouched for this long are closed as abandoned.
    pub session_idle_timeout: Duration,
}

/// Messages sent from D-Bus handlers to the engine task.
enum EngineRequest {
    Register {
        identity_id: String,
        image: Vec<u8>,
        video: Vec<u8>,
        options: RegisterOptions,
        reply: oneshot::Sender<RegistrationResult>,
    },
    Search {
        image: Vec<u8>,
        exclude: Option<String>,
        reply: oneshot::Sender<Result<Vec<SimilarityHit>, RegistrationError>>,
    },
    Close {
        identity_id: String,
        reply: oneshot::Sender<CloseOutcome>,
    },
    Link {
        a: String,
        b: String,
        reply: oneshot::Sender<Result<Vec<String>, StoreError>>,
    },
    Unlink {
        identity_id: String,
        reply: oneshot::Sender<Result<(), StoreError>>,
    },
    Matches {
        identity_id: String,
        reply: oneshot::Sender<Result<Vec<MatchRecord>, StoreError>>,
    },
    IndexPhoto {
        photo_id: String,
        image: Vec<u8>,
        reply: oneshot::Sender<Result<PhotoRecord, RegistrationError>>,
    },
    Photos {
        identity_id: String,
        reply: oneshot::Sender<Result<Vec<PhotoRecord>, StoreError>>,
    },
    Status {
        reply: oneshot::Sender<serde_json::Value>,
    },
}

/// Clone-safe handle to the engine task.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
}

impl EngineHandle {
    async fn call<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> EngineRequest,
    ) -> Result<T, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(build(reply_tx))
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)
    }

    /// Register a face for `identity_id`. A failed attempt keeps the
    /// identity's capture session open for a retry.
    pub async fn register(
        &self,
        identity_id: String,
        image: Vec<u8>,
        video: Vec<u8>,
        options: RegisterOptions,
    ) -> Result<RegistrationResult, EngineError> {
        self.call(|reply| EngineRequest::Register {
            identity_id,
            image,
            video,
            options,
            reply,
        })
        .await
    }

    pub async fn search(
        &self,
        image: Vec<u8>,
        exclude: Option<String>,
    ) -> Result<Vec<SimilarityHit>, EngineError> {
        Ok(self
            .call(|reply| EngineRequest::Search {
                image,
                exclude,
                reply,
            })
            .await??)
    }

    pub async fn close(&self, identity_id: String) -> Result<CloseOutcome, EngineError> {
        self.call(|reply| EngineRequest::Close { identity_id, reply })
            .await
    }

    pub async fn link(&self, a: String, b: String) -> Result<Vec<String>, EngineError> {
        Ok(self.call(|reply| EngineRequest::Link { a, b, reply }).await??)
    }

    pub async fn unlink(&self, identity_id: String) -> Result<(), EngineError> {
        Ok(self
            .call(|reply| EngineRequest::Unlink { identity_id, reply })
            .await??)
    }

    pub async fn matches(&self, identity_id: String) -> Result<Vec<MatchRecord>, EngineError> {
        Ok(self
            .call(|reply| EngineRequest::Matches { identity_id, reply })
            .await??)
    }

    /// Index the faces of a group photo and attribute registered identities
    /// found in it.
    pub async fn index_photo(
        &self,
        photo_id: String,
        image: Vec<u8>,
    ) -> Result<PhotoRecord, EngineError> {
        Ok(self
            .call(|reply| EngineRequest::IndexPhoto {
                photo_id,
                image,
                reply,
            })
            .await??)
    }

    pub async fn photos(&self, identity_id: String) -> Result<Vec<PhotoRecord>, EngineError> {
        Ok(self
            .call(|reply| EngineRequest::Photos { identity_id, reply })
            .await??)
    }

    pub async fn status(&self) -> Result<serde_json::Value, EngineError> {
        self.call(|reply| EngineRequest::Status { reply }).await
    }
}

/// Bytes received over IPC: `data:` URI text or raw bytes.
fn wire_input(bytes: Vec<u8>) -> BinaryInput {
    if bytes.starts_with(b"data:") {
        match String::from_utf8(bytes) {
            Ok(text) => BinaryInput::DataUri(text),
            Err(e) => BinaryInput::Raw(e.into_bytes()),
        }
    } else {
        BinaryInput::Raw(bytes)
    }
}

fn clip_digest(clip: &[u8]) -> String {
    format!("{:x}", Sha256::digest(clip))
}

struct OpenSession {
    session: CaptureSession,
    feed: ReplayFeed,
    /// Digest of the last clip received for this session, as sent. The
    /// recording itself may hold less when the size cap cut it.
    last_clip: Option<String>,
    touched_at: Instant,
}

struct Engine {
    orchestrator: Orchestrator,
    settings: EngineSettings,
    sessions: HashMap<String, OpenSession>,
}

impl Engine {
    async fn register(
        &mut self,
        identity_id: String,
        image: Vec<u8>,
        video: Vec<u8>,
        options: RegisterOptions,
    ) -> RegistrationResult {
        let RegisterOptions {
            location,
            fingerprint,
            video_mime_type,
        } = options;
        if !is_valid_identity(&identity_id) {
            return RegistrationResult::failed(
                FailureKind::InvalidIdentity,
                format!("invalid identity id {identity_id:?}"),
            );
        }

        let open = match self.sessions.entry(identity_id.clone()) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                let mime =
                    video_mime_type.unwrap_or_else(|| self.settings.video_mime_type.clone());
                let (device, feed) = ReplayDevice::new(mime);
                match CaptureSession::open(
                    identity_id.clone(),
                    Box::new(device),
                    self.settings.max_video_bytes,
                ) {
                    Ok(session) => entry.insert(OpenSession {
                        session,
                        feed,
                        last_clip: None,
                        touched_at: Instant::now(),
                    }),
                    Err(e) => return RegistrationError::from(e).into_result(),
                }
            }
        };

        open.touched_at = Instant::now();
        // A retry that resends the clip already received reuses that recording.
        if !video.is_empty() {
            let digest = clip_digest(&video);
            if open.last_clip.as_deref() != Some(digest.as_str()) {
                open.feed.push_clip(&video, CLIP_CHUNK_BYTES);
                open.last_clip = Some(digest);
            }
        }
        let still = load(&wire_input(image)).await;
        let content_type = still.content_type.clone();
        open.feed
            .set_still(StillFrame::new(still.into_bytes(), Some(content_type)));

        let fingerprint = fingerprint.or_else(|| {
            self.settings
                .host_fingerprint
                .then(DeviceFingerprint::collect_local)
        });
        let request = SessionRequest {
            location_hint: location,
            fingerprint,
        };
        let result = self
            .orchestrator
            .register_from_session(&mut open.session, request)
            .await;
        open.touched_at = Instant::now();
        if result.success {
            self.sessions.remove(&identity_id);
        }
        result
    }

    async fn close(&mut self, identity_id: &str) -> CloseOutcome {
        let Some(open) = self.sessions.remove(identity_id) else {
            return CloseOutcome::default();
        };
        let uploaded = self.orchestrator.abandon(open.session).await;
        CloseOutcome {
            closed: true,
            video_url: uploaded.map(|u| u.url),
        }
    }

    /// Close every session idle since before `now - session_idle_timeout`.
    /// Returns how many were closed.
    async fn expire_idle(&mut self, now: Instant) -> usize {
        let timeout = self.settings.session_idle_timeout;
        let stale: Vec<String> = self
            .sessions
            .iter()
            .filter(|(_, open)| now.saturating_duration_since(open.touched_at) >= timeout)
            .map(|(identity, _)| identity.clone())
            .collect();
        for identity in &stale {
            let Some(open) = self.sessions.remove(identity) else {
                continue;
            };
            let uploaded = self.orchestrator.abandon(open.session).await;
            tracing::info!(
                identity = %identity,
                idle_secs = timeout.as_secs(),
                video = uploaded.is_some(),
                "idle session closed"
            );
        }
        stale.len()
    }

    fn status(&self) -> serde_json::Value {
        serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "collection_id": self.settings.collection_id,
            "match_threshold": FACE_MATCH_THRESHOLD,
            "open_sessions": self.sessions.len(),
            "session_idle_secs": self.settings.session_idle_timeout.as_secs(),
            "location_sources": self.orchestrator.resolver().source_names(),
        })
    }

    async fn handle(&mut self, request: EngineRequest) {
        match request {
            EngineRequest::Register {
                identity_id,
                image,
                video,
                options,
                reply,
            } => {
                let result = self.register(identity_id, image, video, options).await;
                let _ = reply.send(result);
            }
            EngineRequest::Search {
                image,
                exclude,
                reply,
            } => {
                let result = self
                    .orchestrator
                    .search_face_by_image(&wire_input(image), exclude.as_deref())
                    .await;
                let _ = reply.send(result);
            }
            EngineRequest::Close { identity_id, reply } => {
                let _ = reply.send(self.close(&identity_id).await);
            }
            EngineRequest::Link { a, b, reply } => {
                let _ = reply.send(self.orchestrator.persistence().link_identities(&a, &b).await);
            }
            EngineRequest::Unlink { identity_id, reply } => {
                let _ = reply.send(self.orchestrator.persistence().unlink_identity(&identity_id).await);
            }
            EngineRequest::Matches { identity_id, reply } => {
                let _ = reply.send(self.orchestrator.persistence().matches_for(&identity_id).await);
            }
            EngineRequest::IndexPhoto {
                photo_id,
                image,
                reply,
            } => {
                let result = self
                    .orchestrator
                    .index_photo(&photo_id, &wire_input(image))
                    .await;
                let _ = reply.send(result);
            }
            EngineRequest::Photos { identity_id, reply } => {
                let _ = reply.send(self.orchestrator.persistence().photos_for(&identity_id).await);
            }
            EngineRequest::Status { reply } => {
                let _ = reply.send(self.status());
            }
        }
    }
}

/// Spawn the engine task. Requests are handled one at a time in arrival
/// order; capture sessions live inside the task and are swept for
/// idleness between requests.
pub fn spawn_engine(orchestrator: Orchestrator, settings: EngineSettings) -> EngineHandle {
    let (tx, mut rx) = mpsc::channel::<EngineRequest>(16);
    let period = (settings.session_idle_timeout / 2).max(MIN_SWEEP_PERIOD);
    let mut engine = Engine {
        orchestrator,
        settings,
        sessions: HashMap::new(),
    };
    tokio::spawn(async move {
        tracing::info!(sweep_secs = period.as_secs(), "engine task started");
        let mut sweep = tokio::time::interval(period);
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                request = rx.recv() => match request {
                    Some(request) => engine.handle(request).await,
                    None => break,
                },
                _ = sweep.tick() => {
                    engine.expire_idle(Instant::now()).await;
                }
            }
        }
        for (identity, open) in engine.sessions.drain() {
            if let Some(uploaded) = engine.orchestrator.abandon(open.session).await {
                tracing::info!(identity = %identity, url = %uploaded.url, "open session stored at shutdown");
            }
        }
        tracing::info!("engine task exiting");
    });
    EngineHandle { tx }
}
