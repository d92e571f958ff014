use crate::engine::{EngineError, EngineHandle, RegisterOptions};
use likeness_core::{is_valid_identity, is_valid_photo_id};
use zbus::interface;

fn to_fdo(e: EngineError) -> zbus::fdo::Error {
    zbus::fdo::Error::Failed(e.to_string())
}

fn to_json<T: serde::Serialize>(value: &T) -> zbus::fdo::Result<String> {
    serde_json::to_string(value).map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
}

fn non_empty(s: &str) -> Option<String> {
    (!s.trim().is_empty()).then(|| s.to_string())
}

/// Identity ids must be usable as provider external ids and record keys.
fn identity_arg(identity: &str) -> zbus::fdo::Result<String> {
    if is_valid_identity(identity) {
        Ok(identity.to_string())
    } else {
        Err(zbus::fdo::Error::InvalidArgs(format!(
            "invalid identity {identity:?}: use 1-255 characters from [A-Za-z0-9_.:-]"
        )))
    }
}

/// D-Bus interface for the Likeness registration daemon.
///
/// Bus name: org.freedesktop.Likeness1
/// Object path: /org/freedesktop/Likeness1
pub struct LikenessService {
    pub engine: EngineHandle,
}

#[interface(name = "org.freedesktop.Likeness1")]
impl LikenessService {
    /// Register a face. `video` may be empty; `options` is a JSON object with
    /// optional `location`, `fingerprint` and `video_mime_type`. Returns the
    /// registration result as JSON. Rejected samples are reported in the
    /// result, not as D-Bus errors.
    async fn register_face(
        &self,
        identity: &str,
        image: Vec<u8>,
        video: Vec<u8>,
        options: &str,
    ) -> zbus::fdo::Result<String> {
        tracing::info!(identity, image_bytes = image.len(), video_bytes = video.len(), "register requested");
        let identity = identity_arg(identity)?;
        let options: RegisterOptions = match non_empty(options) {
            Some(text) => serde_json::from_str(&text)
                .map_err(|e| zbus::fdo::Error::InvalidArgs(format!("options: {e}")))?,
            None => RegisterOptions::default(),
        };
        let result = self
            .engine
            .register(identity, image, video, options)
            .await
            .map_err(to_fdo)?;
        to_json(&result)
    }

    /// Faces of other identities resembling `image`, as a JSON array.
    /// An empty `exclude` excludes nothing.
    async fn search_face_by_image(&self, image: Vec<u8>, exclude: &str) -> zbus::fdo::Result<String> {
        tracing::info!(image_bytes = image.len(), exclude, "search requested");
        let hits = self
            .engine
            .search(image, non_empty(exclude))
            .await
            .map_err(to_fdo)?;
        to_json(&hits)
    }

    /// Abandon the identity's open capture session, if any.
    async fn close_session(&self, identity: &str) -> zbus::fdo::Result<String> {
        tracing::info!(identity, "close requested");
        let outcome = self
            .engine
            .close(identity.to_string())
            .await
            .map_err(to_fdo)?;
        to_json(&outcome)
    }

    /// Link two identities of the same person. Returns the merged group.
    async fn link_identities(&self, a: &str, b: &str) -> zbus::fdo::Result<Vec<String>> {
        tracing::info!(a, b, "link requested");
        if a == b {
            return Err(zbus::fdo::Error::InvalidArgs("cannot link an identity to itself".into()));
        }
        self.engine
            .link(identity_arg(a)?, identity_arg(b)?)
            .await
            .map_err(to_fdo)
    }

    async fn unlink_identity(&self, identity: &str) -> zbus::fdo::Result<bool> {
        tracing::info!(identity, "unlink requested");
        self.engine
            .unlink(identity_arg(identity)?)
            .await
            .map_err(to_fdo)?;
        Ok(true)
    }

    /// Stored matches whose source is `identity`, as a JSON array.
    async fn list_matches(&self, identity: &str) -> zbus::fdo::Result<String> {
        tracing::info!(identity, "list_matches requested");
        let matches = self
            .engine
            .matches(identity_arg(identity)?)
            .await
            .map_err(to_fdo)?;
        to_json(&matches)
    }

    /// Index the faces of a group photo and attribute the registered
    /// identities found in it. Returns the photo record as JSON.
    async fn index_photo(&self, photo_id: &str, image: Vec<u8>) -> zbus::fdo::Result<String> {
        tracing::info!(photo_id, image_bytes = image.len(), "index_photo requested");
        if !is_valid_photo_id(photo_id) {
            return Err(zbus::fdo::Error::InvalidArgs(format!("invalid photo id {photo_id:?}")));
        }
        let photo = self
            .engine
            .index_photo(photo_id.to_string(), image)
            .await
            .map_err(to_fdo)?;
        to_json(&photo)
    }

    /// Photos `identity` has been attributed to, as a JSON array.
    async fn list_photos(&self, identity: &str) -> zbus::fdo::Result<String> {
        tracing::info!(identity, "list_photos requested");
        let photos = self
            .engine
            .photos(identity_arg(identity)?)
            .await
            .map_err(to_fdo)?;
        to_json(&photos)
    }

    /// Return daemon status information.
    async fn status(&self) -> zbus::fdo::Result<String> {
        let status = self.engine.status().await.map_err(to_fdo)?;
        Ok(status.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_arg_rejects_separator() {
        assert_eq!(identity_arg("alice").unwrap(), "alice");
        assert!(matches!(identity_arg("a#b"), Err(zbus::fdo::Error::InvalidArgs(_))));
        assert!(identity_arg("  ").is_err());
    }
}
