//! Object stores for face images and capture videos.

use async_trait::async_trait;
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::primitives::ByteStream;
use likeness_core::{ObjectStore, StoreError};
use std::path::{Component, Path, PathBuf};

/// S3 bucket. URLs are `<public_base>/<key>`, defaulting to the bucket's
/// virtual-hosted endpoint.
pub struct S3ObjectStore {
    client: aws_sdk_s3::Client,
    bucket: String,
    public_base: String,
}

impl S3ObjectStore {
    pub fn new(client: aws_sdk_s3::Client, bucket: impl Into<String>, region: &str) -> Self {
        let bucket = bucket.into();
        let public_base = format!("https://{bucket}.s3.{region}.amazonaws.com");
        Self {
            client,
            bucket,
            public_base,
        }
    }

    /// Serve objects from a different base URL (CDN or S3-compatible endpoint).
    pub fn with_public_base(mut self, base: impl Into<String>) -> Self {
        self.public_base = base.into().trim_end_matches('/').to_string();
        self
    }

    pub fn url_for(&self, key: &str) -> String {
        format!("{}/{}", self.public_base, key)
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn put(&self, key: &str, bytes: Vec<u8>, content_type: &str) -> Result<String, StoreError> {
        let size = bytes.len();
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .content_type(content_type)
            .body(ByteStream::from(bytes))
            .send()
            .await
            .map_err(|e| StoreError::Object(DisplayErrorContext(&e).to_string()))?;
        tracing::debug!(bucket = %self.bucket, key, size, "object stored");
        Ok(self.url_for(key))
    }
}

/// Local directory, for single-host deployments. URLs are `file://` paths.
pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, StoreError> {
        let relative = Path::new(key);
        if relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)))
        {
            return Err(StoreError::Object(format!("invalid object key: {key}")));
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    async fn put(&self, key: &str, bytes: Vec<u8>, _content_type: &str) -> Result<String, StoreError> {
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| StoreError::Object(format!("{}: {e}", parent.display())))?;
        }
        tokio::fs::write(&path, &bytes)
            .await
            .map_err(|e| StoreError::Object(format!("{}: {e}", path.display())))?;
        tracing::debug!(path = %path.display(), size = bytes.len(), "object stored");
        Ok(format!("file://{}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_root(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("likeness-obj-{name}-{}", std::process::id()))
    }

    #[tokio::test]
    async fn test_fs_put_writes_file() {
        let root = temp_root("put");
        let store = FsObjectStore::new(&root);
        let url = store
            .put("faces/alice/1.jpg", vec![0xFF, 0xD8], "image/jpeg")
            .await
            .unwrap();
        let path = root.join("faces/alice/1.jpg");
        assert_eq!(url, format!("file://{}", path.display()));
        assert_eq!(std::fs::read(&path).unwrap(), vec![0xFF, 0xD8]);
        let _ = std::fs::remove_dir_all(root);
    }

    #[tokio::test]
    async fn test_fs_rejects_escaping_keys() {
        let store = FsObjectStore::new(temp_root("escape"));
        for key in ["../etc/passwd", "/abs/path", "faces/../../x"] {
            assert!(matches!(
                store.put(key, vec![1], "application/octet-stream").await,
                Err(StoreError::Object(_))
            ));
        }
    }

    #[test]
    fn test_s3_url_layout() {
        let conf = aws_sdk_s3::Config::builder()
            .behavior_version(aws_sdk_s3::config::BehaviorVersion::latest())
            .region(aws_sdk_s3::config::Region::new("eu-central-1"))
            .build();
        let client = aws_sdk_s3::Client::from_conf(conf);
        let store = S3ObjectStore::new(client.clone(), "faces-bucket", "eu-central-1");
        assert_eq!(
            store.url_for("videos/alice/v.webm"),
            "https://faces-bucket.s3.eu-central-1.amazonaws.com/videos/alice/v.webm"
        );
        let cdn = S3ObjectStore::new(client, "faces-bucket", "eu-central-1")
            .with_public_base("https://cdn.example.com/");
        assert_eq!(cdn.url_for("k"), "https://cdn.example.com/k");
    }
}
