//! Binary normalizer. Resolves every accepted image/video shape into one
//! owned byte buffer plus a content type.
//!
//! Normalization never fails. Input that cannot be coerced yields a
//! degenerate (empty) buffer labelled with the reason; callers check
//! [`NormalizedBinary::is_degenerate`] before handing bytes to the provider.
//!
//! Async callers use [`load`], which reads blobs without blocking the
//! runtime. [`normalize`] reads them synchronously.

use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD, URL_SAFE, URL_SAFE_NO_PAD};
use base64::Engine;
use std::path::PathBuf;
use std::sync::Arc;

pub const OCTET_STREAM: &str = "application/octet-stream";

/// Opaque handle to bytes held outside the process (a spooled upload, a
/// recorder output file).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobHandle {
    pub path: PathBuf,
    pub content_type: Option<String>,
}

/// Closed set of binary shapes the pipeline accepts.
#[derive(Debug, Clone)]
pub enum BinaryInput {
    /// `data:<mime>;base64,<payload>` text. A bare base64 payload without the
    /// `data:` header is coerced as well.
    DataUri(String),
    /// Shared in-memory buffer. Content type is sniffed.
    Buffer(Arc<[u8]>),
    /// File-backed blob. Read once at normalization time.
    Blob(BlobHandle),
    /// Owned byte array. Content type is sniffed.
    Raw(Vec<u8>),
}

impl From<Vec<u8>> for BinaryInput {
    fn from(bytes: Vec<u8>) -> Self {
        BinaryInput::Raw(bytes)
    }
}

/// Why a normalization produced no bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Degenerate {
    EmptyInput,
    UndecodableText,
    UnreadableBlob,
}

impl std::fmt::Display for Degenerate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Degenerate::EmptyInput => "empty input",
            Degenerate::UndecodableText => "text is not valid base64",
            Degenerate::UnreadableBlob => "blob could not be read",
        };
        f.write_str(s)
    }
}

/// Canonical byte representation produced by [`normalize`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedBinary {
    bytes: Vec<u8>,
    pub content_type: String,
    pub degenerate: Option<Degenerate>,
}

impl NormalizedBinary {
    fn degenerate(reason: Degenerate) -> Self {
        Self {
            bytes: Vec::new(),
            content_type: OCTET_STREAM.to_string(),
            degenerate: Some(reason),
        }
    }

    fn resolved(bytes: Vec<u8>, content_type: Option<String>) -> Self {
        if bytes.is_empty() {
            return Self::degenerate(Degenerate::EmptyInput);
        }
        let content_type = content_type.unwrap_or_else(|| sniff_content_type(&bytes));
        Self {
            bytes,
            content_type,
            degenerate: None,
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Independent copy of the bytes, for consumers that take ownership
    /// (provider request body, object-storage upload).
    pub fn copy_bytes(&self) -> Vec<u8> {
        self.bytes.clone()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn is_degenerate(&self) -> bool {
        self.degenerate.is_some()
    }

    /// File extension matching the content type, for object keys.
    pub fn extension(&self) -> &'static str {
        match self.content_type.as_str() {
            "image/jpeg" => "jpg",
            "image/png" => "png",
            "image/webp" => "webp",
            "image/gif" => "gif",
            "image/bmp" => "bmp",
            ct if ct.starts_with("video/webm") => "webm",
            ct if ct.starts_with("video/mp4") => "mp4",
            _ => "bin",
        }
    }
}

/// Resolve any [`BinaryInput`] into a [`NormalizedBinary`]. The input is
/// only borrowed. Blobs are read with blocking I/O.
pub fn normalize(input: &BinaryInput) -> NormalizedBinary {
    match input {
        BinaryInput::Blob(handle) => from_blob(handle, std::fs::read(&handle.path)),
        other => normalize_in_memory(other),
    }
}

/// [`normalize`] for async callers: blobs are read through `tokio::fs`.
pub async fn load(input: &BinaryInput) -> NormalizedBinary {
    match input {
        BinaryInput::Blob(handle) => from_blob(handle, tokio::fs::read(&handle.path).await),
        other => normalize_in_memory(other),
    }
}

fn normalize_in_memory(input: &BinaryInput) -> NormalizedBinary {
    match input {
        BinaryInput::DataUri(text) => normalize_text(text),
        BinaryInput::Buffer(buf) => NormalizedBinary::resolved(buf.to_vec(), None),
        BinaryInput::Raw(bytes) => NormalizedBinary::resolved(bytes.clone(), None),
        BinaryInput::Blob(_) => NormalizedBinary::degenerate(Degenerate::UnreadableBlob),
    }
}

fn from_blob(handle: &BlobHandle, read: std::io::Result<Vec<u8>>) -> NormalizedBinary {
    match read {
        Ok(bytes) => NormalizedBinary::resolved(bytes, handle.content_type.clone()),
        Err(e) => {
            tracing::warn!(path = %handle.path.display(), error = %e, "blob unreadable");
            NormalizedBinary::degenerate(Degenerate::UnreadableBlob)
        }
    }
}

fn normalize_text(text: &str) -> NormalizedBinary {
    let text = text.trim();
    if text.is_empty() {
        return NormalizedBinary::degenerate(Degenerate::EmptyInput);
    }

    let (declared_type, payload) = match text.strip_prefix("data:") {
        Some(rest) => match rest.split_once(',') {
            Some((header, payload)) => {
                let mime = header.split(';').next().unwrap_or("").trim();
                let mime = (!mime.is_empty()).then(|| mime.to_string());
                (mime, payload)
            }
            None => (None, rest),
        },
        None => (None, text),
    };

    match decode_base64(payload) {
        Some(bytes) => NormalizedBinary::resolved(bytes, declared_type),
        None => NormalizedBinary::degenerate(Degenerate::UndecodableText),
    }
}

/// Decode base64 leniently: whitespace is ignored, and the URL-safe alphabet
/// and unpadded forms are accepted.
fn decode_base64(payload: &str) -> Option<Vec<u8>> {
    let compact: String = payload.chars().filter(|c| !c.is_whitespace()).collect();
    [STANDARD, STANDARD_NO_PAD, URL_SAFE, URL_SAFE_NO_PAD]
        .iter()
        .find_map(|engine| engine.decode(compact.as_bytes()).ok())
}

/// Content type from the leading magic bytes; `application/octet-stream`
/// when unknown.
pub fn sniff_content_type(bytes: &[u8]) -> String {
    if let Ok(format) = image::guess_format(bytes) {
        return format.to_mime_type().to_string();
    }
    // EBML header (WebM/Matroska)
    if bytes.starts_with(&[0x1A, 0x45, 0xDF, 0xA3]) {
        return "video/webm".to_string();
    }
    if bytes.len() >= 8 && &bytes[4..8] == b"ftyp" {
        return "video/mp4".to_string();
    }
    OCTET_STREAM.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    const JPEG_MAGIC: [u8; 4] = [0xFF, 0xD8, 0xFF, 0xE0];
    const PNG_MAGIC: [u8; 8] = [0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A];

    #[test]
    fn test_data_uri_uses_declared_type() {
        let uri = format!("data:image/jpeg;base64,{}", STANDARD.encode(JPEG_MAGIC));
        let n = normalize(&BinaryInput::DataUri(uri));
        assert!(!n.is_degenerate());
        assert_eq!(n.as_bytes(), &JPEG_MAGIC);
        assert_eq!(n.content_type, "image/jpeg");
        assert_eq!(n.extension(), "jpg");
    }

    #[test]
    fn test_bare_base64_is_coerced_and_sniffed() {
        let text = STANDARD.encode(PNG_MAGIC);
        let n = normalize(&BinaryInput::DataUri(text));
        assert_eq!(n.as_bytes(), &PNG_MAGIC);
        assert_eq!(n.content_type, "image/png");
    }

    #[test]
    fn test_base64_with_whitespace_and_url_alphabet() {
        let bytes = vec![0xFB, 0xFF, 0xBF, 0x01, 0x02];
        let wrapped = URL_SAFE.encode(&bytes);
        let (a, b) = wrapped.split_at(3);
        let n = normalize(&BinaryInput::DataUri(format!("{a}\n {b}")));
        assert_eq!(n.as_bytes(), bytes.as_slice());
        assert_eq!(n.content_type, OCTET_STREAM);
    }

    #[test]
    fn test_undecodable_text_is_degenerate() {
        let n = normalize(&BinaryInput::DataUri("data:image/jpeg;base64,@@@not base64@@@".into()));
        assert!(n.is_degenerate());
        assert_eq!(n.degenerate, Some(Degenerate::UndecodableText));
        assert!(n.is_empty());
    }

    #[test]
    fn test_empty_inputs_are_degenerate() {
        assert_eq!(normalize(&BinaryInput::Raw(vec![])).degenerate, Some(Degenerate::EmptyInput));
        assert_eq!(normalize(&BinaryInput::DataUri("  ".into())).degenerate, Some(Degenerate::EmptyInput));
        assert_eq!(
            normalize(&BinaryInput::Buffer(Arc::from(Vec::new()))).degenerate,
            Some(Degenerate::EmptyInput)
        );
    }

    #[test]
    fn test_buffer_is_not_mutated_and_copy_is_independent() {
        let shared: Arc<[u8]> = Arc::from(JPEG_MAGIC.to_vec());
        let input = BinaryInput::Buffer(shared.clone());
        let n = normalize(&input);
        let mut copy = n.copy_bytes();
        copy[0] = 0;
        assert_eq!(n.as_bytes(), &JPEG_MAGIC);
        assert_eq!(&*shared, &JPEG_MAGIC);
    }

    #[test]
    fn test_unreadable_blob_is_degenerate() {
        let handle = BlobHandle {
            path: PathBuf::from("/nonexistent/likeness/blob.jpg"),
            content_type: Some("image/jpeg".into()),
        };
        let n = normalize(&BinaryInput::Blob(handle));
        assert_eq!(n.degenerate, Some(Degenerate::UnreadableBlob));
    }

    #[test]
    fn test_blob_reads_file() {
        let path = std::env::temp_dir().join(format!("likeness-blob-{}.bin", std::process::id()));
        std::fs::write(&path, PNG_MAGIC).unwrap();
        let n = normalize(&BinaryInput::Blob(BlobHandle { path: path.clone(), content_type: None }));
        std::fs::remove_file(&path).ok();
        assert_eq!(n.as_bytes(), &PNG_MAGIC);
        assert_eq!(n.content_type, "image/png");
    }

    #[tokio::test]
    async fn test_load_reads_blob_asynchronously() {
        let path = std::env::temp_dir().join(format!("likeness-load-{}.jpg", std::process::id()));
        tokio::fs::write(&path, JPEG_MAGIC).await.unwrap();
        let handle = BlobHandle { path: path.clone(), content_type: Some("image/jpeg".into()) };
        let n = load(&BinaryInput::Blob(handle)).await;
        tokio::fs::remove_file(&path).await.ok();
        assert_eq!(n.as_bytes(), &JPEG_MAGIC);
        assert_eq!(n.content_type, "image/jpeg");

        let missing = BlobHandle { path: path.clone(), content_type: None };
        assert_eq!(
            load(&BinaryInput::Blob(missing)).await.degenerate,
            Some(Degenerate::UnreadableBlob)
        );
        assert_eq!(load(&BinaryInput::Raw(vec![])).await.degenerate, Some(Degenerate::EmptyInput));
    }

    #[test]
    fn test_sniff_webm() {
        assert_eq!(sniff_content_type(&[0x1A, 0x45, 0xDF, 0xA3, 0x00]), "video/webm");
    }
}
