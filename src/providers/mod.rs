//! Storage provider abstraction.
//!
//! Every backend (local disk, memory, the S3 family, CDN storage zones)
//! implements [`StorageProvider`]. Callers only ever see the uniform
//! operations; backend differences surface as optional results (an empty
//! direct URL) rather than missing capabilities.

pub mod cdn;
pub mod keys;
pub mod local;
pub mod memory;
pub mod s3;
pub mod signing;

use crate::models::{FileObject, ProviderKind, UploadOptions};
use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, StreamExt, stream};
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use std::{io, pin::Pin, time::Duration};
use thiserror::Error;

/// Upper bound for the buffer reserved up front from a declared size.
const MAX_PREALLOCATION: u64 = 8 * 1024 * 1024;

pub use cdn::CdnProvider;
pub use keys::TraversalPolicy;
pub use local::LocalProvider;
pub use memory::MemoryProvider;
pub use s3::S3Provider;

/// Byte stream used for uploads and downloads.
///
/// Dropping the stream releases the underlying file handle or connection.
pub type ByteStream = Pin<Box<dyn Stream<Item = io::Result<Bytes>> + Send>>;

/// Errors raised by providers, tagged with the failing operation and key.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("object `{0}` not found")]
    NotFound(String),

    #[error("invalid key `{key}`: {reason}")]
    InvalidKey { key: String, reason: String },

    #[error("size mismatch for `{key}`: declared {declared} bytes, received {actual}")]
    SizeMismatch {
        key: String,
        declared: u64,
        actual: u64,
    },

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("provider unavailable: {0}")]
    Unavailable(String),

    #[error("invalid configuration: {0}")]
    Configuration(String),

    #[error("{op} `{key}` failed: {message}")]
    Operation {
        op: &'static str,
        key: String,
        message: String,
    },

    #[error("{op} `{key}` failed: {source}")]
    Io {
        op: &'static str,
        key: String,
        #[source]
        source: io::Error,
    },
}

impl ProviderError {
    pub fn operation(op: &'static str, key: &str, message: impl Into<String>) -> Self {
        Self::Operation {
            op,
            key: key.to_string(),
            message: message.into(),
        }
    }

    pub fn io(op: &'static str, key: &str, source: io::Error) -> Self {
        Self::Io {
            op,
            key: key.to_string(),
            source,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, ProviderError::NotFound(_))
    }
}

pub type ProviderResult<T> = Result<T, ProviderError>;

/// Uniform capability set implemented once per backend kind.
#[async_trait]
pub trait StorageProvider: Send + Sync {
    /// Backend kind; pure, no I/O.
    fn kind(&self) -> ProviderKind;

    /// Store `body` under `key`.
    ///
    /// `declared_size` is `None` for streamed input of unknown length. When it
    /// is set and the received byte count differs, the upload fails with
    /// [`ProviderError::SizeMismatch`] and nothing is left behind.
    async fn upload(
        &self,
        key: &str,
        body: ByteStream,
        declared_size: Option<u64>,
        options: &UploadOptions,
    ) -> ProviderResult<FileObject>;

    /// Direct URL for `key`; an empty string means the backend has none.
    async fn get_url(&self, key: &str) -> ProviderResult<String>;

    /// Time-limited URL for `key`.
    async fn get_signed_url(&self, key: &str, expires_in: Duration) -> ProviderResult<String>;

    /// Remove `key`. Removing an absent key succeeds.
    async fn delete(&self, key: &str) -> ProviderResult<()>;

    /// Metadata for `key` without transferring content.
    async fn get_object(&self, key: &str) -> ProviderResult<FileObject>;

    /// Content stream plus metadata for `key`.
    async fn download(&self, key: &str) -> ProviderResult<(ByteStream, FileObject)>;

    /// Lightweight reachability probe.
    async fn check_health(&self) -> ProviderResult<()>;
}

const PATH_SEGMENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

/// Percent-encode a key for use in a URL path, keeping `/` separators.
pub fn encode_key_path(key: &str) -> String {
    key.split('/')
        .map(|segment| utf8_percent_encode(segment, PATH_SEGMENT).to_string())
        .collect::<Vec<_>>()
        .join("/")
}

/// Join a base URL and a key without doubling slashes.
pub fn join_url(base: &str, key: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), encode_key_path(key))
}

/// Buffer a whole stream, enforcing the declared size.
///
/// Used by backends whose client wants the full body up front.
pub async fn collect_body(
    key: &str,
    mut body: ByteStream,
    declared_size: Option<u64>,
) -> ProviderResult<Bytes> {
    let mut buffer = match declared_size {
        Some(size) => {
            Vec::with_capacity(usize::try_from(size.min(MAX_PREALLOCATION)).unwrap_or_default())
        }
        None => Vec::new(),
    };
    while let Some(chunk) = body.next().await {
        let chunk = chunk.map_err(|err| ProviderError::io("upload", key, err))?;
        buffer.extend_from_slice(&chunk);
        if let Some(declared) = declared_size {
            if buffer.len() as u64 > declared {
                return Err(ProviderError::SizeMismatch {
                    key: key.to_string(),
                    declared,
                    actual: buffer.len() as u64,
                });
            }
        }
    }
    ensure_size(key, declared_size, buffer.len() as u64)?;
    Ok(Bytes::from(buffer))
}

/// Fail with `SizeMismatch` when a declared size disagrees with `actual`.
pub fn ensure_size(key: &str, declared: Option<u64>, actual: u64) -> ProviderResult<()> {
    match declared {
        Some(declared) if declared != actual => Err(ProviderError::SizeMismatch {
            key: key.to_string(),
            declared,
            actual,
        }),
        _ => Ok(()),
    }
}

/// Wrap an in-memory buffer as a single-chunk [`ByteStream`].
pub fn bytes_stream(data: impl Into<Bytes>) -> ByteStream {
    let data = data.into();
    Box::pin(stream::once(async move { Ok(data) }))
}

/// Reject a zero expiry before signing.
pub fn validate_expiry(expires_in: Duration) -> ProviderResult<()> {
    if expires_in.is_zero() {
        return Err(ProviderError::InvalidRequest(
            "signed URL expiry must be positive".into(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_segments_but_keeps_separators() {
        assert_eq!(
            encode_key_path("u/image/20240305/my photo+1.png"),
            "u/image/20240305/my%20photo%2B1.png"
        );
        assert_eq!(
            join_url("https://cdn.example.com/", "a/b.txt"),
            "https://cdn.example.com/a/b.txt"
        );
    }

    #[tokio::test]
    async fn collect_body_enforces_declared_size() {
        let body: ByteStream = Box::pin(stream::iter(vec![
            Ok::<_, io::Error>(Bytes::from_static(b"abc")),
            Ok(Bytes::from_static(b"def")),
        ]));
        let err = collect_body("k", body, Some(4)).await.unwrap_err();
        assert!(matches!(err, ProviderError::SizeMismatch { declared: 4, .. }));

        let short = collect_body("k", bytes_stream("ab"), Some(3)).await.unwrap_err();
        assert!(matches!(short, ProviderError::SizeMismatch { actual: 2, .. }));

        let ok = collect_body("k", bytes_stream("abc"), None).await.unwrap();
        assert_eq!(&ok[..], b"abc");
    }

    #[tokio::test]
    async fn huge_declared_size_is_not_preallocated() {
        let err = collect_body("k", bytes_stream("abc"), Some(u64::MAX))
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::SizeMismatch { actual: 3, .. }));
    }
}
