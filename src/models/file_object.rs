//! Transient object descriptions exchanged with storage providers.

use super::provider_kind::ProviderKind;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Describes one stored object as reported by a provider.
///
/// Returned by every provider operation. `key` is stable for the lifetime of
/// the object; `url` is empty when the backend has no public endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileObject {
    /// Backend-relative path of the object.
    pub key: String,

    /// Direct access URL, or empty when the backend exposes none.
    pub url: String,

    /// Time-limited URL, only filled in when one was explicitly requested.
    pub signed_url: Option<String>,

    /// Size in bytes.
    pub size: u64,

    /// MIME type.
    pub content_type: String,

    /// When the object was last written.
    pub last_modified: DateTime<Utc>,

    /// Opaque integrity tag (ETag-like).
    pub etag: String,

    /// Backend that holds the bytes.
    pub provider: ProviderKind,
}

/// Access-control hint passed through to backends that support one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessControl {
    Public,
    Private,
}

/// Caller-supplied upload options.
///
/// Providers ignore anything they cannot honor rather than failing.
#[derive(Debug, Clone, Default)]
pub struct UploadOptions {
    /// Desired MIME type; inferred from the key's extension when absent.
    pub content_type: Option<String>,

    /// Free-form metadata.
    pub metadata: HashMap<String, String>,

    /// Access-control hint.
    pub access: Option<AccessControl>,
}

impl UploadOptions {
    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }
}
