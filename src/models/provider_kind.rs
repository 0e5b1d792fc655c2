//! Identifies which backend implementation owns a stored object.

use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};

/// The kind of storage backend.
///
/// A kind is always read from the explicit `kind` field of a provider
/// configuration; it is never inferred from endpoint strings.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, sqlx::Type,
)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum ProviderKind {
    /// Local disk beneath a root directory.
    Local,
    /// Process memory, for development and tests.
    Memory,
    /// Amazon S3.
    S3,
    /// Cloudflare R2 (S3-compatible).
    R2,
    /// MinIO or any self-hosted S3-compatible endpoint.
    Minio,
    /// CDN-backed storage zone.
    Cdn,
}

impl ProviderKind {
    pub const ALL: [ProviderKind; 6] = [
        ProviderKind::Local,
        ProviderKind::Memory,
        ProviderKind::S3,
        ProviderKind::R2,
        ProviderKind::Minio,
        ProviderKind::Cdn,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::Local => "local",
            ProviderKind::Memory => "memory",
            ProviderKind::S3 => "s3",
            ProviderKind::R2 => "r2",
            ProviderKind::Minio => "minio",
            ProviderKind::Cdn => "cdn",
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unsupported provider kind `{0}`")]
pub struct UnknownProviderKind(pub String);

impl FromStr for ProviderKind {
    type Err = UnknownProviderKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ProviderKind::ALL
            .into_iter()
            .find(|kind| kind.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| UnknownProviderKind(s.to_string()))
    }
}
