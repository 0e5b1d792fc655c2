//! Key normalization shared by every provider.

use super::{ProviderError, ProviderResult};
use serde::Deserialize;

pub const MAX_KEY_LEN: usize = 1024;

/// What to do with parent-directory or absolute segments in a key.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TraversalPolicy {
    /// Refuse the key.
    #[default]
    Reject,
    /// Drop the offending segments and keep the rest.
    Strip,
}

/// Normalize a caller-supplied key.
///
/// Backslashes become `/`, empty and `.` segments disappear. `..` segments,
/// a leading `/` and drive prefixes (`C:`) are handled per `policy`. Control
/// characters are always rejected.
pub fn normalize_key(key: &str, policy: TraversalPolicy) -> ProviderResult<String> {
    let invalid = |reason: &str| ProviderError::InvalidKey {
        key: key.to_string(),
        reason: reason.to_string(),
    };

    if key.trim().is_empty() {
        return Err(invalid("key is empty"));
    }
    if key.len() > MAX_KEY_LEN {
        return Err(invalid("key is too long"));
    }
    if key.chars().any(char::is_control) {
        return Err(invalid("key contains control characters"));
    }

    let unified = key.replace('\\', "/");
    if unified.starts_with('/') && policy == TraversalPolicy::Reject {
        return Err(invalid("absolute keys are not allowed"));
    }

    let mut segments = Vec::new();
    for segment in unified.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                if policy == TraversalPolicy::Reject {
                    return Err(invalid("parent directory segments are not allowed"));
                }
            }
            drive if segments.is_empty() && is_drive_prefix(drive) => {
                if policy == TraversalPolicy::Reject {
                    return Err(invalid("absolute keys are not allowed"));
                }
            }
            other => segments.push(other),
        }
    }

    if segments.is_empty() {
        return Err(invalid("key has no usable segments"));
    }
    Ok(segments.join("/"))
}

fn is_drive_prefix(segment: &str) -> bool {
    let bytes = segment.as_bytes();
    bytes.len() == 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':'
}

/// Parent "directory" of a key, without trailing slash.
pub fn parent_prefix(key: &str) -> Option<&str> {
    key.rsplit_once('/').map(|(parent, _)| parent)
}

/// Last segment of a key.
pub fn file_name(key: &str) -> &str {
    key.rsplit('/').next().unwrap_or(key)
}
