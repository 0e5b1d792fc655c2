//! Media metadata records and the media-type classification table.

use super::provider_kind::ProviderKind;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::{fmt, str::FromStr};
use uuid::Uuid;

/// Coarse media classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum MediaType {
    Image,
    Video,
    Audio,
    Document,
    Other,
}

impl MediaType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaType::Image => "image",
            MediaType::Video => "video",
            MediaType::Audio => "audio",
            MediaType::Document => "document",
            MediaType::Other => "other",
        }
    }

    /// Classify from a MIME type such as `image/png`.
    pub fn from_content_type(content_type: &str) -> Option<Self> {
        let essence = content_type
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();
        if essence.is_empty() {
            return None;
        }

        match essence.split_once('/') {
            Some(("image", _)) => Some(MediaType::Image),
            Some(("video", _)) => Some(MediaType::Video),
            Some(("audio", _)) => Some(MediaType::Audio),
            Some(("text", _)) => Some(MediaType::Document),
            Some(("application", _)) => EXTENSIONS
                .iter()
                .find(|(_, _, mime)| *mime == essence)
                .map(|(_, media_type, _)| *media_type),
            _ => None,
        }
    }

    /// Classify from the extension of a file name.
    pub fn from_file_name(file_name: &str) -> Option<Self> {
        lookup_extension(file_name).map(|(media_type, _)| media_type)
    }

    /// Resolve the media type for an upload.
    ///
    /// Order: explicit hint, declared content type, extension table, `Other`.
    pub fn classify(
        hint: Option<MediaType>,
        content_type: Option<&str>,
        file_name: &str,
    ) -> MediaType {
        hint.or_else(|| content_type.and_then(MediaType::from_content_type))
            .or_else(|| MediaType::from_file_name(file_name))
            .unwrap_or(MediaType::Other)
    }
}

impl fmt::Display for MediaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MediaType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "image" => Ok(MediaType::Image),
            "video" => Ok(MediaType::Video),
            "audio" => Ok(MediaType::Audio),
            "document" => Ok(MediaType::Document),
            "other" => Ok(MediaType::Other),
            other => Err(format!("unknown media type `{other}`")),
        }
    }
}

const EXTENSIONS: &[(&str, MediaType, &str)] = &[
    ("jpg", MediaType::Image, "image/jpeg"),
    ("jpeg", MediaType::Image, "image/jpeg"),
    ("png", MediaType::Image, "image/png"),
    ("gif", MediaType::Image, "image/gif"),
    ("webp", MediaType::Image, "image/webp"),
    ("bmp", MediaType::Image, "image/bmp"),
    ("svg", MediaType::Image, "image/svg+xml"),
    ("tif", MediaType::Image, "image/tiff"),
    ("tiff", MediaType::Image, "image/tiff"),
    ("heic", MediaType::Image, "image/heic"),
    ("avif", MediaType::Image, "image/avif"),
    ("ico", MediaType::Image, "image/x-icon"),
    ("mp4", MediaType::Video, "video/mp4"),
    ("m4v", MediaType::Video, "video/x-m4v"),
    ("mov", MediaType::Video, "video/quicktime"),
    ("avi", MediaType::Video, "video/x-msvideo"),
    ("mkv", MediaType::Video, "video/x-matroska"),
    ("webm", MediaType::Video, "video/webm"),
    ("wmv", MediaType::Video, "video/x-ms-wmv"),
    ("mpeg", MediaType::Video, "video/mpeg"),
    ("mp3", MediaType::Audio, "audio/mpeg"),
    ("wav", MediaType::Audio, "audio/wav"),
    ("ogg", MediaType::Audio, "audio/ogg"),
    ("oga", MediaType::Audio, "audio/ogg"),
    ("flac", MediaType::Audio, "audio/flac"),
    ("aac", MediaType::Audio, "audio/aac"),
    ("m4a", MediaType::Audio, "audio/mp4"),
    ("opus", MediaType::Audio, "audio/opus"),
    ("pdf", MediaType::Document, "application/pdf"),
    ("doc", MediaType::Document, "application/msword"),
    (
        "docx",
        MediaType::Document,
        "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
    ),
    ("xls", MediaType::Document, "application/vnd.ms-excel"),
    (
        "xlsx",
        MediaType::Document,
        "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
    ),
    ("ppt", MediaType::Document, "application/vnd.ms-powerpoint"),
    (
        "pptx",
        MediaType::Document,
        "application/vnd.openxmlformats-officedocument.presentationml.presentation",
    ),
    ("odt", MediaType::Document, "application/vnd.oasis.opendocument.text"),
    ("rtf", MediaType::Document, "application/rtf"),
    ("txt", MediaType::Document, "text/plain"),
    ("csv", MediaType::Document, "text/csv"),
    ("md", MediaType::Document, "text/markdown"),
    ("json", MediaType::Document, "application/json"),
];

/// Lowercased extension of the last path segment, if any.
pub fn file_extension(file_name: &str) -> Option<String> {
    let name = file_name.rsplit('/').next().unwrap_or(file_name);
    let (stem, ext) = name.rsplit_once('.')?;
    if stem.is_empty() || ext.is_empty() {
        return None;
    }
    Some(ext.to_ascii_lowercase())
}

fn lookup_extension(file_name: &str) -> Option<(MediaType, &'static str)> {
    let ext = file_extension(file_name)?;
    EXTENSIONS
        .iter()
        .find(|(candidate, _, _)| *candidate == ext)
        .map(|(_, media_type, mime)| (*media_type, *mime))
}

/// MIME type for a key or file name, `application/octet-stream` when unknown.
pub fn guess_content_type(file_name: &str) -> &'static str {
    lookup_extension(file_name)
        .map(|(_, mime)| mime)
        .unwrap_or("application/octet-stream")
}

/// Durable metadata for one uploaded media object.
///
/// Created only after the backend write succeeded; afterwards only
/// `is_deleted` ever changes.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug, PartialEq)]
pub struct Media {
    pub id: Uuid,

    /// Owning user.
    pub user_id: Uuid,

    /// File name as supplied by the client.
    pub file_name: String,

    /// Key of the object inside its provider.
    pub storage_key: String,

    pub size_bytes: i64,

    pub media_type: MediaType,

    pub content_type: String,

    /// Provider that holds the bytes.
    pub provider: ProviderKind,

    /// Public URL at upload time; empty when the provider has none.
    pub url: String,

    pub uploaded_at: DateTime<Utc>,

    #[serde(skip_serializing)]
    pub is_deleted: bool,
}
