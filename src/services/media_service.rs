//! Media use cases: the upload pipeline and the operations on stored media.
//!
//! An upload runs validation, provider resolution, classification, key
//! derivation, a quota check, the backend write, the metadata insert and the
//! quota record, in that order. Each failure names the stage it came from.
//!
//! Bytes under a key are only removed when no live media record points at
//! that key. A successful upload to a key that live records already use
//! retires those records and returns their size to the owner.

use super::{
    cleanup::OrphanCleanup,
    error::{ServiceError, ServiceResult, UploadError, UploadStage},
    quota::QuotaLedger,
    registry::ProviderRegistry,
};
use crate::{
    config::StorageConfig,
    models::{
        FileObject, Media, MediaType, ProviderKind, UploadOptions,
        media::{file_extension, guess_content_type},
    },
    providers::{ByteStream, StorageProvider},
    repositories::{MediaRepository, UserRepository},
};
use chrono::{NaiveDate, Utc};
use futures::{StreamExt, stream};
use std::{
    fmt::Display,
    io,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

const MIN_SIGNED_URL_EXPIRY: Duration = Duration::from_secs(1);
const MAX_SIGNED_URL_EXPIRY: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Limits applied to every upload.
#[derive(Debug, Clone)]
pub struct UploadSettings {
    /// Append a short random suffix so same-day uploads of one name never
    /// share a key. Off means last write wins.
    pub unique_keys: bool,
    pub max_upload_bytes: u64,
    /// Lowercase extensions without the dot; empty allows everything.
    pub allowed_extensions: Vec<String>,
}

impl From<&StorageConfig> for UploadSettings {
    fn from(config: &StorageConfig) -> Self {
        Self {
            unique_keys: config.unique_keys,
            max_upload_bytes: config.max_upload_bytes,
            allowed_extensions: config
                .allowed_extensions
                .iter()
                .map(|ext| ext.trim().trim_start_matches('.').to_ascii_lowercase())
                .filter(|ext| !ext.is_empty())
                .collect(),
        }
    }
}

/// One "store this file for this user" request.
#[derive(Debug, Clone)]
pub struct UploadRequest {
    pub user_id: Uuid,
    pub file_name: String,
    /// `None` for streamed input of unknown length.
    pub declared_size: Option<u64>,
    pub content_type: Option<String>,
    pub provider: Option<ProviderKind>,
    pub media_type: Option<MediaType>,
}

/// Reduce a client-supplied file name to a single safe path segment.
///
/// Directory parts are dropped and anything outside letters, digits, `.`,
/// `-` and `_` becomes `_`. Returns `None` when nothing usable remains.
pub fn sanitize_file_name(name: &str) -> Option<String> {
    let base = name.rsplit(['/', '\\']).next().unwrap_or(name).trim();
    let cleaned: String = base
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let cleaned = cleaned.trim_start_matches('.');
    if cleaned.is_empty() || cleaned.chars().all(|c| c == '_') {
        return None;
    }
    Some(cleaned.to_string())
}

/// `{user}/{media type}/{YYYYMMDD}/{file name}`.
pub fn derive_storage_key(
    user_id: impl Display,
    media_type: MediaType,
    date: NaiveDate,
    file_name: &str,
) -> String {
    format!("{user_id}/{media_type}/{}/{file_name}", date.format("%Y%m%d"))
}

/// Insert `-{suffix}` before the extension.
fn with_suffix(file_name: &str, suffix: &str) -> String {
    match file_name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => format!("{stem}-{suffix}.{ext}"),
        _ => format!("{file_name}-{suffix}"),
    }
}

/// What the upload guard saw of a request body.
#[derive(Debug, Default)]
struct BodyStats {
    received: AtomicU64,
    refused: AtomicBool,
}

impl BodyStats {
    /// The validation failure the guard cut the body off for, if any.
    fn refusal(&self, limit: u64) -> Option<ServiceError> {
        if !self.refused.load(Ordering::Acquire) {
            return None;
        }
        let message = match self.received.load(Ordering::Acquire) {
            0 => "file is empty".to_string(),
            received => format!("file exceeds the limit of {limit} bytes ({received} received)"),
        };
        Some(ServiceError::Validation(message))
    }
}

/// Count the bytes a provider pulls from `body`.
///
/// The stream fails as soon as more than `limit` bytes arrived, or at its end
/// when nothing arrived, so the provider aborts before committing the object.
fn guard_body(body: ByteStream, limit: u64) -> (ByteStream, Arc<BodyStats>) {
    let stats = Arc::new(BodyStats::default());
    let seen = stats.clone();
    let guarded = stream::unfold(Some(body), move |state| {
        let stats = seen.clone();
        async move {
            let mut body = state?;
            match body.next().await {
                Some(Ok(chunk)) => {
                    let len = chunk.len() as u64;
                    let received = stats.received.fetch_add(len, Ordering::AcqRel) + len;
                    if received > limit {
                        stats.refused.store(true, Ordering::Release);
                        let err = io::Error::new(
                            io::ErrorKind::InvalidData,
                            format!("body exceeds {limit} bytes"),
                        );
                        return Some((Err(err), None));
                    }
                    Some((Ok(chunk), Some(body)))
                }
                Some(Err(err)) => Some((Err(err), None)),
                None if stats.received.load(Ordering::Acquire) == 0 => {
                    stats.refused.store(true, Ordering::Release);
                    let err = io::Error::new(io::ErrorKind::UnexpectedEof, "body is empty");
                    Some((Err(err), None))
                }
                None => None,
            }
        }
    });
    (Box::pin(guarded), stats)
}

pub struct MediaService {
    registry: Arc<ProviderRegistry>,
    quota: QuotaLedger,
    media: Arc<dyn MediaRepository>,
    cleanup: OrphanCleanup,
    settings: UploadSettings,
}

impl MediaService {
    pub fn new(
        registry: Arc<ProviderRegistry>,
        users: Arc<dyn UserRepository>,
        media: Arc<dyn MediaRepository>,
        cleanup: OrphanCleanup,
        settings: UploadSettings,
    ) -> Self {
        Self {
            registry,
            quota: QuotaLedger::new(users),
            media,
            cleanup,
            settings,
        }
    }

    fn validate(&self, request: &UploadRequest) -> ServiceResult<String> {
        let file_name = sanitize_file_name(&request.file_name).ok_or_else(|| {
            ServiceError::Validation("file name must not be empty".to_string())
        })?;

        if request.declared_size == Some(0) {
            return Err(ServiceError::Validation("file is empty".to_string()));
        }
        if let Some(size) = request.declared_size {
            self.check_ceiling(size)?;
        }

        if !self.settings.allowed_extensions.is_empty() {
            let allowed = file_extension(&file_name)
                .is_some_and(|ext| self.settings.allowed_extensions.contains(&ext));
            if !allowed {
                return Err(ServiceError::Validation(format!(
                    "file extension of `{file_name}` is not allowed"
                )));
            }
        }

        if let Some(kind) = request.provider {
            if !self.registry.contains(kind) {
                return Err(ServiceError::Configuration(format!(
                    "provider `{kind}` is not configured"
                )));
            }
        }
        Ok(file_name)
    }

    fn check_ceiling(&self, size: u64) -> ServiceResult<()> {
        if size > self.settings.max_upload_bytes {
            return Err(ServiceError::Validation(format!(
                "file is {size} bytes, the limit is {} bytes",
                self.settings.max_upload_bytes
            )));
        }
        Ok(())
    }

    async fn provider_for(&self, kind: ProviderKind) -> ServiceResult<Arc<dyn StorageProvider>> {
        self.registry.get(kind).await
    }

    /// Whether a live media record points at `key`. Lookup failures count as
    /// referenced.
    async fn key_in_use(&self, kind: ProviderKind, key: &str) -> bool {
        match self.media.live_for_key(kind, key).await {
            Ok(records) => !records.is_empty(),
            Err(err) => {
                warn!(provider = %kind, key, "could not check references: {}", err);
                true
            }
        }
    }

    /// Remove an object that must not stay stored, unless live media still
    /// points at it. Falls back to the cleanup worker when the inline delete
    /// fails.
    async fn discard(&self, provider: &dyn StorageProvider, key: &str, reason: &str) {
        if self.key_in_use(provider.kind(), key).await {
            info!(provider = %provider.kind(), key, "keeping object still referenced by live media");
            return;
        }
        if let Err(err) = provider.delete(key).await {
            warn!(provider = %provider.kind(), key, "inline delete failed: {}", err);
            self.cleanup.schedule(provider.kind(), key, reason);
        }
    }

    /// Retire live records whose key `current` now occupies and give their
    /// size back to the owner.
    async fn retire_superseded(&self, current: &Media) {
        let sharing = match self
            .media
            .live_for_key(current.provider, &current.storage_key)
            .await
        {
            Ok(records) => records,
            Err(err) => {
                warn!(media_id = %current.id, "could not look up superseded media: {}", err);
                return;
            }
        };

        for previous in sharing.into_iter().filter(|media| media.id != current.id) {
            match self.media.mark_deleted(previous.id).await {
                Ok(true) => {
                    let size = u64::try_from(previous.size_bytes).unwrap_or_default();
                    if let Err(err) = self.quota.release(previous.user_id, size).await {
                        error!(media_id = %previous.id, "could not release quota: {}", err);
                    }
                    info!(
                        media_id = %previous.id,
                        replaced_by = %current.id,
                        key = %current.storage_key,
                        "retired superseded media"
                    );
                }
                Ok(false) => {}
                Err(err) => {
                    warn!(media_id = %previous.id, "could not retire superseded media: {}", err);
                }
            }
        }
    }

    /// Store `body` for `request.user_id` and record it.
    #[instrument(
        skip(self, request, body),
        fields(user_id = %request.user_id, file_name = %request.file_name)
    )]
    pub async fn upload_file(
        &self,
        request: UploadRequest,
        body: ByteStream,
    ) -> Result<Media, UploadError> {
        let now = Utc::now();
        let file_name = self
            .validate(&request)
            .map_err(|err| UploadError::new(UploadStage::Validation, err))?;

        let kind = request.provider.unwrap_or(self.registry.default_kind());
        let media_type = MediaType::classify(
            request.media_type,
            request.content_type.as_deref(),
            &file_name,
        );
        let stored_name = if self.settings.unique_keys {
            let id = Uuid::new_v4().simple().to_string();
            with_suffix(&file_name, &id[..8])
        } else {
            file_name.clone()
        };
        let key = derive_storage_key(request.user_id, media_type, now.date_naive(), &stored_name);

        self.quota
            .can_upload(request.user_id, request.declared_size)
            .await
            .map_err(|err| UploadError::new(UploadStage::Quota, err))?;

        let provider = self
            .provider_for(kind)
            .await
            .map_err(|err| UploadError::new(UploadStage::Backend, err))?;
        let content_type = request
            .content_type
            .clone()
            .filter(|value| !value.trim().is_empty())
            .unwrap_or_else(|| guess_content_type(&file_name).to_string());
        let options = UploadOptions::default().with_content_type(content_type);

        let limit = self.settings.max_upload_bytes;
        let (body, stats) = guard_body(body, limit);
        let object = provider
            .upload(&key, body, request.declared_size, &options)
            .await
            .map_err(|err| match stats.refusal(limit) {
                Some(refusal) => UploadError::new(UploadStage::Validation, refusal),
                None => UploadError::new(UploadStage::Backend, err),
            })?;

        let record = Media {
            id: Uuid::new_v4(),
            user_id: request.user_id,
            file_name: request.file_name.trim().to_string(),
            storage_key: object.key.clone(),
            size_bytes: i64::try_from(object.size).unwrap_or(i64::MAX),
            media_type,
            content_type: object.content_type.clone(),
            provider: kind,
            url: object.url.clone(),
            uploaded_at: now,
            is_deleted: false,
        };

        let media = match self.media.create_media(&record).await {
            Ok(media) => media,
            Err(err) => {
                error!(key = %object.key, "metadata write failed, object orphaned: {}", err);
                self.cleanup
                    .schedule(kind, object.key.clone(), "metadata write failed");
                return Err(UploadError::new(UploadStage::Metadata, err));
            }
        };

        if let Err(err) = self.quota.record_upload(request.user_id, object.size).await {
            warn!(media_id = %media.id, "rejecting upload after the fact: {}", err);
            if let Err(mark_err) = self.media.mark_deleted(media.id).await {
                error!(media_id = %media.id, "could not retract media record: {}", mark_err);
            }
            self.discard(provider.as_ref(), &object.key, "quota exceeded after upload")
                .await;
            return Err(UploadError::new(UploadStage::Quota, err));
        }

        self.retire_superseded(&media).await;

        info!(
            media_id = %media.id,
            provider = %kind,
            key = %media.storage_key,
            size = media.size_bytes,
            "stored media"
        );
        Ok(media)
    }

    /// A live media record owned by `user_id`.
    pub async fn get_media(&self, user_id: Uuid, media_id: Uuid) -> ServiceResult<Media> {
        let media = self.media.find_media(media_id).await?;
        if media.user_id != user_id {
            return Err(ServiceError::NotFound(format!("media `{media_id}` not found")));
        }
        Ok(media)
    }

    pub async fn list_media(&self, user_id: Uuid) -> ServiceResult<Vec<Media>> {
        Ok(self.media.list_for_user(user_id).await?)
    }

    /// Stream the bytes of a media record from its provider.
    pub async fn download(
        &self,
        user_id: Uuid,
        media_id: Uuid,
    ) -> ServiceResult<(Media, ByteStream, FileObject)> {
        let media = self.get_media(user_id, media_id).await?;
        let provider = self.provider_for(media.provider).await?;
        let (stream, object) = provider.download(&media.storage_key).await?;
        Ok((media, stream, object))
    }

    /// Metadata of the stored object with a time-limited URL filled in.
    #[instrument(skip(self))]
    pub async fn get_signed_url(
        &self,
        user_id: Uuid,
        media_id: Uuid,
        expires_in: Duration,
    ) -> ServiceResult<FileObject> {
        if !(MIN_SIGNED_URL_EXPIRY..=MAX_SIGNED_URL_EXPIRY).contains(&expires_in) {
            return Err(ServiceError::Validation(format!(
                "expiry must be between {} and {} seconds",
                MIN_SIGNED_URL_EXPIRY.as_secs(),
                MAX_SIGNED_URL_EXPIRY.as_secs()
            )));
        }
        let media = self.get_media(user_id, media_id).await?;
        let provider = self.provider_for(media.provider).await?;
        let mut object = provider.get_object(&media.storage_key).await?;
        object.signed_url = Some(
            provider
                .get_signed_url(&media.storage_key, expires_in)
                .await?,
        );
        Ok(object)
    }

    /// Soft-delete the record, give back the quota and remove the bytes.
    ///
    /// A failing backend delete is logged and retried in the background; the
    /// caller still sees success.
    #[instrument(skip(self))]
    pub async fn delete_media(&self, user_id: Uuid, media_id: Uuid) -> ServiceResult<()> {
        let media = self.get_media(user_id, media_id).await?;
        if !self.media.mark_deleted(media.id).await? {
            return Err(ServiceError::NotFound(format!("media `{media_id}` not found")));
        }

        let size = u64::try_from(media.size_bytes).unwrap_or_default();
        if let Err(err) = self.quota.release(user_id, size).await {
            error!(%media_id, "could not release quota: {}", err);
        }

        if self.key_in_use(media.provider, &media.storage_key).await {
            info!(%media_id, key = %media.storage_key, "object still referenced, not deleting");
            return Ok(());
        }

        let removed = match self.provider_for(media.provider).await {
            Ok(provider) => provider.delete(&media.storage_key).await.map_err(ServiceError::from),
            Err(err) => Err(err),
        };
        if let Err(err) = removed {
            error!(
                %media_id,
                provider = %media.provider,
                key = %media.storage_key,
                "backend delete failed, needs reconciliation: {}",
                err
            );
            self.cleanup
                .schedule(media.provider, media.storage_key, "media deleted");
        }
        Ok(())
    }
}
