//! CDN storage-zone backend.
//!
//! Objects are written through the zone's storage API
//! (`PUT/GET/DELETE {endpoint}/{zone}/{key}` authenticated with an
//! `AccessKey` header) and served from the pull zone. Metadata is only
//! exposed through directory listings, so it can lag behind writes.
//! Signed URLs use the pull zone's token authentication, so both the pull
//! zone URL and its token key are required.

use super::{
    ByteStream, ProviderError, ProviderResult, StorageProvider, TraversalPolicy, collect_body,
    encode_key_path, join_url,
    keys::{file_name, normalize_key, parent_prefix},
    validate_expiry,
};
use crate::models::{FileObject, ProviderKind, UploadOptions, media::guess_content_type};
use async_trait::async_trait;
use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use chrono::{DateTime, NaiveDateTime, Utc};
use futures::TryStreamExt;
use reqwest::{Client, StatusCode, Url};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::{fmt, io, time::Duration};
use tracing::{debug, info, warn};

const ACCESS_KEY_HEADER: &str = "AccessKey";

fn default_timeout_secs() -> u64 {
    30
}

/// Settings for [`CdnProvider`].
#[derive(Clone, Deserialize)]
pub struct CdnConfig {
    /// Storage API endpoint, e.g. `https://storage.bunnycdn.com`.
    pub storage_endpoint: String,
    pub storage_zone: String,
    pub access_key: String,
    /// Public pull-zone URL objects are served from. Required.
    #[serde(default)]
    pub pull_zone_url: Option<String>,
    /// Token authentication key for signed pull-zone URLs. Required.
    #[serde(default)]
    pub token_key: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl fmt::Debug for CdnConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CdnConfig")
            .field("storage_endpoint", &self.storage_endpoint)
            .field("storage_zone", &self.storage_zone)
            .field("access_key", &"<redacted>")
            .field("pull_zone_url", &self.pull_zone_url)
            .field("token_key", &self.token_key.as_ref().map(|_| "<redacted>"))
            .field("timeout_secs", &self.timeout_secs)
            .finish()
    }
}

impl CdnConfig {
    pub fn validate(&self) -> ProviderResult<()> {
        let missing =
            |field: &str| ProviderError::Configuration(format!("cdn provider requires `{field}`"));
        if self.storage_zone.trim().is_empty() {
            return Err(missing("storage_zone"));
        }
        if self.access_key.trim().is_empty() {
            return Err(missing("access_key"));
        }
        let pull_zone_url = present(&self.pull_zone_url).ok_or_else(|| missing("pull_zone_url"))?;
        present(&self.token_key).ok_or_else(|| missing("token_key"))?;
        for url in [self.storage_endpoint.as_str(), pull_zone_url] {
            Url::parse(url).map_err(|err| {
                ProviderError::Configuration(format!("cdn url `{url}` is invalid: {err}"))
            })?;
        }
        Ok(())
    }
}

fn present(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|value| !value.is_empty())
}

/// One entry of a storage-zone directory listing.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct StorageEntry {
    object_name: String,
    #[serde(default)]
    length: u64,
    #[serde(default)]
    last_changed: Option<String>,
    #[serde(default)]
    checksum: Option<String>,
    #[serde(default)]
    is_directory: bool,
}

fn parse_last_changed(value: Option<&str>) -> DateTime<Utc> {
    value
        .and_then(|raw| {
            DateTime::parse_from_rfc3339(raw)
                .map(|dt| dt.with_timezone(&Utc))
                .ok()
                .or_else(|| {
                    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
                        .ok()
                        .map(|naive| naive.and_utc())
                })
        })
        .unwrap_or_else(Utc::now)
}

fn map_transport(op: &'static str, key: &str, err: reqwest::Error) -> ProviderError {
    if err.is_timeout() || err.is_connect() {
        ProviderError::Unavailable(format!("{op} `{key}`: {err}"))
    } else {
        ProviderError::operation(op, key, err.to_string())
    }
}

fn map_status(op: &'static str, key: &str, status: StatusCode) -> ProviderError {
    match status {
        StatusCode::NOT_FOUND => ProviderError::NotFound(key.to_string()),
        status if status.is_server_error() => {
            ProviderError::Unavailable(format!("{op} `{key}`: storage zone returned {status}"))
        }
        status => ProviderError::operation(op, key, format!("storage zone returned {status}")),
    }
}

pub struct CdnProvider {
    client: Client,
    storage_base: String,
    pull_zone_url: String,
    access_key: String,
    token_key: String,
}

impl fmt::Debug for CdnProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CdnProvider")
            .field("storage_base", &self.storage_base)
            .field("pull_zone_url", &self.pull_zone_url)
            .finish_non_exhaustive()
    }
}

impl CdnProvider {
    pub fn new(config: CdnConfig) -> ProviderResult<Self> {
        config.validate()?;
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs.max(1)))
            .build()
            .map_err(|err| ProviderError::Configuration(format!("http client: {err}")))?;
        Self::with_client(config, client)
    }

    /// Create a provider around an existing HTTP client.
    pub fn with_client(config: CdnConfig, client: Client) -> ProviderResult<Self> {
        config.validate()?;
        let pull_zone_url = present(&config.pull_zone_url)
            .unwrap_or_default()
            .trim_end_matches('/')
            .to_string();
        let token_key = present(&config.token_key).unwrap_or_default().to_string();
        let storage_base = format!(
            "{}/{}",
            config.storage_endpoint.trim_end_matches('/'),
            encode_key_path(config.storage_zone.trim_matches('/'))
        );
        info!("initializing cdn storage zone at {}", storage_base);
        Ok(Self {
            client,
            storage_base,
            pull_zone_url,
            access_key: config.access_key,
            token_key,
        })
    }

    fn object_url(&self, key: &str) -> String {
        join_url(&self.storage_base, key)
    }

    fn listing_url(&self, prefix: Option<&str>) -> String {
        match prefix {
            Some(prefix) => format!("{}/", join_url(&self.storage_base, prefix)),
            None => format!("{}/", self.storage_base),
        }
    }

    fn public_url(&self, key: &str) -> String {
        join_url(&self.pull_zone_url, key)
    }

    async fn list(&self, prefix: Option<&str>, key: &str) -> ProviderResult<Vec<StorageEntry>> {
        let response = self
            .client
            .get(self.listing_url(prefix))
            .header(ACCESS_KEY_HEADER, &self.access_key)
            .header(reqwest::header::ACCEPT, "application/json")
            .send()
            .await
            .map_err(|err| map_transport("list", key, err))?;
        let status = response.status();
        if !status.is_success() {
            return Err(map_status("list", key, status));
        }
        response
            .json::<Vec<StorageEntry>>()
            .await
            .map_err(|err| ProviderError::operation("list", key, err.to_string()))
    }

    /// Look up `key` in its directory listing.
    async fn stat(&self, key: &str) -> ProviderResult<FileObject> {
        let name = file_name(key);
        let entry = self
            .list(parent_prefix(key), key)
            .await?
            .into_iter()
            .find(|entry| !entry.is_directory && entry.object_name == name)
            .ok_or_else(|| ProviderError::NotFound(key.to_string()))?;

        Ok(FileObject {
            key: key.to_string(),
            url: self.public_url(key),
            signed_url: None,
            size: entry.length,
            content_type: guess_content_type(key).to_string(),
            last_modified: parse_last_changed(entry.last_changed.as_deref()),
            etag: entry
                .checksum
                .map(|checksum| checksum.to_ascii_lowercase())
                .unwrap_or_default(),
            provider: ProviderKind::Cdn,
        })
    }

    fn normalize(&self, key: &str) -> ProviderResult<String> {
        normalize_key(key, TraversalPolicy::Reject)
    }

    /// Token-authenticated pull-zone URL valid until `expires`.
    fn token_url(&self, key: &str, expires: i64) -> String {
        let path = format!("/{}", encode_key_path(key));
        let mut hasher = Sha256::new();
        hasher.update(self.token_key.as_bytes());
        hasher.update(path.as_bytes());
        hasher.update(expires.to_string().as_bytes());
        let token = URL_SAFE_NO_PAD.encode(hasher.finalize());
        format!("{}{path}?token={token}&expires={expires}", self.pull_zone_url)
    }
}

#[async_trait]
impl StorageProvider for CdnProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Cdn
    }

    async fn upload(
        &self,
        key: &str,
        body: ByteStream,
        declared_size: Option<u64>,
        options: &UploadOptions,
    ) -> ProviderResult<FileObject> {
        let key = self.normalize(key)?;
        let data = collect_body(&key, body, declared_size).await?;
        let written = data.len() as u64;
        let content_type = options
            .content_type
            .clone()
            .unwrap_or_else(|| guess_content_type(&key).to_string());

        let response = self
            .client
            .put(self.object_url(&key))
            .header(ACCESS_KEY_HEADER, &self.access_key)
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(data)
            .send()
            .await
            .map_err(|err| map_transport("upload", &key, err))?;
        let status = response.status();
        if !status.is_success() {
            return Err(map_status("upload", &key, status));
        }

        match self.stat(&key).await {
            Ok(mut object) => {
                object.content_type = content_type;
                Ok(object)
            }
            Err(err) => {
                debug!("{} not yet listed after write ({}), using counted size", key, err);
                Ok(FileObject {
                    url: self.public_url(&key),
                    signed_url: None,
                    size: written,
                    content_type,
                    last_modified: Utc::now(),
                    etag: String::new(),
                    provider: ProviderKind::Cdn,
                    key,
                })
            }
        }
    }

    async fn get_url(&self, key: &str) -> ProviderResult<String> {
        let key = self.normalize(key)?;
        Ok(self.stat(&key).await?.url)
    }

    async fn get_signed_url(&self, key: &str, expires_in: Duration) -> ProviderResult<String> {
        validate_expiry(expires_in)?;
        let key = self.normalize(key)?;
        self.stat(&key).await?;
        let seconds = i64::try_from(expires_in.as_secs())
            .map_err(|_| ProviderError::InvalidRequest("signed URL expiry is too large".into()))?;
        Ok(self.token_url(
            &key,
            Utc::now().timestamp().saturating_add(seconds.max(1)),
        ))
    }

    async fn delete(&self, key: &str) -> ProviderResult<()> {
        let key = self.normalize(key)?;
        let response = self
            .client
            .delete(self.object_url(&key))
            .header(ACCESS_KEY_HEADER, &self.access_key)
            .send()
            .await
            .map_err(|err| map_transport("delete", &key, err))?;
        match response.status() {
            status if status.is_success() => Ok(()),
            StatusCode::NOT_FOUND => Ok(()),
            status => Err(map_status("delete", &key, status)),
        }
    }

    async fn get_object(&self, key: &str) -> ProviderResult<FileObject> {
        let key = self.normalize(key)?;
        self.stat(&key).await
    }

    async fn download(&self, key: &str) -> ProviderResult<(ByteStream, FileObject)> {
        let key = self.normalize(key)?;
        let response = self
            .client
            .get(self.object_url(&key))
            .header(ACCESS_KEY_HEADER, &self.access_key)
            .send()
            .await
            .map_err(|err| map_transport("download", &key, err))?;
        let status = response.status();
        if !status.is_success() {
            return Err(map_status("download", &key, status));
        }

        let object = match self.stat(&key).await {
            Ok(object) => object,
            Err(err) => {
                warn!("metadata for {} unavailable during download: {}", key, err);
                FileObject {
                    key: key.clone(),
                    url: self.public_url(&key),
                    signed_url: None,
                    size: response.content_length().unwrap_or_default(),
                    content_type: guess_content_type(&key).to_string(),
                    last_modified: Utc::now(),
                    etag: String::new(),
                    provider: ProviderKind::Cdn,
                }
            }
        };
        let stream = response.bytes_stream().map_err(io::Error::other);
        Ok((Box::pin(stream), object))
    }

    async fn check_health(&self) -> ProviderResult<()> {
        self.list(None, "/").await.map(|_| ()).map_err(|err| match err {
            ProviderError::Unavailable(_) => err,
            other => ProviderError::Unavailable(other.to_string()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        providers::bytes_stream,
        services::{ProviderConfig, ProviderRegistry, ServiceError},
    };
    use axum::{
        Json, Router,
        body::Bytes,
        extract::{Path, State},
        http::{HeaderMap, StatusCode as AxumStatus},
        response::{IntoResponse, Response},
        routing::get,
    };
    use futures::StreamExt;
    use serde_json::{Value, json};
    use std::{
        collections::HashMap,
        sync::{Arc, Mutex},
    };

    type Objects = Arc<Mutex<HashMap<String, Vec<u8>>>>;

    fn authorized(headers: &HeaderMap) -> bool {
        headers
            .get(ACCESS_KEY_HEADER)
            .is_some_and(|value| value == "zone-key")
    }

    fn listing(objects: &HashMap<String, Vec<u8>>, dir: &str) -> Option<Vec<Value>> {
        let prefix = if dir.is_empty() {
            String::new()
        } else {
            format!("{dir}/")
        };
        let entries: Vec<Value> = objects
            .iter()
            .filter_map(|(key, data)| {
                let rest = key.strip_prefix(&prefix)?;
                (!rest.contains('/')).then(|| {
                    json!({
                        "ObjectName": rest,
                        "Length": data.len(),
                        "LastChanged": "2024-03-05T10:00:00.000",
                        "Checksum": "ABCDEF",
                        "IsDirectory": false,
                    })
                })
            })
            .collect();
        let exists = dir.is_empty() || objects.keys().any(|key| key.starts_with(&prefix));
        exists.then_some(entries)
    }

    async fn list_root(State(objects): State<Objects>, headers: HeaderMap) -> Response {
        if !authorized(&headers) {
            return AxumStatus::UNAUTHORIZED.into_response();
        }
        let objects = objects.lock().unwrap();
        Json(listing(&objects, "").unwrap_or_default()).into_response()
    }

    async fn fetch(
        State(objects): State<Objects>,
        Path((_zone, path)): Path<(String, String)>,
        headers: HeaderMap,
    ) -> Response {
        if !authorized(&headers) {
            return AxumStatus::UNAUTHORIZED.into_response();
        }
        let objects = objects.lock().unwrap();
        if let Some(data) = objects.get(&path) {
            return data.clone().into_response();
        }
        match listing(&objects, path.trim_end_matches('/')) {
            Some(entries) => Json(entries).into_response(),
            None => AxumStatus::NOT_FOUND.into_response(),
        }
    }

    async fn store(
        State(objects): State<Objects>,
        Path((_zone, path)): Path<(String, String)>,
        headers: HeaderMap,
        body: Bytes,
    ) -> AxumStatus {
        if !authorized(&headers) {
            return AxumStatus::UNAUTHORIZED;
        }
        objects.lock().unwrap().insert(path, body.to_vec());
        AxumStatus::CREATED
    }

    async fn remove(
        State(objects): State<Objects>,
        Path((_zone, path)): Path<(String, String)>,
    ) -> AxumStatus {
        match objects.lock().unwrap().remove(&path) {
            Some(_) => AxumStatus::OK,
            None => AxumStatus::NOT_FOUND,
        }
    }

    async fn spawn_zone() -> String {
        let objects: Objects = Arc::default();
        let app = Router::new()
            .route("/{zone}/", get(list_root))
            .route("/{zone}/{*path}", get(fetch).put(store).delete(remove))
            .with_state(objects);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn config(endpoint: &str) -> CdnConfig {
        CdnConfig {
            storage_endpoint: endpoint.to_string(),
            storage_zone: "media".into(),
            access_key: "zone-key".into(),
            pull_zone_url: Some("https://media.b-cdn.net".into()),
            token_key: Some("token-secret".into()),
            timeout_secs: 5,
        }
    }

    #[tokio::test]
    async fn upload_stat_download_delete() {
        let provider = CdnProvider::new(config(&spawn_zone().await)).unwrap();
        let options = UploadOptions::default().with_content_type("image/png");

        let stored = provider
            .upload("u/image/a b.png", bytes_stream("pixels"), Some(6), &options)
            .await
            .unwrap();
        assert_eq!(stored.size, 6);
        assert_eq!(stored.etag, "abcdef");
        assert_eq!(stored.url, "https://media.b-cdn.net/u/image/a%20b.png");
        assert_eq!(stored.content_type, "image/png");

        let (mut stream, object) = provider.download("u/image/a b.png").await.unwrap();
        assert_eq!(object.size, 6);
        let mut content = Vec::new();
        while let Some(chunk) = stream.next().await {
            content.extend_from_slice(&chunk.unwrap());
        }
        assert_eq!(content, b"pixels");

        provider.delete("u/image/a b.png").await.unwrap();
        provider.delete("u/image/a b.png").await.unwrap();
        let err = provider.get_object("u/image/a b.png").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn size_mismatch_writes_nothing() {
        let provider = CdnProvider::new(config(&spawn_zone().await)).unwrap();
        let err = provider
            .upload("k.bin", bytes_stream("abc"), Some(10), &UploadOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::SizeMismatch { .. }));
        assert!(provider.get_object("k.bin").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn health_reports_bad_credentials_and_outage() {
        let endpoint = spawn_zone().await;
        let provider = CdnProvider::new(config(&endpoint)).unwrap();
        provider.check_health().await.unwrap();

        let mut bad = config(&endpoint);
        bad.access_key = "wrong".into();
        let provider = CdnProvider::new(bad).unwrap();
        let err = provider.check_health().await.unwrap_err();
        assert!(matches!(err, ProviderError::Unavailable(_)));

        let provider = CdnProvider::new(config("http://127.0.0.1:1")).unwrap();
        assert!(provider.check_health().await.is_err());
    }

    #[tokio::test]
    async fn signed_urls_use_token_auth() {
        let provider = CdnProvider::new(config(&spawn_zone().await)).unwrap();
        provider
            .upload("v/clip.mp4", bytes_stream("x"), None, &UploadOptions::default())
            .await
            .unwrap();

        let signed = provider
            .get_signed_url("v/clip.mp4", Duration::from_secs(60))
            .await
            .unwrap();
        assert!(signed.starts_with("https://media.b-cdn.net/v/clip.mp4?token="));
        assert!(signed.contains("&expires="));

        let first = provider.token_url("v/clip.mp4", 100);
        assert_eq!(first, provider.token_url("v/clip.mp4", 100));
        assert_ne!(first, provider.token_url("v/clip.mp4", 101));
    }

    #[tokio::test]
    async fn registry_only_accepts_cdn_entries_that_can_sign() {
        let endpoint = spawn_zone().await;

        let mut no_token = config(&endpoint);
        no_token.token_key = None;
        let mut blank_token = config(&endpoint);
        blank_token.token_key = Some("  ".into());
        let mut no_pull_zone = config(&endpoint);
        no_pull_zone.pull_zone_url = None;
        for incomplete in [no_token, blank_token, no_pull_zone] {
            assert!(matches!(
                ProviderRegistry::new(vec![ProviderConfig::Cdn(incomplete)], None),
                Err(ServiceError::Configuration(_))
            ));
        }

        let registry =
            ProviderRegistry::new(vec![ProviderConfig::Cdn(config(&endpoint))], None).unwrap();
        let provider = registry.get(ProviderKind::Cdn).await.unwrap();
        provider
            .upload("d/a.pdf", bytes_stream("pdf"), Some(3), &UploadOptions::default())
            .await
            .unwrap();
        let signed = provider
            .get_signed_url("d/a.pdf", Duration::from_secs(3600))
            .await
            .unwrap();
        assert!(signed.starts_with("https://media.b-cdn.net/d/a.pdf?token="));
    }

    #[test]
    fn rejects_incomplete_config() {
        let mut missing = config("https://storage.bunnycdn.com");
        missing.access_key = String::new();
        assert!(CdnProvider::new(missing).is_err());

        let mut bad_url = config("https://storage.bunnycdn.com");
        bad_url.pull_zone_url = Some("not a url".into());
        assert!(bad_url.validate().is_err());

        let rendered = format!("{:?}", config("https://storage.bunnycdn.com"));
        assert!(!rendered.contains("zone-key"));
        assert!(!rendered.contains("token-secret"));
    }

    #[test]
    fn parses_listing_timestamps() {
        let parsed = parse_last_changed(Some("2024-03-05T10:00:00.000"));
        assert_eq!(parsed.to_rfc3339(), "2024-03-05T10:00:00+00:00");
    }
}
