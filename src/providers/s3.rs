//! S3 and S3-compatible object storage.
//!
//! AWS S3, Cloudflare R2 and MinIO are configuration presets that all
//! resolve to one [`S3ClientConfig`] and one [`S3Provider`].

use super::{
    ByteStream, ProviderError, ProviderResult, StorageProvider, TraversalPolicy, collect_body,
    join_url, keys::normalize_key, validate_expiry,
};
use crate::models::{
    AccessControl, FileObject, ProviderKind, UploadOptions, media::guess_content_type,
};
use async_trait::async_trait;
use aws_config::{BehaviorVersion, Region};
use aws_sdk_s3::{
    Client,
    config::Credentials,
    error::{DisplayErrorContext, ProvideErrorMetadata, SdkError},
    presigning::PresigningConfig,
    types::ObjectCannedAcl,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::{fmt, time::Duration};
use tokio_util::io::ReaderStream;
use tracing::{debug, info};

/// AWS S3 preset.
#[derive(Clone, Deserialize)]
pub struct S3Config {
    pub bucket: String,
    pub region: String,
    pub access_key_id: String,
    pub secret_access_key: String,
    /// CDN or custom domain in front of the bucket.
    #[serde(default)]
    pub public_base_url: Option<String>,
}

/// Cloudflare R2 preset.
#[derive(Clone, Deserialize)]
pub struct R2Config {
    pub account_id: String,
    pub bucket: String,
    pub access_key_id: String,
    pub secret_access_key: String,
    /// Custom domain or `r2.dev` URL; R2 buckets have no public URL otherwise.
    #[serde(default)]
    pub public_base_url: Option<String>,
}

/// MinIO / self-hosted S3-compatible preset.
#[derive(Clone, Deserialize)]
pub struct MinioConfig {
    pub endpoint: String,
    pub bucket: String,
    #[serde(default = "default_region")]
    pub region: String,
    pub access_key_id: String,
    pub secret_access_key: String,
    #[serde(default)]
    pub public_base_url: Option<String>,
}

fn default_region() -> String {
    "us-east-1".to_string()
}

/// The single client configuration every S3-family preset resolves to.
#[derive(Clone)]
pub struct S3ClientConfig {
    pub kind: ProviderKind,
    pub bucket: String,
    pub region: String,
    pub endpoint: Option<String>,
    pub force_path_style: bool,
    pub access_key_id: String,
    pub secret_access_key: String,
    pub public_base_url: Option<String>,
    /// Whether canned ACLs are honored by the backend.
    pub supports_acl: bool,
}

macro_rules! redacted_debug {
    ($ty:ty, $($field:ident),*) => {
        impl fmt::Debug for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.debug_struct(stringify!($ty))
                    $(.field(stringify!($field), &self.$field))*
                    .field("access_key_id", &"<redacted>")
                    .field("secret_access_key", &"<redacted>")
                    .finish()
            }
        }
    };
}

redacted_debug!(S3Config, bucket, region, public_base_url);
redacted_debug!(R2Config, account_id, bucket, public_base_url);
redacted_debug!(MinioConfig, endpoint, bucket, region, public_base_url);
redacted_debug!(S3ClientConfig, kind, bucket, region, endpoint, force_path_style, public_base_url);

impl From<S3Config> for S3ClientConfig {
    fn from(config: S3Config) -> Self {
        Self {
            kind: ProviderKind::S3,
            bucket: config.bucket,
            region: config.region,
            endpoint: None,
            force_path_style: false,
            access_key_id: config.access_key_id,
            secret_access_key: config.secret_access_key,
            public_base_url: config.public_base_url,
            supports_acl: true,
        }
    }
}

impl From<R2Config> for S3ClientConfig {
    fn from(config: R2Config) -> Self {
        Self {
            kind: ProviderKind::R2,
            endpoint: Some(format!(
                "https://{}.r2.cloudflarestorage.com",
                config.account_id.trim()
            )),
            bucket: config.bucket,
            region: "auto".to_string(),
            force_path_style: true,
            access_key_id: config.access_key_id,
            secret_access_key: config.secret_access_key,
            public_base_url: config.public_base_url,
            supports_acl: false,
        }
    }
}

impl From<MinioConfig> for S3ClientConfig {
    fn from(config: MinioConfig) -> Self {
        Self {
            kind: ProviderKind::Minio,
            endpoint: Some(config.endpoint.trim_end_matches('/').to_string()),
            bucket: config.bucket,
            region: config.region,
            force_path_style: true,
            access_key_id: config.access_key_id,
            secret_access_key: config.secret_access_key,
            public_base_url: config.public_base_url,
            supports_acl: true,
        }
    }
}

impl S3ClientConfig {
    pub fn validate(&self) -> ProviderResult<()> {
        let missing = |field: &str| {
            ProviderError::Configuration(format!("{} provider requires `{}`", self.kind, field))
        };
        if self.bucket.trim().is_empty() {
            return Err(missing("bucket"));
        }
        if self.region.trim().is_empty() {
            return Err(missing("region"));
        }
        if self.access_key_id.trim().is_empty() {
            return Err(missing("access_key_id"));
        }
        if self.secret_access_key.trim().is_empty() {
            return Err(missing("secret_access_key"));
        }
        if self.kind == ProviderKind::R2
            && self
                .endpoint
                .as_deref()
                .is_some_and(|endpoint| endpoint.starts_with("https://.r2"))
        {
            return Err(missing("account_id"));
        }
        if let Some(endpoint) = &self.endpoint {
            reqwest::Url::parse(endpoint).map_err(|err| {
                ProviderError::Configuration(format!(
                    "{} endpoint `{}` is not a valid URL: {}",
                    self.kind, endpoint, err
                ))
            })?;
        }
        Ok(())
    }

    /// Best-effort direct URL; empty when the bucket has no public endpoint.
    pub fn public_url(&self, key: &str) -> String {
        if let Some(base) = &self.public_base_url {
            return join_url(base, key);
        }
        match (self.kind, &self.endpoint) {
            (ProviderKind::S3, None) => join_url(
                &format!("https://{}.s3.{}.amazonaws.com", self.bucket, self.region),
                key,
            ),
            (ProviderKind::Minio, Some(endpoint)) => {
                join_url(&format!("{}/{}", endpoint, self.bucket), key)
            }
            _ => String::new(),
        }
    }
}

pub struct S3Provider {
    client: Client,
    config: S3ClientConfig,
}

impl fmt::Debug for S3Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("S3Provider")
            .field("config", &self.config)
            .field("client", &"<S3Client>")
            .finish()
    }
}

/// Map an SDK failure to a provider error without leaking credentials.
fn classify<E, R>(op: &'static str, key: &str, err: SdkError<E, R>) -> ProviderError
where
    E: std::error::Error + Send + Sync + 'static,
    R: fmt::Debug + Send + Sync + 'static,
{
    match &err {
        SdkError::DispatchFailure(_) | SdkError::TimeoutError(_) => ProviderError::Unavailable(
            format!("{op} `{key}`: {}", DisplayErrorContext(&err)),
        ),
        _ => ProviderError::operation(op, key, DisplayErrorContext(&err).to_string()),
    }
}

fn to_chrono(value: Option<&aws_sdk_s3::primitives::DateTime>) -> DateTime<Utc> {
    value
        .and_then(|dt| DateTime::from_timestamp(dt.secs(), dt.subsec_nanos()))
        .unwrap_or_else(Utc::now)
}

fn unquote(etag: Option<&str>) -> String {
    etag.unwrap_or_default().trim_matches('"').to_string()
}

impl S3Provider {
    /// Build the SDK client. Fails fast on incomplete configuration.
    pub async fn connect(config: S3ClientConfig) -> ProviderResult<Self> {
        config.validate()?;
        info!(
            "initializing {} storage (bucket: {}, region: {})",
            config.kind, config.bucket, config.region
        );

        let credentials = Credentials::new(
            &config.access_key_id,
            &config.secret_access_key,
            None,
            None,
            "media-store",
        );
        let sdk_config = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(config.region.clone()))
            .credentials_provider(credentials)
            .load()
            .await;

        let mut builder = aws_sdk_s3::config::Builder::from(&sdk_config)
            .force_path_style(config.force_path_style);
        if let Some(endpoint) = &config.endpoint {
            debug!("using custom S3 endpoint: {}", endpoint);
            builder = builder.endpoint_url(endpoint);
        }

        Ok(Self {
            client: Client::from_conf(builder.build()),
            config,
        })
    }

    fn normalize(&self, key: &str) -> ProviderResult<String> {
        normalize_key(key, TraversalPolicy::Reject)
    }

    async fn head(&self, op: &'static str, key: &str) -> ProviderResult<FileObject> {
        let output = self
            .client
            .head_object()
            .bucket(&self.config.bucket)
            .key(key)
            .send()
            .await
            .map_err(|err| {
                if err.as_service_error().is_some_and(|e| e.is_not_found()) {
                    ProviderError::NotFound(key.to_string())
                } else {
                    classify(op, key, err)
                }
            })?;

        Ok(FileObject {
            key: key.to_string(),
            url: self.config.public_url(key),
            signed_url: None,
            size: output
                .content_length()
                .and_then(|len| u64::try_from(len).ok())
                .unwrap_or_default(),
            content_type: output
                .content_type()
                .map(str::to_string)
                .unwrap_or_else(|| guess_content_type(key).to_string()),
            last_modified: to_chrono(output.last_modified()),
            etag: unquote(output.e_tag()),
            provider: self.config.kind,
        })
    }

    /// Presign a GET for `key` without checking that it exists.
    async fn presign_get(&self, key: &str, expires_in: Duration) -> ProviderResult<String> {
        validate_expiry(expires_in)?;
        let presigning = PresigningConfig::expires_in(expires_in)
            .map_err(|err| ProviderError::InvalidRequest(err.to_string()))?;
        let request = self
            .client
            .get_object()
            .bucket(&self.config.bucket)
            .key(key)
            .presigned(presigning)
            .await
            .map_err(|err| classify("get_signed_url", key, err))?;
        Ok(request.uri().to_string())
    }
}

#[async_trait]
impl StorageProvider for S3Provider {
    fn kind(&self) -> ProviderKind {
        self.config.kind
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

        let mut request = self
            .client
            .put_object()
            .bucket(&self.config.bucket)
            .key(&key)
            .content_type(&content_type)
            .content_length(i64::try_from(written).unwrap_or(i64::MAX))
            .body(aws_sdk_s3::primitives::ByteStream::from(data));
        for (name, value) in &options.metadata {
            request = request.metadata(name, value);
        }
        if self.config.supports_acl {
            if let Some(access) = options.access {
                request = request.acl(match access {
                    AccessControl::Public => ObjectCannedAcl::PublicRead,
                    AccessControl::Private => ObjectCannedAcl::Private,
                });
            }
        }
        let output = request
            .send()
            .await
            .map_err(|err| classify("upload", &key, err))?;

        match self.head("upload", &key).await {
            Ok(object) => Ok(object),
            Err(ProviderError::NotFound(_)) => {
                debug!("{} not yet visible after write, using counted size", key);
                Ok(FileObject {
                    url: self.config.public_url(&key),
                    signed_url: None,
                    size: written,
                    content_type,
                    last_modified: Utc::now(),
                    etag: unquote(output.e_tag()),
                    provider: self.config.kind,
                    key,
                })
            }
            Err(err) => Err(err),
        }
    }

    async fn get_url(&self, key: &str) -> ProviderResult<String> {
        let key = self.normalize(key)?;
        Ok(self.head("get_url", &key).await?.url)
    }

    async fn get_signed_url(&self, key: &str, expires_in: Duration) -> ProviderResult<String> {
        let key = self.normalize(key)?;
        self.head("get_signed_url", &key).await?;
        self.presign_get(&key, expires_in).await
    }

    async fn delete(&self, key: &str) -> ProviderResult<()> {
        let key = self.normalize(key)?;
        match self
            .client
            .delete_object()
            .bucket(&self.config.bucket)
            .key(&key)
            .send()
            .await
        {
            Ok(_) => Ok(()),
            Err(err) if matches!(err.code(), Some("NoSuchKey" | "NotFound")) => Ok(()),
            Err(err) => Err(classify("delete", &key, err)),
        }
    }

    async fn get_object(&self, key: &str) -> ProviderResult<FileObject> {
        let key = self.normalize(key)?;
        self.head("get_object", &key).await
    }

    async fn download(&self, key: &str) -> ProviderResult<(ByteStream, FileObject)> {
        let key = self.normalize(key)?;
        let output = self
            .client
            .get_object()
            .bucket(&self.config.bucket)
            .key(&key)
            .send()
            .await
            .map_err(|err| {
                if err.as_service_error().is_some_and(|e| e.is_no_such_key()) {
                    ProviderError::NotFound(key.clone())
                } else {
                    classify("download", &key, err)
                }
            })?;

        let object = FileObject {
            key: key.clone(),
            url: self.config.public_url(&key),
            signed_url: None,
            size: output
                .content_length()
                .and_then(|len| u64::try_from(len).ok())
                .unwrap_or_default(),
            content_type: output
                .content_type()
                .map(str::to_string)
                .unwrap_or_else(|| guess_content_type(&key).to_string()),
            last_modified: to_chrono(output.last_modified()),
            etag: unquote(output.e_tag()),
            provider: self.config.kind,
        };
        let stream = ReaderStream::new(output.body.into_async_read());
        Ok((Box::pin(stream), object))
    }

    async fn check_health(&self) -> ProviderResult<()> {
        self.client
            .head_bucket()
            .bucket(&self.config.bucket)
            .send()
            .await
            .map(|_| ())
            .map_err(|err| {
                ProviderError::Unavailable(format!(
                    "bucket `{}`: {}",
                    self.config.bucket,
                    DisplayErrorContext(&err)
                ))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn r2() -> R2Config {
        R2Config {
            account_id: "acc123".into(),
            bucket: "media".into(),
            access_key_id: "AKIA".into(),
            secret_access_key: "secret".into(),
            public_base_url: None,
        }
    }

    fn minio() -> MinioConfig {
        MinioConfig {
            endpoint: "http://127.0.0.1:9000/".into(),
            bucket: "media".into(),
            region: default_region(),
            access_key_id: "minio".into(),
            secret_access_key: "minio-secret".into(),
            public_base_url: None,
        }
    }

    #[test]
    fn presets_resolve_to_one_client_config() {
        let r2: S3ClientConfig = r2().into();
        assert_eq!(r2.kind, ProviderKind::R2);
        assert_eq!(
            r2.endpoint.as_deref(),
            Some("https://acc123.r2.cloudflarestorage.com")
        );
        assert_eq!(r2.region, "auto");
        assert!(!r2.supports_acl);
        r2.validate().unwrap();

        let minio: S3ClientConfig = minio().into();
        assert_eq!(minio.kind, ProviderKind::Minio);
        assert_eq!(minio.endpoint.as_deref(), Some("http://127.0.0.1:9000"));
        assert!(minio.force_path_style);
    }

    #[test]
    fn validation_fails_fast_on_missing_fields() {
        let mut config = r2();
        config.account_id = String::new();
        let err = S3ClientConfig::from(config).validate().unwrap_err();
        assert!(err.to_string().contains("account_id"));

        let mut config = minio();
        config.secret_access_key = " ".into();
        let err = S3ClientConfig::from(config).validate().unwrap_err();
        assert!(matches!(err, ProviderError::Configuration(_)));

        let mut config = minio();
        config.endpoint = "not a url".into();
        assert!(S3ClientConfig::from(config).validate().is_err());
    }

    #[test]
    fn public_urls_depend_on_backend() {
        let s3 = S3ClientConfig::from(S3Config {
            bucket: "media".into(),
            region: "eu-west-1".into(),
            access_key_id: "a".into(),
            secret_access_key: "b".into(),
            public_base_url: None,
        });
        assert_eq!(
            s3.public_url("u/a b.png"),
            "https://media.s3.eu-west-1.amazonaws.com/u/a%20b.png"
        );

        let r2_client = S3ClientConfig::from(r2());
        assert_eq!(r2_client.public_url("u/a.png"), "");

        let mut with_domain = r2();
        with_domain.public_base_url = Some("https://cdn.example.com".into());
        assert_eq!(
            S3ClientConfig::from(with_domain).public_url("u/a.png"),
            "https://cdn.example.com/u/a.png"
        );

        let minio = S3ClientConfig::from(minio());
        assert_eq!(minio.public_url("k.txt"), "http://127.0.0.1:9000/media/k.txt");
    }

    #[test]
    fn debug_output_redacts_credentials() {
        let rendered = format!("{:?}", S3ClientConfig::from(minio()));
        assert!(!rendered.contains("minio-secret"));
        assert!(rendered.contains("<redacted>"));
    }

    #[tokio::test]
    async fn presigned_urls_encode_expiry() {
        let provider = S3Provider::connect(minio().into()).await.unwrap();
        assert_eq!(provider.kind(), ProviderKind::Minio);

        let url = provider
            .presign_get("u/image/a.png", Duration::from_secs(3600))
            .await
            .unwrap();
        assert!(url.starts_with("http://127.0.0.1:9000/media/u/image/a.png?"));
        assert!(url.contains("X-Amz-Expires=3600"));
        assert_ne!(url, provider.config.public_url("u/image/a.png"));
    }
}
