//! Local filesystem provider.
//!
//! Objects live at `root/{key}`. Writes stream into a temp file beside the
//! target, are fsynced and then renamed into place. A JSON sidecar under
//! `root/.meta/{key}.json` keeps the content type, ETag and user metadata so
//! that metadata lookups never read object bytes.

use super::{
    ByteStream, ProviderError, ProviderResult, StorageProvider, TraversalPolicy, join_url,
    keys::normalize_key, signing::UrlSigner,
};
use crate::models::{FileObject, ProviderKind, UploadOptions, media::guess_content_type};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use md5::Context;
use serde::{Deserialize, Serialize};
use std::{
    collections::HashMap,
    fmt,
    io::{self, ErrorKind},
    path::{Path, PathBuf},
    time::Duration,
};
use tokio::{
    fs::{self, File},
    io::AsyncWriteExt,
};
use tokio_util::io::ReaderStream;
use tracing::debug;
use uuid::Uuid;

const META_DIR: &str = ".meta";

/// Settings for [`LocalProvider`].
#[derive(Clone, Deserialize)]
pub struct LocalConfig {
    /// Directory holding object payloads.
    pub root: PathBuf,

    /// Base URL of a static file server exposing `root`, if any.
    #[serde(default)]
    pub public_base_url: Option<String>,

    /// Base URL under which signed URLs are served.
    #[serde(default = "default_signed_url_base")]
    pub signed_url_base: String,

    /// HMAC secret for signed URLs.
    pub signing_secret: String,

    /// Handling of `..` and absolute segments in keys.
    #[serde(default)]
    pub traversal: TraversalPolicy,
}

fn default_signed_url_base() -> String {
    "/files".to_string()
}

impl fmt::Debug for LocalConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalConfig")
            .field("root", &self.root)
            .field("public_base_url", &self.public_base_url)
            .field("signed_url_base", &self.signed_url_base)
            .field("signing_secret", &"<redacted>")
            .field("traversal", &self.traversal)
            .finish()
    }
}

impl LocalConfig {
    pub fn validate(&self) -> ProviderResult<()> {
        if self.root.as_os_str().is_empty() {
            return Err(ProviderError::Configuration(
                "local provider requires a root directory".into(),
            ));
        }
        self.signer().map(|_| ())
    }

    /// Signer matching the URLs this provider hands out.
    pub fn signer(&self) -> ProviderResult<UrlSigner> {
        UrlSigner::new(&self.signing_secret, self.signed_url_base.clone())
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Sidecar {
    content_type: String,
    etag: String,
    #[serde(default)]
    metadata: HashMap<String, String>,
}

pub struct LocalProvider {
    root: PathBuf,
    public_base_url: Option<String>,
    traversal: TraversalPolicy,
    signer: UrlSigner,
}

impl LocalProvider {
    /// Create the provider, creating `root` if needed.
    pub async fn new(config: LocalConfig) -> ProviderResult<Self> {
        config.validate()?;
        fs::create_dir_all(&config.root).await.map_err(|err| {
            ProviderError::Unavailable(format!(
                "cannot create storage root {}: {}",
                config.root.display(),
                err
            ))
        })?;

        Ok(Self {
            signer: config.signer()?,
            root: config.root,
            public_base_url: config.public_base_url,
            traversal: config.traversal,
        })
    }

    fn normalize(&self, key: &str) -> ProviderResult<String> {
        let key = normalize_key(key, self.traversal)?;
        if key == META_DIR || key.starts_with(&format!("{META_DIR}/")) {
            return Err(ProviderError::InvalidKey {
                key,
                reason: "the `.meta` prefix is reserved".into(),
            });
        }
        Ok(key)
    }

    fn object_path(&self, key: &str) -> PathBuf {
        let mut path = self.root.clone();
        path.extend(key.split('/'));
        path
    }

    fn sidecar_path(&self, key: &str) -> PathBuf {
        let mut path = self.root.join(META_DIR);
        path.extend(key.split('/'));
        path.set_file_name(format!("{}.json", super::keys::file_name(key)));
        path
    }

    async fn read_sidecar(&self, key: &str) -> Option<Sidecar> {
        let raw = fs::read(self.sidecar_path(key)).await.ok()?;
        serde_json::from_slice(&raw).ok()
    }

    async fn write_sidecar(&self, key: &str, sidecar: &Sidecar) -> ProviderResult<()> {
        let path = self.sidecar_path(key);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|err| ProviderError::io("upload", key, err))?;
        }
        let raw = serde_json::to_vec(sidecar)
            .map_err(|err| ProviderError::operation("upload", key, err.to_string()))?;
        fs::write(&path, raw)
            .await
            .map_err(|err| ProviderError::io("upload", key, err))
    }

    fn direct_url(&self, key: &str) -> String {
        self.public_base_url
            .as_deref()
            .map(|base| join_url(base, key))
            .unwrap_or_default()
    }

    async fn describe(
        &self,
        key: &str,
        fs_meta: &std::fs::Metadata,
    ) -> FileObject {
        let last_modified: DateTime<Utc> = fs_meta
            .modified()
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(|_| Utc::now());
        let sidecar = self.read_sidecar(key).await;

        FileObject {
            key: key.to_string(),
            url: self.direct_url(key),
            signed_url: None,
            size: fs_meta.len(),
            content_type: sidecar
                .as_ref()
                .map(|s| s.content_type.clone())
                .unwrap_or_else(|| guess_content_type(key).to_string()),
            last_modified,
            etag: sidecar.map(|s| s.etag).unwrap_or_else(|| {
                format!("{:x}-{:x}", last_modified.timestamp(), fs_meta.len())
            }),
            provider: ProviderKind::Local,
        }
    }

    async fn stat(&self, op: &'static str, key: &str) -> ProviderResult<std::fs::Metadata> {
        match fs::metadata(self.object_path(key)).await {
            Ok(meta) if meta.is_file() => Ok(meta),
            Ok(_) => Err(ProviderError::NotFound(key.to_string())),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                Err(ProviderError::NotFound(key.to_string()))
            }
            Err(err) => Err(ProviderError::io(op, key, err)),
        }
    }

    /// Stream `body` into `tmp_path`, returning the byte count and MD5 hex.
    async fn write_temp(
        key: &str,
        tmp_path: &Path,
        mut body: ByteStream,
        declared_size: Option<u64>,
    ) -> ProviderResult<(u64, String)> {
        let mut file = File::create(tmp_path)
            .await
            .map_err(|err| ProviderError::io("upload", key, err))?;
        let mut size: u64 = 0;
        let mut digest = Context::new();

        while let Some(chunk) = body.next().await {
            let chunk = chunk.map_err(|err| ProviderError::io("upload", key, err))?;
            size += chunk.len() as u64;
            if let Some(declared) = declared_size {
                if size > declared {
                    return Err(ProviderError::SizeMismatch {
                        key: key.to_string(),
                        declared,
                        actual: size,
                    });
                }
            }
            digest.consume(&chunk);
            file.write_all(&chunk)
                .await
                .map_err(|err| ProviderError::io("upload", key, err))?;
        }
        super::ensure_size(key, declared_size, size)?;

        file.flush()
            .await
            .map_err(|err| ProviderError::io("upload", key, err))?;
        file.sync_all()
            .await
            .map_err(|err| ProviderError::io("upload", key, err))?;

        Ok((size, format!("{:x}", digest.compute())))
    }

    /// Remove empty directories from `start` up to, but excluding, `stop`.
    async fn prune_empty_dirs(start: &Path, stop: &Path) {
        let mut current = start.to_path_buf();
        while current.starts_with(stop) && current != stop {
            match fs::remove_dir(&current).await {
                Ok(_) => {
                    if let Some(parent) = current.parent() {
                        current = parent.to_path_buf();
                    } else {
                        break;
                    }
                }
                Err(err) if err.kind() == ErrorKind::NotFound => break,
                Err(err) if err.kind() == ErrorKind::DirectoryNotEmpty => break,
                Err(err) => {
                    debug!("failed to prune directory {}: {}", current.display(), err);
                    break;
                }
            }
        }
    }

    async fn remove_if_present(path: &Path) -> io::Result<()> {
        match fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err),
        }
    }
}

#[async_trait]
impl StorageProvider for LocalProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Local
    }

    async fn upload(
        &self,
        key: &str,
        body: ByteStream,
        declared_size: Option<u64>,
        options: &UploadOptions,
    ) -> ProviderResult<FileObject> {
        let key = self.normalize(key)?;
        let file_path = self.object_path(&key);
        let parent = file_path
            .parent()
            .map(Path::to_path_buf)
            .ok_or_else(|| ProviderError::operation("upload", &key, "object path has no parent"))?;
        fs::create_dir_all(&parent)
            .await
            .map_err(|err| ProviderError::io("upload", &key, err))?;

        let tmp_path = parent.join(format!(".tmp-{}", Uuid::new_v4()));
        let (_, etag) = match Self::write_temp(&key, &tmp_path, body, declared_size).await {
            Ok(written) => written,
            Err(err) => {
                let _ = fs::remove_file(&tmp_path).await;
                return Err(err);
            }
        };

        if let Err(err) = fs::rename(&tmp_path, &file_path).await {
            if err.kind() == ErrorKind::AlreadyExists {
                Self::remove_if_present(&file_path)
                    .await
                    .map_err(|err| ProviderError::io("upload", &key, err))?;
                fs::rename(&tmp_path, &file_path)
                    .await
                    .map_err(|err| ProviderError::io("upload", &key, err))?;
            } else {
                let _ = fs::remove_file(&tmp_path).await;
                return Err(ProviderError::io("upload", &key, err));
            }
        }

        let sidecar = Sidecar {
            content_type: options
                .content_type
                .clone()
                .unwrap_or_else(|| guess_content_type(&key).to_string()),
            etag,
            metadata: options.metadata.clone(),
        };
        self.write_sidecar(&key, &sidecar).await?;

        let fs_meta = self.stat("upload", &key).await?;
        debug!("stored {} ({} bytes)", file_path.display(), fs_meta.len());
        Ok(self.describe(&key, &fs_meta).await)
    }

    async fn get_url(&self, key: &str) -> ProviderResult<String> {
        let key = self.normalize(key)?;
        self.stat("get_url", &key).await?;
        Ok(self.direct_url(&key))
    }

    async fn get_signed_url(&self, key: &str, expires_in: Duration) -> ProviderResult<String> {
        let key = self.normalize(key)?;
        self.stat("get_signed_url", &key).await?;
        self.signer.sign(&key, expires_in)
    }

    async fn delete(&self, key: &str) -> ProviderResult<()> {
        let key = self.normalize(key)?;
        let file_path = self.object_path(&key);
        Self::remove_if_present(&file_path)
            .await
            .map_err(|err| ProviderError::io("delete", &key, err))?;

        let sidecar_path = self.sidecar_path(&key);
        if let Err(err) = Self::remove_if_present(&sidecar_path).await {
            debug!("failed to remove sidecar {}: {}", sidecar_path.display(), err);
        }

        if let Some(parent) = file_path.parent() {
            Self::prune_empty_dirs(parent, &self.root).await;
        }
        if let Some(parent) = sidecar_path.parent() {
            Self::prune_empty_dirs(parent, &self.root.join(META_DIR)).await;
        }
        Ok(())
    }

    async fn get_object(&self, key: &str) -> ProviderResult<FileObject> {
        let key = self.normalize(key)?;
        let fs_meta = self.stat("get_object", &key).await?;
        Ok(self.describe(&key, &fs_meta).await)
    }

    async fn download(&self, key: &str) -> ProviderResult<(ByteStream, FileObject)> {
        let key = self.normalize(key)?;
        let file = File::open(self.object_path(&key))
            .await
            .map_err(|err| {
                if err.kind() == ErrorKind::NotFound {
                    ProviderError::NotFound(key.clone())
                } else {
                    ProviderError::io("download", &key, err)
                }
            })?;
        let fs_meta = file
            .metadata()
            .await
            .map_err(|err| ProviderError::io("download", &key, err))?;
        if !fs_meta.is_file() {
            return Err(ProviderError::NotFound(key));
        }

        let object = self.describe(&key, &fs_meta).await;
        Ok((Box::pin(ReaderStream::new(file)), object))
    }

    async fn check_health(&self) -> ProviderResult<()> {
        match fs::metadata(&self.root).await {
            Ok(meta) if meta.is_dir() => Ok(()),
            Ok(_) => Err(ProviderError::Unavailable(format!(
                "{} is not a directory",
                self.root.display()
            ))),
            Err(err) => Err(ProviderError::Unavailable(format!(
                "storage root {} unreachable: {}",
                self.root.display(),
                err
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::{bytes_stream, signing::expires_param};
    use tempfile::TempDir;

    fn config(root: &Path) -> LocalConfig {
        LocalConfig {
            root: root.to_path_buf(),
            public_base_url: None,
            signed_url_base: "/files".into(),
            signing_secret: "test-secret".into(),
            traversal: TraversalPolicy::Reject,
        }
    }

    async fn read_all(mut stream: ByteStream) -> Vec<u8> {
        let mut out = Vec::new();
        while let Some(chunk) = stream.next().await {
            out.extend_from_slice(&chunk.unwrap());
        }
        out
    }

    #[tokio::test]
    async fn upload_then_download_round_trips() {
        let temp = TempDir::new().unwrap();
        let provider = LocalProvider::new(config(temp.path())).await.unwrap();
        let data = b"hello local".to_vec();

        let stored = provider
            .upload("u/image/a.png", bytes_stream(data.clone()), Some(11), &UploadOptions::default())
            .await
            .unwrap();
        assert_eq!(stored.size, 11);
        assert_eq!(stored.content_type, "image/png");
        assert_eq!(stored.etag, format!("{:x}", md5::compute(&data)));
        assert_eq!(stored.url, "");

        let (stream, object) = provider.download("u/image/a.png").await.unwrap();
        assert_eq!(read_all(stream).await, data);
        assert_eq!(object.size, data.len() as u64);
        assert_eq!(object.etag, stored.etag);
    }

    #[tokio::test]
    async fn size_mismatch_leaves_nothing_behind() {
        let temp = TempDir::new().unwrap();
        let provider = LocalProvider::new(config(temp.path())).await.unwrap();

        let err = provider
            .upload("a/b.bin", bytes_stream("12345"), Some(3), &UploadOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::SizeMismatch { declared: 3, .. }));

        let err = provider
            .upload("a/b.bin", bytes_stream("12"), Some(3), &UploadOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::SizeMismatch { actual: 2, .. }));

        assert!(provider.get_object("a/b.bin").await.unwrap_err().is_not_found());
        let mut entries = std::fs::read_dir(temp.path().join("a")).unwrap();
        assert!(entries.next().is_none(), "temp files must be removed");
    }

    #[tokio::test]
    async fn delete_is_idempotent_and_prunes() {
        let temp = TempDir::new().unwrap();
        let provider = LocalProvider::new(config(temp.path())).await.unwrap();

        provider.delete("never/existed.txt").await.unwrap();

        provider
            .upload("x/y/z.txt", bytes_stream("z"), None, &UploadOptions::default())
            .await
            .unwrap();
        provider.delete("x/y/z.txt").await.unwrap();
        provider.delete("x/y/z.txt").await.unwrap();

        assert!(provider.get_object("x/y/z.txt").await.unwrap_err().is_not_found());
        assert!(!temp.path().join("x").exists());
    }

    #[tokio::test]
    async fn reupload_is_last_write_wins() {
        let temp = TempDir::new().unwrap();
        let provider = LocalProvider::new(config(temp.path())).await.unwrap();
        let options = UploadOptions::default().with_content_type("text/plain");

        provider.upload("k.txt", bytes_stream("first"), None, &options).await.unwrap();
        provider.upload("k.txt", bytes_stream("second"), None, &options).await.unwrap();

        let (stream, object) = provider.download("k.txt").await.unwrap();
        assert_eq!(read_all(stream).await, b"second");
        assert_eq!(object.content_type, "text/plain");
    }

    #[tokio::test]
    async fn traversal_policy_is_enforced() {
        let temp = TempDir::new().unwrap();
        let root = temp.path().join("root");
        let provider = LocalProvider::new(config(&root)).await.unwrap();

        let err = provider
            .upload("../escape.txt", bytes_stream("x"), None, &UploadOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::InvalidKey { .. }));
        assert!(!temp.path().join("escape.txt").exists());

        let err = provider.get_object(".meta/k.txt.json").await.unwrap_err();
        assert!(matches!(err, ProviderError::InvalidKey { .. }));

        let mut lenient = config(&root);
        lenient.traversal = TraversalPolicy::Strip;
        let provider = LocalProvider::new(lenient).await.unwrap();
        let stored = provider
            .upload("../escape.txt", bytes_stream("x"), None, &UploadOptions::default())
            .await
            .unwrap();
        assert_eq!(stored.key, "escape.txt");
        assert!(root.join("escape.txt").exists());
    }

    #[tokio::test]
    async fn urls_reflect_configuration() {
        let temp = TempDir::new().unwrap();
        let mut cfg = config(temp.path());
        cfg.public_base_url = Some("https://static.example.com".into());
        let provider = LocalProvider::new(cfg).await.unwrap();

        assert!(provider.get_url("missing.png").await.unwrap_err().is_not_found());

        provider
            .upload("p/q.png", bytes_stream("png"), None, &UploadOptions::default())
            .await
            .unwrap();
        let url = provider.get_url("p/q.png").await.unwrap();
        assert_eq!(url, "https://static.example.com/p/q.png");

        let before = Utc::now().timestamp();
        let signed = provider
            .get_signed_url("p/q.png", Duration::from_secs(3600))
            .await
            .unwrap();
        assert_ne!(signed, url);
        assert!(signed.starts_with("/files/p/q.png?"));
        assert!(expires_param(&signed).unwrap() >= before + 3600 - 5);
    }

    #[tokio::test]
    async fn health_reports_missing_root() {
        let temp = TempDir::new().unwrap();
        let root = temp.path().join("store");
        let provider = LocalProvider::new(config(&root)).await.unwrap();
        provider.check_health().await.unwrap();

        std::fs::remove_dir_all(&root).unwrap();
        let err = provider.check_health().await.unwrap_err();
        assert!(matches!(err, ProviderError::Unavailable(_)));
    }
}
