//! In-memory provider for development and tests. All data is lost on drop.

use super::{
    ByteStream, ProviderError, ProviderResult, StorageProvider, TraversalPolicy, bytes_stream,
    collect_body, keys::normalize_key, signing::UrlSigner,
};
use crate::models::{FileObject, ProviderKind, UploadOptions, media::guess_content_type};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::{collections::HashMap, time::Duration};
use tokio::sync::RwLock;
use uuid::Uuid;

/// Settings for [`MemoryProvider`].
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MemoryConfig {
    /// Secret for signed URLs; a random one is generated when absent.
    #[serde(default)]
    pub signing_secret: Option<String>,
}

#[derive(Debug, Clone)]
struct StoredObject {
    data: Bytes,
    content_type: String,
    etag: String,
    last_modified: DateTime<Utc>,
}

pub struct MemoryProvider {
    objects: RwLock<HashMap<String, StoredObject>>,
    signer: UrlSigner,
}

impl MemoryProvider {
    pub fn new(config: MemoryConfig) -> ProviderResult<Self> {
        let secret = config
            .signing_secret
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        Ok(Self {
            objects: RwLock::new(HashMap::new()),
            signer: UrlSigner::new(secret, "memory://objects")?,
        })
    }

    fn describe(key: &str, object: &StoredObject) -> FileObject {
        FileObject {
            key: key.to_string(),
            url: String::new(),
            signed_url: None,
            size: object.data.len() as u64,
            content_type: object.content_type.clone(),
            last_modified: object.last_modified,
            etag: object.etag.clone(),
            provider: ProviderKind::Memory,
        }
    }

    async fn lookup(&self, key: &str) -> ProviderResult<(String, StoredObject)> {
        let key = normalize_key(key, TraversalPolicy::Reject)?;
        let objects = self.objects.read().await;
        let object = objects
            .get(&key)
            .cloned()
            .ok_or_else(|| ProviderError::NotFound(key.clone()))?;
        Ok((key, object))
    }
}

#[async_trait]
impl StorageProvider for MemoryProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Memory
    }

    async fn upload(
        &self,
        key: &str,
        body: ByteStream,
        declared_size: Option<u64>,
        options: &UploadOptions,
    ) -> ProviderResult<FileObject> {
        let key = normalize_key(key, TraversalPolicy::Reject)?;
        let data = collect_body(&key, body, declared_size).await?;

        let object = StoredObject {
            etag: format!("{:x}", md5::compute(&data)),
            content_type: options
                .content_type
                .clone()
                .unwrap_or_else(|| guess_content_type(&key).to_string()),
            last_modified: Utc::now(),
            data,
        };
        let described = Self::describe(&key, &object);
        self.objects.write().await.insert(key, object);
        Ok(described)
    }

    async fn get_url(&self, key: &str) -> ProviderResult<String> {
        self.lookup(key).await?;
        Ok(String::new())
    }

    async fn get_signed_url(&self, key: &str, expires_in: Duration) -> ProviderResult<String> {
        let (key, _) = self.lookup(key).await?;
        self.signer.sign(&key, expires_in)
    }

    async fn delete(&self, key: &str) -> ProviderResult<()> {
        let key = normalize_key(key, TraversalPolicy::Reject)?;
        self.objects.write().await.remove(&key);
        Ok(())
    }

    async fn get_object(&self, key: &str) -> ProviderResult<FileObject> {
        let (key, object) = self.lookup(key).await?;
        Ok(Self::describe(&key, &object))
    }

    async fn download(&self, key: &str) -> ProviderResult<(ByteStream, FileObject)> {
        let (key, object) = self.lookup(key).await?;
        let described = Self::describe(&key, &object);
        Ok((bytes_stream(object.data), described))
    }

    async fn check_health(&self) -> ProviderResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::signing::expires_param;
    use futures::StreamExt;

    #[tokio::test]
    async fn upload_download_delete() {
        let provider = MemoryProvider::new(MemoryConfig::default()).unwrap();
        let options = UploadOptions::default();

        let stored = provider
            .upload("a/b.mp3", bytes_stream("abc"), Some(3), &options)
            .await
            .unwrap();
        assert_eq!(stored.content_type, "audio/mpeg");
        assert_eq!(stored.provider, ProviderKind::Memory);

        let (mut stream, object) = provider.download("a/b.mp3").await.unwrap();
        assert_eq!(stream.next().await.unwrap().unwrap(), Bytes::from_static(b"abc"));
        assert_eq!(object.size, 3);

        provider.delete("a/b.mp3").await.unwrap();
        provider.delete("a/b.mp3").await.unwrap();
        assert!(provider.get_object("a/b.mp3").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn has_no_public_url_but_signs() {
        let provider = MemoryProvider::new(MemoryConfig::default()).unwrap();
        provider
            .upload("k.bin", bytes_stream("x"), None, &UploadOptions::default())
            .await
            .unwrap();

        assert_eq!(provider.get_url("k.bin").await.unwrap(), "");
        let before = Utc::now().timestamp();
        let signed = provider
            .get_signed_url("k.bin", Duration::from_secs(3600))
            .await
            .unwrap();
        assert!(!signed.is_empty());
        assert!(expires_param(&signed).unwrap() >= before + 3600);
    }
}
