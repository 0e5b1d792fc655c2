//! Provider doubles for service tests.

use crate::{
    models::{FileObject, ProviderKind, UploadOptions},
    providers::{
        ByteStream, MemoryProvider, ProviderError, ProviderResult, StorageProvider,
        memory::MemoryConfig,
    },
};
use async_trait::async_trait;
use std::{
    sync::atomic::{AtomicUsize, Ordering},
    time::Duration,
};

/// Memory-backed provider that reports an arbitrary kind and can be told to
/// fail health probes or deletes.
pub(crate) struct StubProvider {
    kind: ProviderKind,
    inner: MemoryProvider,
    health_error: Option<String>,
    health_delay: Duration,
    fail_deletes: bool,
    delete_calls: AtomicUsize,
}

impl StubProvider {
    pub(crate) fn new(kind: ProviderKind) -> Self {
        Self {
            kind,
            inner: MemoryProvider::new(MemoryConfig::default()).unwrap(),
            health_error: None,
            health_delay: Duration::ZERO,
            fail_deletes: false,
            delete_calls: AtomicUsize::new(0),
        }
    }

    pub(crate) fn unhealthy(mut self, message: &str) -> Self {
        self.health_error = Some(message.to_string());
        self
    }

    pub(crate) fn slow(mut self, delay: Duration) -> Self {
        self.health_delay = delay;
        self
    }

    pub(crate) fn failing_deletes(mut self) -> Self {
        self.fail_deletes = true;
        self
    }

    pub(crate) fn delete_calls(&self) -> usize {
        self.delete_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StorageProvider for StubProvider {
    fn kind(&self) -> ProviderKind {
        self.kind
    }

    async fn upload(
        &self,
        key: &str,
        body: ByteStream,
        declared_size: Option<u64>,
        options: &UploadOptions,
    ) -> ProviderResult<FileObject> {
        let mut object = self.inner.upload(key, body, declared_size, options).await?;
        object.provider = self.kind;
        Ok(object)
    }

    async fn get_url(&self, key: &str) -> ProviderResult<String> {
        self.inner.get_url(key).await
    }

    async fn get_signed_url(&self, key: &str, expires_in: Duration) -> ProviderResult<String> {
        self.inner.get_signed_url(key, expires_in).await
    }

    async fn delete(&self, key: &str) -> ProviderResult<()> {
        self.delete_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_deletes {
            return Err(ProviderError::Unavailable("delete refused".into()));
        }
        self.inner.delete(key).await
    }

    async fn get_object(&self, key: &str) -> ProviderResult<FileObject> {
        let mut object = self.inner.get_object(key).await?;
        object.provider = self.kind;
        Ok(object)
    }

    async fn download(&self, key: &str) -> ProviderResult<(ByteStream, FileObject)> {
        self.inner.download(key).await
    }

    async fn check_health(&self) -> ProviderResult<()> {
        if !self.health_delay.is_zero() {
            tokio::time::sleep(self.health_delay).await;
        }
        match &self.health_error {
            Some(message) => Err(ProviderError::Unavailable(message.clone())),
            None => Ok(()),
        }
    }
}
