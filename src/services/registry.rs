//! Provider registry: validated configuration per kind plus one lazily
//! constructed, shared provider instance per kind.

use super::error::{ServiceError, ServiceResult};
use crate::{
    config::StorageConfig,
    models::ProviderKind,
    providers::{
        CdnProvider, LocalProvider, MemoryProvider, S3Provider, StorageProvider,
        cdn::CdnConfig,
        local::LocalConfig,
        memory::MemoryConfig,
        s3::{MinioConfig, R2Config, S3ClientConfig, S3Config},
        signing::UrlSigner,
    },
};
use serde::Deserialize;
use std::{collections::BTreeMap, fmt, sync::Arc};
use tokio::sync::OnceCell;
use tracing::info;

/// One `[[providers]]` entry. The `kind` field selects the variant.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ProviderConfig {
    Local(LocalConfig),
    Memory(MemoryConfig),
    S3(S3Config),
    R2(R2Config),
    Minio(MinioConfig),
    Cdn(CdnConfig),
}

impl ProviderConfig {
    pub fn kind(&self) -> ProviderKind {
        match self {
            ProviderConfig::Local(_) => ProviderKind::Local,
            ProviderConfig::Memory(_) => ProviderKind::Memory,
            ProviderConfig::S3(_) => ProviderKind::S3,
            ProviderConfig::R2(_) => ProviderKind::R2,
            ProviderConfig::Minio(_) => ProviderKind::Minio,
            ProviderConfig::Cdn(_) => ProviderKind::Cdn,
        }
    }

    /// S3-family presets collapse into one client configuration.
    fn s3_client_config(&self) -> Option<S3ClientConfig> {
        match self {
            ProviderConfig::S3(config) => Some(config.clone().into()),
            ProviderConfig::R2(config) => Some(config.clone().into()),
            ProviderConfig::Minio(config) => Some(config.clone().into()),
            _ => None,
        }
    }

    /// Synchronous validation; no I/O.
    pub fn validate(&self) -> ServiceResult<()> {
        let result = match self {
            ProviderConfig::Local(config) => config.validate(),
            ProviderConfig::Memory(_) => Ok(()),
            ProviderConfig::Cdn(config) => config.validate(),
            other => match other.s3_client_config() {
                Some(config) => config.validate(),
                None => Ok(()),
            },
        };
        result.map_err(|err| ServiceError::Configuration(err.to_string()))
    }

    async fn build(&self) -> ServiceResult<Arc<dyn StorageProvider>> {
        let provider: Arc<dyn StorageProvider> = match self {
            ProviderConfig::Local(config) => Arc::new(LocalProvider::new(config.clone()).await?),
            ProviderConfig::Memory(config) => Arc::new(MemoryProvider::new(config.clone())?),
            ProviderConfig::Cdn(config) => Arc::new(CdnProvider::new(config.clone())?),
            other => {
                let config = other.s3_client_config().ok_or_else(|| {
                    ServiceError::Configuration(format!("no constructor for `{}`", other.kind()))
                })?;
                Arc::new(S3Provider::connect(config).await?)
            }
        };
        Ok(provider)
    }
}

pub struct ProviderRegistry {
    configs: BTreeMap<ProviderKind, ProviderConfig>,
    instances: BTreeMap<ProviderKind, OnceCell<Arc<dyn StorageProvider>>>,
    default_kind: ProviderKind,
}

impl fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("configs", &self.configs)
            .field("default_kind", &self.default_kind)
            .finish_non_exhaustive()
    }
}

impl ProviderRegistry {
    /// Validate every configured provider. Nothing is constructed yet.
    pub fn from_config(config: &StorageConfig) -> ServiceResult<Self> {
        Self::new(config.providers.clone(), config.default_provider)
    }

    pub fn new(
        providers: Vec<ProviderConfig>,
        default_kind: Option<ProviderKind>,
    ) -> ServiceResult<Self> {
        let mut configs = BTreeMap::new();
        for provider in providers {
            provider.validate()?;
            let kind = provider.kind();
            if configs.insert(kind, provider).is_some() {
                return Err(ServiceError::Configuration(format!(
                    "provider `{kind}` is configured more than once"
                )));
            }
        }

        let instances = configs.keys().map(|kind| (*kind, OnceCell::new())).collect();
        let default_kind = resolve_default(configs.keys().copied(), default_kind)?;
        Ok(Self {
            configs,
            instances,
            default_kind,
        })
    }

    /// Build from ready-made providers, keyed by their own kind.
    #[cfg(test)]
    pub(crate) fn from_providers(
        providers: Vec<Arc<dyn StorageProvider>>,
        default_kind: Option<ProviderKind>,
    ) -> ServiceResult<Self> {
        let mut instances = BTreeMap::new();
        for provider in providers {
            instances.insert(provider.kind(), OnceCell::new_with(Some(provider)));
        }
        let default_kind = resolve_default(instances.keys().copied(), default_kind)?;
        Ok(Self {
            configs: BTreeMap::new(),
            instances,
            default_kind,
        })
    }

    fn unsupported(kind: ProviderKind) -> ServiceError {
        ServiceError::Configuration(format!("provider `{kind}` is not configured"))
    }

    /// Construct a fresh provider for `kind`, failing fast on bad configuration
    /// or an unreachable storage root.
    pub async fn create_provider(&self, kind: ProviderKind) -> ServiceResult<Arc<dyn StorageProvider>> {
        let config = self
            .configs
            .get(&kind)
            .ok_or_else(|| Self::unsupported(kind))?;
        info!("constructing {} provider", kind);
        config.build().await
    }

    /// Shared provider for `kind`, constructed on first use.
    pub async fn get(&self, kind: ProviderKind) -> ServiceResult<Arc<dyn StorageProvider>> {
        let cell = self
            .instances
            .get(&kind)
            .ok_or_else(|| Self::unsupported(kind))?;
        cell.get_or_try_init(|| self.create_provider(kind))
            .await
            .cloned()
    }

    pub fn configured_kinds(&self) -> Vec<ProviderKind> {
        self.instances.keys().copied().collect()
    }

    pub fn default_kind(&self) -> ProviderKind {
        self.default_kind
    }

    pub fn contains(&self, kind: ProviderKind) -> bool {
        self.instances.contains_key(&kind)
    }

    /// Verifier for URLs signed by the local provider, when one is configured.
    pub fn local_signer(&self) -> Option<UrlSigner> {
        match self.configs.get(&ProviderKind::Local) {
            Some(ProviderConfig::Local(config)) => config.signer().ok(),
            _ => None,
        }
    }
}

fn resolve_default(
    kinds: impl Iterator<Item = ProviderKind>,
    requested: Option<ProviderKind>,
) -> ServiceResult<ProviderKind> {
    let kinds: Vec<ProviderKind> = kinds.collect();
    match requested {
        Some(kind) if kinds.contains(&kind) => Ok(kind),
        Some(kind) => Err(ServiceError::Configuration(format!(
            "default provider `{kind}` is not configured"
        ))),
        None => kinds.first().copied().ok_or_else(|| {
            ServiceError::Configuration("at least one storage provider must be configured".into())
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn local(root: &std::path::Path) -> ProviderConfig {
        ProviderConfig::Local(LocalConfig {
            root: root.to_path_buf(),
            public_base_url: None,
            signed_url_base: "/files".into(),
            signing_secret: "secret".into(),
            traversal: Default::default(),
        })
    }

    #[test]
    fn kind_comes_from_the_tag() {
        let parsed: Vec<ProviderConfig> = toml::from_str::<toml::Table>(
            r#"
            [[providers]]
            kind = "minio"
            endpoint = "https://storage.amazonaws.com.example.net"
            bucket = "media"
            access_key_id = "a"
            secret_access_key = "b"

            [[providers]]
            kind = "memory"
            "#,
        )
        .unwrap()
        .remove("providers")
        .unwrap()
        .try_into()
        .unwrap();

        assert_eq!(parsed[0].kind(), ProviderKind::Minio);
        assert_eq!(parsed[1].kind(), ProviderKind::Memory);
    }

    #[test]
    fn rejects_invalid_and_duplicate_configuration() {
        let dir = tempfile::tempdir().unwrap();
        let err = ProviderRegistry::new(vec![local(dir.path()), local(dir.path())], None)
            .unwrap_err();
        assert!(err.to_string().contains("more than once"));

        let bad = ProviderConfig::R2(R2Config {
            account_id: "acc".into(),
            bucket: String::new(),
            access_key_id: "a".into(),
            secret_access_key: "b".into(),
            public_base_url: None,
        });
        assert!(matches!(
            ProviderRegistry::new(vec![bad], None),
            Err(ServiceError::Configuration(_))
        ));

        assert!(ProviderRegistry::new(Vec::new(), None).is_err());
        let err = ProviderRegistry::new(
            vec![ProviderConfig::Memory(MemoryConfig::default())],
            Some(ProviderKind::S3),
        )
        .unwrap_err();
        assert!(err.to_string().contains("default provider"));
    }

    #[tokio::test]
    async fn get_caches_one_instance_per_kind() {
        let dir = tempfile::tempdir().unwrap();
        let registry = ProviderRegistry::new(
            vec![
                local(&dir.path().join("objects")),
                ProviderConfig::Memory(MemoryConfig::default()),
            ],
            Some(ProviderKind::Memory),
        )
        .unwrap();

        assert_eq!(registry.default_kind(), ProviderKind::Memory);
        assert_eq!(
            registry.configured_kinds(),
            vec![ProviderKind::Local, ProviderKind::Memory]
        );
        assert!(!registry.contains(ProviderKind::Cdn));

        let first = registry.get(ProviderKind::Local).await.unwrap();
        let second = registry.get(ProviderKind::Local).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert!(dir.path().join("objects").is_dir());

        let fresh = registry.create_provider(ProviderKind::Local).await.unwrap();
        assert!(!Arc::ptr_eq(&first, &fresh));

        let err = registry
            .get(ProviderKind::Cdn)
            .await
            .err()
            .expect("cdn is not configured");
        assert!(matches!(err, ServiceError::Configuration(_)));
        assert!(registry.local_signer().is_some());
    }

    #[tokio::test]
    async fn construction_fails_fast_on_unusable_root() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("file");
        std::fs::write(&blocker, b"x").unwrap();

        let registry = ProviderRegistry::new(vec![local(&blocker.join("nested"))], None).unwrap();
        let err = registry
            .get(ProviderKind::Local)
            .await
            .err()
            .expect("root below a file cannot be created");
        assert!(matches!(err, ServiceError::ProviderUnavailable(_)));
    }
}
