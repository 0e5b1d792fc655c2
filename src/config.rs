use crate::{models::ProviderKind, providers::local::LocalConfig, services::registry::ProviderConfig};
use anyhow::{Context, Result};
use clap::Parser;
use serde::Deserialize;
use std::{env, fs, path::Path, time::Duration};
use uuid::Uuid;

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub storage_dir: String,
    pub database_url: String,
    pub providers_file: Option<String>,
    pub signing_secret: Option<String>,
}

impl std::fmt::Debug for AppConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("storage_dir", &self.storage_dir)
            .field("database_url", &self.database_url)
            .field("providers_file", &self.providers_file)
            .field("signing_secret", &self.signing_secret.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// One-off actions requested on the command line.
#[derive(Debug, Clone, Default)]
pub struct StartupActions {
    /// Run migrations and exit.
    pub migrate: bool,
    /// Create this user with the default quota before serving.
    pub seed_user: Option<Uuid>,
}

/// Command-line + environment configuration.
#[derive(Parser, Debug)]
#[command(author, version, about = "Media storage service")]
pub struct Args {
    /// Host to bind to (overrides MEDIA_STORE_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides MEDIA_STORE_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Root of the default local provider (overrides MEDIA_STORE_STORAGE_DIR)
    #[arg(long)]
    pub storage_dir: Option<String>,

    /// Database URL (overrides MEDIA_STORE_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// TOML file describing storage providers (overrides MEDIA_STORE_PROVIDERS_FILE)
    #[arg(long)]
    pub providers_file: Option<String>,

    /// Run migrations and exit
    #[arg(long)]
    pub migrate: bool,

    /// Create a user with the default quota
    #[arg(long)]
    pub seed_user: Option<Uuid>,
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and startup actions.
    pub fn from_env_and_args() -> Result<(Self, StartupActions)> {
        Self::from_args(Args::parse(), |name| env::var(name).ok())
    }

    /// Merge parsed arguments over values looked up with `env`.
    pub fn from_args(
        args: Args,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<(Self, StartupActions)> {
        let env_host = env("MEDIA_STORE_HOST").unwrap_or_else(|| "0.0.0.0".into());
        let env_port = match env("MEDIA_STORE_PORT") {
            Some(value) => value
                .parse::<u16>()
                .with_context(|| format!("parsing MEDIA_STORE_PORT value `{}`", value))?,
            None => 3000,
        };
        let env_storage =
            env("MEDIA_STORE_STORAGE_DIR").unwrap_or_else(|| "./data/objects".into());
        let env_db = env("MEDIA_STORE_DATABASE_URL")
            .unwrap_or_else(|| "sqlite://./data/meta/media_store.db".into());

        let cfg = Self {
            host: args.host.unwrap_or(env_host),
            port: args.port.unwrap_or(env_port),
            storage_dir: args.storage_dir.unwrap_or(env_storage),
            database_url: args.database_url.unwrap_or(env_db),
            providers_file: args
                .providers_file
                .or_else(|| env("MEDIA_STORE_PROVIDERS_FILE")),
            signing_secret: env("MEDIA_STORE_SIGNING_SECRET").filter(|s| !s.is_empty()),
        };

        let actions = StartupActions {
            migrate: args.migrate,
            seed_user: args.seed_user,
        };
        Ok((cfg, actions))
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn default_max_upload_bytes() -> u64 {
    512 * 1024 * 1024
}

fn default_signed_url_expiry_secs() -> u64 {
    3600
}

fn default_probe_timeout_ms() -> u64 {
    5000
}

/// Quota given to newly created users.
#[derive(Debug, Clone, Deserialize)]
pub struct QuotaDefaults {
    pub max_storage_bytes: i64,
    pub max_uploads_per_day: i64,
}

impl Default for QuotaDefaults {
    fn default() -> Self {
        Self {
            max_storage_bytes: 1024 * 1024 * 1024,
            max_uploads_per_day: 100,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct HealthConfig {
    /// Per-probe limit in milliseconds; 0 disables it.
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            probe_timeout_ms: default_probe_timeout_ms(),
        }
    }
}

impl HealthConfig {
    pub fn probe_timeout(&self) -> Option<Duration> {
        (self.probe_timeout_ms > 0).then(|| Duration::from_millis(self.probe_timeout_ms))
    }
}

/// Storage section: the providers plus upload policy.
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Provider used when an upload names none; the first configured kind
    /// otherwise.
    #[serde(default)]
    pub default_provider: Option<ProviderKind>,

    #[serde(default)]
    pub unique_keys: bool,

    #[serde(default = "default_max_upload_bytes")]
    pub max_upload_bytes: u64,

    #[serde(default)]
    pub allowed_extensions: Vec<String>,

    #[serde(default = "default_signed_url_expiry_secs")]
    pub default_signed_url_expiry_secs: u64,

    #[serde(default)]
    pub default_quota: QuotaDefaults,

    #[serde(default)]
    pub health: HealthConfig,

    #[serde(default)]
    pub providers: Vec<ProviderConfig>,
}

impl StorageConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)
            .with_context(|| format!("reading providers file {}", path.display()))?;
        Self::parse(&raw).with_context(|| format!("parsing providers file {}", path.display()))
    }

    pub fn parse(raw: &str) -> Result<Self> {
        Ok(toml::from_str(raw)?)
    }

    /// A single local provider rooted at `storage_dir`.
    pub fn local_default(storage_dir: &str, signing_secret: String) -> Self {
        Self {
            default_provider: Some(ProviderKind::Local),
            unique_keys: false,
            max_upload_bytes: default_max_upload_bytes(),
            allowed_extensions: Vec::new(),
            default_signed_url_expiry_secs: default_signed_url_expiry_secs(),
            default_quota: QuotaDefaults::default(),
            health: HealthConfig::default(),
            providers: vec![ProviderConfig::Local(LocalConfig {
                root: storage_dir.into(),
                public_base_url: None,
                signed_url_base: "/files".into(),
                signing_secret,
                traversal: Default::default(),
            })],
        }
    }

    pub fn default_signed_url_expiry(&self) -> Duration {
        Duration::from_secs(self.default_signed_url_expiry_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn cli_overrides_environment() {
        let args = Args::try_parse_from(["media-store", "--port", "9000", "--migrate"]).unwrap();
        let (cfg, actions) = AppConfig::from_args(
            args,
            lookup(&[
                ("MEDIA_STORE_PORT", "8000"),
                ("MEDIA_STORE_HOST", "127.0.0.1"),
                ("MEDIA_STORE_SIGNING_SECRET", "s3cret"),
            ]),
        )
        .unwrap();

        assert_eq!(cfg.addr(), "127.0.0.1:9000");
        assert_eq!(cfg.storage_dir, "./data/objects");
        assert!(actions.migrate);
        assert!(actions.seed_user.is_none());
        assert!(!format!("{cfg:?}").contains("s3cret"));
    }

    #[test]
    fn bad_port_is_reported() {
        let args = Args::try_parse_from(["media-store"]).unwrap();
        let err = AppConfig::from_args(args, lookup(&[("MEDIA_STORE_PORT", "http")]))
            .unwrap_err();
        assert!(err.to_string().contains("MEDIA_STORE_PORT"));
    }

    #[test]
    fn parses_providers_file() {
        let config = StorageConfig::parse(
            r#"
            default_provider = "cdn"
            unique_keys = true
            allowed_extensions = ["png", ".JPG"]

            [default_quota]
            max_storage_bytes = 1000
            max_uploads_per_day = 5

            [health]
            probe_timeout_ms = 0

            [[providers]]
            kind = "local"
            root = "/var/media"
            signing_secret = "local-secret"
            traversal = "strip"

            [[providers]]
            kind = "cdn"
            storage_endpoint = "https://storage.bunnycdn.com"
            storage_zone = "media"
            access_key = "zone-key"
            pull_zone_url = "https://media.b-cdn.net"
            token_key = "token-secret"
            "#,
        )
        .unwrap();

        assert_eq!(config.default_provider, Some(ProviderKind::Cdn));
        assert!(config.unique_keys);
        assert_eq!(config.max_upload_bytes, default_max_upload_bytes());
        assert_eq!(config.default_quota.max_uploads_per_day, 5);
        assert_eq!(config.health.probe_timeout(), None);
        assert_eq!(config.providers.len(), 2);
        assert_eq!(config.providers[1].kind(), ProviderKind::Cdn);
        let rendered = format!("{config:?}");
        assert!(!rendered.contains("zone-key"));
        assert!(!rendered.contains("token-secret"));
    }

    #[test]
    fn unknown_kind_is_rejected() {
        let err = StorageConfig::parse(
            r#"
            [[providers]]
            kind = "ftp"
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("ftp") || format!("{err:#}").contains("ftp"));
    }

    #[test]
    fn local_default_uses_five_second_probes() {
        let config = StorageConfig::local_default("./data", "secret".into());
        assert_eq!(config.health.probe_timeout(), Some(Duration::from_secs(5)));
        assert_eq!(config.providers[0].kind(), ProviderKind::Local);
        assert_eq!(config.default_signed_url_expiry(), Duration::from_secs(3600));
    }
}
