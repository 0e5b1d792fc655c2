use anyhow::{Context, Result};
use axum::Router;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use std::{fs, io::ErrorKind, path::Path, str::FromStr, sync::Arc};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

mod config;
mod errors;
mod handlers;
mod models;
mod providers;
mod repositories;
mod routes;
mod services;

use config::{AppConfig, StorageConfig};
use handlers::AppState;
use models::User;
use repositories::{RepositoryError, SqliteRepository, UserRepository};
use services::{HealthService, MediaService, OrphanCleanup, ProviderRegistry, UploadSettings};

#[tokio::main]
async fn main() -> Result<()> {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // --- Parse config + startup actions ---
    let (cfg, actions) = AppConfig::from_env_and_args()?;

    tracing::info!("Starting media-store with config: {:?}", cfg);

    // --- Initialize SQLite connection ---
    let db_url = &cfg.database_url;
    let db_path = db_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .trim_start_matches("file:");
    tracing::debug!("Interpreted SQLite path => {}", db_path);

    // Create parent directory if needed
    if let Some(parent) = Path::new(db_path).parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent)?;
            tracing::info!("Created missing directory {:?}", parent);
        }
    }

    let options = SqliteConnectOptions::from_str(db_url)
        .with_context(|| format!("parsing database url {}", db_url))?
        .create_if_missing(true);
    let db = Arc::new(
        SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?,
    );

    // --- Migrations (idempotent) ---
    repositories::run_migrations(&db).await?;
    if actions.migrate {
        tracing::info!("Database migration complete.");
        return Ok(()); // exit after migration
    }

    let repo = SqliteRepository::new(db.clone());

    // --- Storage configuration ---
    let storage = load_storage_config(&cfg)?;

    if let Some(user_id) = actions.seed_user {
        seed_user(&repo, user_id, &storage).await?;
    }

    // --- Providers: validate every entry, then construct each one so a bad
    // root or credential stops startup ---
    let registry = Arc::new(ProviderRegistry::from_config(&storage)?);
    for kind in registry.configured_kinds() {
        registry.get(kind).await?;
    }
    tracing::info!(
        "Configured providers: {:?} (default: {})",
        registry.configured_kinds(),
        registry.default_kind()
    );

    // --- Initialize core services ---
    let repo_arc = Arc::new(repo);
    let (cleanup, _cleanup_worker) = OrphanCleanup::spawn(registry.clone(), repo_arc.clone());
    let media = MediaService::new(
        registry.clone(),
        repo_arc.clone(),
        repo_arc,
        cleanup,
        UploadSettings::from(&storage),
    );
    let health = HealthService::new(registry.clone(), storage.health.probe_timeout());

    let state = AppState {
        db,
        media: Arc::new(media),
        health: Arc::new(health),
        local_signer: registry.local_signer(),
        registry,
        default_signed_url_expiry: storage.default_signed_url_expiry(),
    };

    // --- Build router ---
    let app: Router = routes::routes::routes().with_state(state);

    // --- Start server ---
    let addr = cfg.addr();
    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(err)
            if err.kind() == ErrorKind::PermissionDenied
                && matches!(cfg.host.as_str(), "0.0.0.0" | "::") =>
        {
            let fallback_addr = format!("127.0.0.1:{}", cfg.port);
            tracing::warn!(
                "Permission denied binding to {} ({}). Falling back to {}",
                addr,
                err,
                fallback_addr
            );
            TcpListener::bind(&fallback_addr).await?
        }
        Err(err) => return Err(err.into()),
    };

    tracing::info!("Server listening on http://{}", listener.local_addr()?);
    axum::serve(listener, app).await?;

    Ok(())
}

/// Providers file when one is given, otherwise a single local provider under
/// `storage_dir`.
fn load_storage_config(cfg: &AppConfig) -> Result<StorageConfig> {
    if let Some(path) = &cfg.providers_file {
        tracing::info!("Loading providers from {}", path);
        return StorageConfig::load(path);
    }

    if !Path::new(&cfg.storage_dir).exists() {
        fs::create_dir_all(&cfg.storage_dir)?;
        tracing::info!("Created storage directory at {}", cfg.storage_dir);
    }

    let secret = match &cfg.signing_secret {
        Some(secret) => secret.clone(),
        None => {
            tracing::warn!(
                "MEDIA_STORE_SIGNING_SECRET is not set; signed URLs will not survive a restart"
            );
            format!("{}{}", Uuid::new_v4().simple(), Uuid::new_v4().simple())
        }
    };
    Ok(StorageConfig::local_default(&cfg.storage_dir, secret))
}

async fn seed_user(repo: &SqliteRepository, id: Uuid, storage: &StorageConfig) -> Result<()> {
    let user = User::new(
        id,
        storage.default_quota.max_storage_bytes,
        storage.default_quota.max_uploads_per_day,
    );
    match repo.create_user(&user).await {
        Ok(user) => {
            tracing::info!(
                user_id = %user.id,
                max_storage_bytes = user.max_storage_bytes,
                max_uploads_per_day = user.max_uploads_per_day,
                "Seeded user"
            );
            Ok(())
        }
        Err(RepositoryError::Conflict(_)) => {
            // Existing users keep their usage; only the limits follow the config.
            let mut existing = repo.find_user(id).await?;
            existing.max_storage_bytes = user.max_storage_bytes;
            existing.max_uploads_per_day = user.max_uploads_per_day;
            repo.update_user(&existing).await?;
            tracing::info!(
                user_id = %id,
                max_storage_bytes = existing.max_storage_bytes,
                max_uploads_per_day = existing.max_uploads_per_day,
                "Updated quota limits of existing user"
            );
            Ok(())
        }
        Err(err) => Err(err.into()),
    }
}
