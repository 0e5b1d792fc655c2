//! Defines routes for media, signed-file and health operations.
//!
//! ## Structure
//! - **Media endpoints** (caller identified by `x-user-id`)
//!   - `POST   /media`                 upload (raw body, `?name=&provider=&media_type=`)
//!   - `GET    /media`                 list the caller's media
//!   - `GET    /media/{id}`            metadata
//!   - `DELETE /media/{id}`            delete
//!   - `GET    /media/{id}/content`    download
//!   - `GET    /media/{id}/signed-url` time-limited URL
//!
//! - **Signed files**
//!   - `GET    /files/{*key}`          local objects behind an HMAC-signed link
//!
//! - **Health**
//!   - `/healthz`, `/readyz`, `/health/providers`, `/health/providers/{kind}`

use crate::handlers::{
    AppState,
    health_handlers::{healthz, provider_health, providers_health, readyz},
    media_handlers::{
        delete_media, download_media, get_media, list_media, serve_signed_file, signed_url,
        upload_media,
    },
};
use axum::{Router, routing::get};

/// Build the router. The caller attaches `AppState` with `with_state`.
pub fn routes() -> Router<AppState> {
    Router::new()
        // health endpoints (mounted at root)
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/health/providers", get(providers_health))
        .route("/health/providers/{kind}", get(provider_health))
        // media
        .route("/media", get(list_media).post(upload_media))
        .route("/media/{id}", get(get_media).delete(delete_media))
        .route("/media/{id}/content", get(download_media))
        .route("/media/{id}/signed-url", get(signed_url))
        // signed links issued by the local provider
        .route("/files/{*key}", get(serve_signed_file))
}
