//! HTTP handlers and the state they share.

pub mod health_handlers;
pub mod media_handlers;

use crate::{
    providers::signing::UrlSigner,
    services::{HealthService, MediaService, ProviderRegistry},
};
use sqlx::SqlitePool;
use std::{sync::Arc, time::Duration};

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub db: Arc<SqlitePool>,
    pub media: Arc<MediaService>,
    pub health: Arc<HealthService>,
    pub registry: Arc<ProviderRegistry>,
    /// Verifies `/files` links issued by the local provider.
    pub local_signer: Option<UrlSigner>,
    pub default_signed_url_expiry: Duration,
}
