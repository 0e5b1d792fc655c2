//! Health probe results.

use super::provider_kind::ProviderKind;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    Healthy,
    Error,
}

/// Result of probing one provider. Produced fresh by every probe.
#[derive(Debug, Clone, Serialize)]
pub struct HealthStatus {
    pub provider: ProviderKind,
    pub status: HealthState,
    pub message: String,
    pub checked_at: DateTime<Utc>,
    pub latency_ms: u64,
}

impl HealthStatus {
    pub fn is_healthy(&self) -> bool {
        self.status == HealthState::Healthy
    }
}

/// One status per configured provider.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub checked_at: DateTime<Utc>,
    pub providers: BTreeMap<ProviderKind, HealthStatus>,
}

impl HealthReport {
    pub fn all_healthy(&self) -> bool {
        self.providers.values().all(HealthStatus::is_healthy)
    }
}
