//! Concurrent reachability probes across every configured provider.

use super::registry::ProviderRegistry;
use crate::models::{HealthReport, HealthState, HealthStatus, ProviderKind};
use chrono::Utc;
use futures::future::join_all;
use std::{sync::Arc, time::Duration};
use tokio::{sync::RwLock, time::Instant};
use tracing::{debug, warn};

pub struct HealthService {
    registry: Arc<ProviderRegistry>,
    probe_timeout: Option<Duration>,
    last: RwLock<Option<HealthReport>>,
}

impl HealthService {
    /// `probe_timeout` of `None` lets a probe run for as long as the
    /// backend takes.
    pub fn new(registry: Arc<ProviderRegistry>, probe_timeout: Option<Duration>) -> Self {
        Self {
            registry,
            probe_timeout,
            last: RwLock::new(None),
        }
    }

    async fn probe(&self, kind: ProviderKind) -> Result<(), String> {
        let provider = self.registry.get(kind).await.map_err(|err| err.to_string())?;
        provider.check_health().await.map_err(|err| err.to_string())
    }

    /// Probe one provider. Failures are reported in the status, never raised.
    pub async fn check(&self, kind: ProviderKind) -> HealthStatus {
        let started = Instant::now();
        let outcome = match self.probe_timeout {
            Some(limit) => tokio::time::timeout(limit, self.probe(kind))
                .await
                .unwrap_or_else(|_| {
                    Err(format!("health probe timed out after {} ms", limit.as_millis()))
                }),
            None => self.probe(kind).await,
        };
        let latency_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

        let (status, message) = match outcome {
            Ok(()) => {
                debug!(provider = %kind, latency_ms, "provider healthy");
                (HealthState::Healthy, "ok".to_string())
            }
            Err(message) => {
                warn!(provider = %kind, latency_ms, "provider unhealthy: {}", message);
                (HealthState::Error, message)
            }
        };

        HealthStatus {
            provider: kind,
            status,
            message,
            checked_at: Utc::now(),
            latency_ms,
        }
    }

    /// Probe every configured provider concurrently and wait for all of them.
    pub async fn check_all(&self) -> HealthReport {
        let kinds = self.registry.configured_kinds();
        let statuses = join_all(kinds.iter().map(|kind| self.check(*kind))).await;

        let report = HealthReport {
            checked_at: Utc::now(),
            providers: statuses
                .into_iter()
                .map(|status| (status.provider, status))
                .collect(),
        };
        *self.last.write().await = Some(report.clone());
        report
    }

    /// Most recent aggregate report, if any.
    pub async fn last_report(&self) -> Option<HealthReport> {
        self.last.read().await.clone()
    }
}
