//! Detached removal of backend objects that lost their metadata record.
//!
//! Jobs are queued on an unbounded channel so scheduling never blocks the
//! request that discovered the orphan. Failures only surface in the logs.
//! An object that a live media record points at again by the time its job
//! runs is left alone.

use super::{error::ServiceError, registry::ProviderRegistry};
use crate::{models::ProviderKind, repositories::MediaRepository};
use std::{sync::Arc, time::Duration};
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{debug, error, info, warn};

const MAX_ATTEMPTS: u32 = 3;
const DEFAULT_BACKOFF: Duration = Duration::from_millis(500);

#[derive(Debug)]
struct OrphanedObject {
    kind: ProviderKind,
    key: String,
    reason: String,
}

/// Handle for scheduling orphan deletes. The worker stops once every handle
/// is dropped and the queue is drained.
#[derive(Debug, Clone)]
pub struct OrphanCleanup {
    tx: mpsc::UnboundedSender<OrphanedObject>,
}

impl OrphanCleanup {
    pub fn spawn(
        registry: Arc<ProviderRegistry>,
        media: Arc<dyn MediaRepository>,
    ) -> (Self, JoinHandle<()>) {
        Self::spawn_with_backoff(registry, media, DEFAULT_BACKOFF)
    }

    pub(crate) fn spawn_with_backoff(
        registry: Arc<ProviderRegistry>,
        media: Arc<dyn MediaRepository>,
        backoff: Duration,
    ) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let worker = tokio::spawn(run(registry, media, rx, backoff));
        (Self { tx }, worker)
    }

    pub fn schedule(&self, kind: ProviderKind, key: impl Into<String>, reason: impl Into<String>) {
        let job = OrphanedObject {
            kind,
            key: key.into(),
            reason: reason.into(),
        };
        debug!(
            provider = %job.kind,
            key = %job.key,
            reason = %job.reason,
            "scheduling orphan cleanup"
        );
        if let Err(mpsc::error::SendError(job)) = self.tx.send(job) {
            error!(
                provider = %job.kind,
                key = %job.key,
                "cleanup worker is gone, object stays orphaned"
            );
        }
    }
}

async fn run(
    registry: Arc<ProviderRegistry>,
    media: Arc<dyn MediaRepository>,
    mut rx: mpsc::UnboundedReceiver<OrphanedObject>,
    backoff: Duration,
) {
    while let Some(job) = rx.recv().await {
        if still_referenced(media.as_ref(), &job).await {
            continue;
        }
        remove(&registry, &job, backoff).await;
    }
    debug!("orphan cleanup worker stopped");
}

/// Lookup failures count as referenced; the object then stays put.
async fn still_referenced(media: &dyn MediaRepository, job: &OrphanedObject) -> bool {
    match media.live_for_key(job.kind, &job.key).await {
        Ok(records) if records.is_empty() => false,
        Ok(records) => {
            info!(
                provider = %job.kind,
                key = %job.key,
                media_id = %records[0].id,
                "object is referenced by live media, skipping cleanup"
            );
            true
        }
        Err(err) => {
            warn!(
                provider = %job.kind,
                key = %job.key,
                "could not check references, keeping object: {}",
                err
            );
            true
        }
    }
}

async fn remove(registry: &ProviderRegistry, job: &OrphanedObject, backoff: Duration) {
    for attempt in 1..=MAX_ATTEMPTS {
        let result = match registry.get(job.kind).await {
            Ok(provider) => provider.delete(&job.key).await.map_err(ServiceError::from),
            Err(err) => Err(err),
        };
        match result {
            Ok(()) => {
                info!(
                    provider = %job.kind,
                    key = %job.key,
                    reason = %job.reason,
                    "removed orphaned object"
                );
                return;
            }
            Err(err) => {
                error!(
                    provider = %job.kind,
                    key = %job.key,
                    attempt,
                    "orphan cleanup failed: {}",
                    err
                );
                if attempt < MAX_ATTEMPTS {
                    tokio::time::sleep(backoff * attempt).await;
                }
            }
        }
    }
}
