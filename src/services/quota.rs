//! Per-user quota ledger.
//!
//! Storage and daily-upload limits live inline on the user record. Checks
//! read the record; consumption is recorded with a single conditional update
//! so concurrent uploads of one user cannot jointly overshoot the ceiling.

use super::error::{ServiceError, ServiceResult};
use crate::{
    models::{QuotaError, User},
    repositories::UserRepository,
};
use chrono::{NaiveDate, Utc};
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

const RECORD_ATTEMPTS: usize = 2;

#[derive(Clone)]
pub struct QuotaLedger {
    users: Arc<dyn UserRepository>,
}

fn today() -> NaiveDate {
    Utc::now().date_naive()
}

fn to_bytes(size: u64) -> ServiceResult<i64> {
    i64::try_from(size).map_err(|_| ServiceError::Validation(format!("size {size} is too large")))
}

impl QuotaLedger {
    pub fn new(users: Arc<dyn UserRepository>) -> Self {
        Self { users }
    }

    /// Whether `user_id` may upload `proposed` more bytes today.
    ///
    /// With an unknown size only the daily counter is checked; the storage
    /// ceiling is enforced when the upload is recorded.
    pub async fn can_upload(&self, user_id: Uuid, proposed: Option<u64>) -> ServiceResult<()> {
        self.can_upload_on(user_id, proposed, today()).await
    }

    async fn can_upload_on(
        &self,
        user_id: Uuid,
        proposed: Option<u64>,
        today: NaiveDate,
    ) -> ServiceResult<()> {
        let user = self.users.find_user(user_id).await?;
        let proposed = proposed.map(to_bytes).transpose()?;
        user.check_quota(proposed, today)?;
        Ok(())
    }

    /// Account one completed upload of `size` bytes.
    ///
    /// Fails with [`ServiceError::QuotaExceeded`] when either limit would be
    /// violated; nothing is recorded in that case.
    pub async fn record_upload(&self, user_id: Uuid, size: u64) -> ServiceResult<User> {
        self.record_upload_on(user_id, size, today()).await
    }

    async fn record_upload_on(
        &self,
        user_id: Uuid,
        size: u64,
        today: NaiveDate,
    ) -> ServiceResult<User> {
        let size = to_bytes(size)?;
        for attempt in 1..=RECORD_ATTEMPTS {
            if let Some(user) = self.users.apply_upload(user_id, size, today).await? {
                debug!(
                    %user_id,
                    used = user.used_storage_bytes,
                    uploads_today = user.uploads_today,
                    "recorded upload"
                );
                return Ok(user);
            }

            // The conditional update matched nothing: find out which limit.
            let user = self.users.find_user(user_id).await?;
            if let Err(err) = user.check_quota(Some(size), today) {
                return Err(err.into());
            }
            warn!(%user_id, attempt, "quota record raced with a concurrent update");
        }

        let user = self.users.find_user(user_id).await?;
        Err(ServiceError::QuotaExceeded(QuotaError::StorageExceeded {
            used: user.used_storage_bytes,
            requested: size,
            max: user.max_storage_bytes,
        }))
    }

    /// Return `size` bytes to the user's storage allowance.
    pub async fn release(&self, user_id: Uuid, size: u64) -> ServiceResult<User> {
        let size = to_bytes(size)?;
        Ok(self.users.release_storage(user_id, size).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repositories::{SqliteRepository, sqlite::tests::memory_repository};
    use chrono::Days;

    fn day(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    async fn ledger_with(user: User) -> (QuotaLedger, SqliteRepository) {
        let repo = memory_repository().await;
        repo.create_user(&user).await.unwrap();
        (QuotaLedger::new(Arc::new(repo.clone())), repo)
    }

    #[tokio::test]
    async fn storage_limit_is_enforced_before_upload() {
        let mut user = User::new(Uuid::new_v4(), 100, 10);
        user.used_storage_bytes = 90;
        let (ledger, _) = ledger_with(user.clone()).await;

        let err = ledger.can_upload(user.id, Some(20)).await.unwrap_err();
        assert!(matches!(
            err,
            ServiceError::QuotaExceeded(QuotaError::StorageExceeded { .. })
        ));
        ledger.can_upload(user.id, Some(10)).await.unwrap();
    }

    #[tokio::test]
    async fn new_day_resets_the_counter() {
        let today = day("2024-03-05");
        let mut user = User::new(Uuid::new_v4(), 1_000, 3);
        user.uploads_today = 3;
        user.last_upload_date = today.checked_sub_days(Days::new(1));
        let (ledger, _) = ledger_with(user.clone()).await;

        ledger.can_upload_on(user.id, Some(5), today).await.unwrap();
        let recorded = ledger.record_upload_on(user.id, 5, today).await.unwrap();
        assert_eq!(recorded.uploads_today, 1);
        assert_eq!(recorded.used_storage_bytes, 5);
        assert_eq!(recorded.last_upload_date, Some(today));
    }

    #[tokio::test]
    async fn daily_limit_blocks_checks_and_records() {
        let today = day("2024-03-05");
        let mut user = User::new(Uuid::new_v4(), 1_000, 1);
        user.uploads_today = 1;
        user.last_upload_date = Some(today);
        let (ledger, _) = ledger_with(user.clone()).await;

        let err = ledger.can_upload_on(user.id, None, today).await.unwrap_err();
        assert!(matches!(
            err,
            ServiceError::QuotaExceeded(QuotaError::DailyLimitReached { count: 1, max: 1 })
        ));
        let err = ledger.record_upload_on(user.id, 1, today).await.unwrap_err();
        assert!(matches!(err, ServiceError::QuotaExceeded(_)));
    }

    #[tokio::test]
    async fn unknown_size_is_checked_when_recorded() {
        let mut user = User::new(Uuid::new_v4(), 100, 10);
        user.used_storage_bytes = 90;
        let (ledger, repo) = ledger_with(user.clone()).await;

        ledger.can_upload(user.id, None).await.unwrap();
        let err = ledger.record_upload(user.id, 20).await.unwrap_err();
        assert!(matches!(
            err,
            ServiceError::QuotaExceeded(QuotaError::StorageExceeded { requested: 20, .. })
        ));
        assert_eq!(repo.find_user(user.id).await.unwrap().used_storage_bytes, 90);
    }

    #[tokio::test]
    async fn concurrent_records_never_overshoot() {
        let user = User::new(Uuid::new_v4(), 100, 100);
        let (ledger, repo) = ledger_with(user.clone()).await;

        let attempts = (0..5).map(|_| ledger.record_upload(user.id, 30));
        let results = futures::future::join_all(attempts).await;
        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 3);
        assert_eq!(repo.find_user(user.id).await.unwrap().used_storage_bytes, 90);

        let released = ledger.release(user.id, 60).await.unwrap();
        assert_eq!(released.used_storage_bytes, 30);
    }

    #[tokio::test]
    async fn unknown_user_is_not_found() {
        let (ledger, _) = ledger_with(User::new(Uuid::new_v4(), 1, 1)).await;
        let err = ledger.can_upload(Uuid::new_v4(), Some(1)).await.unwrap_err();
        assert!(matches!(err, ServiceError::NotFound(_)));
    }
}
