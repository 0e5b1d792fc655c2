//! User records and the quota fields embedded in them.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use thiserror::Error;
use uuid::Uuid;

/// A user as seen by the storage core.
///
/// Quota fields live inline because they are always read and written
/// together with the user.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug, PartialEq)]
pub struct User {
    pub id: Uuid,

    /// Storage ceiling in bytes.
    pub max_storage_bytes: i64,

    /// Bytes currently accounted to this user.
    pub used_storage_bytes: i64,

    /// Uploads allowed per calendar day (UTC).
    pub max_uploads_per_day: i64,

    /// Uploads performed on `last_upload_date`.
    pub uploads_today: i64,

    /// Calendar day of the most recent upload.
    pub last_upload_date: Option<NaiveDate>,

    pub created_at: DateTime<Utc>,
}

/// Why an upload was refused by the quota ledger.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QuotaError {
    #[error("storage quota exceeded: {used} of {max} bytes used, {requested} more requested")]
    StorageExceeded { used: i64, requested: i64, max: i64 },

    #[error("daily upload limit reached: {count} of {max} uploads today")]
    DailyLimitReached { count: i64, max: i64 },
}

impl User {
    pub fn new(id: Uuid, max_storage_bytes: i64, max_uploads_per_day: i64) -> Self {
        Self {
            id,
            max_storage_bytes,
            used_storage_bytes: 0,
            max_uploads_per_day,
            uploads_today: 0,
            last_upload_date: None,
            created_at: Utc::now(),
        }
    }

    /// Uploads counted for `today`; the counter resets when the last upload
    /// happened on another day.
    pub fn uploads_on(&self, today: NaiveDate) -> i64 {
        match self.last_upload_date {
            Some(date) if date == today => self.uploads_today,
            _ => 0,
        }
    }

    /// Evaluate the quota for an upload of `proposed` bytes.
    ///
    /// An unknown size (`None`) only checks the daily counter; the storage
    /// check is deferred until the size is known.
    pub fn check_quota(&self, proposed: Option<i64>, today: NaiveDate) -> Result<(), QuotaError> {
        if let Some(requested) = proposed {
            if self.used_storage_bytes.saturating_add(requested) > self.max_storage_bytes {
                return Err(QuotaError::StorageExceeded {
                    used: self.used_storage_bytes,
                    requested,
                    max: self.max_storage_bytes,
                });
            }
        }

        let count = self.uploads_on(today);
        if count >= self.max_uploads_per_day {
            return Err(QuotaError::DailyLimitReached {
                count,
                max: self.max_uploads_per_day,
            });
        }

        Ok(())
    }

    /// Apply one upload of `size` bytes performed on `today`.
    #[cfg(test)]
    pub fn apply_upload(&mut self, size: i64, today: NaiveDate) {
        self.uploads_today = self.uploads_on(today) + 1;
        self.used_storage_bytes = self.used_storage_bytes.saturating_add(size);
        self.last_upload_date = Some(today);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Days;

    fn day(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    #[test]
    fn storage_ceiling_is_inclusive() {
        let mut user = User::new(Uuid::new_v4(), 100, 10);
        user.used_storage_bytes = 90;

        let err = user.check_quota(Some(20), day("2024-03-05")).unwrap_err();
        assert!(matches!(err, QuotaError::StorageExceeded { requested: 20, .. }));
        assert!(user.check_quota(Some(10), day("2024-03-05")).is_ok());
    }

    #[test]
    fn daily_counter_resets_on_new_day() {
        let today = day("2024-03-05");
        let mut user = User::new(Uuid::new_v4(), 1_000, 3);
        user.uploads_today = 3;
        user.last_upload_date = today.checked_sub_days(Days::new(1));

        assert!(user.check_quota(Some(1), today).is_ok());
        user.apply_upload(1, today);
        assert_eq!(user.uploads_today, 1);
        assert_eq!(user.last_upload_date, Some(today));
    }

    #[test]
    fn daily_limit_applies_on_same_day() {
        let today = day("2024-03-05");
        let mut user = User::new(Uuid::new_v4(), 1_000, 2);
        user.apply_upload(10, today);
        user.apply_upload(10, today);

        let err = user.check_quota(None, today).unwrap_err();
        assert_eq!(err, QuotaError::DailyLimitReached { count: 2, max: 2 });
    }

    #[test]
    fn unknown_size_skips_storage_check() {
        let mut user = User::new(Uuid::new_v4(), 100, 5);
        user.used_storage_bytes = 100;
        assert!(user.check_quota(None, day("2024-03-05")).is_ok());
    }
}
