//! Persistence boundary for users (with their inline quota fields) and
//! media records.

pub mod sqlite;

use crate::models::{Media, ProviderKind, User};
use async_trait::async_trait;
use chrono::NaiveDate;
use thiserror::Error;
use uuid::Uuid;

pub use sqlite::{SqliteRepository, run_migrations};

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("{0} not found")]
    NotFound(String),
    #[error("{0} already exists")]
    Conflict(String),
    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

pub type RepositoryResult<T> = Result<T, RepositoryError>;

#[async_trait]
pub trait UserRepository: Send + Sync {
    async fn find_user(&self, id: Uuid) -> RepositoryResult<User>;

    /// Overwrite the quota fields of an existing user.
    async fn update_user(&self, user: &User) -> RepositoryResult<()>;

    async fn create_user(&self, user: &User) -> RepositoryResult<User>;

    /// Atomically account one upload of `size` bytes on `today`.
    ///
    /// The update only applies when both the storage ceiling and the daily
    /// counter (reset when `today` differs from the last upload date) allow
    /// it. Returns `None` when a limit blocked the update.
    async fn apply_upload(
        &self,
        id: Uuid,
        size: i64,
        today: NaiveDate,
    ) -> RepositoryResult<Option<User>>;

    /// Give back `size` bytes of storage, never going below zero.
    async fn release_storage(&self, id: Uuid, size: i64) -> RepositoryResult<User>;
}

#[async_trait]
pub trait MediaRepository: Send + Sync {
    async fn create_media(&self, media: &Media) -> RepositoryResult<Media>;

    /// A live (not soft-deleted) media record.
    async fn find_media(&self, id: Uuid) -> RepositoryResult<Media>;

    /// Live media of one user, newest first.
    async fn list_for_user(&self, user_id: Uuid) -> RepositoryResult<Vec<Media>>;

    /// Live records stored under `key` on `provider`, oldest first.
    async fn live_for_key(&self, provider: ProviderKind, key: &str)
    -> RepositoryResult<Vec<Media>>;

    /// Soft-delete a record. Returns `false` when it was already gone.
    async fn mark_deleted(&self, id: Uuid) -> RepositoryResult<bool>;
}
