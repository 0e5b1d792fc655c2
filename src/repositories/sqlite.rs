//! SQLite implementation of the repositories.

use super::{MediaRepository, RepositoryError, RepositoryResult, UserRepository};
use crate::models::{Media, ProviderKind, User};
use async_trait::async_trait;
use chrono::NaiveDate;
use sqlx::SqlitePool;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

const INIT_MIGRATION: &str = include_str!("../../migrations/0001_init.sql");

const USER_COLUMNS: &str = "id, max_storage_bytes, used_storage_bytes, max_uploads_per_day,
     uploads_today, last_upload_date, created_at";

const MEDIA_COLUMNS: &str = "id, user_id, file_name, storage_key, size_bytes, media_type,
     content_type, provider, url, uploaded_at, is_deleted";

/// Run the embedded schema migration. Statements are idempotent.
pub async fn run_migrations(db: &SqlitePool) -> RepositoryResult<usize> {
    let statements = INIT_MIGRATION
        .split(';')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>();

    info!("Running {} migration statements...", statements.len());

    for stmt in &statements {
        debug!("Executing migration SQL: {}", stmt);
        sqlx::query(stmt).execute(db).await?;
    }

    Ok(statements.len())
}

fn not_found(what: &str, id: Uuid) -> impl FnOnce(sqlx::Error) -> RepositoryError + '_ {
    move |err| match err {
        sqlx::Error::RowNotFound => RepositoryError::NotFound(format!("{what} `{id}`")),
        other => RepositoryError::Database(other),
    }
}

fn conflict(what: &str, id: Uuid) -> impl FnOnce(sqlx::Error) -> RepositoryError + '_ {
    move |err| match err {
        sqlx::Error::Database(db) if db.is_unique_violation() => {
            RepositoryError::Conflict(format!("{what} `{id}`"))
        }
        other => RepositoryError::Database(other),
    }
}

#[derive(Clone)]
pub struct SqliteRepository {
    db: Arc<SqlitePool>,
}

impl SqliteRepository {
    pub fn new(db: Arc<SqlitePool>) -> Self {
        Self { db }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.db
    }
}

#[async_trait]
impl UserRepository for SqliteRepository {
    async fn find_user(&self, id: Uuid) -> RepositoryResult<User> {
        sqlx::query_as::<_, User>(&format!("SELECT {USER_COLUMNS} FROM users WHERE id = ?"))
            .bind(id)
            .fetch_one(&*self.db)
            .await
            .map_err(not_found("user", id))
    }

    async fn update_user(&self, user: &User) -> RepositoryResult<()> {
        let result = sqlx::query(
            "UPDATE users SET
                max_storage_bytes = ?, used_storage_bytes = ?, max_uploads_per_day = ?,
                uploads_today = ?, last_upload_date = ?
             WHERE id = ?",
        )
        .bind(user.max_storage_bytes)
        .bind(user.used_storage_bytes)
        .bind(user.max_uploads_per_day)
        .bind(user.uploads_today)
        .bind(user.last_upload_date)
        .bind(user.id)
        .execute(&*self.db)
        .await?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound(format!("user `{}`", user.id)));
        }
        Ok(())
    }

    async fn create_user(&self, user: &User) -> RepositoryResult<User> {
        sqlx::query_as::<_, User>(&format!(
            "INSERT INTO users ({USER_COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?)
             RETURNING {USER_COLUMNS}"
        ))
        .bind(user.id)
        .bind(user.max_storage_bytes)
        .bind(user.used_storage_bytes)
        .bind(user.max_uploads_per_day)
        .bind(user.uploads_today)
        .bind(user.last_upload_date)
        .bind(user.created_at)
        .fetch_one(&*self.db)
        .await
        .map_err(conflict("user", user.id))
    }

    async fn apply_upload(
        &self,
        id: Uuid,
        size: i64,
        today: NaiveDate,
    ) -> RepositoryResult<Option<User>> {
        let updated = sqlx::query_as::<_, User>(&format!(
            "UPDATE users SET
                used_storage_bytes = used_storage_bytes + ?1,
                uploads_today = CASE WHEN last_upload_date = ?2 THEN uploads_today + 1 ELSE 1 END,
                last_upload_date = ?2
             WHERE id = ?3
               AND used_storage_bytes + ?1 <= max_storage_bytes
               AND (last_upload_date IS NULL
                    OR last_upload_date <> ?2
                    OR uploads_today < max_uploads_per_day)
             RETURNING {USER_COLUMNS}"
        ))
        .bind(size)
        .bind(today)
        .bind(id)
        .fetch_optional(&*self.db)
        .await?;
        Ok(updated)
    }

    async fn release_storage(&self, id: Uuid, size: i64) -> RepositoryResult<User> {
        sqlx::query_as::<_, User>(&format!(
            "UPDATE users SET used_storage_bytes = MAX(used_storage_bytes - ?1, 0)
             WHERE id = ?2
             RETURNING {USER_COLUMNS}"
        ))
        .bind(size)
        .bind(id)
        .fetch_one(&*self.db)
        .await
        .map_err(not_found("user", id))
    }
}

#[async_trait]
impl MediaRepository for SqliteRepository {
    async fn create_media(&self, media: &Media) -> RepositoryResult<Media> {
        sqlx::query_as::<_, Media>(&format!(
            "INSERT INTO media ({MEDIA_COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             RETURNING {MEDIA_COLUMNS}"
        ))
        .bind(media.id)
        .bind(media.user_id)
        .bind(&media.file_name)
        .bind(&media.storage_key)
        .bind(media.size_bytes)
        .bind(media.media_type)
        .bind(&media.content_type)
        .bind(media.provider)
        .bind(&media.url)
        .bind(media.uploaded_at)
        .bind(media.is_deleted)
        .fetch_one(&*self.db)
        .await
        .map_err(conflict("media", media.id))
    }

    async fn find_media(&self, id: Uuid) -> RepositoryResult<Media> {
        sqlx::query_as::<_, Media>(&format!(
            "SELECT {MEDIA_COLUMNS} FROM media WHERE id = ? AND is_deleted = 0"
        ))
        .bind(id)
        .fetch_one(&*self.db)
        .await
        .map_err(not_found("media", id))
    }

    async fn list_for_user(&self, user_id: Uuid) -> RepositoryResult<Vec<Media>> {
        let rows = sqlx::query_as::<_, Media>(&format!(
            "SELECT {MEDIA_COLUMNS} FROM media
             WHERE user_id = ? AND is_deleted = 0
             ORDER BY uploaded_at DESC"
        ))
        .bind(user_id)
        .fetch_all(&*self.db)
        .await?;
        Ok(rows)
    }

    async fn live_for_key(
        &self,
        provider: ProviderKind,
        key: &str,
    ) -> RepositoryResult<Vec<Media>> {
        let rows = sqlx::query_as::<_, Media>(&format!(
            "SELECT {MEDIA_COLUMNS} FROM media
             WHERE provider = ? AND storage_key = ? AND is_deleted = 0
             ORDER BY uploaded_at ASC"
        ))
        .bind(provider)
        .bind(key)
        .fetch_all(&*self.db)
        .await?;
        Ok(rows)
    }

    async fn mark_deleted(&self, id: Uuid) -> RepositoryResult<bool> {
        let result = sqlx::query("UPDATE media SET is_deleted = 1 WHERE id = ? AND is_deleted = 0")
            .bind(id)
            .execute(&*self.db)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}
