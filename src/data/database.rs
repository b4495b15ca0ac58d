//! SQLite database operations
//!
//! Follower persistence behind the `FollowerStore` contract.

use async_trait::async_trait;
use sqlx::{Pool, Sqlite, SqlitePool};
use std::path::Path;

use super::models::FollowerRecord;
use super::store::FollowerStore;
use crate::error::AppError;

/// Database connection pool wrapper.
pub struct Database {
    pool: Pool<Sqlite>,
}

impl Database {
    /// Open (creating if needed) the database file and run migrations
    pub async fn connect(path: &Path) -> Result<Self, AppError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| AppError::Database(sqlx::Error::Io(e)))?;
            }
        }

        let connection_string = format!("sqlite:{}?mode=rwc", path.display());
        let pool = SqlitePool::connect(&connection_string).await?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| {
                tracing::error!("Migration failed: {}", e);
                AppError::Internal(anyhow::anyhow!("Migration failed: {}", e))
            })?;

        tracing::info!(path = %path.display(), "Database connected and migrated successfully");

        Ok(Self { pool })
    }

    /// Count followers.
    pub async fn count_followers(&self) -> Result<i64, AppError> {
        let count = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM followers")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }
}

#[async_trait]
impl FollowerStore for Database {
    async fn put(&self, record: &FollowerRecord) -> Result<(), AppError> {
        sqlx::query(
            "INSERT OR REPLACE INTO followers (id, actor_id, inbox, username, created_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&record.id)
        .bind(&record.actor_id)
        .bind(&record.inbox)
        .bind(&record.username)
        .bind(chrono::Utc::now())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn delete(&self, id: &str, actor_id: &str) -> Result<bool, AppError> {
        let result = sqlx::query("DELETE FROM followers WHERE id = ? AND actor_id = ?")
            .bind(id)
            .bind(actor_id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn list(&self) -> Result<Vec<FollowerRecord>, AppError> {
        let records = sqlx::query_as::<_, FollowerRecord>(
            "SELECT id, actor_id, inbox, username FROM followers ORDER BY created_at ASC",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }
}
