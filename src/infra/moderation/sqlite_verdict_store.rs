// SQLite-backed verdict store, so probation survives restarts.
//
// Tables:
// - verdicts: key -> JSON value, with an optional expiry in epoch millis

use crate::core::moderation::{StoreError, VerdictStore};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Pool, Row, Sqlite};
use std::path::Path;
use std::time::Duration;

pub struct SqliteVerdictStore {
    pool: Pool<Sqlite>,
}

fn storage_error(e: sqlx::Error) -> StoreError {
    StoreError::StorageError(e.to_string())
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

fn expires_at(ttl: Option<Duration>) -> Option<i64> {
    ttl.map(|ttl| now_ms().saturating_add(ttl.as_millis() as i64))
}

impl SqliteVerdictStore {
    /// Open (creating if needed) the database file at `path`.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StoreError::StorageError(e.to_string()))?;
        }

        let pool = SqlitePoolOptions::new()
            .connect(&format!("sqlite://{}?mode=rwc", path.display()))
            .await
            .map_err(storage_error)?;

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS verdicts (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                expires_at INTEGER
            );
            CREATE INDEX IF NOT EXISTS idx_verdicts_expires_at
                ON verdicts(expires_at);
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(storage_error)?;

        Ok(())
    }
}

#[async_trait]
impl VerdictStore for SqliteVerdictStore {
    async fn get(&self, key: &str) -> Result<Option<Value>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT value FROM verdicts
            WHERE key = ? AND (expires_at IS NULL OR expires_at > ?)
            "#,
        )
        .bind(key)
        .bind(now_ms())
        .fetch_optional(&self.pool)
        .await
        .map_err(storage_error)?;

        match row {
            None => Ok(None),
            Some(row) => {
                let raw: String = row.get("value");
                serde_json::from_str(&raw)
                    .map(Some)
                    .map_err(|_| StoreError::CorruptValue {
                        key: key.to_string(),
                        value: raw,
                    })
            }
        }
    }

    async fn set(&self, key: &str, value: Value, ttl: Option<Duration>) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO verdicts (key, value, expires_at)
            VALUES (?, ?, ?)
            ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                expires_at = excluded.expires_at
            "#,
        )
        .bind(key)
        .bind(value.to_string())
        .bind(expires_at(ttl))
        .execute(&self.pool)
        .await
        .map_err(storage_error)?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM verdicts WHERE key = ?")
            .bind(key)
            .execute(&self.pool)
            .await
            .map_err(storage_error)?;
        Ok(())
    }

    async fn increment(&self, key: &str, ttl: Option<Duration>) -> Result<i64, StoreError> {
        // A single statement, so concurrent increments never lose a count.
        let row = sqlx::query(
            r#"
            INSERT INTO verdicts (key, value, expires_at)
            VALUES (?1, '1', ?2)
            ON CONFLICT(key) DO UPDATE SET
                value = CASE
                    WHEN verdicts.expires_at IS NOT NULL AND verdicts.expires_at <= ?3 THEN '1'
                    ELSE CAST(CAST(verdicts.value AS INTEGER) + 1 AS TEXT)
                END,
                expires_at = CASE
                    WHEN verdicts.expires_at IS NOT NULL AND verdicts.expires_at <= ?3
                        THEN excluded.expires_at
                    ELSE verdicts.expires_at
                END
            RETURNING value
            "#,
        )
        .bind(key)
        .bind(expires_at(ttl))
        .bind(now_ms())
        .fetch_one(&self.pool)
        .await
        .map_err(storage_error)?;

        let raw: String = row.get("value");
        raw.parse::<i64>().map_err(|_| StoreError::CorruptValue {
            key: key.to_string(),
            value: raw,
        })
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: Value,
        ttl: Option<Duration>,
    ) -> Result<bool, StoreError> {
        // Only an expired row may be overwritten.
        let result = sqlx::query(
            r#"
            INSERT INTO verdicts (key, value, expires_at)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                expires_at = excluded.expires_at
            WHERE verdicts.expires_at IS NOT NULL AND verdicts.expires_at <= ?4
            "#,
        )
        .bind(key)
        .bind(value.to_string())
        .bind(expires_at(ttl))
        .bind(now_ms())
        .execute(&self.pool)
        .await
        .map_err(storage_error)?;

        Ok(result.rows_affected() == 1)
    }

    async fn purge_expired(&self) -> Result<u64, StoreError> {
        let result =
            sqlx::query("DELETE FROM verdicts WHERE expires_at IS NOT NULL AND expires_at <= ?")
                .bind(now_ms())
                .execute(&self.pool)
                .await
                .map_err(storage_error)?;
        Ok(result.rows_affected())
    }
}
