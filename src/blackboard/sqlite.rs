use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{migrate::MigrateDatabase, Row, SqlitePool};
use tracing::info;

use super::{ensure_value, Blackboard, BlackboardError, BoardEntry, Entry, Signal};

/// Blackboard stored in a SQLite table, for deployments where several hosts
/// share one database file or where the store should live next to other
/// scheduler state.
pub struct SqliteBlackboard {
    pool: SqlitePool,
}

impl SqliteBlackboard {
    /// Open (creating if needed) the database and run migrations.
    pub async fn connect(database_url: &str) -> Result<Self, BlackboardError> {
        if !sqlx::Sqlite::database_exists(database_url).await? {
            info!("Creating blackboard database at {}", database_url);
            sqlx::Sqlite::create_database(database_url).await?;
        }

        let pool = SqlitePool::connect(database_url).await?;
        sqlx::migrate!("./migrations").run(&pool).await?;

        Ok(Self { pool })
    }

    pub async fn shutdown(&self) {
        info!("Closing blackboard database connections");
        self.pool.close().await;
    }
}

#[async_trait]
impl Blackboard for SqliteBlackboard {
    async fn get(&self, signal: Signal) -> Result<Entry, BlackboardError> {
        let row = sqlx::query("SELECT value FROM blackboard WHERE key = ?1")
            .bind(signal.as_key())
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(|row| row.get::<String, _>("value")).into())
    }

    async fn set(&self, signal: Signal, value: &str) -> Result<(), BlackboardError> {
        ensure_value(signal, value)?;
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO blackboard (key, value, updated_at)
            VALUES (?1, ?2, ?3)
            "#,
        )
        .bind(signal.as_key())
        .bind(value)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn delete(&self, signal: Signal) -> Result<(), BlackboardError> {
        sqlx::query("DELETE FROM blackboard WHERE key = ?1")
            .bind(signal.as_key())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn snapshot(&self) -> Result<Vec<BoardEntry>, BlackboardError> {
        let rows = sqlx::query("SELECT key, value, updated_at FROM blackboard")
            .fetch_all(&self.pool)
            .await?;

        let mut entries = Vec::with_capacity(rows.len());
        for row in rows {
            let key: String = row.get("key");
            let updated_at: String = row.get("updated_at");
            let updated_at = DateTime::parse_from_rfc3339(&updated_at)
                .map(|t| t.with_timezone(&Utc))
                .map_err(|e| BlackboardError::Corrupt {
                    path: "blackboard".to_string(),
                    reason: format!("bad timestamp for '{key}': {e}"),
                })?;
            entries.push(BoardEntry {
                signal: key.parse()?,
                value: row.get("value"),
                updated_at,
            });
        }
        entries.sort_by_key(|entry| entry.signal);
        Ok(entries)
    }
}
