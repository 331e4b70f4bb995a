use async_trait::async_trait;
use sqlx::Row;
use sqlx::sqlite::SqlitePool;

use super::HistoryStore;
use crate::error::HistoryError;

/// History persisted in the `chat_history` table.
#[derive(Clone)]
pub struct SqliteHistoryStore {
    pool: SqlitePool,
}

impl SqliteHistoryStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl HistoryStore for SqliteHistoryStore {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    async fn load(&self, limit: usize) -> Result<Vec<String>, HistoryError> {
        let rows = sqlx::query(
            r#"
            SELECT content
            FROM chat_history
            ORDER BY id DESC
            LIMIT ?
            "#,
        )
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;

        let mut messages: Vec<String> = rows.into_iter().map(|r| r.get("content")).collect();

        // Reverse so oldest is first (natural reading order)
        messages.reverse();

        Ok(messages)
    }

    async fn append(&self, message: &str) -> Result<(), HistoryError> {
        sqlx::query("INSERT INTO chat_history (content, created_at) VALUES (?, ?)")
            .bind(message)
            .bind(chrono::Utc::now().timestamp())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn clear(&self) -> Result<(), HistoryError> {
        sqlx::query("DELETE FROM chat_history")
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn ping(&self) -> Result<(), HistoryError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}
