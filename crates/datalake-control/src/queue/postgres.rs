//! PostgreSQL job queue.

use std::time::Duration;

use async_trait::async_trait;
use sqlx::postgres::PgPool;
use sqlx::Row;

use crate::error::{ControlError, ControlResult};

use super::{Delivery, JobQueue, MessageId};

/// PostgreSQL queue using `SELECT ... FOR UPDATE SKIP LOCKED`.
///
/// Several named queues may share one table.
#[derive(Clone)]
pub struct PostgresQueue {
    pool: PgPool,
    table: String,
    queue: String,
}

impl PostgresQueue {
    /// Create a queue on an existing pool.
    ///
    /// The table will be created if it doesn't exist.
    pub async fn new(
        pool: PgPool,
        table: impl Into<String>,
        queue: impl Into<String>,
    ) -> ControlResult<Self> {
        let table = table.into();
        if table.is_empty()
            || !table
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.')
        {
            return Err(ControlError::configuration(format!(
                "invalid queue table name {table:?}"
            )));
        }

        let queue = Self {
            pool,
            table,
            queue: queue.into(),
        };
        queue.ensure_table().await?;

        Ok(queue)
    }

    /// Create the queue table if it doesn't exist.
    async fn ensure_table(&self) -> ControlResult<()> {
        let create_table = format!(
            r#"
            CREATE TABLE IF NOT EXISTS {} (
                id BIGSERIAL PRIMARY KEY,
                queue_name TEXT NOT NULL,
                payload BYTEA NOT NULL,
                attempt INT NOT NULL DEFAULT 0,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                visible_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
            self.table
        );

        sqlx::query(&create_table).execute(&self.pool).await?;

        // Create index for efficient queue polling
        let create_index = format!(
            r#"
            CREATE INDEX IF NOT EXISTS idx_{}_receive
            ON {} (queue_name, visible_at)
            "#,
            self.table.replace('.', "_"),
            self.table
        );

        sqlx::query(&create_index).execute(&self.pool).await?;

        Ok(())
    }

    fn parse_id(message_id: &MessageId) -> ControlResult<i64> {
        message_id
            .as_str()
            .parse()
            .map_err(|_| ControlError::queue(format!("message {message_id} not found")))
    }
}

#[async_trait]
impl JobQueue for PostgresQueue {
    async fn publish(&self, payload: &[u8]) -> ControlResult<MessageId> {
        let query = format!(
            r#"
            INSERT INTO {} (queue_name, payload)
            VALUES ($1, $2)
            RETURNING id
            "#,
            self.table
        );

        let row = sqlx::query(&query)
            .bind(&self.queue)
            .bind(payload)
            .fetch_one(&self.pool)
            .await?;

        let id: i64 = row.get("id");
        Ok(MessageId::new(id.to_string()))
    }

    async fn receive(&self, visibility_timeout: Duration) -> ControlResult<Option<Delivery>> {
        // Claim the oldest visible message atomically
        let query = format!(
            r#"
            UPDATE {}
            SET
                visible_at = NOW() + make_interval(secs => $2),
                attempt = attempt + 1
            WHERE id = (
                SELECT id FROM {}
                WHERE queue_name = $1 AND visible_at <= NOW()
                ORDER BY id
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING id, payload, attempt, created_at
            "#,
            self.table, self.table
        );

        let result = sqlx::query(&query)
            .bind(&self.queue)
            .bind(visibility_timeout.as_secs_f64())
            .fetch_optional(&self.pool)
            .await?;

        match result {
            Some(row) => {
                let id: i64 = row.get("id");
                let payload: Vec<u8> = row.get("payload");
                let attempt: i32 = row.get("attempt");
                let created_at: chrono::DateTime<chrono::Utc> = row.get("created_at");

                Ok(Some(Delivery {
                    id: MessageId::new(id.to_string()),
                    payload,
                    attempt: u32::try_from(attempt).unwrap_or(0),
                    enqueued_at: created_at,
                }))
            }
            None => Ok(None),
        }
    }

    async fn ack(&self, message_id: &MessageId) -> ControlResult<()> {
        let id = Self::parse_id(message_id)?;

        let query = format!(
            r#"
            DELETE FROM {}
            WHERE id = $1 AND queue_name = $2
            "#,
            self.table
        );

        let result = sqlx::query(&query)
            .bind(id)
            .bind(&self.queue)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(ControlError::queue(format!("message {message_id} not found")));
        }

        Ok(())
    }

    async fn nack(&self, message_id: &MessageId) -> ControlResult<()> {
        let id = Self::parse_id(message_id)?;

        // Make message immediately visible again
        let query = format!(
            r#"
            UPDATE {}
            SET visible_at = NOW()
            WHERE id = $1 AND queue_name = $2
            "#,
            self.table
        );

        let result = sqlx::query(&query)
            .bind(id)
            .bind(&self.queue)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(ControlError::queue(format!("message {message_id} not found")));
        }

        Ok(())
    }
}

impl std::fmt::Debug for PostgresQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresQueue")
            .field("table", &self.table)
            .field("queue", &self.queue)
            .finish_non_exhaustive()
    }
}
