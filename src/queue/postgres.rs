//! PostgreSQL jobs table.

use crate::{
    Result,
    job::{delay_secs, unix_now},
    queue::database::{DatabaseQueue, JobRecord, JobTable},
};
use async_trait::async_trait;
use sqlx::Postgres;
use std::time::Duration;
use tracing::debug;

#[async_trait]
impl JobTable for DatabaseQueue<Postgres> {
    async fn insert_record(
        &self,
        queue: &str,
        payload: &str,
        available_at: i64,
        attempts: u32,
    ) -> Result<i64> {
        let id = sqlx::query_scalar::<_, i64>(&format!(
            r#"
            INSERT INTO {} (queue, payload, attempts, reserved_at, available_at, created_at)
            VALUES ($1, $2, $3, NULL, $4, $5)
            RETURNING id
            "#,
            self.table()
        ))
        .bind(queue)
        .bind(payload)
        .bind(i16::try_from(attempts).unwrap_or(i16::MAX))
        .bind(available_at)
        .bind(unix_now())
        .fetch_one(&self.pool)
        .await?;

        Ok(id)
    }

    async fn reserve_next(&self, queue: &str) -> Result<Option<JobRecord>> {
        let now = unix_now();

        // SKIP LOCKED lets concurrent workers claim different rows without blocking
        let record = sqlx::query_as::<_, JobRecord>(&format!(
            r#"
            UPDATE {table}
            SET reserved_at = $1, attempts = attempts + 1
            WHERE id = (
                SELECT id FROM {table}
                WHERE queue = $2
                  AND ((reserved_at IS NULL AND available_at <= $1) OR reserved_at <= $3)
                ORDER BY id ASC
                FOR UPDATE SKIP LOCKED
                LIMIT 1
            )
            RETURNING id, queue, payload, attempts, reserved_at, available_at, created_at
            "#,
            table = self.table()
        ))
        .bind(now)
        .bind(queue)
        .bind(self.expiration_cutoff(now))
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    async fn delete_record(&self, id: i64) -> Result<()> {
        sqlx::query(&format!("DELETE FROM {} WHERE id = $1", self.table()))
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn release_record(&self, record: &JobRecord, delay: Duration) -> Result<i64> {
        let now = unix_now();
        let mut tx = self.pool.begin().await?;

        sqlx::query(&format!("DELETE FROM {} WHERE id = $1", self.table()))
            .bind(record.id)
            .execute(&mut *tx)
            .await?;

        let id = sqlx::query_scalar::<_, i64>(&format!(
            r#"
            INSERT INTO {} (queue, payload, attempts, reserved_at, available_at, created_at)
            VALUES ($1, $2, $3, NULL, $4, $5)
            RETURNING id
            "#,
            self.table()
        ))
        .bind(&record.queue)
        .bind(&record.payload)
        .bind(record.attempts)
        .bind(now.saturating_add(delay_secs(delay)))
        .bind(now)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;

        debug!("Released job {} as {} on {}", record.id, id, record.queue);
        Ok(id)
    }

    async fn count(&self, queue: &str) -> Result<u64> {
        let count = sqlx::query_scalar::<_, i64>(&format!(
            "SELECT COUNT(*) FROM {} WHERE queue = $1",
            self.table()
        ))
        .bind(queue)
        .fetch_one(&self.pool)
        .await?;

        Ok(u64::try_from(count).unwrap_or(0))
    }

    async fn create_table(&self) -> Result<()> {
        let table = self.table();

        sqlx::query(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS {table} (
                id BIGSERIAL PRIMARY KEY,
                queue VARCHAR(255) NOT NULL,
                payload TEXT NOT NULL,
                attempts SMALLINT NOT NULL DEFAULT 0,
                reserved_at BIGINT NULL,
                available_at BIGINT NOT NULL,
                created_at BIGINT NOT NULL
            )
            "#
        ))
        .execute(&self.pool)
        .await?;

        let index = table.replace('.', "_");
        sqlx::query(&format!(
            "CREATE INDEX IF NOT EXISTS {index}_queue_index ON {table} (queue)"
        ))
        .execute(&self.pool)
        .await?;

        debug!("Ensured jobs table {} exists", table);
        Ok(())
    }
}
