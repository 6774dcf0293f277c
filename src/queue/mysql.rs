//! MySQL jobs table. Claims need MySQL 8.0 for `SKIP LOCKED`.

use crate::{
    QueueworkError, Result,
    job::{delay_secs, unix_now},
    queue::database::{DatabaseQueue, JobRecord, JobTable},
};
use async_trait::async_trait;
use sqlx::MySql;
use std::time::Duration;
use tracing::debug;

fn inserted_id(last_insert_id: u64) -> Result<i64> {
    i64::try_from(last_insert_id).map_err(|_| QueueworkError::Queue {
        message: format!("Inserted job id {} out of range", last_insert_id),
    })
}

#[async_trait]
impl JobTable for DatabaseQueue<MySql> {
    async fn insert_record(
        &self,
        queue: &str,
        payload: &str,
        available_at: i64,
        attempts: u32,
    ) -> Result<i64> {
        let result = sqlx::query(&format!(
            r#"
            INSERT INTO {} (queue, payload, attempts, reserved_at, available_at, created_at)
            VALUES (?, ?, ?, NULL, ?, ?)
            "#,
            self.table()
        ))
        .bind(queue)
        .bind(payload)
        .bind(i16::try_from(attempts).unwrap_or(i16::MAX))
        .bind(available_at)
        .bind(unix_now())
        .execute(&self.pool)
        .await?;

        inserted_id(result.last_insert_id())
    }

    async fn reserve_next(&self, queue: &str) -> Result<Option<JobRecord>> {
        let now = unix_now();
        let mut tx = self.pool.begin().await?;

        let record = sqlx::query_as::<_, JobRecord>(&format!(
            r#"
            SELECT id, queue, payload, attempts, reserved_at, available_at, created_at
            FROM {}
            WHERE queue = ?
              AND ((reserved_at IS NULL AND available_at <= ?) OR reserved_at <= ?)
            ORDER BY id ASC
            LIMIT 1
            FOR UPDATE SKIP LOCKED
            "#,
            self.table()
        ))
        .bind(queue)
        .bind(now)
        .bind(self.expiration_cutoff(now))
        .fetch_optional(&mut *tx)
        .await?;

        let Some(mut record) = record else {
            tx.rollback().await?;
            return Ok(None);
        };

        sqlx::query(&format!(
            "UPDATE {} SET reserved_at = ?, attempts = attempts + 1 WHERE id = ?",
            self.table()
        ))
        .bind(now)
        .bind(record.id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        record.reserved_at = Some(now);
        record.attempts = record.attempts.saturating_add(1);
        Ok(Some(record))
    }

    async fn delete_record(&self, id: i64) -> Result<()> {
        sqlx::query(&format!("DELETE FROM {} WHERE id = ?", self.table()))
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn release_record(&self, record: &JobRecord, delay: Duration) -> Result<i64> {
        let now = unix_now();
        let mut tx = self.pool.begin().await?;

        sqlx::query(&format!("DELETE FROM {} WHERE id = ?", self.table()))
            .bind(record.id)
            .execute(&mut *tx)
            .await?;

        let result = sqlx::query(&format!(
            r#"
            INSERT INTO {} (queue, payload, attempts, reserved_at, available_at, created_at)
            VALUES (?, ?, ?, NULL, ?, ?)
            "#,
            self.table()
        ))
        .bind(&record.queue)
        .bind(&record.payload)
        .bind(record.attempts)
        .bind(now.saturating_add(delay_secs(delay)))
        .bind(now)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        let id = inserted_id(result.last_insert_id())?;
        debug!("Released job {} as {} on {}", record.id, id, record.queue);
        Ok(id)
    }

    async fn count(&self, queue: &str) -> Result<u64> {
        let count = sqlx::query_scalar::<_, i64>(&format!(
            "SELECT COUNT(*) FROM {} WHERE queue = ?",
            self.table()
        ))
        .bind(queue)
        .fetch_one(&self.pool)
        .await?;

        Ok(u64::try_from(count).unwrap_or(0))
    }

    async fn create_table(&self) -> Result<()> {
        let table = self.table();
        let index = table.replace('.', "_");

        sqlx::query(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS {table} (
                id BIGINT NOT NULL AUTO_INCREMENT PRIMARY KEY,
                queue VARCHAR(255) NOT NULL,
                payload LONGTEXT NOT NULL,
                attempts SMALLINT NOT NULL DEFAULT 0,
                reserved_at BIGINT NULL,
                available_at BIGINT NOT NULL,
                created_at BIGINT NOT NULL,
                INDEX {index}_queue_index (queue)
            )
            "#
        ))
        .execute(&self.pool)
        .await?;

        debug!("Ensured jobs table {} exists", table);
        Ok(())
    }
}
