//! Relational job storage.
//!
//! Jobs live in one table (`jobs` by default) with one row per job:
//!
//! | column       | type            | meaning                                   |
//! |--------------|-----------------|-------------------------------------------|
//! | id           | BIGINT, auto    | ordering key, claims go lowest id first   |
//! | queue        | VARCHAR(255)    | queue name, indexed                       |
//! | payload      | TEXT            | the serialized [`Payload`]                |
//! | attempts     | SMALLINT        | reservations so far                       |
//! | reserved_at  | BIGINT NULL     | unix seconds of the current reservation   |
//! | available_at | BIGINT          | unix seconds the job becomes claimable    |
//! | created_at   | BIGINT          | unix seconds the row was written          |
//!
//! A row is claimable when it is unreserved and available, or when its
//! reservation is at least `retry_after` seconds old. The SQL for each database
//! lives in its own module behind a [`JobTable`] implementation; everything
//! else is shared here.

use crate::{
    QueueworkError, Result,
    job::{Job, JobId, JobState, delay_secs, unix_now},
    payload::Payload,
    queue::Queue,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlx::{Database, FromRow, Pool};
use std::time::Duration;

/// Options for a [`DatabaseQueue`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseOptions {
    /// Table holding the jobs
    pub table: String,
    /// Queue used when callers pass `None`
    pub queue: String,
    /// Seconds before an undeleted reservation becomes claimable again
    pub retry_after: u64,
}

impl Default for DatabaseOptions {
    fn default() -> Self {
        Self {
            table: "jobs".to_string(),
            queue: "default".to_string(),
            retry_after: 90,
        }
    }
}

impl DatabaseOptions {
    pub fn with_table(mut self, table: impl Into<String>) -> Self {
        self.table = table.into();
        self
    }

    pub fn with_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = queue.into();
        self
    }

    pub fn with_retry_after(mut self, seconds: u64) -> Self {
        self.retry_after = seconds;
        self
    }

    /// The table name is interpolated into SQL, so only identifier characters
    /// (and a schema dot) are accepted.
    pub fn validate(&self) -> Result<()> {
        let valid = !self.table.is_empty()
            && self
                .table
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.');
        if !valid {
            return Err(QueueworkError::Config(format!(
                "Invalid jobs table name: {:?}",
                self.table
            )));
        }
        Ok(())
    }
}

/// One row of the jobs table.
#[derive(Debug, Clone, PartialEq, Eq, FromRow)]
pub struct JobRecord {
    pub id: i64,
    pub queue: String,
    pub payload: String,
    pub attempts: i16,
    pub reserved_at: Option<i64>,
    pub available_at: i64,
    pub created_at: i64,
}

impl JobRecord {
    pub fn attempts(&self) -> u32 {
        u32::try_from(self.attempts).unwrap_or(0)
    }
}

/// Database-specific SQL behind a [`DatabaseQueue`].
#[async_trait]
pub trait JobTable: Send + Sync {
    /// Insert a row and return its id.
    async fn insert_record(
        &self,
        queue: &str,
        payload: &str,
        available_at: i64,
        attempts: u32,
    ) -> Result<i64>;

    /// Atomically claim the lowest-id claimable row of `queue`, marking it
    /// reserved and bumping its attempts.
    async fn reserve_next(&self, queue: &str) -> Result<Option<JobRecord>>;

    async fn delete_record(&self, id: i64) -> Result<()>;

    /// Replace a reserved row with a fresh one available after `delay`,
    /// keeping its attempt count. Returns the new id.
    async fn release_record(&self, record: &JobRecord, delay: Duration) -> Result<i64>;

    async fn count(&self, queue: &str) -> Result<u64>;

    /// Create the jobs table and its queue index if they do not exist.
    async fn create_table(&self) -> Result<()>;
}

/// A [`Queue`] stored in a relational table.
///
/// ```rust,no_run
/// use queuework::queue::{DatabaseOptions, DatabaseQueue, JobTable, Queue};
/// use queuework::payload::Payload;
/// use serde_json::json;
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// # #[cfg(feature = "postgres")]
/// # {
/// let pool = sqlx::PgPool::connect("postgresql://localhost/queuework").await?;
/// let queue = DatabaseQueue::with_options(pool, DatabaseOptions::default().with_retry_after(120))?;
/// queue.create_table().await?;
///
/// queue.push(&Payload::new("send_email", json!({"to": "user@example.com"})), None).await?;
/// # }
/// # Ok(())
/// # }
/// ```
pub struct DatabaseQueue<DB: Database> {
    pub pool: Pool<DB>,
    pub(crate) options: DatabaseOptions,
    pub(crate) connection_name: String,
}

impl<DB: Database> Clone for DatabaseQueue<DB> {
    fn clone(&self) -> Self {
        Self {
            pool: self.pool.clone(),
            options: self.options.clone(),
            connection_name: self.connection_name.clone(),
        }
    }
}

impl<DB: Database> DatabaseQueue<DB> {
    pub fn new(pool: Pool<DB>) -> Self {
        Self {
            pool,
            options: DatabaseOptions::default(),
            connection_name: "database".to_string(),
        }
    }

    pub fn with_options(pool: Pool<DB>, options: DatabaseOptions) -> Result<Self> {
        options.validate()?;
        Ok(Self {
            options,
            ..Self::new(pool)
        })
    }

    pub fn with_connection_name(mut self, name: impl Into<String>) -> Self {
        self.connection_name = name.into();
        self
    }

    pub fn options(&self) -> &DatabaseOptions {
        &self.options
    }

    pub(crate) fn table(&self) -> &str {
        &self.options.table
    }

    /// Oldest `reserved_at` that still counts as a live reservation.
    pub(crate) fn expiration_cutoff(&self, now: i64) -> i64 {
        let retry_after = i64::try_from(self.options.retry_after).unwrap_or(i64::MAX);
        now.saturating_sub(retry_after)
    }
}

#[async_trait]
impl<DB> Queue for DatabaseQueue<DB>
where
    DB: Database,
    Self: JobTable,
{
    fn connection_name(&self) -> &str {
        &self.connection_name
    }

    fn default_queue(&self) -> &str {
        &self.options.queue
    }

    async fn size(&self, queue: Option<&str>) -> Result<u64> {
        self.count(self.queue_name(queue)).await
    }

    async fn push_raw(&self, payload: String, queue: Option<&str>) -> Result<JobId> {
        let id = self
            .insert_record(self.queue_name(queue), &payload, unix_now(), 0)
            .await?;
        Ok(id.to_string())
    }

    async fn later_raw(
        &self,
        delay: Duration,
        payload: String,
        queue: Option<&str>,
    ) -> Result<JobId> {
        let available_at = unix_now().saturating_add(delay_secs(delay));
        let id = self
            .insert_record(self.queue_name(queue), &payload, available_at, 0)
            .await?;
        Ok(id.to_string())
    }

    async fn pop(&self, queue: Option<&str>) -> Result<Option<Box<dyn Job>>> {
        let Some(record) = self.reserve_next(self.queue_name(queue)).await? else {
            return Ok(None);
        };

        let payload = Payload::decode(&record.payload).map_err(|e| {
            QueueworkError::InvalidJobPayload {
                message: format!("job {} on {}: {}", record.id, record.queue, e),
            }
        })?;

        Ok(Some(Box::new(DatabaseJob {
            queue: self.clone(),
            record,
            payload,
            state: JobState::default(),
        })))
    }
}

/// A job reserved from a [`DatabaseQueue`].
pub struct DatabaseJob<DB: Database> {
    queue: DatabaseQueue<DB>,
    record: JobRecord,
    payload: Payload,
    state: JobState,
}

impl<DB: Database> DatabaseJob<DB> {
    pub fn record(&self) -> &JobRecord {
        &self.record
    }
}

#[async_trait]
impl<DB> Job for DatabaseJob<DB>
where
    DB: Database,
    DatabaseQueue<DB>: JobTable,
{
    fn job_id(&self) -> JobId {
        self.record.id.to_string()
    }

    fn raw_body(&self) -> &str {
        &self.record.payload
    }

    fn payload(&self) -> &Payload {
        &self.payload
    }

    fn attempts(&self) -> u32 {
        self.record.attempts()
    }

    fn queue(&self) -> &str {
        &self.record.queue
    }

    fn connection_name(&self) -> &str {
        &self.queue.connection_name
    }

    fn state(&self) -> &JobState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut JobState {
        &mut self.state
    }

    async fn delete(&mut self) -> Result<()> {
        self.state.mark_deleted();
        self.queue.delete_record(self.record.id).await
    }

    async fn release(&mut self, delay: Duration) -> Result<()> {
        self.state.mark_released();
        self.queue.release_record(&self.record, delay).await?;
        Ok(())
    }
}
