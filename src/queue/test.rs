//! In-memory queue for tests.
//!
//! [`TestQueue`] implements [`Queue`] with the same reservation rules as the
//! relational backend: a job is claimable when it is unreserved and available,
//! or when its reservation is older than `retry_after`. Time comes from a
//! [`MockClock`], so delays and expiring reservations can be exercised without
//! sleeping.
//!
//! # Examples
//!
//! ```rust
//! use queuework::queue::{Queue, test::{MockClock, TestQueue}};
//! use queuework::{job::Job, payload::Payload};
//! use serde_json::json;
//! use std::time::Duration;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let clock = MockClock::new();
//! let queue = TestQueue::with_clock(clock.clone());
//!
//! queue
//!     .later(Duration::from_secs(60), &Payload::new("reminder", json!({})), None)
//!     .await?;
//! assert!(queue.pop(None).await?.is_none());
//!
//! clock.advance(chrono::Duration::seconds(60));
//! let job = queue.pop(None).await?.unwrap();
//! assert_eq!(job.attempts(), 1);
//! # Ok(())
//! # }
//! ```

use crate::{
    QueueworkError, Result,
    job::{Job, JobId, JobState, delay_secs},
    payload::Payload,
    queue::Queue,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};
use tokio::sync::RwLock;

/// Mock clock for controlling time in tests.
///
/// ```rust
/// use queuework::queue::test::MockClock;
/// use chrono::Duration;
///
/// let clock = MockClock::new();
/// let start = clock.now();
///
/// clock.advance(Duration::hours(1));
/// assert_eq!((clock.now() - start).num_hours(), 1);
/// ```
#[derive(Clone, Debug)]
pub struct MockClock {
    current_time: Arc<Mutex<DateTime<Utc>>>,
}

impl MockClock {
    /// Create a new mock clock starting at the current time.
    pub fn new() -> Self {
        Self {
            current_time: Arc::new(Mutex::new(Utc::now())),
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        *self
            .current_time
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn advance(&self, duration: chrono::Duration) {
        let mut time = self
            .current_time
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        *time += duration;
    }

    pub fn set_time(&self, time: DateTime<Utc>) {
        *self
            .current_time
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = time;
    }

    fn timestamp(&self) -> i64 {
        self.now().timestamp()
    }
}

impl Default for MockClock {
    fn default() -> Self {
        Self::new()
    }
}

/// A stored job as the test queue sees it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestRecord {
    pub id: u64,
    pub queue: String,
    pub payload: String,
    pub attempts: u32,
    pub reserved_at: Option<i64>,
    pub available_at: i64,
    pub created_at: i64,
}

impl TestRecord {
    fn is_reserved(&self) -> bool {
        self.reserved_at.is_some()
    }

    fn claimable(&self, now: i64, retry_after: i64) -> bool {
        match self.reserved_at {
            None => self.available_at <= now,
            Some(reserved_at) => reserved_at <= now.saturating_sub(retry_after),
        }
    }
}

#[derive(Debug, Default)]
struct TestStorage {
    records: BTreeMap<u64, TestRecord>,
    next_id: u64,
}

impl TestStorage {
    fn insert(
        &mut self,
        queue: &str,
        payload: String,
        available_at: i64,
        attempts: u32,
        now: i64,
    ) -> u64 {
        self.next_id += 1;
        let id = self.next_id;
        self.records.insert(
            id,
            TestRecord {
                id,
                queue: queue.to_string(),
                payload,
                attempts,
                reserved_at: None,
                available_at,
                created_at: now,
            },
        );
        id
    }
}

/// In-memory [`Queue`] with relational reservation semantics.
#[derive(Clone)]
pub struct TestQueue {
    storage: Arc<RwLock<TestStorage>>,
    clock: MockClock,
    retry_after: u64,
    connection_name: String,
    default_queue: String,
}

impl TestQueue {
    pub fn new() -> Self {
        Self::with_clock(MockClock::new())
    }

    pub fn with_clock(clock: MockClock) -> Self {
        Self {
            storage: Arc::new(RwLock::new(TestStorage::default())),
            clock,
            retry_after: 90,
            connection_name: "test".to_string(),
            default_queue: "default".to_string(),
        }
    }

    /// Seconds after which an undeleted reservation becomes claimable again.
    pub fn with_retry_after(mut self, seconds: u64) -> Self {
        self.retry_after = seconds;
        self
    }

    pub fn with_connection_name(mut self, name: impl Into<String>) -> Self {
        self.connection_name = name.into();
        self
    }

    pub fn with_default_queue(mut self, queue: impl Into<String>) -> Self {
        self.default_queue = queue.into();
        self
    }

    pub fn clock(&self) -> &MockClock {
        &self.clock
    }

    /// Jobs on `queue` that are not reserved, whether available yet or not.
    pub async fn ready_count(&self, queue: Option<&str>) -> usize {
        let queue = self.queue_name(queue);
        let storage = self.storage.read().await;
        storage
            .records
            .values()
            .filter(|record| record.queue == queue && !record.is_reserved())
            .count()
    }

    pub async fn reserved_count(&self, queue: Option<&str>) -> usize {
        let queue = self.queue_name(queue);
        let storage = self.storage.read().await;
        storage
            .records
            .values()
            .filter(|record| record.queue == queue && record.is_reserved())
            .count()
    }

    pub async fn contains(&self, id: &str) -> bool {
        self.record(id).await.is_some()
    }

    pub async fn record(&self, id: &str) -> Option<TestRecord> {
        let id: u64 = id.parse().ok()?;
        self.storage.read().await.records.get(&id).cloned()
    }

    async fn insert(&self, queue: Option<&str>, payload: String, delay: i64, attempts: u32) -> u64 {
        let queue = self.queue_name(queue).to_string();
        let now = self.clock.timestamp();
        let mut storage = self.storage.write().await;
        storage.insert(&queue, payload, now.saturating_add(delay), attempts, now)
    }
}

impl Default for TestQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Queue for TestQueue {
    fn connection_name(&self) -> &str {
        &self.connection_name
    }

    fn default_queue(&self) -> &str {
        &self.default_queue
    }

    async fn size(&self, queue: Option<&str>) -> Result<u64> {
        let queue = self.queue_name(queue);
        let storage = self.storage.read().await;
        Ok(storage
            .records
            .values()
            .filter(|record| record.queue == queue)
            .count() as u64)
    }

    async fn push_raw(&self, payload: String, queue: Option<&str>) -> Result<JobId> {
        Ok(self.insert(queue, payload, 0, 0).await.to_string())
    }

    async fn later_raw(
        &self,
        delay: Duration,
        payload: String,
        queue: Option<&str>,
    ) -> Result<JobId> {
        Ok(self
            .insert(queue, payload, delay_secs(delay), 0)
            .await
            .to_string())
    }

    async fn pop(&self, queue: Option<&str>) -> Result<Option<Box<dyn Job>>> {
        let queue_name = self.queue_name(queue).to_string();
        let now = self.clock.timestamp();
        let retry_after = delay_secs(Duration::from_secs(self.retry_after));

        let mut storage = self.storage.write().await;
        let Some(record) = storage
            .records
            .values_mut()
            .find(|record| record.queue == queue_name && record.claimable(now, retry_after))
        else {
            return Ok(None);
        };

        record.reserved_at = Some(now);
        record.attempts += 1;
        let record = record.clone();
        drop(storage);

        let payload = Payload::decode(&record.payload).map_err(|e| {
            QueueworkError::InvalidJobPayload {
                message: format!("job {}: {}", record.id, e),
            }
        })?;

        Ok(Some(Box::new(TestJob {
            queue: self.clone(),
            record,
            payload,
            state: JobState::default(),
        })))
    }
}

/// A job reserved from a [`TestQueue`].
pub struct TestJob {
    queue: TestQueue,
    record: TestRecord,
    payload: Payload,
    state: JobState,
}

#[async_trait]
impl Job for TestJob {
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
        self.record.attempts
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
        self.queue.storage.write().await.records.remove(&self.record.id);
        Ok(())
    }

    async fn release(&mut self, delay: Duration) -> Result<()> {
        self.state.mark_released();
        let now = self.queue.clock.timestamp();
        let mut storage = self.queue.storage.write().await;
        storage.records.remove(&self.record.id);
        storage.insert(
            &self.record.queue,
            self.record.payload.clone(),
            now.saturating_add(delay_secs(delay)),
            self.record.attempts,
            now,
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn payload(name: &str) -> Payload {
        Payload::new(name, json!({"name": name}))
    }

    #[tokio::test]
    async fn test_pop_returns_lowest_id_first() {
        let queue = TestQueue::new();
        let first = queue.push(&payload("first"), None).await.unwrap();
        let second = queue.push(&payload("second"), None).await.unwrap();

        let job = queue.pop(None).await.unwrap().unwrap();
        assert_eq!(job.job_id(), first);
        assert_eq!(job.payload().job, "first");

        let job = queue.pop(None).await.unwrap().unwrap();
        assert_eq!(job.job_id(), second);

        assert!(queue.pop(None).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_reserved_job_reappears_after_retry_after() {
        let clock = MockClock::new();
        let queue = TestQueue::with_clock(clock.clone()).with_retry_after(30);
        let id = queue.push(&payload("slow"), None).await.unwrap();

        let job = queue.pop(None).await.unwrap().unwrap();
        assert_eq!(job.attempts(), 1);
        assert!(queue.pop(None).await.unwrap().is_none());

        clock.advance(chrono::Duration::seconds(29));
        assert!(queue.pop(None).await.unwrap().is_none());

        clock.advance(chrono::Duration::seconds(1));
        let again = queue.pop(None).await.unwrap().unwrap();
        assert_eq!(again.job_id(), id);
        assert_eq!(again.attempts(), 2);
    }

    #[tokio::test]
    async fn test_release_makes_job_available_after_delay() {
        let clock = MockClock::new();
        let queue = TestQueue::with_clock(clock.clone());
        queue.push(&payload("retry"), None).await.unwrap();

        let mut job = queue.pop(None).await.unwrap().unwrap();
        job.release(Duration::from_secs(10)).await.unwrap();
        assert!(job.is_released());
        assert_eq!(queue.reserved_count(None).await, 0);
        assert_eq!(queue.ready_count(None).await, 1);

        clock.advance(chrono::Duration::seconds(9));
        assert!(queue.pop(None).await.unwrap().is_none());

        clock.advance(chrono::Duration::seconds(1));
        let job = queue.pop(None).await.unwrap().unwrap();
        assert_eq!(job.attempts(), 2);
    }

    #[tokio::test]
    async fn test_delete_removes_record() {
        let queue = TestQueue::new();
        let id = queue.push(&payload("done"), Some("emails")).await.unwrap();

        let mut job = queue.pop(Some("emails")).await.unwrap().unwrap();
        assert_eq!(job.queue(), "emails");
        assert!(queue.contains(&id).await);

        job.delete().await.unwrap();
        job.delete().await.unwrap();
        assert!(!queue.contains(&id).await);
        assert_eq!(queue.size(Some("emails")).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_queues_are_isolated() {
        let queue = TestQueue::new();
        queue.push(&payload("a"), Some("high")).await.unwrap();

        assert!(queue.pop(Some("low")).await.unwrap().is_none());
        assert_eq!(queue.size(Some("high")).await.unwrap(), 1);
        assert_eq!(queue.size(None).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_corrupt_payload_is_rejected() {
        let queue = TestQueue::new();
        queue.push_raw("not json".to_string(), None).await.unwrap();

        let err = queue.pop(None).await.err().unwrap();
        assert!(matches!(err, QueueworkError::InvalidJobPayload { .. }));
    }
}
