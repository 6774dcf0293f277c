//! Queue backends and the contract they share.
//!
//! Every backend implements [`Queue`]: push a payload, pop a reserved job, and
//! report the size of a queue. Backends differ only in storage; reservation,
//! deletion and release semantics are the same everywhere, so the worker never
//! needs to know which one it is talking to.
//!
//! - [`DatabaseQueue`] stores jobs in a relational `jobs` table (PostgreSQL or MySQL)
//! - [`RedisQueue`](redis::RedisQueue) stores jobs in a list plus two sorted sets
//! - [`NullQueue`] discards everything
//! - [`TestQueue`](test::TestQueue) keeps jobs in memory behind a mock clock
//!
//! Connections are built from configuration by the [`QueueManager`].

use crate::{
    Result,
    job::{Job, JobId},
    payload::Payload,
};
use async_trait::async_trait;
use std::time::Duration;

pub mod database;
pub mod manager;
pub mod null;

#[cfg(feature = "postgres")]
pub mod postgres;

#[cfg(feature = "mysql")]
pub mod mysql;

#[cfg(feature = "redis")]
pub mod redis;

#[cfg(any(test, feature = "test"))]
pub mod test;

pub use database::{DatabaseJob, DatabaseOptions, DatabaseQueue, JobRecord, JobTable};
pub use manager::{
    ConnectionConfig, DatabaseConnectionConfig, QueueManager, RedisConnectionConfig,
};
pub use null::NullQueue;

#[async_trait]
pub trait Queue: Send + Sync {
    /// Name of the connection this queue was created for
    fn connection_name(&self) -> &str;

    /// Queue used when callers pass `None`
    fn default_queue(&self) -> &str;

    /// Resolve an optional queue name against the default.
    fn queue_name<'a>(&'a self, queue: Option<&'a str>) -> &'a str {
        queue.unwrap_or_else(|| self.default_queue())
    }

    /// Number of jobs held for `queue`, ready, delayed and reserved alike.
    async fn size(&self, queue: Option<&str>) -> Result<u64>;

    async fn push_raw(&self, payload: String, queue: Option<&str>) -> Result<JobId>;

    async fn later_raw(
        &self,
        delay: Duration,
        payload: String,
        queue: Option<&str>,
    ) -> Result<JobId>;

    /// Reserve the next available job. A returned job is invisible to every
    /// other caller until it is deleted, released, or its reservation expires.
    async fn pop(&self, queue: Option<&str>) -> Result<Option<Box<dyn Job>>>;

    /// Serialize a payload for storage.
    fn create_payload(&self, payload: &Payload) -> Result<String> {
        payload.encode()
    }

    async fn push(&self, payload: &Payload, queue: Option<&str>) -> Result<JobId> {
        let raw = self.create_payload(payload)?;
        self.push_raw(raw, queue).await
    }

    async fn later(&self, delay: Duration, payload: &Payload, queue: Option<&str>) -> Result<JobId> {
        let raw = self.create_payload(payload)?;
        self.later_raw(delay, raw, queue).await
    }

    /// Push several payloads onto the same queue, in order.
    async fn bulk(&self, payloads: &[Payload], queue: Option<&str>) -> Result<Vec<JobId>> {
        let mut ids = Vec::with_capacity(payloads.len());
        for payload in payloads {
            ids.push(self.push(payload, queue).await?);
        }
        Ok(ids)
    }
}
