use crate::{Result, payload::Payload};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Identifier assigned to a job by its backend.
pub type JobId = String;

/// Lifecycle flags of a reserved job. All start out false.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JobState {
    deleted: bool,
    released: bool,
    failed: bool,
}

impl JobState {
    pub fn mark_deleted(&mut self) {
        self.deleted = true;
    }

    pub fn mark_released(&mut self) {
        self.released = true;
    }

    pub fn mark_failed(&mut self) {
        self.failed = true;
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted
    }

    pub fn is_released(&self) -> bool {
        self.released
    }

    pub fn has_failed(&self) -> bool {
        self.failed
    }
}

/// A job reserved from a queue backend.
///
/// Backends implement the storage side of [`Job::delete`] and [`Job::release`];
/// everything else is derived from the payload and the [`JobState`] flags.
/// Running the job and invoking its failure hook go through the
/// [`crate::HandlerRegistry`], which resolves the payload's handler reference.
#[async_trait]
pub trait Job: Send + Sync {
    /// Backend identifier of this job
    fn job_id(&self) -> JobId;

    /// The payload exactly as it was read from storage
    fn raw_body(&self) -> &str;

    fn payload(&self) -> &Payload;

    /// Number of times this job has been reserved, including the current reservation
    fn attempts(&self) -> u32;

    /// Queue the job was reserved from
    fn queue(&self) -> &str;

    /// Name of the connection the job was reserved through
    fn connection_name(&self) -> &str;

    fn state(&self) -> &JobState;

    fn state_mut(&mut self) -> &mut JobState;

    /// Remove the job from storage. Calling this more than once is harmless.
    async fn delete(&mut self) -> Result<()>;

    /// Put the job back so it becomes claimable again after `delay`.
    async fn release(&mut self, delay: Duration) -> Result<()>;

    fn is_deleted(&self) -> bool {
        self.state().is_deleted()
    }

    fn is_released(&self) -> bool {
        self.state().is_released()
    }

    fn is_deleted_or_released(&self) -> bool {
        self.is_deleted() || self.is_released()
    }

    fn has_failed(&self) -> bool {
        self.state().has_failed()
    }

    fn mark_as_failed(&mut self) {
        self.state_mut().mark_failed();
    }

    fn max_tries(&self) -> Option<u32> {
        self.payload().max_tries
    }

    fn timeout(&self) -> Option<u64> {
        self.payload().timeout
    }

    fn timeout_at(&self) -> Option<i64> {
        self.payload().timeout_at
    }

    fn display_name(&self) -> &str {
        &self.payload().display_name
    }
}

/// Serializable view of a job, carried by lifecycle events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSnapshot {
    pub job_id: JobId,
    pub queue: String,
    pub display_name: String,
    pub attempts: u32,
    pub max_tries: Option<u32>,
    pub raw_body: String,
}

impl JobSnapshot {
    pub fn of(job: &dyn Job) -> Self {
        Self {
            job_id: job.job_id(),
            queue: job.queue().to_string(),
            display_name: job.display_name().to_string(),
            attempts: job.attempts(),
            max_tries: job.max_tries(),
            raw_body: job.raw_body().to_string(),
        }
    }
}

/// Current unix time in seconds.
pub(crate) fn unix_now() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Convert a delay into whole seconds for timestamp arithmetic.
pub(crate) fn delay_secs(delay: Duration) -> i64 {
    i64::try_from(delay.as_secs()).unwrap_or(i64::MAX)
}
