//! Handler resolution for reserved jobs.
//!
//! Every payload names its handler in the `job` field. Hosts register one
//! [`JobHandler`] per reference up front; the worker looks the reference up for
//! every job it runs. There is no dynamic loading: an unregistered reference is
//! an [`QueueworkError::UnknownHandler`] error and goes through the normal
//! retry/failure policy.

use crate::{QueueworkError, Result, failing::FailingJob, job::Job};
use async_trait::async_trait;
use serde_json::Value;
use std::{collections::HashMap, future::Future, sync::Arc, time::Duration};
use tokio_util::sync::CancellationToken;

#[async_trait]
pub trait JobHandler: Send + Sync {
    /// Run the job. The handler may delete, release or fail the job through `ctx`.
    async fn handle(&self, ctx: &mut JobContext<'_>, data: Value) -> Result<()>;

    /// Called once when the job is failed permanently.
    async fn failed(&self, _data: Value, _error: &QueueworkError) -> Result<()> {
        Ok(())
    }
}

/// What a handler sees of the job it is running.
pub struct JobContext<'a> {
    job: &'a mut dyn Job,
    failer: &'a FailingJob,
    cancel: CancellationToken,
}

impl<'a> JobContext<'a> {
    pub fn new(job: &'a mut dyn Job, failer: &'a FailingJob, cancel: CancellationToken) -> Self {
        Self { job, failer, cancel }
    }

    pub fn job(&self) -> &dyn Job {
        &*self.job
    }

    pub fn job_mut(&mut self) -> &mut dyn Job {
        &mut *self.job
    }

    pub fn attempts(&self) -> u32 {
        self.job.attempts()
    }

    pub async fn delete(&mut self) -> Result<()> {
        self.job.delete().await
    }

    pub async fn release(&mut self, delay: Duration) -> Result<()> {
        self.job.release(delay).await
    }

    /// Fail the job permanently. The failure hook and `JobFailed` event run once.
    pub async fn fail(&mut self, error: QueueworkError) -> Result<()> {
        let connection = self.job.connection_name().to_string();
        self.failer.handle(&connection, &mut *self.job, &error).await
    }

    /// Cancelled when the job's deadline elapses. Long-running handlers should
    /// watch it and return early.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// Adapter turning an async closure over the job data into a [`JobHandler`].
pub struct FnHandler<F> {
    func: F,
}

pub fn handler_fn<F, Fut>(func: F) -> FnHandler<F>
where
    F: Fn(Value) -> Fut + Send + Sync,
    Fut: Future<Output = Result<()>> + Send,
{
    FnHandler { func }
}

#[async_trait]
impl<F, Fut> JobHandler for FnHandler<F>
where
    F: Fn(Value) -> Fut + Send + Sync,
    Fut: Future<Output = Result<()>> + Send,
{
    async fn handle(&self, _ctx: &mut JobContext<'_>, data: Value) -> Result<()> {
        (self.func)(data).await
    }
}

#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn JobHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, reference: impl Into<String>, handler: impl JobHandler + 'static) -> &mut Self {
        self.handlers.insert(reference.into(), Arc::new(handler));
        self
    }

    pub fn with_handler(mut self, reference: impl Into<String>, handler: impl JobHandler + 'static) -> Self {
        self.register(reference, handler);
        self
    }

    pub fn contains(&self, reference: &str) -> bool {
        self.handlers.contains_key(reference)
    }

    pub fn resolve(&self, reference: &str) -> Result<Arc<dyn JobHandler>> {
        self.handlers
            .get(reference)
            .cloned()
            .ok_or_else(|| QueueworkError::UnknownHandler {
                name: reference.to_string(),
            })
    }

    /// Resolve the job's handler and run it with the payload data.
    pub async fn fire(&self, ctx: &mut JobContext<'_>) -> Result<()> {
        let payload = ctx.job().payload();
        let handler = self.resolve(&payload.job)?;
        let data = payload.data.clone();
        handler.handle(ctx, data).await
    }

    /// Mark the job failed and invoke its handler's failure hook.
    pub async fn failed(&self, job: &mut dyn Job, error: &QueueworkError) -> Result<()> {
        job.mark_as_failed();
        let handler = self.resolve(&job.payload().job)?;
        handler.failed(job.payload().data.clone(), error).await
    }
}
