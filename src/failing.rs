use crate::{
    QueueworkError, Result,
    events::{EventSink, QueueEvent},
    handler::HandlerRegistry,
    job::{Job, JobSnapshot},
};
use std::sync::Arc;
use tracing::warn;

/// The one place a job is failed permanently.
///
/// Failing deletes the job, runs its handler's failure hook and always ends
/// with a `JobFailed` event, even when the delete or the hook errored. A job
/// that is already deleted is left alone, so the event fires once per job no
/// matter how many error paths reach this point.
pub struct FailingJob {
    handlers: Arc<HandlerRegistry>,
    events: Arc<dyn EventSink>,
}

impl FailingJob {
    pub fn new(handlers: Arc<HandlerRegistry>, events: Arc<dyn EventSink>) -> Self {
        Self { handlers, events }
    }

    pub fn handlers(&self) -> &HandlerRegistry {
        &self.handlers
    }

    pub async fn handle(
        &self,
        connection: &str,
        job: &mut dyn Job,
        error: &QueueworkError,
    ) -> Result<()> {
        job.mark_as_failed();

        if job.is_deleted() {
            return Ok(());
        }

        let outcome = match job.delete().await {
            Ok(()) => self.handlers.failed(job, error).await,
            Err(e) => Err(e),
        };

        if let Err(e) = &outcome {
            warn!("Failure handling for job {} did not complete: {}", job.job_id(), e);
        }

        self.events
            .dispatch(QueueEvent::JobFailed {
                connection: connection.to_string(),
                job: JobSnapshot::of(job),
                error: error.to_string(),
            })
            .await;

        outcome
    }
}
