use crate::QueueworkError;
use tracing::error;

/// Receives every error the worker could not hand back to a caller.
pub trait ExceptionReporter: Send + Sync {
    fn report(&self, error: &QueueworkError);
}

/// Reports errors as `tracing` events.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingReporter;

impl ExceptionReporter for TracingReporter {
    fn report(&self, error: &QueueworkError) {
        error!(lost_connection = error.causes_lost_connection(), "{}", error);
    }
}
