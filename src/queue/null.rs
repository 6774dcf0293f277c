use crate::{
    Result,
    job::{Job, JobId},
    queue::Queue,
};
use async_trait::async_trait;
use std::time::Duration;

/// A queue that accepts and discards everything.
#[derive(Debug, Clone)]
pub struct NullQueue {
    connection_name: String,
}

impl NullQueue {
    pub fn new() -> Self {
        Self {
            connection_name: "null".to_string(),
        }
    }

    pub fn with_connection_name(mut self, name: impl Into<String>) -> Self {
        self.connection_name = name.into();
        self
    }
}

impl Default for NullQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Queue for NullQueue {
    fn connection_name(&self) -> &str {
        &self.connection_name
    }

    fn default_queue(&self) -> &str {
        "default"
    }

    async fn size(&self, _queue: Option<&str>) -> Result<u64> {
        Ok(0)
    }

    async fn push_raw(&self, _payload: String, _queue: Option<&str>) -> Result<JobId> {
        Ok(JobId::new())
    }

    async fn later_raw(
        &self,
        _delay: Duration,
        _payload: String,
        _queue: Option<&str>,
    ) -> Result<JobId> {
        Ok(JobId::new())
    }

    async fn pop(&self, _queue: Option<&str>) -> Result<Option<Box<dyn Job>>> {
        Ok(None)
    }
}
