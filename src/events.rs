//! Lifecycle events raised by the worker and the failure path.
//!
//! The worker reports everything it does through an [`EventSink`]. The bundled
//! [`EventManager`] fans events out to any number of subscribers over a tokio
//! broadcast channel and lets the host veto worker iterations by registering
//! looping guards (a maintenance switch, a feature flag, a deploy lock).
//!
//! ```rust
//! use queuework::events::{EventManager, EventSink, QueueEvent};
//!
//! # #[tokio::main]
//! # async fn main() {
//! let events = EventManager::new_default();
//! let mut subscription = events.subscribe();
//!
//! events.add_looping_guard(|_connection, queue| queue != "frozen").await;
//!
//! let allowed = events
//!     .until(QueueEvent::Looping {
//!         connection: "redis".to_string(),
//!         queue: "frozen".to_string(),
//!     })
//!     .await;
//! assert!(!allowed);
//! assert!(matches!(subscription.try_recv(), Ok(QueueEvent::Looping { .. })));
//! # }
//! ```

use crate::job::JobSnapshot;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{RwLock, broadcast};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum QueueEvent {
    /// A reserved job is about to run
    JobProcessing { connection: String, job: JobSnapshot },
    /// A job ran without error
    JobProcessed { connection: String, job: JobSnapshot },
    /// A job returned an error (it may still be retried)
    JobExceptionOccurred {
        connection: String,
        job: JobSnapshot,
        error: String,
    },
    /// A job was failed permanently
    JobFailed {
        connection: String,
        job: JobSnapshot,
        error: String,
    },
    /// The worker is about to exit with `status`
    WorkerStopping { status: i32 },
    /// The worker is about to start an iteration
    Looping { connection: String, queue: String },
}

impl QueueEvent {
    pub fn name(&self) -> &'static str {
        match self {
            QueueEvent::JobProcessing { .. } => "job_processing",
            QueueEvent::JobProcessed { .. } => "job_processed",
            QueueEvent::JobExceptionOccurred { .. } => "job_exception_occurred",
            QueueEvent::JobFailed { .. } => "job_failed",
            QueueEvent::WorkerStopping { .. } => "worker_stopping",
            QueueEvent::Looping { .. } => "looping",
        }
    }
}

/// Receiver of lifecycle notifications.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn dispatch(&self, event: QueueEvent);

    /// Dispatch an event that listeners may veto. Returns `false` when a
    /// listener asked the caller to halt.
    async fn until(&self, event: QueueEvent) -> bool {
        self.dispatch(event).await;
        true
    }
}

/// Decides whether the worker may run an iteration on `(connection, queue)`.
pub type LoopingGuard = Arc<dyn Fn(&str, &str) -> bool + Send + Sync>;

/// Configuration for the event system
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EventConfig {
    /// Maximum number of events to buffer in broadcast channel
    pub max_buffer_size: usize,
    /// Whether to log event publishing
    pub log_events: bool,
}

impl Default for EventConfig {
    fn default() -> Self {
        Self {
            max_buffer_size: 1024,
            log_events: false,
        }
    }
}

pub struct EventManager {
    sender: broadcast::Sender<QueueEvent>,
    looping_guards: RwLock<Vec<LoopingGuard>>,
    config: EventConfig,
}

impl EventManager {
    pub fn new(config: EventConfig) -> Self {
        let (sender, _) = broadcast::channel(config.max_buffer_size.max(1));

        Self {
            sender,
            looping_guards: RwLock::new(Vec::new()),
            config,
        }
    }

    pub fn new_default() -> Self {
        Self::new(EventConfig::default())
    }

    /// Receive every event published after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    pub async fn add_looping_guard<F>(&self, guard: F)
    where
        F: Fn(&str, &str) -> bool + Send + Sync + 'static,
    {
        self.looping_guards.write().await.push(Arc::new(guard));
    }

    async fn looping_allowed(&self, event: &QueueEvent) -> bool {
        let QueueEvent::Looping { connection, queue } = event else {
            return true;
        };
        let guards = self.looping_guards.read().await;
        guards.iter().all(|guard| guard(connection, queue))
    }
}

impl Default for EventManager {
    fn default() -> Self {
        Self::new_default()
    }
}

#[async_trait]
impl EventSink for EventManager {
    async fn dispatch(&self, event: QueueEvent) {
        if self.config.log_events {
            tracing::debug!("Publishing queue event: {}", event.name());
        }

        // No subscribers is not an error
        if let Ok(count) = self.sender.send(event) {
            if self.config.log_events {
                tracing::trace!("Event delivered to {} subscribers", count);
            }
        }
    }

    async fn until(&self, event: QueueEvent) -> bool {
        let allowed = self.looping_allowed(&event).await;
        self.dispatch(event).await;
        allowed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot() -> JobSnapshot {
        JobSnapshot {
            job_id: "1".to_string(),
            queue: "default".to_string(),
            display_name: "send_email".to_string(),
            attempts: 1,
            max_tries: None,
            raw_body: "{}".to_string(),
        }
    }

    #[tokio::test]
    async fn test_dispatch_without_subscribers() {
        let manager = EventManager::new_default();
        manager
            .dispatch(QueueEvent::WorkerStopping { status: 0 })
            .await;
        assert_eq!(manager.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_subscribers_receive_events_in_order() {
        let manager = EventManager::new_default();
        let mut rx = manager.subscribe();

        manager
            .dispatch(QueueEvent::JobProcessing {
                connection: "database".to_string(),
                job: snapshot(),
            })
            .await;
        manager
            .dispatch(QueueEvent::JobProcessed {
                connection: "database".to_string(),
                job: snapshot(),
            })
            .await;

        assert_eq!(rx.recv().await.unwrap().name(), "job_processing");
        assert_eq!(rx.recv().await.unwrap().name(), "job_processed");
    }

    #[tokio::test]
    async fn test_looping_guard_vetoes() {
        let manager = EventManager::new_default();
        let looping = || QueueEvent::Looping {
            connection: "redis".to_string(),
            queue: "emails".to_string(),
        };

        assert!(manager.until(looping()).await);

        manager.add_looping_guard(|_, queue| queue != "emails").await;
        assert!(!manager.until(looping()).await);
    }

    #[tokio::test]
    async fn test_guards_ignore_other_events() {
        let manager = EventManager::new_default();
        manager.add_looping_guard(|_, _| false).await;
        assert!(manager.until(QueueEvent::WorkerStopping { status: 12 }).await);
    }

    #[test]
    fn test_event_serialization_tag() {
        let event = QueueEvent::WorkerStopping { status: 12 };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "worker_stopping");
        assert_eq!(json["status"], 12);
    }
}
