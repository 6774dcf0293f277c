//! # Queuework
//!
//! A background job queue and worker daemon for Rust. Producers push
//! serialized jobs onto named queues of a backend connection; long-running
//! workers claim them, run the registered handler, and apply a retry and
//! failure policy.
//!
//! ## Features
//!
//! - **Pluggable backends**: PostgreSQL and MySQL tables, Redis lists with
//!   sorted sets for delayed and reserved jobs, and a null backend
//! - **At-least-once delivery**: a claimed job that is never finished becomes
//!   claimable again after `retry_after` seconds
//! - **Retry policy**: per-job `maxTries` and `timeoutAt`, worker-wide defaults,
//!   release with a configurable delay
//! - **Deadlines**: jobs run under a timeout, backed by a watchdog that ends the
//!   process if a job refuses to stop
//! - **Self-managing workers**: pause and resume, graceful quit, restart on
//!   deploy, exit when a memory limit is reached
//! - **Commands**: typed, serialized jobs dispatched to registered handlers,
//!   with chained follow-up commands
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use queuework::{
//!     EventManager, HandlerRegistry, Payload, Queue, QueueManager, Worker, WorkerOptions,
//!     handler::handler_fn,
//!     queue::{ConnectionConfig, DatabaseConnectionConfig},
//! };
//! use serde_json::json;
//! use std::{collections::BTreeMap, sync::Arc};
//!
//! #[tokio::main]
//! async fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
//!     let mut connections = BTreeMap::new();
//!     connections.insert(
//!         "database".to_string(),
//!         ConnectionConfig::Database(DatabaseConnectionConfig::new(
//!             "postgresql://localhost/queuework",
//!         )),
//!     );
//!     let manager = Arc::new(QueueManager::from_config("database", connections));
//!
//!     // Producer side
//!     let queue = manager.connection(None).await?;
//!     queue
//!         .push(
//!             &Payload::new("send_email", json!({"to": "user@example.com"})).with_max_tries(3),
//!             Some("emails"),
//!         )
//!         .await?;
//!
//!     // Worker side
//!     let handlers = HandlerRegistry::new().with_handler(
//!         "send_email",
//!         handler_fn(|data| async move {
//!             println!("Sending email to {}", data["to"]);
//!             Ok(())
//!         }),
//!     );
//!     let worker = Worker::new(manager, Arc::new(handlers), Arc::new(EventManager::new_default()));
//!     let exit = worker
//!         .daemon("database", "emails,default", &WorkerOptions::default())
//!         .await;
//!
//!     std::process::exit(exit.exit_code());
//! }
//! ```

pub mod command;
pub mod config;
pub mod error;
pub mod events;
pub mod failing;
pub mod handler;
pub mod job;
pub mod memory;
pub mod payload;
pub mod queue;
pub mod reporter;
pub mod restart;
pub mod worker;

pub use command::{
    CallQueuedHandler, ChainedCommand, Command, CommandData, CommandHandler, CommandRegistry,
};
pub use config::{LoggingConfig, QueueworkConfig};
pub use error::QueueworkError;
pub use events::{EventConfig, EventManager, EventSink, QueueEvent};
pub use failing::FailingJob;
pub use handler::{HandlerRegistry, JobContext, JobHandler};
pub use job::{Job, JobId, JobSnapshot, JobState};
pub use payload::Payload;
pub use queue::{Queue, QueueManager};
pub use reporter::{ExceptionReporter, TracingReporter};
pub use restart::{RestartConfig, RestartSignal};
pub use worker::{Worker, WorkerExit, WorkerHandle, WorkerOptions, WorkerStatus};

/// Convenient type alias for Results with [`QueueworkError`] as the error type.
pub type Result<T> = std::result::Result<T, QueueworkError>;
