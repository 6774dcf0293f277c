//! Typed commands dispatched through the queue.
//!
//! A [`Command`] is a serializable value with a stable name. Pushing one produces
//! a payload whose handler is [`CALL_QUEUED_HANDLER`]; when a worker reserves it,
//! [`CallQueuedHandler`] looks the command name up in its [`CommandRegistry`],
//! deserializes the command and hands it to the registered [`CommandHandler`].
//!
//! ```rust
//! use queuework::command::{Command, CommandHandler, CommandRegistry};
//! use queuework::handler::JobContext;
//! use queuework::payload::Payload;
//! use async_trait::async_trait;
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Serialize, Deserialize)]
//! struct SendInvoice {
//!     invoice_id: u64,
//! }
//!
//! impl Command for SendInvoice {
//!     const NAME: &'static str = "send_invoice";
//!
//!     fn max_tries(&self) -> Option<u32> {
//!         Some(5)
//!     }
//! }
//!
//! struct InvoiceMailer;
//!
//! #[async_trait]
//! impl CommandHandler<SendInvoice> for InvoiceMailer {
//!     async fn handle(&self, command: SendInvoice, _ctx: &mut JobContext<'_>) -> queuework::Result<()> {
//!         println!("mailing invoice {}", command.invoice_id);
//!         Ok(())
//!     }
//! }
//!
//! let mut commands = CommandRegistry::new();
//! commands.register::<SendInvoice, _>(InvoiceMailer);
//!
//! let payload = Payload::from_command(&SendInvoice { invoice_id: 42 }).unwrap();
//! assert_eq!(payload.max_tries, Some(5));
//! assert_eq!(payload.data["commandName"], "send_invoice");
//! ```

use crate::{
    QueueworkError, Result,
    handler::{JobContext, JobHandler},
    payload::Payload,
    queue::QueueManager,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::Value;
use std::{collections::HashMap, marker::PhantomData, sync::Arc, time::Duration};
use tracing::{debug, info};

/// Handler reference written into every command payload.
pub const CALL_QUEUED_HANDLER: &str = "queuework::CallQueuedHandler@call";

pub trait Command: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Stable tag identifying the command type in payloads
    const NAME: &'static str;

    fn display_name(&self) -> String {
        Self::NAME.to_string()
    }

    fn max_tries(&self) -> Option<u32> {
        None
    }

    /// Timeout in seconds
    fn timeout(&self) -> Option<u64> {
        None
    }

    fn retry_until(&self) -> Option<DateTime<Utc>> {
        None
    }

    /// Delete the job instead of failing it when an entity the command refers
    /// to no longer exists.
    fn delete_when_missing_models() -> bool {
        false
    }
}

#[async_trait]
pub trait CommandHandler<C: Command>: Send + Sync + 'static {
    /// Re-hydrate the entities the command refers to. Return
    /// [`QueueworkError::ModelNotFound`] when one has vanished.
    async fn restore(&self, command: C) -> Result<C> {
        Ok(command)
    }

    async fn handle(&self, command: C, ctx: &mut JobContext<'_>) -> Result<()>;

    async fn failed(&self, _command: C, _error: &QueueworkError) -> Result<()> {
        Ok(())
    }
}

/// The `data` section of a command payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandData {
    pub command_name: String,
    /// The command serialized as JSON text
    pub command: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub chained: Vec<ChainedCommand>,
}

/// A command to dispatch once the current one completes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainedCommand {
    pub display_name: String,
    pub command_name: String,
    pub command: String,
    pub max_tries: Option<u32>,
    pub timeout: Option<u64>,
    pub timeout_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue: Option<String>,
    /// Delay in seconds before the command becomes available
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay: Option<u64>,
}

impl ChainedCommand {
    pub fn new<C: Command>(command: &C) -> Result<Self> {
        Ok(Self {
            display_name: command.display_name(),
            command_name: C::NAME.to_string(),
            command: serde_json::to_string(command)?,
            max_tries: command.max_tries(),
            timeout: command.timeout(),
            timeout_at: command.retry_until().map(|at| at.timestamp()),
            connection: None,
            queue: None,
            delay: None,
        })
    }

    pub fn on_connection(mut self, connection: impl Into<String>) -> Self {
        self.connection = Some(connection.into());
        self
    }

    pub fn on_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = Some(queue.into());
        self
    }

    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay.as_secs());
        self
    }

    /// Build the payload for this link, carrying the rest of the chain.
    pub fn into_payload(self, rest: Vec<ChainedCommand>) -> Result<Payload> {
        let data = CommandData {
            command_name: self.command_name,
            command: self.command,
            chained: rest,
        };
        let mut payload = Payload::new(CALL_QUEUED_HANDLER, serde_json::to_value(data)?)
            .with_display_name(self.display_name);
        payload.max_tries = self.max_tries;
        payload.timeout = self.timeout;
        payload.timeout_at = self.timeout_at;
        Ok(payload)
    }
}

impl Payload {
    /// Build the payload that runs `command` through [`CallQueuedHandler`].
    pub fn from_command<C: Command>(command: &C) -> Result<Self> {
        ChainedCommand::new(command)?.into_payload(Vec::new())
    }

    /// Attach commands to run, in order, after this one succeeds.
    pub fn chain(mut self, chained: Vec<ChainedCommand>) -> Result<Self> {
        let mut data: CommandData = serde_json::from_value(self.data)?;
        data.chained = chained;
        self.data = serde_json::to_value(data)?;
        Ok(self)
    }
}

#[async_trait]
trait CommandEntry: Send + Sync {
    fn delete_when_missing_models(&self) -> bool;

    async fn decode(&self, serialized: &str) -> Result<Box<dyn DecodedCommand>>;

    /// Deserialize without restoring, for the failure hook.
    fn decode_unrestored(&self, serialized: &str) -> Result<Box<dyn DecodedCommand>>;
}

#[async_trait]
trait DecodedCommand: Send {
    async fn handle(self: Box<Self>, ctx: &mut JobContext<'_>) -> Result<()>;

    async fn failed(self: Box<Self>, error: &QueueworkError) -> Result<()>;
}

struct TypedEntry<C, H> {
    handler: Arc<H>,
    _command: PhantomData<fn() -> C>,
}

struct Decoded<C, H> {
    command: C,
    handler: Arc<H>,
}

#[async_trait]
impl<C: Command, H: CommandHandler<C>> CommandEntry for TypedEntry<C, H> {
    fn delete_when_missing_models(&self) -> bool {
        C::delete_when_missing_models()
    }

    async fn decode(&self, serialized: &str) -> Result<Box<dyn DecodedCommand>> {
        let command: C = serde_json::from_str(serialized)?;
        let command = self.handler.restore(command).await?;
        Ok(Box::new(Decoded {
            command,
            handler: self.handler.clone(),
        }))
    }

    fn decode_unrestored(&self, serialized: &str) -> Result<Box<dyn DecodedCommand>> {
        let command: C = serde_json::from_str(serialized)?;
        Ok(Box::new(Decoded {
            command,
            handler: self.handler.clone(),
        }))
    }
}

#[async_trait]
impl<C: Command, H: CommandHandler<C>> DecodedCommand for Decoded<C, H> {
    async fn handle(self: Box<Self>, ctx: &mut JobContext<'_>) -> Result<()> {
        let Decoded { command, handler } = *self;
        handler.handle(command, ctx).await
    }

    async fn failed(self: Box<Self>, error: &QueueworkError) -> Result<()> {
        let Decoded { command, handler } = *self;
        handler.failed(command, error).await
    }
}

/// Maps command names to their handlers.
#[derive(Default, Clone)]
pub struct CommandRegistry {
    entries: HashMap<String, Arc<dyn CommandEntry>>,
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<C: Command, H: CommandHandler<C>>(&mut self, handler: H) -> &mut Self {
        self.entries.insert(
            C::NAME.to_string(),
            Arc::new(TypedEntry::<C, H> {
                handler: Arc::new(handler),
                _command: PhantomData,
            }),
        );
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn entry(&self, name: &str) -> Result<Arc<dyn CommandEntry>> {
        self.entries
            .get(name)
            .cloned()
            .ok_or_else(|| QueueworkError::UnknownCommand {
                name: name.to_string(),
            })
    }
}

/// The [`JobHandler`] behind every command payload.
pub struct CallQueuedHandler {
    commands: CommandRegistry,
    manager: Option<Arc<QueueManager>>,
}

impl CallQueuedHandler {
    pub fn new(commands: CommandRegistry) -> Self {
        Self {
            commands,
            manager: None,
        }
    }

    /// Connections used to dispatch chained commands.
    pub fn with_manager(mut self, manager: Arc<QueueManager>) -> Self {
        self.manager = Some(manager);
        self
    }

    async fn handle_model_not_found(
        &self,
        ctx: &mut JobContext<'_>,
        entry: &dyn CommandEntry,
        error: QueueworkError,
    ) -> Result<()> {
        if entry.delete_when_missing_models() {
            debug!(
                "Deleting job {} whose command refers to a missing model",
                ctx.job().job_id()
            );
            return ctx.delete().await;
        }

        ctx.fail(error).await
    }

    async fn dispatch_next_in_chain(
        &self,
        ctx: &JobContext<'_>,
        mut chained: Vec<ChainedCommand>,
    ) -> Result<()> {
        if chained.is_empty() {
            return Ok(());
        }

        let manager = self.manager.as_ref().ok_or_else(|| QueueworkError::Queue {
            message: "Chained commands require a queue manager".to_string(),
        })?;

        let next = chained.remove(0);
        let connection_name = next
            .connection
            .clone()
            .unwrap_or_else(|| ctx.job().connection_name().to_string());
        let queue_name = next
            .queue
            .clone()
            .unwrap_or_else(|| ctx.job().queue().to_string());
        let delay = next.delay;
        let payload = next.into_payload(chained)?;

        let connection = manager.connection(Some(&connection_name)).await?;
        let id = match delay {
            Some(secs) if secs > 0 => {
                connection
                    .later(Duration::from_secs(secs), &payload, Some(&queue_name))
                    .await?
            }
            _ => connection.push(&payload, Some(&queue_name)).await?,
        };

        info!(
            "Dispatched chained command {} as job {} on {}:{}",
            payload.display_name, id, connection_name, queue_name
        );
        Ok(())
    }
}

#[async_trait]
impl JobHandler for CallQueuedHandler {
    async fn handle(&self, ctx: &mut JobContext<'_>, data: Value) -> Result<()> {
        let data: CommandData = serde_json::from_value(data)?;
        let entry = self.commands.entry(&data.command_name)?;

        let command = match entry.decode(&data.command).await {
            Ok(command) => command,
            Err(error @ QueueworkError::ModelNotFound { .. }) => {
                return self.handle_model_not_found(ctx, entry.as_ref(), error).await;
            }
            Err(error) => return Err(error),
        };

        command.handle(ctx).await?;

        if !ctx.job().has_failed() && !ctx.job().is_released() {
            self.dispatch_next_in_chain(ctx, data.chained).await?;
        }

        if !ctx.job().is_deleted_or_released() {
            ctx.delete().await?;
        }

        Ok(())
    }

    async fn failed(&self, data: Value, error: &QueueworkError) -> Result<()> {
        let data: CommandData = serde_json::from_value(data)?;
        let entry = self.commands.entry(&data.command_name)?;
        let command = entry.decode_unrestored(&data.command)?;
        command.failed(error).await
    }
}
