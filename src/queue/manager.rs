//! Named queue connections.
//!
//! A [`QueueManager`] maps connection names to [`ConnectionConfig`]s and opens
//! each connection the first time it is asked for. Hosts that build their own
//! backends register them directly with [`QueueManager::with_connection`].

use crate::{QueueworkError, Result, queue::Queue};
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
};
use tokio::sync::RwLock;
use tracing::info;

#[cfg(any(feature = "postgres", feature = "mysql"))]
use crate::queue::database::{DatabaseOptions, DatabaseQueue, JobTable};

/// How to reach one queue backend. Tagged by `driver` in configuration files.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "driver", rename_all = "snake_case")]
pub enum ConnectionConfig {
    Database(DatabaseConnectionConfig),
    Redis(RedisConnectionConfig),
    Null,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatabaseConnectionConfig {
    /// `postgres://` or `mysql://` URL; the scheme picks the backend
    pub url: String,
    #[serde(default = "default_table")]
    pub table: String,
    #[serde(default = "default_queue")]
    pub queue: String,
    #[serde(default = "default_retry_after")]
    pub retry_after: u64,
    #[serde(default = "default_pool_size")]
    pub pool_size: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RedisConnectionConfig {
    pub url: String,
    #[serde(default = "default_queue")]
    pub queue: String,
    #[serde(default = "default_redis_retry_after")]
    pub retry_after: Option<u64>,
    #[serde(default)]
    pub block_for: Option<u64>,
}

fn default_table() -> String {
    "jobs".to_string()
}

fn default_queue() -> String {
    "default".to_string()
}

fn default_retry_after() -> u64 {
    90
}

fn default_redis_retry_after() -> Option<u64> {
    Some(90)
}

fn default_pool_size() -> u32 {
    10
}

impl DatabaseConnectionConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            table: default_table(),
            queue: default_queue(),
            retry_after: default_retry_after(),
            pool_size: default_pool_size(),
        }
    }
}

impl RedisConnectionConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            queue: default_queue(),
            retry_after: default_redis_retry_after(),
            block_for: None,
        }
    }
}

/// Open a backend for `config` under the connection name `name`.
pub async fn connect(name: &str, config: &ConnectionConfig) -> Result<Arc<dyn Queue>> {
    match config {
        ConnectionConfig::Database(config) => connect_database(name, config),
        ConnectionConfig::Redis(config) => connect_redis(name, config).await,
        ConnectionConfig::Null => Ok(Arc::new(
            crate::queue::NullQueue::new().with_connection_name(name),
        )),
    }
}

#[cfg(any(feature = "postgres", feature = "mysql"))]
fn database_options(config: &DatabaseConnectionConfig) -> DatabaseOptions {
    DatabaseOptions::default()
        .with_table(config.table.clone())
        .with_queue(config.queue.clone())
        .with_retry_after(config.retry_after)
}

fn connect_database(name: &str, config: &DatabaseConnectionConfig) -> Result<Arc<dyn Queue>> {
    let scheme = config.url.split("://").next().unwrap_or_default();

    match scheme {
        #[cfg(feature = "postgres")]
        "postgres" | "postgresql" => {
            let pool = sqlx::postgres::PgPoolOptions::new()
                .max_connections(config.pool_size)
                .connect_lazy(&config.url)?;
            let queue = DatabaseQueue::<sqlx::Postgres>::with_options(pool, database_options(config))?
                .with_connection_name(name);
            Ok(Arc::new(queue))
        }
        #[cfg(feature = "mysql")]
        "mysql" | "mariadb" => {
            let pool = sqlx::mysql::MySqlPoolOptions::new()
                .max_connections(config.pool_size)
                .connect_lazy(&config.url)?;
            let queue = DatabaseQueue::<sqlx::MySql>::with_options(pool, database_options(config))?
                .with_connection_name(name);
            Ok(Arc::new(queue))
        }
        other => Err(QueueworkError::Config(format!(
            "Connection [{}] uses unsupported database scheme [{}]",
            name, other
        ))),
    }
}

/// Create the jobs table behind a database connection. Returns `false` for
/// drivers that keep no schema.
pub async fn migrate(name: &str, config: &ConnectionConfig) -> Result<bool> {
    let ConnectionConfig::Database(config) = config else {
        return Ok(false);
    };
    let scheme = config.url.split("://").next().unwrap_or_default();

    match scheme {
        #[cfg(feature = "postgres")]
        "postgres" | "postgresql" => {
            let pool = sqlx::postgres::PgPoolOptions::new()
                .max_connections(1)
                .connect(&config.url)
                .await?;
            DatabaseQueue::<sqlx::Postgres>::with_options(pool, database_options(config))?
                .create_table()
                .await?;
        }
        #[cfg(feature = "mysql")]
        "mysql" | "mariadb" => {
            let pool = sqlx::mysql::MySqlPoolOptions::new()
                .max_connections(1)
                .connect(&config.url)
                .await?;
            DatabaseQueue::<sqlx::MySql>::with_options(pool, database_options(config))?
                .create_table()
                .await?;
        }
        other => {
            return Err(QueueworkError::Config(format!(
                "Connection [{}] uses unsupported database scheme [{}]",
                name, other
            )));
        }
    }

    info!("Created table [{}] for connection [{}]", config.table, name);
    Ok(true)
}

#[cfg(feature = "redis")]
async fn connect_redis(name: &str, config: &RedisConnectionConfig) -> Result<Arc<dyn Queue>> {
    use crate::queue::redis::{RedisOptions, RedisQueue};

    let options = RedisOptions::default()
        .with_queue(config.queue.clone())
        .with_retry_after(config.retry_after)
        .with_block_for(config.block_for);
    let queue = RedisQueue::connect(&config.url, options)
        .await?
        .with_connection_name(name);
    Ok(Arc::new(queue))
}

#[cfg(not(feature = "redis"))]
async fn connect_redis(name: &str, _config: &RedisConnectionConfig) -> Result<Arc<dyn Queue>> {
    Err(QueueworkError::Config(format!(
        "Connection [{}] needs the redis feature",
        name
    )))
}

/// Resolves connection names to open queues, connecting lazily.
///
/// ```rust
/// use queuework::queue::{NullQueue, QueueManager};
/// use std::sync::Arc;
///
/// # #[tokio::main]
/// # async fn main() -> queuework::Result<()> {
/// let manager = QueueManager::new("sync").with_connection("sync", Arc::new(NullQueue::new()));
/// let queue = manager.connection(None).await?;
/// assert_eq!(queue.size(None).await?, 0);
/// # Ok(())
/// # }
/// ```
pub struct QueueManager {
    default: String,
    configs: BTreeMap<String, ConnectionConfig>,
    connections: RwLock<HashMap<String, Arc<dyn Queue>>>,
}

impl QueueManager {
    pub fn new(default: impl Into<String>) -> Self {
        Self {
            default: default.into(),
            configs: BTreeMap::new(),
            connections: RwLock::new(HashMap::new()),
        }
    }

    pub fn from_config(
        default: impl Into<String>,
        configs: BTreeMap<String, ConnectionConfig>,
    ) -> Self {
        Self {
            configs,
            ..Self::new(default)
        }
    }

    /// Register an already-open queue under `name`.
    pub fn with_connection(mut self, name: impl Into<String>, queue: Arc<dyn Queue>) -> Self {
        self.connections.get_mut().insert(name.into(), queue);
        self
    }

    pub fn default_connection(&self) -> &str {
        &self.default
    }

    pub fn connection_names(&self) -> Vec<String> {
        self.configs.keys().cloned().collect()
    }

    /// The queue for `name`, or for the default connection when `None`.
    pub async fn connection(&self, name: Option<&str>) -> Result<Arc<dyn Queue>> {
        let name = name.unwrap_or(&self.default);

        if let Some(queue) = self.connections.read().await.get(name) {
            return Ok(queue.clone());
        }

        let config = self
            .configs
            .get(name)
            .ok_or_else(|| QueueworkError::Config(format!("Queue connection [{}] is not defined", name)))?;

        let mut connections = self.connections.write().await;
        if let Some(queue) = connections.get(name) {
            return Ok(queue.clone());
        }

        let queue = connect(name, config).await?;
        info!("Opened queue connection [{}]", name);
        connections.insert(name.to_string(), queue.clone());
        Ok(queue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::test::TestQueue;

    #[tokio::test]
    async fn test_registered_connection_is_returned() {
        let queue = Arc::new(TestQueue::new().with_connection_name("memory"));
        let manager = QueueManager::new("memory").with_connection("memory", queue);

        let resolved = manager.connection(None).await.unwrap();
        assert_eq!(resolved.connection_name(), "memory");
        assert_eq!(
            manager.connection(Some("memory")).await.unwrap().connection_name(),
            "memory"
        );
    }

    #[tokio::test]
    async fn test_undefined_connection_is_config_error() {
        let manager = QueueManager::new("missing");
        let err = manager.connection(None).await.err().unwrap();
        assert!(matches!(err, QueueworkError::Config(_)));
    }

    #[tokio::test]
    async fn test_null_connection_from_config() {
        let mut configs = BTreeMap::new();
        configs.insert("discard".to_string(), ConnectionConfig::Null);
        let manager = QueueManager::from_config("discard", configs);

        let queue = manager.connection(None).await.unwrap();
        assert_eq!(queue.connection_name(), "discard");
        assert!(queue.pop(None).await.unwrap().is_none());
        assert_eq!(manager.connection_names(), vec!["discard".to_string()]);
    }

    #[tokio::test]
    async fn test_unsupported_database_scheme() {
        let config = ConnectionConfig::Database(DatabaseConnectionConfig::new("sqlite://jobs.db"));
        let err = connect("db", &config).await.err().unwrap();
        assert!(matches!(err, QueueworkError::Config(message) if message.contains("sqlite")));
    }

    #[test]
    fn test_connection_config_tags() {
        let config: ConnectionConfig = toml::from_str(
            r#"
            driver = "redis"
            url = "redis://127.0.0.1/"
            block_for = 5
            "#,
        )
        .unwrap();

        let ConnectionConfig::Redis(redis) = config else {
            panic!("expected redis config");
        };
        assert_eq!(redis.queue, "default");
        assert_eq!(redis.retry_after, Some(90));
        assert_eq!(redis.block_for, Some(5));

        let config: ConnectionConfig = toml::from_str(r#"driver = "null""#).unwrap();
        assert_eq!(config, ConnectionConfig::Null);
    }
}
