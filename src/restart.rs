//! Broadcast restart requests to running workers.
//!
//! `queuework restart` writes the current unix time under a shared marker. Each
//! worker remembers the marker's value when its loop starts and stops itself
//! (status 0) once the value changes, letting its supervisor start a fresh
//! process with new code.

use crate::{Result, job::unix_now};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::{
    path::PathBuf,
    sync::{Arc, Mutex, PoisonError},
};

/// Key the Redis marker lives under.
pub const RESTART_KEY: &str = "queuework:queue:restart";

#[async_trait]
pub trait RestartSignal: Send + Sync {
    /// Unix time of the last restart request, if there has been one.
    async fn last_restart(&self) -> Result<Option<i64>>;

    /// Ask every worker sharing this marker to stop.
    async fn request_restart(&self) -> Result<i64>;
}

/// Where workers look for the restart marker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "driver", rename_all = "snake_case")]
pub enum RestartConfig {
    /// No restart marker
    #[default]
    None,
    Redis { url: String },
    File { path: PathBuf },
}

impl RestartConfig {
    pub async fn build(&self) -> Result<Option<Arc<dyn RestartSignal>>> {
        match self {
            RestartConfig::None => Ok(None),
            #[cfg(feature = "redis")]
            RestartConfig::Redis { url } => Ok(Some(Arc::new(RedisRestartSignal::connect(url).await?))),
            #[cfg(not(feature = "redis"))]
            RestartConfig::Redis { .. } => Err(crate::QueueworkError::Config(
                "The redis restart marker needs the redis feature".to_string(),
            )),
            RestartConfig::File { path } => Ok(Some(Arc::new(FileRestartSignal::new(path.clone())))),
        }
    }
}

#[cfg(feature = "redis")]
pub struct RedisRestartSignal {
    conn: redis::aio::MultiplexedConnection,
}

#[cfg(feature = "redis")]
impl RedisRestartSignal {
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)?;
        let conn = client.get_multiplexed_async_connection().await?;
        Ok(Self { conn })
    }

    pub fn with_connection(conn: redis::aio::MultiplexedConnection) -> Self {
        Self { conn }
    }
}

#[cfg(feature = "redis")]
#[async_trait]
impl RestartSignal for RedisRestartSignal {
    async fn last_restart(&self) -> Result<Option<i64>> {
        let mut conn = self.conn.clone();
        let value: Option<i64> = redis::cmd("GET")
            .arg(RESTART_KEY)
            .query_async(&mut conn)
            .await?;
        Ok(value)
    }

    async fn request_restart(&self) -> Result<i64> {
        let now = unix_now();
        let mut conn = self.conn.clone();
        let _: () = redis::cmd("SET")
            .arg(RESTART_KEY)
            .arg(now)
            .query_async(&mut conn)
            .await?;
        Ok(now)
    }
}

/// Marker stored as a timestamp in a file, for hosts without Redis.
pub struct FileRestartSignal {
    path: PathBuf,
}

impl FileRestartSignal {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl RestartSignal for FileRestartSignal {
    async fn last_restart(&self) -> Result<Option<i64>> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => Ok(contents.trim().parse().ok()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn request_restart(&self) -> Result<i64> {
        let now = unix_now();
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&self.path, now.to_string()).await?;
        Ok(now)
    }
}

/// In-process marker.
#[derive(Debug, Clone, Default)]
pub struct MemoryRestartSignal {
    last: Arc<Mutex<Option<i64>>>,
}

impl MemoryRestartSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrite the marker with an explicit value.
    pub fn set(&self, value: Option<i64>) {
        *self.last.lock().unwrap_or_else(PoisonError::into_inner) = value;
    }
}

#[async_trait]
impl RestartSignal for MemoryRestartSignal {
    async fn last_restart(&self) -> Result<Option<i64>> {
        Ok(*self.last.lock().unwrap_or_else(PoisonError::into_inner))
    }

    async fn request_restart(&self) -> Result<i64> {
        let now = unix_now();
        self.set(Some(now));
        Ok(now)
    }
}
