//! Configuration for queue connections and workers.
//!
//! Configuration is read from a TOML file, from `QUEUEWORK_*` environment
//! variables, or from the file with the environment layered on top.
//!
//! ```toml
//! default = "redis"
//!
//! [connections.database]
//! driver = "database"
//! url = "postgres://localhost/app"
//! retry_after = 120
//!
//! [connections.redis]
//! driver = "redis"
//! url = "redis://127.0.0.1/"
//! block_for = 5
//!
//! [worker]
//! sleep = "3s"
//! timeout = "2m"
//! memory = 256
//!
//! [restart]
//! driver = "redis"
//! url = "redis://127.0.0.1/"
//!
//! [logging]
//! level = "info"
//! json_format = true
//! ```

use crate::{
    Result,
    events::EventConfig,
    queue::{ConnectionConfig, DatabaseConnectionConfig, RedisConnectionConfig},
    restart::RestartConfig,
    worker::WorkerOptions,
};
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, path::Path, time::Duration};

/// Serde format for durations: "500ms", "30s", "5m", "1h", "1d", or a bare
/// number of seconds.
pub(crate) mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let millis = duration.as_millis();
        let secs = duration.as_secs();
        let text = if millis % 1000 != 0 {
            format!("{}ms", millis)
        } else if secs != 0 && secs % 3600 == 0 {
            format!("{}h", secs / 3600)
        } else if secs != 0 && secs % 60 == 0 {
            format!("{}m", secs / 60)
        } else {
            format!("{}s", secs)
        };
        serializer.serialize_str(&text)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        use serde::de::Error;

        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Seconds(u64),
            Text(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Seconds(secs) => Ok(Duration::from_secs(secs)),
            Raw::Text(text) => parse_duration(&text).map_err(D::Error::custom),
        }
    }

    pub fn parse_duration(text: &str) -> Result<Duration, String> {
        let text = text.trim();

        if let Ok(secs) = text.parse::<u64>() {
            return Ok(Duration::from_secs(secs));
        }

        let split = text
            .find(|c: char| !c.is_ascii_digit())
            .ok_or_else(|| format!("Invalid duration format: {}", text))?;
        let (number, unit) = text.split_at(split);
        let number: u64 = number
            .parse()
            .map_err(|_| format!("Invalid number in duration: {}", text))?;

        match unit {
            "ms" => Ok(Duration::from_millis(number)),
            "s" => Ok(Duration::from_secs(number)),
            "m" => Ok(Duration::from_secs(number * 60)),
            "h" => Ok(Duration::from_secs(number * 3600)),
            "d" => Ok(Duration::from_secs(number * 86400)),
            _ => Err(format!(
                "Invalid duration suffix: {}. Use ms, s, m, h, or d",
                unit
            )),
        }
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueworkConfig {
    /// Connection used when none is named
    pub default: String,
    pub connections: BTreeMap<String, ConnectionConfig>,
    pub worker: WorkerOptions,
    pub events: EventConfig,
    pub restart: RestartConfig,
    pub logging: LoggingConfig,
}

impl Default for QueueworkConfig {
    fn default() -> Self {
        let mut connections = BTreeMap::new();
        connections.insert(
            "database".to_string(),
            ConnectionConfig::Database(DatabaseConnectionConfig::new(
                "postgres://localhost/queuework",
            )),
        );
        connections.insert(
            "redis".to_string(),
            ConnectionConfig::Redis(RedisConnectionConfig::new("redis://127.0.0.1/")),
        );
        connections.insert("null".to_string(), ConnectionConfig::Null);

        Self {
            default: "database".to_string(),
            connections,
            worker: WorkerOptions::default(),
            events: EventConfig::default(),
            restart: RestartConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl QueueworkConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_default_connection(mut self, name: impl Into<String>) -> Self {
        self.default = name.into();
        self
    }

    pub fn with_connection(mut self, name: impl Into<String>, config: ConnectionConfig) -> Self {
        self.connections.insert(name.into(), config);
        self
    }

    pub fn with_worker(mut self, worker: WorkerOptions) -> Self {
        self.worker = worker;
        self
    }

    pub fn with_restart(mut self, restart: RestartConfig) -> Self {
        self.restart = restart;
        self
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save_to_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        Self::default().with_env_overrides()
    }

    /// Layer `QUEUEWORK_*` environment variables over this configuration.
    pub fn with_env_overrides(self) -> Result<Self> {
        self.with_overrides(|key| std::env::var(key).ok())
    }

    fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        if let Some(name) = lookup("QUEUEWORK_CONNECTION") {
            self.default = name;
        }

        if let Some(url) = lookup("QUEUEWORK_DATABASE_URL") {
            match self.connections.get_mut("database") {
                Some(ConnectionConfig::Database(database)) => database.url = url,
                _ => {
                    self.connections.insert(
                        "database".to_string(),
                        ConnectionConfig::Database(DatabaseConnectionConfig::new(url)),
                    );
                }
            }
        }

        if let Some(url) = lookup("QUEUEWORK_REDIS_URL") {
            match self.connections.get_mut("redis") {
                Some(ConnectionConfig::Redis(redis)) => redis.url = url,
                _ => {
                    self.connections.insert(
                        "redis".to_string(),
                        ConnectionConfig::Redis(RedisConnectionConfig::new(url)),
                    );
                }
            }
        }

        let seconds = |key: &str| -> Result<Option<Duration>> {
            lookup(key)
                .map(|value| {
                    duration_secs::parse_duration(&value)
                        .map_err(|e| crate::QueueworkError::Config(format!("{}: {}", key, e)))
                })
                .transpose()
        };
        if let Some(delay) = seconds("QUEUEWORK_WORKER_DELAY")? {
            self.worker.delay = delay;
        }
        if let Some(sleep) = seconds("QUEUEWORK_WORKER_SLEEP")? {
            self.worker.sleep = sleep;
        }
        if let Some(timeout) = seconds("QUEUEWORK_WORKER_TIMEOUT")? {
            self.worker.timeout = timeout;
        }
        if let Some(memory) = lookup("QUEUEWORK_WORKER_MEMORY") {
            self.worker.memory = parse_number("QUEUEWORK_WORKER_MEMORY", &memory)?;
        }
        if let Some(tries) = lookup("QUEUEWORK_WORKER_TRIES") {
            self.worker.max_tries = parse_number("QUEUEWORK_WORKER_TRIES", &tries)?;
        }

        if let Some(path) = lookup("QUEUEWORK_RESTART_FILE") {
            self.restart = RestartConfig::File { path: path.into() };
        }

        if let Some(buffer_size) = lookup("QUEUEWORK_EVENT_BUFFER_SIZE") {
            self.events.max_buffer_size = parse_number("QUEUEWORK_EVENT_BUFFER_SIZE", &buffer_size)?;
        }

        if let Some(level) = lookup("QUEUEWORK_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Some(json) = lookup("QUEUEWORK_LOG_JSON") {
            self.logging.json_format = matches!(json.as_str(), "1" | "true" | "yes");
        }

        Ok(self)
    }
}

fn parse_number<T>(key: &str, value: &str) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| crate::QueueworkError::Config(format!("{}: {:?}: {}", key, value, e)))
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level or filter directive (trace, debug, info, warn, error, "queuework=debug")
    pub level: String,

    /// Whether to enable structured JSON logging
    pub json_format: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json_format: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = QueueworkConfig::default();
        assert_eq!(config.default, "database");
        assert_eq!(config.connections.len(), 3);
        assert_eq!(config.worker.sleep, Duration::from_secs(3));
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.restart, RestartConfig::None);
    }

    #[test]
    fn test_config_file_round_trip() {
        let config = QueueworkConfig::new()
            .with_default_connection("redis")
            .with_worker(
                WorkerOptions::default()
                    .with_sleep(Duration::from_secs(5))
                    .with_timeout(Duration::from_secs(120)),
            );

        let file = NamedTempFile::new().unwrap();
        config.save_to_file(file.path()).unwrap();
        let loaded = QueueworkConfig::from_file(file.path()).unwrap();

        assert_eq!(loaded.default, "redis");
        assert_eq!(loaded.worker.sleep, Duration::from_secs(5));
        assert_eq!(loaded.worker.timeout, Duration::from_secs(120));
        assert_eq!(loaded.connections, config.connections);
    }

    #[test]
    fn test_parse_toml_document() {
        let config: QueueworkConfig = toml::from_str(
            r#"
            default = "jobs"

            [connections.jobs]
            driver = "database"
            url = "mysql://root@localhost/app"
            table = "queued_jobs"

            [worker]
            sleep = "500ms"
            timeout = "2m"
            memory = 256
            max_tries = 3

            [restart]
            driver = "redis"
            url = "redis://127.0.0.1/"
            "#,
        )
        .unwrap();

        assert_eq!(config.default, "jobs");
        let Some(ConnectionConfig::Database(jobs)) = config.connections.get("jobs") else {
            panic!("expected database connection");
        };
        assert_eq!(jobs.table, "queued_jobs");
        assert_eq!(jobs.retry_after, 90);
        assert_eq!(config.worker.sleep, Duration::from_millis(500));
        assert_eq!(config.worker.timeout, Duration::from_secs(120));
        assert_eq!(config.worker.memory, 256);
        assert_eq!(config.worker.max_tries, 3);
        assert_eq!(config.worker.delay, Duration::ZERO);
        assert!(matches!(config.restart, RestartConfig::Redis { .. }));
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("QUEUEWORK_CONNECTION", "redis"),
            ("QUEUEWORK_REDIS_URL", "redis://cache:6379/2"),
            ("QUEUEWORK_WORKER_SLEEP", "10"),
            ("QUEUEWORK_WORKER_TRIES", "4"),
            ("QUEUEWORK_LOG_JSON", "true"),
        ]);

        let config = QueueworkConfig::default()
            .with_overrides(|key| env.get(key).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.default, "redis");
        let Some(ConnectionConfig::Redis(redis)) = config.connections.get("redis") else {
            panic!("expected redis connection");
        };
        assert_eq!(redis.url, "redis://cache:6379/2");
        assert_eq!(config.worker.sleep, Duration::from_secs(10));
        assert_eq!(config.worker.max_tries, 4);
        assert!(config.logging.json_format);
    }

    #[test]
    fn test_env_override_rejects_bad_duration() {
        let result = QueueworkConfig::default().with_overrides(|key| {
            (key == "QUEUEWORK_WORKER_TIMEOUT").then(|| "soon".to_string())
        });
        assert!(matches!(result, Err(crate::QueueworkError::Config(_))));
    }

    #[test]
    fn test_env_override_rejects_bad_numbers() {
        for key in [
            "QUEUEWORK_WORKER_MEMORY",
            "QUEUEWORK_WORKER_TRIES",
            "QUEUEWORK_EVENT_BUFFER_SIZE",
        ] {
            let result = QueueworkConfig::default()
                .with_overrides(|k| (k == key).then(|| "lots".to_string()));
            assert!(
                matches!(result, Err(crate::QueueworkError::Config(ref message)) if message.contains(key)),
                "{}",
                key
            );
        }

        let config = QueueworkConfig::default()
            .with_overrides(|k| (k == "QUEUEWORK_WORKER_MEMORY").then(|| "256".to_string()))
            .unwrap();
        assert_eq!(config.worker.memory, 256);
    }

    #[test]
    fn test_duration_parsing() {
        let cases = [
            ("30", Duration::from_secs(30)),
            ("250ms", Duration::from_millis(250)),
            ("45s", Duration::from_secs(45)),
            ("5m", Duration::from_secs(300)),
            ("2h", Duration::from_secs(7200)),
            ("1d", Duration::from_secs(86400)),
        ];
        for (text, expected) in cases {
            assert_eq!(duration_secs::parse_duration(text), Ok(expected), "{}", text);
        }

        assert!(duration_secs::parse_duration("10w").is_err());
        assert!(duration_secs::parse_duration("s").is_err());
        assert!(duration_secs::parse_duration("").is_err());
    }
}
