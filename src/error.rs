use thiserror::Error;

/// Message fragments emitted by database drivers and network stacks when the
/// backend connection has gone away. A worker that sees one of these stops
/// itself so its supervisor can restart it against a fresh connection.
const LOST_CONNECTION_MESSAGES: &[&str] = &[
    "server has gone away",
    "no connection to the server",
    "Lost connection",
    "is dead or not enabled",
    "Error while sending",
    "decryption failed or bad record mac",
    "server closed the connection unexpectedly",
    "SSL connection has been closed unexpectedly",
    "Error writing data to the connection",
    "Resource deadlock avoided",
    "child connection forced to terminate due to client_idle_limit",
    "query_wait_timeout",
    "reset by peer",
    "Physical connection is not usable",
    "Packets out of order",
    "Communication link failure",
    "connection is no longer usable",
    "Login timeout expired",
    "Connection refused",
    "The connection is broken and recovery is not possible",
    "Broken pipe",
    "Connection timed out",
];

#[derive(Error, Debug)]
pub enum QueueworkError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[cfg(feature = "redis")]
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Queue error: {message}")]
    Queue { message: String },

    #[error("Worker error: {message}")]
    Worker { message: String },

    #[error("Invalid job payload: {message}")]
    InvalidJobPayload { message: String },

    #[error("No handler registered for job [{name}]")]
    UnknownHandler { name: String },

    #[error("No command handler registered for [{name}]")]
    UnknownCommand { name: String },

    #[error("No query results for model [{model}]")]
    ModelNotFound { model: String },

    #[error("{job} has been attempted too many times or run too long. The job may have previously timed out.")]
    MaxAttemptsExceeded { job: String },

    #[error("{job} timed out after {seconds}s")]
    Timeout { job: String, seconds: u64 },

    #[error("Job handler error: {0}")]
    Handler(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl QueueworkError {
    /// Wrap any displayable error raised by a job handler.
    pub fn handler(error: impl std::fmt::Display) -> Self {
        QueueworkError::Handler(error.to_string())
    }

    /// Whether this error indicates the backend connection is gone.
    pub fn causes_lost_connection(&self) -> bool {
        match self {
            QueueworkError::Database(
                sqlx::Error::Io(_) | sqlx::Error::PoolClosed | sqlx::Error::PoolTimedOut,
            ) => true,
            #[cfg(feature = "redis")]
            QueueworkError::Redis(e)
                if e.is_connection_dropped() || e.is_io_error() || e.is_connection_refusal() =>
            {
                true
            }
            QueueworkError::Io(e)
                if matches!(
                    e.kind(),
                    std::io::ErrorKind::BrokenPipe
                        | std::io::ErrorKind::ConnectionReset
                        | std::io::ErrorKind::ConnectionAborted
                        | std::io::ErrorKind::NotConnected
                ) =>
            {
                true
            }
            _ => message_signals_lost_connection(&self.to_string()),
        }
    }
}

fn message_signals_lost_connection(message: &str) -> bool {
    LOST_CONNECTION_MESSAGES
        .iter()
        .any(|needle| message.contains(needle))
}

impl From<toml::de::Error> for QueueworkError {
    fn from(err: toml::de::Error) -> Self {
        QueueworkError::Config(format!("TOML deserialization error: {}", err))
    }
}

impl From<toml::ser::Error> for QueueworkError {
    fn from(err: toml::ser::Error) -> Self {
        QueueworkError::Config(format!("TOML serialization error: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let queue_error = QueueworkError::Queue {
            message: "Test queue error".to_string(),
        };
        assert_eq!(queue_error.to_string(), "Queue error: Test queue error");

        let missing = QueueworkError::ModelNotFound {
            model: "User".to_string(),
        };
        assert_eq!(missing.to_string(), "No query results for model [User]");

        let exhausted = QueueworkError::MaxAttemptsExceeded {
            job: "send_email".to_string(),
        };
        assert!(exhausted.to_string().starts_with("send_email has been attempted"));
    }

    #[test]
    fn test_error_from_serde_json() {
        let json_error = serde_json::from_str::<serde_json::Value>("invalid json");
        assert!(json_error.is_err());

        let error: QueueworkError = json_error.unwrap_err().into();
        assert!(matches!(error, QueueworkError::Serialization(_)));
    }

    #[test]
    fn test_lost_connection_from_message() {
        let error = QueueworkError::handler("SQLSTATE[HY000]: General error: 2006 MySQL server has gone away");
        assert!(error.causes_lost_connection());

        let error = QueueworkError::handler("Connection refused (os error 111)");
        assert!(error.causes_lost_connection());

        let error = QueueworkError::handler("invalid recipient address");
        assert!(!error.causes_lost_connection());
    }

    #[test]
    fn test_lost_connection_from_typed_errors() {
        assert!(QueueworkError::Database(sqlx::Error::PoolClosed).causes_lost_connection());
        assert!(!QueueworkError::Database(sqlx::Error::RowNotFound).causes_lost_connection());

        let reset = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "peer");
        assert!(QueueworkError::Io(reset).causes_lost_connection());

        let missing = std::io::Error::new(std::io::ErrorKind::NotFound, "file");
        assert!(!QueueworkError::Io(missing).causes_lost_connection());
    }

    #[test]
    fn test_exhaustion_is_not_a_lost_connection() {
        let error = QueueworkError::MaxAttemptsExceeded {
            job: "report".to_string(),
        };
        assert!(!error.causes_lost_connection());
    }
}
