//! The serialized description of work stored with every job.
//!
//! A payload is a JSON object whose key names are shared by every backend:
//!
//! ```json
//! {
//!   "displayName": "send_welcome_email",
//!   "job": "queuework::CallQueuedHandler@call",
//!   "maxTries": 3,
//!   "timeout": 120,
//!   "timeoutAt": null,
//!   "data": { "commandName": "send_welcome_email", "command": "{\"user_id\":7}" }
//! }
//! ```
//!
//! The Redis backend additionally stores `id` and `attempts` inside the payload.
//! Keys this crate does not know about are preserved so that payloads written
//! by other producers survive a decode/encode cycle unchanged.

use crate::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Payload {
    /// Human-readable name used in logs and events
    pub display_name: String,
    /// Reference of the handler registered in the [`crate::HandlerRegistry`]
    pub job: String,
    /// Attempt cap for this job; `None` defers to the worker default, `0` is unlimited
    pub max_tries: Option<u32>,
    /// Per-job timeout in seconds
    pub timeout: Option<u64>,
    /// Unix timestamp after which the job must not be attempted again
    pub timeout_at: Option<i64>,
    /// Handler arguments
    pub data: Value,
    /// Backend-assigned identifier (Redis only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Reservation count (Redis only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempts: Option<u32>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Payload {
    pub fn new(job: impl Into<String>, data: Value) -> Self {
        let job = job.into();
        Self {
            display_name: job.clone(),
            job,
            max_tries: None,
            timeout: None,
            timeout_at: None,
            data,
            id: None,
            attempts: None,
            extra: Map::new(),
        }
    }

    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = name.into();
        self
    }

    pub fn with_max_tries(mut self, max_tries: u32) -> Self {
        self.max_tries = Some(max_tries);
        self
    }

    pub fn with_timeout(mut self, seconds: u64) -> Self {
        self.timeout = Some(seconds);
        self
    }

    /// Stop attempting the job once `deadline` has passed.
    pub fn retry_until(mut self, deadline: DateTime<Utc>) -> Self {
        self.timeout_at = Some(deadline.timestamp());
        self
    }

    pub fn decode(raw: &str) -> Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }

    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Whether `timeout_at` is set and not later than `now` (unix seconds).
    pub fn deadline_passed(&self, now: i64) -> bool {
        self.timeout_at.is_some_and(|at| at <= now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_wire_field_names() {
        let payload = Payload::new("reports", json!({"month": 3}))
            .with_max_tries(5)
            .with_timeout(90);
        let value: Value = serde_json::from_str(&payload.encode().unwrap()).unwrap();

        assert_eq!(value["displayName"], "reports");
        assert_eq!(value["job"], "reports");
        assert_eq!(value["maxTries"], 5);
        assert_eq!(value["timeout"], 90);
        assert!(value["timeoutAt"].is_null());
        assert_eq!(value["data"]["month"], 3);
        assert!(value.get("id").is_none());
        assert!(value.get("attempts").is_none());
    }

    #[test]
    fn test_unknown_keys_survive_decode() {
        let raw = r#"{"displayName":"x","job":"x","maxTries":null,"timeout":null,"timeoutAt":null,"data":{},"uuid":"abc","tags":["a"]}"#;
        let payload = Payload::decode(raw).unwrap();
        assert_eq!(payload.extra["uuid"], "abc");

        let again = Payload::decode(&payload.encode().unwrap()).unwrap();
        assert_eq!(again, payload);
    }

    #[test]
    fn test_missing_nullable_fields_default_to_none() {
        let payload = Payload::decode(r#"{"displayName":"x","job":"x","data":null}"#).unwrap();
        assert_eq!(payload.max_tries, None);
        assert_eq!(payload.timeout_at, None);
    }

    #[test]
    fn test_deadline_passed() {
        let now = Utc::now();
        let payload = Payload::new("x", Value::Null).retry_until(now);
        assert!(payload.deadline_passed(now.timestamp()));
        assert!(!payload.deadline_passed(now.timestamp() - 1));
        assert!(!Payload::new("x", Value::Null).deadline_passed(now.timestamp()));
    }
}
