//! Canonical StoneMQ queue envelope.
//!
//! The envelope is the contract shared with the Elixir ServiceBridge and the
//! other bridge SDKs: every message published to or consumed from the queue
//! is one of these, JSON-encoded. This crate does not own the queue
//! transport, only the envelope shape and topic naming.

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Schema identifier stamped on every envelope.
pub const DEFAULT_SCHEMA: &str = "msgr.bridge.v1";

/// Errors from envelope construction or decoding.
#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    /// The `service` field was empty.
    #[error("service must not be empty")]
    EmptyService,

    /// The `action` field was empty.
    #[error("action must not be empty")]
    EmptyAction,

    /// The raw bytes were not a valid JSON envelope.
    #[error("invalid envelope JSON: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Canonical queue envelope shared across the Msgr bridge ecosystem.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    /// Envelope schema version.
    #[serde(default = "default_schema")]
    pub schema: String,

    /// Originating service, e.g. `slack` or `teams`.
    pub service: String,

    /// Queue action name, e.g. `inbound_event`.
    pub action: String,

    /// Correlation id propagated across services.
    #[serde(default = "new_trace_id")]
    pub trace_id: String,

    /// When the event occurred, truncated to millisecond precision.
    #[serde(default = "now_millis")]
    pub occurred_at: DateTime<Utc>,

    /// Routing hints: user, tenant and instance identifiers.
    #[serde(default)]
    pub metadata: Map<String, Value>,

    /// Action-specific body.
    #[serde(default)]
    pub payload: Map<String, Value>,
}

fn default_schema() -> String {
    DEFAULT_SCHEMA.to_owned()
}

fn new_trace_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

fn now_millis() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(3)
}

impl Envelope {
    /// Build an envelope with a fresh trace id and the current timestamp.
    ///
    /// # Errors
    ///
    /// Returns an error when `service` or `action` is empty.
    pub fn new(
        service: impl Into<String>,
        action: impl Into<String>,
        payload: Map<String, Value>,
    ) -> Result<Self, EnvelopeError> {
        let service = service.into();
        let action = action.into();
        if service.is_empty() {
            return Err(EnvelopeError::EmptyService);
        }
        if action.is_empty() {
            return Err(EnvelopeError::EmptyAction);
        }
        Ok(Self {
            schema: default_schema(),
            service,
            action,
            trace_id: new_trace_id(),
            occurred_at: now_millis(),
            metadata: Map::new(),
            payload,
        })
    }

    /// Attach routing metadata, replacing any existing entry for the key.
    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Serialize to the JSON wire format.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload cannot be serialized.
    pub fn to_json(&self) -> Result<String, EnvelopeError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decode an envelope from raw JSON, truncating `occurred_at` to
    /// millisecond precision.
    ///
    /// # Errors
    ///
    /// Returns an error on malformed JSON or empty service/action fields.
    pub fn from_json(raw: &str) -> Result<Self, EnvelopeError> {
        let mut envelope: Self = serde_json::from_str(raw)?;
        if envelope.service.is_empty() {
            return Err(EnvelopeError::EmptyService);
        }
        if envelope.action.is_empty() {
            return Err(EnvelopeError::EmptyAction);
        }
        envelope.occurred_at = envelope.occurred_at.trunc_subsecs(3);
        Ok(envelope)
    }
}

/// Topic for a service-wide action: `bridge/{service}/{action}`.
pub fn topic_for(service: &str, action: &str) -> String {
    format!("bridge/{service}/{action}")
}

/// Topic scoped to one bridge instance:
/// `bridge/{service}/{instance}/{action}`.
pub fn topic_for_instance(service: &str, instance: &str, action: &str) -> String {
    format!("bridge/{service}/{instance}/{action}")
}
