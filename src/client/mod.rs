//! The protocol client contract every platform adapter implements.
//!
//! One concrete client per platform; all of them share the same state
//! machine (`Disconnected -> Connecting -> Connected -> Disconnected`), the
//! same delivery tracking and the same handler registry, provided by
//! [`core::ClientRuntime`]. The platform modules supply only the wire-level
//! mapping.

pub mod core;
pub mod handlers;
pub mod tracker;

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;

use crate::normalize::CanonicalEvent;
use crate::refresh::RefreshError;
use crate::session::Token;

pub use handlers::{HandlerId, HandlerSet};
pub use tracker::{DeliveryTracker, TrackerSnapshot};

/// Errors surfaced by protocol clients.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// The platform rejected the supplied credentials at connect time.
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    /// The platform invalidated the session mid-operation; the caller must
    /// evict the client and require a re-link.
    #[error("session revoked by the platform")]
    SessionRevoked,

    /// The token expired and no refresh secret is available.
    #[error("token expired with no refresh secret")]
    TokenExpiredNoRefresh,

    /// The operation requires a connected client.
    #[error("client is not connected")]
    NotConnected,

    /// Network-level failure talking to the platform.
    #[error("transport failure: {0}")]
    Transport(String),

    /// HTTP request failed before producing a platform response.
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The platform API returned an error response.
    #[error("platform API error: {0}")]
    Api(String),

    /// A proactive credential refresh failed; the token is unchanged.
    #[error(transparent)]
    Refresh(#[from] RefreshError),

    /// The platform returned a payload this client cannot decode.
    #[error("malformed platform payload: {0}")]
    Decode(#[from] serde_json::Error),

    /// The requested operation is not supported by this platform.
    #[error("unsupported operation: {0}")]
    Unsupported(&'static str),
}

/// Connection lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// No live transport; the initial and final state.
    Disconnected,
    /// `connect` is in progress (identity discovery not yet complete).
    Connecting,
    /// Identity discovered and delivery mechanism running.
    Connected,
}

/// Tenant / workspace / homeserver metadata behind an account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, serde::Deserialize)]
pub struct Tenant {
    /// Stable tenant identifier.
    pub id: String,
    /// Human-readable tenant name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Tenant domain, when the platform exposes one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
}

/// The authenticated principal discovered at connect time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, serde::Deserialize)]
pub struct Identity {
    /// Platform-scoped user identifier.
    pub user_id: String,
    /// Display name, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    /// Reachable address: email, phone number or principal name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    /// Owning tenant, for platforms that have one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant: Option<Tenant>,
}

/// Static feature flags for a connected client.
///
/// Computed once during `connect` and cached for the life of the
/// connection.
#[derive(Debug, Clone, Default, Serialize, serde::Deserialize)]
pub struct Capabilities {
    /// Plain text messaging.
    pub text: bool,
    /// Message edits relayed as first-class events.
    pub edits: bool,
    /// Message deletes relayed as first-class events.
    pub deletes: bool,
    /// Emoji reactions.
    pub reactions: bool,
    /// Threaded replies.
    pub threads: bool,
    /// Typing indicators.
    pub typing: bool,
    /// Read receipts / platform-level acknowledgements.
    pub read_receipts: bool,
    /// Attachment kinds accepted by `send_message`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachment_kinds: Vec<String>,
}

/// Outbound message content.
///
/// At least one of `text`, `html` or `card` should be present. Rich content
/// is sanitized by the client before it reaches the platform.
#[derive(Debug, Clone, Default)]
pub struct OutboundContent {
    /// Plain text body.
    pub text: Option<String>,
    /// Rich HTML body; passed through the allow-list sanitizer.
    pub html: Option<String>,
    /// Structured card / block content; sanitized recursively.
    pub card: Option<Value>,
    /// Thread to reply into, when the platform supports threading.
    pub thread: Option<String>,
}

/// An outbound attachment.
#[derive(Debug, Clone)]
pub struct OutboundAttachment {
    /// File name presented to the platform.
    pub filename: String,
    /// MIME type, when known.
    pub content_type: Option<String>,
    /// Raw file bytes.
    pub bytes: Vec<u8>,
    /// Optional human-readable title.
    pub title: Option<String>,
}

impl OutboundAttachment {
    /// Parse an attachment from a queue payload entry.
    ///
    /// Accepts `{ "data": <base64>, "filename"/"name", "content_type"/
    /// "mime_type", "title" }`; a `data` value that is not valid base64 is
    /// treated as raw UTF-8 content. Returns `None` when no data is
    /// present.
    pub fn from_value(value: &Value) -> Option<Self> {
        use base64::Engine as _;

        let raw = value.get("data").and_then(Value::as_str)?;
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(raw)
            .unwrap_or_else(|_| raw.as_bytes().to_vec());

        let filename = ["filename", "name"]
            .iter()
            .find_map(|key| value.get(*key).and_then(Value::as_str))
            .unwrap_or("attachment.bin")
            .to_owned();
        let content_type = ["content_type", "mime_type"]
            .iter()
            .find_map(|key| value.get(*key).and_then(Value::as_str))
            .map(str::to_owned);
        let title = value
            .get("title")
            .and_then(Value::as_str)
            .map(str::to_owned);

        Some(Self {
            filename,
            content_type,
            bytes,
            title,
        })
    }
}

/// Identifier assigned by the platform to one uploaded attachment.
#[derive(Debug, Clone, Serialize)]
pub struct AttachmentReceipt {
    /// Platform attachment/file id.
    pub id: String,
    /// Permalink to the uploaded file, when returned.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

/// Result of a successful `send_message`.
#[derive(Debug, Clone, Serialize)]
pub struct SendReceipt {
    /// Conversation the message was delivered to.
    pub conversation_id: String,
    /// Platform message identifier, when returned.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    /// Platform timestamp of the delivered message, when returned.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    /// One receipt per uploaded attachment, in input order.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<AttachmentReceipt>,
}

/// Operational introspection for one client.
///
/// Used by `health_snapshot` aggregation, never for routing decisions.
#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    /// Whether the client is in the `Connected` state.
    pub connected: bool,
    /// Current lifecycle state.
    pub state: ConnectionState,
    /// Registered event handlers.
    pub handler_count: usize,
    /// Dispatched events awaiting acknowledgement.
    pub pending_events: usize,
    /// Age in seconds of the oldest unacknowledged event.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub oldest_pending_age_secs: Option<u64>,
    /// Most recently dispatched event id.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_event_id: Option<String>,
    /// Seconds since the most recent dispatch.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_event_age_secs: Option<u64>,
    /// Most recently acknowledged event id.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_ack_event_id: Option<String>,
    /// Dispatch-to-ack latency in seconds of the last acknowledgement.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_ack_latency_secs: Option<f64>,
    /// Consecutive background-loop failures since the last success.
    pub consecutive_errors: u64,
    /// Inflight entries dropped by capacity or age trimming.
    pub dropped_events: u64,
    /// Wire payloads skipped by normalization.
    pub skipped_payloads: u64,
    /// Active webhook subscription id, for webhook-delivery clients.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subscription_id: Option<String>,
}

/// Async callback invoked for every canonical event a client dispatches.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Handle one canonical event.
    async fn on_event(&self, event: CanonicalEvent);
}

/// The contract every platform adapter implements.
///
/// Clients are cheap handles over shared state: they are held behind `Arc`
/// by the session manager and may be called concurrently. Exactly one
/// delivery mechanism (poll loop, socket reader or webhook subscription)
/// runs per connected client.
#[async_trait]
pub trait ProtocolClient: Send + Sync {
    /// Connect with the given token.
    ///
    /// Performs identity discovery before the state becomes `Connected`, so
    /// [`fetch_identity`](Self::fetch_identity) afterwards is a cache read.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::AuthenticationFailed`] on rejected
    /// credentials, transport errors otherwise.
    async fn connect(&self, token: &Token) -> Result<(), ClientError>;

    /// Disconnect, cancelling background work and awaiting its termination
    /// before closing transport resources. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns an error only when transport teardown fails; the client is
    /// left in `Disconnected` regardless.
    async fn disconnect(&self) -> Result<(), ClientError>;

    /// Whether the client is currently connected.
    async fn is_connected(&self) -> bool;

    /// The authenticated principal, discovered at connect time.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::NotConnected`] before a successful connect.
    async fn fetch_identity(&self) -> Result<Identity, ClientError>;

    /// Static feature flags, cached for the life of the connection.
    async fn describe_capabilities(&self) -> Capabilities;

    /// Snapshot of the account's contacts / members.
    ///
    /// Walks pagination cursors transparently and returns the fully
    /// materialized sequence.
    ///
    /// # Errors
    ///
    /// Propagates transport and authentication errors.
    async fn list_members(&self) -> Result<Vec<Value>, ClientError>;

    /// Snapshot of the account's conversations.
    ///
    /// Walks pagination cursors transparently and returns the fully
    /// materialized sequence.
    ///
    /// # Errors
    ///
    /// Propagates transport and authentication errors.
    async fn list_conversations(&self) -> Result<Vec<Value>, ClientError>;

    /// Send a message, uploading attachments first where required.
    ///
    /// # Errors
    ///
    /// Propagates transport and authentication errors;
    /// [`ClientError::SessionRevoked`] signals the caller to evict this
    /// client and force a re-link.
    async fn send_message(
        &self,
        conversation: &str,
        content: &OutboundContent,
        attachments: &[OutboundAttachment],
    ) -> Result<SendReceipt, ClientError>;

    /// Register an event handler. Multiple handlers may coexist; dispatch is
    /// sequential per event in registration order.
    async fn add_event_handler(&self, handler: std::sync::Arc<dyn EventHandler>) -> HandlerId;

    /// Remove a previously registered handler.
    ///
    /// Removing the last handler on a poll-delivery client stops its poll
    /// loop rather than leaving it idling.
    async fn remove_event_handler(&self, id: HandlerId);

    /// Acknowledge a dispatched event: removes it from the inflight map,
    /// records ack latency and informs the platform where its protocol
    /// supports acknowledgements.
    ///
    /// # Errors
    ///
    /// Propagates platform acknowledgement failures; unknown event ids are
    /// not an error.
    async fn acknowledge_event(&self, event_id: &str) -> Result<(), ClientError>;

    /// Operational health snapshot.
    async fn health(&self) -> HealthSnapshot;
}

/// Convert a [`TrackerSnapshot`] plus client state into a [`HealthSnapshot`].
pub(crate) fn health_from_parts(
    state: ConnectionState,
    handler_count: usize,
    tracker: &TrackerSnapshot,
    subscription_id: Option<String>,
) -> HealthSnapshot {
    HealthSnapshot {
        connected: state == ConnectionState::Connected,
        state,
        handler_count,
        pending_events: tracker.pending_events,
        oldest_pending_age_secs: tracker.oldest_pending_age.map(|age| age.as_secs()),
        last_event_id: tracker.last_event_id.clone(),
        last_event_age_secs: tracker.last_event_age.map(|age| age.as_secs()),
        last_ack_event_id: tracker.last_ack_event_id.clone(),
        last_ack_latency_secs: tracker.last_ack_latency.as_ref().map(Duration::as_secs_f64),
        consecutive_errors: tracker.consecutive_errors,
        dropped_events: tracker.dropped_events,
        skipped_payloads: tracker.skipped_payloads,
        subscription_id,
    }
}
