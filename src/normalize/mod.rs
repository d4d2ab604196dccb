//! Canonical event model and the per-platform wire mappers.
//!
//! Each platform family gets one pure mapping function from its wire payload
//! (`serde_json::Value`, keys frequently absent or under alternate names)
//! into [`CanonicalEvent`]. Mappers never panic on missing optional fields;
//! a payload lacking the fields required for a minimally valid event (an id
//! candidate, a conversation reference) is dropped by returning `None`, and
//! the caller counts the skip.

pub mod graph;
pub mod peer;
pub mod realtime;
pub mod update;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

/// Classification of an inbound event.
///
/// Unknown or absent wire discriminators map to [`EventType::Message`]
/// rather than dropping the event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    /// A chat message (including edits and deletes, see
    /// [`CanonicalEvent::change_type`]).
    Message,
    /// An emoji reaction added to or removed from a message.
    Reaction,
    /// A member joined or left a conversation.
    Membership,
}

/// How an already-delivered message changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeType {
    /// The message body was edited.
    Edited,
    /// The message was deleted.
    Deleted,
}

/// Direction of a reaction event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReactionAction {
    /// The reaction was added.
    Added,
    /// The reaction was removed.
    Removed,
}

/// Conversation shape, as far as the wire payload reveals it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationKind {
    /// One-to-one conversation.
    Direct,
    /// Named channel.
    Channel,
    /// Multi-party group chat.
    Group,
    /// The payload did not reveal the shape.
    Unknown,
}

/// Reference to the conversation an event belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationRef {
    /// Platform conversation identifier.
    pub id: String,
    /// Owning tenant / workspace / team, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,
    /// Conversation shape.
    pub kind: ConversationKind,
    /// Thread the event belongs to, when threaded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
}

/// The author of a message or reaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SenderRef {
    /// Platform user identifier.
    pub id: String,
    /// Display name, when the payload carries one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
}

/// A file or media reference attached to a message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentRef {
    /// Platform attachment identifier.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// File name or fallback description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// MIME type, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    /// Download or permalink URL, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Size in bytes, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
}

/// An aggregated reaction on a message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReactionRef {
    /// Reaction key (emoji name or platform reaction type).
    pub key: String,
    /// Number of users reacting, when aggregated.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count: Option<u64>,
    /// Reacting user ids, when listed.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub users: Vec<String>,
}

/// A user mention inside a message body.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MentionRef {
    /// Mentioned user id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Literal mention text.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

/// Normalized message body.
///
/// Optional nested structures are omitted from serialized output when
/// empty — never emitted as empty placeholders.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageBody {
    /// Platform message identifier.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Text content; empty for deletes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    /// Body content type (`text`, `html`), when the platform distinguishes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    /// Attached files and media.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<AttachmentRef>,
    /// Aggregated reactions.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub reactions: Vec<ReactionRef>,
    /// User mentions.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mentions: Vec<MentionRef>,
}

impl MessageBody {
    /// Whether every field is absent or empty.
    pub fn is_empty(&self) -> bool {
        self.id.is_none()
            && self.text.is_none()
            && self.content_type.is_none()
            && self.attachments.is_empty()
            && self.reactions.is_empty()
            && self.mentions.is_empty()
    }
}

/// The platform-agnostic normalized representation of an inbound chat
/// event.
///
/// `event_id` is stable across redelivery of the same wire payload except
/// when `synthetic_id` is set — the documented weak point where no
/// platform-provided identifier could be resolved.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalEvent {
    /// Idempotency-safe event identifier.
    pub event_id: String,
    /// Set when `event_id` was generated locally because the payload
    /// carried no resolvable identifier. Such events are not idempotent
    /// across redelivery.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub synthetic_id: bool,
    /// Event classification.
    pub event_type: EventType,
    /// Edit/delete marker for message events.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub change_type: Option<ChangeType>,
    /// Added/removed marker for reaction events.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<ReactionAction>,
    /// The conversation this event belongs to.
    pub conversation: ConversationRef,
    /// The acting user.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<SenderRef>,
    /// The message body, when the event carries one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<MessageBody>,
    /// For edits: the message body before the change, when available.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_message: Option<MessageBody>,
    /// The platform's own timestamp string, unparsed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_timestamp: Option<String>,
}

// ---------------------------------------------------------------------------
// Shared helpers for the wire mappers
// ---------------------------------------------------------------------------

/// Look up a string field, accepting numbers by stringifying them.
pub(crate) fn str_field(value: &Value, key: &str) -> Option<String> {
    match value.get(key)? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Look up the first present string field among alternate key names.
pub(crate) fn str_field_any(value: &Value, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|key| str_field(value, key))
}

/// Resolve an event id from an ordered candidate list.
pub(crate) fn resolve_event_id(candidates: &[Option<String>]) -> Option<String> {
    candidates.iter().flatten().next().cloned()
}

/// Generate a last-resort local event id and log the degradation.
///
/// Redelivering the same payload will yield a different id, so events
/// built this way carry `synthetic_id = true`.
pub(crate) fn synthetic_event_id(family: &str) -> String {
    warn!(family, "no resolvable event id in payload, generating local id");
    format!("local-{}", chrono::Utc::now().timestamp_millis())
}

/// Parse a `u64` from either a JSON number or a numeric string.
pub(crate) fn u64_field(value: &Value, key: &str) -> Option<u64> {
    match value.get(key)? {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}
