//! Wire mapper for phone-auth peer-to-peer payloads (Signal-shaped
//! envelopes).
//!
//! The relay service wraps each delivery in an `envelope` with a sender
//! timestamp that doubles as the message identifier. A payload with no
//! timestamp and no source cannot produce a minimally valid event and is
//! dropped.

use serde_json::Value;

use super::{
    str_field, str_field_any, u64_field, AttachmentRef, CanonicalEvent, ConversationKind,
    ConversationRef, EventType, MessageBody, SenderRef,
};

/// Normalize one peer envelope.
pub fn normalize(payload: &Value) -> Option<CanonicalEvent> {
    let envelope = payload.get("envelope").unwrap_or(payload);

    let timestamp = str_field(envelope, "timestamp")?;
    let source = str_field_any(envelope, &["sourceNumber", "source"])?;

    let data_message = envelope
        .get("dataMessage")
        .or_else(|| envelope.get("data_message"))?;
    let text = str_field_any(data_message, &["message", "body"])?;

    let group_id = data_message
        .get("groupInfo")
        .or_else(|| data_message.get("group_info"))
        .and_then(|group| str_field_any(group, &["groupId", "id"]));

    let (conversation_id, kind) = match group_id {
        Some(group) => (group, ConversationKind::Group),
        None => (source.clone(), ConversationKind::Direct),
    };

    let attachments = data_message
        .get("attachments")
        .and_then(Value::as_array)
        .map(|entries| {
            entries
                .iter()
                .map(|entry| AttachmentRef {
                    id: str_field_any(entry, &["id", "attachmentId"]),
                    name: str_field(entry, "filename"),
                    content_type: str_field(entry, "contentType"),
                    url: None,
                    size: u64_field(entry, "size"),
                })
                .collect()
        })
        .unwrap_or_default();

    Some(CanonicalEvent {
        event_id: timestamp.clone(),
        synthetic_id: false,
        event_type: EventType::Message,
        change_type: None,
        action: None,
        conversation: ConversationRef {
            id: conversation_id,
            tenant_id: None,
            kind,
            thread_id: None,
        },
        sender: Some(SenderRef {
            id: source,
            display_name: str_field(envelope, "sourceName"),
        }),
        message: Some(MessageBody {
            id: Some(timestamp.clone()),
            text: Some(text),
            content_type: None,
            attachments,
            reactions: Vec::new(),
            mentions: Vec::new(),
        }),
        previous_message: None,
        raw_timestamp: Some(timestamp),
    })
}
