//! Wire mapper for long-poll messenger updates (Telegram-shaped payloads).
//!
//! Updates wrap the message under `message`, `edited_message`,
//! `channel_post` or `edited_channel_post`. This is the one family where a
//! payload can be otherwise valid yet carry no usable identifier (some
//! service updates), so it is also the only family that falls back to a
//! locally generated id — marked `synthetic_id` and logged.

use serde_json::Value;

use super::{
    resolve_event_id, str_field, synthetic_event_id, AttachmentRef, CanonicalEvent, ChangeType,
    ConversationKind, ConversationRef, EventType, MessageBody, SenderRef,
};

/// Normalize one update payload.
///
/// Returns `None` when no message object or no chat reference is present.
pub fn normalize(payload: &Value) -> Option<CanonicalEvent> {
    let (message, change_type) = extract_message(payload)?;
    let chat = message.get("chat")?;
    let chat_id = str_field(chat, "id")?;

    let (event_id, synthetic_id) = match resolve_event_id(&[
        str_field(payload, "update_id"),
        str_field(message, "message_id"),
    ]) {
        Some(id) => (id, false),
        None => (synthetic_event_id("update"), true),
    };

    let kind = match str_field(chat, "type").as_deref() {
        Some("private") => ConversationKind::Direct,
        Some("group" | "supergroup") => ConversationKind::Group,
        Some("channel") => ConversationKind::Channel,
        _ => ConversationKind::Unknown,
    };

    let thread_id = message
        .get("reply_to_message")
        .and_then(|reply| str_field(reply, "message_id"));

    Some(CanonicalEvent {
        event_id,
        synthetic_id,
        event_type: EventType::Message,
        change_type,
        action: None,
        conversation: ConversationRef {
            id: chat_id,
            tenant_id: None,
            kind,
            thread_id,
        },
        sender: sender_ref(message),
        message: Some(message_body(message)),
        // The wire carries only the edited body, not the previous one.
        previous_message: None,
        raw_timestamp: str_field(message, "date"),
    })
}

fn extract_message(payload: &Value) -> Option<(&Value, Option<ChangeType>)> {
    if let Some(message) = payload.get("message") {
        return Some((message, None));
    }
    if let Some(message) = payload.get("edited_message") {
        return Some((message, Some(ChangeType::Edited)));
    }
    if let Some(message) = payload.get("channel_post") {
        return Some((message, None));
    }
    if let Some(message) = payload.get("edited_channel_post") {
        return Some((message, Some(ChangeType::Edited)));
    }
    None
}

fn sender_ref(message: &Value) -> Option<SenderRef> {
    let from = message.get("from")?;
    Some(SenderRef {
        id: str_field(from, "id")?,
        display_name: str_field(from, "first_name"),
    })
}

fn message_body(message: &Value) -> MessageBody {
    let mut attachments = Vec::new();

    if let Some(document) = message.get("document") {
        attachments.push(AttachmentRef {
            id: str_field(document, "file_id"),
            name: str_field(document, "file_name"),
            content_type: str_field(document, "mime_type"),
            url: None,
            size: super::u64_field(document, "file_size"),
        });
    }

    if let Some(photos) = message.get("photo").and_then(Value::as_array) {
        // Telegram sends one entry per resolution; keep the largest (last).
        if let Some(photo) = photos.last() {
            attachments.push(AttachmentRef {
                id: str_field(photo, "file_id"),
                name: None,
                content_type: Some("image/jpeg".to_owned()),
                url: None,
                size: super::u64_field(photo, "file_size"),
            });
        }
    }

    MessageBody {
        id: str_field(message, "message_id"),
        text: str_field(message, "text").or_else(|| str_field(message, "caption")),
        content_type: None,
        attachments,
        reactions: Vec::new(),
        mentions: Vec::new(),
    }
}
