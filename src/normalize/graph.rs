//! Wire mapper for graph-API platforms (Teams-shaped message resources).
//!
//! Graph message resources arrive already scoped to a conversation (the
//! webhook notification or poll names the chat), so the caller passes the
//! conversation id alongside the resource payload.

use serde_json::Value;

use super::{
    str_field, str_field_any, u64_field, AttachmentRef, CanonicalEvent, ChangeType,
    ConversationKind, ConversationRef, EventType, MentionRef, MessageBody, ReactionRef, SenderRef,
};

/// Normalize one graph message resource delivered for `conversation_id`.
///
/// Returns `None` when the resource has no `id`.
pub fn normalize(
    conversation_id: &str,
    tenant_id: Option<&str>,
    payload: &Value,
) -> Option<CanonicalEvent> {
    if conversation_id.is_empty() {
        return None;
    }
    let event_id = str_field(payload, "id")?;

    let created = str_field(payload, "createdDateTime");
    let modified = str_field(payload, "lastModifiedDateTime");
    let deleted = str_field(payload, "deletedDateTime");

    let change_type = if deleted.is_some() {
        Some(ChangeType::Deleted)
    } else if modified.is_some() && modified != created {
        Some(ChangeType::Edited)
    } else {
        None
    };

    let message = if change_type == Some(ChangeType::Deleted) {
        MessageBody {
            id: Some(event_id.clone()),
            ..MessageBody::default()
        }
    } else {
        message_body(&event_id, payload)
    };

    Some(CanonicalEvent {
        event_id,
        synthetic_id: false,
        event_type: EventType::Message,
        change_type,
        action: None,
        conversation: ConversationRef {
            id: conversation_id.to_owned(),
            tenant_id: tenant_id.map(str::to_owned),
            kind: ConversationKind::Unknown,
            thread_id: str_field(payload, "replyToId"),
        },
        sender: sender_ref(payload),
        message: Some(message),
        // Graph does not deliver the pre-edit body; edits carry only the
        // new content.
        previous_message: None,
        raw_timestamp: created,
    })
}

fn sender_ref(payload: &Value) -> Option<SenderRef> {
    let user = payload.get("from")?.get("user")?;
    Some(SenderRef {
        id: str_field(user, "id")?,
        display_name: str_field(user, "displayName"),
    })
}

fn message_body(event_id: &str, payload: &Value) -> MessageBody {
    let body = payload.get("body");
    let text = body
        .and_then(|b| str_field(b, "content"))
        .or_else(|| str_field(payload, "summary"));
    let content_type = body.and_then(|b| str_field(b, "contentType"));

    let attachments = payload
        .get("attachments")
        .and_then(Value::as_array)
        .map(|entries| {
            entries
                .iter()
                .map(|entry| AttachmentRef {
                    id: str_field(entry, "id"),
                    name: str_field(entry, "name"),
                    content_type: str_field(entry, "contentType"),
                    url: str_field_any(entry, &["contentUrl", "thumbnailUrl"]),
                    size: u64_field(entry, "size"),
                })
                .collect()
        })
        .unwrap_or_default();

    let mentions = payload
        .get("mentions")
        .and_then(Value::as_array)
        .map(|entries| {
            entries
                .iter()
                .map(|entry| MentionRef {
                    id: entry
                        .get("mentioned")
                        .and_then(|m| m.get("user"))
                        .and_then(|u| str_field(u, "id")),
                    text: str_field(entry, "mentionText"),
                })
                .collect()
        })
        .unwrap_or_default();

    let reactions = payload
        .get("reactions")
        .and_then(Value::as_array)
        .map(|entries| {
            entries
                .iter()
                .filter_map(|entry| {
                    Some(ReactionRef {
                        key: str_field(entry, "reactionType")?,
                        count: None,
                        users: entry
                            .get("user")
                            .and_then(|u| u.get("user"))
                            .and_then(|u| str_field(u, "id"))
                            .into_iter()
                            .collect(),
                    })
                })
                .collect()
        })
        .unwrap_or_default();

    MessageBody {
        id: Some(event_id.to_owned()),
        text,
        content_type,
        attachments,
        reactions,
        mentions,
    }
}
