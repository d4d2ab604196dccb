//! Wire mapper for realtime-socket platforms (Slack-shaped payloads).
//!
//! Accepts either a full event-callback envelope (`{"type": "event_callback",
//! "team": ..., "event": {...}}`) or a bare `{"event": {...}}` wrapper, the
//! two shapes the socket delivers.

use serde_json::Value;

use super::{
    resolve_event_id, str_field, str_field_any, u64_field, AttachmentRef, CanonicalEvent,
    ChangeType, ConversationKind, ConversationRef, EventType, MentionRef, MessageBody,
    ReactionAction, ReactionRef, SenderRef,
};

/// Normalize one realtime payload.
///
/// Returns `None` when the payload lacks an id candidate or a conversation
/// reference.
pub fn normalize(payload: &Value) -> Option<CanonicalEvent> {
    let event = payload.get("event").unwrap_or(payload);
    let team_id = str_field(payload, "team").or_else(|| str_field(event, "team"));

    match str_field(event, "type").as_deref() {
        Some("reaction_added") => normalize_reaction(event, team_id, ReactionAction::Added),
        Some("reaction_removed") => normalize_reaction(event, team_id, ReactionAction::Removed),
        // Unknown discriminators degrade to a generic message rather than
        // dropping the event.
        _ => normalize_message(event, team_id),
    }
}

fn normalize_message(event: &Value, team_id: Option<String>) -> Option<CanonicalEvent> {
    match str_field(event, "subtype").as_deref() {
        Some("message_changed") => normalize_edit(event, team_id),
        Some("message_deleted") => normalize_delete(event, team_id),
        _ => normalize_plain_message(event, team_id),
    }
}

fn normalize_plain_message(event: &Value, team_id: Option<String>) -> Option<CanonicalEvent> {
    let conversation = conversation_ref(event, team_id)?;
    let event_id = resolve_event_id(&[
        str_field(event, "event_ts"),
        str_field(event, "ts"),
        str_field(event, "client_msg_id"),
    ])?;

    let body = message_body(event);
    Some(CanonicalEvent {
        event_id,
        synthetic_id: false,
        event_type: EventType::Message,
        change_type: None,
        action: None,
        conversation,
        sender: sender_ref(event, "user"),
        message: Some(body),
        previous_message: None,
        raw_timestamp: str_field_any(event, &["event_ts", "ts"]),
    })
}

fn normalize_edit(event: &Value, team_id: Option<String>) -> Option<CanonicalEvent> {
    let conversation = conversation_ref(event, team_id)?;
    let current = event.get("message")?;
    let event_id = resolve_event_id(&[
        str_field(event, "event_ts"),
        str_field(current, "ts"),
        str_field(event, "ts"),
    ])?;

    let previous = event
        .get("previous_message")
        .map(message_body)
        .filter(|body| !body.is_empty());

    Some(CanonicalEvent {
        event_id,
        synthetic_id: false,
        event_type: EventType::Message,
        change_type: Some(ChangeType::Edited),
        action: None,
        conversation,
        sender: sender_ref(current, "user"),
        message: Some(message_body(current)),
        previous_message: previous,
        raw_timestamp: str_field_any(event, &["event_ts", "ts"]),
    })
}

fn normalize_delete(event: &Value, team_id: Option<String>) -> Option<CanonicalEvent> {
    let conversation = conversation_ref(event, team_id)?;
    let deleted_ts = str_field(event, "deleted_ts");
    let event_id = resolve_event_id(&[
        str_field(event, "event_ts"),
        deleted_ts.clone(),
        str_field(event, "ts"),
    ])?;

    // A delete carries the deleted-message id and an empty body.
    Some(CanonicalEvent {
        event_id,
        synthetic_id: false,
        event_type: EventType::Message,
        change_type: Some(ChangeType::Deleted),
        action: None,
        conversation,
        sender: None,
        message: Some(MessageBody {
            id: deleted_ts,
            ..MessageBody::default()
        }),
        previous_message: None,
        raw_timestamp: str_field_any(event, &["event_ts", "ts"]),
    })
}

fn normalize_reaction(
    event: &Value,
    team_id: Option<String>,
    action: ReactionAction,
) -> Option<CanonicalEvent> {
    let item = event.get("item")?;
    let channel = str_field(item, "channel")?;
    let event_id = resolve_event_id(&[str_field(event, "event_ts"), str_field(item, "ts")])?;
    let key = str_field(event, "reaction")?;

    Some(CanonicalEvent {
        event_id,
        synthetic_id: false,
        event_type: EventType::Reaction,
        change_type: None,
        action: Some(action),
        conversation: ConversationRef {
            id: channel,
            tenant_id: team_id,
            kind: ConversationKind::Unknown,
            thread_id: None,
        },
        sender: sender_ref(event, "user"),
        message: Some(MessageBody {
            id: str_field(item, "ts"),
            reactions: vec![ReactionRef {
                key,
                count: None,
                users: Vec::new(),
            }],
            ..MessageBody::default()
        }),
        previous_message: None,
        raw_timestamp: str_field(event, "event_ts"),
    })
}

fn conversation_ref(event: &Value, team_id: Option<String>) -> Option<ConversationRef> {
    let id = str_field(event, "channel")?;
    let kind = match str_field(event, "channel_type").as_deref() {
        Some("im") => ConversationKind::Direct,
        Some("channel") => ConversationKind::Channel,
        Some("group" | "mpim") => ConversationKind::Group,
        _ => ConversationKind::Unknown,
    };
    Some(ConversationRef {
        id,
        tenant_id: team_id,
        kind,
        thread_id: str_field(event, "thread_ts"),
    })
}

fn sender_ref(value: &Value, key: &str) -> Option<SenderRef> {
    Some(SenderRef {
        id: str_field(value, key)?,
        display_name: None,
    })
}

fn message_body(event: &Value) -> MessageBody {
    let mut attachments: Vec<AttachmentRef> = Vec::new();

    if let Some(files) = event.get("files").and_then(Value::as_array) {
        for file in files {
            attachments.push(AttachmentRef {
                id: str_field(file, "id"),
                name: str_field(file, "name"),
                content_type: str_field(file, "mimetype"),
                url: str_field_any(file, &["permalink", "url_private"]),
                size: u64_field(file, "size"),
            });
        }
    }

    if let Some(legacy) = event.get("attachments").and_then(Value::as_array) {
        for attachment in legacy {
            attachments.push(AttachmentRef {
                id: str_field(attachment, "id"),
                name: str_field_any(attachment, &["title", "fallback"]),
                content_type: None,
                url: str_field_any(attachment, &["image_url", "from_url"]),
                size: None,
            });
        }
    }

    let reactions = event
        .get("reactions")
        .and_then(Value::as_array)
        .map(|entries| {
            entries
                .iter()
                .filter_map(|entry| {
                    Some(ReactionRef {
                        key: str_field(entry, "name")?,
                        count: u64_field(entry, "count"),
                        users: entry
                            .get("users")
                            .and_then(Value::as_array)
                            .map(|users| {
                                users
                                    .iter()
                                    .filter_map(Value::as_str)
                                    .map(str::to_owned)
                                    .collect()
                            })
                            .unwrap_or_default(),
                    })
                })
                .collect()
        })
        .unwrap_or_default();

    let mentions: Vec<MentionRef> = event
        .get("blocks")
        .and_then(Value::as_array)
        .map(|blocks| collect_block_mentions(blocks))
        .unwrap_or_default();

    MessageBody {
        id: str_field_any(event, &["ts", "client_msg_id"]),
        text: str_field(event, "text"),
        content_type: None,
        attachments,
        reactions,
        mentions,
    }
}

fn collect_block_mentions(blocks: &[Value]) -> Vec<MentionRef> {
    fn walk(value: &Value, out: &mut Vec<MentionRef>) {
        match value {
            Value::Array(items) => {
                for item in items {
                    walk(item, out);
                }
            }
            Value::Object(map) => {
                if map.get("type").and_then(Value::as_str) == Some("user") {
                    out.push(MentionRef {
                        id: str_field(value, "user_id"),
                        text: None,
                    });
                }
                for item in map.values() {
                    walk(item, out);
                }
            }
            _ => {}
        }
    }

    let mut out = Vec::new();
    for block in blocks {
        walk(block, &mut out);
    }
    out
}
