//! Coverage for the long-poll update wire mapper.

use serde_json::json;
use stonebridge::normalize::{update, ChangeType, ConversationKind, EventType};

#[test]
fn maps_a_private_message_update() {
    let event = update::normalize(&json!({
        "update_id": 700100,
        "message": {
            "message_id": 42,
            "from": {"id": 1001, "first_name": "Ada", "username": "ada"},
            "chat": {"id": -500, "type": "private"},
            "date": 1_700_000_000,
            "text": "hello there",
        }
    }))
    .expect("normalizes");

    assert_eq!(event.event_id, "700100");
    assert!(!event.synthetic_id);
    assert_eq!(event.event_type, EventType::Message);
    assert_eq!(event.conversation.id, "-500");
    assert_eq!(event.conversation.kind, ConversationKind::Direct);
    assert_eq!(event.raw_timestamp.as_deref(), Some("1700000000"));

    let sender = event.sender.expect("sender");
    assert_eq!(sender.id, "1001");
    assert_eq!(sender.display_name.as_deref(), Some("Ada"));

    let message = event.message.expect("body");
    assert_eq!(message.id.as_deref(), Some("42"));
    assert_eq!(message.text.as_deref(), Some("hello there"));
}

#[test]
fn edited_message_maps_to_an_edit() {
    let event = update::normalize(&json!({
        "update_id": 700101,
        "edited_message": {
            "message_id": 42,
            "chat": {"id": 77, "type": "supergroup"},
            "text": "hello again",
        }
    }))
    .expect("normalizes");

    assert_eq!(event.change_type, Some(ChangeType::Edited));
    assert_eq!(event.conversation.kind, ConversationKind::Group);
}

#[test]
fn reply_linkage_becomes_the_thread_id() {
    let event = update::normalize(&json!({
        "update_id": 700102,
        "message": {
            "message_id": 43,
            "chat": {"id": 77, "type": "group"},
            "text": "reply",
            "reply_to_message": {"message_id": 40},
        }
    }))
    .expect("normalizes");
    assert_eq!(event.conversation.thread_id.as_deref(), Some("40"));
}

#[test]
fn documents_and_photos_become_attachments() {
    let event = update::normalize(&json!({
        "update_id": 700103,
        "message": {
            "message_id": 44,
            "chat": {"id": 77, "type": "group"},
            "caption": "see attached",
            "document": {
                "file_id": "DOC1",
                "file_name": "notes.txt",
                "mime_type": "text/plain",
                "file_size": 9,
            },
            "photo": [
                {"file_id": "PH-small", "file_size": 100},
                {"file_id": "PH-large", "file_size": 900},
            ],
        }
    }))
    .expect("normalizes");

    let message = event.message.expect("body");
    assert_eq!(message.text.as_deref(), Some("see attached"));
    assert_eq!(message.attachments.len(), 2);
    assert_eq!(message.attachments[0].id.as_deref(), Some("DOC1"));
    // Only the largest photo rendition is kept.
    assert_eq!(message.attachments[1].id.as_deref(), Some("PH-large"));
}

#[test]
fn missing_ids_fall_back_to_a_marked_synthetic_id() {
    let event = update::normalize(&json!({
        "message": {
            "chat": {"id": 77, "type": "group"},
            "text": "service update with no ids",
        }
    }))
    .expect("normalizes");

    assert!(event.synthetic_id, "locally generated ids must be marked");
    assert!(event.event_id.starts_with("local-"));
}

#[test]
fn drops_updates_without_a_message_or_chat() {
    assert!(update::normalize(&json!({"update_id": 1})).is_none());
    assert!(update::normalize(&json!({
        "update_id": 2,
        "message": {"message_id": 9, "text": "no chat"}
    }))
    .is_none());
}
