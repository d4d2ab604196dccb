//! Coverage for the graph-API wire mapper.

use serde_json::json;
use stonebridge::normalize::{graph, ChangeType, EventType};

fn message_fixture() -> serde_json::Value {
    json!({
        "id": "msg1",
        "createdDateTime": "2024-01-01T00:00:00Z",
        "lastModifiedDateTime": "2024-01-01T00:00:00Z",
        "body": {"content": "<p>hi</p>", "contentType": "html"},
        "summary": "hi",
        "replyToId": "parent1",
        "from": {"user": {"id": "user2", "displayName": "Bob"}},
        "attachments": [{
            "id": "att1",
            "contentType": "image/png",
            "contentUrl": "https://cdn.example/img.png",
            "name": "img.png",
            "size": 123,
        }],
        "mentions": [{
            "id": 0,
            "mentionText": "@Alice",
            "mentioned": {"user": {"id": "user1", "displayName": "Alice"}},
        }],
        "reactions": [{
            "reactionType": "like",
            "createdDateTime": "2024-01-01T00:00:05Z",
            "user": {"user": {"id": "user3", "displayName": "Charlie"}},
        }],
    })
}

#[test]
fn maps_a_full_message_resource() {
    let event = graph::normalize("chat1", Some("tenant"), &message_fixture()).expect("normalizes");

    assert_eq!(event.event_id, "msg1");
    assert_eq!(event.event_type, EventType::Message);
    assert_eq!(event.change_type, None);
    assert_eq!(event.conversation.id, "chat1");
    assert_eq!(event.conversation.tenant_id.as_deref(), Some("tenant"));
    assert_eq!(event.conversation.thread_id.as_deref(), Some("parent1"));
    assert_eq!(event.raw_timestamp.as_deref(), Some("2024-01-01T00:00:00Z"));

    let sender = event.sender.expect("sender");
    assert_eq!(sender.id, "user2");
    assert_eq!(sender.display_name.as_deref(), Some("Bob"));

    let message = event.message.expect("body");
    assert_eq!(message.text.as_deref(), Some("<p>hi</p>"));
    assert_eq!(message.content_type.as_deref(), Some("html"));
    assert_eq!(message.attachments[0].name.as_deref(), Some("img.png"));
    assert_eq!(
        message.attachments[0].url.as_deref(),
        Some("https://cdn.example/img.png")
    );
    assert_eq!(message.mentions[0].text.as_deref(), Some("@Alice"));
    assert_eq!(message.mentions[0].id.as_deref(), Some("user1"));
    assert_eq!(message.reactions[0].key, "like");
    assert_eq!(message.reactions[0].users, vec!["user3"]);
}

#[test]
fn later_modification_marks_an_edit() {
    let mut payload = message_fixture();
    payload["lastModifiedDateTime"] = json!("2024-01-01T00:00:10Z");

    let event = graph::normalize("chat1", None, &payload).expect("normalizes");
    assert_eq!(event.change_type, Some(ChangeType::Edited));
    // The wire does not deliver the pre-edit body.
    assert!(event.previous_message.is_none());
}

#[test]
fn deleted_resources_carry_an_empty_body() {
    let mut payload = message_fixture();
    payload["deletedDateTime"] = json!("2024-01-02T00:00:00Z");

    let event = graph::normalize("chat1", None, &payload).expect("normalizes");
    assert_eq!(event.change_type, Some(ChangeType::Deleted));
    let message = event.message.expect("tombstone");
    assert_eq!(message.id.as_deref(), Some("msg1"));
    assert!(message.text.is_none());
    assert!(message.attachments.is_empty());
}

#[test]
fn drops_resources_without_an_id_or_conversation() {
    assert!(graph::normalize("chat1", None, &json!({"body": {"content": "x"}})).is_none());
    assert!(graph::normalize("", None, &message_fixture()).is_none());
}

#[test]
fn empty_optional_structures_are_omitted_from_output() {
    let event = graph::normalize(
        "chat1",
        None,
        &json!({
            "id": "msg2",
            "createdDateTime": "2024-01-01T00:00:00Z",
            "body": {"content": "plain", "contentType": "text"},
        }),
    )
    .expect("normalizes");

    let value = serde_json::to_value(&event).expect("serializes");
    let message = value.get("message").expect("message present");
    assert!(message.get("attachments").is_none());
    assert!(message.get("reactions").is_none());
    assert!(message.get("mentions").is_none());
    assert!(value.get("previous_message").is_none());
    assert!(value.get("synthetic_id").is_none());
}
