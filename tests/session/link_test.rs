//! Coverage for the linked-snapshot builder.

use stonebridge::link::LinkOutcome;
use stonebridge::session::{ClientFactory, SessionKey, SessionRecord, Token};

use crate::mock::MockFactory;

#[tokio::test]
async fn linked_outcome_carries_the_full_snapshot() {
    let factory = MockFactory::new();
    let key = SessionKey::new("alice");
    let client = factory.build(&key);
    client
        .connect(&Token::bearer("secret"))
        .await
        .expect("connect");

    let record = SessionRecord::new(key, Token::bearer("secret"));
    let outcome = LinkOutcome::linked(client.as_ref(), record)
        .await
        .expect("snapshot");

    let value = serde_json::to_value(&outcome).expect("serializes");
    assert_eq!(value["status"], "linked");
    assert_eq!(value["identity"]["user_id"], "U1");
    assert_eq!(value["capabilities"]["text"], true);
    assert_eq!(value["members"][0]["id"], "U2");
    assert_eq!(value["conversations"][0]["name"], "general");
    // Secrets stay inside the session payload for the daemon to persist,
    // but never under a different name.
    assert_eq!(value["session"]["token"]["secret"], "secret");
}
