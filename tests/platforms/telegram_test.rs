//! Coverage for the poll-delivery adapter.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use stonebridge::client::{ClientError, EventHandler, OutboundContent, ProtocolClient};
use stonebridge::config::DeliveryConfig;
use stonebridge::normalize::CanonicalEvent;
use stonebridge::platforms::telegram::{BotApi, TelegramClient, TelegramConfig};
use stonebridge::session::Token;

struct StubBotApi {
    calls: std::sync::Mutex<Vec<(String, Value)>>,
    batches: std::sync::Mutex<VecDeque<Value>>,
    reject_auth: AtomicBool,
    fail_sends: AtomicBool,
}

impl StubBotApi {
    fn new() -> Self {
        Self {
            calls: std::sync::Mutex::new(Vec::new()),
            batches: std::sync::Mutex::new(VecDeque::new()),
            reject_auth: AtomicBool::new(false),
            fail_sends: AtomicBool::new(false),
        }
    }

    fn queue_batch(&self, batch: Value) {
        self.batches
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push_back(batch);
    }

    fn calls(&self) -> Vec<(String, Value)> {
        self.calls
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl BotApi for StubBotApi {
    async fn call(
        &self,
        _token: &str,
        method: &str,
        params: Value,
        _timeout: Option<Duration>,
    ) -> Result<Value, ClientError> {
        self.calls
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push((method.to_owned(), params));

        if self.reject_auth.load(Ordering::SeqCst) {
            return Err(ClientError::AuthenticationFailed("unauthorized".to_owned()));
        }

        match method {
            "getMe" => Ok(json!({"id": 42, "first_name": "Bridge", "username": "bridge_bot"})),
            "getUpdates" => {
                let next = self
                    .batches
                    .lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner)
                    .pop_front();
                match next {
                    Some(batch) => Ok(batch),
                    None => {
                        // Simulate an empty long-poll cycle.
                        tokio::time::sleep(Duration::from_millis(5)).await;
                        Ok(json!([]))
                    }
                }
            }
            "sendMessage" => {
                if self.fail_sends.load(Ordering::SeqCst) {
                    return Err(ClientError::AuthenticationFailed("revoked".to_owned()));
                }
                Ok(json!({"message_id": 77, "date": 1_700_000_000}))
            }
            _ => Ok(Value::Null),
        }
    }
}

struct RecordingHandler {
    events: tokio::sync::Mutex<Vec<CanonicalEvent>>,
}

impl RecordingHandler {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            events: tokio::sync::Mutex::new(Vec::new()),
        })
    }

    async fn count(&self) -> usize {
        self.events.lock().await.len()
    }
}

#[async_trait]
impl EventHandler for RecordingHandler {
    async fn on_event(&self, event: CanonicalEvent) {
        self.events.lock().await.push(event);
    }
}

fn client_over(api: Arc<StubBotApi>) -> TelegramClient {
    TelegramClient::new(api, TelegramConfig::default(), DeliveryConfig::default())
}

async fn wait_for_events(handler: &RecordingHandler, at_least: usize) {
    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            if handler.count().await >= at_least {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("events arrive in time");
}

fn message_batch(update_id: i64, text: &str) -> Value {
    json!([{
        "update_id": update_id,
        "message": {
            "message_id": 9,
            "from": {"id": 1001, "first_name": "Ada"},
            "chat": {"id": 55, "type": "private"},
            "date": 1_700_000_000,
            "text": text,
        }
    }])
}

#[tokio::test]
async fn connect_discovers_identity_before_reporting_connected() {
    let api = Arc::new(StubBotApi::new());
    let client = client_over(Arc::clone(&api));

    client.connect(&Token::bearer("bot-token")).await.expect("connect");

    assert!(client.is_connected().await);
    let identity = client.fetch_identity().await.expect("cached identity");
    assert_eq!(identity.user_id, "42");
    assert_eq!(identity.display_name.as_deref(), Some("Bridge"));
    assert_eq!(identity.address.as_deref(), Some("bridge_bot"));
    assert!(client.describe_capabilities().await.text);
}

#[tokio::test]
async fn rejected_credentials_fail_the_connect() {
    let api = Arc::new(StubBotApi::new());
    api.reject_auth.store(true, Ordering::SeqCst);
    let client = client_over(api);

    let result = client.connect(&Token::bearer("bad")).await;
    assert!(matches!(result, Err(ClientError::AuthenticationFailed(_))));
    assert!(!client.is_connected().await);
}

#[tokio::test]
async fn poll_loop_delivers_normalized_events_and_advances_the_offset() {
    let api = Arc::new(StubBotApi::new());
    api.queue_batch(message_batch(700100, "hello"));
    let client = client_over(Arc::clone(&api));
    let handler = RecordingHandler::new();

    client.add_event_handler(handler.clone()).await;
    client.connect(&Token::bearer("bot-token")).await.expect("connect");

    wait_for_events(&handler, 1).await;
    let events = handler.events.lock().await;
    assert_eq!(events[0].event_id, "700100");
    assert_eq!(events[0].conversation.id, "55");
    drop(events);

    let health = client.health().await;
    assert_eq!(health.pending_events, 1);
    assert_eq!(health.last_event_id.as_deref(), Some("700100"));

    client.acknowledge_event("700100").await.expect("ack");
    let health = client.health().await;
    assert_eq!(health.pending_events, 0);
    assert_eq!(health.last_ack_event_id.as_deref(), Some("700100"));

    // The loop advanced past the consumed update.
    let followups: Vec<_> = api
        .calls()
        .into_iter()
        .filter(|(method, params)| {
            method == "getUpdates" && params.get("offset").and_then(Value::as_i64) == Some(700_101)
        })
        .collect();
    assert!(!followups.is_empty(), "offset advances to update_id + 1");

    client.disconnect().await.expect("disconnect");
}

#[tokio::test]
async fn removing_the_last_handler_stops_the_poll_loop() {
    let api = Arc::new(StubBotApi::new());
    api.queue_batch(message_batch(1, "first"));
    let client = client_over(Arc::clone(&api));
    let handler = RecordingHandler::new();

    let id = client.add_event_handler(handler.clone()).await;
    client.connect(&Token::bearer("bot-token")).await.expect("connect");
    wait_for_events(&handler, 1).await;

    client.remove_event_handler(id).await;

    // New updates queued after the stop are never delivered.
    api.queue_batch(message_batch(2, "second"));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(handler.count().await, 1);

    client.disconnect().await.expect("disconnect");
}

#[tokio::test]
async fn send_message_sanitizes_html_content() {
    let api = Arc::new(StubBotApi::new());
    let client = client_over(Arc::clone(&api));
    client.connect(&Token::bearer("bot-token")).await.expect("connect");

    let receipt = client
        .send_message(
            "55",
            &OutboundContent {
                html: Some("<script>alert(1)</script><p>Hello <b>World</b></p>".to_owned()),
                ..OutboundContent::default()
            },
            &[],
        )
        .await
        .expect("send");

    assert_eq!(receipt.message_id.as_deref(), Some("77"));
    let (_, params) = api
        .calls()
        .into_iter()
        .find(|(method, _)| method == "sendMessage")
        .expect("sendMessage called");
    assert_eq!(params["text"], "<p>Hello <b>World</b></p>");
    assert_eq!(params["parse_mode"], "HTML");
}

#[tokio::test]
async fn send_on_a_revoked_session_reports_session_revoked() {
    let api = Arc::new(StubBotApi::new());
    let client = client_over(Arc::clone(&api));
    client.connect(&Token::bearer("bot-token")).await.expect("connect");

    api.fail_sends.store(true, Ordering::SeqCst);
    let result = client
        .send_message(
            "55",
            &OutboundContent {
                text: Some("hi".to_owned()),
                ..OutboundContent::default()
            },
            &[],
        )
        .await;
    assert!(matches!(result, Err(ClientError::SessionRevoked)));
}

#[tokio::test]
async fn attachments_are_rejected_as_unsupported() {
    let api = Arc::new(StubBotApi::new());
    let client = client_over(api);
    client.connect(&Token::bearer("bot-token")).await.expect("connect");

    let result = client
        .send_message(
            "55",
            &OutboundContent {
                text: Some("hi".to_owned()),
                ..OutboundContent::default()
            },
            &[stonebridge::client::OutboundAttachment {
                filename: "a.bin".to_owned(),
                content_type: None,
                bytes: vec![0u8; 8],
                title: None,
            }],
        )
        .await;
    assert!(matches!(result, Err(ClientError::Unsupported(_))));
}

#[tokio::test]
async fn disconnect_twice_leaves_the_client_disconnected() {
    let api = Arc::new(StubBotApi::new());
    let client = client_over(api);
    client.connect(&Token::bearer("bot-token")).await.expect("connect");

    client.disconnect().await.expect("first disconnect");
    client.disconnect().await.expect("second disconnect");
    assert!(!client.is_connected().await);
    assert!(matches!(
        client.fetch_identity().await,
        Err(ClientError::NotConnected)
    ));
}
