//! Coverage for handler dispatch ordering and inflight trimming.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use stonebridge::client::core::ClientRuntime;
use stonebridge::client::{DeliveryTracker, EventHandler};
use stonebridge::config::DeliveryConfig;
use stonebridge::normalize::{
    CanonicalEvent, ConversationKind, ConversationRef, EventType,
};

fn event(id: &str) -> CanonicalEvent {
    CanonicalEvent {
        event_id: id.to_owned(),
        synthetic_id: false,
        event_type: EventType::Message,
        change_type: None,
        action: None,
        conversation: ConversationRef {
            id: "C1".to_owned(),
            tenant_id: None,
            kind: ConversationKind::Channel,
            thread_id: None,
        },
        sender: None,
        message: None,
        previous_message: None,
        raw_timestamp: None,
    }
}

/// Appends `(label, event_id)` to a shared log, optionally after a delay.
struct SlowHandler {
    label: &'static str,
    delay: Duration,
    log: Arc<tokio::sync::Mutex<Vec<(String, String)>>>,
}

#[async_trait]
impl EventHandler for SlowHandler {
    async fn on_event(&self, event: CanonicalEvent) {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.log
            .lock()
            .await
            .push((self.label.to_owned(), event.event_id));
    }
}

#[tokio::test]
async fn handlers_run_sequentially_in_registration_order() {
    let runtime = ClientRuntime::new(DeliveryConfig::default());
    let log = Arc::new(tokio::sync::Mutex::new(Vec::new()));

    runtime.handlers().add(Arc::new(SlowHandler {
        label: "slow",
        delay: Duration::from_millis(30),
        log: Arc::clone(&log),
    }));
    runtime.handlers().add(Arc::new(SlowHandler {
        label: "fast",
        delay: Duration::ZERO,
        log: Arc::clone(&log),
    }));

    runtime.dispatch(&event("e1")).await;
    runtime.dispatch(&event("e2")).await;

    let entries = log.lock().await.clone();
    assert_eq!(
        entries,
        vec![
            ("slow".to_owned(), "e1".to_owned()),
            ("fast".to_owned(), "e1".to_owned()),
            ("slow".to_owned(), "e2".to_owned()),
            ("fast".to_owned(), "e2".to_owned()),
        ],
        "a slow handler delays later handlers and later events, in order"
    );
}

#[tokio::test]
async fn add_and_remove_report_edge_transitions() {
    let runtime = ClientRuntime::new(DeliveryConfig::default());
    let log = Arc::new(tokio::sync::Mutex::new(Vec::new()));
    let handler = || {
        Arc::new(SlowHandler {
            label: "h",
            delay: Duration::ZERO,
            log: Arc::clone(&log),
        })
    };

    let (first, was_empty) = runtime.handlers().add(handler());
    assert!(was_empty);
    let (second, was_empty) = runtime.handlers().add(handler());
    assert!(!was_empty);

    assert!(!runtime.handlers().remove(first));
    assert!(runtime.handlers().remove(second), "last removal reports empty");
    assert!(runtime.handlers().is_empty());
}

#[tokio::test]
async fn dispatch_tracks_events_until_acknowledged() {
    let runtime = ClientRuntime::new(DeliveryConfig::default());
    runtime.dispatch(&event("e1")).await;
    runtime.dispatch(&event("e2")).await;

    let health = runtime.health(None);
    assert_eq!(health.pending_events, 2);
    assert_eq!(health.last_event_id.as_deref(), Some("e2"));

    assert!(runtime.tracker().acknowledge("e1").is_some());
    assert_eq!(runtime.health(None).pending_events, 1);
}

#[test]
fn aged_entries_are_trimmed() {
    let tracker = DeliveryTracker::new(DeliveryConfig {
        inflight_capacity: 100,
        inflight_max_age_secs: 0,
        poll_interval_secs: 1,
    });

    tracker.track("old");
    std::thread::sleep(Duration::from_millis(20));
    tracker.trim_now();

    assert_eq!(tracker.pending(), 0);
    assert!(tracker.acknowledge("old").is_none());
    assert_eq!(tracker.snapshot().dropped_events, 1);
}
