//! Coverage for the webhook subscription renewal loop.
//!
//! Timing tests run under tokio's paused clock: virtual time advances only
//! while every task is asleep, so the renewal moments are deterministic.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use stonebridge::client::ClientError;
use stonebridge::renewal::{Subscription, SubscriptionRenewer, SubscriptionTransport};

struct MemoryTransport {
    lifetime_secs: i64,
    subscriptions: AtomicUsize,
    renewals: AtomicUsize,
    unsubscribed: std::sync::Mutex<Vec<String>>,
    fail_renewals: AtomicUsize,
}

impl MemoryTransport {
    fn new(lifetime_secs: i64) -> Self {
        Self {
            lifetime_secs,
            subscriptions: AtomicUsize::new(0),
            renewals: AtomicUsize::new(0),
            unsubscribed: std::sync::Mutex::new(Vec::new()),
            fail_renewals: AtomicUsize::new(0),
        }
    }

    fn subscription(&self, id: String) -> Subscription {
        Subscription {
            id,
            resource: "/chats/getAllMessages".to_owned(),
            expires_at: Utc::now().checked_add_signed(chrono::Duration::seconds(self.lifetime_secs)),
        }
    }
}

#[async_trait]
impl SubscriptionTransport for MemoryTransport {
    async fn subscribe(&self, _resource: &str) -> Result<Subscription, ClientError> {
        let n = self.subscriptions.fetch_add(1, Ordering::SeqCst);
        Ok(self.subscription(format!("sub-{n}")))
    }

    async fn renew(
        &self,
        subscription_id: &str,
        _resource: &str,
    ) -> Result<Subscription, ClientError> {
        if self.fail_renewals.load(Ordering::SeqCst) > 0 {
            self.fail_renewals.fetch_sub(1, Ordering::SeqCst);
            return Err(ClientError::Transport("renewal endpoint down".to_owned()));
        }
        self.renewals.fetch_add(1, Ordering::SeqCst);
        Ok(self.subscription(subscription_id.to_owned()))
    }

    async fn unsubscribe(&self, subscription_id: &str) -> Result<(), ClientError> {
        self.unsubscribed
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(subscription_id.to_owned());
        Ok(())
    }
}

#[tokio::test(start_paused = true)]
async fn renewal_fires_at_expiry_minus_window() {
    let transport = Arc::new(MemoryTransport::new(600));
    let renewer = SubscriptionRenewer::new(
        Arc::clone(&transport) as Arc<dyn SubscriptionTransport>,
        "/chats/getAllMessages",
        Duration::from_secs(300),
    );

    let subscription = renewer.start().await.expect("subscribe");
    assert_eq!(subscription.id, "sub-0");

    // Not immediately...
    tokio::time::sleep(Duration::from_secs(250)).await;
    assert_eq!(transport.renewals.load(Ordering::SeqCst), 0);

    // ...but at ~300s (expiry - window), well before the 600s expiry.
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(transport.renewals.load(Ordering::SeqCst), 1);

    renewer.stop().await;
}

#[tokio::test(start_paused = true)]
async fn failed_renewal_retries_on_the_next_cycle() {
    let transport = Arc::new(MemoryTransport::new(600));
    transport.fail_renewals.store(1, Ordering::SeqCst);

    let renewer = SubscriptionRenewer::new(
        Arc::clone(&transport) as Arc<dyn SubscriptionTransport>,
        "/chats/getAllMessages",
        Duration::from_secs(300),
    );
    renewer.start().await.expect("subscribe");

    // First attempt at ~300s fails; the loop must survive and retry.
    tokio::time::sleep(Duration::from_secs(310)).await;
    assert_eq!(transport.renewals.load(Ordering::SeqCst), 0);

    // The next cycle's attempt succeeds.
    tokio::time::sleep(Duration::from_secs(310)).await;
    assert!(transport.renewals.load(Ordering::SeqCst) >= 1);
    assert!(renewer.is_active().await);

    renewer.stop().await;
}

#[tokio::test(start_paused = true)]
async fn stop_joins_the_loop_and_tears_down_the_subscription() {
    let transport = Arc::new(MemoryTransport::new(600));
    let renewer = SubscriptionRenewer::new(
        Arc::clone(&transport) as Arc<dyn SubscriptionTransport>,
        "/chats/getAllMessages",
        Duration::from_secs(300),
    );
    renewer.start().await.expect("subscribe");
    assert!(renewer.is_active().await);
    assert_eq!(renewer.subscription_id().as_deref(), Some("sub-0"));

    renewer.stop().await;

    assert!(!renewer.is_active().await);
    assert!(renewer.subscription_id().is_none());
    let removed = transport
        .unsubscribed
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
        .clone();
    assert_eq!(removed, vec!["sub-0".to_owned()]);

    // A second stop is a no-op.
    renewer.stop().await;
}

#[tokio::test(start_paused = true)]
async fn start_twice_reuses_the_subscription() {
    let transport = Arc::new(MemoryTransport::new(600));
    let renewer = SubscriptionRenewer::new(
        Arc::clone(&transport) as Arc<dyn SubscriptionTransport>,
        "/chats/getAllMessages",
        Duration::from_secs(300),
    );

    let first = renewer.start().await.expect("subscribe");
    let second = renewer.start().await.expect("reuse");
    assert_eq!(first.id, second.id);
    assert_eq!(transport.subscriptions.load(Ordering::SeqCst), 1);

    renewer.stop().await;
}
