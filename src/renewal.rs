//! Webhook subscription keep-alive.
//!
//! Platforms with webhook delivery hand out short-lived subscriptions. The
//! renewer computes the next renewal moment from the subscription's expiry
//! minus the renewal window, sleeps until then (waking early on shutdown),
//! renews, and repeats. Renewal failures are logged and retried on the next
//! cycle rather than terminating the loop. `stop` cancels cooperatively,
//! joins the loop and tears the subscription down.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::client::ClientError;

/// Smallest delay before the next renewal attempt.
const MIN_RENEWAL_DELAY: Duration = Duration::from_secs(5);

/// Fallback delay floor when a subscription reports no expiry.
const NO_EXPIRY_FLOOR: Duration = Duration::from_secs(60);

/// A live webhook subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    /// Platform subscription identifier.
    pub id: String,
    /// Subscribed resource path.
    pub resource: String,
    /// When the platform will expire the subscription.
    pub expires_at: Option<DateTime<Utc>>,
}

/// Platform calls behind the renewal loop.
#[async_trait]
pub trait SubscriptionTransport: Send + Sync {
    /// Register a subscription for `resource`.
    ///
    /// # Errors
    ///
    /// Propagates transport and authentication errors.
    async fn subscribe(&self, resource: &str) -> Result<Subscription, ClientError>;

    /// Extend the validity window of an existing subscription.
    ///
    /// # Errors
    ///
    /// Propagates transport and authentication errors.
    async fn renew(&self, subscription_id: &str, resource: &str)
        -> Result<Subscription, ClientError>;

    /// Remove a subscription.
    ///
    /// # Errors
    ///
    /// Propagates transport errors; callers treat failures as best-effort.
    async fn unsubscribe(&self, subscription_id: &str) -> Result<(), ClientError>;
}

/// Compute the delay until the next renewal.
///
/// `expiry - now - window`, floored at [`MIN_RENEWAL_DELAY`]; subscriptions
/// without an expiry are re-checked every `max(window, 60s)`.
pub fn renewal_delay(expires_at: Option<DateTime<Utc>>, window: Duration) -> Duration {
    match expires_at {
        None => window.max(NO_EXPIRY_FLOOR),
        Some(expiry) => {
            let remaining = expiry
                .signed_duration_since(Utc::now())
                .to_std()
                .unwrap_or(Duration::ZERO);
            remaining.saturating_sub(window).max(MIN_RENEWAL_DELAY)
        }
    }
}

/// Owns one subscription and the background loop keeping it alive.
pub struct SubscriptionRenewer {
    transport: Arc<dyn SubscriptionTransport>,
    resource: String,
    window: Duration,
    current: Arc<std::sync::Mutex<Option<Subscription>>>,
    run: tokio::sync::Mutex<Option<RenewLoop>>,
}

struct RenewLoop {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl SubscriptionRenewer {
    /// Create a renewer for `resource` with the given renewal window.
    pub fn new(
        transport: Arc<dyn SubscriptionTransport>,
        resource: impl Into<String>,
        window: Duration,
    ) -> Self {
        Self {
            transport,
            resource: resource.into(),
            window,
            current: Arc::new(std::sync::Mutex::new(None)),
            run: tokio::sync::Mutex::new(None),
        }
    }

    /// Subscribe and start the renewal loop.
    ///
    /// Calling `start` on an already-started renewer returns the existing
    /// subscription without subscribing again.
    ///
    /// # Errors
    ///
    /// Propagates the initial subscribe failure; no loop is started in that
    /// case.
    pub async fn start(&self) -> Result<Subscription, ClientError> {
        let mut run = self.run.lock().await;
        if run.is_some() {
            if let Some(existing) = self.subscription() {
                return Ok(existing);
            }
        }

        let subscription = self.transport.subscribe(&self.resource).await?;
        info!(
            subscription_id = %subscription.id,
            resource = %self.resource,
            "webhook subscription started"
        );
        *lock(&self.current) = Some(subscription.clone());

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(renewal_loop(
            Arc::clone(&self.transport),
            self.resource.clone(),
            self.window,
            Arc::clone(&self.current),
            shutdown_rx,
        ));
        *run = Some(RenewLoop {
            shutdown: shutdown_tx,
            handle,
        });

        Ok(subscription)
    }

    /// The live subscription, when started.
    pub fn subscription(&self) -> Option<Subscription> {
        lock(&self.current).clone()
    }

    /// The live subscription id, when started.
    pub fn subscription_id(&self) -> Option<String> {
        lock(&self.current).as_ref().map(|s| s.id.clone())
    }

    /// Whether the renewal loop is running.
    pub async fn is_active(&self) -> bool {
        self.run.lock().await.is_some()
    }

    /// Cancel the loop, await its termination and tear the subscription
    /// down. Idempotent.
    pub async fn stop(&self) {
        let run = self.run.lock().await.take();
        if let Some(run) = run {
            let _ = run.shutdown.send(true);
            if let Err(e) = run.handle.await {
                if !e.is_cancelled() {
                    warn!(error = %e, "renewal loop ended abnormally");
                }
            }
        }

        let subscription = lock(&self.current).take();
        if let Some(subscription) = subscription {
            if let Err(e) = self.transport.unsubscribe(&subscription.id).await {
                warn!(
                    subscription_id = %subscription.id,
                    error = %e,
                    "failed to remove webhook subscription"
                );
            } else {
                info!(subscription_id = %subscription.id, "webhook subscription stopped");
            }
        }
    }
}

impl std::fmt::Debug for SubscriptionRenewer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionRenewer")
            .field("resource", &self.resource)
            .field("window", &self.window)
            .field("subscription", &self.subscription_id())
            .finish()
    }
}

async fn renewal_loop(
    transport: Arc<dyn SubscriptionTransport>,
    resource: String,
    window: Duration,
    current: Arc<std::sync::Mutex<Option<Subscription>>>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let expires_at = lock(&current).as_ref().and_then(|s| s.expires_at);
        let delay = renewal_delay(expires_at, window);
        debug!(delay_secs = delay.as_secs(), "next subscription renewal scheduled");

        tokio::select! {
            _ = shutdown.changed() => break,
            () = tokio::time::sleep(delay) => {}
        }
        if *shutdown.borrow() {
            break;
        }

        let Some(subscription_id) = lock(&current).as_ref().map(|s| s.id.clone()) else {
            break;
        };

        match transport.renew(&subscription_id, &resource).await {
            Ok(renewed) => {
                debug!(
                    subscription_id = %renewed.id,
                    expires_at = ?renewed.expires_at,
                    "webhook subscription renewed"
                );
                *lock(&current) = Some(renewed);
            }
            Err(e) => {
                // Retried on the next cycle; the loop never terminates on a
                // renewal failure.
                warn!(subscription_id = %subscription_id, error = %e, "subscription renewal failed");
            }
        }
    }
}

fn lock<T>(mutex: &std::sync::Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
