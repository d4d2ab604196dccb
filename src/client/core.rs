//! Shared client runtime embedded by every platform adapter.
//!
//! Owns the pieces all adapters would otherwise duplicate: connection state,
//! cached identity and capabilities, the handler set, the delivery tracker,
//! and the background-task registry with cooperative shutdown. Platform
//! modules keep only their wire mapping.

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::client::handlers::HandlerSet;
use crate::client::tracker::DeliveryTracker;
use crate::client::{health_from_parts, Capabilities, ConnectionState, HealthSnapshot, Identity};
use crate::config::DeliveryConfig;
use crate::normalize::CanonicalEvent;

/// Shared state machine plumbing for one protocol client.
pub struct ClientRuntime {
    state: std::sync::Mutex<ConnectionState>,
    identity: std::sync::Mutex<Option<Identity>>,
    capabilities: std::sync::Mutex<Option<Capabilities>>,
    handlers: HandlerSet,
    tracker: DeliveryTracker,
    background: tokio::sync::Mutex<Background>,
}

#[derive(Default)]
struct Background {
    shutdown: Option<watch::Sender<bool>>,
    tasks: Vec<JoinHandle<()>>,
}

impl ClientRuntime {
    /// Create a runtime with the given delivery bounds.
    pub fn new(delivery: DeliveryConfig) -> Self {
        Self {
            state: std::sync::Mutex::new(ConnectionState::Disconnected),
            identity: std::sync::Mutex::new(None),
            capabilities: std::sync::Mutex::new(None),
            handlers: HandlerSet::new(),
            tracker: DeliveryTracker::new(delivery),
            background: tokio::sync::Mutex::new(Background::default()),
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        *lock(&self.state)
    }

    /// Transition the lifecycle state.
    pub fn set_state(&self, state: ConnectionState) {
        *lock(&self.state) = state;
    }

    /// Whether the state is `Connected`.
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Cache the identity discovered during connect.
    pub fn store_identity(&self, identity: Identity) {
        *lock(&self.identity) = Some(identity);
    }

    /// Cached identity, if connected.
    pub fn identity(&self) -> Option<Identity> {
        lock(&self.identity).clone()
    }

    /// Cache the capability flags computed during connect.
    pub fn store_capabilities(&self, capabilities: Capabilities) {
        *lock(&self.capabilities) = Some(capabilities);
    }

    /// Cached capabilities; defaults when queried before connect.
    pub fn capabilities(&self) -> Capabilities {
        lock(&self.capabilities).clone().unwrap_or_default()
    }

    /// The client's handler set.
    pub fn handlers(&self) -> &HandlerSet {
        &self.handlers
    }

    /// The client's delivery tracker.
    pub fn tracker(&self) -> &DeliveryTracker {
        &self.tracker
    }

    /// Track and dispatch one canonical event to all handlers, sequentially.
    pub async fn dispatch(&self, event: &CanonicalEvent) {
        self.tracker.track(&event.event_id);
        debug!(event_id = %event.event_id, "dispatching canonical event");
        self.handlers.dispatch(event).await;
    }

    /// Begin a background session: returns the shutdown receiver the
    /// spawned loops must observe at every suspension point.
    ///
    /// Any previous background session must have been stopped first.
    pub async fn begin_background(&self) -> watch::Receiver<bool> {
        let mut background = self.background.lock().await;
        let (tx, rx) = watch::channel(false);
        background.shutdown = Some(tx);
        rx
    }

    /// Register a spawned background task for join-on-shutdown.
    pub async fn attach_task(&self, handle: JoinHandle<()>) {
        self.background.lock().await.tasks.push(handle);
    }

    /// Whether a background session is currently active.
    pub async fn background_active(&self) -> bool {
        !self.background.lock().await.tasks.is_empty()
    }

    /// Signal shutdown and await every background task.
    ///
    /// Safe to call when no background session is active.
    pub async fn stop_background(&self) {
        let (shutdown, tasks) = {
            let mut background = self.background.lock().await;
            (
                background.shutdown.take(),
                std::mem::take(&mut background.tasks),
            )
        };

        if let Some(tx) = shutdown {
            let _ = tx.send(true);
        }
        for task in tasks {
            if let Err(e) = task.await {
                if !e.is_cancelled() {
                    warn!(error = %e, "background task ended abnormally");
                }
            }
        }
    }

    /// Build a health snapshot from the runtime's state.
    pub fn health(&self, subscription_id: Option<String>) -> HealthSnapshot {
        health_from_parts(
            self.state(),
            self.handlers.len(),
            &self.tracker.snapshot(),
            subscription_id,
        )
    }

    /// Reset cached connection artifacts on disconnect.
    pub fn clear_connection(&self) {
        self.set_state(ConnectionState::Disconnected);
        *lock(&self.identity) = None;
        *lock(&self.capabilities) = None;
    }
}

impl std::fmt::Debug for ClientRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientRuntime")
            .field("state", &self.state())
            .field("handlers", &self.handlers.len())
            .field("pending", &self.tracker.pending())
            .finish()
    }
}

/// Spawn helper: run a platform background loop with standard lifecycle
/// logging.
pub fn spawn_loop<F>(name: &'static str, future: F) -> JoinHandle<()>
where
    F: std::future::Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        debug!(name, "background loop started");
        future.await;
        debug!(name, "background loop stopped");
    })
}

fn lock<T>(mutex: &std::sync::Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
