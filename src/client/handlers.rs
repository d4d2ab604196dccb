//! Per-client event handler registry.
//!
//! Each client owns exactly one of these; there is no global handler table.
//! Handlers run sequentially in registration order for every dispatched
//! event, so a slow handler delays the next event on the same client but
//! never an unrelated client.

use std::sync::Arc;

use crate::client::EventHandler;
use crate::normalize::CanonicalEvent;

/// Opaque handle returned by [`HandlerSet::add`], used for removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

/// Ordered set of event handlers owned by one client.
#[derive(Default)]
pub struct HandlerSet {
    inner: std::sync::Mutex<HandlerList>,
}

#[derive(Default)]
struct HandlerList {
    next_id: u64,
    entries: Vec<(HandlerId, Arc<dyn EventHandler>)>,
}

impl HandlerSet {
    /// Create an empty handler set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler.
    ///
    /// Returns the handler id and whether the set was empty before this
    /// registration (the signal for poll-based clients to start their loop).
    pub fn add(&self, handler: Arc<dyn EventHandler>) -> (HandlerId, bool) {
        let mut list = self.lock();
        let was_empty = list.entries.is_empty();
        let id = HandlerId(list.next_id);
        list.next_id = list.next_id.saturating_add(1);
        list.entries.push((id, handler));
        (id, was_empty)
    }

    /// Remove a handler by id.
    ///
    /// Returns whether the set is empty after removal (the signal for
    /// poll-based clients to stop their loop).
    pub fn remove(&self, id: HandlerId) -> bool {
        let mut list = self.lock();
        list.entries.retain(|(entry_id, _)| *entry_id != id);
        list.entries.is_empty()
    }

    /// Number of registered handlers.
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    /// Whether no handlers are registered.
    pub fn is_empty(&self) -> bool {
        self.lock().entries.is_empty()
    }

    /// Dispatch one event to every handler, sequentially, in registration
    /// order.
    pub async fn dispatch(&self, event: &CanonicalEvent) {
        let handlers: Vec<Arc<dyn EventHandler>> = self
            .lock()
            .entries
            .iter()
            .map(|(_, handler)| Arc::clone(handler))
            .collect();

        for handler in handlers {
            handler.on_event(event.clone()).await;
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HandlerList> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl std::fmt::Debug for HandlerSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerSet")
            .field("handlers", &self.len())
            .finish()
    }
}
