//! Delivery tracking for dispatched-but-unacknowledged events.
//!
//! Every inbound event dispatched to handlers is recorded here until it is
//! acknowledged. The map is bounded: entries beyond the configured capacity
//! or older than the maximum age are dropped oldest-first, so a consumer
//! that never acks cannot grow client memory without bound.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use crate::config::DeliveryConfig;

/// Tracks inflight events, acknowledgement latency and loop error counters
/// for one client.
#[derive(Debug)]
pub struct DeliveryTracker {
    capacity: usize,
    max_age: Duration,
    inner: std::sync::Mutex<TrackerState>,
}

#[derive(Debug, Default)]
struct TrackerState {
    inflight: HashMap<String, Instant>,
    order: VecDeque<String>,
    last_event_id: Option<String>,
    last_event_at: Option<Instant>,
    last_ack_event_id: Option<String>,
    last_ack_latency: Option<Duration>,
    consecutive_errors: u64,
    dropped_events: u64,
    skipped_payloads: u64,
}

/// Point-in-time view of the tracker used by `health()`.
#[derive(Debug, Clone)]
pub struct TrackerSnapshot {
    /// Dispatched events awaiting acknowledgement.
    pub pending_events: usize,
    /// Age of the oldest unacknowledged event.
    pub oldest_pending_age: Option<Duration>,
    /// Identifier of the most recently dispatched event.
    pub last_event_id: Option<String>,
    /// Time since the most recent dispatch.
    pub last_event_age: Option<Duration>,
    /// Identifier of the most recently acknowledged event.
    pub last_ack_event_id: Option<String>,
    /// Dispatch-to-ack latency of the most recent acknowledgement.
    pub last_ack_latency: Option<Duration>,
    /// Consecutive background-loop failures since the last success.
    pub consecutive_errors: u64,
    /// Entries dropped by capacity or age trimming.
    pub dropped_events: u64,
    /// Wire payloads skipped by normalization.
    pub skipped_payloads: u64,
}

impl DeliveryTracker {
    /// Create a tracker with the given bounds.
    pub fn new(config: DeliveryConfig) -> Self {
        Self {
            capacity: config.inflight_capacity.max(1),
            max_age: config.inflight_max_age(),
            inner: std::sync::Mutex::new(TrackerState::default()),
        }
    }

    /// Record a dispatched event and trim the map to its bounds.
    pub fn track(&self, event_id: &str) {
        let now = Instant::now();
        let mut state = self.lock();
        if state.inflight.insert(event_id.to_owned(), now).is_none() {
            state.order.push_back(event_id.to_owned());
        }
        state.last_event_id = Some(event_id.to_owned());
        state.last_event_at = Some(now);
        Self::trim(&mut state, self.capacity, self.max_age, now);
    }

    /// Remove an inflight entry, recording its acknowledgement latency.
    ///
    /// Returns the latency when the event was still tracked, `None` when it
    /// was unknown (already acked or trimmed).
    pub fn acknowledge(&self, event_id: &str) -> Option<Duration> {
        let mut state = self.lock();
        let dispatched_at = state.inflight.remove(event_id)?;
        let latency = dispatched_at.elapsed();
        state.last_ack_event_id = Some(event_id.to_owned());
        state.last_ack_latency = Some(latency);
        Some(latency)
    }

    /// Drop entries over capacity or past the maximum age, oldest-first.
    pub fn trim_now(&self) {
        let now = Instant::now();
        let mut state = self.lock();
        Self::trim(&mut state, self.capacity, self.max_age, now);
    }

    /// Number of dispatched events awaiting acknowledgement.
    pub fn pending(&self) -> usize {
        self.lock().inflight.len()
    }

    /// Count a background-loop failure.
    pub fn record_error(&self) {
        let mut state = self.lock();
        state.consecutive_errors = state.consecutive_errors.saturating_add(1);
    }

    /// Reset the consecutive failure counter after a successful cycle.
    pub fn reset_errors(&self) {
        self.lock().consecutive_errors = 0;
    }

    /// Count a wire payload dropped by normalization.
    pub fn record_skip(&self) {
        let mut state = self.lock();
        state.skipped_payloads = state.skipped_payloads.saturating_add(1);
    }

    /// Snapshot the tracker for health reporting.
    pub fn snapshot(&self) -> TrackerSnapshot {
        let state = self.lock();
        let oldest_pending_age = state
            .order
            .iter()
            .find_map(|id| state.inflight.get(id))
            .map(Instant::elapsed);
        TrackerSnapshot {
            pending_events: state.inflight.len(),
            oldest_pending_age,
            last_event_id: state.last_event_id.clone(),
            last_event_age: state.last_event_at.map(|t| t.elapsed()),
            last_ack_event_id: state.last_ack_event_id.clone(),
            last_ack_latency: state.last_ack_latency,
            consecutive_errors: state.consecutive_errors,
            dropped_events: state.dropped_events,
            skipped_payloads: state.skipped_payloads,
        }
    }

    fn trim(state: &mut TrackerState, capacity: usize, max_age: Duration, now: Instant) {
        while let Some(front) = state.order.front().cloned() {
            let Some(dispatched_at) = state.inflight.get(&front).copied() else {
                // Already acknowledged; discard the stale order entry.
                state.order.pop_front();
                continue;
            };

            let over_capacity = state.inflight.len() > capacity;
            let expired = now.saturating_duration_since(dispatched_at) > max_age;
            if !over_capacity && !expired {
                break;
            }

            state.order.pop_front();
            state.inflight.remove(&front);
            state.dropped_events = state.dropped_events.saturating_add(1);
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, TrackerState> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
