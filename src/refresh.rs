//! Single-flight credential refresh, ahead of expiry.
//!
//! Every authenticated call goes through [`TokenCell::ensure_fresh`]: when
//! the current token has a known expiry inside the refresh margin, exactly
//! one refresh runs no matter how many callers race. Callers that arrive
//! while a refresh is in flight wait on the gate and re-check the (now
//! fresh) token instead of issuing a second refresh. A failed refresh
//! leaves the token unchanged and propagates to the caller that triggered
//! it.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, info};

use crate::session::Token;

/// Errors from credential refresh.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RefreshError {
    /// The refresh endpoint rejected or failed the request.
    #[error("credential refresh failed: {0}")]
    Failed(String),

    /// The token expires but carries no refresh secret.
    #[error("token expires but has no refresh secret")]
    NoRefreshSecret,

    /// No token has been installed yet.
    #[error("no token installed")]
    NoToken,
}

/// Exchanges an expiring token for a fresh one.
#[async_trait]
pub trait TokenRefresher: Send + Sync {
    /// Produce a replacement for `current`.
    ///
    /// # Errors
    ///
    /// Returns [`RefreshError`] when the exchange fails; the caller keeps
    /// the old token.
    async fn refresh(&self, current: &Token) -> Result<Token, RefreshError>;
}

/// Receives the fresh token after a successful refresh, typically to
/// persist the updated session record.
#[async_trait]
pub trait TokenSink: Send + Sync {
    /// Observe the freshly installed token.
    async fn token_updated(&self, token: &Token);
}

/// Holds one client's live token and serializes refreshes.
pub struct TokenCell {
    margin: Duration,
    current: std::sync::Mutex<Option<Token>>,
    gate: tokio::sync::Mutex<()>,
    sink: std::sync::Mutex<Option<Arc<dyn TokenSink>>>,
}

impl TokenCell {
    /// Create a cell with the given refresh margin.
    pub fn new(margin: Duration) -> Self {
        Self {
            margin,
            current: std::sync::Mutex::new(None),
            gate: tokio::sync::Mutex::new(()),
            sink: std::sync::Mutex::new(None),
        }
    }

    /// Install the token to use, replacing any previous one.
    pub fn install(&self, token: Token) {
        *lock(&self.current) = Some(token);
    }

    /// Discard the installed token.
    pub fn clear(&self) {
        *lock(&self.current) = None;
    }

    /// The currently installed token.
    pub fn current(&self) -> Option<Token> {
        lock(&self.current).clone()
    }

    /// Register the sink notified after each successful refresh.
    pub fn set_sink(&self, sink: Arc<dyn TokenSink>) {
        *lock(&self.sink) = Some(sink);
    }

    /// Whether `token` is inside the refresh margin.
    ///
    /// Tokens without an expiry never need a refresh.
    pub fn needs_refresh(&self, token: &Token) -> bool {
        let Some(expires_at) = token.expires_at else {
            return false;
        };
        let margin = chrono::Duration::from_std(self.margin).unwrap_or(chrono::Duration::zero());
        expires_at.signed_duration_since(Utc::now()) <= margin
    }

    /// Return a token valid for the next authenticated call, refreshing it
    /// first when it is inside the margin.
    ///
    /// # Errors
    ///
    /// Returns [`RefreshError::NoToken`] before [`install`](Self::install),
    /// and propagates refresher failures with the token left unchanged.
    pub async fn ensure_fresh(
        &self,
        refresher: &dyn TokenRefresher,
    ) -> Result<Token, RefreshError> {
        let token = self.current().ok_or(RefreshError::NoToken)?;
        if !self.needs_refresh(&token) {
            return Ok(token);
        }

        let _flight = self.gate.lock().await;

        // Re-check under the gate: a concurrent caller may have already
        // refreshed while we waited.
        let token = self.current().ok_or(RefreshError::NoToken)?;
        if !self.needs_refresh(&token) {
            debug!("token already refreshed by concurrent caller");
            return Ok(token);
        }

        let fresh = refresher.refresh(&token).await?;
        *lock(&self.current) = Some(fresh.clone());
        info!(expires_at = ?fresh.expires_at, "credential refreshed");

        let sink = lock(&self.sink).clone();
        if let Some(sink) = sink {
            sink.token_updated(&fresh).await;
        }

        Ok(fresh)
    }
}

impl std::fmt::Debug for TokenCell {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenCell")
            .field("margin", &self.margin)
            .field("installed", &lock(&self.current).is_some())
            .finish()
    }
}

fn lock<T>(mutex: &std::sync::Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
