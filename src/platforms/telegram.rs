//! Poll-delivery adapter: Telegram Bot API.
//!
//! Long-polls `getUpdates` for inbound messages and relays outbound
//! messages via `sendMessage` in HTML parse mode. The poll loop is started
//! by the first handler registration and stopped — not idled — by the last
//! removal; transient poll errors back off exponentially with jitter and
//! never kill the loop.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use serde_json::{json, Value};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::client::core::{spawn_loop, ClientRuntime};
use crate::client::{
    Capabilities, ClientError, ConnectionState, EventHandler, HandlerId, HealthSnapshot, Identity,
    OutboundAttachment, OutboundContent, ProtocolClient, SendReceipt,
};
use crate::config::{DeliveryConfig, HttpConfig};
use crate::normalize::update;
use crate::sanitize::sanitize_html;
use crate::session::Token;

/// Default Bot API endpoint.
pub const DEFAULT_API_BASE: &str = "https://api.telegram.org";

/// Initial backoff after a poll failure, in milliseconds.
const INITIAL_BACKOFF_MS: u64 = 1_000;

/// Maximum backoff after repeated poll failures, in milliseconds.
const MAX_BACKOFF_MS: u64 = 30_000;

/// Maximum random jitter added to each backoff, in milliseconds.
const BACKOFF_JITTER_MS: u64 = 250;

/// Extra seconds added to the HTTP timeout beyond the long-poll hold time,
/// so the TCP socket stays open while the server holds the request.
const POLL_TIMEOUT_MARGIN_SECS: u64 = 10;

/// Adapter configuration.
#[derive(Debug, Clone)]
pub struct TelegramConfig {
    /// Bot API base URL.
    pub base_url: String,
    /// Server-side hold time for `getUpdates`, in seconds.
    pub poll_timeout_seconds: u32,
}

impl Default for TelegramConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_API_BASE.to_owned(),
            poll_timeout_seconds: 25,
        }
    }
}

/// Bot API transport, stubbed in tests.
#[async_trait]
pub trait BotApi: Send + Sync {
    /// Invoke one Bot API method with a JSON params object.
    ///
    /// # Errors
    ///
    /// [`ClientError::AuthenticationFailed`] for rejected tokens, transport
    /// and API errors otherwise.
    async fn call(
        &self,
        token: &str,
        method: &str,
        params: Value,
        timeout: Option<Duration>,
    ) -> Result<Value, ClientError>;
}

/// Reqwest-backed [`BotApi`].
pub struct HttpBotApi {
    client: reqwest::Client,
    base_url: String,
}

impl HttpBotApi {
    /// Build a transport with the configured timeouts.
    pub fn new(base_url: impl Into<String>, http: &HttpConfig) -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(http.connect_timeout_secs))
            .timeout(Duration::from_secs(http.request_timeout_secs))
            .build()
            .unwrap_or_else(|e| {
                warn!(error = %e, "failed to build HTTP client with timeouts, using default");
                reqwest::Client::default()
            });
        Self {
            client,
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl BotApi for HttpBotApi {
    async fn call(
        &self,
        token: &str,
        method: &str,
        params: Value,
        timeout: Option<Duration>,
    ) -> Result<Value, ClientError> {
        let url = format!("{}/bot{token}/{method}", self.base_url);
        let mut request = self.client.post(&url).json(&params);
        if let Some(timeout) = timeout {
            request = request.timeout(timeout);
        }
        let response: BotApiResponse = request.send().await?.json().await?;

        if !response.ok {
            let description = response
                .description
                .unwrap_or_else(|| "unknown error".to_owned());
            return match response.error_code {
                Some(401 | 403) => Err(ClientError::AuthenticationFailed(description)),
                _ => Err(ClientError::Api(description)),
            };
        }
        Ok(response.result.unwrap_or(Value::Null))
    }
}

/// Generic Bot API response wrapper.
#[derive(Debug, serde::Deserialize)]
struct BotApiResponse {
    ok: bool,
    result: Option<Value>,
    description: Option<String>,
    error_code: Option<i64>,
}

/// Poll-delivery protocol client for the Bot API.
pub struct TelegramClient {
    runtime: Arc<ClientRuntime>,
    api: Arc<dyn BotApi>,
    config: TelegramConfig,
    bot_token: std::sync::Mutex<Option<String>>,
    offset: Arc<std::sync::Mutex<Option<i64>>>,
}

impl TelegramClient {
    /// Create a client over the given transport.
    pub fn new(api: Arc<dyn BotApi>, config: TelegramConfig, delivery: DeliveryConfig) -> Self {
        Self {
            runtime: Arc::new(ClientRuntime::new(delivery)),
            api,
            config,
            bot_token: std::sync::Mutex::new(None),
            offset: Arc::new(std::sync::Mutex::new(None)),
        }
    }

    /// Create a client talking to the real Bot API.
    pub fn over_http(config: TelegramConfig, http: &HttpConfig, delivery: DeliveryConfig) -> Self {
        let api = Arc::new(HttpBotApi::new(config.base_url.clone(), http));
        Self::new(api, config, delivery)
    }

    fn token(&self) -> Result<String, ClientError> {
        lock(&self.bot_token)
            .clone()
            .ok_or(ClientError::NotConnected)
    }

    async fn start_poll_loop(&self) {
        if self.runtime.background_active().await {
            return;
        }
        let shutdown = self.runtime.begin_background().await;
        let handle = spawn_loop(
            "telegram-poll",
            poll_loop(
                Arc::clone(&self.runtime),
                Arc::clone(&self.api),
                self.token().unwrap_or_default(),
                self.config.clone(),
                Arc::clone(&self.offset),
                shutdown,
            ),
        );
        self.runtime.attach_task(handle).await;
    }
}

#[async_trait]
impl ProtocolClient for TelegramClient {
    async fn connect(&self, token: &Token) -> Result<(), ClientError> {
        if self.runtime.is_connected() {
            return Ok(());
        }
        self.runtime.set_state(ConnectionState::Connecting);

        let me = self
            .api
            .call(&token.secret, "getMe", json!({}), None)
            .await
            .map_err(|e| {
                self.runtime.set_state(ConnectionState::Disconnected);
                e
            })?;

        let user_id = crate::normalize::str_field(&me, "id")
            .ok_or_else(|| ClientError::Api("getMe returned no id".to_owned()))?;
        self.runtime.store_identity(Identity {
            user_id,
            display_name: me
                .get("first_name")
                .and_then(Value::as_str)
                .map(str::to_owned),
            address: me.get("username").and_then(Value::as_str).map(str::to_owned),
            tenant: None,
        });
        self.runtime.store_capabilities(Capabilities {
            text: true,
            edits: true,
            deletes: true,
            reactions: false,
            threads: false,
            typing: true,
            read_receipts: false,
            attachment_kinds: Vec::new(),
        });

        *lock(&self.bot_token) = Some(token.secret.clone());
        self.runtime.set_state(ConnectionState::Connected);
        info!("Telegram client connected");

        if !self.runtime.handlers().is_empty() {
            self.start_poll_loop().await;
        }
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), ClientError> {
        self.runtime.stop_background().await;
        *lock(&self.bot_token) = None;
        self.runtime.clear_connection();
        Ok(())
    }

    async fn is_connected(&self) -> bool {
        self.runtime.is_connected()
    }

    async fn fetch_identity(&self) -> Result<Identity, ClientError> {
        self.runtime.identity().ok_or(ClientError::NotConnected)
    }

    async fn describe_capabilities(&self) -> Capabilities {
        self.runtime.capabilities()
    }

    async fn list_members(&self) -> Result<Vec<Value>, ClientError> {
        // The Bot API cannot enumerate an account's peers; the member
        // snapshot is always empty for this platform.
        Ok(Vec::new())
    }

    async fn list_conversations(&self) -> Result<Vec<Value>, ClientError> {
        Ok(Vec::new())
    }

    async fn send_message(
        &self,
        conversation: &str,
        content: &OutboundContent,
        attachments: &[OutboundAttachment],
    ) -> Result<SendReceipt, ClientError> {
        if !attachments.is_empty() {
            return Err(ClientError::Unsupported("attachments"));
        }
        let token = self.token()?;

        let mut params = json!({ "chat_id": conversation });
        if let Some(html) = &content.html {
            params["text"] = Value::from(sanitize_html(html));
            params["parse_mode"] = Value::from("HTML");
        } else if let Some(text) = &content.text {
            params["text"] = Value::from(text.clone());
        } else {
            return Err(ClientError::Api("message content is empty".to_owned()));
        }
        if let Some(thread) = &content.thread {
            if let Ok(reply_to) = thread.parse::<i64>() {
                params["reply_to_message_id"] = Value::from(reply_to);
            }
        }

        let result = self
            .api
            .call(&token, "sendMessage", params, None)
            .await
            .map_err(|e| match e {
                // A rejected token mid-operation means the session is gone;
                // the caller must evict this client and re-link.
                ClientError::AuthenticationFailed(_) => ClientError::SessionRevoked,
                other => other,
            })?;

        debug!(conversation, "message sent");
        Ok(SendReceipt {
            conversation_id: conversation.to_owned(),
            message_id: crate::normalize::str_field(&result, "message_id"),
            timestamp: crate::normalize::str_field(&result, "date"),
            attachments: Vec::new(),
        })
    }

    async fn add_event_handler(&self, handler: Arc<dyn EventHandler>) -> HandlerId {
        let (id, was_empty) = self.runtime.handlers().add(handler);
        if was_empty && self.runtime.is_connected() {
            self.start_poll_loop().await;
        }
        id
    }

    async fn remove_event_handler(&self, id: HandlerId) {
        if self.runtime.handlers().remove(id) {
            // Last handler gone: stop the poll loop outright.
            self.runtime.stop_background().await;
        }
    }

    async fn acknowledge_event(&self, event_id: &str) -> Result<(), ClientError> {
        // The Bot API has no read-acknowledgement call; the ack is
        // tracker-local.
        self.runtime.tracker().acknowledge(event_id);
        Ok(())
    }

    async fn health(&self) -> HealthSnapshot {
        self.runtime.health(None)
    }
}

async fn poll_loop(
    runtime: Arc<ClientRuntime>,
    api: Arc<dyn BotApi>,
    token: String,
    config: TelegramConfig,
    offset: Arc<std::sync::Mutex<Option<i64>>>,
    mut shutdown: watch::Receiver<bool>,
) {
    let long_poll_timeout = Duration::from_secs(
        u64::from(config.poll_timeout_seconds).saturating_add(POLL_TIMEOUT_MARGIN_SECS),
    );
    let mut backoff_ms = INITIAL_BACKOFF_MS;

    loop {
        if *shutdown.borrow() {
            break;
        }

        let mut params = json!({ "timeout": config.poll_timeout_seconds });
        if let Some(current) = *lock(&offset) {
            params["offset"] = Value::from(current);
        }

        let result = tokio::select! {
            _ = shutdown.changed() => break,
            result = api.call(&token, "getUpdates", params, Some(long_poll_timeout)) => result,
        };

        match result {
            Ok(value) => {
                backoff_ms = INITIAL_BACKOFF_MS;
                runtime.tracker().reset_errors();

                let updates = value.as_array().cloned().unwrap_or_default();
                for raw in &updates {
                    if let Some(update_id) = raw.get("update_id").and_then(Value::as_i64) {
                        *lock(&offset) = Some(update_id.saturating_add(1));
                    }
                    match update::normalize(raw) {
                        Some(event) => runtime.dispatch(&event).await,
                        None => runtime.tracker().record_skip(),
                    }
                }
            }
            Err(e) => {
                runtime.tracker().record_error();
                let jitter = rand::thread_rng().gen_range(0..=BACKOFF_JITTER_MS);
                warn!(error = %e, backoff_ms, "poll error, backing off");
                tokio::select! {
                    _ = shutdown.changed() => break,
                    () = tokio::time::sleep(Duration::from_millis(backoff_ms.saturating_add(jitter))) => {}
                }
                backoff_ms = backoff_ms.saturating_mul(2).min(MAX_BACKOFF_MS);
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
