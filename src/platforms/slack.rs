//! Socket-delivery adapter: team chat with a realtime socket and a Web API
//! (Slack shaped).
//!
//! Synchronous operations (identity, listing, sending) go through the Web
//! API; inbound events arrive over a Socket Mode websocket whose envelopes
//! are acknowledged back over the same socket when the daemon acks the
//! corresponding canonical event. File attachments use the three-step
//! external upload: open an upload slot, transfer the bytes, finalize —
//! uploaded files are referenced from the message as remote-file blocks.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::client::core::{spawn_loop, ClientRuntime};
use crate::client::{
    AttachmentReceipt, Capabilities, ClientError, ConnectionState, EventHandler, HandlerId,
    HealthSnapshot, Identity, OutboundAttachment, OutboundContent, ProtocolClient, SendReceipt,
    Tenant,
};
use crate::config::{DeliveryConfig, HttpConfig};
use crate::normalize::{realtime, str_field};
use crate::sanitize::sanitize_card;
use crate::session::Token;

/// Default Web API endpoint.
pub const DEFAULT_API_BASE: &str = "https://slack.com/api";

/// Initial reconnect backoff for the socket, in milliseconds.
const INITIAL_BACKOFF_MS: u64 = 1_000;

/// Maximum reconnect backoff for the socket, in milliseconds.
const MAX_BACKOFF_MS: u64 = 30_000;

/// Most envelope ids remembered for socket acknowledgement.
const ENVELOPE_LEDGER_CAPACITY: usize = 2_048;

/// The websocket stream type used for Socket Mode.
pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Adapter configuration.
#[derive(Debug, Clone)]
pub struct SlackConfig {
    /// Web API base URL.
    pub base_url: String,
    /// Whether to open the realtime socket at connect time. Disabled only
    /// in environments without socket access (tests, webhook-only apps).
    pub enable_socket: bool,
}

impl Default for SlackConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_API_BASE.to_owned(),
            enable_socket: true,
        }
    }
}

/// Web API + socket transport, stubbed in tests.
#[async_trait]
pub trait SlackApi: Send + Sync {
    /// Invoke one Web API method. Returns the raw response object,
    /// including its `ok` field; callers map API-level errors.
    ///
    /// # Errors
    ///
    /// Transport failures only; API-level errors live in the returned
    /// value.
    async fn api_call(
        &self,
        token: &str,
        method: &str,
        params: Option<&Value>,
        payload: Option<&Value>,
    ) -> Result<Value, ClientError>;

    /// Transfer attachment bytes to an upload slot URL.
    ///
    /// # Errors
    ///
    /// Transport failures.
    async fn upload(&self, upload_url: &str, upload: &OutboundAttachment)
        -> Result<(), ClientError>;

    /// Open the Socket Mode websocket at `url`.
    ///
    /// # Errors
    ///
    /// Transport failures.
    async fn open_socket(&self, url: &str) -> Result<WsStream, ClientError>;
}

/// Reqwest + tungstenite backed [`SlackApi`].
pub struct HttpSlackApi {
    client: reqwest::Client,
    base_url: String,
}

impl HttpSlackApi {
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
impl SlackApi for HttpSlackApi {
    async fn api_call(
        &self,
        token: &str,
        method: &str,
        params: Option<&Value>,
        payload: Option<&Value>,
    ) -> Result<Value, ClientError> {
        let url = format!("{}/{method}", self.base_url);
        let mut request = self.client.post(&url).bearer_auth(token);
        if let Some(params) = params.and_then(Value::as_object) {
            let query: Vec<(String, String)> = params
                .iter()
                .map(|(key, value)| {
                    let rendered = match value {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    };
                    (key.clone(), rendered)
                })
                .collect();
            request = request.query(&query);
        }
        if let Some(payload) = payload {
            request = request.json(payload);
        }
        Ok(request.send().await?.json().await?)
    }

    async fn upload(
        &self,
        upload_url: &str,
        upload: &OutboundAttachment,
    ) -> Result<(), ClientError> {
        let content_type = upload
            .content_type
            .clone()
            .unwrap_or_else(|| "application/octet-stream".to_owned());
        let response = self
            .client
            .post(upload_url)
            .header(reqwest::header::CONTENT_TYPE, content_type)
            .body(upload.bytes.clone())
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(ClientError::Api(format!(
                "attachment transfer failed with status {}",
                response.status()
            )));
        }
        Ok(())
    }

    async fn open_socket(&self, url: &str) -> Result<WsStream, ClientError> {
        let (stream, _response) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|e| ClientError::Transport(e.to_string()))?;
        Ok(stream)
    }
}

/// Map a raw Web API response to the error taxonomy.
fn slack_ok(response: Value) -> Result<Value, ClientError> {
    if response.get("ok").and_then(Value::as_bool) == Some(true) {
        return Ok(response);
    }
    let error = str_field(&response, "error").unwrap_or_else(|| "unknown_error".to_owned());
    match error.as_str() {
        "invalid_auth" | "not_authed" | "account_inactive" | "token_revoked"
        | "token_expired" => Err(ClientError::AuthenticationFailed(error)),
        _ => Err(ClientError::Api(error)),
    }
}

/// Remembers which socket envelope carried each canonical event, bounded.
#[derive(Default)]
struct EnvelopeLedger {
    map: HashMap<String, String>,
    order: VecDeque<String>,
}

impl EnvelopeLedger {
    fn remember(&mut self, event_id: &str, envelope_id: &str) {
        if self.map.insert(event_id.to_owned(), envelope_id.to_owned()).is_none() {
            self.order.push_back(event_id.to_owned());
        }
        while self.map.len() > ENVELOPE_LEDGER_CAPACITY {
            let Some(oldest) = self.order.pop_front() else {
                break;
            };
            self.map.remove(&oldest);
        }
    }

    fn take(&mut self, event_id: &str) -> Option<String> {
        self.map.remove(event_id)
    }
}

/// Socket-delivery protocol client for the Web API + Socket Mode pair.
pub struct SlackClient {
    runtime: Arc<ClientRuntime>,
    api: Arc<dyn SlackApi>,
    config: SlackConfig,
    access_token: std::sync::Mutex<Option<String>>,
    envelopes: Arc<std::sync::Mutex<EnvelopeLedger>>,
    ack_tx: std::sync::Mutex<Option<mpsc::UnboundedSender<Value>>>,
}

impl SlackClient {
    /// Create a client over the given transport.
    pub fn new(api: Arc<dyn SlackApi>, config: SlackConfig, delivery: DeliveryConfig) -> Self {
        Self {
            runtime: Arc::new(ClientRuntime::new(delivery)),
            api,
            config,
            access_token: std::sync::Mutex::new(None),
            envelopes: Arc::new(std::sync::Mutex::new(EnvelopeLedger::default())),
            ack_tx: std::sync::Mutex::new(None),
        }
    }

    /// Create a client talking to the real Web API.
    pub fn over_http(config: SlackConfig, http: &HttpConfig, delivery: DeliveryConfig) -> Self {
        let api = Arc::new(HttpSlackApi::new(config.base_url.clone(), http));
        Self::new(api, config, delivery)
    }

    fn token(&self) -> Result<String, ClientError> {
        lock(&self.access_token)
            .clone()
            .ok_or(ClientError::NotConnected)
    }

    async fn call(
        &self,
        method: &str,
        params: Option<&Value>,
        payload: Option<&Value>,
    ) -> Result<Value, ClientError> {
        let token = self.token()?;
        slack_ok(self.api.api_call(&token, method, params, payload).await?)
    }

    /// Walk a cursor-paginated listing method to exhaustion.
    async fn walk_cursor(&self, method: &str, item_key: &str) -> Result<Vec<Value>, ClientError> {
        let mut items = Vec::new();
        let mut cursor: Option<String> = None;

        loop {
            let mut params = json!({ "limit": 200 });
            if let Some(cursor) = &cursor {
                params["cursor"] = Value::from(cursor.clone());
            }
            let response = self.call(method, Some(&params), None).await?;

            if let Some(page) = response.get(item_key).and_then(Value::as_array) {
                items.extend(page.iter().cloned());
            }
            cursor = response
                .get("response_metadata")
                .and_then(|meta| str_field(meta, "next_cursor"))
                .filter(|next| !next.is_empty());
            if cursor.is_none() {
                break;
            }
        }
        Ok(items)
    }

    /// Run the three-step upload for one attachment, returning its receipt
    /// and the remote-file block referencing it.
    async fn upload_attachment(
        &self,
        conversation: &str,
        thread: Option<&str>,
        attachment: &OutboundAttachment,
    ) -> Result<(AttachmentReceipt, Value), ClientError> {
        // Step 1: open an upload slot.
        let slot = self
            .call(
                "files.getUploadURLExternal",
                Some(&json!({
                    "filename": attachment.filename,
                    "length": attachment.bytes.len(),
                })),
                None,
            )
            .await?;
        let upload_url = str_field(&slot, "upload_url")
            .ok_or_else(|| ClientError::Api("upload slot missing url".to_owned()))?;
        let file_id = str_field(&slot, "file_id")
            .ok_or_else(|| ClientError::Api("upload slot missing file id".to_owned()))?;

        // Step 2: transfer the bytes.
        self.api.upload(&upload_url, attachment).await?;

        // Step 3: finalize and bind to the conversation.
        let mut complete = json!({
            "files": [{ "id": file_id, "title": attachment.title }],
            "channel_id": conversation,
        });
        if let Some(thread) = thread {
            complete["thread_ts"] = Value::from(thread.to_owned());
        }
        let done = self
            .call("files.completeUploadExternal", None, Some(&complete))
            .await?;

        let url = done
            .get("files")
            .and_then(Value::as_array)
            .and_then(|files| files.first())
            .and_then(|file| str_field(file, "permalink"));

        let block = json!({ "type": "file", "source": "remote", "external_id": file_id });
        Ok((AttachmentReceipt { id: file_id, url }, block))
    }

    async fn start_socket(&self) {
        if self.runtime.background_active().await {
            return;
        }
        let shutdown = self.runtime.begin_background().await;
        let (ack_tx, ack_rx) = mpsc::unbounded_channel();
        *lock(&self.ack_tx) = Some(ack_tx);

        let handle = spawn_loop(
            "slack-socket",
            socket_loop(
                Arc::clone(&self.runtime),
                Arc::clone(&self.api),
                self.token().unwrap_or_default(),
                Arc::clone(&self.envelopes),
                ack_rx,
                shutdown,
            ),
        );
        self.runtime.attach_task(handle).await;
    }
}

#[async_trait]
impl ProtocolClient for SlackClient {
    async fn connect(&self, token: &Token) -> Result<(), ClientError> {
        if self.runtime.is_connected() {
            return Ok(());
        }
        self.runtime.set_state(ConnectionState::Connecting);
        *lock(&self.access_token) = Some(token.secret.clone());

        let connect_result: Result<(), ClientError> = async {
            let auth = self.call("auth.test", None, None).await?;
            let user_id = str_field(&auth, "user_id")
                .ok_or_else(|| ClientError::Api("auth.test returned no user id".to_owned()))?;
            let team_id = str_field(&auth, "team_id");

            let profile = self
                .call("users.info", Some(&json!({ "user": user_id })), None)
                .await
                .ok()
                .and_then(|response| response.get("user").cloned());
            let team = self
                .call("team.info", None, None)
                .await
                .ok()
                .and_then(|response| response.get("team").cloned());

            let profile_fields = profile.as_ref().and_then(|user| user.get("profile"));
            self.runtime.store_identity(Identity {
                user_id,
                display_name: profile_fields
                    .and_then(|p| str_field(p, "display_name"))
                    .or_else(|| profile_fields.and_then(|p| str_field(p, "real_name")))
                    .or_else(|| profile.as_ref().and_then(|u| str_field(u, "name"))),
                address: profile_fields.and_then(|p| str_field(p, "email")),
                tenant: team_id.map(|id| Tenant {
                    id,
                    name: team.as_ref().and_then(|t| str_field(t, "name")),
                    domain: team.as_ref().and_then(|t| str_field(t, "domain")),
                }),
            });
            self.runtime.store_capabilities(Capabilities {
                text: true,
                edits: true,
                deletes: true,
                reactions: true,
                threads: true,
                typing: true,
                read_receipts: true,
                attachment_kinds: vec![
                    "image".to_owned(),
                    "video".to_owned(),
                    "audio".to_owned(),
                    "file".to_owned(),
                ],
            });
            Ok(())
        }
        .await;

        if let Err(e) = connect_result {
            *lock(&self.access_token) = None;
            self.runtime.clear_connection();
            return Err(e);
        }

        if self.config.enable_socket {
            self.start_socket().await;
        }
        self.runtime.set_state(ConnectionState::Connected);
        info!("Slack client connected");
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), ClientError> {
        self.runtime.stop_background().await;
        *lock(&self.ack_tx) = None;
        *lock(&self.access_token) = None;
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
        self.walk_cursor("users.list", "members").await
    }

    async fn list_conversations(&self) -> Result<Vec<Value>, ClientError> {
        self.walk_cursor("conversations.list", "channels").await
    }

    async fn send_message(
        &self,
        conversation: &str,
        content: &OutboundContent,
        attachments: &[OutboundAttachment],
    ) -> Result<SendReceipt, ClientError> {
        let mut blocks: Vec<Value> = match content.card.as_ref().map(sanitize_card) {
            Some(Value::Array(entries)) => entries,
            Some(single @ Value::Object(_)) => vec![single],
            _ => Vec::new(),
        };

        let mut receipts = Vec::new();
        for attachment in attachments {
            let (receipt, block) = self
                .upload_attachment(conversation, content.thread.as_deref(), attachment)
                .await?;
            receipts.push(receipt);
            blocks.push(block);
        }

        let mut payload = json!({
            "channel": conversation,
            "text": content.text.clone().unwrap_or_default(),
        });
        if let Some(thread) = &content.thread {
            payload["thread_ts"] = Value::from(thread.clone());
        }
        if !blocks.is_empty() {
            payload["blocks"] = Value::Array(blocks);
        }

        let response = self
            .call("chat.postMessage", None, Some(&payload))
            .await
            .map_err(|e| match e {
                ClientError::AuthenticationFailed(_) => ClientError::SessionRevoked,
                other => other,
            })?;

        debug!(conversation, "message posted");
        let ts = str_field(&response, "ts");
        Ok(SendReceipt {
            conversation_id: conversation.to_owned(),
            message_id: ts.clone(),
            timestamp: ts,
            attachments: receipts,
        })
    }

    async fn add_event_handler(&self, handler: Arc<dyn EventHandler>) -> HandlerId {
        let (id, _) = self.runtime.handlers().add(handler);
        id
    }

    async fn remove_event_handler(&self, id: HandlerId) {
        // The socket stays open regardless of handler count; only
        // disconnect closes it.
        self.runtime.handlers().remove(id);
    }

    async fn acknowledge_event(&self, event_id: &str) -> Result<(), ClientError> {
        self.runtime.tracker().acknowledge(event_id);

        let envelope_id = lock(&self.envelopes).take(event_id);
        let sender = lock(&self.ack_tx).clone();
        if let Some(sender) = sender {
            let mut ack = json!({ "event_id": event_id });
            if let Some(envelope_id) = envelope_id {
                ack["envelope_id"] = Value::from(envelope_id);
            }
            if sender.send(ack).is_err() {
                debug!("socket ack channel closed, ack recorded locally only");
            }
        }
        Ok(())
    }

    async fn health(&self) -> HealthSnapshot {
        self.runtime.health(None)
    }
}

async fn socket_loop(
    runtime: Arc<ClientRuntime>,
    api: Arc<dyn SlackApi>,
    token: String,
    envelopes: Arc<std::sync::Mutex<EnvelopeLedger>>,
    mut ack_rx: mpsc::UnboundedReceiver<Value>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut backoff_ms = INITIAL_BACKOFF_MS;

    loop {
        if *shutdown.borrow() {
            break;
        }

        let opened = open_socket(&api, &token).await;
        let stream = match opened {
            Ok(stream) => {
                backoff_ms = INITIAL_BACKOFF_MS;
                runtime.tracker().reset_errors();
                stream
            }
            Err(e) => {
                runtime.tracker().record_error();
                warn!(error = %e, backoff_ms, "socket open failed, backing off");
                tokio::select! {
                    _ = shutdown.changed() => break,
                    () = tokio::time::sleep(Duration::from_millis(backoff_ms)) => {}
                }
                backoff_ms = backoff_ms.saturating_mul(2).min(MAX_BACKOFF_MS);
                continue;
            }
        };

        read_socket(&runtime, &envelopes, &mut ack_rx, &mut shutdown, stream).await;
        if *shutdown.borrow() {
            break;
        }
        info!("socket closed, reconnecting");
    }
}

async fn open_socket(api: &Arc<dyn SlackApi>, token: &str) -> Result<WsStream, ClientError> {
    let response = slack_ok(
        api.api_call(token, "apps.connections.open", None, None)
            .await?,
    )?;
    let url = str_field(&response, "url")
        .ok_or_else(|| ClientError::Api("connections.open returned no url".to_owned()))?;
    api.open_socket(&url).await
}

/// Read one socket session until it closes or shutdown is signalled.
async fn read_socket(
    runtime: &Arc<ClientRuntime>,
    envelopes: &Arc<std::sync::Mutex<EnvelopeLedger>>,
    ack_rx: &mut mpsc::UnboundedReceiver<Value>,
    shutdown: &mut watch::Receiver<bool>,
    stream: WsStream,
) {
    let (mut sink, mut source) = stream.split();

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                let _ = sink.close().await;
                break;
            }
            ack = ack_rx.recv() => {
                let Some(ack) = ack else { break };
                if let Err(e) = sink.send(Message::Text(ack.to_string().into())).await {
                    warn!(error = %e, "failed to send socket ack");
                }
            }
            frame = source.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => {
                        handle_socket_text(runtime, envelopes, &mut sink, text.as_str()).await;
                    }
                    Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Binary(_) | Message::Frame(_))) => {}
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        runtime.tracker().record_error();
                        warn!(error = %e, "socket read error");
                        break;
                    }
                }
            }
        }
    }
}

async fn handle_socket_text(
    runtime: &Arc<ClientRuntime>,
    envelopes: &Arc<std::sync::Mutex<EnvelopeLedger>>,
    sink: &mut (impl SinkExt<Message> + Unpin),
    text: &str,
) {
    let Ok(frame) = serde_json::from_str::<Value>(text) else {
        runtime.tracker().record_skip();
        return;
    };

    match str_field(&frame, "type").as_deref() {
        Some("hello") => {
            debug!("socket session established");
            return;
        }
        Some("disconnect") => {
            debug!("server requested socket reconnect");
            return;
        }
        _ => {}
    }

    let envelope_id = str_field(&frame, "envelope_id");
    let payload = frame.get("payload").unwrap_or(&frame);

    match realtime::normalize(payload) {
        Some(event) => {
            if let Some(envelope_id) = &envelope_id {
                lock(envelopes).remember(&event.event_id, envelope_id);
            }
            runtime.dispatch(&event).await;
        }
        None => {
            runtime.tracker().record_skip();
            // Nothing downstream will ever ack a skipped payload; release
            // the envelope immediately so the server does not redeliver.
            if let Some(envelope_id) = envelope_id {
                let ack = json!({ "envelope_id": envelope_id });
                let _ = sink.send(Message::Text(ack.to_string().into())).await;
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
