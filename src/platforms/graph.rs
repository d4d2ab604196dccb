//! Webhook-delivery adapter: organizational chat over a paginated HTTP
//! graph API (Microsoft Graph shaped).
//!
//! Inbound delivery uses change-notification subscriptions kept alive by a
//! [`SubscriptionRenewer`]; the webhook HTTP listener itself belongs to the
//! daemon, which feeds received notifications into
//! [`GraphClient::ingest_notification`]. Every authenticated call goes
//! through the single-flight token refresh gate first.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::client::core::ClientRuntime;
use crate::client::{
    Capabilities, ClientError, ConnectionState, EventHandler, HandlerId, HealthSnapshot, Identity,
    OutboundAttachment, OutboundContent, ProtocolClient, SendReceipt, Tenant,
};
use crate::config::{DeliveryConfig, HttpConfig, RefreshConfig};
use crate::normalize::{graph as graph_wire, str_field};
use crate::refresh::{TokenCell, TokenRefresher, TokenSink};
use crate::renewal::{Subscription, SubscriptionRenewer, SubscriptionTransport};
use crate::sanitize::{sanitize_card, sanitize_html, wrap_plain_text};
use crate::session::Token;

/// Default graph endpoint.
pub const DEFAULT_API_BASE: &str = "https://graph.microsoft.com/v1.0";

/// Default change-notification resource.
pub const DEFAULT_RESOURCE: &str = "/chats/getAllMessages";

/// Adapter configuration.
#[derive(Debug, Clone)]
pub struct GraphConfig {
    /// Graph API base URL.
    pub base_url: String,
    /// Tenant this client is scoped to.
    pub tenant: Option<Tenant>,
    /// Public callback URL registered with each subscription.
    pub notification_url: String,
    /// Resource path subscribed for change notifications.
    pub resource: String,
    /// Requested subscription lifetime, in minutes.
    pub subscription_minutes: i64,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_API_BASE.to_owned(),
            tenant: None,
            notification_url: String::new(),
            resource: DEFAULT_RESOURCE.to_owned(),
            subscription_minutes: 55,
        }
    }
}

/// Graph HTTP transport, stubbed in tests.
#[async_trait]
pub trait GraphApi: Send + Sync {
    /// GET a path (or a full next-link URL).
    ///
    /// # Errors
    ///
    /// [`ClientError::AuthenticationFailed`] on rejected bearer tokens,
    /// transport and API errors otherwise.
    async fn get(&self, bearer: &str, path_or_url: &str) -> Result<Value, ClientError>;

    /// POST a JSON body.
    ///
    /// # Errors
    ///
    /// As for [`get`](Self::get).
    async fn post(&self, bearer: &str, path: &str, body: &Value) -> Result<Value, ClientError>;

    /// PATCH a JSON body.
    ///
    /// # Errors
    ///
    /// As for [`get`](Self::get).
    async fn patch(&self, bearer: &str, path: &str, body: &Value) -> Result<Value, ClientError>;

    /// DELETE a path.
    ///
    /// # Errors
    ///
    /// As for [`get`](Self::get).
    async fn delete(&self, bearer: &str, path: &str) -> Result<(), ClientError>;
}

/// Reqwest-backed [`GraphApi`].
pub struct HttpGraphApi {
    client: reqwest::Client,
    base_url: String,
}

impl HttpGraphApi {
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

    fn url_for(&self, path_or_url: &str) -> String {
        if path_or_url.starts_with("http://") || path_or_url.starts_with("https://") {
            path_or_url.to_owned()
        } else {
            format!("{}{path_or_url}", self.base_url)
        }
    }

    async fn decode(response: reqwest::Response) -> Result<Value, ClientError> {
        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED {
            return Err(ClientError::AuthenticationFailed(
                "graph API rejected the bearer token".to_owned(),
            ));
        }
        if status == reqwest::StatusCode::NO_CONTENT {
            return Ok(Value::Null);
        }
        let body: Value = response.json().await.unwrap_or(Value::Null);
        if !status.is_success() {
            let message = body
                .get("error")
                .and_then(|e| e.get("message"))
                .and_then(Value::as_str)
                .unwrap_or("unknown graph error");
            return Err(ClientError::Api(format!("{status}: {message}")));
        }
        Ok(body)
    }
}

#[async_trait]
impl GraphApi for HttpGraphApi {
    async fn get(&self, bearer: &str, path_or_url: &str) -> Result<Value, ClientError> {
        let response = self
            .client
            .get(self.url_for(path_or_url))
            .bearer_auth(bearer)
            .send()
            .await?;
        Self::decode(response).await
    }

    async fn post(&self, bearer: &str, path: &str, body: &Value) -> Result<Value, ClientError> {
        let response = self
            .client
            .post(self.url_for(path))
            .bearer_auth(bearer)
            .json(body)
            .send()
            .await?;
        Self::decode(response).await
    }

    async fn patch(&self, bearer: &str, path: &str, body: &Value) -> Result<Value, ClientError> {
        let response = self
            .client
            .patch(self.url_for(path))
            .bearer_auth(bearer)
            .json(body)
            .send()
            .await?;
        Self::decode(response).await
    }

    async fn delete(&self, bearer: &str, path: &str) -> Result<(), ClientError> {
        let response = self
            .client
            .delete(self.url_for(path))
            .bearer_auth(bearer)
            .send()
            .await?;
        Self::decode(response).await.map(|_| ())
    }
}

/// Bearer resolution shared by the client and its subscription transport:
/// current token, refreshed first when inside the margin.
struct BearerSource {
    tokens: TokenCell,
    refresher: std::sync::Mutex<Option<Arc<dyn TokenRefresher>>>,
}

impl BearerSource {
    fn new(refresh: &RefreshConfig) -> Self {
        Self {
            tokens: TokenCell::new(refresh.margin()),
            refresher: std::sync::Mutex::new(None),
        }
    }

    async fn bearer(&self) -> Result<String, ClientError> {
        let refresher = lock(&self.refresher).clone();
        match refresher {
            Some(refresher) => Ok(self.tokens.ensure_fresh(refresher.as_ref()).await?.secret),
            None => Ok(self
                .tokens
                .current()
                .ok_or(ClientError::NotConnected)?
                .secret),
        }
    }
}

/// Webhook-delivery protocol client for a graph API.
pub struct GraphClient {
    runtime: Arc<ClientRuntime>,
    api: Arc<dyn GraphApi>,
    config: GraphConfig,
    bearer: Arc<BearerSource>,
    window: Duration,
    renewer: tokio::sync::Mutex<Option<SubscriptionRenewer>>,
}

impl GraphClient {
    /// Create a client over the given transport.
    pub fn new(
        api: Arc<dyn GraphApi>,
        config: GraphConfig,
        delivery: DeliveryConfig,
        refresh: RefreshConfig,
    ) -> Self {
        Self {
            runtime: Arc::new(ClientRuntime::new(delivery)),
            api,
            bearer: Arc::new(BearerSource::new(&refresh)),
            window: refresh.renewal_window(),
            config,
            renewer: tokio::sync::Mutex::new(None),
        }
    }

    /// Create a client talking to the real graph API.
    pub fn over_http(
        config: GraphConfig,
        http: &HttpConfig,
        delivery: DeliveryConfig,
        refresh: RefreshConfig,
    ) -> Self {
        let api = Arc::new(HttpGraphApi::new(config.base_url.clone(), http));
        Self::new(api, config, delivery, refresh)
    }

    /// Install the refresher used to exchange expiring tokens.
    pub fn set_refresher(&self, refresher: Arc<dyn TokenRefresher>) {
        *lock(&self.bearer.refresher) = Some(refresher);
    }

    /// Install the sink notified after each successful refresh.
    pub fn set_token_sink(&self, sink: Arc<dyn TokenSink>) {
        self.bearer.tokens.set_sink(sink);
    }

    /// Feed webhook notification payloads delivered for `conversation`.
    ///
    /// Accepts a graph notification envelope (`{"value": [...]}`) or a bare
    /// message resource. Payloads that fail normalization are counted and
    /// dropped, never surfaced to handlers.
    pub async fn ingest_notification(&self, conversation: &str, payload: &Value) {
        let items: Vec<&Value> = match payload.get("value").and_then(Value::as_array) {
            Some(values) => values.iter().collect(),
            None => vec![payload],
        };

        let tenant_id = self.config.tenant.as_ref().map(|t| t.id.clone());
        for item in items {
            let resource = item.get("resourceData").unwrap_or(item);
            match graph_wire::normalize(conversation, tenant_id.as_deref(), resource) {
                Some(event) => self.runtime.dispatch(&event).await,
                None => self.runtime.tracker().record_skip(),
            }
        }
    }

    /// One-shot catch-up: fetch the most recent messages of a conversation
    /// and dispatch them through the normal pipeline.
    ///
    /// # Errors
    ///
    /// Propagates transport and authentication errors.
    pub async fn backfill(&self, conversation: &str, top: u32) -> Result<(), ClientError> {
        let bearer = self.bearer.bearer().await?;
        let path =
            format!("/chats/{conversation}/messages?$top={top}&$orderby=lastModifiedDateTime%20asc");
        let page = self.api.get(&bearer, &path).await?;

        let tenant_id = self.config.tenant.as_ref().map(|t| t.id.clone());
        if let Some(values) = page.get("value").and_then(Value::as_array) {
            for item in values {
                match graph_wire::normalize(conversation, tenant_id.as_deref(), item) {
                    Some(event) => self.runtime.dispatch(&event).await,
                    None => self.runtime.tracker().record_skip(),
                }
            }
        }
        Ok(())
    }

    async fn collect_paged(&self, first_path: &str) -> Result<Vec<Value>, ClientError> {
        let mut items = Vec::new();
        let mut next: Option<String> = Some(first_path.to_owned());

        while let Some(path_or_url) = next {
            let bearer = self.bearer.bearer().await?;
            let page = self.api.get(&bearer, &path_or_url).await?;
            if let Some(values) = page.get("value").and_then(Value::as_array) {
                items.extend(values.iter().cloned());
            }
            next = str_field(&page, "@odata.nextLink");
        }
        Ok(items)
    }

    async fn subscription_id(&self) -> Option<String> {
        self.renewer
            .lock()
            .await
            .as_ref()
            .and_then(SubscriptionRenewer::subscription_id)
    }
}

#[async_trait]
impl ProtocolClient for GraphClient {
    async fn connect(&self, token: &Token) -> Result<(), ClientError> {
        if self.runtime.is_connected() {
            return Ok(());
        }
        self.runtime.set_state(ConnectionState::Connecting);
        self.bearer.tokens.install(token.clone());

        let connect_result: Result<(), ClientError> = async {
            let bearer = self.bearer.bearer().await?;
            let me = self.api.get(&bearer, "/me").await?;
            let user_id = str_field(&me, "id")
                .ok_or_else(|| ClientError::Api("identity lookup returned no id".to_owned()))?;

            self.runtime.store_identity(Identity {
                user_id,
                display_name: str_field(&me, "displayName"),
                address: str_field(&me, "userPrincipalName").or_else(|| str_field(&me, "mail")),
                tenant: self.config.tenant.clone(),
            });
            self.runtime.store_capabilities(Capabilities {
                text: true,
                edits: true,
                deletes: true,
                reactions: true,
                threads: true,
                typing: false,
                read_receipts: false,
                attachment_kinds: Vec::new(),
            });

            let transport = Arc::new(GraphSubscriptionTransport {
                api: Arc::clone(&self.api),
                bearer: Arc::clone(&self.bearer),
                notification_url: self.config.notification_url.clone(),
                subscription_minutes: self.config.subscription_minutes,
            });
            let renewer =
                SubscriptionRenewer::new(transport, self.config.resource.clone(), self.window);
            renewer.start().await?;
            *self.renewer.lock().await = Some(renewer);
            Ok(())
        }
        .await;

        if let Err(e) = connect_result {
            self.bearer.tokens.clear();
            self.runtime.clear_connection();
            return Err(e);
        }

        self.runtime.set_state(ConnectionState::Connected);
        info!("graph client connected");
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), ClientError> {
        let renewer = self.renewer.lock().await.take();
        if let Some(renewer) = renewer {
            renewer.stop().await;
        }
        self.bearer.tokens.clear();
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
        self.collect_paged("/me/people").await
    }

    async fn list_conversations(&self) -> Result<Vec<Value>, ClientError> {
        self.collect_paged("/me/chats").await
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

        // Plain text destined for the rich-text body is escaped and
        // wrapped; HTML is cleaned against the allow-list.
        let (content_type, body_content) = match (&content.html, &content.text) {
            (Some(html), _) => ("html", sanitize_html(html)),
            (None, Some(text)) => ("html", wrap_plain_text(text)),
            (None, None) => {
                return Err(ClientError::Api("message content is empty".to_owned()));
            }
        };

        let mut body = json!({
            "body": {
                "contentType": content_type,
                "content": body_content,
            }
        });
        if let Some(card) = &content.card {
            body["attachments"] = sanitize_card(card);
        }
        if let Some(thread) = &content.thread {
            body["replyToId"] = Value::from(thread.clone());
        }

        let bearer = self.bearer.bearer().await?;
        let path = format!("/chats/{conversation}/messages");
        let result = self
            .api
            .post(&bearer, &path, &body)
            .await
            .map_err(|e| match e {
                ClientError::AuthenticationFailed(_) => ClientError::SessionRevoked,
                other => other,
            })?;

        debug!(conversation, "graph message sent");
        Ok(SendReceipt {
            conversation_id: conversation.to_owned(),
            message_id: str_field(&result, "id"),
            timestamp: str_field(&result, "createdDateTime"),
            attachments: Vec::new(),
        })
    }

    async fn add_event_handler(&self, handler: Arc<dyn EventHandler>) -> HandlerId {
        let (id, _) = self.runtime.handlers().add(handler);
        id
    }

    async fn remove_event_handler(&self, id: HandlerId) {
        // Webhook delivery keeps the subscription alive independently of
        // handler count; only disconnect tears it down.
        self.runtime.handlers().remove(id);
    }

    async fn acknowledge_event(&self, event_id: &str) -> Result<(), ClientError> {
        self.runtime.tracker().acknowledge(event_id);
        Ok(())
    }

    async fn health(&self) -> HealthSnapshot {
        self.runtime.health(self.subscription_id().await)
    }
}

/// Subscription calls for the renewal loop.
struct GraphSubscriptionTransport {
    api: Arc<dyn GraphApi>,
    bearer: Arc<BearerSource>,
    notification_url: String,
    subscription_minutes: i64,
}

impl GraphSubscriptionTransport {
    fn expiration(&self) -> String {
        Utc::now()
            .checked_add_signed(chrono::Duration::minutes(self.subscription_minutes))
            .unwrap_or_else(Utc::now)
            .to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
    }

    fn parse_subscription(resource: &str, payload: &Value) -> Result<Subscription, ClientError> {
        let id = str_field(payload, "id")
            .or_else(|| str_field(payload, "subscriptionId"))
            .ok_or_else(|| ClientError::Api("subscription response missing id".to_owned()))?;
        let expires_at = str_field(payload, "expirationDateTime")
            .and_then(|raw| chrono::DateTime::parse_from_rfc3339(&raw).ok())
            .map(|dt| dt.with_timezone(&Utc));
        Ok(Subscription {
            id,
            resource: resource.to_owned(),
            expires_at,
        })
    }
}

#[async_trait]
impl SubscriptionTransport for GraphSubscriptionTransport {
    async fn subscribe(&self, resource: &str) -> Result<Subscription, ClientError> {
        let bearer = self.bearer.bearer().await?;
        let body = json!({
            "changeType": "created,updated",
            "notificationUrl": self.notification_url,
            "resource": resource,
            "expirationDateTime": self.expiration(),
        });
        let response = self.api.post(&bearer, "/subscriptions", &body).await?;
        Self::parse_subscription(resource, &response)
    }

    async fn renew(
        &self,
        subscription_id: &str,
        resource: &str,
    ) -> Result<Subscription, ClientError> {
        let bearer = self.bearer.bearer().await?;
        let body = json!({ "expirationDateTime": self.expiration() });
        let path = format!("/subscriptions/{subscription_id}");
        let response = self.api.patch(&bearer, &path, &body).await?;
        Self::parse_subscription(resource, &response)
    }

    async fn unsubscribe(&self, subscription_id: &str) -> Result<(), ClientError> {
        let bearer = self.bearer.bearer().await?;
        let path = format!("/subscriptions/{subscription_id}");
        self.api.delete(&bearer, &path).await
    }
}

fn lock<T>(mutex: &std::sync::Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
