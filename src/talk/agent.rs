//! Agent transport
//!
//! The talk loop only needs three things from the conversational backend:
//! dispatch a message, learn when the run is final, and read the session
//! history back.
//!
//! [`GatewayClient`] is the binding to the external agent gateway. The
//! gateway is a separate service; this crate only speaks its RPC envelope
//! (`{method, params}` in, `{ok, payload, error}` out) and ships no server
//! side of it.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::config::{ConfigSource, RemoteConfig};
use crate::{Error, Result};

/// Threshold above which a timestamp is taken to be in milliseconds
const MILLIS_EPOCH_THRESHOLD: f64 = 10_000_000_000.0;

/// `chat.send` parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatSendRequest {
    /// Target session
    pub session_key: String,
    /// Prompt text
    pub message: String,
    /// Reasoning effort hint
    pub thinking: String,
    /// Server-side run timeout
    pub timeout_ms: u64,
    /// Dedupe key; doubles as the expected run id
    pub idempotency_key: String,
}

/// Chat lifecycle event for a run
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatEvent {
    /// Run the event belongs to
    pub run_id: String,
    /// Run state (`"final"` once the reply is complete)
    pub state: String,
}

impl ChatEvent {
    /// Whether this event marks the run as complete
    #[must_use]
    pub fn is_final(&self) -> bool {
        self.state == "final"
    }
}

/// One message from `chat.history`
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct HistoryMessage {
    /// Author role
    #[serde(default)]
    pub role: Option<String>,
    /// Content parts (`[{"type":"text","text":...}]`)
    #[serde(default)]
    pub content: Value,
    /// Seconds or milliseconds since the epoch; numeric strings are accepted
    #[serde(default, deserialize_with = "lenient_timestamp")]
    pub timestamp: Option<f64>,
}

impl HistoryMessage {
    /// Whether the assistant wrote this message
    #[must_use]
    pub fn is_assistant(&self) -> bool {
        self.role.as_deref() == Some("assistant")
    }

    /// Trimmed, non-blank text parts joined by newlines
    #[must_use]
    pub fn text(&self) -> Option<String> {
        let parts: Vec<&str> = self
            .content
            .as_array()?
            .iter()
            .filter_map(|part| part.get("text")?.as_str())
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .collect();
        (!parts.is_empty()).then(|| parts.join("\n"))
    }
}

/// Request/response and event access to the conversational backend
#[async_trait]
pub trait AgentTransport: Send + Sync {
    /// Dispatch a message; returns the run id when the backend reports one
    ///
    /// # Errors
    ///
    /// Returns error if the backend rejects or cannot receive the message
    async fn send_chat(&self, request: &ChatSendRequest) -> Result<Option<String>>;

    /// Fetch the ordered message history for a session
    ///
    /// # Errors
    ///
    /// Returns error if the backend cannot be queried
    async fn chat_history(&self, session_key: &str) -> Result<Vec<HistoryMessage>>;

    /// Ask for chat events for a session to be delivered
    ///
    /// # Errors
    ///
    /// Returns error if the subscription is refused
    async fn subscribe_chat(&self, _session_key: &str) -> Result<()> {
        Ok(())
    }

    /// Whether chat events can reach [`crate::talk::TalkMode::handle_agent_event`]
    fn supports_chat_events(&self) -> bool {
        true
    }

    /// Whether the backend is reachable
    fn is_connected(&self) -> bool {
        true
    }
}

/// Whether a history timestamp is at or after the request time
///
/// Large values are treated as milliseconds and compared with 500ms of
/// slack, smaller ones as seconds with 0.5s of slack.
#[must_use]
pub fn is_message_timestamp_after(timestamp: f64, since_seconds: f64) -> bool {
    if timestamp > MILLIS_EPOCH_THRESHOLD {
        timestamp >= since_seconds * 1000.0 - 500.0
    } else {
        timestamp >= since_seconds - 0.5
    }
}

/// Newest assistant text written after `since_seconds`
///
/// Messages without a timestamp are accepted.
#[must_use]
pub fn latest_assistant_text(messages: &[HistoryMessage], since_seconds: Option<f64>) -> Option<String> {
    messages
        .iter()
        .rev()
        .filter(|m| m.is_assistant())
        .filter(|m| match (since_seconds, m.timestamp) {
            (Some(since), Some(ts)) => is_message_timestamp_after(ts, since),
            _ => true,
        })
        .find_map(HistoryMessage::text)
}

#[derive(Serialize)]
struct RpcRequest<'a, P> {
    method: &'a str,
    params: P,
}

#[derive(Deserialize)]
struct RpcResponse {
    #[serde(default)]
    ok: bool,
    #[serde(default)]
    payload: Value,
    error: Option<RpcError>,
}

#[derive(Deserialize)]
struct RpcError {
    message: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SendResult {
    run_id: Option<String>,
}

#[derive(Deserialize)]
struct HistoryResult {
    #[serde(default)]
    messages: Vec<Value>,
}

fn lenient_timestamp<'de, D>(deserializer: D) -> std::result::Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(value.as_ref().and_then(value_as_f64))
}

fn value_as_f64(value: &Value) -> Option<f64> {
    let number = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }?;
    number.is_finite().then_some(number)
}

/// Parse history items one by one, skipping any that are not messages
fn parse_history(payload: Value) -> Result<Vec<HistoryMessage>> {
    let result: HistoryResult = serde_json::from_value(payload)?;
    let total = result.messages.len();
    let messages: Vec<HistoryMessage> = result
        .messages
        .into_iter()
        .filter_map(|item| serde_json::from_value(item).ok())
        .collect();
    if messages.len() < total {
        tracing::debug!(
            skipped = total - messages.len(),
            "skipped unreadable history items"
        );
    }
    Ok(messages)
}

/// Gateway RPC over HTTP (`POST {url}/rpc`)
///
/// Plain HTTP cannot push chat events, so completion is detected by polling
/// history.
pub struct GatewayClient {
    url: String,
    client: reqwest::Client,
    auth_token: Option<String>,
    connected: AtomicBool,
}

impl GatewayClient {
    /// Create a client for the gateway at `url`
    #[must_use]
    pub fn new(url: &str) -> Self {
        Self {
            url: url.trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
            auth_token: None,
            connected: AtomicBool::new(true),
        }
    }

    /// Set the bearer token for gateway calls
    #[must_use]
    pub fn with_auth_token(mut self, token: Option<String>) -> Self {
        self.auth_token = token;
        self
    }

    /// Call an RPC method and return its payload
    ///
    /// # Errors
    ///
    /// Returns error if the request fails or the gateway reports an error
    pub async fn request<P: Serialize + Send>(&self, method: &str, params: P) -> Result<Value> {
        let mut builder = self
            .client
            .post(format!("{}/rpc", self.url))
            .json(&RpcRequest { method, params });
        if let Some(token) = &self.auth_token {
            builder = builder.bearer_auth(token);
        }

        let response = match builder.send().await {
            Ok(response) => {
                self.connected.store(true, Ordering::SeqCst);
                response
            }
            Err(e) => {
                if e.is_connect() {
                    self.connected.store(false, Ordering::SeqCst);
                }
                return Err(e.into());
            }
        };

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Agent(format!("{method} failed: {status} {body}")));
        }

        let body: RpcResponse = response.json().await?;
        if !body.ok {
            let message = body
                .error
                .map_or_else(|| "unknown error".to_string(), |e| e.message);
            return Err(Error::Agent(format!("{method} failed: {message}")));
        }
        Ok(body.payload)
    }
}

#[async_trait]
impl AgentTransport for GatewayClient {
    async fn send_chat(&self, request: &ChatSendRequest) -> Result<Option<String>> {
        let payload = self.request("chat.send", request).await?;
        let result: SendResult = serde_json::from_value(payload).unwrap_or(SendResult { run_id: None });
        Ok(result.run_id)
    }

    async fn chat_history(&self, session_key: &str) -> Result<Vec<HistoryMessage>> {
        let payload = self
            .request("chat.history", serde_json::json!({ "sessionKey": session_key }))
            .await?;
        parse_history(payload)
    }

    async fn subscribe_chat(&self, session_key: &str) -> Result<()> {
        self.request("chat.subscribe", serde_json::json!({ "sessionKey": session_key }))
            .await
            .map(|_| ())
    }

    fn supports_chat_events(&self) -> bool {
        false
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ConfigSource for GatewayClient {
    async fn talk_config(&self) -> Result<RemoteConfig> {
        let payload = self
            .request("talk.config", serde_json::json!({ "includeSecrets": true }))
            .await?;
        Ok(serde_json::from_value(payload)?)
    }
}
