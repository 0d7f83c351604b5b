//! WhatsApp Web bridge adapter.
//!
//! The bridge is a sidecar process that owns the WhatsApp Web session (QR
//! pairing, credential storage, browser automation). This adapter only polls
//! its event feed and calls its send/typing endpoints.

use crate::dedupe::RecentIds;
use crate::traits::ChannelAdapter;
use crate::types::{ChatContext, InboundMessage, OutboundMessage};
use anyhow::{Result, anyhow};
use chrono::Utc;
use reqwest::Url;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::time::Duration;
use tokio::sync::mpsc;

const BRIDGE_CHANNEL_ID: &str = "whatsapp-bridge";
const STATUS_BROADCAST_CHAT: &str = "status@broadcast";
const GROUP_CHAT_SUFFIX: &str = "@g.us";
const RECENT_EVENT_ID_CAPACITY: usize = 4096;
const BRIDGE_RETRY_BASE_MS: u64 = 250;
const BRIDGE_RETRY_MAX_MS: u64 = 30_000;

#[derive(Clone)]
pub struct WhatsAppBridgeAdapter {
    http: reqwest::Client,
    base_url: Url,
    auth_token: Option<String>,
    poll_interval: Duration,
    start_from_latest: bool,
}

/// Session state as reported by the bridge (`GET /session`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BridgeSessionStatus {
    #[serde(default)]
    pub state: String,
    /// Raw QR payload while the bridge waits for pairing.
    #[serde(default)]
    pub qr: Option<String>,
    #[serde(default)]
    pub me: Option<String>,
}

impl WhatsAppBridgeAdapter {
    pub fn new(base_url: &str) -> Result<Self> {
        let base_url = normalize_http_url(base_url, "bridge url")?;
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()?;
        Ok(Self {
            http,
            base_url,
            auth_token: None,
            poll_interval: Duration::from_millis(1000),
            start_from_latest: true,
        })
    }

    pub fn with_auth_token(mut self, auth_token: Option<String>) -> Self {
        self.auth_token = auth_token
            .as_deref()
            .map(str::trim)
            .filter(|token| !token.is_empty())
            .map(ToOwned::to_owned);
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_start_from_latest(mut self, start_from_latest: bool) -> Self {
        self.start_from_latest = start_from_latest;
        self
    }

    fn authorized_request(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match self.auth_token.as_deref() {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| anyhow!("bridge url cannot be a base: {}", self.base_url))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    pub async fn session_status(&self) -> Result<BridgeSessionStatus> {
        let url = self.endpoint(&["session"])?;
        let response = self.authorized_request(self.http.get(url)).send().await?;
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(anyhow!(
                "whatsapp bridge session lookup failed: status={status} body={body}"
            ));
        }
        Ok(serde_json::from_str(&body)?)
    }

    async fn set_chat_typing(&self, chat_id: &str, active: bool) -> Result<()> {
        let chat_id = chat_id.trim();
        if chat_id.is_empty() {
            return Err(anyhow!("chat_id is required"));
        }
        let url = self.endpoint(&["chats", chat_id, "typing"])?;
        self.post_json(url, &serde_json::json!({ "active": active }), "typing")
            .await
    }

    async fn post_json(&self, url: Url, payload: &serde_json::Value, what: &str) -> Result<()> {
        let response = self
            .authorized_request(self.http.post(url))
            .json(payload)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_else(|error| {
                format!("<failed to read bridge error body: {error}>")
            });
            return Err(anyhow!(
                "whatsapp bridge {what} failed: status={status} body={body}"
            ));
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl ChannelAdapter for WhatsAppBridgeAdapter {
    fn channel_id(&self) -> &str {
        BRIDGE_CHANNEL_ID
    }

    async fn start(&self, tx: mpsc::Sender<InboundMessage>) -> Result<()> {
        let adapter = self.clone();
        tokio::spawn(async move {
            if let Err(error) = adapter.run_poll_loop(tx).await {
                tracing::error!(%error, "whatsapp bridge poll loop exited");
            }
        });
        Ok(())
    }

    async fn send(&self, chat_id: &str, message: OutboundMessage) -> Result<()> {
        let chat_id = chat_id.trim();
        if chat_id.is_empty() {
            return Err(anyhow!("chat_id is required"));
        }
        let content = message.content.trim();
        if content.is_empty() {
            return Err(anyhow!("message content is empty"));
        }
        let payload = serde_json::json!({
            "chat_id": chat_id,
            "content": content,
            "reply_to_message_id": message.reply_to_message_id,
        });
        let url = self.endpoint(&["messages"])?;
        self.post_json(url, &payload, "send").await
    }

    async fn send_typing(&self, message: &InboundMessage, active: bool) -> Result<()> {
        self.set_chat_typing(message.chat_id.as_str(), active).await
    }

    async fn self_id(&self) -> Result<Option<String>> {
        let url = self.endpoint(&["me"])?;
        let response = self.authorized_request(self.http.get(url)).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!(
                "whatsapp bridge identity lookup failed: status={status} body={body}"
            ));
        }
        let me: BridgeIdentity = response.json().await?;
        Ok(me.id.map(|id| id.trim().to_string()).filter(|id| !id.is_empty()))
    }

    async fn shutdown(&self) -> Result<()> {
        let url = self.endpoint(&["session", "close"])?;
        self.post_json(url, &serde_json::json!({}), "session close")
            .await
    }
}

impl WhatsAppBridgeAdapter {
    #[tracing::instrument(level = "info", skip_all)]
    async fn run_poll_loop(&self, tx: mpsc::Sender<InboundMessage>) -> Result<()> {
        let mut recent = RecentIds::new(RECENT_EVENT_ID_CAPACITY);
        let mut consecutive_failures: u32 = 0;

        if self.start_from_latest {
            match self.poll_once().await {
                Ok(events) => {
                    for event in &events {
                        match event.kind() {
                            BridgeEventKind::Message => {
                                if let Some(inbound) = normalize_bridge_message(event) {
                                    recent.remember(inbound.message_id.as_str());
                                }
                            }
                            other => log_lifecycle_event(&other, event),
                        }
                    }
                    tracing::info!(
                        seeded_ids = recent.len(),
                        "whatsapp bridge seeded backlog; earlier messages will not be answered"
                    );
                }
                Err(error) => {
                    tracing::warn!(%error, "whatsapp bridge seed poll failed; starting without backlog");
                }
            }
        }

        loop {
            let events = match self.poll_once().await {
                Ok(events) => {
                    consecutive_failures = 0;
                    events
                }
                Err(error) => {
                    consecutive_failures += 1;
                    let delay = transient_retry_delay(consecutive_failures);
                    tracing::warn!(
                        %error,
                        attempt = consecutive_failures,
                        ?delay,
                        "whatsapp bridge poll failed; retrying with backoff"
                    );
                    tokio::time::sleep(delay).await;
                    continue;
                }
            };

            let mut emitted = 0usize;
            for event in &events {
                match event.kind() {
                    BridgeEventKind::Message => {
                        let Some(inbound) = normalize_bridge_message(event) else {
                            continue;
                        };
                        if !recent.remember(inbound.message_id.as_str()) {
                            continue;
                        }
                        // If the receiver is gone, just stop polling.
                        if tx.send(inbound).await.is_err() {
                            tracing::info!("whatsapp bridge inbound queue closed; stopping poll loop");
                            return Ok(());
                        }
                        emitted += 1;
                    }
                    other => log_lifecycle_event(&other, event),
                }
            }

            if emitted > 0 {
                tracing::debug!(emitted, "whatsapp bridge poll cycle complete");
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    async fn poll_once(&self) -> Result<Vec<BridgeEnvelope>> {
        let url = self.endpoint(&["events"])?;
        let response = self.authorized_request(self.http.get(url)).send().await?;
        let status = response.status();
        let body: serde_json::Value = response.json().await?;
        if !status.is_success() {
            return Err(anyhow!(
                "whatsapp bridge poll failed: status={status} body={body}"
            ));
        }
        Ok(extract_poll_events(body))
    }
}

fn normalize_http_url(raw: &str, field: &str) -> Result<Url> {
    let normalized = raw.trim();
    if normalized.is_empty() {
        return Err(anyhow!("{field} is required"));
    }
    let parsed = Url::parse(normalized).map_err(|e| anyhow!("invalid {field}: {e}"))?;
    match parsed.scheme() {
        "http" | "https" => Ok(parsed),
        other => Err(anyhow!("invalid {field} scheme: {other}")),
    }
}

fn transient_retry_delay(attempt: u32) -> Duration {
    let multiplier = 1_u64 << attempt.saturating_sub(1).min(10);
    Duration::from_millis((BRIDGE_RETRY_BASE_MS * multiplier).min(BRIDGE_RETRY_MAX_MS))
}

fn extract_poll_events(body: serde_json::Value) -> Vec<BridgeEnvelope> {
    match body {
        serde_json::Value::Array(events) => events
            .into_iter()
            .filter_map(|event| serde_json::from_value(event).ok())
            .collect(),
        serde_json::Value::Object(mut obj) => match obj.remove("events") {
            Some(serde_json::Value::Array(events)) => events
                .into_iter()
                .filter_map(|event| serde_json::from_value(event).ok())
                .collect(),
            _ => serde_json::from_value(serde_json::Value::Object(obj))
                .ok()
                .into_iter()
                .collect(),
        },
        _ => Vec::new(),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum BridgeEventKind {
    Message,
    Qr,
    Authenticated,
    AuthFailure,
    Ready,
    Disconnected,
    Unknown(String),
}

/// The QR payload is not scannable as text, so the log only points at where
/// a scannable code is rendered.
const PAIRING_HINT: &str = "whatsapp bridge is waiting for pairing; scan the QR code in the bridge's own terminal or web UI, then run `wa-relay status` to confirm the session";

fn log_lifecycle_event(kind: &BridgeEventKind, event: &BridgeEnvelope) {
    let reason = event.reason.as_deref().unwrap_or("unspecified");
    match kind {
        BridgeEventKind::Qr => tracing::info!(
            qr_len = event.qr.as_deref().map(str::len).unwrap_or_default(),
            "{PAIRING_HINT}"
        ),
        BridgeEventKind::Authenticated => tracing::info!("whatsapp bridge authenticated"),
        BridgeEventKind::AuthFailure => tracing::error!(
            reason,
            "whatsapp bridge authentication failed; clear the bridge session directory and restart if this persists"
        ),
        BridgeEventKind::Ready => tracing::info!("whatsapp bridge session ready"),
        BridgeEventKind::Disconnected => {
            tracing::warn!(reason, "whatsapp bridge session disconnected")
        }
        BridgeEventKind::Unknown(kind) => {
            tracing::debug!(kind = %kind, "ignoring unknown whatsapp bridge event")
        }
        BridgeEventKind::Message => {}
    }
}

/// Convert a bridge message envelope into an `InboundMessage`.
///
/// Drops the bot's own messages and anything that is not plain text. A message
/// without an id needs a timestamp so the derived id survives redelivery.
fn normalize_bridge_message(event: &BridgeEnvelope) -> Option<InboundMessage> {
    if event.from_me.unwrap_or(false) {
        return None;
    }
    let message_type = event.message_type.as_deref().unwrap_or("chat");
    if !matches!(message_type, "chat" | "text") {
        return None;
    }
    let sender_id = trimmed(event.sender_id.as_deref())?;
    let chat_id = trimmed(event.chat_id.as_deref()).unwrap_or(sender_id);

    let message_id = match trimmed(event.message_id.as_deref()) {
        Some(id) => id.to_owned(),
        None => {
            let Some(timestamp_millis) = event.timestamp_ms else {
                tracing::debug!(
                    chat_id,
                    sender_id,
                    "dropping whatsapp bridge message without id or timestamp"
                );
                return None;
            };
            fallback_message_id(chat_id, sender_id, timestamp_millis, event.body.as_deref())
        }
    };

    let is_status = event.is_status.unwrap_or(false) || chat_id == STATUS_BROADCAST_CHAT;
    let is_group = event
        .is_group
        .unwrap_or_else(|| chat_id.ends_with(GROUP_CHAT_SUFFIX));
    let chat = if is_group {
        ChatContext::group(
            event
                .mentioned_ids
                .iter()
                .map(|id| id.trim())
                .filter(|id| !id.is_empty()),
        )
    } else {
        ChatContext::direct()
    };

    Some(InboundMessage {
        message_id: message_id.into(),
        channel_id: BRIDGE_CHANNEL_ID.into(),
        chat_id: chat_id.into(),
        sender_id: sender_id.into(),
        body: event.body.clone().unwrap_or_default(),
        is_status,
        chat,
        metadata: serde_json::json!({
            "provider": "whatsapp_bridge",
            "notify_name": event.notify_name,
            "timestamp_ms": event.timestamp_ms,
        }),
        received_at: Utc::now(),
    })
}

/// Id derived only from fields the bridge repeats on redelivery.
fn fallback_message_id(
    chat_id: &str,
    sender_id: &str,
    timestamp_millis: i64,
    body: Option<&str>,
) -> String {
    let digest = Sha256::digest(body.unwrap_or_default().as_bytes());
    format!(
        "{}:{}:{}:{}",
        chat_id,
        sender_id,
        timestamp_millis,
        hex::encode(&digest[..8])
    )
}

fn trimmed(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct BridgeEnvelope {
    kind: Option<String>,
    message_id: Option<String>,
    chat_id: Option<String>,
    sender_id: Option<String>,
    notify_name: Option<String>,
    body: Option<String>,
    #[serde(rename = "type")]
    message_type: Option<String>,
    is_status: Option<bool>,
    is_group: Option<bool>,
    mentioned_ids: Vec<String>,
    from_me: Option<bool>,
    timestamp_ms: Option<i64>,
    qr: Option<String>,
    reason: Option<String>,
}

impl BridgeEnvelope {
    fn kind(&self) -> BridgeEventKind {
        match self
            .kind
            .as_deref()
            .unwrap_or("message")
            .trim()
            .to_ascii_lowercase()
            .as_str()
        {
            "message" => BridgeEventKind::Message,
            "qr" => BridgeEventKind::Qr,
            "authenticated" => BridgeEventKind::Authenticated,
            "auth_failure" => BridgeEventKind::AuthFailure,
            "ready" => BridgeEventKind::Ready,
            "disconnected" => BridgeEventKind::Disconnected,
            other => BridgeEventKind::Unknown(other.to_string()),
        }
    }
}

#[derive(Debug, Deserialize)]
struct BridgeIdentity {
    #[serde(default)]
    id: Option<String>,
}
