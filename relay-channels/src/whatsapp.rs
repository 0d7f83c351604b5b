//! WhatsApp Cloud API adapter: Graph API sends plus webhook payload parsing.

use crate::traits::ChannelAdapter;
use crate::types::{ChatContext, InboundMessage, OutboundMessage};
use anyhow::{Result, anyhow};
use chrono::Utc;
use hmac::{Hmac, Mac};
use reqwest::Url;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tokio::sync::mpsc;

const CLOUD_CHANNEL_ID: &str = "whatsapp";
const GRAPH_API_BASE: &str = "https://graph.facebook.com/v20.0";

#[derive(Clone)]
pub struct WhatsAppCloudAdapter {
    http: reqwest::Client,
    access_token: String,
    phone_number_id: String,
    api_base: String,
}

impl WhatsAppCloudAdapter {
    pub fn new(access_token: &str, phone_number_id: &str) -> Result<Self> {
        let access_token = access_token.trim();
        if access_token.is_empty() {
            return Err(anyhow!("whatsapp access token is required"));
        }
        let phone_number_id = phone_number_id.trim();
        if phone_number_id.is_empty() {
            return Err(anyhow!("whatsapp phone number id is required"));
        }
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(60))
            .build()?;
        Ok(Self {
            http,
            access_token: access_token.to_string(),
            phone_number_id: phone_number_id.to_string(),
            api_base: GRAPH_API_BASE.to_string(),
        })
    }

    pub fn with_api_base(mut self, api_base: &str) -> Self {
        self.api_base = api_base.trim().trim_end_matches('/').to_string();
        self
    }

    fn messages_url(&self) -> Result<Url> {
        Url::parse(&format!("{}/{}/messages", self.api_base, self.phone_number_id))
            .map_err(|e| anyhow!("invalid whatsapp graph API URL: {e}"))
    }

    async fn post_messages(&self, payload: &serde_json::Value, what: &str) -> Result<()> {
        let url = self.messages_url()?;
        let response = self
            .http
            .post(url)
            .bearer_auth(&self.access_token)
            .json(payload)
            .send()
            .await?;
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(anyhow!(
                "whatsapp {what} failed: status={} body={}",
                status,
                body
            ));
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl ChannelAdapter for WhatsAppCloudAdapter {
    fn channel_id(&self) -> &str {
        CLOUD_CHANNEL_ID
    }

    async fn start(&self, _tx: mpsc::Sender<InboundMessage>) -> Result<()> {
        // Inbound events are delivered via the webhook route in relay-app.
        Ok(())
    }

    async fn send(&self, chat_id: &str, message: OutboundMessage) -> Result<()> {
        let to = chat_id.trim();
        if to.is_empty() {
            return Err(anyhow!("chat_id (E.164 phone number) is required"));
        }
        let text = message.content.trim();
        if text.is_empty() {
            return Err(anyhow!("message content is empty"));
        }

        let mut payload = serde_json::json!({
            "messaging_product": "whatsapp",
            "recipient_type": "individual",
            "to": to,
            "type": "text",
            "text": {
                "preview_url": false,
                "body": text,
            }
        });
        if let Some(reply_to) = message.reply_to_message_id.as_ref() {
            payload["context"] = serde_json::json!({ "message_id": reply_to });
        }

        self.post_messages(&payload, "send").await
    }

    async fn send_typing(&self, message: &InboundMessage, active: bool) -> Result<()> {
        // The platform clears the indicator itself once a reply is sent (or after
        // 25 seconds); there is no explicit "stop typing" call.
        if !active {
            return Ok(());
        }
        let payload = serde_json::json!({
            "messaging_product": "whatsapp",
            "status": "read",
            "message_id": message.message_id,
            "typing_indicator": { "type": "text" },
        });
        self.post_messages(&payload, "typing indicator").await
    }

    async fn self_id(&self) -> Result<Option<String>> {
        Ok(Some(self.phone_number_id.clone()))
    }
}

/// Parse a Cloud API webhook body into inbound text messages.
///
/// Delivery statuses and non-text messages are skipped.
pub fn parse_cloud_webhook(body: &[u8]) -> Result<Vec<InboundMessage>> {
    let payload: CloudWebhookPayload = serde_json::from_slice(body)
        .map_err(|e| anyhow!("invalid whatsapp webhook payload: {e}"))?;
    let mut out = Vec::new();
    for entry in payload.entry {
        for change in entry.changes {
            let phone_number_id = change
                .value
                .metadata
                .as_ref()
                .and_then(|metadata| metadata.phone_number_id.as_deref())
                .unwrap_or_default()
                .to_string();
            for message in &change.value.messages {
                if let Some(inbound) = convert_cloud_message(message, &phone_number_id) {
                    out.push(inbound);
                }
            }
        }
    }
    Ok(out)
}

fn convert_cloud_message(message: &CloudMessage, phone_number_id: &str) -> Option<InboundMessage> {
    if message.message_type != "text" {
        return None;
    }
    let sender = message.from.trim();
    if sender.is_empty() {
        return None;
    }
    let message_id = if message.id.trim().is_empty() {
        ulid::Ulid::new().to_string()
    } else {
        message.id.clone()
    };
    let body = message
        .text
        .as_ref()
        .map(|text| text.body.clone())
        .unwrap_or_default();

    Some(InboundMessage {
        message_id: message_id.into(),
        channel_id: CLOUD_CHANNEL_ID.into(),
        chat_id: sender.into(),
        sender_id: sender.into(),
        body,
        is_status: false,
        chat: ChatContext::direct(),
        metadata: serde_json::json!({
            "provider": "whatsapp_cloud",
            "phone_number_id": phone_number_id,
            "timestamp": message.timestamp,
        }),
        received_at: Utc::now(),
    })
}

type HmacSha256 = Hmac<Sha256>;

/// Check an `x-hub-signature-256` header (`sha256=<hex>`) against the app secret.
pub fn verify_cloud_signature(signature_header: Option<&str>, body: &[u8], app_secret: &str) -> bool {
    let Some(signature_hex) = signature_header
        .map(str::trim)
        .and_then(|header| header.strip_prefix("sha256="))
    else {
        return false;
    };
    let Ok(signature) = hex::decode(signature_hex) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(app_secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&signature).is_ok()
}

#[derive(Debug, Deserialize)]
struct CloudWebhookPayload {
    #[serde(default)]
    entry: Vec<CloudEntry>,
}

#[derive(Debug, Deserialize)]
struct CloudEntry {
    #[serde(default)]
    changes: Vec<CloudChange>,
}

#[derive(Debug, Deserialize)]
struct CloudChange {
    #[serde(default)]
    value: CloudChangeValue,
}

#[derive(Debug, Default, Deserialize)]
struct CloudChangeValue {
    #[serde(default)]
    metadata: Option<CloudMetadata>,
    #[serde(default)]
    messages: Vec<CloudMessage>,
}

#[derive(Debug, Clone, Deserialize)]
struct CloudMetadata {
    #[serde(default)]
    phone_number_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CloudMessage {
    #[serde(default)]
    id: String,
    #[serde(default)]
    from: String,
    #[serde(default)]
    timestamp: Option<String>,
    #[serde(rename = "type", default)]
    message_type: String,
    #[serde(default)]
    text: Option<CloudText>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CloudText {
    #[serde(default)]
    body: String,
}
