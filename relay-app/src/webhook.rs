//! WhatsApp Cloud API webhook: verification handshake and inbound ingest.

use axum::Router;
use axum::body::Bytes;
use axum::extract::{Json, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use relay_channels::{InboundMessage, RecentIds, parse_cloud_webhook, verify_cloud_signature};
use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::{Mutex, mpsc};

pub const WEBHOOK_PATH: &str = "/api/v1/channels/whatsapp/webhook";

/// Meta redelivers until it sees a 2xx, so ids already forwarded are remembered.
const RECENT_MESSAGE_ID_CAPACITY: usize = 4096;

struct WebhookState {
    inbound_tx: mpsc::Sender<InboundMessage>,
    verify_token: String,
    app_secret: Option<String>,
    recent: Mutex<RecentIds>,
}

pub fn router(
    inbound_tx: mpsc::Sender<InboundMessage>,
    verify_token: String,
    app_secret: Option<String>,
) -> Router {
    let state = Arc::new(WebhookState {
        inbound_tx,
        verify_token: verify_token.trim().to_string(),
        app_secret: app_secret
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(ToOwned::to_owned),
        recent: Mutex::new(RecentIds::new(RECENT_MESSAGE_ID_CAPACITY)),
    });
    Router::new()
        .route(WEBHOOK_PATH, get(verify).post(ingest))
        .with_state(state)
}

#[derive(Debug, Deserialize)]
struct VerifyQuery {
    #[serde(rename = "hub.mode")]
    mode: Option<String>,
    #[serde(rename = "hub.verify_token")]
    verify_token: Option<String>,
    #[serde(rename = "hub.challenge")]
    challenge: Option<String>,
}

#[tracing::instrument(level = "debug", skip_all)]
async fn verify(
    State(state): State<Arc<WebhookState>>,
    Query(query): Query<VerifyQuery>,
) -> impl IntoResponse {
    let mode = query.mode.as_deref().map(str::trim).unwrap_or_default();
    let token = query
        .verify_token
        .as_deref()
        .map(str::trim)
        .unwrap_or_default();
    if mode.eq_ignore_ascii_case("subscribe") && !token.is_empty() && token == state.verify_token {
        tracing::info!("whatsapp webhook verified");
        return (StatusCode::OK, query.challenge.unwrap_or_default()).into_response();
    }
    tracing::warn!(mode, "whatsapp webhook verification rejected");
    (StatusCode::FORBIDDEN, "verification failed".to_string()).into_response()
}

#[tracing::instrument(level = "debug", skip_all, fields(body_len = body.len()))]
async fn ingest(
    State(state): State<Arc<WebhookState>>,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse {
    if let Some(secret) = state.app_secret.as_deref() {
        let signature = headers
            .get("x-hub-signature-256")
            .and_then(|v| v.to_str().ok());
        if !verify_cloud_signature(signature, &body, secret) {
            tracing::warn!("whatsapp webhook signature mismatch");
            return (
                StatusCode::UNAUTHORIZED,
                Json(serde_json::json!({
                    "status": "error",
                    "error": "invalid x-hub-signature-256",
                })),
            )
                .into_response();
        }
    }

    let messages = match parse_cloud_webhook(&body) {
        Ok(messages) => messages,
        Err(error) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({
                    "status": "error",
                    "error": error.to_string(),
                })),
            )
                .into_response();
        }
    };

    let mut accepted = 0usize;
    let mut duplicates = 0usize;
    for inbound in messages {
        if !state.recent.lock().await.remember(inbound.message_id.as_str()) {
            tracing::debug!(
                message_id = %inbound.message_id,
                "skipping redelivered whatsapp webhook message"
            );
            duplicates += 1;
            continue;
        }
        if let Err(error) = state.inbound_tx.send(inbound).await {
            return (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(serde_json::json!({
                    "status": "error",
                    "error": format!("inbound queue closed: {error}"),
                })),
            )
                .into_response();
        }
        accepted += 1;
    }

    (
        StatusCode::OK,
        Json(serde_json::json!({
            "status": "ok",
            "accepted": accepted,
            "duplicates": duplicates,
        })),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{Body, to_bytes};
    use axum::http::Request;
    use tower::util::ServiceExt;

    fn text_payload() -> String {
        serde_json::json!({
            "object": "whatsapp_business_account",
            "entry": [{
                "changes": [{
                    "value": {
                        "metadata": { "phone_number_id": "12345" },
                        "messages": [
                            { "id": "wamid.1", "from": "15551234567", "type": "text", "text": { "body": "!gemini halo" } }
                        ]
                    }
                }]
            }]
        })
        .to_string()
    }

    async fn body_string(response: axum::response::Response) -> String {
        let bytes = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("response body");
        String::from_utf8(bytes.to_vec()).expect("utf8 body")
    }

    #[tokio::test]
    async fn verify_echoes_challenge_for_matching_token() {
        let (tx, _rx) = mpsc::channel(1);
        let response = router(tx, "secret-token".to_string(), None)
            .oneshot(
                Request::builder()
                    .uri(format!(
                        "{WEBHOOK_PATH}?hub.mode=subscribe&hub.verify_token=secret-token&hub.challenge=42"
                    ))
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_string(response).await, "42");
    }

    #[tokio::test]
    async fn verify_rejects_wrong_token() {
        let (tx, _rx) = mpsc::channel(1);
        let response = router(tx, "secret-token".to_string(), None)
            .oneshot(
                Request::builder()
                    .uri(format!(
                        "{WEBHOOK_PATH}?hub.mode=subscribe&hub.verify_token=nope&hub.challenge=42"
                    ))
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn ingest_forwards_text_messages() {
        let (tx, mut rx) = mpsc::channel(4);
        let response = router(tx, "t".to_string(), None)
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri(WEBHOOK_PATH)
                    .header("content-type", "application/json")
                    .body(Body::from(text_payload()))
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);

        let inbound = rx.recv().await.expect("message forwarded");
        assert_eq!(inbound.body, "!gemini halo");
        assert_eq!(inbound.chat_id.as_str(), "15551234567");
    }

    #[tokio::test]
    async fn ingest_forwards_each_message_id_once() {
        let (tx, mut rx) = mpsc::channel(4);
        let app = router(tx, "t".to_string(), None);
        let mut bodies = Vec::new();
        for _ in 0..2 {
            let response = app
                .clone()
                .oneshot(
                    Request::builder()
                        .method("POST")
                        .uri(WEBHOOK_PATH)
                        .header("content-type", "application/json")
                        .body(Body::from(text_payload()))
                        .expect("request"),
                )
                .await
                .expect("response");
            assert_eq!(response.status(), StatusCode::OK);
            bodies.push(body_string(response).await);
        }

        let first: serde_json::Value = serde_json::from_str(&bodies[0]).expect("json body");
        let second: serde_json::Value = serde_json::from_str(&bodies[1]).expect("json body");
        assert_eq!(first["accepted"], 1);
        assert_eq!(second["accepted"], 0);
        assert_eq!(second["duplicates"], 1);

        let inbound = rx.recv().await.expect("message forwarded");
        assert_eq!(inbound.message_id.as_str(), "wamid.1");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn ingest_rejects_bad_signature_when_secret_configured() {
        let (tx, mut rx) = mpsc::channel(4);
        let response = router(tx, "t".to_string(), Some("app-secret".to_string()))
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri(WEBHOOK_PATH)
                    .header("x-hub-signature-256", "sha256=deadbeef")
                    .body(Body::from(text_payload()))
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn ingest_rejects_malformed_payload() {
        let (tx, _rx) = mpsc::channel(4);
        let response = router(tx, "t".to_string(), None)
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri(WEBHOOK_PATH)
                    .body(Body::from("not json"))
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
