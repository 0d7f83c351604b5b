use axum::routing::get;
use axum::{Extension, Json};
use chrono::{DateTime, Utc};
use std::sync::Arc;

/// Read-only facts reported by `GET /health`.
#[derive(Debug, Clone)]
pub struct HealthInfo {
    pub started_at: DateTime<Utc>,
    pub transport: &'static str,
    pub channel_id: String,
    pub model: String,
}

pub fn router() -> axum::Router {
    axum::Router::new().route("/health", get(get_health))
}

#[tracing::instrument(level = "debug", skip_all)]
async fn get_health(Extension(info): Extension<Arc<HealthInfo>>) -> Json<serde_json::Value> {
    let now = Utc::now();
    Json(serde_json::json!({
        "status": "ok",
        "checked_at": now,
        "started_at": info.started_at,
        "uptime_seconds": (now - info.started_at).num_seconds().max(0),
        "transport": info.transport,
        "channel": info.channel_id,
        "model": info.model,
    }))
}
