//! Relay runtime: wires config, transport, backend and gateway, and serves the
//! HTTP surface until a shutdown signal arrives.

use crate::admission::BotIdentity;
use crate::config::{RelayConfig, TransportKind};
use crate::gateway::Gateway;
use crate::responder::Responder;
use crate::routes;
use crate::routes::health::HealthInfo;
use crate::webhook;
use anyhow::Result;
use axum::Extension;
use axum::http::{HeaderMap, Request, StatusCode};
use axum::response::Response;
use relay_channels::{ChannelAdapter, WhatsAppBridgeAdapter, WhatsAppCloudAdapter};
use relay_llm::GeminiClient;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tower::limit::GlobalConcurrencyLimitLayer;
use tower_http::classify::ServerErrorsFailureClass;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

const INBOUND_QUEUE_CAPACITY: usize = 256;

pub async fn doctor(config_path: Option<PathBuf>) -> Result<()> {
    let (cfg, path) = RelayConfig::load_with_path(config_path).await?;
    tracing::info!(
        model = %cfg.gemini.model,
        prefix = %cfg.bot.prefix,
        prefix_gating = !cfg.bot.prefix.is_empty(),
        self_id = ?cfg.bot.self_id,
        transport = ?cfg.transport.kind,
        api_key = "<redacted>",
        config_path = %path.as_ref().map(|p| p.display().to_string()).unwrap_or_else(|| "<env only>".to_string()),
        "config ok"
    );
    build_backend(&cfg)?;
    build_channel(&cfg)?;
    println!(
        "wa-relay doctor: config ok (model={}, transport={:?})",
        cfg.gemini.model, cfg.transport.kind
    );
    Ok(())
}

pub async fn status(config_path: Option<PathBuf>) -> Result<()> {
    let cfg = RelayConfig::load(config_path).await?;
    match cfg.transport.kind {
        TransportKind::Bridge => {
            let bridge = build_bridge(&cfg)?;
            let session = bridge.session_status().await?;
            tracing::info!(
                state = %session.state,
                awaiting_qr = session.qr.is_some(),
                me = ?session.me,
                "bridge session status"
            );
            println!("bridge session: {}", session.state);
            if let Some(me) = session.me.as_deref() {
                println!("logged in as: {me}");
            }
            if session.qr.is_some() {
                println!("waiting for QR pairing; scan the code shown by the bridge");
            }
        }
        TransportKind::Cloud => {
            tracing::info!(
                phone_number_id = %cfg.transport.cloud.phone_number_id,
                "cloud transport has no session to query"
            );
            println!(
                "cloud transport: phone number id {}",
                cfg.transport.cloud.phone_number_id
            );
        }
    }
    Ok(())
}

/// Run one prompt through the backend and print the reply that would be sent.
pub async fn ask(config_path: Option<PathBuf>, prompt: &str) -> Result<()> {
    let cfg = RelayConfig::load(config_path).await?;
    let responder = Responder::new(Arc::new(build_backend(&cfg)?));
    let outcome = responder.complete(prompt.trim()).await;
    tracing::info!(outcome = outcome.label(), model = %responder.model(), "ask completed");
    println!("{}", outcome.reply_text());
    Ok(())
}

pub async fn serve(config_path: Option<PathBuf>) -> Result<()> {
    let cfg = RelayConfig::load(config_path).await?;
    let started_at = chrono::Utc::now();
    let addr: SocketAddr = format!("{}:{}", cfg.server.host, cfg.server.port)
        .parse()
        .map_err(|e| anyhow::anyhow!("invalid server address: {e}"))?;
    tracing::info!(
        model = %cfg.gemini.model,
        transport = ?cfg.transport.kind,
        prefix = %cfg.bot.prefix,
        %addr,
        "server configuration loaded"
    );

    let listener = preflight_bind_listener(addr).await?;

    let backend = Arc::new(build_backend(&cfg)?);
    let channel = build_channel(&cfg)?;
    let identity = Arc::new(resolve_identity(&cfg, channel.as_ref()).await);

    let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_QUEUE_CAPACITY);
    channel.start(inbound_tx.clone()).await?;

    let gateway = Arc::new(Gateway::new(
        identity.clone(),
        Responder::new(backend.clone()),
        channel.clone(),
    ));
    let shutdown = CancellationToken::new();
    let gateway_handle = gateway.start(inbound_rx, shutdown.child_token());
    tracing::info!(
        channel = %channel.channel_id(),
        self_id = %identity.self_id,
        "gateway started"
    );

    let health = Arc::new(HealthInfo {
        started_at,
        transport: match cfg.transport.kind {
            TransportKind::Bridge => "bridge",
            TransportKind::Cloud => "cloud",
        },
        channel_id: channel.channel_id().to_string(),
        model: cfg.gemini.model.clone(),
    });

    let mut router = routes::router().layer(Extension(health));
    if cfg.transport.kind == TransportKind::Cloud {
        router = router.merge(webhook::router(
            inbound_tx.clone(),
            cfg.transport.cloud.webhook_verify_token.clone(),
            cfg.transport.cloud.app_secret.clone(),
        ));
    }
    drop(inbound_tx);

    let trace_layer = TraceLayer::new_for_http()
        .make_span_with(|request: &Request<_>| {
            tracing::info_span!(
                "http.request",
                method = %request.method(),
                uri = %request.uri(),
                version = ?request.version(),
                request_id = %request_id_from_headers(request.headers())
            )
        })
        .on_request(|request: &Request<_>, _span: &tracing::Span| {
            tracing::debug!(
                method = %request.method(),
                uri = %request.uri(),
                "http request started"
            );
        })
        .on_response(
            |response: &Response, latency: Duration, _span: &tracing::Span| {
                tracing::info!(
                    status = response.status().as_u16(),
                    latency_ms = latency.as_millis() as u64,
                    "http request completed"
                );
            },
        )
        .on_failure(
            |error: ServerErrorsFailureClass, latency: Duration, _span: &tracing::Span| {
                tracing::error!(
                    error_class = %error,
                    latency_ms = latency.as_millis() as u64,
                    "http request failed"
                );
            },
        );

    let app = router
        .layer(GlobalConcurrencyLimitLayer::new(cfg.server.http_max_in_flight))
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            Duration::from_secs(cfg.server.http_timeout_seconds),
        ))
        .layer(trace_layer)
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid));

    tracing::info!(%addr, "wa-relay serving");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
        .await?;
    tracing::info!("http server shutdown completed");

    shutdown.cancel();
    if let Err(error) = channel.shutdown().await {
        tracing::warn!(%error, "transport session teardown failed");
    } else {
        tracing::info!(channel = %channel.channel_id(), "transport session closed");
    }
    match gateway_handle.await {
        Ok(()) => tracing::info!("gateway shutdown completed"),
        Err(e) => tracing::error!(error = %e, "gateway task join failed during shutdown"),
    }

    Ok(())
}

fn build_backend(cfg: &RelayConfig) -> Result<GeminiClient> {
    let client = GeminiClient::new(cfg.api_key(), &cfg.gemini.model)?;
    Ok(match cfg.gemini.base_url.as_deref() {
        Some(base_url) => client.with_base_url(base_url),
        None => client,
    })
}

fn build_bridge(cfg: &RelayConfig) -> Result<WhatsAppBridgeAdapter> {
    let bridge = &cfg.transport.bridge;
    Ok(WhatsAppBridgeAdapter::new(&bridge.url)?
        .with_auth_token(bridge.auth_token.clone())
        .with_poll_interval(Duration::from_millis(bridge.poll_interval_ms))
        .with_start_from_latest(bridge.start_from_latest))
}

fn build_channel(cfg: &RelayConfig) -> Result<Arc<dyn ChannelAdapter>> {
    Ok(match cfg.transport.kind {
        TransportKind::Bridge => Arc::new(build_bridge(cfg)?),
        TransportKind::Cloud => Arc::new(WhatsAppCloudAdapter::new(
            &cfg.transport.cloud.access_token,
            &cfg.transport.cloud.phone_number_id,
        )?),
    })
}

/// Configured self id wins; otherwise ask the transport. Without one, group
/// messages can never be admitted.
async fn resolve_identity(cfg: &RelayConfig, channel: &dyn ChannelAdapter) -> BotIdentity {
    let self_id = match cfg.bot.self_id.clone() {
        Some(id) => id,
        None => match channel.self_id().await {
            Ok(Some(id)) => id,
            Ok(None) => String::new(),
            Err(error) => {
                tracing::warn!(%error, "could not resolve bot self id from transport");
                String::new()
            }
        },
    };
    if self_id.is_empty() {
        tracing::warn!("bot self id unknown; group messages will not be answered");
    }
    BotIdentity::new(self_id, cfg.bot.prefix.clone())
}

async fn preflight_bind_listener(addr: SocketAddr) -> Result<tokio::net::TcpListener> {
    tracing::info!(%addr, "preflight bind check starting");
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| anyhow::anyhow!("preflight bind failed for {addr}: {e}"))?;
    tracing::info!(%addr, "preflight bind check passed");
    Ok(listener)
}

fn request_id_from_headers(headers: &HeaderMap) -> String {
    headers
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_string())
        .unwrap_or_else(|| "missing".to_string())
}

async fn shutdown_signal(shutdown: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut terminate = match signal(SignalKind::terminate()) {
            Ok(sig) => sig,
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler; falling back to ctrl_c only");
                if let Err(ctrlc_err) = tokio::signal::ctrl_c().await {
                    tracing::error!(error = %ctrlc_err, "failed to await ctrl-c signal");
                }
                shutdown.cancel();
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::warn!("received ctrl-c; beginning graceful shutdown");
            }
            _ = terminate.recv() => {
                tracing::warn!("received SIGTERM; beginning graceful shutdown");
            }
            _ = shutdown.cancelled() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::select! {
            result = tokio::signal::ctrl_c() => match result {
                Ok(()) => tracing::warn!("received ctrl-c; beginning graceful shutdown"),
                Err(e) => tracing::error!(error = %e, "failed to await ctrl-c signal"),
            },
            _ = shutdown.cancelled() => {}
        }
    }
    shutdown.cancel();
}
