//! HTTP surface: platform webhooks in, SSE status streams out, plus
//! health, stats and an on-demand recovery sweep.

use std::convert::Infallible;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, Path, Query, State};
use axum::http::{StatusCode, header};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::stream::{self, Stream, StreamExt};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, error, info, warn};

use crate::aggregator::{AggregationEngine, RecoverySweeper};
use crate::bus::{ChannelType, ConversationKey};
use crate::channels;
use crate::errors::CoalesceError;
use crate::ingest::InboundProcessor;
use crate::notify::{NotifyEvent, NotifyKind, SseHub, SseSubscription};
use crate::utils::now_ms;

const ACCEPTED_NOTICE: &str = "Message received, processing";
const SSE_CONNECTED_NOTICE: &str = "Connection established";
const SSE_READY_NOTICE: &str = "Waiting for messages";

/// Everything the handlers need, wired once by the `serve` command.
#[derive(Clone)]
pub struct GatewayState {
    pub engine: Arc<AggregationEngine>,
    pub ingest: Arc<InboundProcessor>,
    pub sweeper: Arc<RecoverySweeper>,
    /// `None` when the notifier is disabled; `/sse` then answers 404.
    pub hub: Option<Arc<SseHub>>,
    pub whatsapp_phone_number_id: Arc<str>,
    pub keep_alive: Duration,
    pub max_body_bytes: usize,
    pub delivery_configured: bool,
    pub media_configured: bool,
    pub metrics: Option<PrometheusHandle>,
}

#[derive(Debug, Deserialize)]
struct SseQuery {
    channel: Option<String>,
}

pub fn build_router(state: GatewayState) -> Router {
    let max_body = state.max_body_bytes;
    Router::new()
        .route("/webhook", post(webhook_handler))
        .route("/sse/{user_id}", get(sse_handler))
        .route("/health", get(health_handler))
        .route("/api/stats", get(stats_handler))
        .route("/api/sweep", post(sweep_handler))
        .route("/metrics", get(metrics_handler))
        .layer(DefaultBodyLimit::max(max_body))
        .with_state(state)
}

fn error_json(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({ "error": message }))).into_response()
}

/// Status for an error raised while accepting an inbound message. Retryable
/// failures answer 503 so the platform redelivers.
fn inbound_error_response(err: &CoalesceError) -> Response {
    let status = match err {
        CoalesceError::Media(_) => StatusCode::BAD_GATEWAY,
        CoalesceError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
        _ if err.is_retryable() => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::BAD_GATEWAY,
    };
    (
        status,
        Json(json!({
            "error": err.to_string(),
            "retryable": err.is_retryable(),
        })),
    )
        .into_response()
}

fn is_empty_payload(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Object(map) => map.is_empty(),
        _ => false,
    }
}

/// POST /webhook: detect the platform, resolve the message to a fragment,
/// and buffer it. Answers as soon as the fragment is stored.
async fn webhook_handler(State(state): State<GatewayState>, body: Bytes) -> Response {
    if body.len() > state.max_body_bytes {
        warn!("webhook payload too large ({} bytes)", body.len());
        return error_json(StatusCode::PAYLOAD_TOO_LARGE, "Payload too large");
    }
    if body.is_empty() {
        return error_json(StatusCode::BAD_REQUEST, "Empty payload");
    }
    let payload: Value = match serde_json::from_slice(&body) {
        Ok(v) => v,
        Err(e) => {
            debug!("webhook payload is not JSON: {}", e);
            return error_json(StatusCode::BAD_REQUEST, "Invalid JSON");
        }
    };
    if is_empty_payload(&payload) {
        return error_json(StatusCode::BAD_REQUEST, "Empty payload");
    }

    let Some(envelope) = channels::detect(&payload, &state.whatsapp_phone_number_id) else {
        debug!("webhook payload not recognised, filtering");
        return Json(json!({ "status": "filtered" })).into_response();
    };
    let channel = envelope.channel;
    let user_id = envelope.user_id.clone();
    let kind = envelope.content.type_name();

    let (key, fragment) = match state.ingest.process(envelope).await {
        Ok(Some(resolved)) => resolved,
        Ok(None) => return Json(json!({ "status": "filtered" })).into_response(),
        Err(e) => {
            warn!("failed to resolve {} message from {}:{}: {}", kind, channel, user_id, e);
            return inbound_error_response(&e);
        }
    };

    if let Err(e) = state.engine.add_fragment(&key, fragment).await {
        return inbound_error_response(&e);
    }

    Json(json!({
        "status": "processing",
        "message": ACCEPTED_NOTICE,
        "user_id": user_id,
        "channel": channel,
        "type": kind,
        "use_sse": state.hub.is_some(),
        "sse_endpoint": format!("/sse/{}?channel={}", user_id, channel),
    }))
    .into_response()
}

fn event_stream(
    subscription: SseSubscription,
) -> impl Stream<Item = Result<Event, Infallible>> {
    let greeting = [
        NotifyEvent::new(NotifyKind::Connected, SSE_CONNECTED_NOTICE),
        NotifyEvent::new(NotifyKind::Status, SSE_READY_NOTICE),
    ];
    let live = stream::unfold(subscription, |mut sub| async move {
        sub.recv().await.map(|event| (event, sub))
    });
    stream::iter(greeting).chain(live).map(|event| {
        let data = serde_json::to_string(&event).unwrap_or_default();
        Ok(Event::default().data(data))
    })
}

/// GET /sse/{user_id}?channel=web: live status stream for one conversation.
async fn sse_handler(
    State(state): State<GatewayState>,
    Path(user_id): Path<String>,
    Query(query): Query<SseQuery>,
) -> Response {
    let Some(hub) = state.hub.as_ref() else {
        return error_json(StatusCode::NOT_FOUND, "notifications disabled");
    };
    let channel = match query.channel.as_deref() {
        None => ChannelType::Web,
        Some(c) => match ChannelType::from_str(c) {
            Ok(channel) => channel,
            Err(e) => return error_json(StatusCode::BAD_REQUEST, &e),
        },
    };

    let subscription = hub.register(ConversationKey::new(channel, user_id));
    Sse::new(event_stream(subscription))
        .keep_alive(KeepAlive::new().interval(state.keep_alive))
        .into_response()
}

/// GET /health: 200 while the buffer store answers, 503 otherwise.
async fn health_handler(State(state): State<GatewayState>) -> Response {
    let store = state.engine.store();
    let timestamp = chrono::Utc::now().to_rfc3339();
    let configured = |yes: bool| if yes { "configured" } else { "not configured" };
    match store.ping().await {
        Ok(()) => Json(json!({
            "status": "up",
            "timestamp": timestamp,
            "version": crate::VERSION,
            "services": {
                "store": format!("{} connected", store.backend_name()),
                "delivery": configured(state.delivery_configured),
                "media": configured(state.media_configured),
            }
        }))
        .into_response(),
        Err(e) => {
            error!("health check failed: {}", e);
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({
                    "status": "down",
                    "error": e.to_string(),
                    "timestamp": timestamp,
                })),
            )
                .into_response()
        }
    }
}

/// GET /api/stats
async fn stats_handler(State(state): State<GatewayState>) -> Response {
    Json(json!({
        "aggregator": state.engine.stats().snapshot(),
        "active_timers": state.engine.timers().active_count().await,
        "sse": state.hub.as_ref().map(|hub| hub.stats()),
    }))
    .into_response()
}

/// POST /api/sweep: one recovery pass over overdue windows.
async fn sweep_handler(State(state): State<GatewayState>) -> Response {
    match state.sweeper.sweep_once(now_ms()).await {
        Ok(report) => Json(report).into_response(),
        Err(e) => inbound_error_response(&e),
    }
}

/// GET /metrics: Prometheus text exposition.
async fn metrics_handler(State(state): State<GatewayState>) -> Response {
    match state.metrics.as_ref() {
        Some(handle) => (
            [(
                header::CONTENT_TYPE,
                "text/plain; version=0.0.4; charset=utf-8",
            )],
            handle.render(),
        )
            .into_response(),
        None => (StatusCode::NOT_FOUND, "Metrics not enabled").into_response(),
    }
}

/// Bind `host:port` and serve until `shutdown` resolves.
pub async fn serve(
    host: &str,
    port: u16,
    state: GatewayState,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let app = build_router(state);
    let addr = format!("{}:{}", host, port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("gateway listening on {}", addr);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}
