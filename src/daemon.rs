use std::future::Future;
use std::sync::Arc;

use axum::{
    body::Body,
    extract::{Json, Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use bytes::Bytes;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{error, info, warn};

use crate::client::PersonaEngine;
use crate::config::Config;
use crate::domains::subscription::{CancellationEvent, PurchaseEvent};
use crate::domains::tier::Plan;
use crate::domains::usage::{CounterKind, Reservation};
use crate::error::{EngineError, Result};
use crate::interfaces::scheduler::JobTick;
use crate::services::chat::ChatOutcome;
use crate::services::gate::{Action, Authorization};

const RETRY_AFTER_SECONDS: &str = "5";
const DEFAULT_EVENT_LIMIT: usize = 50;

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<PersonaEngine>,
    pub token: String,
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

#[derive(Deserialize)]
struct AuthorizeRequest {
    user_id: String,
    #[serde(flatten)]
    action: Action,
}

#[derive(Deserialize)]
struct ReconcileRequest {
    reservation: Reservation,
    actual_tokens: u64,
}

#[derive(Deserialize)]
struct ReleaseRequest {
    user_id: String,
    kind: String,
    amount: u64,
}

#[derive(Deserialize)]
struct ChatStreamRequest {
    user_id: String,
    persona_id: String,
    text: String,
}

#[derive(Deserialize)]
struct UserQuery {
    user_id: String,
}

#[derive(Deserialize)]
struct HistoryQuery {
    user_id: String,
    from: Option<String>,
    to: Option<String>,
}

#[derive(Deserialize)]
struct AnalyticsQuery {
    user_id: String,
    days: Option<i64>,
}

#[derive(Deserialize)]
struct EventsQuery {
    user_id: String,
    limit: Option<usize>,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/quota/authorize", post(quota_authorize))
        .route("/quota/reconcile", post(quota_reconcile))
        .route("/quota/release", post(quota_release))
        .route("/chat/stream", post(chat_stream))
        .route("/usage/current", get(usage_current))
        .route("/usage/history", get(usage_history))
        .route("/usage/analytics", get(usage_analytics))
        .route("/subscription/status", get(subscription_status))
        .route("/subscription/plans", get(subscription_plans))
        .route("/subscription/events", get(subscription_events))
        .route("/subscription/verified", post(subscription_verified))
        .route("/subscription/cancel", post(subscription_cancel))
        .route("/jobs/:name/run", post(run_job))
        .with_state(state)
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
    })
}

async fn quota_authorize(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<AuthorizeRequest>,
) -> impl IntoResponse {
    if let Err(err) = authorize(&headers, &state.token) {
        return err.into_response();
    }

    match state
        .engine
        .gate
        .authorize(&payload.user_id, payload.action)
        .await
    {
        Ok(decision) => (StatusCode::OK, Json(decision_body(&decision))).into_response(),
        Err(err) => error_response(&err),
    }
}

async fn quota_reconcile(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<ReconcileRequest>,
) -> impl IntoResponse {
    if let Err(err) = authorize(&headers, &state.token) {
        return err.into_response();
    }

    match state
        .engine
        .ledger
        .reconcile(&payload.reservation, payload.actual_tokens)
        .await
    {
        Ok(outcome) => (StatusCode::OK, Json(outcome)).into_response(),
        Err(err) => error_response(&err),
    }
}

async fn quota_release(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<ReleaseRequest>,
) -> impl IntoResponse {
    if let Err(err) = authorize(&headers, &state.token) {
        return err.into_response();
    }

    let Ok(kind) = payload.kind.parse::<CounterKind>() else {
        return error_response(&EngineError::InvalidInput(format!(
            "unknown counter {}",
            payload.kind
        )));
    };
    match state
        .engine
        .ledger
        .release(&payload.user_id, kind, payload.amount)
        .await
    {
        Ok(value) => (
            StatusCode::OK,
            Json(json!({"user_id": payload.user_id, "kind": kind.as_str(), "value": value})),
        )
            .into_response(),
        Err(err) => error_response(&err),
    }
}

async fn chat_stream(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<ChatStreamRequest>,
) -> impl IntoResponse {
    if let Err(err) = authorize(&headers, &state.token) {
        return err.into_response();
    }

    let outcome = state
        .engine
        .chat
        .send(&payload.user_id, &payload.persona_id, &payload.text)
        .await;
    let mut chunks = match outcome {
        Ok(ChatOutcome::Streaming { chunks, .. }) => chunks,
        Ok(ChatOutcome::Denied(decision)) => {
            return (StatusCode::TOO_MANY_REQUESTS, Json(decision_body(&decision)))
                .into_response();
        }
        Err(err) => return error_response(&err),
    };

    let body = Body::from_stream(async_stream::stream! {
        while let Some(chunk) = chunks.next().await {
            let payload = serde_json::to_string(&chunk).unwrap_or_default();
            let line = format!("data: {}\n\n", payload);
            yield Ok::<Bytes, std::convert::Infallible>(Bytes::from(line));
        }
    });

    Response::builder()
        .status(StatusCode::OK)
        .header("content-type", "text/event-stream")
        .header("cache-control", "no-cache")
        .body(body)
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

async fn usage_current(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<UserQuery>,
) -> impl IntoResponse {
    if let Err(err) = authorize(&headers, &state.token) {
        return err.into_response();
    }

    match state.engine.usage.current(&query.user_id).await {
        Ok(report) => (StatusCode::OK, Json(report)).into_response(),
        Err(err) => error_response(&err),
    }
}

async fn usage_history(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<HistoryQuery>,
) -> impl IntoResponse {
    if let Err(err) = authorize(&headers, &state.token) {
        return err.into_response();
    }

    match state
        .engine
        .usage
        .history(&query.user_id, query.from.as_deref(), query.to.as_deref())
        .await
    {
        Ok(history) => (StatusCode::OK, Json(history)).into_response(),
        Err(err) => error_response(&err),
    }
}

async fn usage_analytics(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<AnalyticsQuery>,
) -> impl IntoResponse {
    if let Err(err) = authorize(&headers, &state.token) {
        return err.into_response();
    }

    match state.engine.usage.analytics(&query.user_id, query.days).await {
        Ok(analytics) => (StatusCode::OK, Json(analytics)).into_response(),
        Err(err) => error_response(&err),
    }
}

async fn subscription_status(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<UserQuery>,
) -> impl IntoResponse {
    if let Err(err) = authorize(&headers, &state.token) {
        return err.into_response();
    }

    match state.engine.subscriptions.status(&query.user_id).await {
        Ok(record) => {
            let effective_tier = record.effective_tier();
            (
                StatusCode::OK,
                Json(json!({"subscription": record, "effective_tier": effective_tier})),
            )
                .into_response()
        }
        Err(err) => error_response(&err),
    }
}

async fn subscription_plans(State(state): State<AppState>, headers: HeaderMap) -> impl IntoResponse {
    if let Err(err) = authorize(&headers, &state.token) {
        return err.into_response();
    }

    (StatusCode::OK, Json(json!({"plans": Plan::all()}))).into_response()
}

async fn subscription_events(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<EventsQuery>,
) -> impl IntoResponse {
    if let Err(err) = authorize(&headers, &state.token) {
        return err.into_response();
    }

    let limit = query.limit.unwrap_or(DEFAULT_EVENT_LIMIT);
    match state.engine.subscriptions.events(&query.user_id, limit).await {
        Ok(events) => (StatusCode::OK, Json(json!({"events": events}))).into_response(),
        Err(err) => error_response(&err),
    }
}

async fn subscription_verified(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(event): Json<PurchaseEvent>,
) -> impl IntoResponse {
    if let Err(err) = authorize(&headers, &state.token) {
        return err.into_response();
    }

    match state.engine.subscriptions.apply_purchase(&event).await {
        Ok(result) => (StatusCode::OK, Json(result)).into_response(),
        Err(err) => error_response(&err),
    }
}

async fn subscription_cancel(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(event): Json<CancellationEvent>,
) -> impl IntoResponse {
    if let Err(err) = authorize(&headers, &state.token) {
        return err.into_response();
    }

    match state.engine.subscriptions.apply_cancellation(&event).await {
        Ok(result) => (StatusCode::OK, Json(result)).into_response(),
        Err(err) => error_response(&err),
    }
}

async fn run_job(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(name): Path<String>,
) -> impl IntoResponse {
    if let Err(err) = authorize(&headers, &state.token) {
        return err.into_response();
    }

    let Some(job) = state.engine.job(&name) else {
        return error_response(&EngineError::NotFound(format!("job {name}")));
    };
    info!(job = %name, "operator triggered job");
    match job.run().await {
        Ok(tick) => (StatusCode::OK, Json(tick_body(&name, tick))).into_response(),
        Err(err) => error_response(&err),
    }
}

fn decision_body(decision: &Authorization) -> Value {
    json!({
        "allowed": decision.allowed,
        "reason": decision.reason.map(|reason| reason.as_str()),
        "message": decision.reason.map(|reason| reason.user_message()),
        "tier": decision.tier,
        "limits": decision.limits,
        "reservation": decision.reservation,
    })
}

fn tick_body(job: &str, tick: JobTick) -> Value {
    match tick {
        JobTick::Ran {
            slot,
            affected_rows,
        } => json!({"job": job, "status": "ran", "slot": slot, "affected_rows": affected_rows}),
        JobTick::Skipped { slot } => json!({"job": job, "status": "skipped", "slot": slot}),
        JobTick::Idle => json!({"job": job, "status": "idle"}),
    }
}

fn error_response(err: &EngineError) -> Response {
    let status = match err {
        EngineError::InvalidInput(_) | EngineError::Serialization(_) => StatusCode::BAD_REQUEST,
        EngineError::NotFound(_) => StatusCode::NOT_FOUND,
        EngineError::SubscriptionConflict(_) | EngineError::InvalidTransition { .. } => {
            StatusCode::CONFLICT
        }
        EngineError::Config(_)
        | EngineError::ConfigurationAnomaly(_)
        | EngineError::JobFailed { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        EngineError::Unavailable { .. }
        | EngineError::Upstream(_)
        | EngineError::Http(_)
        | EngineError::Storage(_)
        | EngineError::Runtime(_) => StatusCode::SERVICE_UNAVAILABLE,
    };
    if status.is_server_error() {
        error!(error = %err, "request failed");
    }

    let body = Json(ErrorResponse {
        error: err.public_message(),
    });
    if err.is_transient() {
        (
            status,
            [("retry-after", RETRY_AFTER_SECONDS)],
            body,
        )
            .into_response()
    } else {
        (status, body).into_response()
    }
}

fn authorize(
    headers: &HeaderMap,
    token: &str,
) -> std::result::Result<(), (StatusCode, Json<ErrorResponse>)> {
    let header = headers
        .get("authorization")
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();
    let api_key = headers
        .get("x-api-key")
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();
    let bearer = header.strip_prefix("Bearer ").unwrap_or("");

    if token.is_empty() || bearer == token || api_key == token {
        Ok(())
    } else {
        Err((
            StatusCode::UNAUTHORIZED,
            Json(ErrorResponse {
                error: "Unauthorized".to_string(),
            }),
        ))
    }
}

pub async fn run(host: &str, port: u16, config: Config, token: &str) -> Result<()> {
    run_with_shutdown(host, port, config, token, futures::future::pending::<()>()).await
}

pub async fn run_with_shutdown<F>(
    host: &str,
    port: u16,
    config: Config,
    token: &str,
    shutdown: F,
) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    if token.is_empty() {
        warn!("no service token configured; every request is accepted");
    }

    let engine = Arc::new(PersonaEngine::from_config(config).await?);
    let mut scheduler = engine.scheduler();
    if engine.scheduler_enabled() {
        scheduler.start();
    }

    let state = AppState {
        engine,
        token: token.to_string(),
    };
    let app = build_router(state);

    let addr = format!("{host}:{port}");
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| EngineError::Runtime(e.to_string()))?;
    info!(addr = %addr, "persona engine listening");
    let shutdown = async move {
        shutdown.await;
        scheduler.stop().await;
    };

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(|e| EngineError::Runtime(e.to_string()))?;

    Ok(())
}
