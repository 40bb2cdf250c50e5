mod common;

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use httpmock::Method::POST;
use httpmock::MockServer;
use serde_json::{json, Value};
use tempfile::TempDir;
use tower::ServiceExt;

use common::{memory_engine, persona, ManualClock, ScriptedProvider, START_TS};
use persona_engine::config::{Config, DatabaseConfig, OpenAiConfig, TierOverride, TiersConfig};
use persona_engine::daemon::{build_router, AppState};
use persona_engine::PersonaEngine;

fn router(engine: PersonaEngine) -> Router {
    build_router(AppState {
        engine: Arc::new(engine),
        token: "token".to_string(),
    })
}

fn post(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("authorization", "Bearer token")
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder()
        .method("GET")
        .uri(uri)
        .header("x-api-key", "token")
        .body(Body::empty())
        .unwrap()
}

async fn json_body(response: axum::response::Response) -> Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn health_is_open_and_routes_need_token() {
    let clock = Arc::new(ManualClock::new(START_TS));
    let app = router(memory_engine(
        &Config::default(),
        Arc::new(ScriptedProvider::replying("hi")),
        clock,
    ));

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/health")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/quota/authorize")
                .header("content-type", "application/json")
                .body(Body::from(
                    json!({"user_id": "u1", "action": "send_message"}).to_string(),
                ))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn authorize_reports_reason_codes() {
    let clock = Arc::new(ManualClock::new(START_TS));
    let app = router(memory_engine(
        &Config::default(),
        Arc::new(ScriptedProvider::replying("hi")),
        clock,
    ));

    let response = app
        .clone()
        .oneshot(post(
            "/quota/authorize",
            json!({"user_id": "u1", "action": "upload_file", "bytes": 1_000_000_000u64}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let value = json_body(response).await;
    assert_eq!(value["allowed"], false);
    assert_eq!(value["reason"], "storage_limit");
    assert_eq!(value["tier"], "free");

    let response = app
        .clone()
        .oneshot(post(
            "/quota/authorize",
            json!({"user_id": "u1", "action": "send_message"}),
        ))
        .await
        .unwrap();
    let value = json_body(response).await;
    assert_eq!(value["allowed"], true);
    let reservation = value["reservation"].clone();
    assert_eq!(reservation["amount"], 7000);

    let response = app
        .clone()
        .oneshot(post(
            "/quota/reconcile",
            json!({"reservation": reservation, "actual_tokens": 120}),
        ))
        .await
        .unwrap();
    let value = json_body(response).await;
    assert_eq!(value["status"], "applied");
    assert_eq!(value["tokens_today"], 120);

    let response = app
        .clone()
        .oneshot(get("/usage/current?user_id=u1"))
        .await
        .unwrap();
    let value = json_body(response).await;
    assert_eq!(value["messages_today"], 1);
    assert_eq!(value["tokens_today"], 120);
    assert_eq!(value["usage_percentage"], 4.0);
}

#[tokio::test]
async fn chat_stream_denial_is_429() {
    let clock = Arc::new(ManualClock::new(START_TS));
    let config = Config {
        tiers: Some(TiersConfig {
            free: Some(TierOverride {
                max_messages_per_day: Some(0),
                ..TierOverride::default()
            }),
            ..TiersConfig::default()
        }),
        ..Config::default()
    };
    let app = router(memory_engine(
        &config,
        Arc::new(ScriptedProvider::replying("hi")),
        clock,
    ));

    let response = app
        .oneshot(post(
            "/chat/stream",
            json!({"user_id": "u1", "persona_id": "cook", "text": "hello"}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    let value = json_body(response).await;
    assert_eq!(value["reason"], "daily_message_limit");
}

#[tokio::test]
async fn subscription_routes_round_trip() {
    let clock = Arc::new(ManualClock::new(START_TS));
    let app = router(memory_engine(
        &Config::default(),
        Arc::new(ScriptedProvider::replying("hi")),
        clock,
    ));

    let event = json!({
        "event_id": "evt-1",
        "user_id": "u1",
        "tier": "premium_monthly",
        "expires_at": null,
        "issued_at": START_TS,
    });
    let response = app
        .clone()
        .oneshot(post("/subscription/verified", event.clone()))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(json_body(response).await["outcome"], "applied");

    let response = app
        .clone()
        .oneshot(post("/subscription/verified", event))
        .await
        .unwrap();
    assert_eq!(json_body(response).await["outcome"], "duplicate");

    let response = app
        .clone()
        .oneshot(get("/subscription/status?user_id=u1"))
        .await
        .unwrap();
    let value = json_body(response).await;
    assert_eq!(value["effective_tier"], "premium");
    assert_eq!(value["subscription"]["status"], "active");

    let response = app
        .clone()
        .oneshot(post(
            "/subscription/cancel",
            json!({"event_id": "evt-0", "user_id": "u1", "refund": true, "issued_at": START_TS - 10}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);

    let response = app
        .clone()
        .oneshot(get("/subscription/events?user_id=u1"))
        .await
        .unwrap();
    let value = json_body(response).await;
    assert_eq!(value["events"].as_array().unwrap().len(), 2);

    let response = app
        .clone()
        .oneshot(get("/subscription/plans"))
        .await
        .unwrap();
    let value = json_body(response).await;
    assert_eq!(value["plans"].as_array().unwrap().len(), 4);

    let response = app
        .clone()
        .oneshot(post("/jobs/grace_sweep/run", json!({})))
        .await
        .unwrap();
    let value = json_body(response).await;
    assert_eq!(value["status"], "ran");

    let response = app
        .clone()
        .oneshot(post("/jobs/nope/run", json!({})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let response = app
        .clone()
        .oneshot(get("/usage/history?user_id=u1&from=2024-02-01&to=2024-03-01"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let value = json_body(response).await;
    assert_eq!(value["from"], "2024-02-01");
    assert_eq!(value["total_messages"], 0);

    let response = app
        .clone()
        .oneshot(get("/usage/analytics?user_id=u1&days=7"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let value = json_body(response).await;
    assert_eq!(value["period_days"], 7);
    assert_eq!(value["trend"], "insufficient_data");

    let response = app
        .oneshot(get("/usage/history?user_id=u1&from=2024-01-01&to=2024-12-31"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn chat_stream_end_to_end_over_sqlite() {
    let server = MockServer::start_async().await;
    let body = [
        json!({"choices": [{"index": 0, "delta": {"content": "Ahoy"}, "finish_reason": null}]}),
        json!({"choices": [{"index": 0, "delta": {}, "finish_reason": "stop"}]}),
        json!({"choices": [], "usage": {"prompt_tokens": 40, "completion_tokens": 2, "total_tokens": 42}}),
    ]
    .iter()
    .map(|line| format!("data: {line}\n\n"))
    .collect::<String>()
        + "data: [DONE]\n\n";
    let chat_mock = server
        .mock_async(|when, then| {
            when.method(POST).path("/chat/completions");
            then.status(200)
                .header("content-type", "text/event-stream")
                .body(body);
        })
        .await;

    let dir = TempDir::new().unwrap();
    let config = Config {
        openai: Some(OpenAiConfig {
            api_key: Some("key".to_string()),
            model: Some("gpt-4o-mini".to_string()),
            base_url: Some(server.base_url()),
            ..OpenAiConfig::default()
        }),
        database: Some(DatabaseConfig {
            sqlite_path: Some(dir.path().join("engine.db").to_str().unwrap().to_string()),
        }),
        personas: vec![persona("cook")],
        ..Config::default()
    };
    let app = router(PersonaEngine::from_config(config).await.unwrap());

    let response = app
        .clone()
        .oneshot(post(
            "/chat/stream",
            json!({"user_id": "u1", "persona_id": "cook", "text": "hello"}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get("content-type").unwrap(),
        "text/event-stream"
    );
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let text = String::from_utf8(bytes.to_vec()).unwrap();
    let chunks: Vec<Value> = text
        .split("\n\n")
        .filter_map(|frame| frame.strip_prefix("data: "))
        .map(|payload| serde_json::from_str(payload).unwrap())
        .collect();
    assert_eq!(chunks.len(), 2);
    assert_eq!(chunks[0], json!({"type": "token", "text": "Ahoy"}));
    assert_eq!(
        chunks[1],
        json!({"type": "done", "finish_reason": "stop", "total_tokens": 42})
    );
    chat_mock.assert_async().await;

    let response = app
        .oneshot(get("/usage/current?user_id=u1"))
        .await
        .unwrap();
    let value = json_body(response).await;
    assert_eq!(value["messages_today"], 1);
    assert_eq!(value["tokens_today"], 42);
}
