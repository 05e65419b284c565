mod support;

use axum::{
    body::Body,
    http::{Request, StatusCode},
};
use gateway::{error::ApiError, http::router, turns::TurnOptions};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use support::{start_gateway, wait_for};
use tower::util::ServiceExt;

fn text_input(text: &str) -> Vec<Value> {
    vec![json!({ "type": "text", "text": text })]
}

#[tokio::test]
async fn approval_allow_end_to_end() {
    let (_dir, state) = start_gateway(false).await;

    state
        .turns
        .start_turn("T", text_input("please run the thing needs-approval"), TurnOptions::default())
        .await
        .expect("start turn");

    // The worker's requestApproval arrives asynchronously.
    let pending = wait_for(|| async {
        let rows = state.approvals.list_pending("T").await.expect("list");
        (!rows.is_empty()).then_some(rows)
    })
    .await;
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].approval_id, "99");

    let result = state
        .approvals
        .decide("T", "99", "allow", None)
        .await
        .expect("decide");
    assert_eq!(result, json!({ "ok": true }));

    assert!(state.approvals.list_pending("T").await.unwrap().is_empty());

    // Exactly one worker response: a second decision conflicts.
    let err = state
        .approvals
        .decide("T", "99", "deny", None)
        .await
        .expect_err("second decision");
    assert!(matches!(err, ApiError::Conflict(_)));

    // The decision event landed in the durable log.
    let events = state
        .store
        .list_gateway_events_since("T", 0, 1000)
        .await
        .unwrap();
    assert!(events.iter().any(|event| event.name == "approval/decision"));

    // Unknown decisions and unknown ids keep their error classes.
    let err = state
        .approvals
        .decide("T", "99", "maybe", None)
        .await
        .expect_err("bad decision");
    assert!(matches!(err, ApiError::BadRequest(_)));
    let err = state
        .approvals
        .decide("T", "404404", "allow", None)
        .await
        .expect_err("unknown id");
    assert!(matches!(err, ApiError::NotFound(_)));
}

#[tokio::test]
async fn interaction_response_with_validation() {
    let (_dir, state) = start_gateway(false).await;

    state
        .turns
        .start_turn("T", text_input("needs-input for deploy"), TurnOptions::default())
        .await
        .expect("start turn");

    let pending = wait_for(|| async {
        let rows = state.interactions.list_pending("T").await.expect("list");
        (!rows.is_empty()).then_some(rows)
    })
    .await;
    assert_eq!(pending[0].interaction_id, "199");

    // Whitespace-only answers: 400, still pending.
    let err = state
        .interactions
        .respond("T", "199", &json!({"q1": {"answers": ["   "]}}))
        .await
        .expect_err("blank answers");
    assert!(matches!(err, ApiError::BadRequest(_)));
    assert_eq!(state.interactions.list_pending("T").await.unwrap().len(), 1);

    // Wrong thread: 404.
    let err = state
        .interactions
        .respond("other-thread", "199", &json!({"q1": {"answers": ["Staging"]}}))
        .await
        .expect_err("wrong thread");
    assert!(matches!(err, ApiError::NotFound(_)));

    let result = state
        .interactions
        .respond("T", "199", &json!({"q1": {"answers": ["Staging"]}}))
        .await
        .expect("respond");
    assert_eq!(result, json!({ "ok": true }));

    let err = state
        .interactions
        .respond("T", "199", &json!({"q1": {"answers": ["Prod"]}}))
        .await
        .expect_err("second response");
    assert!(matches!(err, ApiError::Conflict(_)));
}

#[tokio::test]
async fn turn_start_auto_resumes_not_loaded_threads() {
    let (_dir, state) = start_gateway(false).await;

    // The fake rejects cold threads until it sees thread/resume.
    let result = state
        .turns
        .start_turn("cold-7", text_input("hello"), TurnOptions::default())
        .await
        .expect("auto-resume");
    assert!(result.get("turnId").and_then(Value::as_str).is_some());
}

#[tokio::test]
async fn plan_mode_falls_back_when_unsupported() {
    let (_dir, state) = start_gateway(true).await;

    let options = TurnOptions {
        collaboration_mode: Some("plan".to_string()),
        ..TurnOptions::default()
    };
    let result = state
        .turns
        .start_turn("T", text_input("plan this"), options)
        .await
        .expect("start turn");

    let warnings = result.get("warnings").and_then(Value::as_array).expect("warnings");
    assert_eq!(warnings, &vec![json!("plan_mode_fallback")]);

    // No collaborationMode field was forwarded to turn/start.
    let forwarded = &result["result"]["echoParams"];
    assert!(forwarded.get("collaborationMode").is_none());
}

#[tokio::test]
async fn plan_preset_resolves_model_and_effort() {
    let (_dir, state) = start_gateway(false).await;

    let options = TurnOptions {
        collaboration_mode: Some("plan".to_string()),
        model: Some("caller-model".to_string()),
        ..TurnOptions::default()
    };
    let result = state
        .turns
        .start_turn("T", text_input("plan this"), options)
        .await
        .expect("start turn");

    assert!(result.get("warnings").is_none());
    let forwarded = &result["result"]["echoParams"];
    assert_eq!(forwarded["collaborationMode"], "plan");
    // The preset's model wins over the caller's.
    assert_eq!(forwarded["model"], "planner-1");
    assert_eq!(forwarded["effort"], "high");
    assert_eq!(forwarded["developerInstructions"], "plan first");
}

#[tokio::test]
async fn token_expansion_prefers_skills_over_apps() {
    let (_dir, state) = start_gateway(false).await;

    let result = state
        .turns
        .start_turn("T", text_input("$same-token do work"), TurnOptions::default())
        .await
        .expect("start turn");

    let forwarded = result["result"]["echoParams"]["input"]
        .as_array()
        .expect("input array")
        .clone();
    let injected: Vec<&Value> = forwarded
        .iter()
        .filter(|item| item.get("name").and_then(Value::as_str) == Some("same-token"))
        .collect();
    assert_eq!(injected.len(), 1, "exactly one injected item: {forwarded:?}");
    assert_eq!(injected[0]["type"], "skill");
    assert_eq!(injected[0]["path"], "/skills/same-token");
}

#[tokio::test]
async fn turn_completion_cancels_pending_interactions() {
    let (_dir, state) = start_gateway(false).await;

    state
        .turns
        .start_turn("T", text_input("needs-input then-complete"), TurnOptions::default())
        .await
        .expect("start turn");

    // turn/completed follows the interaction request; the dispatcher
    // cancels the pending prompt with the completion reason.
    wait_for(|| async {
        let events = state
            .store
            .list_gateway_events_since("T", 0, 1000)
            .await
            .expect("events");
        events
            .iter()
            .find(|event| event.name == "interaction/cancelled")
            .map(|event| {
                assert_eq!(event.payload["reason"], "turn_completed");
            })
    })
    .await;

    assert!(state.interactions.list_pending("T").await.unwrap().is_empty());

    // Answering after cancellation conflicts.
    let err = state
        .interactions
        .respond("T", "199", &json!({"q1": {"answers": ["Staging"]}}))
        .await
        .expect_err("cancelled");
    assert!(matches!(err, ApiError::Conflict(_)));
}

#[tokio::test]
async fn restart_reconciliation_cancels_prior_pending_rows() {
    use gateway::store::{
        now_ts, InteractionRow, InteractionStatus, Store,
    };
    use std::{sync::Arc, time::Duration};
    use worker_rpc::{WorkerBridge, WorkerConfig};

    // A pending row left over from a previous gateway generation.
    let store = Store::open_in_memory().expect("store");
    store
        .upsert_interaction_request(&InteractionRow {
            interaction_id: "777".to_string(),
            thread_id: "T".to_string(),
            turn_id: Some("U".to_string()),
            item_id: None,
            interaction_type: "userInput".to_string(),
            status: InteractionStatus::Pending,
            request_payload: json!({"questions": []}),
            response_payload: None,
            created_at: now_ts(),
            resolved_at: None,
        })
        .await
        .expect("seed pending row");

    let (_dir, script) = support::write_fake_app_server();
    let mut worker_config = WorkerConfig::new(&script);
    worker_config.startup_timeout = Duration::from_secs(5);
    worker_config.request_timeout = Duration::from_secs(2);
    let bridge = Arc::new(WorkerBridge::new(worker_config));
    bridge.start().await.expect("bridge start");

    let state = gateway::state::build_gateway(
        gateway::config::GatewayConfig::default(),
        store.clone(),
        bridge,
    )
    .await
    .expect("gateway state");

    // Reconciled before any handler could run.
    assert!(state.interactions.list_pending("T").await.unwrap().is_empty());
    let row = store.get_interaction_by_id("777").await.unwrap().unwrap();
    assert_eq!(row.status, InteractionStatus::Cancelled);

    // Answering a reconciled row conflicts.
    let err = state
        .interactions
        .respond("T", "777", &json!({"q1": {"answers": ["late"]}}))
        .await
        .expect_err("reconciled row");
    assert!(matches!(err, ApiError::Conflict(_)));
}

#[tokio::test]
async fn control_without_active_turn_is_a_noop() {
    let (_dir, state) = start_gateway(false).await;
    let result = state.turns.control("T", "stop").await.expect("stop");
    assert_eq!(result, json!({ "ok": true }));

    let err = state.turns.control("T", "retry").await.expect_err("retry");
    assert!(matches!(err, ApiError::BadRequest(_)));
    let err = state.turns.control("T", "explode").await.expect_err("action");
    assert!(matches!(err, ApiError::BadRequest(_)));
}

#[tokio::test]
async fn retry_reruns_last_turn_input() {
    let (_dir, state) = start_gateway(false).await;

    state
        .turns
        .start_turn("T", text_input("first run"), TurnOptions::default())
        .await
        .expect("start turn");
    let result = state.turns.control("T", "retry").await.expect("retry");
    let forwarded = &result["result"]["echoParams"]["input"];
    assert_eq!(forwarded[0]["text"], "first run");
}

#[tokio::test]
async fn review_defaults_and_custom_instructions() {
    let (_dir, state) = start_gateway(false).await;

    let result = state.turns.review("T", None, None, None).await.expect("review");
    let params = &result["echoParams"];
    assert_eq!(params["delivery"], "inline");
    assert_eq!(params["target"], json!({ "type": "uncommittedChanges" }));

    let result = state
        .turns
        .review("T", Some("  check the auth flow  "), None, None)
        .await
        .expect("review custom");
    assert_eq!(
        result["echoParams"]["target"],
        json!({ "type": "custom", "instructions": "check the auth flow" })
    );
}

#[tokio::test]
async fn thread_read_falls_back_to_projection_when_gone() {
    let (_dir, state) = start_gateway(false).await;

    // Unknown everywhere: 404.
    let err = state
        .turns
        .read_thread("gone", true)
        .await
        .expect_err("no projection");
    assert!(matches!(err, ApiError::NotFound(_)));

    // With a projection present, the fallback serves it.
    state
        .turns
        .create_thread("new", None, None, Some("/work/app"))
        .await
        .expect("create");
    // "gone" has no projection; seed one through the worker list refresh.
    let threads = state.turns.list_threads(100).await.expect("list");
    assert!(threads.iter().any(|thread| thread.thread_id == "th-1"));

    let detail = state.turns.read_thread("th-1", true).await.expect("read");
    assert_eq!(detail["thread"]["id"], "th-1");
}

#[tokio::test]
async fn cold_thread_read_resumes_once() {
    let (_dir, state) = start_gateway(false).await;
    let detail = state
        .turns
        .read_thread("cold-read", true)
        .await
        .expect("resume and read");
    assert_eq!(detail["thread"]["id"], "cold-read");
}

#[tokio::test]
async fn health_reports_ok_over_http() {
    let (_dir, state) = start_gateway(false).await;
    let app = router(state);

    let response = app
        .oneshot(Request::get("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let body: Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["worker"]["status"], "initialized");
}

#[tokio::test]
async fn models_endpoint_paginates_and_dedupes() {
    let (_dir, state) = start_gateway(false).await;
    let app = router(state);

    let response = app
        .oneshot(Request::get("/api/models").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let body: Value = serde_json::from_slice(&bytes).unwrap();
    let ids: Vec<&str> = body["models"]
        .as_array()
        .unwrap()
        .iter()
        .filter_map(|model| model["id"].as_str())
        .collect();
    assert_eq!(ids, vec!["m1", "m2", "m3"]);
}

#[tokio::test]
async fn sse_stream_replays_then_delivers_live_events() {
    let (_dir, state) = start_gateway(false).await;

    // One prior event at seq 1.
    state
        .bus
        .append(gateway::store::NewGatewayEvent {
            thread_id: "T".to_string(),
            turn_id: None,
            kind: gateway::store::EventKind::Turn,
            name: "turn/started".to_string(),
            payload: json!({}),
        })
        .await
        .expect("seed event");

    let app = router(state.clone());
    let response = app
        .oneshot(
            Request::get("/api/threads/T/events?since=0")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()["content-type"].to_str().unwrap(),
        "text/event-stream"
    );

    let mut body = response.into_body();
    let first = body.frame().await.unwrap().unwrap();
    let first = String::from_utf8_lossy(first.data_ref().unwrap()).to_string();
    assert!(first.contains("id: 1"), "frame was: {first}");
    assert!(first.contains("event: gateway"));

    // Live event arrives in order with the next id.
    state
        .bus
        .append(gateway::store::NewGatewayEvent {
            thread_id: "T".to_string(),
            turn_id: None,
            kind: gateway::store::EventKind::Turn,
            name: "turn/completed".to_string(),
            payload: json!({}),
        })
        .await
        .expect("live event");

    let second = body.frame().await.unwrap().unwrap();
    let second = String::from_utf8_lossy(second.data_ref().unwrap()).to_string();
    assert!(second.contains("id: 2"), "frame was: {second}");
    assert!(second.contains("turn/completed"));
}

#[tokio::test]
async fn interaction_endpoint_status_codes_over_http() {
    let (_dir, state) = start_gateway(false).await;

    state
        .turns
        .start_turn("T", text_input("needs-input here"), TurnOptions::default())
        .await
        .expect("start turn");
    wait_for(|| async {
        let rows = state.interactions.list_pending("T").await.expect("list");
        (!rows.is_empty()).then_some(())
    })
    .await;

    let app = router(state.clone());
    let bad = Request::post("/api/threads/T/interactions/199/respond")
        .header("content-type", "application/json")
        .body(Body::from(r#"{"answers":{"q1":{"answers":["  "]}}}"#))
        .unwrap();
    let response = app.clone().oneshot(bad).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let good = Request::post("/api/threads/T/interactions/199/respond")
        .header("content-type", "application/json")
        .body(Body::from(r#"{"answers":{"q1":{"answers":["Staging"]}}}"#))
        .unwrap();
    let response = app.clone().oneshot(good).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let again = Request::post("/api/threads/T/interactions/199/respond")
        .header("content-type", "application/json")
        .body(Body::from(r#"{"answers":{"q1":{"answers":["Prod"]}}}"#))
        .unwrap();
    let response = app.oneshot(again).await.unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);
}
