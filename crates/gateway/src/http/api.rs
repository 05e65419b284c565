use axum::{
    extract::{Path, Query, State},
    Json,
};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use worker_rpc::{BridgeStatus, METHOD_MODEL_LIST, METHOD_RATE_LIMITS_READ};

use crate::{
    error::ApiError,
    state::AppState,
    turns::TurnOptions,
};

/// `GET /health`: 200 always; degraded when the bridge is down.
pub async fn health(State(state): State<AppState>) -> Json<Value> {
    let report = state.bridge.status().await;
    let degraded = report.status != BridgeStatus::Initialized;
    let mut body = Map::new();
    body.insert(
        "status".to_string(),
        Value::String(if degraded { "degraded" } else { "ok" }.to_string()),
    );
    body.insert(
        "worker".to_string(),
        serde_json::to_value(&report).unwrap_or(Value::Null),
    );
    if degraded {
        body.insert(
            "stderrTail".to_string(),
            json!(state.stderr_tail.snapshot().await),
        );
    }
    Json(Value::Object(body))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelsQuery {
    #[serde(default)]
    include_hidden: bool,
}

/// `GET /api/models`: drain the worker's paginated `model/list`,
/// deduplicating by id.
pub async fn list_models(
    State(state): State<AppState>,
    Query(query): Query<ModelsQuery>,
) -> Result<Json<Value>, ApiError> {
    let mut models: Vec<Value> = Vec::new();
    let mut seen = std::collections::HashSet::new();
    let mut cursor: Option<String> = None;

    loop {
        let mut params = Map::new();
        params.insert("includeHidden".to_string(), Value::Bool(query.include_hidden));
        if let Some(cursor) = &cursor {
            params.insert("cursor".to_string(), Value::String(cursor.clone()));
        }
        let result = state
            .bridge
            .request(METHOD_MODEL_LIST, Value::Object(params))
            .await?;

        let items = result
            .get("items")
            .or_else(|| result.get("models"))
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        for item in items {
            let id = item
                .get("id")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            if id.is_empty() || seen.insert(id) {
                models.push(item);
            }
        }

        cursor = result
            .get("nextCursor")
            .and_then(Value::as_str)
            .map(|s| s.to_string());
        if cursor.is_none() {
            break;
        }
    }

    Ok(Json(json!({ "models": models })))
}

/// `GET /api/account/rate-limits`: proxy, degrading to a 200 error body.
pub async fn rate_limits(State(state): State<AppState>) -> Json<Value> {
    match state
        .bridge
        .request(METHOD_RATE_LIMITS_READ, Value::Object(Default::default()))
        .await
    {
        Ok(result) => Json(result),
        Err(err) => Json(json!({ "error": err.to_string() })),
    }
}

#[derive(Deserialize)]
pub struct ThreadsQuery {
    q: Option<String>,
    status: Option<String>,
    archived: Option<bool>,
    cursor: Option<usize>,
    limit: Option<usize>,
}

/// `GET /api/threads`: worker list with projection fallback, in-memory
/// filters, offset-cursor pagination.
pub async fn list_threads(
    State(state): State<AppState>,
    Query(query): Query<ThreadsQuery>,
) -> Result<Json<Value>, ApiError> {
    let all = state.turns.list_threads(500).await?;

    let needle = query.q.as_deref().map(str::to_lowercase);
    let filtered: Vec<_> = all
        .into_iter()
        .filter(|thread| {
            if let Some(needle) = &needle {
                let haystack = format!(
                    "{} {}",
                    thread.title.as_deref().unwrap_or(""),
                    thread.preview.as_deref().unwrap_or("")
                )
                .to_lowercase();
                if !haystack.contains(needle) {
                    return false;
                }
            }
            if let Some(status) = &query.status {
                if thread.status.as_str() != status {
                    return false;
                }
            }
            if let Some(archived) = query.archived {
                if thread.archived != archived {
                    return false;
                }
            }
            true
        })
        .collect();

    let offset = query.cursor.unwrap_or(0);
    let limit = query.limit.unwrap_or(50).clamp(1, 200);
    let page: Vec<_> = filtered.iter().skip(offset).take(limit).collect();
    let next_cursor = if offset + limit < filtered.len() {
        Some(offset + limit)
    } else {
        None
    };

    Ok(Json(json!({ "threads": page, "nextCursor": next_cursor })))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateThreadRequest {
    #[serde(default)]
    mode: Option<String>,
    from_thread_id: Option<String>,
    model: Option<String>,
    cwd: Option<String>,
}

pub async fn create_thread(
    State(state): State<AppState>,
    Json(body): Json<CreateThreadRequest>,
) -> Result<Json<Value>, ApiError> {
    let result = state
        .turns
        .create_thread(
            body.mode.as_deref().unwrap_or("new"),
            body.from_thread_id.as_deref(),
            body.model.as_deref(),
            body.cwd.as_deref(),
        )
        .await?;
    Ok(Json(result))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadThreadQuery {
    include_turns: Option<bool>,
}

pub async fn read_thread(
    State(state): State<AppState>,
    Path(thread_id): Path<String>,
    Query(query): Query<ReadThreadQuery>,
) -> Result<Json<Value>, ApiError> {
    let result = state
        .turns
        .read_thread(&thread_id, query.include_turns.unwrap_or(true))
        .await?;
    Ok(Json(result))
}

/// `GET /api/threads/:id/context`: resolved working-directory metadata.
pub async fn thread_context(
    State(state): State<AppState>,
    Path(thread_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let projected = state
        .store
        .get_thread(&thread_id)
        .await?
        .map(|row| row.project_key);
    let resolved = state
        .resolver
        .resolve(&thread_id, projected.as_deref())
        .await;
    Ok(Json(serde_json::to_value(&resolved).map_err(anyhow::Error::from)?))
}

#[derive(Deserialize)]
pub struct TimelineQuery {
    limit: Option<usize>,
}

/// `GET /api/threads/:id/timeline`: parse the session file; a missing
/// file is an empty timeline, not an error.
pub async fn thread_timeline(
    State(state): State<AppState>,
    Path(thread_id): Path<String>,
    Query(query): Query<TimelineQuery>,
) -> Result<Json<Value>, ApiError> {
    let limit = query.limit.unwrap_or(200).clamp(1, 1000);
    let items = match state.resolver.find_session_file(&thread_id).await {
        Ok(path) => {
            let lines = session_log::read_session_lines(&path)
                .await
                .map_err(anyhow::Error::from)?;
            session_log::parse_timeline(&lines, &thread_id, limit)
        }
        Err(_) => Vec::new(),
    };
    Ok(Json(json!({ "items": items })))
}

#[derive(Deserialize)]
pub struct StartTurnRequest {
    input: Vec<Value>,
    #[serde(default)]
    options: TurnOptions,
}

pub async fn start_turn(
    State(state): State<AppState>,
    Path(thread_id): Path<String>,
    Json(body): Json<StartTurnRequest>,
) -> Result<Json<Value>, ApiError> {
    let result = state
        .turns
        .start_turn(&thread_id, body.input, body.options)
        .await?;
    Ok(Json(result))
}

#[derive(Deserialize)]
pub struct ReviewRequest {
    instructions: Option<String>,
    target: Option<Value>,
    delivery: Option<String>,
}

pub async fn start_review(
    State(state): State<AppState>,
    Path(thread_id): Path<String>,
    Json(body): Json<ReviewRequest>,
) -> Result<Json<Value>, ApiError> {
    let result = state
        .turns
        .review(
            &thread_id,
            body.instructions.as_deref(),
            body.target,
            body.delivery.as_deref(),
        )
        .await?;
    Ok(Json(result))
}

#[derive(Deserialize)]
pub struct ControlRequest {
    action: String,
}

pub async fn control(
    State(state): State<AppState>,
    Path(thread_id): Path<String>,
    Json(body): Json<ControlRequest>,
) -> Result<Json<Value>, ApiError> {
    let result = state.turns.control(&thread_id, &body.action).await?;
    Ok(Json(result))
}

pub async fn pending_approvals(
    State(state): State<AppState>,
    Path(thread_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let approvals = state.approvals.list_pending(&thread_id).await?;
    Ok(Json(json!({ "approvals": approvals })))
}

#[derive(Deserialize)]
pub struct DecisionRequest {
    decision: String,
    note: Option<String>,
}

pub async fn decide_approval(
    State(state): State<AppState>,
    Path((thread_id, approval_id)): Path<(String, String)>,
    Json(body): Json<DecisionRequest>,
) -> Result<Json<Value>, ApiError> {
    let result = state
        .approvals
        .decide(&thread_id, &approval_id, &body.decision, body.note)
        .await?;
    Ok(Json(result))
}

pub async fn pending_interactions(
    State(state): State<AppState>,
    Path(thread_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let interactions = state.interactions.list_pending(&thread_id).await?;
    Ok(Json(json!({ "interactions": interactions })))
}

#[derive(Deserialize)]
pub struct RespondRequest {
    answers: Value,
}

pub async fn respond_interaction(
    State(state): State<AppState>,
    Path((thread_id, interaction_id)): Path<(String, String)>,
    Json(body): Json<RespondRequest>,
) -> Result<Json<Value>, ApiError> {
    let result = state
        .interactions
        .respond(&thread_id, &interaction_id, &body.answers)
        .await?;
    Ok(Json(result))
}
