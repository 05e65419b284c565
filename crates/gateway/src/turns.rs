use std::{collections::HashMap, sync::Arc};

use serde::Deserialize;
use serde_json::{json, Map, Value};
use session_log::ContextResolver;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use worker_rpc::{
    BridgeError, WorkerBridge, METHOD_APP_LIST, METHOD_COLLABORATION_MODE_LIST,
    METHOD_REVIEW_START, METHOD_SKILLS_LIST, METHOD_THREAD_FORK, METHOD_THREAD_LIST,
    METHOD_THREAD_READ, METHOD_THREAD_RESUME, METHOD_THREAD_START, METHOD_TURN_INTERRUPT,
    METHOD_TURN_START,
};

use crate::{
    approvals::str_field,
    classify::{classify_worker_error, RecoveryAction},
    error::ApiError,
    store::{now_ts, AuditActor, NewAuditRecord, Store, ThreadProjection, ThreadStatus},
};

/// Options accepted on turn start.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnOptions {
    pub model: Option<String>,
    pub effort: Option<String>,
    pub cwd: Option<String>,
    /// `plan` or `default`.
    pub collaboration_mode: Option<String>,
    /// `full-access` or `local`.
    pub permission_mode: Option<String>,
}

#[derive(Clone, Debug)]
struct StoredTurnRequest {
    input: Vec<Value>,
    options: TurnOptions,
}

/// Whether this worker implements `collaborationMode/list`. Probed once.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum CollabModeSupport {
    Unknown,
    Supported,
    Unsupported,
}

#[derive(Default)]
struct TurnsInner {
    active_turn: HashMap<String, String>,
    last_turn_input: HashMap<String, StoredTurnRequest>,
}

/// Thread and turn lifecycle against the worker: start/fork/read/list,
/// turn start with slash-token expansion and preset resolution,
/// stop/retry/cancel, review, and one-shot auto-resume on "thread not
/// loaded" classes of error.
#[derive(Clone)]
pub struct TurnController {
    store: Store,
    bridge: Arc<WorkerBridge>,
    resolver: Arc<ContextResolver>,
    inner: Arc<Mutex<TurnsInner>>,
    collab_support: Arc<Mutex<CollabModeSupport>>,
    /// Per-thread serialization of `thread/resume` so concurrent
    /// auto-resumes collapse instead of storming the worker.
    resume_locks: Arc<Mutex<HashMap<String, Arc<Mutex<()>>>>>,
}

impl TurnController {
    pub fn new(store: Store, bridge: Arc<WorkerBridge>, resolver: Arc<ContextResolver>) -> Self {
        Self {
            store,
            bridge,
            resolver,
            inner: Arc::new(Mutex::new(TurnsInner::default())),
            collab_support: Arc::new(Mutex::new(CollabModeSupport::Unknown)),
            resume_locks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    // ---- thread operations ----

    /// `POST /api/threads`: `new` starts a fresh thread, `fork` branches
    /// from an existing one, inheriting its project key.
    pub async fn create_thread(
        &self,
        mode: &str,
        from_thread_id: Option<&str>,
        model: Option<&str>,
        cwd: Option<&str>,
    ) -> Result<Value, ApiError> {
        let (result, project_key) = match mode {
            "new" | "" => {
                let mut params = Map::new();
                if let Some(cwd) = cwd {
                    params.insert("cwd".to_string(), Value::String(cwd.to_string()));
                }
                if let Some(model) = model {
                    params.insert("model".to_string(), Value::String(model.to_string()));
                }
                let result = self
                    .bridge
                    .request(METHOD_THREAD_START, Value::Object(params))
                    .await?;
                let key = cwd.map(|c| c.to_string()).unwrap_or_else(|| "unknown".to_string());
                (result, key)
            }
            "fork" => {
                let parent = from_thread_id.ok_or_else(|| {
                    ApiError::BadRequest("fork requires fromThreadId".to_string())
                })?;
                let result = self
                    .bridge
                    .request(METHOD_THREAD_FORK, json!({ "threadId": parent }))
                    .await?;
                let key = self
                    .store
                    .get_thread(parent)
                    .await?
                    .map(|row| row.project_key)
                    .unwrap_or_else(|| "unknown".to_string());
                (result, key)
            }
            other => {
                return Err(ApiError::BadRequest(format!("unknown thread mode `{other}`")));
            }
        };

        let thread = result.get("thread").cloned().unwrap_or_else(|| result.clone());
        if let Some(thread_id) = thread_value_id(&thread) {
            self.store
                .upsert_threads(&[ThreadProjection {
                    thread_id: thread_id.clone(),
                    project_key: project_key.clone(),
                    title: str_field(&thread, "title"),
                    preview: str_field(&thread, "preview"),
                    status: ThreadStatus::Idle,
                    archived: false,
                    updated_at: now_ts(),
                    last_error: None,
                }])
                .await?;
        }

        Ok(json!({ "thread": thread, "projectKey": project_key }))
    }

    /// `GET /api/threads/:id` with the full fallback chain: retry
    /// without turns when not materialized, resume-and-retry when not
    /// loaded, projection-only when the worker has no rollout.
    pub async fn read_thread(
        &self,
        thread_id: &str,
        include_turns: bool,
    ) -> Result<Value, ApiError> {
        let mut include_turns = include_turns;
        let mut resumed = false;
        let mut downgraded = false;

        loop {
            let outcome = self
                .bridge
                .request(
                    METHOD_THREAD_READ,
                    json!({ "threadId": thread_id, "includeTurns": include_turns }),
                )
                .await;

            let err = match outcome {
                Ok(result) => return Ok(result),
                Err(err) => err,
            };

            match classify_bridge_error(&err) {
                Some(RecoveryAction::RetryWithoutTurns) if include_turns && !downgraded => {
                    downgraded = true;
                    include_turns = false;
                }
                Some(RecoveryAction::ResumeAndRetry) if !resumed => {
                    resumed = true;
                    self.resume_thread(thread_id).await?;
                }
                Some(RecoveryAction::ProjectionFallback) => {
                    let Some(projection) = self.store.get_thread(thread_id).await? else {
                        return Err(ApiError::NotFound(format!("thread {thread_id} not found")));
                    };
                    return Ok(json!({ "thread": projection, "fallback": true }));
                }
                _ => return Err(err.into()),
            }
        }
    }

    /// `GET /api/threads`: refresh projections from `thread/list`,
    /// degrading to the cached projection when the worker fails. Project
    /// keys still `"unknown"` are hydrated from session files.
    pub async fn list_threads(&self, limit: usize) -> Result<Vec<ThreadProjection>, ApiError> {
        match self.fetch_worker_threads().await {
            Ok(rows) => {
                if !rows.is_empty() {
                    self.store.upsert_threads(&rows).await?;
                }
            }
            Err(err) => {
                debug!("thread/list failed, serving projection: {err}");
            }
        }

        let mut threads = self.store.list_projected_threads(limit).await?;
        for thread in &mut threads {
            if thread.project_key == "unknown" {
                let resolved = self.resolver.resolve(&thread.thread_id, None).await;
                if matches!(
                    resolved.source,
                    session_log::ContextSource::SessionMeta | session_log::ContextSource::TurnContext
                ) {
                    let key = resolved.cwd.to_string_lossy().to_string();
                    self.store
                        .update_thread_project_key(&thread.thread_id, &key)
                        .await?;
                    thread.project_key = key;
                }
            }
        }
        Ok(threads)
    }

    async fn fetch_worker_threads(&self) -> Result<Vec<ThreadProjection>, BridgeError> {
        let mut rows = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let mut params = Map::new();
            if let Some(cursor) = &cursor {
                params.insert("cursor".to_string(), Value::String(cursor.clone()));
            }
            let result = self
                .bridge
                .request(METHOD_THREAD_LIST, Value::Object(params))
                .await?;
            for item in list_items(&result) {
                if let Some(row) = thread_projection_from_worker(item) {
                    rows.push(row);
                }
            }
            cursor = str_field(&result, "nextCursor");
            if cursor.is_none() {
                break;
            }
        }
        Ok(rows)
    }

    // ---- turn lifecycle ----

    /// `POST /api/threads/:id/turns`.
    pub async fn start_turn(
        &self,
        thread_id: &str,
        input: Vec<Value>,
        options: TurnOptions,
    ) -> Result<Value, ApiError> {
        if input.is_empty() {
            return Err(ApiError::BadRequest("input must not be empty".to_string()));
        }

        let mut warnings: Vec<String> = Vec::new();

        // Inferred working directory: explicit option, else projection.
        let inferred_cwd = match &options.cwd {
            Some(cwd) => Some(cwd.clone()),
            None => self
                .store
                .get_thread(thread_id)
                .await?
                .map(|row| row.project_key)
                .filter(|key| key != "unknown"),
        };

        let input = self.expand_slash_tokens(input).await;

        let preset = match &options.collaboration_mode {
            Some(mode) => self.resolve_collaboration_mode(mode, &mut warnings).await?,
            None => None,
        };

        let mut params = Map::new();
        params.insert("threadId".to_string(), Value::String(thread_id.to_string()));
        params.insert("input".to_string(), Value::Array(input.clone()));
        let model = preset
            .as_ref()
            .and_then(|preset| preset.model.clone())
            .or_else(|| options.model.clone());
        if let Some(model) = model {
            params.insert("model".to_string(), Value::String(model));
        }
        let effort = preset
            .as_ref()
            .and_then(|preset| preset.effort.clone())
            .or_else(|| options.effort.clone());
        if let Some(effort) = effort {
            params.insert("effort".to_string(), Value::String(effort));
        }
        if let Some(cwd) = &inferred_cwd {
            params.insert("cwd".to_string(), Value::String(cwd.clone()));
        }
        if let Some(preset) = &preset {
            params.insert(
                "collaborationMode".to_string(),
                Value::String(preset.mode.clone()),
            );
            if let Some(instructions) = &preset.developer_instructions {
                params.insert(
                    "developerInstructions".to_string(),
                    Value::String(instructions.clone()),
                );
            }
        }
        apply_permission_mode(&mut params, options.permission_mode.as_deref())?;

        let result = self
            .request_with_resume(thread_id, METHOD_TURN_START, Value::Object(params))
            .await?;

        let turn_id = turn_value_id(&result);
        {
            let mut inner = self.inner.lock().await;
            inner.last_turn_input.insert(
                thread_id.to_string(),
                StoredTurnRequest {
                    input,
                    options: options.clone(),
                },
            );
            if let Some(turn_id) = &turn_id {
                inner
                    .active_turn
                    .insert(thread_id.to_string(), turn_id.clone());
            }
        }

        if let Some(cwd) = &options.cwd {
            self.store.update_thread_project_key(thread_id, cwd).await?;
            self.resolver.invalidate(thread_id).await;
        }

        self.store
            .insert_audit_log(&NewAuditRecord {
                actor: AuditActor::User,
                action: "turn.started".to_string(),
                thread_id: Some(thread_id.to_string()),
                turn_id: turn_id.clone(),
                metadata: None,
            })
            .await?;

        let mut response = Map::new();
        if let Some(turn_id) = turn_id {
            response.insert("turnId".to_string(), Value::String(turn_id));
        }
        response.insert("result".to_string(), result);
        if !warnings.is_empty() {
            response.insert(
                "warnings".to_string(),
                Value::Array(warnings.into_iter().map(Value::String).collect()),
            );
        }
        Ok(Value::Object(response))
    }

    /// `POST /api/threads/:id/control` with `stop`, `retry`, or `cancel`.
    pub async fn control(&self, thread_id: &str, action: &str) -> Result<Value, ApiError> {
        match action {
            "retry" => {
                let stored = {
                    let inner = self.inner.lock().await;
                    inner.last_turn_input.get(thread_id).cloned()
                };
                let Some(stored) = stored else {
                    return Err(ApiError::BadRequest(format!(
                        "no previous turn to retry on thread {thread_id}"
                    )));
                };
                self.store
                    .insert_audit_log(&NewAuditRecord {
                        actor: AuditActor::User,
                        action: "turn.retried".to_string(),
                        thread_id: Some(thread_id.to_string()),
                        turn_id: None,
                        metadata: None,
                    })
                    .await?;
                self.start_turn(thread_id, stored.input, stored.options).await
            }
            "stop" | "cancel" => {
                let active = {
                    let inner = self.inner.lock().await;
                    inner.active_turn.get(thread_id).cloned()
                };
                let Some(turn_id) = active else {
                    return Ok(json!({ "ok": true }));
                };
                self.request_with_resume(
                    thread_id,
                    METHOD_TURN_INTERRUPT,
                    json!({ "threadId": thread_id, "turnId": turn_id }),
                )
                .await?;
                self.store
                    .insert_audit_log(&NewAuditRecord {
                        actor: AuditActor::User,
                        action: "turn.interrupted".to_string(),
                        thread_id: Some(thread_id.to_string()),
                        turn_id: Some(turn_id),
                        metadata: Some(json!({ "action": action })),
                    })
                    .await?;
                Ok(json!({ "ok": true }))
            }
            other => Err(ApiError::BadRequest(format!("unknown action `{other}`"))),
        }
    }

    /// `POST /api/threads/:id/review`. Trimmed non-empty instructions
    /// override the target with a custom one.
    pub async fn review(
        &self,
        thread_id: &str,
        instructions: Option<&str>,
        target: Option<Value>,
        delivery: Option<&str>,
    ) -> Result<Value, ApiError> {
        let target = match instructions.map(str::trim).filter(|text| !text.is_empty()) {
            Some(instructions) => json!({ "type": "custom", "instructions": instructions }),
            None => target.unwrap_or_else(|| json!({ "type": "uncommittedChanges" })),
        };
        let delivery = delivery.unwrap_or("inline");
        let result = self
            .request_with_resume(
                thread_id,
                METHOD_REVIEW_START,
                json!({ "threadId": thread_id, "target": target, "delivery": delivery }),
            )
            .await?;
        Ok(result)
    }

    // ---- dispatcher hooks ----

    pub async fn note_turn_started(&self, thread_id: &str, turn_id: &str) {
        self.inner
            .lock()
            .await
            .active_turn
            .insert(thread_id.to_string(), turn_id.to_string());
    }

    /// Clears the active turn when the finished turn is the tracked one.
    pub async fn note_turn_finished(&self, thread_id: &str, turn_id: &str) {
        let mut inner = self.inner.lock().await;
        if inner.active_turn.get(thread_id).map(String::as_str) == Some(turn_id) {
            inner.active_turn.remove(thread_id);
        }
    }

    pub async fn active_turn(&self, thread_id: &str) -> Option<String> {
        self.inner.lock().await.active_turn.get(thread_id).cloned()
    }

    // ---- internals ----

    /// One request with a single resume-and-retry on "thread not loaded"
    /// classes of error.
    async fn request_with_resume(
        &self,
        thread_id: &str,
        method: &str,
        params: Value,
    ) -> Result<Value, ApiError> {
        match self.bridge.request(method, params.clone()).await {
            Ok(result) => Ok(result),
            Err(err) if classify_bridge_error(&err) == Some(RecoveryAction::ResumeAndRetry) => {
                self.resume_thread(thread_id).await?;
                Ok(self.bridge.request(method, params).await?)
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn resume_thread(&self, thread_id: &str) -> Result<(), ApiError> {
        let lock = {
            let mut locks = self.resume_locks.lock().await;
            locks
                .entry(thread_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        let _guard = lock.lock().await;
        self.bridge
            .request(METHOD_THREAD_RESUME, json!({ "threadId": thread_id }))
            .await?;
        Ok(())
    }

    /// Expands `$token` references against enabled skills and accessible
    /// apps; skills win on collision. Lookup failures are non-fatal.
    async fn expand_slash_tokens(&self, mut input: Vec<Value>) -> Vec<Value> {
        let tokens = collect_tokens(&input);
        if tokens.is_empty() {
            return input;
        }

        let skills = match self.fetch_skills().await {
            Ok(skills) => skills,
            Err(err) => {
                warn!("skills/list failed during token expansion: {err}");
                HashMap::new()
            }
        };
        let apps = match self.fetch_apps().await {
            Ok(apps) => apps,
            Err(err) => {
                warn!("app/list failed during token expansion: {err}");
                HashMap::new()
            }
        };

        for token in tokens {
            let lowered = token.to_lowercase();
            let injected = if let Some((name, path)) = skills.get(&lowered) {
                json!({ "type": "skill", "name": name, "path": path })
            } else if let Some((id, name)) = apps.get(&lowered) {
                json!({ "type": "mention", "name": name, "path": format!("app://{id}") })
            } else {
                continue;
            };

            let duplicate = input.iter().any(|item| {
                item.get("type") == injected.get("type")
                    && item.get("name") == injected.get("name")
                    && item.get("path") == injected.get("path")
            });
            if !duplicate {
                input.push(injected);
            }
        }
        input
    }

    /// Enabled skills keyed by lowercased name → (name, path).
    async fn fetch_skills(&self) -> Result<HashMap<String, (String, String)>, BridgeError> {
        let result = self
            .bridge
            .request(METHOD_SKILLS_LIST, Value::Object(Default::default()))
            .await?;
        let mut skills = HashMap::new();
        for item in list_items(&result) {
            if item.get("enabled").and_then(Value::as_bool) == Some(false) {
                continue;
            }
            let Some(name) = str_field(item, "name") else { continue };
            let path = str_field(item, "path").unwrap_or_default();
            skills.entry(name.to_lowercase()).or_insert((name, path));
        }
        Ok(skills)
    }

    /// Accessible, enabled apps keyed by lowercased id → (id, name).
    async fn fetch_apps(&self) -> Result<HashMap<String, (String, String)>, BridgeError> {
        let mut apps = HashMap::new();
        let mut cursor: Option<String> = None;
        loop {
            let mut params = Map::new();
            if let Some(cursor) = &cursor {
                params.insert("cursor".to_string(), Value::String(cursor.clone()));
            }
            let result = self
                .bridge
                .request(METHOD_APP_LIST, Value::Object(params))
                .await?;
            for item in list_items(&result) {
                let accessible = item.get("isAccessible").and_then(Value::as_bool) == Some(true);
                let enabled = item.get("isEnabled").and_then(Value::as_bool) == Some(true);
                if !accessible || !enabled {
                    continue;
                }
                let Some(id) = str_field(item, "id") else { continue };
                let name = str_field(item, "name").unwrap_or_else(|| id.clone());
                apps.entry(id.to_lowercase()).or_insert((id, name));
            }
            cursor = str_field(&result, "nextCursor");
            if cursor.is_none() {
                break;
            }
        }
        Ok(apps)
    }

    /// Resolves a collaboration mode to its preset. Unsupported workers
    /// degrade `plan` to a warning; any other resolution failure is a
    /// client-visible 400.
    async fn resolve_collaboration_mode(
        &self,
        mode: &str,
        warnings: &mut Vec<String>,
    ) -> Result<Option<CollabPreset>, ApiError> {
        if *self.collab_support.lock().await == CollabModeSupport::Unsupported {
            if mode == "plan" {
                warnings.push("plan_mode_fallback".to_string());
            }
            return Ok(None);
        }

        let outcome = self
            .bridge
            .request(METHOD_COLLABORATION_MODE_LIST, Value::Object(Default::default()))
            .await;

        let result = match outcome {
            Ok(result) => {
                *self.collab_support.lock().await = CollabModeSupport::Supported;
                result
            }
            Err(err)
                if classify_bridge_error(&err) == Some(RecoveryAction::CollabModeUnsupported) =>
            {
                *self.collab_support.lock().await = CollabModeSupport::Unsupported;
                if mode == "plan" {
                    warnings.push("plan_mode_fallback".to_string());
                }
                return Ok(None);
            }
            Err(err) => {
                return Err(ApiError::BadRequest(format!(
                    "could not resolve collaboration mode `{mode}`: {err}"
                )));
            }
        };

        let items = list_items(&result);
        let preset = items
            .iter()
            .find(|item| item.get("mode").and_then(Value::as_str) == Some(mode))
            .or_else(|| {
                items
                    .iter()
                    .find(|item| item.get("name").and_then(Value::as_str) == Some(mode))
            });
        let Some(preset) = preset else {
            return Err(ApiError::BadRequest(format!(
                "unknown collaboration mode `{mode}`"
            )));
        };

        Ok(Some(CollabPreset {
            mode: mode.to_string(),
            model: str_field(preset, "model"),
            effort: str_field(preset, "reasoning_effort"),
            developer_instructions: str_field(preset, "developer_instructions"),
        }))
    }
}

#[derive(Clone, Debug)]
struct CollabPreset {
    mode: String,
    model: Option<String>,
    effort: Option<String>,
    developer_instructions: Option<String>,
}

/// Permission mode → worker approval/sandbox policy fields.
fn apply_permission_mode(
    params: &mut Map<String, Value>,
    mode: Option<&str>,
) -> Result<(), ApiError> {
    match mode {
        None => Ok(()),
        Some("full-access") => {
            params.insert("approvalPolicy".to_string(), Value::String("never".to_string()));
            params.insert(
                "sandboxPolicy".to_string(),
                json!({ "type": "dangerFullAccess" }),
            );
            Ok(())
        }
        Some("local") => {
            params.insert(
                "approvalPolicy".to_string(),
                Value::String("on-request".to_string()),
            );
            params.insert(
                "sandboxPolicy".to_string(),
                json!({ "type": "workspaceWrite", "networkAccess": false }),
            );
            Ok(())
        }
        Some(other) => Err(ApiError::BadRequest(format!(
            "unknown permission mode `{other}`"
        ))),
    }
}

/// `$token` scan over every text input item, deduplicated
/// case-insensitively in first-seen order.
fn collect_tokens(input: &[Value]) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    let mut tokens = Vec::new();
    for item in input {
        if item.get("type").and_then(Value::as_str) != Some("text") {
            continue;
        }
        let Some(text) = item.get("text").and_then(Value::as_str) else {
            continue;
        };
        for token in scan_tokens(text) {
            if seen.insert(token.to_lowercase()) {
                tokens.push(token);
            }
        }
    }
    tokens
}

/// Tokens match `\$[A-Za-z0-9._-]+`; returned without the `$`.
fn scan_tokens(text: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut chars = text.char_indices().peekable();
    while let Some((_, ch)) = chars.next() {
        if ch != '$' {
            continue;
        }
        let mut token = String::new();
        while let Some((_, next)) = chars.peek() {
            if next.is_ascii_alphanumeric() || matches!(next, '.' | '_' | '-') {
                token.push(*next);
                chars.next();
            } else {
                break;
            }
        }
        if !token.is_empty() {
            tokens.push(token);
        }
    }
    tokens
}

fn classify_bridge_error(err: &BridgeError) -> Option<RecoveryAction> {
    err.rpc_message().and_then(classify_worker_error)
}

/// Items array under the conventional keys of paginated worker results.
fn list_items(result: &Value) -> Vec<&Value> {
    ["items", "threads", "models", "skills", "apps", "modes", "presets"]
        .iter()
        .find_map(|key| result.get(*key).and_then(Value::as_array))
        .map(|items| items.iter().collect())
        .unwrap_or_default()
}

fn thread_value_id(thread: &Value) -> Option<String> {
    str_field(thread, "id").or_else(|| str_field(thread, "threadId"))
}

fn turn_value_id(result: &Value) -> Option<String> {
    result
        .get("turn")
        .and_then(|turn| turn.get("id"))
        .and_then(Value::as_str)
        .map(|s| s.to_string())
        .or_else(|| str_field(result, "turnId"))
}

fn thread_projection_from_worker(item: &Value) -> Option<ThreadProjection> {
    let thread_id = thread_value_id(item)?;
    Some(ThreadProjection {
        thread_id,
        project_key: str_field(item, "projectKey").unwrap_or_else(|| "unknown".to_string()),
        title: str_field(item, "title"),
        preview: str_field(item, "preview"),
        status: item
            .get("status")
            .and_then(Value::as_str)
            .map(ThreadStatus::parse)
            .unwrap_or(ThreadStatus::Unknown),
        archived: item.get("archived").and_then(Value::as_bool).unwrap_or(false),
        updated_at: str_field(item, "updatedAt").unwrap_or_else(now_ts),
        last_error: None,
    })
}
