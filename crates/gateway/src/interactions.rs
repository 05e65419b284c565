use std::{collections::HashMap, sync::Arc};

use serde_json::{json, Map, Value};
use tokio::sync::Mutex;
use tracing::warn;
use worker_rpc::{RpcId, ServerMessage, WorkerBridge};

use crate::{
    approvals::str_field,
    bus::EventBus,
    error::ApiError,
    store::{
        now_ts, AuditActor, EventKind, InteractionRow, InteractionStatus, NewAuditRecord,
        NewGatewayEvent, Store,
    },
};

/// Live mapping from a persisted interaction id back to the JSON-RPC
/// request that raised it. An entry from an older worker generation is
/// dead: the process that asked the question is gone.
#[derive(Clone, Debug)]
struct PendingInteraction {
    rpc_id: RpcId,
    generation: u64,
    thread_id: String,
}

/// Lifecycle of multi-question interactive prompts
/// (`tool/requestUserInput` and its `item/` alias).
#[derive(Clone)]
pub struct InteractionCoordinator {
    store: Store,
    bus: EventBus,
    bridge: Arc<WorkerBridge>,
    pending: Arc<Mutex<HashMap<String, PendingInteraction>>>,
}

pub fn is_interaction_method(method: &str) -> bool {
    matches!(method, "tool/requestUserInput" | "item/tool/requestUserInput")
}

impl InteractionCoordinator {
    pub fn new(store: Store, bus: EventBus, bridge: Arc<WorkerBridge>) -> Self {
        Self {
            store,
            bus,
            bridge,
            pending: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Handles an inbound user-input request. Returns the event payload
    /// for fan-out (questions normalized, `interactionId` attached), or
    /// `None` for a duplicate delivery; the alias method may arrive
    /// twice for the same rpc id.
    pub async fn on_request(&self, message: &ServerMessage) -> Result<Option<Value>, ApiError> {
        let Some(rpc_id) = message.id.clone() else {
            warn!("user-input request without id: {}", message.method);
            return Ok(None);
        };
        let interaction_id = rpc_id.as_key();
        let mut params = message.params.clone();
        normalize_questions(&mut params);

        let thread_id = str_field(&params, "threadId").unwrap_or_default();
        let turn_id = str_field(&params, "turnId");
        let item_id = str_field(&params, "itemId");

        let row = InteractionRow {
            interaction_id: interaction_id.clone(),
            thread_id: thread_id.clone(),
            turn_id: turn_id.clone(),
            item_id,
            interaction_type: "userInput".to_string(),
            status: InteractionStatus::Pending,
            request_payload: params.clone(),
            response_payload: None,
            created_at: now_ts(),
            resolved_at: None,
        };
        if !self.store.upsert_interaction_request(&row).await? {
            return Ok(None);
        }

        self.pending.lock().await.insert(
            interaction_id.clone(),
            PendingInteraction {
                rpc_id,
                generation: self.bridge.generation(),
                thread_id: thread_id.clone(),
            },
        );

        self.store
            .insert_audit_log(&NewAuditRecord {
                actor: AuditActor::Gateway,
                action: "interaction.requested".to_string(),
                thread_id: Some(thread_id),
                turn_id,
                metadata: Some(json!({ "interactionId": interaction_id })),
            })
            .await?;

        if let Value::Object(map) = &mut params {
            map.insert(
                "interactionId".to_string(),
                Value::String(interaction_id),
            );
        }
        Ok(Some(params))
    }

    /// Applies the user's answers. Validation failures leave the row
    /// pending (400); wrong thread is 404; terminal rows and rows whose
    /// worker generation was torn down are 409.
    pub async fn respond(
        &self,
        thread_id: &str,
        interaction_id: &str,
        answers: &Value,
    ) -> Result<Value, ApiError> {
        let answers = validate_answers(answers)?;

        let Some(row) = self.store.get_interaction_by_id(interaction_id).await? else {
            return Err(ApiError::NotFound(format!(
                "interaction {interaction_id} not found"
            )));
        };
        if row.thread_id != thread_id {
            return Err(ApiError::NotFound(format!(
                "interaction {interaction_id} not found on thread {thread_id}"
            )));
        }
        if row.status != InteractionStatus::Pending {
            return Err(ApiError::Conflict(format!(
                "interaction {interaction_id} is no longer pending"
            )));
        }

        let entry = self.pending.lock().await.get(interaction_id).cloned();
        let rpc_id = match entry {
            Some(entry) if entry.generation == self.bridge.generation() => entry.rpc_id,
            // Pending row without a live mapping: the worker that asked
            // the question is gone, so the answers have no recipient.
            _ => {
                return Err(ApiError::Conflict(format!(
                    "interaction {interaction_id} belongs to a previous worker session"
                )));
            }
        };

        let response_payload = json!({ "answers": answers });
        if !self
            .store
            .respond_interaction_request(interaction_id, &response_payload)
            .await?
        {
            return Err(ApiError::Conflict(format!(
                "interaction {interaction_id} is no longer pending"
            )));
        }

        if let Err(err) = self.bridge.respond(&rpc_id, response_payload.clone()).await {
            warn!("interaction {interaction_id}: failed to respond to worker: {err}");
        }

        self.store
            .insert_audit_log(&NewAuditRecord {
                actor: AuditActor::User,
                action: "interaction.responded".to_string(),
                thread_id: Some(thread_id.to_string()),
                turn_id: row.turn_id.clone(),
                metadata: Some(json!({ "interactionId": interaction_id })),
            })
            .await?;

        self.bus
            .append(NewGatewayEvent {
                thread_id: thread_id.to_string(),
                turn_id: row.turn_id,
                kind: EventKind::Interaction,
                name: "interaction/responded".to_string(),
                payload: json!({ "interactionId": interaction_id }),
            })
            .await?;

        self.pending.lock().await.remove(interaction_id);
        Ok(json!({ "ok": true }))
    }

    pub async fn list_pending(&self, thread_id: &str) -> Result<Vec<InteractionRow>, ApiError> {
        Ok(self
            .store
            .list_pending_interactions_by_thread(thread_id)
            .await?)
    }

    /// The turn ended without answers: every pending prompt for it is
    /// cancelled and announced with the given reason.
    pub async fn cancel_for_turn(
        &self,
        thread_id: &str,
        turn_id: &str,
        reason: &str,
    ) -> Result<(), ApiError> {
        let cancelled = self
            .store
            .cancel_pending_interactions_for_turn(thread_id, turn_id)
            .await?;
        if cancelled.is_empty() {
            return Ok(());
        }

        let mut pending = self.pending.lock().await;
        for interaction_id in &cancelled {
            pending.remove(interaction_id);
        }
        drop(pending);

        for interaction_id in cancelled {
            self.store
                .insert_audit_log(&NewAuditRecord {
                    actor: AuditActor::Gateway,
                    action: "interaction.cancelled".to_string(),
                    thread_id: Some(thread_id.to_string()),
                    turn_id: Some(turn_id.to_string()),
                    metadata: Some(json!({ "interactionId": interaction_id, "reason": reason })),
                })
                .await?;
            self.bus
                .append(NewGatewayEvent {
                    thread_id: thread_id.to_string(),
                    turn_id: Some(turn_id.to_string()),
                    kind: EventKind::Interaction,
                    name: "interaction/cancelled".to_string(),
                    payload: json!({ "interactionId": interaction_id, "reason": reason }),
                })
                .await?;
        }
        Ok(())
    }

    /// Startup reconciliation, before any request handler runs.
    pub async fn reconcile_on_startup(&self) -> Result<usize, ApiError> {
        let cancelled = self.store.cancel_all_pending_interactions().await?;
        for interaction_id in &cancelled {
            self.store
                .insert_audit_log(&NewAuditRecord {
                    actor: AuditActor::Gateway,
                    action: "interaction.cancelled".to_string(),
                    thread_id: None,
                    turn_id: None,
                    metadata: Some(json!({
                        "interactionId": interaction_id,
                        "reason": "gateway_restarted",
                    })),
                })
                .await?;
        }
        Ok(cancelled.len())
    }
}

/// Normalizes `questions[]` in place: an `options` vector whose entries
/// are all malformed becomes `null`. Fully malformed question vectors
/// are left as-is so the UI can still render the raw payload.
fn normalize_questions(params: &mut Value) {
    let Some(questions) = params.get_mut("questions").and_then(Value::as_array_mut) else {
        return;
    };
    for question in questions {
        let Some(question) = question.as_object_mut() else {
            continue;
        };
        let Some(options) = question.get("options") else {
            continue;
        };
        match options.as_array() {
            Some(entries) if !entries.is_empty() => {
                let valid = entries
                    .iter()
                    .filter(|entry| {
                        entry
                            .get("label")
                            .map(|label| label.is_string())
                            .unwrap_or(false)
                    })
                    .count();
                if valid == 0 {
                    question.insert("options".to_string(), Value::Null);
                }
            }
            Some(_) => {}
            None => {
                question.insert("options".to_string(), Value::Null);
            }
        }
    }
}

/// Answers must be a non-empty object of `{questionId: {answers: [..]}}`
/// where every answer list still has content after trimming whitespace.
fn validate_answers(raw: &Value) -> Result<Map<String, Value>, ApiError> {
    let Some(object) = raw.as_object() else {
        return Err(ApiError::BadRequest("answers must be an object".to_string()));
    };
    if object.is_empty() {
        return Err(ApiError::BadRequest("answers must not be empty".to_string()));
    }

    let mut validated = Map::new();
    for (question_id, entry) in object {
        let list = entry
            .get("answers")
            .and_then(Value::as_array)
            .ok_or_else(|| {
                ApiError::BadRequest(format!("answers for `{question_id}` must be a list"))
            })?;
        let trimmed: Vec<Value> = list
            .iter()
            .filter_map(Value::as_str)
            .map(str::trim)
            .filter(|answer| !answer.is_empty())
            .map(|answer| Value::String(answer.to_string()))
            .collect();
        if trimmed.is_empty() {
            return Err(ApiError::BadRequest(format!(
                "answers for `{question_id}` must not be empty"
            )));
        }
        validated.insert(
            question_id.clone(),
            json!({ "answers": Value::Array(trimmed) }),
        );
    }
    Ok(validated)
}
