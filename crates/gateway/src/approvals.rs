use std::{collections::HashMap, sync::Arc};

use serde_json::{json, Value};
use tokio::sync::Mutex;
use tracing::warn;
use worker_rpc::{RpcId, ServerMessage, WorkerBridge};

use crate::{
    bus::EventBus,
    error::ApiError,
    store::{
        now_ts, ApprovalRow, ApprovalStatus, ApprovalType, AuditActor, Decision, EventKind,
        NewAuditRecord, NewGatewayEvent, Store,
    },
};

/// Live mapping from a persisted approval id back to the JSON-RPC
/// request that raised it. Dies with the worker process; decisions that
/// outlive it fall back to re-parsing the persisted id.
#[derive(Clone, Debug)]
struct PendingApproval {
    rpc_id: RpcId,
    thread_id: String,
}

/// Lifecycle of command/file approval requests: worker request in,
/// persisted pending row + live id map, user decision out.
#[derive(Clone)]
pub struct ApprovalCoordinator {
    store: Store,
    bus: EventBus,
    bridge: Arc<WorkerBridge>,
    pending: Arc<Mutex<HashMap<String, PendingApproval>>>,
}

/// Approval type for a server-initiated method, when it is one.
pub fn approval_type_for_method(method: &str) -> Option<ApprovalType> {
    match method {
        "item/commandExecution/requestApproval" => Some(ApprovalType::CommandExecution),
        "item/fileChange/requestApproval" => Some(ApprovalType::FileChange),
        _ => None,
    }
}

impl ApprovalCoordinator {
    pub fn new(store: Store, bus: EventBus, bridge: Arc<WorkerBridge>) -> Self {
        Self {
            store,
            bus,
            bridge,
            pending: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Handles an inbound `requestApproval`. Returns the event payload
    /// for fan-out, augmented with `{approvalId, approvalType}`, or
    /// `None` for a duplicate delivery.
    pub async fn on_request(
        &self,
        message: &ServerMessage,
        approval_type: ApprovalType,
    ) -> Result<Option<Value>, ApiError> {
        let Some(rpc_id) = message.id.clone() else {
            warn!("approval request without id: {}", message.method);
            return Ok(None);
        };
        let approval_id = rpc_id.as_key();
        let params = &message.params;
        let thread_id = str_field(params, "threadId").unwrap_or_default();
        let turn_id = str_field(params, "turnId");
        let item_id = str_field(params, "itemId");

        let row = ApprovalRow {
            approval_id: approval_id.clone(),
            thread_id: thread_id.clone(),
            turn_id: turn_id.clone(),
            item_id,
            approval_type,
            status: ApprovalStatus::Pending,
            request_payload: params.clone(),
            decision: None,
            note: None,
            created_at: now_ts(),
            resolved_at: None,
        };
        if !self.store.upsert_approval_request(&row).await? {
            return Ok(None);
        }

        self.pending.lock().await.insert(
            approval_id.clone(),
            PendingApproval {
                rpc_id,
                thread_id: thread_id.clone(),
            },
        );

        self.store
            .insert_audit_log(&NewAuditRecord {
                actor: AuditActor::Gateway,
                action: "approval.requested".to_string(),
                thread_id: Some(thread_id),
                turn_id,
                metadata: Some(json!({
                    "approvalId": approval_id,
                    "approvalType": approval_type,
                })),
            })
            .await?;

        let mut payload = params.clone();
        if let Value::Object(map) = &mut payload {
            map.insert("approvalId".to_string(), Value::String(approval_id));
            map.insert(
                "approvalType".to_string(),
                serde_json::to_value(approval_type).map_err(anyhow::Error::from)?,
            );
        }
        Ok(Some(payload))
    }

    /// Applies a user decision: exactly one worker response per approval,
    /// 400 for unknown decisions, 404 for unknown ids, 409 when already
    /// terminal.
    pub async fn decide(
        &self,
        thread_id: &str,
        approval_id: &str,
        decision: &str,
        note: Option<String>,
    ) -> Result<Value, ApiError> {
        let decision = match decision {
            "allow" => Decision::Allow,
            "deny" => Decision::Deny,
            "cancel" => Decision::Cancel,
            other => {
                return Err(ApiError::BadRequest(format!("unknown decision `{other}`")));
            }
        };

        let entry = self.pending.lock().await.get(approval_id).cloned();
        let rpc_id = match &entry {
            Some(entry) => {
                if entry.thread_id != thread_id {
                    return Err(ApiError::NotFound(format!(
                        "approval {approval_id} not found on thread {thread_id}"
                    )));
                }
                entry.rpc_id.clone()
            }
            None => {
                // Persistence-only recovery: the live map did not survive
                // the restart, but the row may still be actionable.
                let Some(row) = self.store.get_approval_by_id(approval_id).await? else {
                    return Err(ApiError::NotFound(format!("approval {approval_id} not found")));
                };
                if row.thread_id != thread_id {
                    return Err(ApiError::NotFound(format!(
                        "approval {approval_id} not found on thread {thread_id}"
                    )));
                }
                RpcId::from_key(approval_id)
            }
        };

        if !self
            .store
            .resolve_approval_request(approval_id, decision, note.as_deref())
            .await?
        {
            return Err(ApiError::Conflict(format!(
                "approval {approval_id} is no longer pending"
            )));
        }

        if let Err(err) = self
            .bridge
            .respond(&rpc_id, json!({ "decision": decision.worker_decision() }))
            .await
        {
            warn!("approval {approval_id}: failed to respond to worker: {err}");
        }

        self.store
            .insert_audit_log(&NewAuditRecord {
                actor: AuditActor::User,
                action: "approval.decided".to_string(),
                thread_id: Some(thread_id.to_string()),
                turn_id: None,
                metadata: Some(json!({
                    "approvalId": approval_id,
                    "decision": decision.as_str(),
                    "note": note,
                })),
            })
            .await?;

        self.bus
            .append(NewGatewayEvent {
                thread_id: thread_id.to_string(),
                turn_id: None,
                kind: EventKind::Approval,
                name: "approval/decision".to_string(),
                payload: json!({
                    "approvalId": approval_id,
                    "decision": decision.as_str(),
                }),
            })
            .await?;

        self.pending.lock().await.remove(approval_id);
        Ok(json!({ "ok": true }))
    }

    pub async fn list_pending(&self, thread_id: &str) -> Result<Vec<ApprovalRow>, ApiError> {
        Ok(self.store.list_pending_approvals_by_thread(thread_id).await?)
    }

    /// Turn reached a terminal state: pending approvals for it are moot.
    pub async fn cancel_for_turn(
        &self,
        thread_id: &str,
        turn_id: &str,
        reason: &str,
    ) -> Result<(), ApiError> {
        let cancelled = self
            .store
            .cancel_pending_approvals_for_turn(thread_id, turn_id)
            .await?;
        if cancelled.is_empty() {
            return Ok(());
        }

        let mut pending = self.pending.lock().await;
        for approval_id in &cancelled {
            pending.remove(approval_id);
        }
        drop(pending);

        for approval_id in cancelled {
            self.store
                .insert_audit_log(&NewAuditRecord {
                    actor: AuditActor::Gateway,
                    action: "approval.cancelled".to_string(),
                    thread_id: Some(thread_id.to_string()),
                    turn_id: Some(turn_id.to_string()),
                    metadata: Some(json!({ "approvalId": approval_id, "reason": reason })),
                })
                .await?;
            self.bus
                .append(NewGatewayEvent {
                    thread_id: thread_id.to_string(),
                    turn_id: Some(turn_id.to_string()),
                    kind: EventKind::Approval,
                    name: "approval/cancelled".to_string(),
                    payload: json!({ "approvalId": approval_id, "reason": reason }),
                })
                .await?;
        }
        Ok(())
    }

    /// Startup reconciliation: rows left pending by a prior gateway
    /// generation are unanswerable and get cancelled before any request
    /// handler runs.
    pub async fn reconcile_on_startup(&self) -> Result<usize, ApiError> {
        let cancelled = self.store.cancel_all_pending_approvals().await?;
        for approval_id in &cancelled {
            self.store
                .insert_audit_log(&NewAuditRecord {
                    actor: AuditActor::Gateway,
                    action: "approval.cancelled".to_string(),
                    thread_id: None,
                    turn_id: None,
                    metadata: Some(json!({
                        "approvalId": approval_id,
                        "reason": "gateway_restarted",
                    })),
                })
                .await?;
        }
        Ok(cancelled.len())
    }
}

pub(crate) fn str_field(value: &Value, key: &str) -> Option<String> {
    value.get(key).and_then(Value::as_str).map(|s| s.to_string())
}
