use std::{collections::VecDeque, sync::Arc};

use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, error};
use worker_rpc::{BridgeEvent, BridgeEventStream, ServerMessage};

use crate::{
    approvals::{approval_type_for_method, str_field, ApprovalCoordinator},
    bus::EventBus,
    error::ApiError,
    interactions::{is_interaction_method, InteractionCoordinator},
    store::{now_ts, EventKind, NewGatewayEvent, Store, TurnProjection},
    turns::TurnController,
};

/// Thread key used for worker messages that carry no thread id, so the
/// durable log still records every worker-initiated message.
const SYSTEM_THREAD: &str = "system";

/// Last worker stderr lines, surfaced by `/health` when degraded.
#[derive(Clone, Default)]
pub struct StderrTail {
    lines: Arc<Mutex<VecDeque<String>>>,
}

const STDERR_TAIL_CAP: usize = 100;

impl StderrTail {
    pub async fn push(&self, line: String) {
        let mut lines = self.lines.lock().await;
        if lines.len() == STDERR_TAIL_CAP {
            lines.pop_front();
        }
        lines.push_back(line);
    }

    pub async fn snapshot(&self) -> Vec<String> {
        self.lines.lock().await.iter().cloned().collect()
    }
}

/// The single registered consumer of inbound worker messages: classifies
/// them, applies approval/interaction side effects, maintains the
/// active-turn map, persists the event row, and publishes it.
pub struct WorkerDispatcher {
    pub store: Store,
    pub bus: EventBus,
    pub turns: TurnController,
    pub approvals: ApprovalCoordinator,
    pub interactions: InteractionCoordinator,
    pub stderr_tail: StderrTail,
}

impl WorkerDispatcher {
    pub fn spawn(self, mut events: BridgeEventStream) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match event {
                    BridgeEvent::Status { status, generation } => {
                        debug!(?status, generation, "worker status transition");
                    }
                    BridgeEvent::Stderr(line) => {
                        self.stderr_tail.push(line).await;
                    }
                    BridgeEvent::Message(message) => {
                        if let Err(err) = self.handle_message(&message).await {
                            error!("failed to dispatch worker message {}: {err}", message.method);
                        }
                    }
                }
            }
        })
    }

    async fn handle_message(&self, message: &ServerMessage) -> Result<(), ApiError> {
        let method = message.method.as_str();
        let thread_id = str_field(&message.params, "threadId")
            .unwrap_or_else(|| SYSTEM_THREAD.to_string());
        let turn_id = message_turn_id(&message.params);

        // Approval/interaction requests persist a pending row first; the
        // fan-out payload comes back augmented with the durable id. A
        // duplicate delivery returns None and is dropped entirely.
        let payload = if let Some(approval_type) = approval_type_for_method(method) {
            match self.approvals.on_request(message, approval_type).await? {
                Some(payload) => payload,
                None => return Ok(()),
            }
        } else if is_interaction_method(method) {
            match self.interactions.on_request(message).await? {
                Some(payload) => payload,
                None => return Ok(()),
            }
        } else {
            message.params.clone()
        };

        if method == "turn/started" {
            if let Some(turn_id) = &turn_id {
                self.turns.note_turn_started(&thread_id, turn_id).await;
                self.store
                    .upsert_turn(&TurnProjection {
                        turn_id: turn_id.clone(),
                        thread_id: thread_id.clone(),
                        status: "active".to_string(),
                        started_at: Some(now_ts()),
                        completed_at: None,
                        error_json: None,
                    })
                    .await?;
            }
        }

        // The turn event itself is appended before any cancellation
        // events so subscribers observe completion first.
        self.bus
            .append(NewGatewayEvent {
                thread_id: thread_id.clone(),
                turn_id: turn_id.clone(),
                kind: classify_method(method),
                name: method.to_string(),
                payload,
            })
            .await?;

        if let Some(reason) = turn_end_reason(method) {
            if let Some(turn_id) = &turn_id {
                self.turns.note_turn_finished(&thread_id, turn_id).await;
                self.store
                    .upsert_turn(&TurnProjection {
                        turn_id: turn_id.clone(),
                        thread_id: thread_id.clone(),
                        status: turn_end_status(method).to_string(),
                        started_at: None,
                        completed_at: Some(now_ts()),
                        error_json: message
                            .params
                            .get("error")
                            .filter(|error| !error.is_null())
                            .map(|error| error.to_string()),
                    })
                    .await?;
                self.interactions
                    .cancel_for_turn(&thread_id, turn_id, reason)
                    .await?;
                self.approvals
                    .cancel_for_turn(&thread_id, turn_id, reason)
                    .await?;
            }
        }

        Ok(())
    }
}

/// Event kind from the method prefix.
pub fn classify_method(method: &str) -> EventKind {
    if approval_type_for_method(method).is_some() {
        return EventKind::Approval;
    }
    if is_interaction_method(method) {
        return EventKind::Interaction;
    }
    if method.starts_with("thread/") {
        EventKind::Thread
    } else if method.starts_with("turn/") {
        EventKind::Turn
    } else if method.starts_with("item/") {
        EventKind::Item
    } else {
        EventKind::System
    }
}

fn turn_end_reason(method: &str) -> Option<&'static str> {
    match method {
        "turn/completed" => Some("turn_completed"),
        "turn/aborted" => Some("turn_aborted"),
        _ => None,
    }
}

fn turn_end_status(method: &str) -> &'static str {
    match method {
        "turn/aborted" => "aborted",
        _ => "completed",
    }
}

fn message_turn_id(params: &Value) -> Option<String> {
    str_field(params, "turnId").or_else(|| {
        params
            .get("turn")
            .and_then(|turn| turn.get("id"))
            .and_then(Value::as_str)
            .map(|s| s.to_string())
    })
}
