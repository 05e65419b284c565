use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Thread status as projected from the worker.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ThreadStatus {
    NotLoaded,
    Idle,
    Active,
    SystemError,
    Unknown,
}

impl ThreadStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ThreadStatus::NotLoaded => "notLoaded",
            ThreadStatus::Idle => "idle",
            ThreadStatus::Active => "active",
            ThreadStatus::SystemError => "systemError",
            ThreadStatus::Unknown => "unknown",
        }
    }

    pub fn parse(raw: &str) -> Self {
        match raw {
            "notLoaded" => ThreadStatus::NotLoaded,
            "idle" => ThreadStatus::Idle,
            "active" => ThreadStatus::Active,
            "systemError" => ThreadStatus::SystemError,
            _ => ThreadStatus::Unknown,
        }
    }
}

/// Gateway-local denormalized copy of a worker thread.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThreadProjection {
    pub thread_id: String,
    /// Normalized absolute path, or the literal `"unknown"`.
    pub project_key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preview: Option<String>,
    pub status: ThreadStatus,
    pub archived: bool,
    pub updated_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnProjection {
    pub turn_id: String,
    pub thread_id: String,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_json: Option<String>,
}

/// Classification of a durable event by its originating method.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EventKind {
    Thread,
    Turn,
    Item,
    Approval,
    Interaction,
    System,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::Thread => "thread",
            EventKind::Turn => "turn",
            EventKind::Item => "item",
            EventKind::Approval => "approval",
            EventKind::Interaction => "interaction",
            EventKind::System => "system",
        }
    }

    pub fn parse(raw: &str) -> Self {
        match raw {
            "thread" => EventKind::Thread,
            "turn" => EventKind::Turn,
            "item" => EventKind::Item,
            "approval" => EventKind::Approval,
            "interaction" => EventKind::Interaction,
            _ => EventKind::System,
        }
    }
}

/// Event about to be appended to the log; `seq` is assigned by the store.
#[derive(Clone, Debug)]
pub struct NewGatewayEvent {
    pub thread_id: String,
    pub turn_id: Option<String>,
    pub kind: EventKind,
    pub name: String,
    pub payload: Value,
}

/// Durable, replayable gateway event. `seq` is the global replay cursor.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayEvent {
    pub seq: i64,
    pub thread_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub turn_id: Option<String>,
    pub kind: EventKind,
    pub name: String,
    pub payload: Value,
    pub server_ts: String,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ApprovalType {
    CommandExecution,
    FileChange,
    UserInput,
}

impl ApprovalType {
    pub fn as_str(self) -> &'static str {
        match self {
            ApprovalType::CommandExecution => "commandExecution",
            ApprovalType::FileChange => "fileChange",
            ApprovalType::UserInput => "userInput",
        }
    }

    pub fn parse(raw: &str) -> Self {
        match raw {
            "fileChange" => ApprovalType::FileChange,
            "userInput" => ApprovalType::UserInput,
            _ => ApprovalType::CommandExecution,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Denied,
    Cancelled,
}

impl ApprovalStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ApprovalStatus::Pending => "pending",
            ApprovalStatus::Approved => "approved",
            ApprovalStatus::Denied => "denied",
            ApprovalStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(raw: &str) -> Self {
        match raw {
            "approved" => ApprovalStatus::Approved,
            "denied" => ApprovalStatus::Denied,
            "cancelled" => ApprovalStatus::Cancelled,
            _ => ApprovalStatus::Pending,
        }
    }
}

/// User decision on an approval, as posted by the UI.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Decision {
    Allow,
    Deny,
    Cancel,
}

impl Decision {
    pub fn as_str(self) -> &'static str {
        match self {
            Decision::Allow => "allow",
            Decision::Deny => "deny",
            Decision::Cancel => "cancel",
        }
    }

    /// Wire value expected by the worker's `respond`.
    pub fn worker_decision(self) -> &'static str {
        match self {
            Decision::Allow => "accept",
            Decision::Deny => "decline",
            Decision::Cancel => "cancel",
        }
    }

    pub fn terminal_status(self) -> ApprovalStatus {
        match self {
            Decision::Allow => ApprovalStatus::Approved,
            Decision::Deny => ApprovalStatus::Denied,
            Decision::Cancel => ApprovalStatus::Cancelled,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalRow {
    pub approval_id: String,
    pub thread_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub turn_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub item_id: Option<String>,
    #[serde(rename = "type")]
    pub approval_type: ApprovalType,
    pub status: ApprovalStatus,
    pub request_payload: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub decision: Option<Decision>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    pub created_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<String>,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum InteractionStatus {
    Pending,
    Responded,
    Cancelled,
}

impl InteractionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            InteractionStatus::Pending => "pending",
            InteractionStatus::Responded => "responded",
            InteractionStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(raw: &str) -> Self {
        match raw {
            "responded" => InteractionStatus::Responded,
            "cancelled" => InteractionStatus::Cancelled,
            _ => InteractionStatus::Pending,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InteractionRow {
    pub interaction_id: String,
    pub thread_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub turn_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub item_id: Option<String>,
    #[serde(rename = "type")]
    pub interaction_type: String,
    pub status: InteractionStatus,
    pub request_payload: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_payload: Option<Value>,
    pub created_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<String>,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum AuditActor {
    Gateway,
    User,
}

impl AuditActor {
    pub fn as_str(self) -> &'static str {
        match self {
            AuditActor::Gateway => "gateway",
            AuditActor::User => "user",
        }
    }
}

#[derive(Clone, Debug)]
pub struct NewAuditRecord {
    pub actor: AuditActor,
    pub action: String,
    pub thread_id: Option<String>,
    pub turn_id: Option<String>,
    pub metadata: Option<Value>,
}
