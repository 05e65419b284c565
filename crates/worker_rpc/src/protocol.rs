use std::{ffi::OsString, fmt, path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

/// Handshake request sent right after spawn.
pub const METHOD_INITIALIZE: &str = "initialize";
/// Handshake notification sent once `initialize` succeeds.
pub const METHOD_INITIALIZED: &str = "initialized";

/// List available models (paginated).
pub const METHOD_MODEL_LIST: &str = "model/list";
/// Read account rate-limit snapshot.
pub const METHOD_RATE_LIMITS_READ: &str = "account/rateLimits/read";
/// List known threads (paginated).
pub const METHOD_THREAD_LIST: &str = "thread/list";
/// Start a fresh thread.
pub const METHOD_THREAD_START: &str = "thread/start";
/// Fork an existing thread.
pub const METHOD_THREAD_FORK: &str = "thread/fork";
/// Read a thread with optional turn history.
pub const METHOD_THREAD_READ: &str = "thread/read";
/// Load a thread into the worker after a restart.
pub const METHOD_THREAD_RESUME: &str = "thread/resume";
/// Start a turn on a loaded thread.
pub const METHOD_TURN_START: &str = "turn/start";
/// Interrupt the active turn.
pub const METHOD_TURN_INTERRUPT: &str = "turn/interrupt";
/// Kick off a review pass.
pub const METHOD_REVIEW_START: &str = "review/start";
/// List collaboration-mode presets (optional on older workers).
pub const METHOD_COLLABORATION_MODE_LIST: &str = "collaborationMode/list";
/// List enabled skills.
pub const METHOD_SKILLS_LIST: &str = "skills/list";
/// List installed apps (paginated).
pub const METHOD_APP_LIST: &str = "app/list";

/// JSON-RPC id as it appears on the wire. The worker answers our integer
/// ids but is free to pick string ids for its own server-initiated
/// requests, so the pending map keys on the full (type, value) pair.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RpcId {
    Int(i64),
    Str(String),
}

impl RpcId {
    /// Canonical string form used as the durable approval/interaction id.
    pub fn as_key(&self) -> String {
        match self {
            RpcId::Int(n) => n.to_string(),
            RpcId::Str(s) => s.clone(),
        }
    }

    /// Recover an id from its persisted string form. Numeric strings map
    /// back to integer ids, matching what the worker originally sent.
    pub fn from_key(key: &str) -> Self {
        match key.parse::<i64>() {
            Ok(n) => RpcId::Int(n),
            Err(_) => RpcId::Str(key.to_string()),
        }
    }
}

impl fmt::Display for RpcId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RpcId::Int(n) => write!(f, "{n}"),
            RpcId::Str(s) => write!(f, "{s}"),
        }
    }
}

/// Connection state of the bridge.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum BridgeStatus {
    Disconnected,
    Connected,
    Initialized,
}

/// Inbound object that carries a `method` field: either a notification
/// (`id` absent) or a server-initiated request expecting a `respond`.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ServerMessage {
    pub id: Option<RpcId>,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

/// Everything the bridge fans out to subscribers.
#[derive(Clone, Debug)]
pub enum BridgeEvent {
    /// Connection state transition, with the generation it belongs to.
    Status {
        status: BridgeStatus,
        generation: u64,
    },
    /// One line from the worker's stderr.
    Stderr(String),
    /// Inbound notification or server-initiated request.
    Message(ServerMessage),
}

/// Stream of bridge events handed to a subscriber.
pub type BridgeEventStream = mpsc::UnboundedReceiver<BridgeEvent>;

/// Client metadata attached to the `initialize` request.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ClientInfo {
    pub name: String,
    pub version: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InitializeParams {
    #[serde(rename = "clientInfo")]
    pub client_info: ClientInfo,
}

/// Launch configuration for the worker subprocess.
#[derive(Clone, Debug)]
pub struct WorkerConfig {
    pub binary: PathBuf,
    pub args: Vec<OsString>,
    pub current_dir: Option<PathBuf>,
    pub env: Vec<(OsString, OsString)>,
    pub client_info: ClientInfo,
    /// Timeout for the `initialize` round trip.
    pub startup_timeout: Duration,
    /// Timeout applied to every other request.
    pub request_timeout: Duration,
}

impl WorkerConfig {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            args: Vec::new(),
            current_dir: None,
            env: Vec::new(),
            client_info: ClientInfo {
                name: "agent-gateway".to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
            },
            startup_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
        }
    }
}
