use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use serde::Serialize;
use serde_json::Value;
use tokio::sync::{mpsc, Mutex};
use tracing::{info, warn};

use crate::{
    error::BridgeError,
    protocol::{
        BridgeEvent, BridgeEventStream, BridgeStatus, InitializeParams, RpcId, WorkerConfig,
        METHOD_INITIALIZE, METHOD_INITIALIZED,
    },
    transport::{broadcast, EventSinks, Transport},
};

/// Snapshot of the bridge's connection state.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BridgeStatusReport {
    pub status: BridgeStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub generation: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
}

#[derive(Debug)]
struct StatusState {
    status: BridgeStatus,
    error_message: Option<String>,
    generation: u64,
}

/// Shared connection-state cell. Written by `start()` and by the reader
/// task when the child exits; generation-guarded so a stale transport's
/// exit never clobbers a newer connection.
#[derive(Clone, Debug)]
pub(crate) struct StatusCell(Arc<std::sync::Mutex<StatusState>>);

impl StatusCell {
    fn new() -> Self {
        Self(Arc::new(std::sync::Mutex::new(StatusState {
            status: BridgeStatus::Disconnected,
            error_message: None,
            generation: 0,
        })))
    }

    fn set(&self, status: BridgeStatus, error_message: Option<String>, generation: u64) {
        let mut guard = self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        guard.status = status;
        guard.error_message = error_message;
        guard.generation = generation;
    }

    pub(crate) fn mark_disconnected(&self, generation: u64, reason: &str) {
        let mut guard = self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if guard.generation != generation {
            return;
        }
        guard.status = BridgeStatus::Disconnected;
        guard.error_message = Some(reason.to_string());
    }

    fn snapshot(&self) -> (BridgeStatus, Option<String>, u64) {
        let guard = self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        (guard.status, guard.error_message.clone(), guard.generation)
    }
}

/// Bridge to the worker child process: one subprocess speaking
/// newline-delimited JSON, correlated request/response, and fan-out of
/// everything the worker initiates.
pub struct WorkerBridge {
    config: WorkerConfig,
    sinks: EventSinks,
    status: StatusCell,
    transport: Mutex<Option<Arc<Transport>>>,
    generation: AtomicU64,
}

impl WorkerBridge {
    pub fn new(config: WorkerConfig) -> Self {
        Self {
            config,
            sinks: Arc::new(Mutex::new(Vec::new())),
            status: StatusCell::new(),
            transport: Mutex::new(None),
            generation: AtomicU64::new(0),
        }
    }

    /// Spawn the worker and run the handshake. On success the bridge is
    /// `Initialized` and the generation counter has advanced; on failure
    /// it is `Disconnected` with the error recorded.
    pub async fn start(&self) -> Result<(), BridgeError> {
        let mut slot = self.transport.lock().await;
        if let Some(old) = slot.take() {
            old.kill().await;
        }

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let transport = match Transport::spawn(
            &self.config,
            self.sinks.clone(),
            self.status.clone(),
            generation,
        )
        .await
        {
            Ok(transport) => Arc::new(transport),
            Err(err) => {
                self.status
                    .set(BridgeStatus::Disconnected, Some(err.to_string()), generation);
                return Err(err);
            }
        };

        self.status.set(BridgeStatus::Connected, None, generation);
        self.emit_status(BridgeStatus::Connected, generation).await;

        let params = InitializeParams {
            client_info: self.config.client_info.clone(),
        };
        let handshake = transport
            .request_with_timeout(
                METHOD_INITIALIZE,
                serde_json::to_value(&params)?,
                self.config.startup_timeout,
            )
            .await;

        if let Err(err) = handshake {
            warn!("worker initialize failed: {err}");
            transport.kill().await;
            self.status
                .set(BridgeStatus::Disconnected, Some(err.to_string()), generation);
            self.emit_status(BridgeStatus::Disconnected, generation).await;
            return Err(BridgeError::Handshake(err.to_string()));
        }

        transport.notify(METHOD_INITIALIZED, Value::Object(Default::default()))?;

        info!(generation, "worker bridge initialized");
        self.status.set(BridgeStatus::Initialized, None, generation);
        self.emit_status(BridgeStatus::Initialized, generation).await;
        *slot = Some(transport);
        Ok(())
    }

    /// Correlated request with the 30s default timeout. Fails fast with
    /// `NotReady` when the bridge is not initialized.
    pub async fn request(&self, method: &str, params: Value) -> Result<Value, BridgeError> {
        let transport = self.ready_transport().await?;
        transport.request(method, params).await
    }

    /// Fire-and-forget notification.
    pub async fn notify(&self, method: &str, params: Value) -> Result<(), BridgeError> {
        let transport = self.ready_transport().await?;
        transport.notify(method, params)
    }

    /// Reply to a server-initiated request.
    pub async fn respond(&self, id: &RpcId, result: Value) -> Result<(), BridgeError> {
        let transport = self.ready_transport().await?;
        transport.respond(id, result)
    }

    /// Register a subscriber for status/stderr/message events. The
    /// subscription survives worker restarts.
    pub async fn subscribe(&self) -> BridgeEventStream {
        let (tx, rx) = mpsc::unbounded_channel();
        self.sinks.lock().await.push(tx);
        rx
    }

    pub async fn status(&self) -> BridgeStatusReport {
        let (status, error_message, generation) = self.status.snapshot();
        let pid = match &*self.transport.lock().await {
            Some(transport) if status != BridgeStatus::Disconnected => transport.pid().await,
            _ => None,
        };
        BridgeStatusReport {
            status,
            error_message,
            generation,
            pid,
        }
    }

    /// Generation of the current worker process. Bumped by every
    /// successful `start()`; pending-approval maps are valid only while
    /// their captured generation matches.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    pub async fn shutdown(&self) {
        let mut slot = self.transport.lock().await;
        if let Some(transport) = slot.take() {
            transport.kill().await;
        }
        let generation = self.generation();
        self.status
            .set(BridgeStatus::Disconnected, None, generation);
        self.emit_status(BridgeStatus::Disconnected, generation).await;
    }

    async fn ready_transport(&self) -> Result<Arc<Transport>, BridgeError> {
        let (status, _, _) = self.status.snapshot();
        if status != BridgeStatus::Initialized {
            return Err(BridgeError::NotReady);
        }
        self.transport
            .lock()
            .await
            .clone()
            .ok_or(BridgeError::NotReady)
    }

    async fn emit_status(&self, status: BridgeStatus, generation: u64) {
        broadcast(&self.sinks, BridgeEvent::Status { status, generation }).await;
    }
}

impl std::fmt::Debug for WorkerBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerBridge")
            .field("binary", &self.config.binary)
            .field("generation", &self.generation())
            .finish_non_exhaustive()
    }
}
