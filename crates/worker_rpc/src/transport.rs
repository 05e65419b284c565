use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicI64, Ordering},
        Arc,
    },
    time::Duration,
};

use serde_json::Value;
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    process::{Child, ChildStderr, ChildStdin, ChildStdout, Command},
    sync::{mpsc, oneshot, Mutex},
    task::JoinHandle,
    time,
};
use tracing::{debug, warn};

use crate::{
    bridge::StatusCell,
    error::BridgeError,
    protocol::{BridgeEvent, BridgeStatus, RpcId, ServerMessage, WorkerConfig},
};

pub(crate) type EventSinks = Arc<Mutex<Vec<mpsc::UnboundedSender<BridgeEvent>>>>;

type PendingRequests = Arc<Mutex<HashMap<RpcId, oneshot::Sender<Result<Value, BridgeError>>>>>;

/// One spawned worker process and its stdio pump tasks. A new transport
/// is built on every (re)connect; the sink list is shared across
/// transports so subscribers survive reconnection.
pub(crate) struct Transport {
    writer: mpsc::UnboundedSender<String>,
    pending: PendingRequests,
    next_id: AtomicI64,
    tasks: Vec<JoinHandle<()>>,
    child: Arc<Mutex<Option<Child>>>,
    request_timeout: Duration,
}

impl Transport {
    pub(crate) async fn spawn(
        config: &WorkerConfig,
        sinks: EventSinks,
        status: StatusCell,
        generation: u64,
    ) -> Result<Self, BridgeError> {
        let mut command = Command::new(&config.binary);
        command
            .args(&config.args)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);

        if let Some(dir) = &config.current_dir {
            command.current_dir(dir);
        }
        for (key, value) in &config.env {
            command.env(key, value);
        }

        let command_debug = format!("{command:?}");
        let mut child = command.spawn().map_err(|source| BridgeError::Spawn {
            command: command_debug,
            source,
        })?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| BridgeError::Transport("child stdout unavailable".into()))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| BridgeError::Transport("child stdin unavailable".into()))?;
        let stderr = child.stderr.take();

        let pending = Arc::new(Mutex::new(HashMap::new()));
        let (writer_tx, writer_rx) = mpsc::unbounded_channel();

        let writer_handle = tokio::spawn(writer_task(stdin, writer_rx));
        let reader_handle = tokio::spawn(reader_task(
            stdout,
            pending.clone(),
            sinks.clone(),
            status,
            generation,
        ));

        let mut tasks = vec![writer_handle, reader_handle];
        if let Some(stderr) = stderr {
            tasks.push(tokio::spawn(stderr_task(stderr, sinks)));
        }

        Ok(Self {
            writer: writer_tx,
            pending,
            next_id: AtomicI64::new(1),
            tasks,
            child: Arc::new(Mutex::new(Some(child))),
            request_timeout: config.request_timeout,
        })
    }

    pub(crate) async fn pid(&self) -> Option<u32> {
        self.child.lock().await.as_ref().and_then(|child| child.id())
    }

    /// Correlated request/response with the configured timeout. The
    /// pending slot is freed on timeout so a late response is dropped.
    pub(crate) async fn request(&self, method: &str, params: Value) -> Result<Value, BridgeError> {
        self.request_with_timeout(method, params, self.request_timeout)
            .await
    }

    pub(crate) async fn request_with_timeout(
        &self,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<Value, BridgeError> {
        let id = RpcId::Int(self.next_id.fetch_add(1, Ordering::SeqCst));
        let message = encode_message(Some(&id), Some(method), &params, None)?;
        let (tx, rx) = oneshot::channel();

        {
            let mut guard = self.pending.lock().await;
            guard.insert(id.clone(), tx);
        }

        if self.writer.send(message).is_err() {
            self.pending.lock().await.remove(&id);
            return Err(BridgeError::ChannelClosed);
        }

        match time::timeout(timeout, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(BridgeError::ChannelClosed),
            Err(_) => {
                self.pending.lock().await.remove(&id);
                Err(BridgeError::Timeout(timeout))
            }
        }
    }

    /// Fire-and-forget notification.
    pub(crate) fn notify(&self, method: &str, params: Value) -> Result<(), BridgeError> {
        let message = encode_message(None, Some(method), &params, None)?;
        self.writer
            .send(message)
            .map_err(|_| BridgeError::ChannelClosed)
    }

    /// Reply to a server-initiated request.
    pub(crate) fn respond(&self, id: &RpcId, result: Value) -> Result<(), BridgeError> {
        let message = encode_message(Some(id), None, &Value::Null, Some(&result))?;
        self.writer
            .send(message)
            .map_err(|_| BridgeError::ChannelClosed)
    }

    pub(crate) async fn kill(&self) {
        if let Some(mut child) = self.child.lock().await.take() {
            let _ = child.start_kill();
        }
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        for handle in &self.tasks {
            handle.abort();
        }

        if let Ok(mut guard) = self.child.try_lock() {
            if let Some(mut child) = guard.take() {
                let _ = child.start_kill();
            }
        }
    }
}

fn encode_message(
    id: Option<&RpcId>,
    method: Option<&str>,
    params: &Value,
    result: Option<&Value>,
) -> Result<String, BridgeError> {
    let mut object = serde_json::Map::new();
    if let Some(id) = id {
        object.insert("id".to_string(), serde_json::to_value(id)?);
    }
    if let Some(method) = method {
        object.insert("method".to_string(), Value::String(method.to_string()));
        if !params.is_null() {
            object.insert("params".to_string(), params.clone());
        }
    }
    if let Some(result) = result {
        object.insert("result".to_string(), result.clone());
    }
    Ok(serde_json::to_string(&Value::Object(object))?)
}

async fn writer_task(mut stdin: ChildStdin, mut rx: mpsc::UnboundedReceiver<String>) {
    while let Some(message) = rx.recv().await {
        if stdin.write_all(message.as_bytes()).await.is_err() {
            break;
        }
        if stdin.write_all(b"\n").await.is_err() {
            break;
        }
        let _ = stdin.flush().await;
    }

    let _ = stdin.shutdown().await;
}

async fn reader_task(
    stdout: ChildStdout,
    pending: PendingRequests,
    sinks: EventSinks,
    status: StatusCell,
    generation: u64,
) {
    let mut lines = BufReader::new(stdout).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if line.trim().is_empty() {
            continue;
        }

        // Lines that fail to parse are dropped without touching in-flight work.
        let value: Value = match serde_json::from_str(&line) {
            Ok(value) => value,
            Err(err) => {
                warn!("failed to parse worker stdout as JSON: {err}");
                continue;
            }
        };

        if value.get("method").is_some() {
            match serde_json::from_value::<ServerMessage>(value) {
                Ok(message) => broadcast(&sinks, BridgeEvent::Message(message)).await,
                Err(err) => warn!("malformed worker message: {err}"),
            }
            continue;
        }

        if value.get("id").is_some() {
            handle_response(value, &pending).await;
            continue;
        }

        debug!("ignoring worker line without id or method");
    }

    // Stream ended: the child exited or closed stdout. Every in-flight
    // request is rejected so callers fail fast instead of timing out.
    let drained: Vec<_> = {
        let mut guard = pending.lock().await;
        guard.drain().collect()
    };
    for (_, tx) in drained {
        let _ = tx.send(Err(BridgeError::ChannelClosed));
    }

    status.mark_disconnected(generation, "worker process exited");
    broadcast(
        &sinks,
        BridgeEvent::Status {
            status: BridgeStatus::Disconnected,
            generation,
        },
    )
    .await;
}

async fn stderr_task(stderr: ChildStderr, sinks: EventSinks) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        debug!("worker stderr: {line}");
        broadcast(&sinks, BridgeEvent::Stderr(line)).await;
    }
}

async fn handle_response(value: Value, pending: &PendingRequests) {
    let Some(id) = value
        .get("id")
        .and_then(|raw| serde_json::from_value::<RpcId>(raw.clone()).ok())
    else {
        warn!("received response with unusable id");
        return;
    };

    let sender = { pending.lock().await.remove(&id) };
    let Some(tx) = sender else {
        // Response for a timed-out or unknown request.
        return;
    };

    if let Some(error) = value.get("error") {
        let message = error
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("worker error without message")
            .to_string();
        let _ = tx.send(Err(BridgeError::Rpc {
            code: error.get("code").and_then(Value::as_i64),
            message,
            data: error.get("data").cloned(),
        }));
    } else {
        let result = value.get("result").cloned().unwrap_or(Value::Null);
        let _ = tx.send(Ok(result));
    }
}

pub(crate) async fn broadcast(sinks: &EventSinks, event: BridgeEvent) {
    let mut guard = sinks.lock().await;
    guard.retain(|tx| tx.send(event.clone()).is_ok());
}
