use std::{
    collections::HashMap,
    env,
    path::Path,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use portable_pty::{native_pty_system, CommandBuilder, MasterPty, PtySize};
use serde::{Deserialize, Serialize};
use tokio::{
    sync::{mpsc, Mutex},
    task,
};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Messages sent by the browser over the terminal WebSocket.
#[derive(Clone, Debug, Deserialize)]
#[serde(tag = "type")]
pub enum TerminalClientMessage {
    #[serde(rename = "terminal/open", rename_all = "camelCase")]
    Open {
        thread_id: String,
        #[serde(default)]
        cwd: Option<String>,
    },
    #[serde(rename = "terminal/input")]
    Input { data: String },
    #[serde(rename = "terminal/resize")]
    Resize { cols: u16, rows: u16 },
    #[serde(rename = "terminal/setCwd")]
    SetCwd { cwd: String },
    #[serde(rename = "terminal/close")]
    Close,
}

/// Messages sent to the browser.
#[derive(Clone, Debug, Serialize)]
#[serde(tag = "type")]
pub enum TerminalServerMessage {
    #[serde(rename = "terminal/ready", rename_all = "camelCase")]
    Ready { session_id: String, thread_id: String },
    #[serde(rename = "terminal/status", rename_all = "camelCase")]
    Status {
        connected: bool,
        cwd: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        pid: Option<u32>,
        is_fallback: bool,
        source: String,
    },
    #[serde(rename = "terminal/output")]
    Output { data: String, stream: String },
    #[serde(rename = "terminal/error")]
    Error {
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        code: Option<String>,
    },
}

#[derive(Clone, Debug)]
pub struct TerminalMuxConfig {
    pub max_sessions: usize,
    pub idle_ttl: Duration,
    pub sweep_interval: Duration,
}

impl Default for TerminalMuxConfig {
    fn default() -> Self {
        Self {
            max_sessions: 5,
            idle_ttl: Duration::from_secs(30 * 60),
            sweep_interval: Duration::from_secs(60),
        }
    }
}

const DEFAULT_COLS: u16 = 120;
const DEFAULT_ROWS: u16 = 32;

struct SessionState {
    clients: HashMap<u64, mpsc::UnboundedSender<TerminalServerMessage>>,
    cwd: String,
    is_fallback: bool,
    last_activity: Instant,
    exited: bool,
}

struct TerminalSession {
    id: String,
    thread_id: String,
    source: String,
    pid: Option<u32>,
    master: Mutex<Box<dyn MasterPty + Send>>,
    writer: Arc<std::sync::Mutex<Box<dyn std::io::Write + Send>>>,
    child: Mutex<Box<dyn portable_pty::Child + Send + Sync>>,
    state: Mutex<SessionState>,
}

impl TerminalSession {
    async fn status_message(&self, connected: bool) -> TerminalServerMessage {
        let state = self.state.lock().await;
        TerminalServerMessage::Status {
            connected,
            cwd: state.cwd.clone(),
            pid: self.pid,
            is_fallback: state.is_fallback,
            source: self.source.clone(),
        }
    }

    async fn broadcast(&self, message: TerminalServerMessage) {
        let mut state = self.state.lock().await;
        state.clients.retain(|_, tx| tx.send(message.clone()).is_ok());
    }
}

/// One PTY per thread, shared by any number of WebSocket clients, with
/// TTL eviction of idle client-less sessions and an LRU capacity bound.
#[derive(Clone)]
pub struct TerminalMux {
    config: TerminalMuxConfig,
    sessions: Arc<Mutex<HashMap<String, Arc<TerminalSession>>>>,
    next_client: Arc<AtomicU64>,
}

impl TerminalMux {
    pub fn new(config: TerminalMuxConfig) -> Self {
        Self {
            config,
            sessions: Arc::new(Mutex::new(HashMap::new())),
            next_client: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Attaches a client to the thread's session, creating the PTY on
    /// first open. Returns the client id and its message stream; `ready`
    /// and `status` have already been queued on it.
    pub async fn open(
        &self,
        thread_id: &str,
        cwd: String,
        source: String,
        is_fallback: bool,
    ) -> Result<(u64, mpsc::UnboundedReceiver<TerminalServerMessage>), String> {
        let session = {
            let mut sessions = self.sessions.lock().await;
            match sessions.get(thread_id) {
                Some(session) => session.clone(),
                None => {
                    self.evict_for_capacity(&mut sessions).await;
                    let session = self.spawn_session(thread_id, cwd, source, is_fallback)?;
                    sessions.insert(thread_id.to_string(), session.clone());
                    session
                }
            }
        };

        let client_id = self.next_client.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::unbounded_channel();
        let ready = TerminalServerMessage::Ready {
            session_id: session.id.clone(),
            thread_id: session.thread_id.clone(),
        };
        let status = session.status_message(true).await;
        let _ = tx.send(ready);
        let _ = tx.send(status);

        let mut state = session.state.lock().await;
        state.clients.insert(client_id, tx);
        state.last_activity = Instant::now();
        Ok((client_id, rx))
    }

    pub async fn detach(&self, thread_id: &str, client_id: u64) {
        let sessions = self.sessions.lock().await;
        if let Some(session) = sessions.get(thread_id) {
            let mut state = session.state.lock().await;
            state.clients.remove(&client_id);
            state.last_activity = Instant::now();
        }
    }

    pub async fn input(&self, thread_id: &str, data: String) -> Result<(), String> {
        let session = self.session(thread_id).await?;
        {
            let mut state = session.state.lock().await;
            state.last_activity = Instant::now();
        }
        write_to_pty(&session.writer, data.into_bytes()).await
    }

    /// Resize bounded to cols ∈ [2,400], rows ∈ [1,200].
    pub async fn resize(&self, thread_id: &str, cols: u16, rows: u16) -> Result<(), String> {
        let session = self.session(thread_id).await?;
        let size = PtySize {
            cols: cols.clamp(2, 400),
            rows: rows.clamp(1, 200),
            pixel_width: 0,
            pixel_height: 0,
        };
        let result = session
            .master
            .lock()
            .await
            .resize(size)
            .map_err(|err| format!("resize failed: {err}"));
        result
    }

    /// Writes a `cd` into the shell and clears the fallback flag.
    pub async fn set_cwd(&self, thread_id: &str, cwd: String) -> Result<(), String> {
        let session = self.session(thread_id).await?;
        let command = format!("cd '{}'\n", cwd.replace('\'', r"'\''"));
        write_to_pty(&session.writer, command.into_bytes()).await?;

        {
            let mut state = session.state.lock().await;
            state.cwd = cwd;
            state.is_fallback = false;
            state.last_activity = Instant::now();
        }
        let status = session.status_message(true).await;
        session.broadcast(status).await;
        Ok(())
    }

    /// Periodic sweep: kill client-less sessions idle past the TTL.
    pub fn spawn_sweeper(&self) -> tokio::task::JoinHandle<()> {
        let mux = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(mux.config.sweep_interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                mux.sweep().await;
            }
        })
    }

    pub async fn sweep(&self) {
        let expired: Vec<(String, Arc<TerminalSession>)> = {
            let sessions = self.sessions.lock().await;
            let mut expired = Vec::new();
            for (thread_id, session) in sessions.iter() {
                let state = session.state.lock().await;
                if state.clients.is_empty() && state.last_activity.elapsed() > self.config.idle_ttl
                {
                    expired.push((thread_id.clone(), session.clone()));
                }
            }
            expired
        };

        for (thread_id, session) in expired {
            info!(thread_id, "evicting idle terminal session");
            self.remove_session(&thread_id, &session).await;
        }
    }

    /// Kills every session. Used on graceful shutdown.
    pub async fn destroy_all(&self) {
        let sessions: Vec<(String, Arc<TerminalSession>)> = {
            let mut guard = self.sessions.lock().await;
            guard.drain().collect()
        };
        for (_, session) in sessions {
            kill_session(&session).await;
        }
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.lock().await.len()
    }

    async fn session(&self, thread_id: &str) -> Result<Arc<TerminalSession>, String> {
        self.sessions
            .lock()
            .await
            .get(thread_id)
            .cloned()
            .ok_or_else(|| format!("no terminal session for thread {thread_id}"))
    }

    /// Beyond capacity, evict LRU preferring sessions with no clients.
    async fn evict_for_capacity(&self, sessions: &mut HashMap<String, Arc<TerminalSession>>) {
        while sessions.len() >= self.config.max_sessions {
            let mut candidates = Vec::new();
            for (thread_id, session) in sessions.iter() {
                let state = session.state.lock().await;
                candidates.push((state.clients.is_empty(), state.last_activity, thread_id.clone()));
            }
            // Client-less first (true sorts after false on negation),
            // then oldest activity.
            candidates.sort_by_key(|(no_clients, last, _)| (!*no_clients, *last));
            let Some((_, _, thread_id)) = candidates.into_iter().next() else {
                return;
            };
            if let Some(session) = sessions.remove(&thread_id) {
                warn!(thread_id, "evicting terminal session for capacity");
                session
                    .broadcast(TerminalServerMessage::Error {
                        message: "terminal session evicted".to_string(),
                        code: Some("TERMINAL_SESSION_EVICTED".to_string()),
                    })
                    .await;
                kill_session(&session).await;
                let mut state = session.state.lock().await;
                state.exited = true;
                state.clients.clear();
            }
        }
    }

    fn spawn_session(
        &self,
        thread_id: &str,
        cwd: String,
        source: String,
        is_fallback: bool,
    ) -> Result<Arc<TerminalSession>, String> {
        let (shell, _shell_source) = select_shell();
        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(PtySize {
                cols: DEFAULT_COLS,
                rows: DEFAULT_ROWS,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|err| format!("failed to open pty: {err}"))?;

        let mut command = CommandBuilder::new(&shell);
        if Path::new(&cwd).is_dir() {
            command.cwd(&cwd);
        }
        for (key, value) in env::vars() {
            command.env(key, value);
        }
        command.env("TERM", "xterm-256color");

        let child = pair
            .slave
            .spawn_command(command)
            .map_err(|err| format!("failed to spawn shell `{shell}`: {err}"))?;
        let pid = child.process_id();
        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|err| format!("failed to clone pty reader: {err}"))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|err| format!("failed to take pty writer: {err}"))?;

        let session = Arc::new(TerminalSession {
            id: Uuid::new_v4().to_string(),
            thread_id: thread_id.to_string(),
            source,
            pid,
            master: Mutex::new(pair.master),
            writer: Arc::new(std::sync::Mutex::new(writer)),
            child: Mutex::new(child),
            state: Mutex::new(SessionState {
                clients: HashMap::new(),
                cwd,
                is_fallback,
                last_activity: Instant::now(),
                exited: false,
            }),
        });

        self.spawn_output_pump(session.clone(), reader);
        info!(thread_id, shell, "terminal session started");
        Ok(session)
    }

    /// Blocking PTY reads feed an async fan-out; the pump ending means
    /// the shell exited.
    fn spawn_output_pump(&self, session: Arc<TerminalSession>, reader: Box<dyn std::io::Read + Send>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();
        task::spawn_blocking(move || {
            let mut reader = reader;
            let mut buf = [0u8; 8192];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if tx.send(buf[..n].to_vec()).is_err() {
                            break;
                        }
                    }
                }
            }
        });

        let mux = self.clone();
        tokio::spawn(async move {
            while let Some(chunk) = rx.recv().await {
                let data = String::from_utf8_lossy(&chunk).to_string();
                session
                    .broadcast(TerminalServerMessage::Output {
                        data,
                        stream: "stdout".to_string(),
                    })
                    .await;
            }
            mux.on_child_exit(&session).await;
        });
    }

    async fn on_child_exit(&self, session: &Arc<TerminalSession>) {
        let already_removed = {
            let mut sessions = self.sessions.lock().await;
            match sessions.get(&session.thread_id) {
                Some(current) if Arc::ptr_eq(current, session) => {
                    sessions.remove(&session.thread_id);
                    false
                }
                _ => true,
            }
        };
        if already_removed {
            return;
        }

        debug!(thread_id = session.thread_id, "terminal shell exited");
        session
            .broadcast(TerminalServerMessage::Error {
                message: "terminal process exited".to_string(),
                code: Some("TERMINAL_PROCESS_EXITED".to_string()),
            })
            .await;
        let status = session.status_message(false).await;
        session.broadcast(status).await;

        let mut state = session.state.lock().await;
        state.exited = true;
        state.clients.clear();
    }

    async fn remove_session(&self, thread_id: &str, session: &Arc<TerminalSession>) {
        {
            let mut sessions = self.sessions.lock().await;
            if let Some(current) = sessions.get(thread_id) {
                if Arc::ptr_eq(current, session) {
                    sessions.remove(thread_id);
                }
            }
        }
        kill_session(session).await;
    }
}

async fn kill_session(session: &Arc<TerminalSession>) {
    let mut child = session.child.lock().await;
    if let Err(err) = child.kill() {
        debug!("terminal kill failed (already dead?): {err}");
    }
}

async fn write_to_pty(
    writer: &Arc<std::sync::Mutex<Box<dyn std::io::Write + Send>>>,
    bytes: Vec<u8>,
) -> Result<(), String> {
    let writer = writer.clone();
    task::spawn_blocking(move || {
        let mut guard = writer.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        guard.write_all(&bytes)?;
        guard.flush()
    })
    .await
    .map_err(|err| format!("pty write task failed: {err}"))?
    .map_err(|err| format!("pty write failed: {err}"))
}

/// `$SHELL` when it exists as a file, then the platform default.
fn select_shell() -> (String, &'static str) {
    if let Ok(shell) = env::var("SHELL") {
        if Path::new(&shell).is_file() {
            return (shell, "env");
        }
    }
    if cfg!(target_os = "macos") && Path::new("/bin/zsh").is_file() {
        return ("/bin/zsh".to_string(), "default");
    }
    if Path::new("/bin/bash").is_file() {
        return ("/bin/bash".to_string(), "default");
    }
    ("/bin/sh".to_string(), "default")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_messages_deserialize_from_wire_shapes() {
        let open: TerminalClientMessage = serde_json::from_str(
            r#"{"type":"terminal/open","threadId":"T","cwd":"/work"}"#,
        )
        .unwrap();
        assert!(matches!(open, TerminalClientMessage::Open { thread_id, cwd }
            if thread_id == "T" && cwd.as_deref() == Some("/work")));

        let resize: TerminalClientMessage =
            serde_json::from_str(r#"{"type":"terminal/resize","cols":80,"rows":24}"#).unwrap();
        assert!(matches!(resize, TerminalClientMessage::Resize { cols: 80, rows: 24 }));

        assert!(serde_json::from_str::<TerminalClientMessage>(r#"{"type":"terminal/close"}"#).is_ok());
    }

    #[test]
    fn server_messages_serialize_with_type_tags() {
        let ready = TerminalServerMessage::Ready {
            session_id: "s".to_string(),
            thread_id: "T".to_string(),
        };
        let value = serde_json::to_value(&ready).unwrap();
        assert_eq!(value["type"], "terminal/ready");
        assert_eq!(value["sessionId"], "s");

        let output = TerminalServerMessage::Output {
            data: "hi".to_string(),
            stream: "stdout".to_string(),
        };
        let value = serde_json::to_value(&output).unwrap();
        assert_eq!(value["type"], "terminal/output");
        assert_eq!(value["stream"], "stdout");
    }

    #[test]
    fn cd_escaping_survives_single_quotes() {
        let cwd = "/tmp/it's here";
        let escaped = format!("cd '{}'\n", cwd.replace('\'', r"'\''"));
        assert_eq!(escaped, "cd '/tmp/it'\\''s here'\n");
    }

    #[tokio::test]
    async fn open_attach_input_and_detach() {
        let mux = TerminalMux::new(TerminalMuxConfig::default());
        let (client, mut rx) = mux
            .open("T", "/tmp".to_string(), "fallback".to_string(), true)
            .await
            .expect("open");

        let first = rx.recv().await.expect("ready");
        assert!(matches!(first, TerminalServerMessage::Ready { .. }));
        let second = rx.recv().await.expect("status");
        match second {
            TerminalServerMessage::Status { connected, is_fallback, .. } => {
                assert!(connected);
                assert!(is_fallback);
            }
            other => panic!("unexpected message: {other:?}"),
        }

        mux.input("T", "echo terminal-check\n".to_string())
            .await
            .expect("input");
        let mut saw_output = false;
        for _ in 0..50 {
            match tokio::time::timeout(Duration::from_millis(200), rx.recv()).await {
                Ok(Some(TerminalServerMessage::Output { data, .. })) => {
                    if data.contains("terminal-check") {
                        saw_output = true;
                        break;
                    }
                }
                Ok(Some(_)) => {}
                _ => break,
            }
        }
        assert!(saw_output, "expected echoed output from the pty");

        // Second client shares the same session.
        let (client2, _rx2) = mux
            .open("T", "/tmp".to_string(), "fallback".to_string(), true)
            .await
            .expect("open 2");
        assert_eq!(mux.session_count().await, 1);

        mux.detach("T", client).await;
        mux.detach("T", client2).await;
        assert_eq!(mux.session_count().await, 1);
        mux.destroy_all().await;
        assert_eq!(mux.session_count().await, 0);
    }

    #[tokio::test]
    async fn capacity_evicts_lru_preferring_clientless() {
        let mut config = TerminalMuxConfig::default();
        config.max_sessions = 2;
        let mux = TerminalMux::new(config);

        let (c1, _rx1) = mux
            .open("A", "/tmp".to_string(), "fallback".to_string(), true)
            .await
            .expect("open A");
        let (_c2, _rx2) = mux
            .open("B", "/tmp".to_string(), "fallback".to_string(), true)
            .await
            .expect("open B");
        // A loses its client; it becomes the preferred eviction victim.
        mux.detach("A", c1).await;

        let (_c3, _rx3) = mux
            .open("C", "/tmp".to_string(), "fallback".to_string(), true)
            .await
            .expect("open C");
        let sessions = mux.sessions.lock().await;
        assert!(!sessions.contains_key("A"));
        assert!(sessions.contains_key("B"));
        assert!(sessions.contains_key("C"));
        drop(sessions);
        mux.destroy_all().await;
    }
}
