use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
    sync::Arc,
    time::SystemTime,
};

use serde::Serialize;
use serde_json::Value;
use tokio::{sync::Mutex, task};
use tracing::{debug, warn};

use crate::error::SessionLogError;

/// Where a thread's working directory was recovered from.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ContextSource {
    SessionMeta,
    TurnContext,
    Projection,
    Fallback,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedContext {
    pub thread_id: String,
    pub cwd: PathBuf,
    pub source: ContextSource,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_file: Option<PathBuf>,
}

type CacheEntry = Arc<Mutex<Option<ResolvedContext>>>;

/// Maps a thread to its working directory by indexing the worker's
/// on-disk session files.
///
/// Resolution order: the session file's leading `session_meta` record,
/// the last `turn_context` record in the file, the projected key handed
/// in by the caller, then the configured fallback directory. Results are
/// cached per thread; concurrent lookups for the same thread coalesce on
/// one file scan.
pub struct ContextResolver {
    sessions_dir: PathBuf,
    fallback_dir: PathBuf,
    cache: Mutex<HashMap<String, CacheEntry>>,
}

impl ContextResolver {
    pub fn new(sessions_dir: impl Into<PathBuf>, fallback_dir: impl Into<PathBuf>) -> Self {
        Self {
            sessions_dir: sessions_dir.into(),
            fallback_dir: fallback_dir.into(),
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Default resolver rooted at `~/.codex/sessions` with the user home
    /// as the terminal fallback.
    pub fn with_default_dirs(sessions_dir: Option<PathBuf>) -> Self {
        let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("/"));
        let sessions = sessions_dir.unwrap_or_else(|| home.join(".codex").join("sessions"));
        Self::new(sessions, home)
    }

    pub async fn resolve(&self, thread_id: &str, projected_key: Option<&str>) -> ResolvedContext {
        let entry = {
            let mut cache = self.cache.lock().await;
            cache
                .entry(thread_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(None)))
                .clone()
        };

        // Holding the entry lock across the scan coalesces concurrent
        // lookups for the same thread into a single resolve.
        let mut slot = entry.lock().await;
        if let Some(resolved) = slot.as_ref() {
            return resolved.clone();
        }

        let resolved = self.resolve_uncached(thread_id, projected_key).await;
        *slot = Some(resolved.clone());
        resolved
    }

    /// Drops the cached context so the next lookup re-reads the session
    /// file (e.g. after the user opened a new working directory).
    pub async fn invalidate(&self, thread_id: &str) {
        self.cache.lock().await.remove(thread_id);
    }

    /// Locates the thread's session file, newest first.
    pub async fn find_session_file(&self, thread_id: &str) -> Result<PathBuf, SessionLogError> {
        let sessions_dir = self.sessions_dir.clone();
        let owned = thread_id.to_string();
        let found = task::spawn_blocking(move || find_session_file_sync(&sessions_dir, &owned))
            .await
            .unwrap_or(None);
        found.ok_or_else(|| SessionLogError::NotFound(thread_id.to_string()))
    }

    async fn resolve_uncached(&self, thread_id: &str, projected_key: Option<&str>) -> ResolvedContext {
        let sessions_dir = self.sessions_dir.clone();
        let owned_thread = thread_id.to_string();
        let scan = task::spawn_blocking(move || {
            let file = find_session_file_sync(&sessions_dir, &owned_thread)?;
            let cwd = extract_cwd_sync(&file);
            Some((file, cwd))
        })
        .await
        .unwrap_or(None);

        if let Some((file, cwd)) = scan {
            if let Some((cwd, source)) = cwd {
                debug!(thread_id, ?source, "resolved context from session file");
                return ResolvedContext {
                    thread_id: thread_id.to_string(),
                    cwd,
                    source,
                    session_file: Some(file),
                };
            }
        }

        if let Some(key) = projected_key.filter(|key| *key != "unknown" && !key.is_empty()) {
            return ResolvedContext {
                thread_id: thread_id.to_string(),
                cwd: PathBuf::from(key),
                source: ContextSource::Projection,
                session_file: None,
            };
        }

        ResolvedContext {
            thread_id: thread_id.to_string(),
            cwd: self.fallback_dir.clone(),
            source: ContextSource::Fallback,
            session_file: None,
        }
    }
}

/// Recursively walks the sessions dir for `*<uuid>.jsonl` files whose
/// trailing UUID matches, returning the most recently modified one.
fn find_session_file_sync(dir: &Path, thread_id: &str) -> Option<PathBuf> {
    let mut best: Option<(SystemTime, PathBuf)> = None;
    let mut stack = vec![dir.to_path_buf()];

    while let Some(current) = stack.pop() {
        let entries = match fs::read_dir(&current) {
            Ok(entries) => entries,
            Err(err) => {
                warn!("failed to read sessions dir {}: {err}", current.display());
                continue;
            }
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                stack.push(path);
                continue;
            }
            if file_uuid(&path).is_some_and(|uuid| uuid.eq_ignore_ascii_case(thread_id)) {
                let modified = entry
                    .metadata()
                    .and_then(|meta| meta.modified())
                    .unwrap_or(SystemTime::UNIX_EPOCH);
                if best.as_ref().map_or(true, |(ts, _)| modified > *ts) {
                    best = Some((modified, path));
                }
            }
        }
    }

    best.map(|(_, path)| path)
}

/// Extracts the trailing UUID from a `*<uuid>.jsonl` filename.
fn file_uuid(path: &Path) -> Option<&str> {
    if path.extension().and_then(|ext| ext.to_str()) != Some("jsonl") {
        return None;
    }
    let stem = path.file_stem()?.to_str()?;
    if stem.len() < 36 {
        return None;
    }
    let candidate = &stem[stem.len() - 36..];
    is_uuid(candidate).then_some(candidate)
}

fn is_uuid(candidate: &str) -> bool {
    let bytes = candidate.as_bytes();
    if bytes.len() != 36 {
        return false;
    }
    candidate.char_indices().all(|(idx, ch)| match idx {
        8 | 13 | 18 | 23 => ch == '-',
        _ => ch.is_ascii_hexdigit(),
    })
}

/// First line wins as `session_meta`; otherwise the last `turn_context`
/// in the file.
fn extract_cwd_sync(path: &Path) -> Option<(PathBuf, ContextSource)> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(err) => {
            warn!("failed to read session file {}: {err}", path.display());
            return None;
        }
    };

    let mut lines = content.lines().filter(|line| !line.trim().is_empty());
    if let Some(first) = lines.next() {
        if let Some(cwd) = record_cwd(first, "session_meta") {
            return Some((cwd, ContextSource::SessionMeta));
        }
    }

    let mut last_turn_context = None;
    for line in content.lines() {
        if let Some(cwd) = record_cwd(line, "turn_context") {
            last_turn_context = Some(cwd);
        }
    }
    last_turn_context.map(|cwd| (cwd, ContextSource::TurnContext))
}

fn record_cwd(line: &str, record_type: &str) -> Option<PathBuf> {
    let value: Value = serde_json::from_str(line).ok()?;
    if value.get("type").and_then(Value::as_str) != Some(record_type) {
        return None;
    }
    value
        .get("payload")
        .and_then(|payload| payload.get("cwd"))
        .and_then(Value::as_str)
        .map(PathBuf::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const THREAD: &str = "0195c9a8-1111-2222-3333-444455556666";

    fn write_session(dir: &Path, name: &str, lines: &[Value]) -> PathBuf {
        let path = dir.join(name);
        let content: Vec<String> = lines.iter().map(|line| line.to_string()).collect();
        fs::write(&path, content.join("\n")).expect("write session");
        path
    }

    #[tokio::test]
    async fn session_meta_cwd_wins() {
        let dir = tempfile::tempdir().expect("tempdir");
        write_session(
            dir.path(),
            &format!("rollout-2026-01-01-{THREAD}.jsonl"),
            &[
                json!({"type": "session_meta", "payload": {"cwd": "/work/project"}}),
                json!({"type": "turn_context", "payload": {"cwd": "/elsewhere"}}),
            ],
        );

        let resolver = ContextResolver::new(dir.path(), "/home/user");
        let resolved = resolver.resolve(THREAD, None).await;
        assert_eq!(resolved.cwd, PathBuf::from("/work/project"));
        assert_eq!(resolved.source, ContextSource::SessionMeta);
        assert!(resolved.session_file.is_some());
    }

    #[tokio::test]
    async fn falls_back_to_last_turn_context() {
        let dir = tempfile::tempdir().expect("tempdir");
        write_session(
            dir.path(),
            &format!("{THREAD}.jsonl"),
            &[
                json!({"type": "event_msg", "payload": {"type": "task_started"}}),
                json!({"type": "turn_context", "payload": {"cwd": "/first"}}),
                json!({"type": "turn_context", "payload": {"cwd": "/second"}}),
            ],
        );

        let resolver = ContextResolver::new(dir.path(), "/home/user");
        let resolved = resolver.resolve(THREAD, None).await;
        assert_eq!(resolved.cwd, PathBuf::from("/second"));
        assert_eq!(resolved.source, ContextSource::TurnContext);
    }

    #[tokio::test]
    async fn uses_projection_then_fallback_when_no_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let resolver = ContextResolver::new(dir.path(), "/home/user");

        let projected = resolver.resolve(THREAD, Some("/projected")).await;
        assert_eq!(projected.cwd, PathBuf::from("/projected"));
        assert_eq!(projected.source, ContextSource::Projection);

        resolver.invalidate(THREAD).await;
        let fallback = resolver.resolve(THREAD, Some("unknown")).await;
        assert_eq!(fallback.cwd, PathBuf::from("/home/user"));
        assert_eq!(fallback.source, ContextSource::Fallback);
    }

    #[tokio::test]
    async fn concurrent_lookups_coalesce_and_cache() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = write_session(
            dir.path(),
            &format!("{THREAD}.jsonl"),
            &[json!({"type": "session_meta", "payload": {"cwd": "/work"}})],
        );

        let resolver = Arc::new(ContextResolver::new(dir.path(), "/home/user"));
        let (left, right) = tokio::join!(
            resolver.resolve(THREAD, None),
            resolver.resolve(THREAD, None)
        );
        assert_eq!(left, right);

        // Cached: the file can disappear without changing the answer.
        fs::remove_file(&path).expect("remove");
        let again = resolver.resolve(THREAD, None).await;
        assert_eq!(again.cwd, PathBuf::from("/work"));
    }

    #[tokio::test]
    async fn picks_most_recent_session_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let nested = dir.path().join("2026").join("01");
        fs::create_dir_all(&nested).expect("mkdirs");
        write_session(
            dir.path(),
            &format!("old-{THREAD}.jsonl"),
            &[json!({"type": "session_meta", "payload": {"cwd": "/old"}})],
        );
        // Newer file in a nested directory shadows the older one.
        std::thread::sleep(std::time::Duration::from_millis(20));
        write_session(
            &nested,
            &format!("new-{THREAD}.jsonl"),
            &[json!({"type": "session_meta", "payload": {"cwd": "/new"}})],
        );

        let resolver = ContextResolver::new(dir.path(), "/home/user");
        let resolved = resolver.resolve(THREAD, None).await;
        assert_eq!(resolved.cwd, PathBuf::from("/new"));
    }

    #[test]
    fn uuid_extraction_rejects_non_uuid_names() {
        assert!(file_uuid(Path::new("rollout-abc.jsonl")).is_none());
        assert!(file_uuid(Path::new(&format!("x-{THREAD}.txt"))).is_none());
        assert_eq!(
            file_uuid(Path::new(&format!("rollout-{THREAD}.jsonl"))),
            Some(THREAD)
        );
    }
}
