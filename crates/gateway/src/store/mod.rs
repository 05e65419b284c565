mod types;

pub use types::*;

use std::{path::Path, sync::Arc};

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::info;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to open database at `{path}`: {source}")]
    Open {
        path: String,
        #[source]
        source: rusqlite::Error,
    },
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

struct Migration {
    name: &'static str,
    sql: &'static str,
}

const MIGRATIONS: &[Migration] = &[
    Migration {
        name: "000_migration_table",
        sql: "CREATE TABLE IF NOT EXISTS migrations (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                applied_at TEXT NOT NULL
              );",
    },
    Migration {
        name: "001_threads_turns",
        sql: "CREATE TABLE threads (
                thread_id TEXT PRIMARY KEY,
                project_key TEXT NOT NULL DEFAULT 'unknown',
                title TEXT,
                preview TEXT,
                status TEXT NOT NULL DEFAULT 'unknown',
                archived INTEGER NOT NULL DEFAULT 0,
                updated_at TEXT NOT NULL,
                last_error TEXT
              );
              CREATE TABLE turns (
                turn_id TEXT PRIMARY KEY,
                thread_id TEXT NOT NULL,
                status TEXT NOT NULL,
                started_at TEXT,
                completed_at TEXT,
                error_json TEXT
              );
              CREATE INDEX idx_turns_thread ON turns(thread_id);",
    },
    Migration {
        name: "002_events_log",
        sql: "CREATE TABLE events_log (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                thread_id TEXT NOT NULL,
                turn_id TEXT,
                kind TEXT NOT NULL,
                name TEXT NOT NULL,
                payload_json TEXT NOT NULL,
                server_ts TEXT NOT NULL
              );
              CREATE INDEX idx_events_thread_seq ON events_log(thread_id, seq);",
    },
    Migration {
        name: "003_approvals_interactions",
        sql: "CREATE TABLE approvals (
                approval_id TEXT PRIMARY KEY,
                thread_id TEXT NOT NULL,
                turn_id TEXT,
                item_id TEXT,
                approval_type TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                request_payload_json TEXT NOT NULL,
                decision TEXT,
                note TEXT,
                created_at TEXT NOT NULL,
                resolved_at TEXT
              );
              CREATE INDEX idx_approvals_thread_status ON approvals(thread_id, status);
              CREATE TABLE interactions (
                interaction_id TEXT PRIMARY KEY,
                thread_id TEXT NOT NULL,
                turn_id TEXT,
                item_id TEXT,
                interaction_type TEXT NOT NULL DEFAULT 'userInput',
                status TEXT NOT NULL DEFAULT 'pending',
                request_payload_json TEXT NOT NULL,
                response_payload_json TEXT,
                created_at TEXT NOT NULL,
                resolved_at TEXT
              );
              CREATE INDEX idx_interactions_thread_status ON interactions(thread_id, status);",
    },
    Migration {
        name: "004_audit_log",
        sql: "CREATE TABLE audit_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                ts TEXT NOT NULL,
                actor TEXT NOT NULL,
                action TEXT NOT NULL,
                thread_id TEXT,
                turn_id TEXT,
                metadata_json TEXT
              );",
    },
];

pub fn now_ts() -> String {
    Utc::now().to_rfc3339()
}

/// Durable projection store: threads, turns, event log, approvals,
/// interactions, audit. WAL mode; one writer behind an async mutex.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    /// Opens (creating if needed) the database at `path` and applies
    /// pending migrations inside one transaction.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path).map_err(|source| StoreError::Open {
            path: path.display().to_string(),
            source,
        })?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        Self::finish_open(conn)
    }

    /// In-memory store for tests.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::finish_open(Connection::open_in_memory()?)
    }

    fn finish_open(mut conn: Connection) -> Result<Self, StoreError> {
        migrate(&mut conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    // ---- threads ----

    pub async fn upsert_threads(&self, rows: &[ThreadProjection]) -> Result<(), StoreError> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO threads
                   (thread_id, project_key, title, preview, status, archived, updated_at, last_error)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                 ON CONFLICT(thread_id) DO UPDATE SET
                   project_key = CASE
                     WHEN excluded.project_key <> 'unknown' THEN excluded.project_key
                     ELSE threads.project_key
                   END,
                   title = excluded.title,
                   preview = excluded.preview,
                   status = excluded.status,
                   archived = excluded.archived,
                   updated_at = excluded.updated_at,
                   last_error = excluded.last_error",
            )?;
            for row in rows {
                stmt.execute(params![
                    row.thread_id,
                    row.project_key,
                    row.title,
                    row.preview,
                    row.status.as_str(),
                    row.archived,
                    row.updated_at,
                    row.last_error,
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Single-field update; no-op when unchanged. A known key is never
    /// overwritten with `"unknown"`.
    pub async fn update_thread_project_key(
        &self,
        thread_id: &str,
        project_key: &str,
    ) -> Result<bool, StoreError> {
        let conn = self.conn.lock().await;
        let changed = conn.execute(
            "UPDATE threads SET project_key = ?2
             WHERE thread_id = ?1
               AND project_key <> ?2
               AND (?2 <> 'unknown' OR project_key = 'unknown')",
            params![thread_id, project_key],
        )?;
        Ok(changed > 0)
    }

    pub async fn get_thread(&self, thread_id: &str) -> Result<Option<ThreadProjection>, StoreError> {
        let conn = self.conn.lock().await;
        let row = conn
            .query_row(
                "SELECT thread_id, project_key, title, preview, status, archived, updated_at, last_error
                 FROM threads WHERE thread_id = ?1",
                params![thread_id],
                thread_from_row,
            )
            .optional()?;
        Ok(row)
    }

    pub async fn list_projected_threads(
        &self,
        limit: usize,
    ) -> Result<Vec<ThreadProjection>, StoreError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT thread_id, project_key, title, preview, status, archived, updated_at, last_error
             FROM threads ORDER BY updated_at DESC LIMIT ?1",
        )?;
        let rows = stmt
            .query_map(params![limit as i64], thread_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    // ---- turns ----

    pub async fn upsert_turn(&self, turn: &TurnProjection) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO turns (turn_id, thread_id, status, started_at, completed_at, error_json)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(turn_id) DO UPDATE SET
               status = excluded.status,
               started_at = COALESCE(turns.started_at, excluded.started_at),
               completed_at = excluded.completed_at,
               error_json = excluded.error_json",
            params![
                turn.turn_id,
                turn.thread_id,
                turn.status,
                turn.started_at,
                turn.completed_at,
                turn.error_json,
            ],
        )?;
        Ok(())
    }

    // ---- event log ----

    /// Appends one event and returns its autoincrement `seq`. Safe to
    /// call concurrently; uniqueness and monotonicity come from SQLite.
    pub async fn insert_gateway_event(
        &self,
        event: &NewGatewayEvent,
    ) -> Result<GatewayEvent, StoreError> {
        let server_ts = now_ts();
        let payload_json = serde_json::to_string(&event.payload)?;
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO events_log (thread_id, turn_id, kind, name, payload_json, server_ts)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                event.thread_id,
                event.turn_id,
                event.kind.as_str(),
                event.name,
                payload_json,
                server_ts,
            ],
        )?;
        let seq = conn.last_insert_rowid();
        Ok(GatewayEvent {
            seq,
            thread_id: event.thread_id.clone(),
            turn_id: event.turn_id.clone(),
            kind: event.kind,
            name: event.name.clone(),
            payload: event.payload.clone(),
            server_ts,
        })
    }

    /// Replay window for a subscriber joining at `since_seq`.
    pub async fn list_gateway_events_since(
        &self,
        thread_id: &str,
        since_seq: i64,
        limit: usize,
    ) -> Result<Vec<GatewayEvent>, StoreError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT seq, thread_id, turn_id, kind, name, payload_json, server_ts
             FROM events_log WHERE thread_id = ?1 AND seq > ?2
             ORDER BY seq ASC LIMIT ?3",
        )?;
        let rows = stmt
            .query_map(params![thread_id, since_seq, limit as i64], |row| {
                Ok(GatewayEvent {
                    seq: row.get(0)?,
                    thread_id: row.get(1)?,
                    turn_id: row.get(2)?,
                    kind: EventKind::parse(&row.get::<_, String>(3)?),
                    name: row.get(4)?,
                    payload: parse_json_column(row.get::<_, String>(5)?),
                    server_ts: row.get(6)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    // ---- approvals ----

    /// Persists a pending approval. Returns false when the id already
    /// exists (duplicate delivery).
    pub async fn upsert_approval_request(&self, row: &ApprovalRow) -> Result<bool, StoreError> {
        let payload_json = serde_json::to_string(&row.request_payload)?;
        let conn = self.conn.lock().await;
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO approvals
               (approval_id, thread_id, turn_id, item_id, approval_type, status,
                request_payload_json, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                row.approval_id,
                row.thread_id,
                row.turn_id,
                row.item_id,
                row.approval_type.as_str(),
                row.status.as_str(),
                payload_json,
                row.created_at,
            ],
        )?;
        Ok(inserted > 0)
    }

    /// Writes a terminal status iff the row is still pending. Returns
    /// false ("not pending") otherwise, making decisions idempotent.
    pub async fn resolve_approval_request(
        &self,
        approval_id: &str,
        decision: Decision,
        note: Option<&str>,
    ) -> Result<bool, StoreError> {
        let conn = self.conn.lock().await;
        let changed = conn.execute(
            "UPDATE approvals
             SET status = ?2, decision = ?3, note = ?4, resolved_at = ?5
             WHERE approval_id = ?1 AND status = 'pending'",
            params![
                approval_id,
                decision.terminal_status().as_str(),
                decision.as_str(),
                note,
                now_ts(),
            ],
        )?;
        Ok(changed > 0)
    }

    pub async fn get_approval_by_id(
        &self,
        approval_id: &str,
    ) -> Result<Option<ApprovalRow>, StoreError> {
        let conn = self.conn.lock().await;
        let row = conn
            .query_row(
                &format!("{APPROVAL_SELECT} WHERE approval_id = ?1"),
                params![approval_id],
                approval_from_row,
            )
            .optional()?;
        Ok(row)
    }

    pub async fn list_pending_approvals_by_thread(
        &self,
        thread_id: &str,
    ) -> Result<Vec<ApprovalRow>, StoreError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(&format!(
            "{APPROVAL_SELECT} WHERE thread_id = ?1 AND status = 'pending' ORDER BY created_at ASC"
        ))?;
        let rows = stmt
            .query_map(params![thread_id], approval_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Cancels every pending approval, returning the affected ids.
    /// Runs at gateway startup to reconcile a prior generation.
    pub async fn cancel_all_pending_approvals(&self) -> Result<Vec<String>, StoreError> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        let ids = collect_ids(
            &tx,
            "SELECT approval_id FROM approvals WHERE status = 'pending'",
        )?;
        tx.execute(
            "UPDATE approvals SET status = 'cancelled', resolved_at = ?1 WHERE status = 'pending'",
            params![now_ts()],
        )?;
        tx.commit()?;
        Ok(ids)
    }

    pub async fn cancel_pending_approvals_for_turn(
        &self,
        thread_id: &str,
        turn_id: &str,
    ) -> Result<Vec<String>, StoreError> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        let ids = {
            let mut stmt = tx.prepare(
                "SELECT approval_id FROM approvals
                 WHERE thread_id = ?1 AND turn_id = ?2 AND status = 'pending'",
            )?;
            let rows = stmt
                .query_map(params![thread_id, turn_id], |row| row.get::<_, String>(0))?
                .collect::<Result<Vec<_>, _>>()?;
            rows
        };
        tx.execute(
            "UPDATE approvals SET status = 'cancelled', resolved_at = ?3
             WHERE thread_id = ?1 AND turn_id = ?2 AND status = 'pending'",
            params![thread_id, turn_id, now_ts()],
        )?;
        tx.commit()?;
        Ok(ids)
    }

    // ---- interactions ----

    pub async fn upsert_interaction_request(
        &self,
        row: &InteractionRow,
    ) -> Result<bool, StoreError> {
        let payload_json = serde_json::to_string(&row.request_payload)?;
        let conn = self.conn.lock().await;
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO interactions
               (interaction_id, thread_id, turn_id, item_id, interaction_type, status,
                request_payload_json, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                row.interaction_id,
                row.thread_id,
                row.turn_id,
                row.item_id,
                row.interaction_type,
                row.status.as_str(),
                payload_json,
                row.created_at,
            ],
        )?;
        Ok(inserted > 0)
    }

    pub async fn respond_interaction_request(
        &self,
        interaction_id: &str,
        response_payload: &Value,
    ) -> Result<bool, StoreError> {
        let response_json = serde_json::to_string(response_payload)?;
        let conn = self.conn.lock().await;
        let changed = conn.execute(
            "UPDATE interactions
             SET status = 'responded', response_payload_json = ?2, resolved_at = ?3
             WHERE interaction_id = ?1 AND status = 'pending'",
            params![interaction_id, response_json, now_ts()],
        )?;
        Ok(changed > 0)
    }

    pub async fn cancel_interaction_request(
        &self,
        interaction_id: &str,
    ) -> Result<bool, StoreError> {
        let conn = self.conn.lock().await;
        let changed = conn.execute(
            "UPDATE interactions SET status = 'cancelled', resolved_at = ?2
             WHERE interaction_id = ?1 AND status = 'pending'",
            params![interaction_id, now_ts()],
        )?;
        Ok(changed > 0)
    }

    pub async fn get_interaction_by_id(
        &self,
        interaction_id: &str,
    ) -> Result<Option<InteractionRow>, StoreError> {
        let conn = self.conn.lock().await;
        let row = conn
            .query_row(
                &format!("{INTERACTION_SELECT} WHERE interaction_id = ?1"),
                params![interaction_id],
                interaction_from_row,
            )
            .optional()?;
        Ok(row)
    }

    pub async fn list_pending_interactions_by_thread(
        &self,
        thread_id: &str,
    ) -> Result<Vec<InteractionRow>, StoreError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(&format!(
            "{INTERACTION_SELECT} WHERE thread_id = ?1 AND status = 'pending' ORDER BY created_at ASC"
        ))?;
        let rows = stmt
            .query_map(params![thread_id], interaction_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub async fn cancel_pending_interactions_for_turn(
        &self,
        thread_id: &str,
        turn_id: &str,
    ) -> Result<Vec<String>, StoreError> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        let ids = {
            let mut stmt = tx.prepare(
                "SELECT interaction_id FROM interactions
                 WHERE thread_id = ?1 AND turn_id = ?2 AND status = 'pending'",
            )?;
            let rows = stmt
                .query_map(params![thread_id, turn_id], |row| row.get::<_, String>(0))?
                .collect::<Result<Vec<_>, _>>()?;
            rows
        };
        tx.execute(
            "UPDATE interactions SET status = 'cancelled', resolved_at = ?3
             WHERE thread_id = ?1 AND turn_id = ?2 AND status = 'pending'",
            params![thread_id, turn_id, now_ts()],
        )?;
        tx.commit()?;
        Ok(ids)
    }

    pub async fn cancel_all_pending_interactions(&self) -> Result<Vec<String>, StoreError> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        let ids = collect_ids(
            &tx,
            "SELECT interaction_id FROM interactions WHERE status = 'pending'",
        )?;
        tx.execute(
            "UPDATE interactions SET status = 'cancelled', resolved_at = ?1 WHERE status = 'pending'",
            params![now_ts()],
        )?;
        tx.commit()?;
        Ok(ids)
    }

    // ---- audit ----

    pub async fn insert_audit_log(&self, record: &NewAuditRecord) -> Result<(), StoreError> {
        let metadata_json = record
            .metadata
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO audit_log (ts, actor, action, thread_id, turn_id, metadata_json)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                now_ts(),
                record.actor.as_str(),
                record.action,
                record.thread_id,
                record.turn_id,
                metadata_json,
            ],
        )?;
        Ok(())
    }
}

const APPROVAL_SELECT: &str = "SELECT approval_id, thread_id, turn_id, item_id, approval_type, \
                               status, request_payload_json, decision, note, created_at, resolved_at \
                               FROM approvals";

const INTERACTION_SELECT: &str = "SELECT interaction_id, thread_id, turn_id, item_id, \
                                  interaction_type, status, request_payload_json, \
                                  response_payload_json, created_at, resolved_at FROM interactions";

fn migrate(conn: &mut Connection) -> Result<(), StoreError> {
    let tx = conn.transaction()?;
    tx.execute_batch(MIGRATIONS[0].sql)?;

    let applied: i64 = tx.query_row("SELECT COUNT(*) FROM migrations", [], |row| row.get(0))?;
    for migration in MIGRATIONS.iter().skip(applied as usize) {
        tx.execute_batch(migration.sql)?;
        tx.execute(
            "INSERT INTO migrations (name, applied_at) VALUES (?1, ?2)",
            params![migration.name, now_ts()],
        )?;
        info!("applied store migration {}", migration.name);
    }
    tx.commit()?;
    Ok(())
}

fn collect_ids(tx: &rusqlite::Transaction<'_>, sql: &str) -> Result<Vec<String>, StoreError> {
    let mut stmt = tx.prepare(sql)?;
    let ids = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(ids)
}

fn parse_json_column(raw: String) -> Value {
    serde_json::from_str(&raw).unwrap_or(Value::Null)
}

fn thread_from_row(row: &Row<'_>) -> rusqlite::Result<ThreadProjection> {
    Ok(ThreadProjection {
        thread_id: row.get(0)?,
        project_key: row.get(1)?,
        title: row.get(2)?,
        preview: row.get(3)?,
        status: ThreadStatus::parse(&row.get::<_, String>(4)?),
        archived: row.get(5)?,
        updated_at: row.get(6)?,
        last_error: row.get(7)?,
    })
}

fn approval_from_row(row: &Row<'_>) -> rusqlite::Result<ApprovalRow> {
    let decision: Option<String> = row.get(7)?;
    Ok(ApprovalRow {
        approval_id: row.get(0)?,
        thread_id: row.get(1)?,
        turn_id: row.get(2)?,
        item_id: row.get(3)?,
        approval_type: ApprovalType::parse(&row.get::<_, String>(4)?),
        status: ApprovalStatus::parse(&row.get::<_, String>(5)?),
        request_payload: parse_json_column(row.get::<_, String>(6)?),
        decision: decision.as_deref().map(|raw| match raw {
            "deny" => Decision::Deny,
            "cancel" => Decision::Cancel,
            _ => Decision::Allow,
        }),
        note: row.get(8)?,
        created_at: row.get(9)?,
        resolved_at: row.get(10)?,
    })
}

fn interaction_from_row(row: &Row<'_>) -> rusqlite::Result<InteractionRow> {
    let response: Option<String> = row.get(7)?;
    Ok(InteractionRow {
        interaction_id: row.get(0)?,
        thread_id: row.get(1)?,
        turn_id: row.get(2)?,
        item_id: row.get(3)?,
        interaction_type: row.get(4)?,
        status: InteractionStatus::parse(&row.get::<_, String>(5)?),
        request_payload: parse_json_column(row.get::<_, String>(6)?),
        response_payload: response.map(parse_json_column),
        created_at: row.get(8)?,
        resolved_at: row.get(9)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn thread(id: &str, project_key: &str) -> ThreadProjection {
        ThreadProjection {
            thread_id: id.to_string(),
            project_key: project_key.to_string(),
            title: Some("title".to_string()),
            preview: None,
            status: ThreadStatus::Idle,
            archived: false,
            updated_at: now_ts(),
            last_error: None,
        }
    }

    fn pending_approval(id: &str) -> ApprovalRow {
        ApprovalRow {
            approval_id: id.to_string(),
            thread_id: "T".to_string(),
            turn_id: Some("U".to_string()),
            item_id: None,
            approval_type: ApprovalType::CommandExecution,
            status: ApprovalStatus::Pending,
            request_payload: json!({"command": "npm test"}),
            decision: None,
            note: None,
            created_at: now_ts(),
            resolved_at: None,
        }
    }

    fn pending_interaction(id: &str) -> InteractionRow {
        InteractionRow {
            interaction_id: id.to_string(),
            thread_id: "T".to_string(),
            turn_id: Some("U".to_string()),
            item_id: None,
            interaction_type: "userInput".to_string(),
            status: InteractionStatus::Pending,
            request_payload: json!({"questions": []}),
            response_payload: None,
            created_at: now_ts(),
            resolved_at: None,
        }
    }

    #[tokio::test]
    async fn event_seq_is_strictly_increasing() {
        let store = Store::open_in_memory().unwrap();
        let mut last = 0;
        for n in 0..5 {
            let event = store
                .insert_gateway_event(&NewGatewayEvent {
                    thread_id: "T".to_string(),
                    turn_id: None,
                    kind: EventKind::Turn,
                    name: format!("turn/{n}"),
                    payload: json!({"n": n}),
                })
                .await
                .unwrap();
            assert!(event.seq > last);
            last = event.seq;
        }

        let replay = store.list_gateway_events_since("T", 0, 1000).await.unwrap();
        assert_eq!(replay.len(), 5);
        for pair in replay.windows(2) {
            assert_eq!(pair[1].seq, pair[0].seq + 1);
        }
    }

    #[tokio::test]
    async fn replay_window_respects_cursor_and_thread() {
        let store = Store::open_in_memory().unwrap();
        for thread in ["A", "B", "A"] {
            store
                .insert_gateway_event(&NewGatewayEvent {
                    thread_id: thread.to_string(),
                    turn_id: None,
                    kind: EventKind::System,
                    name: "x".to_string(),
                    payload: Value::Null,
                })
                .await
                .unwrap();
        }
        let events = store.list_gateway_events_since("A", 1, 1000).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].seq, 3);
    }

    #[tokio::test]
    async fn approval_terminal_write_guards_on_pending() {
        let store = Store::open_in_memory().unwrap();
        assert!(store
            .upsert_approval_request(&pending_approval("99"))
            .await
            .unwrap());
        // Duplicate delivery is ignored.
        assert!(!store
            .upsert_approval_request(&pending_approval("99"))
            .await
            .unwrap());

        assert!(store
            .resolve_approval_request("99", Decision::Allow, None)
            .await
            .unwrap());
        // Second terminal write reports "not pending".
        assert!(!store
            .resolve_approval_request("99", Decision::Deny, None)
            .await
            .unwrap());

        let row = store.get_approval_by_id("99").await.unwrap().unwrap();
        assert_eq!(row.status, ApprovalStatus::Approved);
        assert_eq!(row.decision, Some(Decision::Allow));
        assert!(row.resolved_at.is_some());
    }

    #[tokio::test]
    async fn project_key_moves_monotonically_away_from_unknown() {
        let store = Store::open_in_memory().unwrap();
        store.upsert_threads(&[thread("T", "unknown")]).await.unwrap();

        assert!(store
            .update_thread_project_key("T", "/work/app")
            .await
            .unwrap());
        // Known keys never revert to unknown.
        assert!(!store
            .update_thread_project_key("T", "unknown")
            .await
            .unwrap());
        let row = store.get_thread("T").await.unwrap().unwrap();
        assert_eq!(row.project_key, "/work/app");

        // Upserting a refreshed projection with unknown keeps the key.
        store.upsert_threads(&[thread("T", "unknown")]).await.unwrap();
        let row = store.get_thread("T").await.unwrap().unwrap();
        assert_eq!(row.project_key, "/work/app");
    }

    #[tokio::test]
    async fn interaction_response_and_cancel_paths() {
        let store = Store::open_in_memory().unwrap();
        store
            .upsert_interaction_request(&pending_interaction("199"))
            .await
            .unwrap();

        assert!(store
            .respond_interaction_request("199", &json!({"q1": {"answers": ["Staging"]}}))
            .await
            .unwrap());
        assert!(!store
            .respond_interaction_request("199", &json!({}))
            .await
            .unwrap());

        store
            .upsert_interaction_request(&pending_interaction("200"))
            .await
            .unwrap();
        let cancelled = store
            .cancel_pending_interactions_for_turn("T", "U")
            .await
            .unwrap();
        assert_eq!(cancelled, vec!["200".to_string()]);
        assert!(store
            .list_pending_interactions_by_thread("T")
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn startup_reconciliation_cancels_all_pending() {
        let store = Store::open_in_memory().unwrap();
        store
            .upsert_approval_request(&pending_approval("1"))
            .await
            .unwrap();
        store
            .upsert_interaction_request(&pending_interaction("2"))
            .await
            .unwrap();

        assert_eq!(
            store.cancel_all_pending_approvals().await.unwrap(),
            vec!["1".to_string()]
        );
        assert_eq!(
            store.cancel_all_pending_interactions().await.unwrap(),
            vec!["2".to_string()]
        );
    }

    #[tokio::test]
    async fn threads_list_orders_by_updated_at_desc() {
        let store = Store::open_in_memory().unwrap();
        let mut older = thread("old", "/a");
        older.updated_at = "2026-01-01T00:00:00Z".to_string();
        let mut newer = thread("new", "/b");
        newer.updated_at = "2026-02-01T00:00:00Z".to_string();
        store.upsert_threads(&[older, newer]).await.unwrap();

        let rows = store.list_projected_threads(10).await.unwrap();
        assert_eq!(rows[0].thread_id, "new");
        assert_eq!(rows[1].thread_id, "old");
    }
}
