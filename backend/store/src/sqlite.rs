use std::path::Path;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use tokio::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

use agora_core::{
    BlackboardEntry, CallKind, CallStatus, CrossAgentCall, DistillationRecord, InteractionSignal,
    NewMessage, Note, Session, SessionSeed, SessionStatus, SessionStore, StoredMessage, StoredRole,
    WorkingState,
};

use crate::schema::SCHEMA;

const SESSION_COLS: &str = "id, agent_id, session_key, status, token_count_estimate, message_count, \
     last_input_tokens, distillation_count, turn_count, parent_session_id, thread_id, \
     working_state, created_at, updated_at";

const MESSAGE_COLS: &str = "id, session_id, seq, role, content, tool_call_id, tool_name, is_error, \
     token_estimate, is_distilled, created_at";

const CALL_COLS: &str = "id, source_agent_id, source_session_id, target_agent_id, target_session_id, \
     kind, content, response, status, created_at, completed_at";

/// SQLite-backed session store.
///
/// One connection behind an async mutex: every method is a short critical
/// section, and multi-row updates run inside a transaction.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Create or open a database at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create {:?}", parent))?;
            }
        }
        let conn = Connection::open(path.as_ref()).context("Failed to open session database")?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
        conn.execute_batch(SCHEMA)
            .context("Failed to initialize session schema")?;
        info!("Session store opened at {:?}", path.as_ref());
        Ok(Self { conn: Mutex::new(conn) })
    }

    /// Open an in-memory database (for tests).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory SQLite")?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn: Mutex::new(conn) })
    }
}

// ---------------------------------------------------------------------------
// Row mapping
// ---------------------------------------------------------------------------

fn ts(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|d| d.with_timezone(&Utc))
        .unwrap_or_default()
}

fn invalid(col: usize, name: &str) -> rusqlite::Error {
    rusqlite::Error::InvalidColumnType(col, name.to_string(), rusqlite::types::Type::Text)
}

fn row_to_session(row: &Row<'_>) -> rusqlite::Result<Session> {
    let status: String = row.get(3)?;
    let working_state: Option<String> = row.get(11)?;
    let created_at: String = row.get(12)?;
    let updated_at: String = row.get(13)?;
    Ok(Session {
        id: row.get(0)?,
        agent_id: row.get(1)?,
        session_key: row.get(2)?,
        status: SessionStatus::parse(&status),
        token_count_estimate: row.get::<_, i64>(4)?.max(0) as u64,
        message_count: row.get::<_, i64>(5)?.max(0) as u64,
        last_input_tokens: row.get::<_, i64>(6)?.max(0) as u64,
        distillation_count: row.get::<_, i64>(7)?.max(0) as u32,
        turn_count: row.get::<_, i64>(8)?.max(0) as u64,
        parent_session_id: row.get(9)?,
        thread_id: row.get(10)?,
        working_state: working_state.and_then(|s| serde_json::from_str::<WorkingState>(&s).ok()),
        created_at: parse_ts(&created_at),
        updated_at: parse_ts(&updated_at),
    })
}

fn row_to_message(row: &Row<'_>) -> rusqlite::Result<StoredMessage> {
    let role: String = row.get(3)?;
    let created_at: String = row.get(10)?;
    Ok(StoredMessage {
        id: row.get(0)?,
        session_id: row.get(1)?,
        seq: row.get(2)?,
        role: StoredRole::parse(&role).ok_or_else(|| invalid(3, "role"))?,
        content: row.get(4)?,
        tool_call_id: row.get(5)?,
        tool_name: row.get(6)?,
        is_error: row.get(7)?,
        token_estimate: row.get::<_, i64>(8)?.max(0) as u64,
        is_distilled: row.get(9)?,
        created_at: parse_ts(&created_at),
    })
}

fn row_to_call(row: &Row<'_>) -> rusqlite::Result<CrossAgentCall> {
    let kind: String = row.get(5)?;
    let status: String = row.get(8)?;
    let created_at: String = row.get(9)?;
    let completed_at: Option<String> = row.get(10)?;
    Ok(CrossAgentCall {
        id: row.get(0)?,
        source_agent_id: row.get(1)?,
        source_session_id: row.get(2)?,
        target_agent_id: row.get(3)?,
        target_session_id: row.get(4)?,
        kind: CallKind::parse(&kind).ok_or_else(|| invalid(5, "kind"))?,
        content: row.get(6)?,
        response: row.get(7)?,
        status: CallStatus::parse(&status).ok_or_else(|| invalid(8, "status"))?,
        created_at: parse_ts(&created_at),
        completed_at: completed_at.as_deref().map(parse_ts),
    })
}

fn row_to_blackboard(row: &Row<'_>) -> rusqlite::Result<BlackboardEntry> {
    let created_at: String = row.get(3)?;
    let expires_at: Option<String> = row.get(4)?;
    Ok(BlackboardEntry {
        key: row.get(0)?,
        value: row.get(1)?,
        author_agent_id: row.get(2)?,
        created_at: parse_ts(&created_at),
        expires_at: expires_at.as_deref().map(parse_ts),
    })
}

fn load_session(conn: &Connection, session_id: &str) -> rusqlite::Result<Option<Session>> {
    conn.query_row(
        &format!("SELECT {} FROM sessions WHERE id = ?1", SESSION_COLS),
        params![session_id],
        row_to_session,
    )
    .optional()
}

// ---------------------------------------------------------------------------
// SessionStore
// ---------------------------------------------------------------------------

#[async_trait]
impl SessionStore for SqliteStore {
    async fn open_session(&self, agent_id: &str, session_key: &str, seed: SessionSeed) -> Result<Session> {
        let conn = self.conn.lock().await;
        let existing = conn
            .query_row(
                &format!(
                    "SELECT {} FROM sessions
                     WHERE agent_id = ?1 AND session_key = ?2 AND status != 'archived'",
                    SESSION_COLS
                ),
                params![agent_id, session_key],
                row_to_session,
            )
            .optional()?;
        if let Some(session) = existing {
            return Ok(session);
        }

        let id = Uuid::new_v4().to_string();
        let now = ts(&Utc::now());
        conn.execute(
            "INSERT INTO sessions (id, agent_id, session_key, status, parent_session_id, thread_id, created_at, updated_at)
             VALUES (?1, ?2, ?3, 'active', ?4, ?5, ?6, ?6)",
            params![id, agent_id, session_key, seed.parent_session_id, seed.thread_id, now],
        )?;
        debug!(agent_id, session_key, session_id = %id, "Session created");
        load_session(&conn, &id)?.ok_or_else(|| anyhow!("session {} vanished after insert", id))
    }

    async fn get_session(&self, session_id: &str) -> Result<Option<Session>> {
        let conn = self.conn.lock().await;
        Ok(load_session(&conn, session_id)?)
    }

    async fn append_message(&self, session_id: &str, message: NewMessage) -> Result<StoredMessage> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        let seq: i64 = tx.query_row(
            "SELECT COALESCE(MAX(seq), 0) + 1 FROM messages WHERE session_id = ?1",
            params![session_id],
            |r| r.get(0),
        )?;
        let now = Utc::now();
        tx.execute(
            "INSERT INTO messages (session_id, seq, role, content, tool_call_id, tool_name, is_error, token_estimate, is_distilled, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 0, ?9)",
            params![
                session_id,
                seq,
                message.role.as_str(),
                message.content,
                message.tool_call_id,
                message.tool_name,
                message.is_error,
                message.token_estimate as i64,
                ts(&now),
            ],
        )?;
        let id = tx.last_insert_rowid();
        let updated = tx.execute(
            "UPDATE sessions
             SET message_count = message_count + 1,
                 token_count_estimate = token_count_estimate + ?2,
                 updated_at = ?3
             WHERE id = ?1",
            params![session_id, message.token_estimate as i64, ts(&now)],
        )?;
        if updated == 0 {
            return Err(anyhow!("unknown session: {}", session_id));
        }
        tx.commit()?;

        Ok(StoredMessage {
            id,
            session_id: session_id.to_string(),
            seq,
            role: message.role,
            content: message.content,
            tool_call_id: message.tool_call_id,
            tool_name: message.tool_name,
            is_error: message.is_error,
            token_estimate: message.token_estimate,
            is_distilled: false,
            created_at: now,
        })
    }

    async fn messages(&self, session_id: &str, include_distilled: bool) -> Result<Vec<StoredMessage>> {
        let conn = self.conn.lock().await;
        let filter = if include_distilled { "" } else { "AND is_distilled = 0" };
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM messages WHERE session_id = ?1 {} ORDER BY seq ASC, id ASC",
            MESSAGE_COLS, filter
        ))?;
        let rows = stmt
            .query_map(params![session_id], row_to_message)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    async fn record_turn(&self, session_id: &str, last_input_tokens: u64) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE sessions
             SET last_input_tokens = ?2, turn_count = turn_count + 1, updated_at = ?3
             WHERE id = ?1",
            params![session_id, last_input_tokens as i64, ts(&Utc::now())],
        )?;
        Ok(())
    }

    async fn apply_distillation(
        &self,
        session_id: &str,
        message_ids: &[i64],
        summary: NewMessage,
        record: &DistillationRecord,
    ) -> Result<Session> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;

        let mut last_seq: Option<i64> = None;
        for id in message_ids {
            let seq: Option<i64> = tx
                .query_row(
                    "SELECT seq FROM messages WHERE id = ?1 AND session_id = ?2 AND is_distilled = 0",
                    params![id, session_id],
                    |r| r.get(0),
                )
                .optional()?;
            let Some(seq) = seq else {
                return Err(anyhow!(
                    "message {} is not an undistilled message of session {}",
                    id,
                    session_id
                ));
            };
            last_seq = Some(last_seq.map_or(seq, |s: i64| s.max(seq)));
            tx.execute("UPDATE messages SET is_distilled = 1 WHERE id = ?1", params![id])?;
        }
        let summary_seq = last_seq.ok_or_else(|| anyhow!("no messages to distill"))?;

        // The summary takes the seq of the last distilled message, so it sorts
        // ahead of the preserved tail.
        let now = ts(&Utc::now());
        tx.execute(
            "INSERT INTO messages (session_id, seq, role, content, tool_call_id, tool_name, is_error, token_estimate, is_distilled, created_at)
             VALUES (?1, ?2, ?3, ?4, NULL, NULL, 0, ?5, 0, ?6)",
            params![
                session_id,
                summary_seq,
                summary.role.as_str(),
                summary.content,
                summary.token_estimate as i64,
                now,
            ],
        )?;
        tx.execute(
            "UPDATE sessions SET
                message_count = (SELECT COUNT(*) FROM messages WHERE session_id = ?1 AND is_distilled = 0),
                token_count_estimate = (SELECT COALESCE(SUM(token_estimate), 0) FROM messages WHERE session_id = ?1 AND is_distilled = 0),
                last_input_tokens = 0,
                distillation_count = distillation_count + 1,
                updated_at = ?2
             WHERE id = ?1",
            params![session_id, now],
        )?;
        tx.execute(
            "INSERT INTO distillations (session_id, messages_before, messages_after, tokens_before, tokens_after, facts_extracted, model, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                record.session_id,
                record.messages_before as i64,
                record.messages_after as i64,
                record.tokens_before as i64,
                record.tokens_after as i64,
                record.facts_extracted as i64,
                record.model,
                ts(&record.created_at),
            ],
        )?;
        let session = load_session(&tx, session_id)?
            .ok_or_else(|| anyhow!("unknown session: {}", session_id))?;
        tx.commit()?;

        info!(
            session_id,
            distilled = message_ids.len(),
            remaining = session.message_count,
            "Distillation applied"
        );
        Ok(session)
    }

    async fn distillations(&self, session_id: &str) -> Result<Vec<DistillationRecord>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT session_id, messages_before, messages_after, tokens_before, tokens_after, facts_extracted, model, created_at
             FROM distillations WHERE session_id = ?1 ORDER BY id ASC",
        )?;
        let rows = stmt
            .query_map(params![session_id], |row| {
                let created_at: String = row.get(7)?;
                Ok(DistillationRecord {
                    session_id: row.get(0)?,
                    messages_before: row.get::<_, i64>(1)?.max(0) as u64,
                    messages_after: row.get::<_, i64>(2)?.max(0) as u64,
                    tokens_before: row.get::<_, i64>(3)?.max(0) as u64,
                    tokens_after: row.get::<_, i64>(4)?.max(0) as u64,
                    facts_extracted: row.get::<_, i64>(5)?.max(0) as u64,
                    model: row.get(6)?,
                    created_at: parse_ts(&created_at),
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    async fn set_working_state(&self, session_id: &str, state: &WorkingState) -> Result<()> {
        let json = serde_json::to_string(state)?;
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE sessions SET working_state = ?2, updated_at = ?3 WHERE id = ?1",
            params![session_id, json, ts(&Utc::now())],
        )?;
        Ok(())
    }

    async fn set_status(&self, session_id: &str, status: SessionStatus) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE sessions SET status = ?2, updated_at = ?3 WHERE id = ?1",
            params![session_id, status.as_str(), ts(&Utc::now())],
        )?;
        Ok(())
    }

    async fn add_note(&self, session_id: &str, agent_id: &str, content: &str) -> Result<Note> {
        let conn = self.conn.lock().await;
        let now = Utc::now();
        conn.execute(
            "INSERT INTO notes (session_id, agent_id, content, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![session_id, agent_id, content, ts(&now)],
        )?;
        Ok(Note {
            id: conn.last_insert_rowid(),
            session_id: session_id.to_string(),
            agent_id: agent_id.to_string(),
            content: content.to_string(),
            created_at: now,
        })
    }

    async fn notes(&self, session_id: &str) -> Result<Vec<Note>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, session_id, agent_id, content, created_at
             FROM notes WHERE session_id = ?1 ORDER BY id ASC",
        )?;
        let rows = stmt
            .query_map(params![session_id], |row| {
                let created_at: String = row.get(4)?;
                Ok(Note {
                    id: row.get(0)?,
                    session_id: row.get(1)?,
                    agent_id: row.get(2)?,
                    content: row.get(3)?,
                    created_at: parse_ts(&created_at),
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    async fn blackboard_put(
        &self,
        key: &str,
        value: &str,
        author_agent_id: &str,
        ttl_secs: Option<u64>,
    ) -> Result<()> {
        let now = Utc::now();
        let expires_at = ttl_secs.map(|s| ts(&(now + Duration::seconds(s as i64))));
        let conn = self.conn.lock().await;
        conn.execute(
            "DELETE FROM blackboard WHERE expires_at IS NOT NULL AND expires_at <= ?1",
            params![ts(&now)],
        )?;
        conn.execute(
            "INSERT OR REPLACE INTO blackboard (key, value, author_agent_id, created_at, expires_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![key, value, author_agent_id, ts(&now), expires_at],
        )?;
        Ok(())
    }

    async fn blackboard_get(&self, key: &str) -> Result<Option<BlackboardEntry>> {
        let conn = self.conn.lock().await;
        let entry = conn
            .query_row(
                "SELECT key, value, author_agent_id, created_at, expires_at FROM blackboard
                 WHERE key = ?1 AND (expires_at IS NULL OR expires_at > ?2)",
                params![key, ts(&Utc::now())],
                row_to_blackboard,
            )
            .optional()?;
        Ok(entry)
    }

    async fn blackboard_list(&self, prefix: &str) -> Result<Vec<BlackboardEntry>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT key, value, author_agent_id, created_at, expires_at FROM blackboard
             WHERE substr(key, 1, length(?1)) = ?1 AND (expires_at IS NULL OR expires_at > ?2)
             ORDER BY created_at DESC",
        )?;
        let rows = stmt
            .query_map(params![prefix, ts(&Utc::now())], row_to_blackboard)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    async fn record_cross_agent_call(&self, call: &CrossAgentCall) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            &format!(
                "INSERT INTO cross_agent_calls ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                CALL_COLS
            ),
            params![
                call.id,
                call.source_agent_id,
                call.source_session_id,
                call.target_agent_id,
                call.target_session_id,
                call.kind.as_str(),
                call.content,
                call.response,
                call.status.as_str(),
                ts(&call.created_at),
                call.completed_at.as_ref().map(ts),
            ],
        )?;
        Ok(())
    }

    async fn complete_cross_agent_call(
        &self,
        call_id: &str,
        status: CallStatus,
        response: Option<&str>,
        target_session_id: Option<&str>,
    ) -> Result<bool> {
        let conn = self.conn.lock().await;
        let changed = conn.execute(
            "UPDATE cross_agent_calls
             SET status = ?2, response = ?3,
                 target_session_id = COALESCE(?4, target_session_id),
                 completed_at = ?5
             WHERE id = ?1 AND status = 'pending'",
            params![call_id, status.as_str(), response, target_session_id, ts(&Utc::now())],
        )?;
        Ok(changed > 0)
    }

    async fn get_cross_agent_call(&self, call_id: &str) -> Result<Option<CrossAgentCall>> {
        let conn = self.conn.lock().await;
        let call = conn
            .query_row(
                &format!("SELECT {} FROM cross_agent_calls WHERE id = ?1", CALL_COLS),
                params![call_id],
                row_to_call,
            )
            .optional()?;
        Ok(call)
    }

    async fn record_signal(&self, signal: &InteractionSignal) -> Result<()> {
        let detail = serde_json::to_string(&signal.detail)?;
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO interaction_signals (session_id, agent_id, kind, detail, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![signal.session_id, signal.agent_id, signal.kind, detail, ts(&Utc::now())],
        )?;
        Ok(())
    }

    async fn thread_summary(&self, thread_id: &str) -> Result<Option<String>> {
        let conn = self.conn.lock().await;
        let summary = conn
            .query_row(
                "SELECT summary FROM thread_summaries WHERE thread_id = ?1",
                params![thread_id],
                |r| r.get(0),
            )
            .optional()?;
        Ok(summary)
    }

    async fn set_thread_summary(&self, thread_id: &str, agent_id: &str, summary: &str) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO thread_summaries (thread_id, agent_id, summary, updated_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(thread_id) DO UPDATE SET
                agent_id = excluded.agent_id,
                summary = excluded.summary,
                updated_at = excluded.updated_at",
            params![thread_id, agent_id, summary, ts(&Utc::now())],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    async fn session(store: &SqliteStore) -> Session {
        store
            .open_session("syn", "main", SessionSeed::default())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_open_session_is_idempotent() {
        let store = SqliteStore::in_memory().unwrap();
        let a = session(&store).await;
        let b = session(&store).await;
        assert_eq!(a.id, b.id);
        assert_eq!(a.status, SessionStatus::Active);

        store.set_status(&a.id, SessionStatus::Archived).await.unwrap();
        let c = session(&store).await;
        assert_ne!(a.id, c.id);
    }

    #[tokio::test]
    async fn test_append_assigns_sequence_and_counters() {
        let store = SqliteStore::in_memory().unwrap();
        let s = session(&store).await;
        let m1 = store.append_message(&s.id, NewMessage::user("hello")).await.unwrap();
        let m2 = store
            .append_message(&s.id, NewMessage::assistant("hi there"))
            .await
            .unwrap();
        assert_eq!(m1.seq, 1);
        assert_eq!(m2.seq, 2);

        let s = store.get_session(&s.id).await.unwrap().unwrap();
        assert_eq!(s.message_count, 2);
        assert_eq!(s.token_count_estimate, m1.token_estimate + m2.token_estimate);
    }

    #[tokio::test]
    async fn test_append_to_unknown_session_fails() {
        let store = SqliteStore::in_memory().unwrap();
        assert!(store.append_message("nope", NewMessage::user("x")).await.is_err());
    }

    #[tokio::test]
    async fn test_concurrent_appends_get_unique_seqs() {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let s = session(&store).await;
        let mut handles = Vec::new();
        for i in 0..20 {
            let store = store.clone();
            let id = s.id.clone();
            handles.push(tokio::spawn(async move {
                store.append_message(&id, NewMessage::user(format!("m{}", i))).await.unwrap().seq
            }));
        }
        let mut seqs = Vec::new();
        for h in handles {
            seqs.push(h.await.unwrap());
        }
        seqs.sort();
        assert_eq!(seqs, (1..=20).collect::<Vec<i64>>());
        let s = store.get_session(&s.id).await.unwrap().unwrap();
        assert_eq!(s.message_count, 20);
    }

    #[tokio::test]
    async fn test_apply_distillation_places_summary_before_tail() {
        let store = SqliteStore::in_memory().unwrap();
        let s = session(&store).await;
        let mut ids = Vec::new();
        for i in 0..6 {
            let m = store
                .append_message(&s.id, NewMessage::user(format!("message {}", i)))
                .await
                .unwrap();
            ids.push(m.id);
        }
        store.record_turn(&s.id, 150_000).await.unwrap();

        let record = DistillationRecord {
            session_id: s.id.clone(),
            messages_before: 6,
            messages_after: 3,
            tokens_before: 100,
            tokens_after: 20,
            facts_extracted: 2,
            model: "test-model".into(),
            created_at: Utc::now(),
        };
        let after = store
            .apply_distillation(&s.id, &ids[..4], NewMessage::user("summary"), &record)
            .await
            .unwrap();
        assert_eq!(after.message_count, 3);
        assert_eq!(after.distillation_count, 1);
        assert_eq!(after.last_input_tokens, 0);

        let live = store.messages(&s.id, false).await.unwrap();
        let texts: Vec<_> = live.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(texts, vec!["summary", "message 4", "message 5"]);

        let all = store.messages(&s.id, true).await.unwrap();
        assert_eq!(all.len(), 7);
        assert_eq!(all.iter().filter(|m| m.is_distilled).count(), 4);
        assert_eq!(store.distillations(&s.id).await.unwrap().len(), 1);

        // Already-distilled ids are rejected and nothing changes.
        let err = store
            .apply_distillation(&s.id, &ids[..1], NewMessage::user("again"), &record)
            .await;
        assert!(err.is_err());
        assert_eq!(store.messages(&s.id, false).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_cross_agent_call_terminal_once() {
        let store = SqliteStore::in_memory().unwrap();
        let call = CrossAgentCall::new("syn", None, "arbor", CallKind::Ask, "status?");
        store.record_cross_agent_call(&call).await.unwrap();

        assert!(store
            .complete_cross_agent_call(&call.id, CallStatus::Responded, Some("green"), Some("s2"))
            .await
            .unwrap());
        assert!(!store
            .complete_cross_agent_call(&call.id, CallStatus::Timeout, None, None)
            .await
            .unwrap());

        let row = store.get_cross_agent_call(&call.id).await.unwrap().unwrap();
        assert_eq!(row.status, CallStatus::Responded);
        assert_eq!(row.response.as_deref(), Some("green"));
        assert_eq!(row.target_session_id.as_deref(), Some("s2"));
        assert!(row.completed_at.is_some());
    }

    #[tokio::test]
    async fn test_blackboard_ttl_and_prefix() {
        let store = SqliteStore::in_memory().unwrap();
        store.blackboard_put("broadcast:1", "deploy at 5", "syn", None).await.unwrap();
        store.blackboard_put("broadcast:2", "gone", "syn", Some(0)).await.unwrap();
        store.blackboard_put("other", "x", "syn", None).await.unwrap();

        let list = store.blackboard_list("broadcast:").await.unwrap();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].value, "deploy at 5");
        assert!(store.blackboard_get("broadcast:2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_notes_thread_summary_and_signals() {
        let store = SqliteStore::in_memory().unwrap();
        let s = session(&store).await;
        store.add_note(&s.id, "syn", "first").await.unwrap();
        store.add_note(&s.id, "syn", "second").await.unwrap();
        let notes = store.notes(&s.id).await.unwrap();
        assert_eq!(notes[0].content, "first");
        assert_eq!(notes.len(), 2);

        assert!(store.thread_summary("signal:abc").await.unwrap().is_none());
        store.set_thread_summary("signal:abc", "syn", "v1").await.unwrap();
        store.set_thread_summary("signal:abc", "syn", "v2").await.unwrap();
        assert_eq!(store.thread_summary("signal:abc").await.unwrap().as_deref(), Some("v2"));

        store
            .record_signal(&InteractionSignal {
                session_id: Some(s.id.clone()),
                agent_id: "syn".into(),
                kind: "disagreement".into(),
                detail: serde_json::json!({"pattern": "i disagree"}),
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_working_state_roundtrip() {
        let store = SqliteStore::in_memory().unwrap();
        let s = session(&store).await;
        let ws = WorkingState {
            current_task: Some("refactor".into()),
            ..Default::default()
        };
        store.set_working_state(&s.id, &ws).await.unwrap();
        let s = store.get_session(&s.id).await.unwrap().unwrap();
        assert_eq!(s.working_state, Some(ws));
    }
}
