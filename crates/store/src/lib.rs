//! Embedded SQLite store.
//!
//! One WAL-mode database file holds every persistent table: the memory
//! store (`artifacts`), the trust ledger (`intent_history`), proposals
//! (`action_proposals`), per-domain user modes, the global app state row
//! and the legacy command queue. All mutations go through this adapter,
//! which serialises writes behind a single connection lock.

#![deny(unsafe_code)]

use kernel_core::ids::now_ms;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::{Arc, Mutex};
use thiserror::Error;

/// Errors emitted by the store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// SQLite statement failed.
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    /// Row payload (de)serialization failed.
    #[error("serialize: {0}")]
    Serde(#[from] serde_json::Error),
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS artifacts (
    id             TEXT PRIMARY KEY,
    timestamp      INTEGER NOT NULL,
    content        TEXT NOT NULL,
    type           TEXT NOT NULL,
    bounding_box   TEXT NOT NULL DEFAULT '{}',
    classification TEXT,
    summary        TEXT,
    embedding      TEXT
);
CREATE TABLE IF NOT EXISTS intent_history (
    id             INTEGER PRIMARY KEY AUTOINCREMENT,
    intent         TEXT NOT NULL,
    focused_window TEXT NOT NULL,
    executed_at    INTEGER NOT NULL,
    success_count  INTEGER NOT NULL DEFAULT 1,
    cached_plan    TEXT
);
CREATE UNIQUE INDEX IF NOT EXISTS idx_intent_focus
    ON intent_history(intent, focused_window);
CREATE TABLE IF NOT EXISTS action_proposals (
    id               TEXT PRIMARY KEY,
    intent           TEXT NOT NULL,
    risk_score       INTEGER NOT NULL,
    status           TEXT NOT NULL,
    payload          TEXT NOT NULL,
    domain           TEXT NOT NULL DEFAULT '*',
    created_at       INTEGER NOT NULL,
    updated_at       INTEGER NOT NULL,
    approved_at      INTEGER,
    interaction_type TEXT NOT NULL DEFAULT 'PERMISSION',
    agent_message    TEXT,
    user_response    TEXT
);
CREATE TABLE IF NOT EXISTS user_modes (
    domain     TEXT PRIMARY KEY,
    mode       TEXT NOT NULL,
    updated_at INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS app_state (
    id         INTEGER PRIMARY KEY CHECK (id = 1),
    state      TEXT NOT NULL,
    updated_at INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS commands (
    id          TEXT PRIMARY KEY,
    action      TEXT NOT NULL,
    target      TEXT NOT NULL DEFAULT '',
    payload     TEXT NOT NULL DEFAULT '{}',
    status      TEXT NOT NULL,
    created_at  INTEGER NOT NULL,
    executed_at INTEGER
);
"#;

/// Persisted proposal row; `payload` carries the serialised proposal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProposalRow {
    /// Opaque proposal id.
    pub id: String,
    /// Intent as submitted.
    pub intent: String,
    /// Risk on the Planner-facing 0..100 scale.
    pub risk_score: u8,
    /// Wire-name status, e.g. `WAITING_FOR_USER`.
    pub status: String,
    /// Serialised proposal JSON.
    pub payload: String,
    /// Domain the user-mode lookup resolved to.
    pub domain: String,
    /// Creation time (ms since epoch).
    pub created_at: u64,
    /// Last transition time.
    pub updated_at: u64,
    /// Set when the proposal was approved.
    pub approved_at: Option<u64>,
    /// `PERMISSION` or `CLARIFICATION`.
    pub interaction_type: String,
    /// Planner's question on clarification requests.
    pub agent_message: Option<String>,
    /// User's free-text reply, once given.
    pub user_response: Option<String>,
}

/// One row of the trust ledger.
#[derive(Debug, Clone)]
pub struct TrustRow {
    /// Intent string.
    pub intent: String,
    /// Focused window title at completion time.
    pub focused_window: String,
    /// Last successful completion (ms since epoch).
    pub executed_at: u64,
    /// Successful completions of this pair.
    pub success_count: u64,
    /// Serialised plan, cached once the trust threshold is crossed.
    pub cached_plan: Option<String>,
}

/// One row of the memory store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactRow {
    /// Opaque artifact id.
    pub id: String,
    /// Capture time (ms since epoch).
    pub timestamp: u64,
    /// Captured content.
    pub content: String,
    /// Artifact kind, e.g. `screen_text`.
    pub kind: String,
    /// Bounding box JSON.
    pub bounding_box: String,
    /// Optional classifier label.
    pub classification: Option<String>,
    /// Optional short summary.
    pub summary: Option<String>,
    /// Optional embedding JSON (computed externally).
    pub embedding: Option<String>,
}

/// One dispatched command journalled in the legacy queue table.
#[derive(Debug, Clone)]
pub struct CommandRow {
    /// Command id (`cmd-<n>`).
    pub id: String,
    /// Action kind.
    pub action: String,
    /// Proposal the command belongs to.
    pub target: String,
    /// Action payload JSON.
    pub payload: String,
    /// Wire-name status.
    pub status: String,
    /// Enqueue time.
    pub created_at: u64,
    /// Terminal-report time.
    pub executed_at: Option<u64>,
}

/// Handle to the kernel database. Cheap to clone; writes serialise on the
/// inner connection lock.
#[derive(Debug, Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    /// Open (or create) the database at `path` in WAL mode and apply the
    /// schema and seed rows.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        let _mode: String =
            conn.query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))?;
        conn.busy_timeout(std::time::Duration::from_millis(2_000))?;
        Self::bootstrap(conn)
    }

    /// In-memory database for tests.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::bootstrap(Connection::open_in_memory()?)
    }

    fn bootstrap(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA)?;
        let now = now_ms();
        conn.execute(
            "INSERT OR IGNORE INTO user_modes (domain, mode, updated_at) VALUES ('*', 'AUTO', ?1)",
            params![now],
        )?;
        conn.execute(
            "INSERT OR IGNORE INTO app_state (id, state, updated_at) VALUES (1, 'SHADOW', ?1)",
            params![now],
        )?;
        Ok(Self { conn: Arc::new(Mutex::new(conn)) })
    }

    fn with_conn<T>(
        &self,
        f: impl FnOnce(&Connection) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let conn = self.conn.lock().expect("store lock poisoned");
        f(&conn)
    }

    // ---- action_proposals ----

    /// Insert a freshly created proposal row.
    pub fn insert_proposal(&self, row: &ProposalRow) -> Result<(), StoreError> {
        self.with_conn(|c| {
            c.execute(
                "INSERT INTO action_proposals
                   (id, intent, risk_score, status, payload, domain, created_at, updated_at,
                    approved_at, interaction_type, agent_message, user_response)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                params![
                    row.id,
                    row.intent,
                    row.risk_score,
                    row.status,
                    row.payload,
                    row.domain,
                    row.created_at,
                    row.updated_at,
                    row.approved_at,
                    row.interaction_type,
                    row.agent_message,
                    row.user_response,
                ],
            )?;
            Ok(())
        })
    }

    /// Latest state of one proposal.
    pub fn get_proposal(&self, id: &str) -> Result<Option<ProposalRow>, StoreError> {
        self.with_conn(|c| {
            let row = c
                .query_row(
                    "SELECT id, intent, risk_score, status, payload, domain, created_at,
                            updated_at, approved_at, interaction_type, agent_message,
                            user_response
                     FROM action_proposals WHERE id = ?1",
                    params![id],
                    Self::map_proposal,
                )
                .optional()?;
            Ok(row)
        })
    }

    /// All proposals held for the user, oldest first.
    pub fn list_waiting(&self) -> Result<Vec<ProposalRow>, StoreError> {
        self.with_conn(|c| {
            let mut stmt = c.prepare(
                "SELECT id, intent, risk_score, status, payload, domain, created_at,
                        updated_at, approved_at, interaction_type, agent_message, user_response
                 FROM action_proposals
                 WHERE status IN ('WAITING_FOR_USER', 'WAITING_FOR_CONTEXT')
                 ORDER BY created_at ASC, id ASC",
            )?;
            let rows = stmt
                .query_map([], Self::map_proposal)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    /// Transition a proposal's status; touches `updated_at` and records
    /// `approved_at` when supplied.
    pub fn set_proposal_status(
        &self,
        id: &str,
        status: &str,
        approved_at: Option<u64>,
    ) -> Result<(), StoreError> {
        self.with_conn(|c| {
            match approved_at {
                Some(at) => c.execute(
                    "UPDATE action_proposals
                     SET status = ?2, updated_at = ?3, approved_at = ?4 WHERE id = ?1",
                    params![id, status, now_ms(), at],
                )?,
                None => c.execute(
                    "UPDATE action_proposals SET status = ?2, updated_at = ?3 WHERE id = ?1",
                    params![id, status, now_ms()],
                )?,
            };
            Ok(())
        })
    }

    /// Store the user's free-text reply and move the proposal to `status`.
    pub fn set_user_response(
        &self,
        id: &str,
        response: &str,
        status: &str,
    ) -> Result<(), StoreError> {
        self.with_conn(|c| {
            c.execute(
                "UPDATE action_proposals
                 SET user_response = ?2, status = ?3, updated_at = ?4 WHERE id = ?1",
                params![id, response, status, now_ms()],
            )?;
            Ok(())
        })
    }

    fn map_proposal(row: &rusqlite::Row<'_>) -> rusqlite::Result<ProposalRow> {
        Ok(ProposalRow {
            id: row.get(0)?,
            intent: row.get(1)?,
            risk_score: row.get(2)?,
            status: row.get(3)?,
            payload: row.get(4)?,
            domain: row.get(5)?,
            created_at: row.get(6)?,
            updated_at: row.get(7)?,
            approved_at: row.get(8)?,
            interaction_type: row.get(9)?,
            agent_message: row.get(10)?,
            user_response: row.get(11)?,
        })
    }

    // ---- intent_history ----

    /// Upsert one successful completion: bump the count, touch
    /// `executed_at`, overwrite the cached plan (which may be empty).
    pub fn record_success(
        &self,
        intent: &str,
        focused_window: &str,
        plan: &str,
    ) -> Result<u64, StoreError> {
        self.with_conn(|c| {
            c.execute(
                "INSERT INTO intent_history
                   (intent, focused_window, executed_at, success_count, cached_plan)
                 VALUES (?1, ?2, ?3, 1, ?4)
                 ON CONFLICT(intent, focused_window) DO UPDATE SET
                   success_count = success_count + 1,
                   executed_at = excluded.executed_at,
                   cached_plan = excluded.cached_plan",
                params![intent, focused_window, now_ms(), plan],
            )?;
            let count: u64 = c.query_row(
                "SELECT success_count FROM intent_history
                 WHERE intent = ?1 AND focused_window = ?2",
                params![intent, focused_window],
                |row| row.get(0),
            )?;
            Ok(count)
        })
    }

    /// Success count for one (intent, focus) pair; 0 when unseen.
    pub fn trust_count(&self, intent: &str, focused_window: &str) -> Result<u64, StoreError> {
        self.with_conn(|c| {
            let count = c
                .query_row(
                    "SELECT success_count FROM intent_history
                     WHERE intent = ?1 AND focused_window = ?2",
                    params![intent, focused_window],
                    |row| row.get::<_, u64>(0),
                )
                .optional()?;
            Ok(count.unwrap_or(0))
        })
    }

    /// Most recently executed row for `intent` across any focus whose
    /// count exceeds `threshold` and whose plan is non-empty.
    pub fn reflex_for_intent(
        &self,
        intent: &str,
        threshold: u64,
    ) -> Result<Option<TrustRow>, StoreError> {
        self.with_conn(|c| {
            let row = c
                .query_row(
                    "SELECT intent, focused_window, executed_at, success_count, cached_plan
                     FROM intent_history
                     WHERE intent = ?1 AND success_count > ?2
                       AND cached_plan IS NOT NULL AND cached_plan != ''
                     ORDER BY executed_at DESC LIMIT 1",
                    params![intent, threshold],
                    |row| {
                        Ok(TrustRow {
                            intent: row.get(0)?,
                            focused_window: row.get(1)?,
                            executed_at: row.get(2)?,
                            success_count: row.get(3)?,
                            cached_plan: row.get(4)?,
                        })
                    },
                )
                .optional()?;
            Ok(row)
        })
    }

    /// Clear the cached plan for every row matching `intent`.
    pub fn invalidate_reflex(&self, intent: &str) -> Result<usize, StoreError> {
        self.with_conn(|c| {
            let n = c.execute(
                "UPDATE intent_history SET cached_plan = NULL WHERE intent = ?1",
                params![intent],
            )?;
            Ok(n)
        })
    }

    // ---- user_modes / app_state ----

    /// Mode string for one domain, if configured.
    pub fn user_mode(&self, domain: &str) -> Result<Option<String>, StoreError> {
        self.with_conn(|c| {
            let mode = c
                .query_row(
                    "SELECT mode FROM user_modes WHERE domain = ?1",
                    params![domain],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(mode)
        })
    }

    /// Upsert one domain's mode.
    pub fn set_user_mode(&self, domain: &str, mode: &str) -> Result<(), StoreError> {
        self.with_conn(|c| {
            c.execute(
                "INSERT INTO user_modes (domain, mode, updated_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(domain) DO UPDATE SET
                   mode = excluded.mode, updated_at = excluded.updated_at",
                params![domain, mode, now_ms()],
            )?;
            Ok(())
        })
    }

    /// Persisted system mode (`SHADOW` on a fresh database).
    pub fn system_mode(&self) -> Result<String, StoreError> {
        self.with_conn(|c| {
            let state = c.query_row("SELECT state FROM app_state WHERE id = 1", [], |row| {
                row.get(0)
            })?;
            Ok(state)
        })
    }

    /// Persist a system-mode change.
    pub fn set_system_mode(&self, state: &str) -> Result<(), StoreError> {
        self.with_conn(|c| {
            c.execute(
                "UPDATE app_state SET state = ?1, updated_at = ?2 WHERE id = 1",
                params![state, now_ms()],
            )?;
            Ok(())
        })
    }

    // ---- artifacts ----

    /// Insert one memory artifact.
    pub fn insert_artifact(&self, row: &ArtifactRow) -> Result<(), StoreError> {
        self.with_conn(|c| {
            c.execute(
                "INSERT INTO artifacts
                   (id, timestamp, content, type, bounding_box, classification, summary, embedding)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    row.id,
                    row.timestamp,
                    row.content,
                    row.kind,
                    row.bounding_box,
                    row.classification,
                    row.summary,
                    row.embedding,
                ],
            )?;
            Ok(())
        })
    }

    /// Substring search over content and summary, newest first.
    pub fn search_artifacts(
        &self,
        query: &str,
        limit: u32,
    ) -> Result<Vec<ArtifactRow>, StoreError> {
        self.with_conn(|c| {
            let pattern = format!("%{}%", query);
            let mut stmt = c.prepare(
                "SELECT id, timestamp, content, type, bounding_box, classification, summary,
                        embedding
                 FROM artifacts
                 WHERE content LIKE ?1 OR summary LIKE ?1
                 ORDER BY timestamp DESC LIMIT ?2",
            )?;
            let rows = stmt
                .query_map(params![pattern, limit], |row| {
                    Ok(ArtifactRow {
                        id: row.get(0)?,
                        timestamp: row.get(1)?,
                        content: row.get(2)?,
                        kind: row.get(3)?,
                        bounding_box: row.get(4)?,
                        classification: row.get(5)?,
                        summary: row.get(6)?,
                        embedding: row.get(7)?,
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    // ---- commands ----

    /// Journal one dispatched command.
    pub fn insert_command(&self, row: &CommandRow) -> Result<(), StoreError> {
        self.with_conn(|c| {
            c.execute(
                "INSERT INTO commands (id, action, target, payload, status, created_at, executed_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    row.id,
                    row.action,
                    row.target,
                    row.payload,
                    row.status,
                    row.created_at,
                    row.executed_at,
                ],
            )?;
            Ok(())
        })
    }

    /// Apply a terminal status to one journalled command.
    pub fn set_command_status(&self, id: &str, status: &str) -> Result<(), StoreError> {
        self.with_conn(|c| {
            c.execute(
                "UPDATE commands SET status = ?2, executed_at = ?3 WHERE id = ?1",
                params![id, status, now_ms()],
            )?;
            Ok(())
        })
    }

    /// Look up one journalled command.
    pub fn get_command(&self, id: &str) -> Result<Option<CommandRow>, StoreError> {
        self.with_conn(|c| {
            let row = c
                .query_row(
                    "SELECT id, action, target, payload, status, created_at, executed_at
                     FROM commands WHERE id = ?1",
                    params![id],
                    |row| {
                        Ok(CommandRow {
                            id: row.get(0)?,
                            action: row.get(1)?,
                            target: row.get(2)?,
                            payload: row.get(3)?,
                            status: row.get(4)?,
                            created_at: row.get(5)?,
                            executed_at: row.get(6)?,
                        })
                    },
                )
                .optional()?;
            Ok(row)
        })
    }
}
