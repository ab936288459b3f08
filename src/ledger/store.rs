use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::ledger::state::LedgerState;

/// Retention: audit trail keeps the last 500 mutations, reconciliation
/// history the last 100 reports. Older rows are trimmed on insert.
const MAX_HISTORY_ROWS: i64 = 500;
const MAX_REPORT_ROWS: i64 = 100;

/// One audit-trail entry. Append-only; never used for recomputation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub id: i64,
    pub kind: String,
    pub payload: serde_json::Value,
    pub ts: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredReport {
    pub id: i64,
    pub severity: String,
    pub status: String,
    pub report: serde_json::Value,
    pub ts: DateTime<Utc>,
}

/// Durable home of the ledger singleton, its audit trail and the
/// reconciliation report history.
#[derive(Clone)]
pub struct LedgerStore {
    conn: Arc<Mutex<Connection>>,
}

impl LedgerStore {
    pub fn new(db_path: &str) -> Result<Self> {
        let conn = Connection::open(db_path).context("open ledger db")?;
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "synchronous", "NORMAL").ok();

        conn.execute(
            "CREATE TABLE IF NOT EXISTS ledger_state (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                state_json TEXT NOT NULL,
                updated_at INTEGER NOT NULL
            )",
            [],
        )?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS ledger_history (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                kind TEXT NOT NULL,
                payload TEXT NOT NULL,
                ts TEXT NOT NULL
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_ledger_history_ts ON ledger_history(ts DESC)",
            [],
        )?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS reconciliation_reports (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                severity TEXT NOT NULL,
                status TEXT NOT NULL,
                report_json TEXT NOT NULL,
                ts TEXT NOT NULL
            )",
            [],
        )?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub async fn load_state(&self) -> Result<Option<LedgerState>> {
        let conn = self.conn.lock().await;
        let mut stmt =
            conn.prepare_cached("SELECT state_json FROM ledger_state WHERE id = 1 LIMIT 1")?;
        let mut rows = stmt.query([])?;
        let Some(row) = rows.next()? else {
            return Ok(None);
        };
        let json: String = row.get(0)?;
        let state = serde_json::from_str(&json).context("decode ledger state")?;
        Ok(Some(state))
    }

    /// Upsert the state row and append one history entry in a single
    /// transaction. The in-memory state is only committed by the caller
    /// after this returns Ok, so a failed write never leaves derived
    /// fields stale relative to the totals.
    pub async fn persist_state(
        &self,
        state: &LedgerState,
        history_kind: &str,
        history_payload: &serde_json::Value,
    ) -> Result<()> {
        let json = serde_json::to_string(state).context("encode ledger state")?;
        let now = Utc::now();

        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO ledger_state (id, state_json, updated_at)
             VALUES (1, ?1, ?2)
             ON CONFLICT(id) DO UPDATE SET
                state_json = excluded.state_json,
                updated_at = excluded.updated_at",
            params![json, now.timestamp()],
        )?;
        tx.execute(
            "INSERT INTO ledger_history (kind, payload, ts) VALUES (?1, ?2, ?3)",
            params![history_kind, history_payload.to_string(), now.to_rfc3339()],
        )?;
        tx.execute(
            "DELETE FROM ledger_history WHERE id NOT IN
               (SELECT id FROM ledger_history ORDER BY id DESC LIMIT ?1)",
            params![MAX_HISTORY_ROWS],
        )?;
        tx.commit()?;
        Ok(())
    }

    pub async fn list_history(&self, limit: usize) -> Result<Vec<HistoryEntry>> {
        let limit = limit.clamp(1, MAX_HISTORY_ROWS as usize) as i64;
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT id, kind, payload, ts FROM ledger_history ORDER BY id DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
            ))
        })?;

        let mut out = Vec::new();
        for row in rows {
            let (id, kind, payload, ts) = row?;
            out.push(HistoryEntry {
                id,
                kind,
                payload: serde_json::from_str(&payload).unwrap_or(serde_json::Value::Null),
                ts: DateTime::parse_from_rfc3339(&ts)
                    .map(|t| t.with_timezone(&Utc))
                    .unwrap_or_else(|_| Utc::now()),
            });
        }
        Ok(out)
    }

    pub async fn insert_report(
        &self,
        severity: &str,
        status: &str,
        report: &serde_json::Value,
    ) -> Result<()> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO reconciliation_reports (severity, status, report_json, ts)
             VALUES (?1, ?2, ?3, ?4)",
            params![severity, status, report.to_string(), Utc::now().to_rfc3339()],
        )?;
        tx.execute(
            "DELETE FROM reconciliation_reports WHERE id NOT IN
               (SELECT id FROM reconciliation_reports ORDER BY id DESC LIMIT ?1)",
            params![MAX_REPORT_ROWS],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Most-recent-first page of the report history.
    pub async fn list_reports(&self, limit: usize, offset: usize) -> Result<Vec<StoredReport>> {
        let limit = limit.clamp(1, MAX_REPORT_ROWS as usize) as i64;
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT id, severity, status, report_json, ts
             FROM reconciliation_reports ORDER BY id DESC LIMIT ?1 OFFSET ?2",
        )?;
        let rows = stmt.query_map(params![limit, offset as i64], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
            ))
        })?;

        let mut out = Vec::new();
        for row in rows {
            let (id, severity, status, report, ts) = row?;
            out.push(StoredReport {
                id,
                severity,
                status,
                report: serde_json::from_str(&report).unwrap_or(serde_json::Value::Null),
                ts: DateTime::parse_from_rfc3339(&ts)
                    .map(|t| t.with_timezone(&Utc))
                    .unwrap_or_else(|_| Utc::now()),
            });
        }
        Ok(out)
    }
}
