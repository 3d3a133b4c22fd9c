//! Session retrieval history.
//!
//! `(session_id, tool_md5)` is unique; recording is idempotent so concurrent
//! retrieve calls against the same session converge.

use rusqlite::params;
use serde::Serialize;

use super::{now_rfc3339, Store};
use crate::error::BrokerResult;

#[derive(Debug, Clone, Serialize)]
pub struct SessionEntry {
    pub session_id: String,
    pub tool_md5: String,
    pub tool_name: String,
    pub retrieved_at: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionStats {
    pub session_id: String,
    pub tool_count: u64,
    pub first_retrieved_at: Option<String>,
    pub last_retrieved_at: Option<String>,
}

impl Store {
    pub fn get_session_history(&self, session_id: &str) -> BrokerResult<Vec<SessionEntry>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT session_id, tool_md5, tool_name, retrieved_at
                 FROM session_tool_history WHERE session_id = ?1 ORDER BY id",
            )?;
            let rows = stmt
                .query_map(params![session_id], |row| {
                    Ok(SessionEntry {
                        session_id: row.get(0)?,
                        tool_md5: row.get(1)?,
                        tool_name: row.get(2)?,
                        retrieved_at: row.get(3)?,
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    pub fn is_retrieved(&self, session_id: &str, tool_md5: &str) -> BrokerResult<bool> {
        self.with_conn(|conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM session_tool_history
                 WHERE session_id = ?1 AND tool_md5 = ?2",
                params![session_id, tool_md5],
                |row| row.get(0),
            )?;
            Ok(count > 0)
        })
    }

    pub fn record_retrieved(
        &self,
        session_id: &str,
        tool_md5: &str,
        tool_name: &str,
    ) -> BrokerResult<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT OR IGNORE INTO session_tool_history
                    (session_id, tool_md5, tool_name, retrieved_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![session_id, tool_md5, tool_name, now_rfc3339()],
            )?;
            Ok(())
        })
    }

    pub fn record_retrieved_batch(
        &self,
        session_id: &str,
        entries: &[(String, String)],
    ) -> BrokerResult<()> {
        if entries.is_empty() {
            return Ok(());
        }
        self.with_tx(|tx| {
            let now = now_rfc3339();
            let mut stmt = tx.prepare(
                "INSERT OR IGNORE INTO session_tool_history
                    (session_id, tool_md5, tool_name, retrieved_at)
                 VALUES (?1, ?2, ?3, ?4)",
            )?;
            for (tool_md5, tool_name) in entries {
                stmt.execute(params![session_id, tool_md5, tool_name, now])?;
            }
            Ok(())
        })
    }

    pub fn clear_session(&self, session_id: &str) -> BrokerResult<usize> {
        self.with_conn(|conn| {
            let deleted = conn.execute(
                "DELETE FROM session_tool_history WHERE session_id = ?1",
                params![session_id],
            )?;
            Ok(deleted)
        })
    }

    pub fn session_stats(&self, session_id: &str) -> BrokerResult<SessionStats> {
        self.with_conn(|conn| {
            let (tool_count, first, last): (i64, Option<String>, Option<String>) = conn
                .query_row(
                    "SELECT COUNT(*), MIN(retrieved_at), MAX(retrieved_at)
                     FROM session_tool_history WHERE session_id = ?1",
                    params![session_id],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
                )?;
            Ok(SessionStats {
                session_id: session_id.to_string(),
                tool_count: tool_count as u64,
                first_retrieved_at: first,
                last_retrieved_at: last,
            })
        })
    }
}
