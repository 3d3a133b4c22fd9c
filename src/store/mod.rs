//! Persistence: relational tables plus a vector-similarity surface over a
//! single SQLite file.
//!
//! All writes run inside transactions behind one serialized connection
//! handle. Readers see committed state. The vector table stores f32
//! little-endian BLOBs of the declared dimension; similarity search is a
//! brute-force cosine scan, which is adequate for catalogs up to ~10^4 tools.

mod migrations;
mod servers;
mod sessions;
mod tools;
mod vector;

use std::path::Path;

use parking_lot::Mutex;
use rusqlite::Connection;

use crate::error::{BrokerError, BrokerResult};

pub use servers::{ServerDraft, ServerFilter, ServerKind, ServerPatch, ServerRecord};
pub use sessions::{SessionEntry, SessionStats};
pub use tools::{SimilarTool, ToolRow};
pub use vector::normalize;

pub struct Store {
    conn: Mutex<Connection>,
    dim: usize,
}

impl Store {
    /// Open (creating if necessary) the database at `path` with the declared
    /// vector dimension, and run pending migrations.
    pub fn open(path: &Path, dim: usize) -> BrokerResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| BrokerError::Internal(format!("create {}: {}", parent.display(), e)))?;
        }
        let conn = Connection::open(path)?;
        Self::init(conn, dim)
    }

    /// In-memory database, used by tests.
    pub fn open_in_memory(dim: usize) -> BrokerResult<Self> {
        Self::init(Connection::open_in_memory()?, dim)
    }

    fn init(mut conn: Connection, dim: usize) -> BrokerResult<Self> {
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        migrations::run_migrations(&mut conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            dim,
        })
    }

    /// Declared dimension of the vector column.
    pub fn dimension(&self) -> usize {
        self.dim
    }

    pub(crate) fn with_conn<T>(
        &self,
        f: impl FnOnce(&Connection) -> BrokerResult<T>,
    ) -> BrokerResult<T> {
        let conn = self.conn.lock();
        f(&conn)
    }

    pub(crate) fn with_tx<T>(
        &self,
        f: impl FnOnce(&rusqlite::Transaction<'_>) -> BrokerResult<T>,
    ) -> BrokerResult<T> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let out = f(&tx)?;
        tx.commit()?;
        Ok(out)
    }
}

pub(crate) fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339()
}
