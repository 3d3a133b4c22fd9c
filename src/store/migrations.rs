//! Versioned schema migrations, applied once each at open time.
//!
//! Migrations are additive. Existing tables are never dropped.

use rusqlite::Connection;

use crate::error::BrokerResult;

const MIGRATIONS: &[(i64, &str)] = &[(
    1,
    r#"
    CREATE TABLE IF NOT EXISTS mcp_servers (
        id          INTEGER PRIMARY KEY AUTOINCREMENT,
        name        TEXT NOT NULL UNIQUE,
        type        TEXT NOT NULL,
        url         TEXT,
        command     TEXT,
        args        TEXT NOT NULL DEFAULT '[]',
        headers     TEXT NOT NULL DEFAULT '{}',
        env         TEXT NOT NULL DEFAULT '{}',
        description TEXT,
        enabled     INTEGER NOT NULL DEFAULT 1,
        created_at  TEXT NOT NULL,
        updated_at  TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_mcp_servers_type ON mcp_servers(type);
    CREATE INDEX IF NOT EXISTS idx_mcp_servers_enabled ON mcp_servers(enabled);

    CREATE TABLE IF NOT EXISTS tool_vectors (
        id           INTEGER PRIMARY KEY AUTOINCREMENT,
        tool_md5     TEXT NOT NULL,
        model_name   TEXT NOT NULL,
        display_name TEXT NOT NULL,
        description  TEXT NOT NULL DEFAULT '',
        created_at   TEXT NOT NULL,
        updated_at   TEXT NOT NULL,
        UNIQUE(tool_md5, model_name)
    );
    CREATE INDEX IF NOT EXISTS idx_tool_vectors_md5 ON tool_vectors(tool_md5);
    CREATE INDEX IF NOT EXISTS idx_tool_vectors_model ON tool_vectors(model_name);
    CREATE INDEX IF NOT EXISTS idx_tool_vectors_display ON tool_vectors(display_name);

    CREATE TABLE IF NOT EXISTS vec_tool_embeddings (
        rowid     INTEGER PRIMARY KEY AUTOINCREMENT,
        embedding BLOB NOT NULL
    );

    CREATE TABLE IF NOT EXISTS tool_mapping (
        vec_rowid INTEGER NOT NULL UNIQUE,
        tool_id   INTEGER NOT NULL UNIQUE
    );

    CREATE TABLE IF NOT EXISTS session_tool_history (
        id           INTEGER PRIMARY KEY AUTOINCREMENT,
        session_id   TEXT NOT NULL,
        tool_md5     TEXT NOT NULL,
        tool_name    TEXT NOT NULL,
        retrieved_at TEXT NOT NULL,
        UNIQUE(session_id, tool_md5)
    );
    CREATE INDEX IF NOT EXISTS idx_session_history_sid ON session_tool_history(session_id);
    "#,
)];

pub(crate) fn run_migrations(conn: &mut Connection) -> BrokerResult<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version    INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL
        )",
        [],
    )?;

    for (version, sql) in MIGRATIONS {
        let applied: bool = conn
            .query_row(
                "SELECT COUNT(*) FROM schema_migrations WHERE version = ?1",
                [version],
                |row| row.get::<_, i64>(0),
            )
            .map(|n| n > 0)?;
        if applied {
            continue;
        }

        let tx = conn.transaction()?;
        tx.execute_batch(sql)?;
        tx.execute(
            "INSERT INTO schema_migrations (version, applied_at) VALUES (?1, ?2)",
            rusqlite::params![version, super::now_rfc3339()],
        )?;
        tx.commit()?;
        tracing::info!("Applied schema migration v{}", version);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrations_apply_once() {
        let mut conn = Connection::open_in_memory().unwrap();
        run_migrations(&mut conn).unwrap();
        run_migrations(&mut conn).unwrap();

        let applied: i64 = conn
            .query_row("SELECT COUNT(*) FROM schema_migrations", [], |row| row.get(0))
            .unwrap();
        assert_eq!(applied, MIGRATIONS.len() as i64);
    }

    #[test]
    fn test_migrations_create_all_tables() {
        let mut conn = Connection::open_in_memory().unwrap();
        run_migrations(&mut conn).unwrap();

        for table in [
            "mcp_servers",
            "tool_vectors",
            "vec_tool_embeddings",
            "tool_mapping",
            "session_tool_history",
            "schema_migrations",
        ] {
            let count: i64 = conn
                .query_row(
                    "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
                    [table],
                    |row| row.get(0),
                )
                .unwrap();
            assert_eq!(count, 1, "missing table {}", table);
        }
    }
}
