//! Persisted upstream server configurations.

use std::collections::HashMap;

use rusqlite::{params, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

use super::{now_rfc3339, Store};
use crate::error::{BrokerError, BrokerResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerKind {
    Stdio,
    Sse,
    HttpStream,
}

impl ServerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServerKind::Stdio => "stdio",
            ServerKind::Sse => "sse",
            ServerKind::HttpStream => "http_stream",
        }
    }

    pub fn parse(s: &str) -> BrokerResult<Self> {
        match s {
            "stdio" => Ok(ServerKind::Stdio),
            "sse" => Ok(ServerKind::Sse),
            "http_stream" => Ok(ServerKind::HttpStream),
            other => Err(BrokerError::Validation(format!(
                "unknown server type '{}' (expected stdio, sse, or http_stream)",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ServerRecord {
    pub id: i64,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: ServerKind,
    pub url: Option<String>,
    pub command: Option<String>,
    pub args: Vec<String>,
    pub headers: HashMap<String, String>,
    pub env: HashMap<String, String>,
    pub description: Option<String>,
    pub enabled: bool,
    pub created_at: String,
    pub updated_at: String,
}

impl ServerRecord {
    /// Fields whose change requires tearing down and reconnecting the live
    /// client.
    pub fn connection_fields_differ(&self, other: &ServerRecord) -> bool {
        self.kind != other.kind
            || self.url != other.url
            || self.command != other.command
            || self.args != other.args
            || self.headers != other.headers
            || self.env != other.env
    }
}

/// Payload for server creation.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerDraft {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: ServerKind,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

/// Partial update; absent fields keep their current value.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ServerPatch {
    pub name: Option<String>,
    #[serde(rename = "type")]
    pub kind: Option<ServerKind>,
    pub url: Option<String>,
    pub command: Option<String>,
    pub args: Option<Vec<String>>,
    pub headers: Option<HashMap<String, String>>,
    pub env: Option<HashMap<String, String>>,
    pub description: Option<String>,
    pub enabled: Option<bool>,
}

#[derive(Debug, Clone, Default)]
pub struct ServerFilter {
    pub enabled: Option<bool>,
    pub kind: Option<ServerKind>,
}

/// Structural validation per server kind. Name uniqueness is enforced by the
/// database.
pub fn validate_server(
    name: &str,
    kind: ServerKind,
    url: Option<&str>,
    command: Option<&str>,
) -> BrokerResult<()> {
    if name.trim().is_empty() {
        return Err(BrokerError::Validation("server name must not be empty".into()));
    }
    match kind {
        ServerKind::Stdio => {
            if command.map(str::trim).filter(|c| !c.is_empty()).is_none() {
                return Err(BrokerError::Validation(
                    "stdio servers require a command".into(),
                ));
            }
        }
        ServerKind::Sse | ServerKind::HttpStream => {
            let url = url.map(str::trim).filter(|u| !u.is_empty()).ok_or_else(|| {
                BrokerError::Validation(format!("{} servers require a url", kind.as_str()))
            })?;
            url::Url::parse(url)
                .map_err(|e| BrokerError::Validation(format!("invalid url '{}': {}", url, e)))?;
        }
    }
    Ok(())
}

fn row_to_server(row: &Row<'_>) -> rusqlite::Result<ServerRecord> {
    let kind_raw: String = row.get("type")?;
    let args_json: String = row.get("args")?;
    let headers_json: String = row.get("headers")?;
    let env_json: String = row.get("env")?;

    let json_err = |e: serde_json::Error| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
    };

    Ok(ServerRecord {
        id: row.get("id")?,
        name: row.get("name")?,
        kind: ServerKind::parse(&kind_raw).map_err(|_| {
            rusqlite::Error::FromSqlConversionFailure(
                0,
                rusqlite::types::Type::Text,
                format!("bad server type '{}'", kind_raw).into(),
            )
        })?,
        url: row.get("url")?,
        command: row.get("command")?,
        args: serde_json::from_str(&args_json).map_err(json_err)?,
        headers: serde_json::from_str(&headers_json).map_err(json_err)?,
        env: serde_json::from_str(&env_json).map_err(json_err)?,
        description: row.get("description")?,
        enabled: row.get::<_, i64>("enabled")? != 0,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
    })
}

const SERVER_COLUMNS: &str =
    "id, name, type, url, command, args, headers, env, description, enabled, created_at, updated_at";

impl Store {
    pub fn create_server(&self, draft: &ServerDraft) -> BrokerResult<ServerRecord> {
        validate_server(
            &draft.name,
            draft.kind,
            draft.url.as_deref(),
            draft.command.as_deref(),
        )?;

        let now = now_rfc3339();
        let id = self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO mcp_servers
                    (name, type, url, command, args, headers, env, description, enabled, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?10)",
                params![
                    draft.name.trim(),
                    draft.kind.as_str(),
                    draft.url,
                    draft.command,
                    serde_json::to_string(&draft.args)?,
                    serde_json::to_string(&draft.headers)?,
                    serde_json::to_string(&draft.env)?,
                    draft.description,
                    draft.enabled as i64,
                    now,
                ],
            )
            .map_err(|e| match BrokerError::from(e) {
                BrokerError::Conflict(_) => {
                    BrokerError::Conflict(format!("server name '{}' already exists", draft.name))
                }
                other => other,
            })?;
            Ok(conn.last_insert_rowid())
        })?;

        self.get_server(id)
    }

    pub fn get_server(&self, id: i64) -> BrokerResult<ServerRecord> {
        self.with_conn(|conn| {
            conn.query_row(
                &format!("SELECT {SERVER_COLUMNS} FROM mcp_servers WHERE id = ?1"),
                params![id],
                row_to_server,
            )
            .optional()?
            .ok_or_else(|| BrokerError::NotFound(format!("server {}", id)))
        })
    }

    pub fn get_server_by_name(&self, name: &str) -> BrokerResult<Option<ServerRecord>> {
        self.with_conn(|conn| {
            Ok(conn
                .query_row(
                    &format!("SELECT {SERVER_COLUMNS} FROM mcp_servers WHERE name = ?1"),
                    params![name],
                    row_to_server,
                )
                .optional()?)
        })
    }

    /// Page is 1-based. Returns the page plus the unpaginated total.
    pub fn list_servers(
        &self,
        filter: &ServerFilter,
        page: u64,
        limit: u64,
    ) -> BrokerResult<(Vec<ServerRecord>, u64)> {
        let page = page.max(1);
        let limit = limit.max(1);

        let mut clauses: Vec<&str> = Vec::new();
        let mut values: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();
        if let Some(enabled) = filter.enabled {
            clauses.push("enabled = ?");
            values.push(Box::new(enabled as i64));
        }
        if let Some(kind) = filter.kind {
            clauses.push("type = ?");
            values.push(Box::new(kind.as_str().to_string()));
        }
        let where_sql = if clauses.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", clauses.join(" AND "))
        };

        self.with_conn(|conn| {
            let total: u64 = conn.query_row(
                &format!("SELECT COUNT(*) FROM mcp_servers{where_sql}"),
                rusqlite::params_from_iter(values.iter().map(|v| v.as_ref())),
                |row| row.get::<_, i64>(0),
            )? as u64;

            let mut stmt = conn.prepare(&format!(
                "SELECT {SERVER_COLUMNS} FROM mcp_servers{where_sql}
                 ORDER BY id LIMIT ? OFFSET ?"
            ))?;
            let mut all_values: Vec<&dyn rusqlite::ToSql> =
                values.iter().map(|v| v.as_ref()).collect();
            let limit_sql = limit as i64;
            let offset_sql = ((page - 1) * limit) as i64;
            all_values.push(&limit_sql);
            all_values.push(&offset_sql);

            let rows = stmt
                .query_map(rusqlite::params_from_iter(all_values), row_to_server)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok((rows, total))
        })
    }

    pub fn count_servers(&self, filter: &ServerFilter) -> BrokerResult<u64> {
        let (_, total) = self.list_servers(filter, 1, 1)?;
        Ok(total)
    }

    pub fn update_server(&self, id: i64, patch: &ServerPatch) -> BrokerResult<ServerRecord> {
        let current = self.get_server(id)?;

        let name = patch.name.clone().unwrap_or(current.name);
        let kind = patch.kind.unwrap_or(current.kind);
        let url = patch.url.clone().or(current.url);
        let command = patch.command.clone().or(current.command);
        let args = patch.args.clone().unwrap_or(current.args);
        let headers = patch.headers.clone().unwrap_or(current.headers);
        let env = patch.env.clone().unwrap_or(current.env);
        let description = patch.description.clone().or(current.description);
        let enabled = patch.enabled.unwrap_or(current.enabled);

        validate_server(&name, kind, url.as_deref(), command.as_deref())?;

        self.with_conn(|conn| {
            conn.execute(
                "UPDATE mcp_servers SET
                    name = ?1, type = ?2, url = ?3, command = ?4, args = ?5,
                    headers = ?6, env = ?7, description = ?8, enabled = ?9, updated_at = ?10
                 WHERE id = ?11",
                params![
                    name.trim(),
                    kind.as_str(),
                    url,
                    command,
                    serde_json::to_string(&args)?,
                    serde_json::to_string(&headers)?,
                    serde_json::to_string(&env)?,
                    description,
                    enabled as i64,
                    now_rfc3339(),
                    id,
                ],
            )
            .map_err(|e| match BrokerError::from(e) {
                BrokerError::Conflict(_) => {
                    BrokerError::Conflict(format!("server name '{}' already exists", name))
                }
                other => other,
            })?;
            Ok(())
        })?;

        self.get_server(id)
    }

    pub fn delete_server(&self, id: i64) -> BrokerResult<ServerRecord> {
        let record = self.get_server(id)?;
        self.with_conn(|conn| {
            conn.execute("DELETE FROM mcp_servers WHERE id = ?1", params![id])?;
            Ok(())
        })?;
        Ok(record)
    }

    pub fn list_all_servers(&self) -> BrokerResult<Vec<ServerRecord>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {SERVER_COLUMNS} FROM mcp_servers ORDER BY id"
            ))?;
            let rows = stmt
                .query_map([], row_to_server)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> Store {
        Store::open_in_memory(4).unwrap()
    }

    fn stdio_draft(name: &str) -> ServerDraft {
        ServerDraft {
            name: name.to_string(),
            kind: ServerKind::Stdio,
            url: None,
            command: Some("npx".to_string()),
            args: vec!["-y".to_string(), "some-server".to_string()],
            headers: HashMap::new(),
            env: HashMap::from([("TOKEN".to_string(), "${HOME_TOKEN}".to_string())]),
            description: Some("files".to_string()),
            enabled: true,
        }
    }

    #[test]
    fn test_create_and_get_round_trip() {
        let store = store();
        let created = store.create_server(&stdio_draft("files")).unwrap();
        let fetched = store.get_server(created.id).unwrap();
        assert_eq!(fetched.name, "files");
        assert_eq!(fetched.kind, ServerKind::Stdio);
        assert_eq!(fetched.command.as_deref(), Some("npx"));
        assert_eq!(fetched.args.len(), 2);
        assert_eq!(fetched.env.get("TOKEN").unwrap(), "${HOME_TOKEN}");
        assert!(fetched.enabled);
    }

    #[test]
    fn test_duplicate_name_conflicts() {
        let store = store();
        store.create_server(&stdio_draft("files")).unwrap();
        let err = store.create_server(&stdio_draft("files")).unwrap_err();
        assert!(matches!(err, BrokerError::Conflict(_)));
    }

    #[test]
    fn test_validation_stdio_requires_command() {
        let store = store();
        let mut draft = stdio_draft("x");
        draft.command = None;
        assert!(matches!(
            store.create_server(&draft).unwrap_err(),
            BrokerError::Validation(_)
        ));
    }

    #[test]
    fn test_validation_sse_requires_valid_url() {
        let store = store();
        let draft = ServerDraft {
            name: "remote".to_string(),
            kind: ServerKind::Sse,
            url: Some("not a url".to_string()),
            command: None,
            args: vec![],
            headers: HashMap::new(),
            env: HashMap::new(),
            description: None,
            enabled: true,
        };
        assert!(matches!(
            store.create_server(&draft).unwrap_err(),
            BrokerError::Validation(_)
        ));
    }

    #[test]
    fn test_validation_empty_name() {
        let store = store();
        let mut draft = stdio_draft("  ");
        draft.name = "  ".to_string();
        assert!(matches!(
            store.create_server(&draft).unwrap_err(),
            BrokerError::Validation(_)
        ));
    }

    #[test]
    fn test_update_patch_semantics() {
        let store = store();
        let created = store.create_server(&stdio_draft("files")).unwrap();

        let patch = ServerPatch {
            enabled: Some(false),
            description: Some("updated".to_string()),
            ..Default::default()
        };
        let updated = store.update_server(created.id, &patch).unwrap();
        assert!(!updated.enabled);
        assert_eq!(updated.description.as_deref(), Some("updated"));
        // untouched fields survive
        assert_eq!(updated.command.as_deref(), Some("npx"));
        assert!(!created.connection_fields_differ(&updated));

        let patch = ServerPatch {
            command: Some("uvx".to_string()),
            ..Default::default()
        };
        let reconfigured = store.update_server(created.id, &patch).unwrap();
        assert!(updated.connection_fields_differ(&reconfigured));
    }

    #[test]
    fn test_list_filter_and_pagination() {
        let store = store();
        for i in 0..5 {
            let mut draft = stdio_draft(&format!("srv-{}", i));
            draft.enabled = i % 2 == 0;
            store.create_server(&draft).unwrap();
        }

        let (page, total) = store
            .list_servers(&ServerFilter::default(), 1, 2)
            .unwrap();
        assert_eq!(total, 5);
        assert_eq!(page.len(), 2);

        let (enabled_only, total) = store
            .list_servers(
                &ServerFilter {
                    enabled: Some(true),
                    kind: None,
                },
                1,
                10,
            )
            .unwrap();
        assert_eq!(total, 3);
        assert!(enabled_only.iter().all(|s| s.enabled));

        let (stdio_only, _) = store
            .list_servers(
                &ServerFilter {
                    enabled: None,
                    kind: Some(ServerKind::Stdio),
                },
                1,
                10,
            )
            .unwrap();
        assert_eq!(stdio_only.len(), 5);
    }

    #[test]
    fn test_delete_returns_record_and_404_after() {
        let store = store();
        let created = store.create_server(&stdio_draft("files")).unwrap();
        let deleted = store.delete_server(created.id).unwrap();
        assert_eq!(deleted.name, "files");
        assert!(matches!(
            store.get_server(created.id).unwrap_err(),
            BrokerError::NotFound(_)
        ));
        assert!(matches!(
            store.delete_server(created.id).unwrap_err(),
            BrokerError::NotFound(_)
        ));
    }
}
