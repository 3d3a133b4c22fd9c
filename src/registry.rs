//! Upstream registry: persisted server configs plus one live client per
//! enabled server.
//!
//! Connection failures never abort a load; a failed server is retained as a
//! disconnected slot and reconnection is attempted on the next row mutation.
//! Mutations of a single server's slot are serialized per name; reads are
//! lock-free snapshots.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use dext_mcp::{CallToolResult, JsonObject, UpstreamClient, UpstreamTool, UpstreamTransport};
use serde::Serialize;
use tracing::{error, info, warn};

use crate::{
    error::{BrokerError, BrokerResult},
    index::{display_name, tool_md5, CatalogIndexer, ToolSpec},
    store::{ServerDraft, ServerPatch, ServerRecord, ServerKind, Store},
};

/// One tool currently served by a connected upstream, with its broker-level
/// identity attached.
#[derive(Debug, Clone)]
pub struct LiveTool {
    pub server: String,
    pub display_name: String,
    pub tool_md5: String,
    pub tool: UpstreamTool,
}

/// Rendered state of one enabled server, for the first-time session preamble
/// and the REST views.
#[derive(Debug, Clone, Serialize)]
pub struct ServerOverview {
    pub name: String,
    pub description: Option<String>,
    pub tool_names: Vec<String>,
    pub connected: bool,
}

/// Read-side seam between the retrieval/executor layers and the live client
/// map.
#[async_trait]
pub trait LiveCatalog: Send + Sync {
    /// Snapshot of every tool served by currently connected upstreams.
    async fn live_tools(&self) -> Vec<LiveTool>;

    /// Invoke a tool on a connected upstream.
    async fn invoke(
        &self,
        server: &str,
        tool: &str,
        arguments: Option<JsonObject>,
    ) -> BrokerResult<CallToolResult>;

    async fn enabled_server_overview(&self) -> BrokerResult<Vec<ServerOverview>>;
}

#[derive(Clone)]
enum ClientSlot {
    Connected {
        client: Arc<UpstreamClient>,
        tools: Vec<UpstreamTool>,
    },
    Disconnected,
}

pub struct UpstreamRegistry {
    store: Arc<Store>,
    indexer: Arc<CatalogIndexer>,
    clients: DashMap<String, ClientSlot>,
    connect_locks: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
    /// False until embedding credentials are available; gates catalog
    /// indexing, never connections.
    indexing_enabled: bool,
}

impl UpstreamRegistry {
    pub fn new(store: Arc<Store>, indexer: Arc<CatalogIndexer>, indexing_enabled: bool) -> Self {
        Self {
            store,
            indexer,
            clients: DashMap::new(),
            connect_locks: DashMap::new(),
            indexing_enabled,
        }
    }

    /// Connect every enabled server and run the initial catalog refresh.
    pub async fn bootstrap(&self) -> BrokerResult<()> {
        let servers = self.store.list_all_servers()?;
        for record in servers.iter().filter(|s| s.enabled) {
            if let Err(e) = self.connect_server(record).await {
                error!("Failed to connect to server '{}': {}", record.name, e);
            }
        }
        let connected = self
            .clients
            .iter()
            .filter(|e| matches!(e.value(), ClientSlot::Connected { .. }))
            .count();
        info!(
            "Registry bootstrapped: {} enabled server(s), {} connected",
            servers.iter().filter(|s| s.enabled).count(),
            connected
        );
        self.refresh_catalog().await;
        Ok(())
    }

    /// Create a row, then connect. By default the row persists when the
    /// connection fails and the error is surfaced alongside the record;
    /// `strict` rolls the row back instead.
    pub async fn create_server(
        &self,
        draft: &ServerDraft,
        strict: bool,
    ) -> BrokerResult<(ServerRecord, Option<String>)> {
        let record = self.store.create_server(draft)?;

        let mut connect_error = None;
        if record.enabled {
            match self.connect_server(&record).await {
                Ok(()) => self.refresh_catalog().await,
                Err(e) => {
                    if strict {
                        self.remove_slot(&record.name).await;
                        self.store.delete_server(record.id)?;
                        return Err(e);
                    }
                    warn!("Server '{}' created but not connected: {}", record.name, e);
                    connect_error = Some(e.to_string());
                }
            }
        }
        Ok((record, connect_error))
    }

    /// Update a row, reconnecting when the enabled flag flips or a
    /// connection-relevant field changes.
    pub async fn update_server(&self, id: i64, patch: &ServerPatch) -> BrokerResult<ServerRecord> {
        let before = self.store.get_server(id)?;
        let after = self.store.update_server(id, patch)?;

        let name_changed = before.name != after.name;
        let reconnect = name_changed
            || before.connection_fields_differ(&after)
            || before.enabled != after.enabled;

        if name_changed {
            self.remove_slot(&before.name).await;
        }

        if after.enabled {
            if reconnect || !self.clients.contains_key(&after.name) {
                if let Err(e) = self.connect_server(&after).await {
                    warn!("Reconnect of '{}' failed: {}", after.name, e);
                }
            }
            self.refresh_catalog().await;
        } else {
            self.remove_slot(&after.name).await;
            self.sweep_stale_tools();
        }

        Ok(after)
    }

    /// Disconnect (best effort) and remove the row. A disconnect error never
    /// blocks the deletion.
    pub async fn delete_server(&self, id: i64) -> BrokerResult<ServerRecord> {
        let record = self.store.get_server(id)?;
        self.remove_slot(&record.name).await;
        let deleted = self.store.delete_server(id)?;

        match self.store.list_tools_by_server(&deleted.name) {
            Ok(rows) => {
                let ids: Vec<i64> = rows.iter().map(|r| r.id).collect();
                if let Err(e) = self.store.delete_tools_by_ids(&ids) {
                    warn!("Failed to drop indexed tools of '{}': {}", deleted.name, e);
                }
            }
            Err(e) => warn!("Failed to list indexed tools of '{}': {}", deleted.name, e),
        }

        Ok(deleted)
    }

    /// Convenience over update: flip only the enabled flag.
    pub async fn toggle_server(&self, id: i64, enabled: bool) -> BrokerResult<ServerRecord> {
        self.update_server(
            id,
            &ServerPatch {
                enabled: Some(enabled),
                ..Default::default()
            },
        )
        .await
    }

    pub fn is_connected(&self, name: &str) -> bool {
        matches!(
            self.clients.get(name).map(|s| s.value().clone()),
            Some(ClientSlot::Connected { .. })
        )
    }

    /// Walk every live client, re-list its tools, hand the set to the
    /// indexer, then drop persisted records of servers that no longer exist.
    pub async fn refresh_catalog(&self) {
        if !self.indexing_enabled {
            info!("Catalog refresh skipped: embedding credentials not configured");
            return;
        }

        let connected: Vec<(String, Arc<UpstreamClient>)> = self
            .clients
            .iter()
            .filter_map(|entry| match entry.value() {
                ClientSlot::Connected { client, .. } => {
                    Some((entry.key().clone(), Arc::clone(client)))
                }
                ClientSlot::Disconnected => None,
            })
            .collect();

        let mut specs = Vec::new();
        for (name, client) in connected {
            match client.list_tools().await {
                Ok(tools) => {
                    specs.extend(tools.iter().map(|t| ToolSpec {
                        server: name.clone(),
                        name: t.name.clone(),
                        description: t.description.clone(),
                    }));
                    self.clients.insert(
                        name,
                        ClientSlot::Connected {
                            client,
                            tools,
                        },
                    );
                }
                Err(e) => warn!("Failed to list tools from '{}': {}", name, e),
            }
        }

        self.indexer.index_tools(&specs).await;
        self.sweep_stale_tools();
    }

    /// Remove persisted tool records whose server prefix matches no existing
    /// server row.
    fn sweep_stale_tools(&self) {
        let servers: Vec<String> = match self.store.list_all_servers() {
            Ok(rows) => rows.into_iter().map(|s| s.name).collect(),
            Err(e) => {
                warn!("Stale-tool sweep skipped: {}", e);
                return;
            }
        };
        let prefixes: Vec<String> = servers.iter().map(|s| format!("{}__", s)).collect();

        match self.store.list_all_display_names() {
            Ok(rows) => {
                let stale: Vec<i64> = rows
                    .into_iter()
                    .filter(|(_, name)| !prefixes.iter().any(|p| name.starts_with(p.as_str())))
                    .map(|(id, _)| id)
                    .collect();
                if stale.is_empty() {
                    return;
                }
                match self.store.delete_tools_by_ids(&stale) {
                    Ok(n) => info!("Dropped {} stale tool record(s)", n),
                    Err(e) => warn!("Failed to drop stale tool records: {}", e),
                }
            }
            Err(e) => warn!("Stale-tool sweep skipped: {}", e),
        }
    }

    /// Tear down every live client. Used at process shutdown.
    pub async fn shutdown(&self) {
        let names: Vec<String> = self.clients.iter().map(|e| e.key().clone()).collect();
        for name in names {
            self.remove_slot(&name).await;
        }
    }

    async fn connect_server(&self, record: &ServerRecord) -> BrokerResult<()> {
        let transport = transport_from_record(record)?;
        let lock = self.lock_for(&record.name);
        let _guard = lock.lock().await;

        self.teardown_slot(&record.name).await;

        match UpstreamClient::connect(&record.name, &transport).await {
            Ok(client) => {
                let client = Arc::new(client);
                let tools = match client.list_tools().await {
                    Ok(tools) => {
                        info!("Discovered {} tool(s) from '{}'", tools.len(), record.name);
                        tools
                    }
                    Err(e) => {
                        warn!("Failed to list tools from '{}': {}", record.name, e);
                        Vec::new()
                    }
                };
                self.clients
                    .insert(record.name.clone(), ClientSlot::Connected { client, tools });
                Ok(())
            }
            Err(e) => {
                self.clients
                    .insert(record.name.clone(), ClientSlot::Disconnected);
                Err(e.into())
            }
        }
    }

    async fn remove_slot(&self, name: &str) {
        let lock = self.lock_for(name);
        let _guard = lock.lock().await;
        self.teardown_slot(name).await;
    }

    /// Caller must hold the per-name lock.
    async fn teardown_slot(&self, name: &str) {
        if let Some((_, slot)) = self.clients.remove(name) {
            if let ClientSlot::Connected { client, .. } = slot {
                match Arc::try_unwrap(client) {
                    Ok(client) => client.shutdown().await,
                    Err(_) => warn!("Client for '{}' still in use at teardown", name),
                }
            }
        }
    }

    fn lock_for(&self, name: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.connect_locks
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }
}

/// Build the transport for a validated server row. Substitution of `${VAR}`
/// placeholders happens later, at connection time.
pub fn transport_from_record(record: &ServerRecord) -> BrokerResult<UpstreamTransport> {
    match record.kind {
        ServerKind::Stdio => {
            let command = record.command.clone().ok_or_else(|| {
                BrokerError::Validation(format!("server '{}' has no command", record.name))
            })?;
            Ok(UpstreamTransport::Stdio {
                command,
                args: record.args.clone(),
                envs: record.env.clone(),
            })
        }
        ServerKind::Sse => {
            let url = record.url.clone().ok_or_else(|| {
                BrokerError::Validation(format!("server '{}' has no url", record.name))
            })?;
            Ok(UpstreamTransport::Sse {
                url,
                headers: record.headers.clone(),
            })
        }
        ServerKind::HttpStream => {
            let url = record.url.clone().ok_or_else(|| {
                BrokerError::Validation(format!("server '{}' has no url", record.name))
            })?;
            Ok(UpstreamTransport::HttpStream {
                url,
                headers: record.headers.clone(),
            })
        }
    }
}

#[async_trait]
impl LiveCatalog for UpstreamRegistry {
    async fn live_tools(&self) -> Vec<LiveTool> {
        let mut out = Vec::new();
        for entry in self.clients.iter() {
            if let ClientSlot::Connected { tools, .. } = entry.value() {
                for tool in tools {
                    let display = display_name(entry.key(), &tool.name);
                    out.push(LiveTool {
                        server: entry.key().clone(),
                        tool_md5: tool_md5(&display, &tool.description),
                        display_name: display,
                        tool: tool.clone(),
                    });
                }
            }
        }
        out
    }

    async fn invoke(
        &self,
        server: &str,
        tool: &str,
        arguments: Option<JsonObject>,
    ) -> BrokerResult<CallToolResult> {
        let slot = self
            .clients
            .get(server)
            .map(|s| s.value().clone())
            .ok_or_else(|| BrokerError::NotFound(format!("server '{}'", server)))?;

        match slot {
            ClientSlot::Connected { client, .. } => {
                Ok(client.call_tool(tool, arguments).await?)
            }
            ClientSlot::Disconnected => Err(BrokerError::Upstream(format!(
                "server '{}' is disconnected",
                server
            ))),
        }
    }

    async fn enabled_server_overview(&self) -> BrokerResult<Vec<ServerOverview>> {
        let servers = self.store.list_all_servers()?;
        Ok(servers
            .into_iter()
            .filter(|s| s.enabled)
            .map(|record| {
                let slot = self.clients.get(&record.name).map(|s| s.value().clone());
                let (connected, tool_names) = match slot {
                    Some(ClientSlot::Connected { tools, .. }) => {
                        (true, tools.iter().map(|t| t.name.clone()).collect())
                    }
                    _ => (false, Vec::new()),
                };
                ServerOverview {
                    name: record.name,
                    description: record.description,
                    tool_names,
                    connected,
                }
            })
            .collect())
    }
}
