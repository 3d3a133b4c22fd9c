//! Retrieval engine: embeds intent descriptions, ranks indexed tools, and
//! filters out tools the session has already been shown.
//!
//! Session history makes retrieval monotonic: once a tool has been surfaced
//! to a session it reappears only in the compact `known_tools` form.

use std::collections::HashSet;
use std::sync::Arc;

use rand::Rng;
use serde::Serialize;
use serde_json::Value;

use crate::{
    embedding::Embedder,
    error::{BrokerError, BrokerResult},
    registry::LiveCatalog,
    store::{normalize, Store},
};

const SESSION_ID_LEN: usize = 6;
const SESSION_ID_CHARS: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

/// Six lowercase alphanumeric characters.
pub fn generate_session_id() -> String {
    let mut rng = rand::rng();
    (0..SESSION_ID_LEN)
        .map(|_| SESSION_ID_CHARS[rng.random_range(0..SESSION_ID_CHARS.len())] as char)
        .collect()
}

#[derive(Debug, Clone, Serialize)]
pub struct NewToolHit {
    pub rank: usize,
    pub tool_name: String,
    pub md5: String,
    pub description: String,
    pub similarity: f64,
    /// Input schema of the live tool, serialized to a JSON string.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_schema: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_schema: Option<Value>,
}

#[derive(Debug, Clone, Serialize)]
pub struct KnownToolHit {
    pub rank: usize,
    pub tool_name: String,
    pub md5: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueryTools<T> {
    pub query_index: usize,
    pub query: String,
    pub tools: Vec<T>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RetrievalSummary {
    pub new_tools_count: usize,
    pub known_tools_count: usize,
    pub session_history_count: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct RetrievalResult {
    pub session_id: String,
    pub new_tools: Vec<QueryTools<NewToolHit>>,
    pub known_tools: Vec<QueryTools<KnownToolHit>>,
    pub summary: RetrievalSummary,
    /// Present only on the first retrieval of a session.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_description: Option<String>,
}

pub struct RetrievalEngine {
    store: Arc<Store>,
    embedder: Arc<dyn Embedder>,
    catalog: Arc<dyn LiveCatalog>,
    top_k: usize,
    threshold: f64,
}

impl RetrievalEngine {
    pub fn new(
        store: Arc<Store>,
        embedder: Arc<dyn Embedder>,
        catalog: Arc<dyn LiveCatalog>,
        top_k: usize,
        threshold: f64,
    ) -> Self {
        Self {
            store,
            embedder,
            catalog,
            top_k,
            threshold,
        }
    }

    pub async fn retrieve(
        &self,
        descriptions: &[String],
        session_id: Option<&str>,
        server_names: Option<&[String]>,
    ) -> BrokerResult<RetrievalResult> {
        if descriptions.is_empty() {
            return Err(BrokerError::Validation(
                "descriptions must not be empty".into(),
            ));
        }
        if descriptions.iter().any(|d| d.trim().is_empty()) {
            return Err(BrokerError::Validation(
                "descriptions must not contain empty strings".into(),
            ));
        }

        // A supplied id is only honored when it has history; otherwise the
        // caller gets a fresh session and the server overview.
        let supplied = session_id.map(str::trim).filter(|s| !s.is_empty());
        let (sid, first_time, known_set) = match supplied {
            Some(sid) => {
                let history = self.store.get_session_history(sid)?;
                if history.is_empty() {
                    (generate_session_id(), true, HashSet::new())
                } else {
                    let known: HashSet<String> =
                        history.into_iter().map(|e| e.tool_md5).collect();
                    (sid.to_string(), false, known)
                }
            }
            None => (generate_session_id(), true, HashSet::new()),
        };

        // Live schemas are resolved once per call by tool identity.
        let live_by_md5: std::collections::HashMap<String, (Option<String>, Option<Value>)> = self
            .catalog
            .live_tools()
            .await
            .into_iter()
            .map(|t| {
                (
                    t.tool_md5,
                    (
                        serde_json::to_string(&t.tool.input_schema).ok(),
                        t.tool.output_schema,
                    ),
                )
            })
            .collect();

        let mut new_tools = Vec::new();
        let mut known_tools = Vec::new();
        let mut to_record: Vec<(String, String)> = Vec::new();
        let mut new_count = 0;
        let mut known_count = 0;

        for (query_index, description) in descriptions.iter().enumerate() {
            let mut query = self.embedder.embed_one(description).await?;
            normalize(&mut query);

            let candidates =
                self.store
                    .search_similar(&query, self.top_k, self.threshold, server_names)?;
            if candidates.is_empty() {
                continue;
            }

            let mut new_for_query = Vec::new();
            let mut known_for_query = Vec::new();
            for (i, hit) in candidates.iter().enumerate() {
                let rank = i + 1;
                if known_set.contains(&hit.tool_md5) {
                    known_for_query.push(KnownToolHit {
                        rank,
                        tool_name: hit.display_name.clone(),
                        md5: hit.tool_md5.clone(),
                    });
                } else {
                    let (input_schema, output_schema) = live_by_md5
                        .get(&hit.tool_md5)
                        .cloned()
                        .unwrap_or((None, None));
                    new_for_query.push(NewToolHit {
                        rank,
                        tool_name: hit.display_name.clone(),
                        md5: hit.tool_md5.clone(),
                        description: hit.description.clone(),
                        similarity: round4(hit.similarity),
                        input_schema,
                        output_schema,
                    });
                    to_record.push((hit.tool_md5.clone(), hit.display_name.clone()));
                }
            }

            new_count += new_for_query.len();
            known_count += known_for_query.len();
            if !new_for_query.is_empty() {
                new_tools.push(QueryTools {
                    query_index,
                    query: description.clone(),
                    tools: new_for_query,
                });
            }
            if !known_for_query.is_empty() {
                known_tools.push(QueryTools {
                    query_index,
                    query: description.clone(),
                    tools: known_for_query,
                });
            }
        }

        self.store.record_retrieved_batch(&sid, &to_record)?;
        let history_count = self.store.session_stats(&sid)?.tool_count;

        let server_description = if first_time {
            Some(self.render_server_description().await?)
        } else {
            None
        };

        Ok(RetrievalResult {
            session_id: sid,
            new_tools,
            known_tools,
            summary: RetrievalSummary {
                new_tools_count: new_count,
                known_tools_count: known_count,
                session_history_count: history_count,
            },
            server_description,
        })
    }

    async fn render_server_description(&self) -> BrokerResult<String> {
        let overview = self.catalog.enabled_server_overview().await?;
        let mut out = String::from("MCP servers aggregated by this broker:\n");
        if overview.is_empty() {
            out.push_str("- (no servers currently enabled)\n");
        }
        for server in overview {
            let tools = if server.tool_names.is_empty() {
                "no tools listed".to_string()
            } else {
                server.tool_names.join(", ")
            };
            match server.description {
                Some(desc) if !desc.is_empty() => {
                    out.push_str(&format!("- {} ({}): {}\n", server.name, desc, tools))
                }
                _ => out.push_str(&format!("- {}: {}\n", server.name, tools)),
            }
        }
        out.push_str(
            "Do not call these servers directly. Use the retriever tool to discover \
             relevant tools for an intent, then the executor tool to invoke a tool by its md5.",
        );
        Ok(out)
    }
}

fn round4(value: f64) -> f64 {
    (value * 10_000.0).round() / 10_000.0
}
