//! Catalog indexer: stable tool identity, incremental embedding, and
//! near-duplicate replacement.
//!
//! Identity is content-derived: `display_name = "{server}__{name}"` and
//! `tool_md5 = md5(display_name + description)` with both parts trimmed.
//! Re-running the indexer over an unchanged catalog performs zero writes.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::{
    embedding::Embedder,
    error::BrokerResult,
    store::{normalize, Store},
};

/// Probe size for the near-duplicate check.
const NEAR_DUP_PROBE_TOP_K: usize = 10;
/// Probe floor for the near-duplicate check.
const NEAR_DUP_PROBE_THRESHOLD: f64 = 0.70;
/// Cosine similarity at or above which an existing tool is superseded.
pub const NEAR_DUP_REPLACE_SIMILARITY: f64 = 0.96;

/// Public identifier of a tool: `{serverName}__{upstreamToolName}`.
pub fn display_name(server: &str, tool_name: &str) -> String {
    format!("{}__{}", server, tool_name)
}

/// Content hash identifying a tool. Surrounding whitespace of each part is
/// ignored, so a description that merely gains a trailing space keeps its
/// identity.
pub fn tool_md5(display_name: &str, description: &str) -> String {
    let digest = md5::compute(format!("{}{}", display_name.trim(), description.trim()));
    format!("{:x}", digest)
}

/// The text fed to the embedder for a tool.
pub fn embedding_text(display_name: &str, description: &str) -> String {
    format!("{} {}", display_name, description).trim().to_string()
}

/// One upstream tool as handed over by the registry.
#[derive(Debug, Clone)]
pub struct ToolSpec {
    pub server: String,
    pub name: String,
    pub description: String,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct IndexReport {
    pub indexed: usize,
    pub skipped: usize,
    pub replaced: usize,
    pub failed: usize,
}

enum IndexOutcome {
    Inserted { replaced: usize },
    Skipped,
}

pub struct CatalogIndexer {
    store: Arc<Store>,
    embedder: Arc<dyn Embedder>,
    /// Serializes insertions so two concurrent inserts cannot both see each
    /// other as absent.
    insert_lock: tokio::sync::Mutex<()>,
}

impl CatalogIndexer {
    pub fn new(store: Arc<Store>, embedder: Arc<dyn Embedder>) -> Self {
        Self {
            store,
            embedder,
            insert_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn model_name(&self) -> &str {
        self.embedder.model_name()
    }

    /// Index a batch sequentially. A failing tool aborts only itself.
    pub async fn index_tools(&self, tools: &[ToolSpec]) -> IndexReport {
        let mut report = IndexReport::default();
        for spec in tools {
            match self.index_one(spec).await {
                Ok(IndexOutcome::Inserted { replaced }) => {
                    report.indexed += 1;
                    report.replaced += replaced;
                }
                Ok(IndexOutcome::Skipped) => report.skipped += 1,
                Err(e) => {
                    warn!(
                        "Failed to index tool '{}__{}': {}",
                        spec.server, spec.name, e
                    );
                    report.failed += 1;
                }
            }
        }
        if report.indexed > 0 || report.replaced > 0 {
            info!(
                "Indexed {} tool(s) ({} skipped, {} superseded, {} failed)",
                report.indexed, report.skipped, report.replaced, report.failed
            );
        }
        report
    }

    async fn index_one(&self, spec: &ToolSpec) -> BrokerResult<IndexOutcome> {
        let tool_display = display_name(&spec.server, &spec.name);
        let md5_hex = tool_md5(&tool_display, &spec.description);
        let model = self.embedder.model_name().to_string();

        if self.store.tool_exists(&md5_hex, &model)? {
            return Ok(IndexOutcome::Skipped);
        }

        let mut vector = self
            .embedder
            .embed_one(&embedding_text(&tool_display, &spec.description))
            .await?;
        normalize(&mut vector);

        let _guard = self.insert_lock.lock().await;
        if self.store.tool_exists(&md5_hex, &model)? {
            return Ok(IndexOutcome::Skipped);
        }

        // Supersede stale variants of the same tool before inserting. The
        // deletion runs in its own transaction; failures are non-fatal.
        let mut replaced = 0;
        match self
            .store
            .search_similar(&vector, NEAR_DUP_PROBE_TOP_K, NEAR_DUP_PROBE_THRESHOLD, None)
        {
            Ok(hits) => {
                for hit in hits {
                    if hit.similarity < NEAR_DUP_REPLACE_SIMILARITY {
                        continue;
                    }
                    debug!(
                        "Tool '{}' supersedes '{}' (similarity {:.4})",
                        tool_display, hit.display_name, hit.similarity
                    );
                    match self.store.delete_tool_by_md5(&hit.tool_md5, Some(&model)) {
                        Ok(n) => replaced += n,
                        Err(e) => {
                            warn!("Failed to delete superseded tool '{}': {}", hit.display_name, e)
                        }
                    }
                }
            }
            Err(e) => warn!("Near-duplicate probe failed for '{}': {}", tool_display, e),
        }

        self.store
            .upsert_tool_with_vector(&tool_display, &spec.description, &md5_hex, &model, &vector)?;
        Ok(IndexOutcome::Inserted { replaced })
    }

    /// Wipe every vector, mapping, and record for this model.
    pub fn clear(&self) -> BrokerResult<usize> {
        self.store.clear_index(self.embedder.model_name())
    }
}
