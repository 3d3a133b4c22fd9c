//! Shared stubs for module tests: a deterministic embedder and a canned
//! live catalog.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use dext_mcp::{CallToolResult, Content, JsonObject, UpstreamTool};
use parking_lot::Mutex;
use serde_json::json;

use crate::{
    embedding::Embedder,
    error::{BrokerError, BrokerResult},
    index::{display_name, tool_md5},
    registry::{LiveCatalog, LiveTool, ServerOverview},
};

/// Deterministic embedder: hash-derived vectors by default, exact vectors on
/// request, optional per-text failures.
pub(crate) struct StubEmbedder {
    dimension: usize,
    fixed: Mutex<HashMap<String, Vec<f32>>>,
    failing: Mutex<HashSet<String>>,
}

impl StubEmbedder {
    pub fn new(dimension: usize) -> Arc<Self> {
        Arc::new(Self {
            dimension,
            fixed: Mutex::new(HashMap::new()),
            failing: Mutex::new(HashSet::new()),
        })
    }

    pub fn set_vector(&self, text: &str, vector: Vec<f32>) {
        assert_eq!(vector.len(), self.dimension);
        self.fixed.lock().insert(text.to_string(), vector);
    }

    pub fn fail_on(&self, text: &str) {
        self.failing.lock().insert(text.to_string());
    }

    /// The vector `embed` would produce for this text.
    pub fn vector_for(&self, text: &str) -> Vec<f32> {
        if let Some(v) = self.fixed.lock().get(text) {
            return v.clone();
        }
        hash_vector(text, self.dimension)
    }
}

fn hash_vector(text: &str, dim: usize) -> Vec<f32> {
    let mut state: u64 = 0xcbf2_9ce4_8422_2325;
    for b in text.as_bytes() {
        state = (state ^ u64::from(*b)).wrapping_mul(0x0000_0100_0000_01b3);
    }
    (0..dim)
        .map(|_| {
            state = state
                .wrapping_mul(6_364_136_223_846_793_005)
                .wrapping_add(1_442_695_040_888_963_407);
            (((state >> 11) as f64 / (1u64 << 53) as f64) * 2.0 - 1.0) as f32
        })
        .collect()
}

#[async_trait]
impl Embedder for StubEmbedder {
    fn model_name(&self) -> &str {
        "stub-embedding"
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn embed(&self, texts: &[String]) -> BrokerResult<Vec<Vec<f32>>> {
        let failing = self.failing.lock();
        let mut out = Vec::with_capacity(texts.len());
        for text in texts {
            if failing.contains(text) {
                return Err(BrokerError::Upstream(format!("stub refuses '{}'", text)));
            }
            out.push(self.vector_for(text));
        }
        Ok(out)
    }
}

/// Build a live tool entry the way the registry would.
pub(crate) fn live_tool(server: &str, name: &str, description: &str) -> LiveTool {
    let display = display_name(server, name);
    LiveTool {
        server: server.to_string(),
        tool_md5: tool_md5(&display, description),
        display_name: display,
        tool: UpstreamTool {
            name: name.to_string(),
            description: description.to_string(),
            input_schema: json!({"type": "object", "properties": {}}),
            output_schema: None,
        },
    }
}

/// Canned live catalog with scripted invocation results.
pub(crate) struct StubCatalog {
    pub tools: Vec<LiveTool>,
    pub overview: Vec<ServerOverview>,
    responses: Mutex<HashMap<String, String>>,
    pub invocations: Mutex<Vec<(String, String, Option<JsonObject>)>>,
}

impl StubCatalog {
    pub fn new(tools: Vec<LiveTool>) -> Arc<Self> {
        let mut by_server: HashMap<String, Vec<String>> = HashMap::new();
        for t in &tools {
            by_server
                .entry(t.server.clone())
                .or_default()
                .push(t.tool.name.clone());
        }
        let mut overview: Vec<ServerOverview> = by_server
            .into_iter()
            .map(|(name, tool_names)| ServerOverview {
                name,
                description: None,
                tool_names,
                connected: true,
            })
            .collect();
        overview.sort_by(|a, b| a.name.cmp(&b.name));

        Arc::new(Self {
            tools,
            overview,
            responses: Mutex::new(HashMap::new()),
            invocations: Mutex::new(Vec::new()),
        })
    }

    pub fn set_response(&self, server: &str, tool: &str, text: &str) {
        self.responses
            .lock()
            .insert(format!("{}/{}", server, tool), text.to_string());
    }
}

#[async_trait]
impl LiveCatalog for StubCatalog {
    async fn live_tools(&self) -> Vec<LiveTool> {
        self.tools.clone()
    }

    async fn invoke(
        &self,
        server: &str,
        tool: &str,
        arguments: Option<JsonObject>,
    ) -> BrokerResult<CallToolResult> {
        self.invocations
            .lock()
            .push((server.to_string(), tool.to_string(), arguments));
        let key = format!("{}/{}", server, tool);
        match self.responses.lock().get(&key) {
            Some(text) => Ok(CallToolResult::success(vec![Content::text(text.clone())])),
            None => Err(BrokerError::Upstream(format!("no scripted response for {}", key))),
        }
    }

    async fn enabled_server_overview(&self) -> BrokerResult<Vec<ServerOverview>> {
        Ok(self.overview.clone())
    }
}
