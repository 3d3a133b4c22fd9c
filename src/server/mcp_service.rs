//! MCP façade: presents `retriever` and `executor` as MCP tools over the
//! streamable HTTP transport.
//!
//! Tool failures are reported as `isError` content blocks; the transport
//! layer itself never raises for them.

use std::sync::Arc;

use rmcp::{
    handler::server::ServerHandler,
    model::{
        CallToolRequestParam, CallToolResult, Content, ErrorData, JsonObject, ListToolsResult,
        PaginatedRequestParam, ServerCapabilities, ServerInfo, Tool,
    },
    service::RequestContext,
    transport::streamable_http_server::{
        session::local::LocalSessionManager, StreamableHttpServerConfig, StreamableHttpService,
    },
    RoleServer,
};
use serde::Deserialize;
use serde_json::Value;
use tracing::warn;

use crate::{executor::Executor, retrieval::RetrievalEngine};

pub const RETRIEVER_TOOL: &str = "retriever";
pub const EXECUTOR_TOOL: &str = "executor";

#[derive(Clone)]
pub struct BrokerMcpService {
    retrieval: Arc<RetrievalEngine>,
    executor: Arc<Executor>,
}

#[derive(Debug, Deserialize)]
struct RetrieverArgs {
    descriptions: Vec<String>,
    #[serde(rename = "sessionId", default)]
    session_id: String,
    #[serde(rename = "serverNames", default)]
    server_names: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
struct ExecutorArgs {
    md5: String,
    #[serde(default)]
    parameters: JsonObject,
}

impl BrokerMcpService {
    pub fn new(retrieval: Arc<RetrievalEngine>, executor: Arc<Executor>) -> Self {
        Self {
            retrieval,
            executor,
        }
    }

    /// Tower service for the `/mcp` endpoint. The factory hands each session
    /// a fresh handler, avoiding request-id collisions across sessions.
    pub fn streamable_http_service(&self) -> StreamableHttpService<Self, LocalSessionManager> {
        let service = self.clone();
        StreamableHttpService::new(
            move || Ok(service.clone()),
            Default::default(),
            StreamableHttpServerConfig::default(),
        )
    }

    async fn handle_retriever(&self, args: RetrieverArgs) -> CallToolResult {
        let session_id = if args.session_id.is_empty() {
            None
        } else {
            Some(args.session_id.as_str())
        };
        match self
            .retrieval
            .retrieve(&args.descriptions, session_id, args.server_names.as_deref())
            .await
        {
            Ok(result) => {
                let sid = result.session_id.clone();
                match serde_json::to_string(&result) {
                    Ok(body) => CallToolResult::success(vec![
                        Content::text(body),
                        Content::text(format!(
                            "Session ID: {}. Pass it to subsequent retriever calls so \
                             already-seen tools are not repeated.",
                            sid
                        )),
                    ]),
                    Err(e) => error_block(format!("serialize retrieval result: {}", e)),
                }
            }
            Err(e) => error_block(e.to_string()),
        }
    }

    async fn handle_executor(&self, args: ExecutorArgs) -> CallToolResult {
        match self.executor.execute(&args.md5, Some(args.parameters)).await {
            Ok(result) => {
                let upstream_error = result.is_error == Some(true);
                match serde_json::to_string(&result) {
                    Ok(body) => {
                        if upstream_error {
                            CallToolResult::error(vec![Content::text(body)])
                        } else {
                            CallToolResult::success(vec![Content::text(body)])
                        }
                    }
                    Err(e) => error_block(format!("serialize upstream result: {}", e)),
                }
            }
            Err(e) => error_block(e.to_string()),
        }
    }
}

fn error_block(message: String) -> CallToolResult {
    warn!("MCP tool call failed: {}", message);
    CallToolResult::error(vec![Content::text(message)])
}

fn parse_args<T: serde::de::DeserializeOwned>(
    arguments: Option<JsonObject>,
) -> Result<T, CallToolResult> {
    serde_json::from_value(Value::Object(arguments.unwrap_or_default()))
        .map_err(|e| error_block(format!("invalid arguments: {}", e)))
}

fn object_schema(value: Value) -> Arc<JsonObject> {
    match value {
        Value::Object(map) => Arc::new(map),
        _ => Arc::new(JsonObject::default()),
    }
}

fn retriever_tool() -> Tool {
    Tool {
        name: std::borrow::Cow::Borrowed(RETRIEVER_TOOL),
        title: Some("Retrieve tools".to_string()),
        description: Some(std::borrow::Cow::Borrowed(
            "Semantic search over the aggregated MCP tool catalog. Pass one or more \
             natural-language intent descriptions; returns matching tools with schemas. \
             Tools already shown to the session come back in compact form.",
        )),
        input_schema: object_schema(serde_json::json!({
            "type": "object",
            "properties": {
                "descriptions": {
                    "type": "array",
                    "items": { "type": "string" },
                    "minItems": 1,
                    "description": "Intent descriptions, e.g. ['read docs', 'create block']."
                },
                "sessionId": {
                    "type": "string",
                    "description": "Session id from a previous call. Pass an empty string to start a new session."
                },
                "serverNames": {
                    "type": "array",
                    "items": { "type": "string" },
                    "description": "Restrict results to these upstream servers."
                }
            },
            "required": ["descriptions", "sessionId"],
            "additionalProperties": false
        })),
        output_schema: None,
        annotations: None,
        icons: None,
    }
}

fn executor_tool() -> Tool {
    Tool {
        name: std::borrow::Cow::Borrowed(EXECUTOR_TOOL),
        title: Some("Execute tool".to_string()),
        description: Some(std::borrow::Cow::Borrowed(
            "Invoke a previously retrieved tool by its md5 identity with the given parameters. \
             Returns the upstream result as JSON.",
        )),
        input_schema: object_schema(serde_json::json!({
            "type": "object",
            "properties": {
                "md5": {
                    "type": "string",
                    "minLength": 1,
                    "description": "Tool identity as returned by the retriever."
                },
                "parameters": {
                    "type": "object",
                    "description": "Arguments matching the tool's input schema."
                }
            },
            "required": ["md5", "parameters"],
            "additionalProperties": false
        })),
        output_schema: None,
        annotations: None,
        icons: None,
    }
}

impl ServerHandler for BrokerMcpService {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            instructions: Some(
                "Tool-retrieval broker. Use 'retriever' to discover tools for an intent \
                 and 'executor' to invoke a retrieved tool by md5."
                    .to_string(),
            ),
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            ..ServerInfo::default()
        }
    }

    async fn list_tools(
        &self,
        _request: Option<PaginatedRequestParam>,
        _context: RequestContext<RoleServer>,
    ) -> Result<ListToolsResult, ErrorData> {
        Ok(ListToolsResult {
            next_cursor: None,
            tools: vec![retriever_tool(), executor_tool()],
        })
    }

    async fn call_tool(
        &self,
        request: CallToolRequestParam,
        _context: RequestContext<RoleServer>,
    ) -> Result<CallToolResult, ErrorData> {
        match request.name.as_ref() {
            RETRIEVER_TOOL => match parse_args::<RetrieverArgs>(request.arguments) {
                Ok(args) => Ok(self.handle_retriever(args).await),
                Err(block) => Ok(block),
            },
            EXECUTOR_TOOL => match parse_args::<ExecutorArgs>(request.arguments) {
                Ok(args) => Ok(self.handle_executor(args).await),
                Err(block) => Ok(block),
            },
            other => Err(ErrorData::invalid_params(
                format!("unknown tool: {}", other),
                None,
            )),
        }
    }
}
