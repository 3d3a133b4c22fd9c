//! Live client wrapper over one upstream MCP session.
//!
//! Connects per transport kind (child process, SSE, streamable HTTP),
//! with exponential-backoff retry for the network transports. A connected
//! client serves tool listing and invocation until it is shut down.

use std::time::Duration;

use backoff::ExponentialBackoffBuilder;
use rmcp::{
    model::{CallToolRequestParam, CallToolResult, JsonObject},
    service::RunningService,
    transport::{
        sse_client::SseClientConfig, streamable_http_client::StreamableHttpClientTransportConfig,
        ConfigureCommandExt, SseClientTransport, StreamableHttpClientTransport, TokioChildProcess,
    },
    RoleClient, ServiceExt,
};
use serde_json::Value;
use tracing::{info, warn};

use crate::{
    config::{resolve_transport, UpstreamTransport},
    error::{McpError, McpResult},
};

type McpSession = RunningService<RoleClient, ()>;

/// A tool as advertised by an upstream server, with schemas passed through
/// unchanged.
#[derive(Debug, Clone)]
pub struct UpstreamTool {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
    pub output_schema: Option<Value>,
}

impl From<rmcp::model::Tool> for UpstreamTool {
    fn from(tool: rmcp::model::Tool) -> Self {
        Self {
            name: tool.name.to_string(),
            description: tool
                .description
                .as_deref()
                .unwrap_or_default()
                .to_string(),
            input_schema: Value::Object((*tool.input_schema).clone()),
            output_schema: tool
                .output_schema
                .as_ref()
                .map(|schema| Value::Object((**schema).clone())),
        }
    }
}

/// One live MCP session to an upstream server.
pub struct UpstreamClient {
    name: String,
    session: McpSession,
}

impl UpstreamClient {
    /// Connect to an upstream server. Substitution of `${VAR}` placeholders
    /// happens here, once per attempt.
    pub async fn connect(name: &str, transport: &UpstreamTransport) -> McpResult<Self> {
        let resolved = resolve_transport(transport);
        let session = if resolved.is_network() {
            Self::connect_with_retry(name, &resolved).await?
        } else {
            Self::connect_impl(name, &resolved).await?
        };
        Ok(Self {
            name: name.to_string(),
            session,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// List the tools the upstream currently advertises.
    pub async fn list_tools(&self) -> McpResult<Vec<UpstreamTool>> {
        let tools = self
            .session
            .peer()
            .list_all_tools()
            .await
            .map_err(|e| McpError::Transport(format!("list tools on '{}': {}", self.name, e)))?;
        Ok(tools.into_iter().map(UpstreamTool::from).collect())
    }

    /// Invoke a tool by its upstream name. The upstream's result (including
    /// its error flag) is returned verbatim.
    pub async fn call_tool(
        &self,
        tool_name: &str,
        arguments: Option<JsonObject>,
    ) -> McpResult<CallToolResult> {
        let request = CallToolRequestParam {
            name: std::borrow::Cow::Owned(tool_name.to_string()),
            arguments,
        };
        self.session
            .call_tool(request)
            .await
            .map_err(|e| McpError::ToolExecution(format!("call '{}': {}", tool_name, e)))
    }

    /// Tear down the session. Errors are logged, not surfaced: a dead
    /// transport cannot be made deader.
    pub async fn shutdown(self) {
        if let Err(e) = self.session.cancel().await {
            warn!("Error disconnecting from '{}': {}", self.name, e);
        }
    }

    async fn connect_with_retry(
        name: &str,
        transport: &UpstreamTransport,
    ) -> McpResult<McpSession> {
        let backoff = ExponentialBackoffBuilder::new()
            .with_initial_interval(Duration::from_secs(1))
            .with_max_interval(Duration::from_secs(30))
            .with_max_elapsed_time(Some(Duration::from_secs(30)))
            .build();

        backoff::future::retry(backoff, || async {
            match Self::connect_impl(name, transport).await {
                Ok(session) => Ok(session),
                Err(e) => {
                    if Self::is_permanent_error(&e) {
                        warn!("Permanent error connecting to '{}': {} - not retrying", name, e);
                        Err(backoff::Error::permanent(e))
                    } else {
                        warn!("Failed to connect to '{}', retrying: {}", name, e);
                        Err(backoff::Error::transient(e))
                    }
                }
            }
        })
        .await
    }

    fn is_permanent_error(error: &McpError) -> bool {
        match error {
            McpError::Config(_) => true,
            McpError::Transport(_) => true,
            McpError::ConnectionFailed(msg) => {
                msg.contains("initialize")
                    || msg.contains("connection closed")
                    || msg.contains("connection refused")
                    || msg.contains("invalid URL")
                    || msg.contains("not found")
            }
            _ => false,
        }
    }

    async fn connect_impl(name: &str, transport: &UpstreamTransport) -> McpResult<McpSession> {
        info!("Connecting to MCP server '{}' via {}", name, transport.kind_name());

        match transport {
            UpstreamTransport::Stdio {
                command,
                args,
                envs,
            } => {
                let child = TokioChildProcess::new(
                    tokio::process::Command::new(command).configure(|cmd| {
                        cmd.args(args)
                            .envs(envs.iter())
                            .stderr(std::process::Stdio::inherit());
                    }),
                )
                .map_err(|e| McpError::Transport(format!("create stdio transport: {}", e)))?;

                let session = ().serve(child).await.map_err(|e| {
                    McpError::ConnectionFailed(format!("initialize stdio client: {}", e))
                })?;

                info!("Connected to stdio server '{}'", name);
                Ok(session)
            }

            UpstreamTransport::Sse { url, headers } => {
                let client = Self::build_http_client(headers)?;
                let cfg = SseClientConfig {
                    sse_endpoint: url.clone().into(),
                    ..Default::default()
                };

                let transport = SseClientTransport::start_with_client(client, cfg)
                    .await
                    .map_err(|e| McpError::Transport(format!("create SSE transport: {}", e)))?;

                let session = ().serve(transport).await.map_err(|e| {
                    McpError::ConnectionFailed(format!("initialize SSE client: {}", e))
                })?;

                info!("Connected to SSE server '{}' at {}", name, url);
                Ok(session)
            }

            UpstreamTransport::HttpStream { url, headers } => {
                // The streamable HTTP transport only carries an auth header.
                let unsupported: Vec<&str> = headers
                    .keys()
                    .filter(|k| !k.eq_ignore_ascii_case("authorization"))
                    .map(String::as_str)
                    .collect();
                if !unsupported.is_empty() {
                    warn!(
                        "Headers {:?} are not supported for streamable HTTP on server '{}'",
                        unsupported, name
                    );
                }

                let auth = headers
                    .iter()
                    .find(|(k, _)| k.eq_ignore_ascii_case("authorization"))
                    .map(|(_, v)| v.clone());

                let transport = if let Some(auth) = auth {
                    let mut cfg = StreamableHttpClientTransportConfig::with_uri(url.as_str());
                    cfg.auth_header = Some(auth);
                    StreamableHttpClientTransport::from_config(cfg)
                } else {
                    StreamableHttpClientTransport::from_uri(url.as_str())
                };

                let session = ().serve(transport).await.map_err(|e| {
                    McpError::ConnectionFailed(format!("initialize streamable client: {}", e))
                })?;

                info!("Connected to streamable HTTP server '{}' at {}", name, url);
                Ok(session)
            }
        }
    }

    fn build_http_client(
        headers: &std::collections::HashMap<String, String>,
    ) -> McpResult<reqwest::Client> {
        let mut builder = reqwest::Client::builder().connect_timeout(Duration::from_secs(10));

        if !headers.is_empty() {
            let mut header_map = reqwest::header::HeaderMap::new();
            for (key, value) in headers {
                let header_name = reqwest::header::HeaderName::from_bytes(key.as_bytes())
                    .map_err(|e| McpError::Config(format!("header name '{}': {}", key, e)))?;
                let header_value = reqwest::header::HeaderValue::from_str(value)
                    .map_err(|e| McpError::Config(format!("header value for '{}': {}", key, e)))?;
                header_map.insert(header_name, header_value);
            }
            builder = builder.default_headers(header_map);
        }

        builder
            .build()
            .map_err(|e| McpError::Transport(format!("build HTTP client: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn test_upstream_tool_from_rmcp() {
        let mut schema = rmcp::model::JsonObject::new();
        schema.insert("type".to_string(), Value::String("object".to_string()));
        let tool = rmcp::model::Tool {
            name: std::borrow::Cow::Borrowed("create_page"),
            title: None,
            description: Some(std::borrow::Cow::Borrowed("Create a page")),
            input_schema: std::sync::Arc::new(schema),
            output_schema: None,
            annotations: None,
            icons: None,
        };

        let upstream = UpstreamTool::from(tool);
        assert_eq!(upstream.name, "create_page");
        assert_eq!(upstream.description, "Create a page");
        assert_eq!(upstream.input_schema["type"], "object");
        assert!(upstream.output_schema.is_none());
    }

    #[test]
    fn test_upstream_tool_missing_description_is_empty() {
        let tool = rmcp::model::Tool {
            name: std::borrow::Cow::Borrowed("t"),
            title: None,
            description: None,
            input_schema: std::sync::Arc::new(rmcp::model::JsonObject::new()),
            output_schema: None,
            annotations: None,
            icons: None,
        };
        assert_eq!(UpstreamTool::from(tool).description, "");
    }

    #[test]
    fn test_build_http_client_rejects_bad_header_name() {
        let headers = HashMap::from([("bad header".to_string(), "v".to_string())]);
        assert!(matches!(
            UpstreamClient::build_http_client(&headers),
            Err(McpError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_connect_stdio_missing_command_fails() {
        let transport = UpstreamTransport::Stdio {
            command: "definitely-not-a-real-binary-xyz".to_string(),
            args: vec![],
            envs: HashMap::new(),
        };
        let result = UpstreamClient::connect("ghost", &transport).await;
        assert!(result.is_err());
    }
}
