//! Upstream MCP client layer for the dext broker.
//!
//! ## Modules
//!
//! - [`config`]: transport configuration and `${VAR}` environment substitution
//! - [`client`]: live client wrapper over an MCP session (stdio/SSE/streamable HTTP)
//! - [`error`]: error variants for upstream operations

pub mod client;
pub mod config;
pub mod error;

pub use client::{UpstreamClient, UpstreamTool};
pub use config::{resolve_transport, substitute_env, UpstreamTransport};
pub use error::{McpError, McpResult};

// Re-export the wire types that cross the crate boundary so the broker does
// not need to track the rmcp version on its own.
pub use rmcp::model::{CallToolResult, Content, JsonObject};
