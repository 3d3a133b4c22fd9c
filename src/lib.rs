//! dext: a tool-retrieval broker between language-model agents and a fleet
//! of upstream MCP servers.
//!
//! The broker aggregates upstream tool catalogs into a persistent vector
//! index and exposes two MCP tools: semantic `retriever` over the catalog
//! and `executor` proxying of a chosen tool call. A session memory keeps
//! already-surfaced tools from being repeated.
//!
//! ## Modules
//!
//! - [`store`]: SQLite persistence (servers, tool records, vectors, sessions)
//! - [`embedding`]: embedder client for an OpenAI-compatible endpoint
//! - [`index`]: catalog indexer with stable identity and near-dup replacement
//! - [`registry`]: upstream server CRUD and live client lifecycle
//! - [`retrieval`]: ranking plus session deduplication
//! - [`executor`]: md5-to-live-tool resolution and invocation
//! - [`server`]: axum REST surface and the MCP streamable HTTP façade

pub mod config;
pub mod embedding;
pub mod error;
pub mod executor;
pub mod index;
pub mod registry;
pub mod retrieval;
pub mod server;
pub mod store;

#[cfg(test)]
pub(crate) mod test_support;

pub use config::{BrokerConfig, Cli};
pub use error::{BrokerError, BrokerResult};
