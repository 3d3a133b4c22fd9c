//! Upstream transport configuration.
//!
//! A transport describes how the broker reaches one upstream MCP server.
//! Header and environment values support `${VAR}` / `${VAR:default}`
//! substitution against the broker's own environment, resolved once at
//! connection time.

use std::collections::HashMap;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

pub use rmcp::model::Tool;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "protocol", rename_all = "snake_case")]
pub enum UpstreamTransport {
    Stdio {
        command: String,
        #[serde(default)]
        args: Vec<String>,
        /// Merged into the child's inherited environment.
        #[serde(default)]
        envs: HashMap<String, String>,
    },
    Sse {
        url: String,
        #[serde(default)]
        headers: HashMap<String, String>,
    },
    HttpStream {
        url: String,
        #[serde(default)]
        headers: HashMap<String, String>,
    },
}

impl UpstreamTransport {
    /// True for transports that speak to a remote endpoint and warrant
    /// connection retry with backoff.
    pub fn is_network(&self) -> bool {
        matches!(
            self,
            UpstreamTransport::Sse { .. } | UpstreamTransport::HttpStream { .. }
        )
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            UpstreamTransport::Stdio { .. } => "stdio",
            UpstreamTransport::Sse { .. } => "sse",
            UpstreamTransport::HttpStream { .. } => "http_stream",
        }
    }
}

static ENV_VAR_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)(?::([^}]*))?\}").unwrap());

/// Expand `${VAR}` and `${VAR:default}` placeholders from the process
/// environment. An unset variable without a default expands to the empty
/// string.
pub fn substitute_env(input: &str) -> String {
    ENV_VAR_RE
        .replace_all(input, |caps: &regex::Captures<'_>| {
            match std::env::var(&caps[1]) {
                Ok(value) => value,
                Err(_) => caps.get(2).map(|m| m.as_str().to_string()).unwrap_or_default(),
            }
        })
        .into_owned()
}

fn substitute_map(map: &HashMap<String, String>) -> HashMap<String, String> {
    map.iter()
        .map(|(k, v)| (k.clone(), substitute_env(v)))
        .collect()
}

/// Produce a copy of the transport with all substitutions applied.
/// Called once per connection attempt so later environment changes are
/// picked up on reconnect.
pub fn resolve_transport(transport: &UpstreamTransport) -> UpstreamTransport {
    match transport {
        UpstreamTransport::Stdio {
            command,
            args,
            envs,
        } => UpstreamTransport::Stdio {
            command: substitute_env(command),
            args: args.iter().map(|a| substitute_env(a)).collect(),
            envs: substitute_map(envs),
        },
        UpstreamTransport::Sse { url, headers } => UpstreamTransport::Sse {
            url: substitute_env(url),
            headers: substitute_map(headers),
        },
        UpstreamTransport::HttpStream { url, headers } => UpstreamTransport::HttpStream {
            url: substitute_env(url),
            headers: substitute_map(headers),
        },
    }
}
