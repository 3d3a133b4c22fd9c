//! Broker configuration: CLI flags plus recognized environment variables.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use crate::embedding::EmbeddingConfig;

/// Default retrieval fan-out per query description.
pub const DEFAULT_TOP_K: usize = 5;
/// Default similarity floor for retrieval candidates.
pub const DEFAULT_THRESHOLD: f64 = 0.10;
/// Default executor deadline, resettable via `DEXT_EXECUTOR_TIMEOUT_SECS`.
pub const DEFAULT_EXECUTOR_TIMEOUT_SECS: u64 = 300;
/// Hard cap on the executor deadline.
pub const MAX_EXECUTOR_TIMEOUT_SECS: u64 = 600;

#[derive(Parser, Debug, Clone)]
#[command(name = "dext", version, about = "Tool-retrieval broker for MCP servers")]
pub struct Cli {
    /// Bind address for the MCP + REST listener.
    #[arg(long, default_value = "0.0.0.0")]
    pub host: String,

    /// Port for the MCP + REST listener.
    #[arg(long, env = "MCP_SERVER_PORT", default_value_t = 3200)]
    pub port: u16,

    /// Port reserved for upstream OAuth callbacks (flows handled externally).
    #[arg(long, env = "MCP_CALLBACK_PORT", default_value_t = 3201)]
    pub callback_port: u16,

    /// Override the database file location.
    #[arg(long, env = "DEXT_DB_PATH")]
    pub db_path: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
    pub callback_port: u16,
    pub db_path: PathBuf,
    pub embedding: EmbeddingConfig,
    pub top_k: usize,
    pub threshold: f64,
    pub auth_token: Option<String>,
    pub executor_timeout: Duration,
}

impl BrokerConfig {
    pub fn from_cli(cli: Cli) -> Self {
        let db_path = cli.db_path.unwrap_or_else(Self::default_db_path);
        Self {
            host: cli.host,
            port: cli.port,
            callback_port: cli.callback_port,
            db_path,
            embedding: EmbeddingConfig::from_env(),
            top_k: env_parse("TOOL_RETRIEVER_TOP_K", DEFAULT_TOP_K),
            threshold: env_parse("TOOL_RETRIEVER_THRESHOLD", DEFAULT_THRESHOLD),
            auth_token: std::env::var("DEXT_AUTH_TOKEN").ok().filter(|t| !t.is_empty()),
            executor_timeout: Duration::from_secs(
                env_parse("DEXT_EXECUTOR_TIMEOUT_SECS", DEFAULT_EXECUTOR_TIMEOUT_SECS)
                    .min(MAX_EXECUTOR_TIMEOUT_SECS),
            ),
        }
    }

    /// `$HOME/.dext/tools_vector.db`, the single-file database location.
    pub fn default_db_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".dext")
            .join("tools_vector.db")
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use serial_test::serial;

    use super::*;

    fn base_cli() -> Cli {
        Cli {
            host: "127.0.0.1".to_string(),
            port: 3200,
            callback_port: 3201,
            db_path: Some(PathBuf::from("/tmp/dext-test.db")),
        }
    }

    #[test]
    #[serial]
    fn test_defaults_without_env() {
        std::env::remove_var("TOOL_RETRIEVER_TOP_K");
        std::env::remove_var("TOOL_RETRIEVER_THRESHOLD");
        std::env::remove_var("DEXT_EXECUTOR_TIMEOUT_SECS");
        std::env::remove_var("DEXT_AUTH_TOKEN");

        let config = BrokerConfig::from_cli(base_cli());
        assert_eq!(config.top_k, DEFAULT_TOP_K);
        assert_eq!(config.threshold, DEFAULT_THRESHOLD);
        assert_eq!(
            config.executor_timeout,
            Duration::from_secs(DEFAULT_EXECUTOR_TIMEOUT_SECS)
        );
        assert!(config.auth_token.is_none());
    }

    #[test]
    #[serial]
    fn test_env_overrides() {
        std::env::set_var("TOOL_RETRIEVER_TOP_K", "12");
        std::env::set_var("TOOL_RETRIEVER_THRESHOLD", "0.35");

        let config = BrokerConfig::from_cli(base_cli());
        assert_eq!(config.top_k, 12);
        assert!((config.threshold - 0.35).abs() < 1e-9);

        std::env::remove_var("TOOL_RETRIEVER_TOP_K");
        std::env::remove_var("TOOL_RETRIEVER_THRESHOLD");
    }

    #[test]
    #[serial]
    fn test_executor_timeout_hard_cap() {
        std::env::set_var("DEXT_EXECUTOR_TIMEOUT_SECS", "10000");
        let config = BrokerConfig::from_cli(base_cli());
        assert_eq!(
            config.executor_timeout,
            Duration::from_secs(MAX_EXECUTOR_TIMEOUT_SECS)
        );
        std::env::remove_var("DEXT_EXECUTOR_TIMEOUT_SECS");
    }

    #[test]
    #[serial]
    fn test_malformed_env_falls_back_to_default() {
        std::env::set_var("TOOL_RETRIEVER_TOP_K", "not-a-number");
        let config = BrokerConfig::from_cli(base_cli());
        assert_eq!(config.top_k, DEFAULT_TOP_K);
        std::env::remove_var("TOOL_RETRIEVER_TOP_K");
    }
}
