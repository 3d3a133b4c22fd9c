//! Executor: resolves a tool identity against the live catalog and proxies
//! the call to the owning upstream.
//!
//! The persisted catalog is never consulted here; it may lag behind live
//! state, and only a live tool can be invoked.

use std::sync::Arc;
use std::time::Duration;

use dext_mcp::{CallToolResult, JsonObject};
use tracing::debug;

use crate::{
    error::{BrokerError, BrokerResult},
    registry::LiveCatalog,
};

pub struct Executor {
    catalog: Arc<dyn LiveCatalog>,
    timeout: Duration,
}

impl Executor {
    pub fn new(catalog: Arc<dyn LiveCatalog>, timeout: Duration) -> Self {
        Self { catalog, timeout }
    }

    /// Invoke the live tool whose recomputed identity matches `tool_md5`.
    /// The upstream's result, including its error flag, is passed through
    /// verbatim.
    pub async fn execute(
        &self,
        tool_md5: &str,
        arguments: Option<JsonObject>,
    ) -> BrokerResult<CallToolResult> {
        let wanted = tool_md5.trim().to_ascii_lowercase();
        if wanted.is_empty() {
            return Err(BrokerError::Validation("md5 must not be empty".into()));
        }

        let target = self
            .catalog
            .live_tools()
            .await
            .into_iter()
            .find(|t| t.tool_md5 == wanted)
            .ok_or_else(|| {
                BrokerError::NotFound(format!("no live tool with md5 {}", wanted))
            })?;

        debug!(
            "Executing '{}' on server '{}' (md5 {})",
            target.tool.name, target.server, wanted
        );

        tokio::time::timeout(
            self.timeout,
            self.catalog
                .invoke(&target.server, &target.tool.name, arguments),
        )
        .await
        .map_err(|_| {
            BrokerError::Upstream(format!(
                "tool '{}' timed out after {:?}",
                target.display_name, self.timeout
            ))
        })?
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use serde_json::json;

    use super::*;
    use crate::registry::{LiveTool, ServerOverview};
    use crate::test_support::{live_tool, StubCatalog};

    #[tokio::test]
    async fn test_execute_resolves_by_md5() {
        let tool = live_tool("srv", "t", "does things");
        let md5 = tool.tool_md5.clone();
        let catalog = StubCatalog::new(vec![tool]);
        catalog.set_response("srv", "t", "upstream says hi");

        let executor = Executor::new(catalog.clone(), Duration::from_secs(5));
        let mut args = JsonObject::new();
        args.insert("key".to_string(), json!("value"));
        let result = executor.execute(&md5, Some(args)).await.unwrap();

        assert_ne!(result.is_error, Some(true));
        let invocations = catalog.invocations.lock();
        assert_eq!(invocations.len(), 1);
        assert_eq!(invocations[0].0, "srv");
        assert_eq!(invocations[0].1, "t");
        assert_eq!(invocations[0].2.as_ref().unwrap()["key"], json!("value"));
    }

    #[tokio::test]
    async fn test_execute_accepts_uppercase_md5() {
        let tool = live_tool("srv", "t", "does things");
        let md5 = tool.tool_md5.to_ascii_uppercase();
        let catalog = StubCatalog::new(vec![tool]);
        catalog.set_response("srv", "t", "ok");

        let executor = Executor::new(catalog, Duration::from_secs(5));
        assert!(executor.execute(&md5, None).await.is_ok());
    }

    #[tokio::test]
    async fn test_execute_unknown_md5_not_found() {
        let catalog = StubCatalog::new(vec![live_tool("srv", "t", "does things")]);
        let executor = Executor::new(catalog, Duration::from_secs(5));
        let err = executor
            .execute("00000000000000000000000000000000", None)
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_execute_empty_md5_is_validation_error() {
        let catalog = StubCatalog::new(vec![]);
        let executor = Executor::new(catalog, Duration::from_secs(5));
        assert!(matches!(
            executor.execute("  ", None).await.unwrap_err(),
            BrokerError::Validation(_)
        ));
    }

    #[tokio::test]
    async fn test_execute_surfaces_upstream_error() {
        // No scripted response: the stub fails the invocation.
        let tool = live_tool("srv", "t", "does things");
        let md5 = tool.tool_md5.clone();
        let catalog = StubCatalog::new(vec![tool]);
        let executor = Executor::new(catalog, Duration::from_secs(5));
        let err = executor.execute(&md5, None).await.unwrap_err();
        assert!(matches!(err, BrokerError::Upstream(_)));
    }

    struct SlowCatalog {
        tool: LiveTool,
    }

    #[async_trait]
    impl LiveCatalog for SlowCatalog {
        async fn live_tools(&self) -> Vec<LiveTool> {
            vec![self.tool.clone()]
        }

        async fn invoke(
            &self,
            _server: &str,
            _tool: &str,
            _arguments: Option<JsonObject>,
        ) -> BrokerResult<CallToolResult> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Err(BrokerError::Upstream("should not get here".into()))
        }

        async fn enabled_server_overview(&self) -> BrokerResult<Vec<ServerOverview>> {
            Ok(vec![])
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_execute_times_out() {
        let tool = live_tool("srv", "slow", "sleeps forever");
        let md5 = tool.tool_md5.clone();
        let catalog = Arc::new(SlowCatalog { tool });
        let executor = Executor::new(catalog, Duration::from_millis(50));
        let err = executor.execute(&md5, None).await.unwrap_err();
        match err {
            BrokerError::Upstream(msg) => assert!(msg.contains("timed out")),
            other => panic!("expected upstream timeout, got {:?}", other),
        }
    }
}
