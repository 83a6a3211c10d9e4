//! Exposes tools listed by connected MCP servers through the local registry.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use kagent_remote::{McpSession, McpToolset, RemoteTool};
use serde_json::{Map, Value};
use tracing::warn;

use crate::parallel::TaskContext;
use crate::tools::{Tool, ToolRegistry};

pub struct McpTool {
    session: Arc<McpSession>,
    tool: RemoteTool,
}

impl McpTool {
    pub fn new(session: Arc<McpSession>, tool: RemoteTool) -> Self {
        Self { session, tool }
    }

    pub fn server(&self) -> &str {
        self.session.server()
    }
}

#[async_trait]
impl Tool for McpTool {
    fn name(&self) -> &str {
        &self.tool.name
    }

    fn description(&self) -> &str {
        &self.tool.description
    }

    fn parameters(&self) -> Value {
        self.tool.input_schema.clone()
    }

    async fn execute(&self, ctx: &TaskContext, input: Map<String, Value>) -> Result<Value> {
        let value = self
            .session
            .call_tool(ctx.cancellation(), &self.tool.name, Value::Object(input))
            .await?;
        Ok(value)
    }
}

/// Registers every tool of every toolset. When two servers expose the same
/// name the later one wins and the shadowing is logged.
pub fn register_toolsets(registry: &mut ToolRegistry, toolsets: &[McpToolset]) -> usize {
    let mut registered = 0;
    for toolset in toolsets {
        for tool in &toolset.tools {
            let adapter = McpTool::new(toolset.session.clone(), tool.clone());
            if let Some(previous) = registry.register(adapter) {
                warn!(
                    event_name = "agent.tools.shadowed",
                    tool = %tool.name,
                    server = %toolset.server,
                    previous_description = %previous.description(),
                    "remote tool replaces an existing registration"
                );
            }
            registered += 1;
        }
    }
    registered
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use async_trait::async_trait;
    use kagent_remote::mcp::RpcChannel;
    use kagent_remote::{McpSession, McpToolset, RemoteError, RemoteTool};
    use serde_json::{json, Map, Value};
    use tokio_util::sync::CancellationToken;

    use super::register_toolsets;
    use crate::parallel::{ConcurrentExecutor, TaskError};
    use crate::tools::{ToolCall, ToolRegistry};

    /// Answers `tools/call` for `lookup` and flags `broken` as a tool error.
    struct ClusterServer;

    #[async_trait]
    impl RpcChannel for ClusterServer {
        async fn request(
            &self,
            _cancel: &CancellationToken,
            method: &str,
            params: Value,
        ) -> Result<Value, RemoteError> {
            match (method, params["name"].as_str()) {
                ("initialize", _) => Ok(json!({ "serverInfo": { "name": "cluster" } })),
                ("tools/call", Some("lookup")) => Ok(json!({
                    "content": [{ "type": "text", "text": format!("pod {}", params["arguments"]["pod"]) }]
                })),
                ("tools/call", _) => Ok(json!({
                    "isError": true,
                    "content": [{ "type": "text", "text": "permission denied" }]
                })),
                _ => Ok(json!({})),
            }
        }

        async fn notify(&self, _method: &str, _params: Value) -> Result<(), RemoteError> {
            Ok(())
        }
    }

    fn remote_tool(name: &str) -> RemoteTool {
        RemoteTool {
            name: name.to_string(),
            description: format!("{name} on the cluster"),
            input_schema: json!({ "type": "object", "properties": { "pod": { "type": "string" } } }),
        }
    }

    async fn toolset() -> McpToolset {
        let session = McpSession::initialize("cluster", Box::new(ClusterServer), Vec::new(), &CancellationToken::new())
            .await
            .expect("session");
        McpToolset {
            server: "cluster".to_string(),
            description: "cluster tools".to_string(),
            session: Arc::new(session),
            tools: vec![remote_tool("lookup"), remote_tool("broken")],
        }
    }

    #[tokio::test]
    async fn remote_tools_dispatch_through_session() {
        let mut registry = ToolRegistry::default();
        let count = register_toolsets(&mut registry, &[toolset().await]);
        assert_eq!(count, 2);
        assert_eq!(registry.names(), vec!["broken".to_string(), "lookup".to_string()]);

        let mut pod = Map::new();
        pod.insert("pod".to_string(), json!("api-0"));
        let calls = vec![ToolCall::new("1", "lookup", pod), ToolCall::new("2", "broken", Map::new())];
        let outcomes = ConcurrentExecutor::default()
            .execute(&CancellationToken::new(), registry.tasks_for(calls))
            .await;

        assert_eq!(outcomes[0].result.as_ref().ok(), Some(&json!("pod \"api-0\"")));
        assert!(matches!(
            outcomes[1].result,
            Err(TaskError::Failed(ref error)) if error.to_string().contains("permission denied")
        ));
    }

    #[tokio::test]
    async fn schema_is_exposed_in_descriptors() {
        let mut registry = ToolRegistry::default();
        register_toolsets(&mut registry, &[toolset().await]);

        let lookup = registry.descriptors().into_iter().find(|tool| tool.name == "lookup").expect("lookup");
        assert_eq!(lookup.parameters["properties"]["pod"]["type"], "string");
    }
}
