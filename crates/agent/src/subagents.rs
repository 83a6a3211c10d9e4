//! Tools that delegate questions to remote sub-agents.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use kagent_remote::{RemoteError, RoundTrip, SubAgentClient};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::parallel::{ConcurrentExecutor, Task, TaskContext};
use crate::tools::{required_str, Tool, ToolRegistry};

pub const QUERY_MULTIPLE_AGENTS: &str = "query_multiple_agents";

#[async_trait]
pub trait SubAgent: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    async fn query(&self, cancel: &CancellationToken, text: &str) -> Result<String, RemoteError>;
}

#[async_trait]
impl<T: RoundTrip + 'static> SubAgent for SubAgentClient<T> {
    fn name(&self) -> &str {
        SubAgentClient::name(self)
    }

    fn description(&self) -> &str {
        SubAgentClient::description(self)
    }

    async fn query(&self, cancel: &CancellationToken, text: &str) -> Result<String, RemoteError> {
        SubAgentClient::query(self, cancel, text).await
    }
}

/// `query_<agent>`: asks one sub-agent.
pub struct SubAgentTool {
    name: String,
    description: String,
    agent: Arc<dyn SubAgent>,
}

impl SubAgentTool {
    pub fn new(agent: Arc<dyn SubAgent>) -> Self {
        Self {
            name: format!("query_{}", agent.name()),
            description: format!("Ask the {} agent. {}", agent.name(), agent.description()),
            agent,
        }
    }
}

#[async_trait]
impl Tool for SubAgentTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": { "query": { "type": "string" } },
            "required": ["query"]
        })
    }

    async fn execute(&self, ctx: &TaskContext, input: Map<String, Value>) -> Result<Value> {
        let query = required_str(&input, "query")?;
        if query.trim().is_empty() {
            return Err(anyhow!("query cannot be empty"));
        }
        let reply = self.agent.query(ctx.cancellation(), query).await?;
        Ok(Value::String(reply))
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct AgentQuery {
    pub agent: String,
    pub query: String,
}

#[derive(Debug, Deserialize)]
struct QueryMultipleAgentsArgs {
    #[serde(default)]
    queries: Vec<AgentQuery>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct AgentQueryResult {
    pub agent: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct QueryMultipleAgentsResult {
    pub results: Vec<AgentQueryResult>,
    pub total_agents: usize,
    pub successful: usize,
    pub failed: usize,
}

/// Fans a list of `{agent, query}` pairs out concurrently and reports one
/// result per entry, in request order.
///
/// Runs on its own executor: the calling task may already hold a slot of the
/// runtime executor, and borrowing from the same pool could starve.
pub struct QueryMultipleAgentsTool {
    agents: BTreeMap<String, Arc<dyn SubAgent>>,
    executor: ConcurrentExecutor,
}

impl QueryMultipleAgentsTool {
    pub fn new(agents: impl IntoIterator<Item = Arc<dyn SubAgent>>, executor: ConcurrentExecutor) -> Self {
        let agents = agents.into_iter().map(|agent| (agent.name().to_string(), agent)).collect();
        Self { agents, executor }
    }

    fn available(&self) -> Vec<&str> {
        self.agents.keys().map(String::as_str).collect()
    }

    fn task_for(&self, index: usize, request: AgentQuery) -> Task {
        let AgentQuery { agent: name, query } = request;
        let mut arguments = Map::new();
        arguments.insert("query".to_string(), Value::String(query.clone()));
        let agent = self.agents.get(&name).cloned();
        let available = format!("{:?}", self.available());

        Task::new(index.to_string(), format!("query_{name}"), arguments, move |ctx| async move {
            let Some(agent) = agent else {
                return Err(anyhow!("agent '{name}' not found. Available agents: {available}"));
            };
            if query.trim().is_empty() {
                return Err(anyhow!("query cannot be empty"));
            }
            match agent.query(ctx.cancellation(), &query).await {
                Ok(reply) => Ok(Value::String(reply)),
                Err(error) => Err(anyhow!("failed to call {name}: {error}")),
            }
        })
    }

    pub async fn run(&self, cancel: &CancellationToken, queries: Vec<AgentQuery>) -> QueryMultipleAgentsResult {
        if queries.is_empty() {
            return QueryMultipleAgentsResult { results: Vec::new(), total_agents: 0, successful: 0, failed: 0 };
        }

        let agents: Vec<String> = queries.iter().map(|query| query.agent.clone()).collect();
        info!(
            event_name = "agent.subagents.fan_out_started",
            total_queries = queries.len(),
            agents = ?agents,
            "parallel sub-agent query started"
        );

        let tasks = queries.into_iter().enumerate().map(|(index, query)| self.task_for(index, query)).collect();
        let outcomes = self.executor.execute(cancel, tasks).await;

        let results: Vec<AgentQueryResult> = outcomes
            .into_iter()
            .zip(agents)
            .map(|(outcome, agent)| match outcome.result {
                Ok(reply) => AgentQueryResult {
                    agent,
                    success: true,
                    response: Some(reply.as_str().map(str::to_string).unwrap_or_else(|| reply.to_string())),
                    error: None,
                },
                Err(error) => {
                    warn!(
                        event_name = "agent.subagents.query_failed",
                        agent = %agent,
                        error = %error,
                        "sub-agent query failed"
                    );
                    AgentQueryResult { agent, success: false, response: None, error: Some(error.to_string()) }
                }
            })
            .collect();

        let successful = results.iter().filter(|result| result.success).count();
        let summary = QueryMultipleAgentsResult {
            total_agents: results.len(),
            successful,
            failed: results.len() - successful,
            results,
        };
        info!(
            event_name = "agent.subagents.fan_out_completed",
            total_agents = summary.total_agents,
            successful = summary.successful,
            failed = summary.failed,
            "parallel sub-agent query completed"
        );
        summary
    }
}

#[async_trait]
impl Tool for QueryMultipleAgentsTool {
    fn name(&self) -> &str {
        QUERY_MULTIPLE_AGENTS
    }

    fn description(&self) -> &str {
        "Query several sub-agents in parallel. Pass {\"queries\": [{\"agent\": name, \"query\": text}, ...]}; \
         results come back in the same order."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "queries": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "properties": {
                            "agent": { "type": "string", "enum": self.available() },
                            "query": { "type": "string" }
                        },
                        "required": ["agent", "query"]
                    }
                }
            },
            "required": ["queries"]
        })
    }

    async fn execute(&self, ctx: &TaskContext, input: Map<String, Value>) -> Result<Value> {
        let args: QueryMultipleAgentsArgs = serde_json::from_value(Value::Object(input))?;
        let summary = self.run(ctx.cancellation(), args.queries).await;
        Ok(serde_json::to_value(summary)?)
    }
}

/// Registers one `query_<agent>` tool per agent plus `query_multiple_agents`.
pub fn register_sub_agents(
    registry: &mut ToolRegistry,
    agents: Vec<Arc<dyn SubAgent>>,
    executor: ConcurrentExecutor,
) {
    if agents.is_empty() {
        return;
    }
    for agent in &agents {
        registry.register(SubAgentTool::new(agent.clone()));
    }
    registry.register(QueryMultipleAgentsTool::new(agents, executor));
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use kagent_remote::RemoteError;
    use serde_json::{json, Map};
    use tokio::time::Instant;
    use tokio_util::sync::CancellationToken;

    use super::{register_sub_agents, AgentQuery, QueryMultipleAgentsTool, SubAgent};
    use crate::parallel::ConcurrentExecutor;
    use crate::tools::{ToolCall, ToolRegistry};

    struct FakeAgent {
        name: &'static str,
        delay: Duration,
        fail: bool,
    }

    #[async_trait]
    impl SubAgent for FakeAgent {
        fn name(&self) -> &str {
            self.name
        }

        fn description(&self) -> &str {
            "test agent"
        }

        async fn query(&self, _cancel: &CancellationToken, text: &str) -> Result<String, RemoteError> {
            tokio::time::sleep(self.delay).await;
            if self.fail {
                return Err(RemoteError::Status { service: self.name.to_string(), status: 503, body: "busy".to_string() });
            }
            Ok(format!("{}: {text}", self.name))
        }
    }

    fn agents() -> Vec<Arc<dyn SubAgent>> {
        vec![
            Arc::new(FakeAgent { name: "logs_agent", delay: Duration::from_millis(100), fail: false }),
            Arc::new(FakeAgent { name: "metrics_agent", delay: Duration::from_millis(100), fail: false }),
            Arc::new(FakeAgent { name: "kube_agent", delay: Duration::from_millis(10), fail: true }),
        ]
    }

    fn query(agent: &str, text: &str) -> AgentQuery {
        AgentQuery { agent: agent.to_string(), query: text.to_string() }
    }

    #[tokio::test(start_paused = true)]
    async fn fan_out_reports_in_request_order() {
        let tool = QueryMultipleAgentsTool::new(agents(), ConcurrentExecutor::default());
        let started = Instant::now();

        let summary = tool
            .run(
                &CancellationToken::new(),
                vec![
                    query("metrics_agent", "error rate"),
                    query("kube_agent", "pods"),
                    query("billing_agent", "invoices"),
                    query("logs_agent", "errors"),
                    query("logs_agent", "  "),
                ],
            )
            .await;

        assert!(started.elapsed() < Duration::from_millis(200));
        assert_eq!(summary.total_agents, 5);
        assert_eq!(summary.successful, 2);
        assert_eq!(summary.failed, 3);

        let results = &summary.results;
        assert_eq!(results[0].response.as_deref(), Some("metrics_agent: error rate"));
        assert!(results[1].error.as_deref().unwrap_or_default().starts_with("failed to call kube_agent:"));
        assert_eq!(
            results[2].error.as_deref(),
            Some("agent 'billing_agent' not found. Available agents: [\"kube_agent\", \"logs_agent\", \"metrics_agent\"]")
        );
        assert_eq!(results[3].response.as_deref(), Some("logs_agent: errors"));
        assert_eq!(results[4].error.as_deref(), Some("query cannot be empty"));
    }

    #[tokio::test]
    async fn empty_query_list_returns_empty_summary() {
        let tool = QueryMultipleAgentsTool::new(agents(), ConcurrentExecutor::default());

        let summary = tool.run(&CancellationToken::new(), Vec::new()).await;

        assert!(summary.results.is_empty());
        assert_eq!(serde_json::to_value(&summary).expect("json")["total_agents"], 0);
    }

    #[tokio::test(start_paused = true)]
    async fn registered_tools_answer_through_the_registry() {
        let mut registry = ToolRegistry::default();
        register_sub_agents(&mut registry, agents(), ConcurrentExecutor::default());
        assert_eq!(
            registry.names(),
            vec!["query_kube_agent", "query_logs_agent", "query_metrics_agent", "query_multiple_agents"]
        );

        let mut single = Map::new();
        single.insert("query".to_string(), json!("tail"));
        let mut multi = Map::new();
        multi.insert("queries".to_string(), json!([{ "agent": "logs_agent", "query": "tail" }]));
        let calls = vec![
            ToolCall::new("a", "query_logs_agent", single),
            ToolCall::new("b", "query_multiple_agents", multi),
        ];

        let outcomes = ConcurrentExecutor::default()
            .execute(&CancellationToken::new(), registry.tasks_for(calls))
            .await;

        assert_eq!(outcomes[0].result.as_ref().ok(), Some(&json!("logs_agent: tail")));
        let summary = outcomes[1].result.as_ref().expect("summary");
        assert_eq!(summary["results"][0], json!({ "agent": "logs_agent", "success": true, "response": "logs_agent: tail" }));
        assert_eq!(summary["successful"], 1);
    }

    #[test]
    fn no_agents_registers_nothing() {
        let mut registry = ToolRegistry::default();
        register_sub_agents(&mut registry, Vec::new(), ConcurrentExecutor::default());
        assert!(registry.is_empty());
    }
}
