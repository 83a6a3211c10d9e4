use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use kagent_core::config::AppConfig;
use kagent_core::retry::RetryPolicy;
use kagent_remote::mcp::load_toolsets;
use kagent_remote::SubAgentClient;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::llm::{LlmClient, PlanRequest, PlanStep, ToolExchange};
use crate::parallel::{ConcurrentExecutor, ExecutorStats, TaskOutcome};
use crate::remote_tools::register_toolsets;
use crate::subagents::{register_sub_agents, SubAgent};
use crate::tools::{ToolCall, ToolRegistry};
use crate::web_fetch::FetchUrlTool;

pub const DEFAULT_MAX_TOOL_ROUNDS: usize = 8;

#[derive(Clone, Debug, Deserialize)]
pub struct QueryRequest {
    pub message: String,
    #[serde(default)]
    pub thread_id: Option<String>,
}

/// Wire shape of one finished tool call.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ToolCallReport {
    pub id: String,
    pub name: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration_ms: u64,
}

impl From<&TaskOutcome> for ToolCallReport {
    fn from(outcome: &TaskOutcome) -> Self {
        let (output, error) = match &outcome.result {
            Ok(value) => (Some(value.clone()), None),
            Err(error) => (None, Some(error.to_string())),
        };
        Self {
            id: outcome.id.clone(),
            name: outcome.name.clone(),
            success: outcome.is_success(),
            output,
            error,
            duration_ms: outcome.duration.as_millis() as u64,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct QueryResponse {
    pub answer: String,
    pub tool_calls: Vec<ToolCallReport>,
    pub rounds: usize,
}

pub struct AgentRuntime {
    registry: ToolRegistry,
    executor: ConcurrentExecutor,
    llm: Arc<dyn LlmClient>,
    max_rounds: usize,
}

impl AgentRuntime {
    pub fn new(registry: ToolRegistry, executor: ConcurrentExecutor, llm: Arc<dyn LlmClient>) -> Self {
        Self { registry, executor, llm, max_rounds: DEFAULT_MAX_TOOL_ROUNDS }
    }

    pub fn with_max_rounds(mut self, max_rounds: usize) -> Self {
        self.max_rounds = max_rounds.max(1);
        self
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    pub fn executor(&self) -> &ConcurrentExecutor {
        &self.executor
    }

    pub fn executor_stats(&self) -> ExecutorStats {
        self.executor.stats()
    }

    /// Runs one batch of model-requested calls; outcomes follow call order.
    pub async fn dispatch_tool_calls(
        &self,
        cancel: &CancellationToken,
        calls: Vec<ToolCall>,
    ) -> Vec<TaskOutcome> {
        self.executor.execute(cancel, self.registry.tasks_for(calls)).await
    }

    /// [`Self::dispatch_tool_calls`] with one deadline for the whole batch.
    pub async fn dispatch_within(
        &self,
        cancel: &CancellationToken,
        calls: Vec<ToolCall>,
        budget: Duration,
    ) -> Vec<TaskOutcome> {
        self.executor.execute_within(cancel, self.registry.tasks_for(calls), budget).await
    }

    /// Alternates planning and tool dispatch until the planner answers or the
    /// round limit is reached.
    pub async fn handle_query(&self, cancel: &CancellationToken, request: &QueryRequest) -> Result<QueryResponse> {
        let tools = self.registry.descriptors();
        let mut history: Vec<ToolExchange> = Vec::new();
        let mut reports = Vec::new();

        for round in 1..=self.max_rounds {
            if cancel.is_cancelled() {
                bail!("query cancelled");
            }
            let step = self
                .llm
                .plan(&PlanRequest {
                    message: &request.message,
                    thread_id: request.thread_id.as_deref(),
                    tools: &tools,
                    history: &history,
                })
                .await?;

            let calls = match step {
                PlanStep::Respond(answer) => {
                    info!(
                        event_name = "agent.runtime.query_answered",
                        thread_id = request.thread_id.as_deref().unwrap_or_default(),
                        rounds = round,
                        tool_calls = reports.len(),
                        "query answered"
                    );
                    return Ok(QueryResponse { answer, tool_calls: reports, rounds: round });
                }
                PlanStep::CallTools(calls) if calls.is_empty() => bail!("planner requested an empty tool batch"),
                PlanStep::CallTools(calls) => calls,
            };

            let outcomes = self.dispatch_tool_calls(cancel, calls.clone()).await;
            for (call, outcome) in calls.into_iter().zip(&outcomes) {
                let report = ToolCallReport::from(outcome);
                history.push(ToolExchange {
                    call,
                    success: report.success,
                    output: match (&report.output, &report.error) {
                        (Some(output), _) => output.clone(),
                        (None, error) => Value::String(error.clone().unwrap_or_default()),
                    },
                });
                reports.push(report);
            }
        }

        warn!(
            event_name = "agent.runtime.round_limit",
            max_rounds = self.max_rounds,
            tool_calls = reports.len(),
            "planner did not answer within the round limit"
        );
        bail!("no answer after {} tool rounds", self.max_rounds)
    }
}

/// Builds the tool registry from configuration. Remote sources that cannot be
/// reached or configured are left out with a warning.
pub async fn load_tools(config: &AppConfig, cancel: &CancellationToken) -> ToolRegistry {
    let mut registry = ToolRegistry::default();

    if config.tools.web_fetch.enabled {
        match FetchUrlTool::from_config(&config.tools.web_fetch, RetryPolicy::default()) {
            Ok(tool) => {
                registry.register(tool);
            }
            Err(error) => warn!(
                event_name = "agent.tools.web_fetch_unavailable",
                error = %error,
                "web fetch tool disabled"
            ),
        }
    }

    if config.mcp.enabled {
        let toolsets = load_toolsets(&config.mcp.servers, config.mcp.retry.policy(), cancel).await;
        register_toolsets(&mut registry, &toolsets);
    }

    if config.a2a.enabled {
        let policy = config.a2a.retry.policy();
        let mut agents: Vec<Arc<dyn SubAgent>> = Vec::new();
        for sub_agent in &config.a2a.sub_agents {
            match SubAgentClient::from_config(sub_agent, policy) {
                Ok(client) => agents.push(Arc::new(client)),
                Err(error) => warn!(
                    event_name = "agent.tools.sub_agent_skipped",
                    agent = %sub_agent.name,
                    error = %error,
                    "sub-agent unavailable; continuing without it"
                ),
            }
        }
        register_sub_agents(&mut registry, agents, ConcurrentExecutor::from_config(&config.parallel));
    }

    info!(
        event_name = "agent.tools.loaded",
        tool_count = registry.len(),
        tools = ?registry.names(),
        "tool registry ready"
    );
    registry
}
