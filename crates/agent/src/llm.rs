use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;

use crate::tools::{ToolCall, ToolDescriptor};

/// The result of one tool call, as fed back to the planner.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ToolExchange {
    pub call: ToolCall,
    pub success: bool,
    pub output: Value,
}

pub struct PlanRequest<'a> {
    pub message: &'a str,
    pub thread_id: Option<&'a str>,
    pub tools: &'a [ToolDescriptor],
    pub history: &'a [ToolExchange],
}

#[derive(Clone, Debug, PartialEq)]
pub enum PlanStep {
    Respond(String),
    CallTools(Vec<ToolCall>),
}

/// Decides the next step of a conversation turn. Model access lives behind
/// this seam.
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn plan(&self, request: &PlanRequest<'_>) -> Result<PlanStep>;
}

/// Answers without calling tools. Used when no model backend is wired in.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopPlanner;

#[async_trait]
impl LlmClient for NoopPlanner {
    async fn plan(&self, request: &PlanRequest<'_>) -> Result<PlanStep> {
        Ok(PlanStep::Respond(format!(
            "received: {} ({} tools available)",
            request.message,
            request.tools.len()
        )))
    }
}
