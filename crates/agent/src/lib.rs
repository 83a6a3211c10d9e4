//! Agent runtime: tool registry, bounded-parallel tool dispatch and the
//! built-in tools.
//!
//! # Architecture
//!
//! A query turn alternates between the planner (`llm`) and tool dispatch:
//! 1. **Planning** (`llm`) - an [`llm::LlmClient`] answers or asks for tool calls
//! 2. **Dispatch** (`runtime`) - calls become [`parallel::Task`]s via the [`tools::ToolRegistry`]
//! 3. **Execution** (`parallel`) - the [`parallel::ConcurrentExecutor`] runs the batch under
//!    its concurrency cap, timeout and cancellation, returning outcomes in call order
//!
//! Tool sources: `web_fetch` (built in), `remote_tools` (MCP servers) and
//! `subagents` (A2A agents, including the parallel `query_multiple_agents`).

pub mod llm;
pub mod parallel;
pub mod remote_tools;
pub mod runtime;
pub mod subagents;
pub mod tools;
pub mod web_fetch;

pub use parallel::{ConcurrentExecutor, ExecutorStats, Task, TaskContext, TaskError, TaskOutcome};
pub use runtime::{AgentRuntime, QueryRequest, QueryResponse, ToolCallReport};
pub use tools::{Tool, ToolCall, ToolRegistry};
