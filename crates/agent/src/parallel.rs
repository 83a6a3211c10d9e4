//! Bounded-parallel execution of independent tool calls.
//!
//! A batch always yields one [`TaskOutcome`] per [`Task`], in input order,
//! whatever happens to the individual tasks. Batches of two or more run
//! concurrently under the executor-wide cap unless any member is configured
//! as sequential, in which case the whole batch runs one task at a time.

use std::collections::HashSet;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use kagent_core::config::ParallelConfig;
use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinError;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const DEFAULT_MAX_PARALLELISM: usize = 5;
pub const DEFAULT_TOOL_TIMEOUT: Duration = Duration::from_secs(120);

pub type TaskFuture = Pin<Box<dyn Future<Output = anyhow::Result<Value>> + Send>>;
type Invoke = Box<dyn FnOnce(TaskContext) -> TaskFuture + Send>;

/// One unit of work. `id` must be unique within a batch.
pub struct Task {
    pub id: String,
    pub name: String,
    pub arguments: Map<String, Value>,
    invoke: Invoke,
}

impl Task {
    pub fn new<F, Fut>(
        id: impl Into<String>,
        name: impl Into<String>,
        arguments: Map<String, Value>,
        invoke: F,
    ) -> Self
    where
        F: FnOnce(TaskContext) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        Self {
            id: id.into(),
            name: name.into(),
            arguments,
            invoke: Box::new(move |ctx| Box::pin(invoke(ctx))),
        }
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("arguments", &self.arguments)
            .finish_non_exhaustive()
    }
}

/// Handed to a running task. The token fires on timeout, on parent
/// cancellation and once the task has finished.
#[derive(Clone, Debug)]
pub struct TaskContext {
    cancel: CancellationToken,
    deadline: Instant,
}

impl TaskContext {
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }
}

#[derive(Debug, Error)]
pub enum TaskError {
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("cancelled before completion")]
    Cancelled,
    #[error("task panicked: {0}")]
    Panicked(String),
    #[error(transparent)]
    Failed(#[from] anyhow::Error),
}

#[derive(Debug)]
pub struct TaskOutcome {
    pub id: String,
    pub name: String,
    pub result: Result<Value, TaskError>,
    pub duration: Duration,
}

impl TaskOutcome {
    fn cancelled(id: String, name: String) -> Self {
        Self { id, name, result: Err(TaskError::Cancelled), duration: Duration::ZERO }
    }

    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }
}

/// Cumulative counters since the executor was built.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ExecutorStats {
    pub total_tasks: u64,
    pub parallel_batches: u64,
    pub sequential_batches: u64,
    pub time_saved_ms: u64,
}

#[derive(Default)]
struct StatsCounters {
    total_tasks: AtomicU64,
    parallel_batches: AtomicU64,
    sequential_batches: AtomicU64,
    time_saved_ms: AtomicU64,
}

struct Inner {
    parallel_enabled: bool,
    max_parallelism: usize,
    tool_timeout: Duration,
    sequential_tools: HashSet<String>,
    slots: Arc<Semaphore>,
    stats: StatsCounters,
}

#[derive(Clone)]
pub struct ConcurrentExecutor {
    inner: Arc<Inner>,
}

impl fmt::Debug for ConcurrentExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConcurrentExecutor")
            .field("parallel_enabled", &self.inner.parallel_enabled)
            .field("max_parallelism", &self.inner.max_parallelism)
            .field("tool_timeout", &self.inner.tool_timeout)
            .field("sequential_tools", &self.inner.sequential_tools)
            .finish()
    }
}

impl Default for ConcurrentExecutor {
    fn default() -> Self {
        Self::from_config(&ParallelConfig {
            enabled: true,
            max_parallelism: DEFAULT_MAX_PARALLELISM,
            tool_timeout_secs: DEFAULT_TOOL_TIMEOUT.as_secs(),
            sequential_tools: kagent_core::config::DEFAULT_SEQUENTIAL_TOOLS
                .iter()
                .map(|tool| tool.to_string())
                .collect(),
        })
    }
}

impl ConcurrentExecutor {
    /// A zero `max_parallelism` or `tool_timeout` selects the default.
    pub fn new<I, S>(max_parallelism: usize, tool_timeout: Duration, sequential_tools: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::build(true, max_parallelism, tool_timeout, sequential_tools)
    }

    pub fn from_config(config: &ParallelConfig) -> Self {
        Self::build(
            config.enabled,
            config.max_parallelism,
            config.tool_timeout(),
            config.sequential_tools.iter().cloned(),
        )
    }

    fn build<I, S>(
        parallel_enabled: bool,
        max_parallelism: usize,
        tool_timeout: Duration,
        sequential_tools: I,
    ) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let max_parallelism =
            if max_parallelism == 0 { DEFAULT_MAX_PARALLELISM } else { max_parallelism };
        let tool_timeout = if tool_timeout.is_zero() { DEFAULT_TOOL_TIMEOUT } else { tool_timeout };

        Self {
            inner: Arc::new(Inner {
                parallel_enabled,
                max_parallelism,
                tool_timeout,
                sequential_tools: sequential_tools.into_iter().map(Into::into).collect(),
                slots: Arc::new(Semaphore::new(max_parallelism)),
                stats: StatsCounters::default(),
            }),
        }
    }

    pub fn max_parallelism(&self) -> usize {
        self.inner.max_parallelism
    }

    pub fn tool_timeout(&self) -> Duration {
        self.inner.tool_timeout
    }

    pub fn parallel_enabled(&self) -> bool {
        self.inner.parallel_enabled
    }

    /// Free concurrency slots right now.
    pub fn available_slots(&self) -> usize {
        self.inner.slots.available_permits()
    }

    pub fn is_sequential_tool(&self, name: &str) -> bool {
        self.inner.sequential_tools.contains(name)
    }

    /// False for batches of one, when parallelism is disabled, or when any
    /// task names a sequential tool.
    pub fn can_parallelize(&self, tasks: &[Task]) -> bool {
        self.inner.parallel_enabled
            && tasks.len() > 1
            && !tasks.iter().any(|task| self.is_sequential_tool(&task.name))
    }

    pub fn stats(&self) -> ExecutorStats {
        let stats = &self.inner.stats;
        ExecutorStats {
            total_tasks: stats.total_tasks.load(Ordering::Relaxed),
            parallel_batches: stats.parallel_batches.load(Ordering::Relaxed),
            sequential_batches: stats.sequential_batches.load(Ordering::Relaxed),
            time_saved_ms: stats.time_saved_ms.load(Ordering::Relaxed),
        }
    }

    /// Runs `tasks` and returns their outcomes in input order.
    pub async fn execute(&self, cancel: &CancellationToken, tasks: Vec<Task>) -> Vec<TaskOutcome> {
        if tasks.is_empty() {
            return Vec::new();
        }
        self.inner.stats.total_tasks.fetch_add(tasks.len() as u64, Ordering::Relaxed);

        if tasks.len() == 1 {
            let mut outcomes = Vec::with_capacity(1);
            for task in tasks {
                outcomes.push(run_task(task, cancel, self.inner.tool_timeout).await);
            }
            return outcomes;
        }

        if self.can_parallelize(&tasks) {
            self.execute_parallel(cancel, tasks).await
        } else {
            self.execute_sequential(cancel, tasks).await
        }
    }

    /// Like [`Self::execute`], but the whole batch shares `budget`; tasks
    /// still running or waiting when it lapses come back cancelled.
    pub async fn execute_within(
        &self,
        cancel: &CancellationToken,
        tasks: Vec<Task>,
        budget: Duration,
    ) -> Vec<TaskOutcome> {
        let scoped = cancel.child_token();
        let timer = {
            let scoped = scoped.clone();
            tokio::spawn(async move {
                tokio::time::sleep(budget).await;
                scoped.cancel();
            })
        };
        let outcomes = self.execute(&scoped, tasks).await;
        timer.abort();
        outcomes
    }

    async fn execute_sequential(
        &self,
        cancel: &CancellationToken,
        tasks: Vec<Task>,
    ) -> Vec<TaskOutcome> {
        self.inner.stats.sequential_batches.fetch_add(1, Ordering::Relaxed);
        debug!(
            event_name = "agent.parallel.sequential_batch",
            task_count = tasks.len(),
            parallel_enabled = self.inner.parallel_enabled,
            "executing batch sequentially"
        );

        let mut outcomes = Vec::with_capacity(tasks.len());
        for task in tasks {
            outcomes.push(run_task(task, cancel, self.inner.tool_timeout).await);
        }
        outcomes
    }

    async fn execute_parallel(&self, cancel: &CancellationToken, tasks: Vec<Task>) -> Vec<TaskOutcome> {
        self.inner.stats.parallel_batches.fetch_add(1, Ordering::Relaxed);
        let task_count = tasks.len();
        let started = Instant::now();

        let mut handles = Vec::with_capacity(task_count);
        for task in tasks {
            let id = task.id.clone();
            let name = task.name.clone();
            let slots = self.inner.slots.clone();
            let cancel = cancel.clone();
            let timeout = self.inner.tool_timeout;

            let handle = tokio::spawn(async move {
                let permit = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => None,
                    permit = slots.acquire_owned() => permit.ok(),
                };
                let Some(_permit) = permit else {
                    return TaskOutcome::cancelled(task.id, task.name);
                };
                run_task(task, &cancel, timeout).await
            });
            handles.push((id, name, handle));
        }

        let mut outcomes = Vec::with_capacity(task_count);
        for (id, name, handle) in handles {
            let outcome = match handle.await {
                Ok(outcome) => outcome,
                Err(error) => TaskOutcome {
                    id,
                    name,
                    result: Err(join_failure(error)),
                    duration: started.elapsed(),
                },
            };
            outcomes.push(outcome);
        }

        let wall = started.elapsed();
        let sequential: Duration = outcomes.iter().map(|outcome| outcome.duration).sum();
        let saved = sequential.saturating_sub(wall);
        self.inner.stats.time_saved_ms.fetch_add(saved.as_millis() as u64, Ordering::Relaxed);

        info!(
            event_name = "agent.parallel.batch_completed",
            task_count,
            max_parallelism = self.inner.max_parallelism,
            failed = outcomes.iter().filter(|outcome| !outcome.is_success()).count(),
            wall_ms = wall.as_millis() as u64,
            sequential_ms = sequential.as_millis() as u64,
            saved_ms = saved.as_millis() as u64,
            "parallel batch completed"
        );
        outcomes
    }
}

/// Runs one task under its own timeout. The invocation is spawned so a panic
/// is reported as an outcome instead of unwinding into the batch.
async fn run_task(task: Task, parent: &CancellationToken, timeout: Duration) -> TaskOutcome {
    let Task { id, name, invoke, .. } = task;
    if parent.is_cancelled() {
        return TaskOutcome::cancelled(id, name);
    }

    let started = Instant::now();
    let scoped = parent.child_token();
    let ctx = TaskContext { cancel: scoped.clone(), deadline: started + timeout };
    debug!(event_name = "agent.parallel.task_started", task_id = %id, tool = %name, "task started");

    let mut handle = tokio::spawn(async move { invoke(ctx).await });
    let result = tokio::select! {
        biased;
        joined = &mut handle => match joined {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(error)) => Err(TaskError::Failed(error)),
            Err(error) => Err(join_failure(error)),
        },
        _ = parent.cancelled() => Err(TaskError::Cancelled),
        _ = tokio::time::sleep(timeout) => Err(TaskError::Timeout(timeout)),
    };
    scoped.cancel();
    if result.is_err() {
        handle.abort();
    }

    let duration = started.elapsed();
    match &result {
        Ok(_) => debug!(
            event_name = "agent.parallel.task_completed",
            task_id = %id,
            tool = %name,
            duration_ms = duration.as_millis() as u64,
            "task completed"
        ),
        Err(error) => warn!(
            event_name = "agent.parallel.task_failed",
            task_id = %id,
            tool = %name,
            duration_ms = duration.as_millis() as u64,
            error = %error,
            "task failed"
        ),
    }

    TaskOutcome { id, name, result, duration }
}

fn join_failure(error: JoinError) -> TaskError {
    if !error.is_panic() {
        return TaskError::Cancelled;
    }
    let payload = error.into_panic();
    let message = payload
        .downcast_ref::<&str>()
        .map(|message| message.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_string());
    TaskError::Panicked(message)
}

/// Splits outcomes into successful payloads and `"name: error"` descriptions.
pub fn merge_outcomes(outcomes: &[TaskOutcome]) -> (Vec<Value>, Vec<String>) {
    let mut values = Vec::new();
    let mut errors = Vec::new();
    for outcome in outcomes {
        match &outcome.result {
            Ok(value) => values.push(value.clone()),
            Err(error) => errors.push(format!("{}: {error}", outcome.name)),
        }
    }
    (values, errors)
}

pub fn has_errors(outcomes: &[TaskOutcome]) -> bool {
    outcomes.iter().any(|outcome| !outcome.is_success())
}

pub fn all_succeeded(outcomes: &[TaskOutcome]) -> bool {
    !has_errors(outcomes)
}
