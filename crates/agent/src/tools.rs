use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::parallel::{Task, TaskContext};

#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// JSON schema of the accepted arguments.
    fn parameters(&self) -> Value {
        json!({ "type": "object" })
    }

    async fn execute(&self, ctx: &TaskContext, input: Map<String, Value>) -> Result<Value>;
}

/// What a planner sees of a registered tool.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

/// A model-requested invocation of a named tool.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub arguments: Map<String, Value>,
}

impl ToolCall {
    pub fn new(id: impl Into<String>, name: impl Into<String>, arguments: Map<String, Value>) -> Self {
        Self { id: id.into(), name: name.into(), arguments }
    }
}

#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    /// Registers `tool`, returning whatever was previously registered under
    /// the same name.
    pub fn register<T>(&mut self, tool: T) -> Option<Arc<dyn Tool>>
    where
        T: Tool + 'static,
    {
        self.register_shared(Arc::new(tool))
    }

    pub fn register_shared(&mut self, tool: Arc<dyn Tool>) -> Option<Arc<dyn Tool>> {
        self.tools.insert(tool.name().to_string(), tool)
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn descriptors(&self) -> Vec<ToolDescriptor> {
        let mut descriptors: Vec<ToolDescriptor> = self
            .tools
            .values()
            .map(|tool| ToolDescriptor {
                name: tool.name().to_string(),
                description: tool.description().to_string(),
                parameters: tool.parameters(),
            })
            .collect();
        descriptors.sort_by(|left, right| left.name.cmp(&right.name));
        descriptors
    }

    /// Turns calls into executor tasks. A call naming an unregistered tool
    /// still yields a task, one that fails, so the batch keeps its shape.
    pub fn tasks_for(&self, calls: Vec<ToolCall>) -> Vec<Task> {
        calls.into_iter().map(|call| self.task_for(call)).collect()
    }

    fn task_for(&self, call: ToolCall) -> Task {
        let ToolCall { id, name, arguments } = call;
        let input = arguments.clone();
        match self.get(&name) {
            Some(tool) => Task::new(id, name, arguments, move |ctx| async move {
                tool.execute(&ctx, input).await
            }),
            None => {
                let message = format!("unknown tool `{name}`");
                Task::new(id, name, arguments, move |_| async move { Err(anyhow!(message)) })
            }
        }
    }
}

pub(crate) fn required_str<'a>(input: &'a Map<String, Value>, key: &str) -> Result<&'a str> {
    input
        .get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| anyhow!("missing string argument `{key}`"))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;
    use serde_json::{json, Map, Value};
    use tokio_util::sync::CancellationToken;

    use super::{Tool, ToolCall, ToolRegistry};
    use crate::parallel::{ConcurrentExecutor, TaskContext, TaskError};

    struct Echo;

    #[async_trait]
    impl Tool for Echo {
        fn name(&self) -> &str {
            "echo"
        }

        fn description(&self) -> &str {
            "returns its input"
        }

        async fn execute(&self, _ctx: &TaskContext, input: Map<String, Value>) -> anyhow::Result<Value> {
            Ok(Value::Object(input))
        }
    }

    struct Shout;

    #[async_trait]
    impl Tool for Shout {
        fn name(&self) -> &str {
            "echo"
        }

        fn description(&self) -> &str {
            "returns its input, louder"
        }

        async fn execute(&self, _ctx: &TaskContext, input: Map<String, Value>) -> anyhow::Result<Value> {
            let text = super::required_str(&input, "text")?;
            Ok(json!(text.to_uppercase()))
        }
    }

    fn arguments(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap_or_default()
    }

    #[test]
    fn registering_same_name_replaces_tool() {
        let mut registry = ToolRegistry::default();
        assert!(registry.register(Echo).is_none());
        let replaced = registry.register(Shout).expect("previous tool");

        assert_eq!(replaced.description(), "returns its input");
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.names(), vec!["echo".to_string()]);
        assert_eq!(registry.descriptors()[0].parameters, json!({ "type": "object" }));
    }

    #[tokio::test]
    async fn calls_run_through_executor_and_unknown_tools_fail_in_place() {
        let mut registry = ToolRegistry::default();
        registry.register(Echo);
        let executor = ConcurrentExecutor::new(2, Duration::from_secs(1), Vec::<String>::new());

        let calls = vec![
            ToolCall::new("1", "echo", arguments(json!({ "q": 1 }))),
            ToolCall::new("2", "missing", Map::new()),
            ToolCall::new("3", "echo", arguments(json!({ "q": 3 }))),
        ];
        let outcomes = executor.execute(&CancellationToken::new(), registry.tasks_for(calls)).await;

        assert_eq!(outcomes.len(), 3);
        assert_eq!(outcomes[0].result.as_ref().ok(), Some(&json!({ "q": 1 })));
        assert!(matches!(
            outcomes[1].result,
            Err(TaskError::Failed(ref error)) if error.to_string() == "unknown tool `missing`"
        ));
        assert_eq!(outcomes[2].result.as_ref().ok(), Some(&json!({ "q": 3 })));
    }

    #[tokio::test]
    async fn missing_argument_is_a_task_failure() {
        let mut registry = ToolRegistry::default();
        registry.register(Shout);
        let executor = ConcurrentExecutor::default();

        let outcomes = executor
            .execute(&CancellationToken::new(), registry.tasks_for(vec![ToolCall::new("a", "echo", Map::new())]))
            .await;

        assert!(matches!(
            outcomes[0].result,
            Err(TaskError::Failed(ref error)) if error.to_string() == "missing string argument `text`"
        ));
    }

    #[test]
    fn tool_call_arguments_default_to_empty() {
        let call: ToolCall = serde_json::from_value(json!({ "id": "x", "name": "echo" })).expect("call");
        assert!(call.arguments.is_empty());
    }
}
