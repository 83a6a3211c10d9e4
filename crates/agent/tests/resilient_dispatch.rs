use std::io;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use kagent_agent::parallel::{ConcurrentExecutor, Task, TaskError};
use kagent_core::retry::{RetryError, RetryPolicy, RetryingCaller};
use serde_json::{json, Map, Value};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

fn policy() -> RetryPolicy {
    RetryPolicy::new(3, Duration::from_millis(100), Duration::from_secs(1), 2.0)
}

/// A tool whose upstream refuses `failures` connections before answering.
fn flaky_task(id: &str, failures: u32, calls: Arc<AtomicU32>) -> Task {
    let caller = RetryingCaller::new(format!("upstream:{id}"), policy());
    Task::new(id, "search", Map::new(), move |ctx| async move {
        let value = caller
            .call(ctx.cancellation(), |_| {
                let call = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if call < failures {
                        Err(anyhow::Error::from(io::Error::from(io::ErrorKind::ConnectionRefused)))
                    } else {
                        Ok(json!({ "answered_on": call + 1 }))
                    }
                }
            })
            .await
            .map_err(|error| anyhow::anyhow!("upstream failed: {error}"))?;
        Ok(value)
    })
}

#[tokio::test(start_paused = true)]
async fn retried_calls_recover_inside_a_parallel_batch() {
    let executor = ConcurrentExecutor::new(4, Duration::from_secs(10), ["save_to_memory"]);
    let flaky_calls = Arc::new(AtomicU32::new(0));
    let steady_calls = Arc::new(AtomicU32::new(0));
    let started = Instant::now();

    let outcomes = executor
        .execute(
            &CancellationToken::new(),
            vec![flaky_task("flaky", 3, flaky_calls.clone()), flaky_task("steady", 0, steady_calls.clone())],
        )
        .await;

    assert_eq!(outcomes[0].id, "flaky");
    assert_eq!(outcomes[0].result.as_ref().ok(), Some(&json!({ "answered_on": 4 })));
    assert_eq!(outcomes[1].result.as_ref().ok(), Some(&json!({ "answered_on": 1 })));
    assert_eq!(flaky_calls.load(Ordering::SeqCst), 4);
    assert_eq!(steady_calls.load(Ordering::SeqCst), 1);

    let waited = started.elapsed();
    assert!(waited >= Duration::from_millis(525), "waited {waited:?}");
    assert!(waited <= Duration::from_millis(875), "waited {waited:?}");
}

#[tokio::test(start_paused = true)]
async fn task_timeout_stops_further_retries() {
    let executor = ConcurrentExecutor::new(2, Duration::from_millis(150), Vec::<String>::new());
    let calls = Arc::new(AtomicU32::new(0));

    let outcomes = executor
        .execute(&CancellationToken::new(), vec![flaky_task("doomed", u32::MAX, calls.clone())])
        .await;
    assert!(matches!(outcomes[0].result, Err(TaskError::Timeout(_))));

    let attempts_at_timeout = calls.load(Ordering::SeqCst);
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(calls.load(Ordering::SeqCst), attempts_at_timeout);
    assert!(attempts_at_timeout <= 2, "only attempts started within 150ms: {attempts_at_timeout}");
}

#[tokio::test(start_paused = true)]
async fn malformed_payload_is_not_retried() {
    let caller = RetryingCaller::new("upstream:parser", policy());
    let calls = AtomicU32::new(0);

    let result: Result<Value, RetryError<anyhow::Error>> = caller
        .call(&CancellationToken::new(), |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { serde_json::from_str::<Value>("{\"truncated\": ").map_err(anyhow::Error::from) }
        })
        .await;

    assert!(matches!(result, Err(RetryError::Fatal(_))));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}
