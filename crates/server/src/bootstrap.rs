use std::sync::Arc;

use axum::Router;
use chrono::Utc;
use kagent_agent::llm::LlmClient;
use kagent_agent::runtime::load_tools;
use kagent_agent::{AgentRuntime, ConcurrentExecutor};
use kagent_core::config::AppConfig;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::ratelimit::{RateLimiter, TrustedProxySet};
use crate::routes::{router, AppState};

pub struct Application {
    pub config: Arc<AppConfig>,
    pub state: AppState,
    pub proxies: Arc<TrustedProxySet>,
}

/// Wires the runtime, executor and rate limiter from an already validated
/// configuration.
pub async fn bootstrap_with_config(config: AppConfig, llm: Arc<dyn LlmClient>) -> Application {
    info!(event_name = "system.bootstrap.start", correlation_id = "bootstrap", "starting application bootstrap");
    let work = CancellationToken::new();
    let registry = load_tools(&config, &work).await;
    let executor = ConcurrentExecutor::from_config(&config.parallel);
    info!(
        event_name = "system.bootstrap.executor_ready",
        correlation_id = "bootstrap",
        parallel_enabled = executor.parallel_enabled(),
        max_parallelism = executor.max_parallelism(),
        tool_timeout_secs = executor.tool_timeout().as_secs(),
        "concurrent executor ready"
    );

    let rate_limiter = config.server.rate_limit.enabled.then(|| {
        info!(
            event_name = "system.bootstrap.rate_limit_ready",
            correlation_id = "bootstrap",
            requests_per_second = config.server.rate_limit.requests_per_second,
            burst = config.server.rate_limit.burst,
            "rate limiter ready"
        );
        Arc::new(RateLimiter::from_config(&config.server.rate_limit))
    });
    let proxies = Arc::new(TrustedProxySet::parse(&config.server.trusted_proxies));

    let config = Arc::new(config);
    let state = AppState {
        runtime: Arc::new(AgentRuntime::new(registry, executor, llm)),
        config: config.clone(),
        rate_limiter,
        work,
        started_at: Utc::now(),
    };
    Application { config, state, proxies }
}

impl Application {
    pub fn router(&self) -> Router {
        router(self.state.clone(), self.proxies.clone())
    }

    /// Cancels in-flight work and stops the rate limiter sweep.
    pub fn shutdown(&self) {
        self.state.work.cancel();
        if let Some(limiter) = &self.state.rate_limiter {
            limiter.close();
        }
    }
}
