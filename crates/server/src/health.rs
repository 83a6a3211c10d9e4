use axum::extract::State;
use axum::Json;
use chrono::Utc;
use kagent_agent::ExecutorStats;
use serde::Serialize;

use crate::routes::AppState;

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ExecutorHealth {
    pub parallel_enabled: bool,
    pub max_parallelism: usize,
    pub available_slots: usize,
    pub tool_timeout_secs: u64,
    pub stats: ExecutorStats,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct RateLimitHealth {
    pub enabled: bool,
    pub requests_per_second: f64,
    pub burst: u32,
    pub tracked_clients: usize,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub service: &'static str,
    pub version: &'static str,
    pub uptime_secs: i64,
    pub checked_at: String,
    pub tools: Vec<String>,
    pub executor: ExecutorHealth,
    pub rate_limit: RateLimitHealth,
}

/// Readiness plus the settings that shape request handling. Readiness policy
/// beyond "the process is serving" belongs to the deployment.
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let executor = state.runtime.executor();
    let now = Utc::now();
    let rate_limit = match &state.rate_limiter {
        Some(limiter) => RateLimitHealth {
            enabled: true,
            requests_per_second: limiter.requests_per_second(),
            burst: limiter.burst(),
            tracked_clients: limiter.tracked_clients(),
        },
        None => RateLimitHealth {
            enabled: false,
            requests_per_second: state.config.server.rate_limit.requests_per_second,
            burst: state.config.server.rate_limit.burst,
            tracked_clients: 0,
        },
    };

    Json(HealthResponse {
        status: "ready",
        service: "kagent-server",
        version: env!("CARGO_PKG_VERSION"),
        uptime_secs: (now - state.started_at).num_seconds(),
        checked_at: now.to_rfc3339(),
        tools: state.runtime.registry().names(),
        executor: ExecutorHealth {
            parallel_enabled: executor.parallel_enabled(),
            max_parallelism: executor.max_parallelism(),
            available_slots: executor.available_slots(),
            tool_timeout_secs: executor.tool_timeout().as_secs(),
            stats: executor.stats(),
        },
        rate_limit,
    })
}

#[cfg(test)]
mod tests {
    use axum::extract::State;
    use axum::Json;
    use kagent_core::config::AppConfig;

    use crate::health::health;
    use crate::routes::tests::state;

    #[tokio::test]
    async fn health_reports_executor_and_rate_limit_settings() {
        let mut config = AppConfig::default();
        config.parallel.max_parallelism = 3;
        let Json(payload) = health(State(state(config))).await;

        assert_eq!(payload.status, "ready");
        assert_eq!(payload.tools, vec!["nap".to_string()]);
        assert_eq!(payload.executor.max_parallelism, 3);
        assert_eq!(payload.executor.available_slots, 3);
        assert!(payload.rate_limit.enabled);
        assert_eq!(payload.rate_limit.burst, 20);
        assert_eq!(payload.rate_limit.tracked_clients, 0);
    }

    #[tokio::test]
    async fn disabled_rate_limit_is_reported() {
        let mut config = AppConfig::default();
        config.server.rate_limit.enabled = false;

        let Json(payload) = health(State(state(config))).await;

        assert!(!payload.rate_limit.enabled);
        assert_eq!(payload.executor.stats.total_tasks, 0);
    }
}
