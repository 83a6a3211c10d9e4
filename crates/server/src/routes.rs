use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::rejection::JsonRejection;
use axum::extract::{Request, State};
use axum::http::HeaderValue;
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use chrono::{DateTime, Utc};
use kagent_agent::{AgentRuntime, QueryRequest, QueryResponse, ToolCall, ToolCallReport};
use kagent_core::config::AppConfig;
use kagent_core::errors::ApplicationError;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::info;
use uuid::Uuid;

use crate::error::ApiError;
use crate::health::health;
use crate::ratelimit::{enforce_rate_limit, RateLimitState, RateLimiter, TrustedProxySet};

pub const REQUEST_ID_HEADER: &str = "x-request-id";
const MAX_REQUEST_ID_LEN: usize = 128;

#[derive(Clone)]
pub struct AppState {
    pub runtime: Arc<AgentRuntime>,
    pub config: Arc<AppConfig>,
    pub rate_limiter: Option<Arc<RateLimiter>>,
    /// Parent of every request's work; cancelled when shutdown gives up
    /// waiting.
    pub work: CancellationToken,
    pub started_at: DateTime<Utc>,
}

impl AppState {
    fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.config.server.request_timeout_secs)
    }
}

#[derive(Clone, Debug)]
pub struct RequestId(pub String);

/// Reuses a caller-supplied `x-request-id` or mints one, and echoes it on the
/// response.
pub async fn assign_request_id(mut request: Request, next: Next) -> Response {
    let request_id = request
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty() && value.len() <= MAX_REQUEST_ID_LEN)
        .map(str::to_string)
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    request.extensions_mut().insert(RequestId(request_id.clone()));

    let mut response = next.run(request).await;
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
    response
}

/// `/health` stays reachable while `/api/*` sits behind the rate limiter.
pub fn router(state: AppState, proxies: Arc<TrustedProxySet>) -> Router {
    let mut api = Router::new()
        .route("/api/query", post(query))
        .route("/api/tools/execute", post(execute_tools));
    if let Some(limiter) = state.rate_limiter.clone() {
        api = api.layer(middleware::from_fn_with_state(
            RateLimitState { limiter, proxies },
            enforce_rate_limit,
        ));
    }

    Router::new()
        .route("/health", get(health))
        .merge(api)
        .layer(middleware::from_fn(assign_request_id))
        .with_state(state)
}

#[derive(Debug, Serialize)]
pub struct QueryReply {
    pub request_id: String,
    #[serde(flatten)]
    pub response: QueryResponse,
}

async fn query(
    State(state): State<AppState>,
    Extension(RequestId(request_id)): Extension<RequestId>,
    payload: Result<Json<QueryRequest>, JsonRejection>,
) -> Result<Json<QueryReply>, ApiError> {
    let Json(request) = payload.map_err(|rejection| ApiError::bad_request(rejection.body_text(), &request_id))?;
    if request.message.trim().is_empty() {
        return Err(ApiError::bad_request("message must not be empty", &request_id));
    }

    let cancel = state.work.child_token();
    let timeout = state.request_timeout();
    let outcome = tokio::time::timeout(timeout, state.runtime.handle_query(&cancel, &request)).await;
    cancel.cancel();

    let response = match outcome {
        Err(_) => {
            let error = ApplicationError::UpstreamTimeout(format!("query exceeded {}s", timeout.as_secs()));
            return Err(ApiError::from_application(error, &request_id));
        }
        Ok(Err(_)) if state.work.is_cancelled() => {
            return Err(ApiError::from_application(ApplicationError::Cancelled, &request_id));
        }
        Ok(Err(error)) => {
            return Err(ApiError::from_application(ApplicationError::Upstream(format!("{error:#}")), &request_id));
        }
        Ok(Ok(response)) => response,
    };

    info!(
        event_name = "server.api.query_completed",
        correlation_id = %request_id,
        thread_id = request.thread_id.as_deref().unwrap_or_default(),
        rounds = response.rounds,
        tool_calls = response.tool_calls.len(),
        "query completed"
    );
    Ok(Json(QueryReply { request_id, response }))
}

#[derive(Debug, Deserialize)]
pub struct ExecuteToolsRequest {
    #[serde(default)]
    pub calls: Vec<ToolCall>,
}

#[derive(Debug, Serialize)]
pub struct ExecuteToolsReply {
    pub request_id: String,
    pub results: Vec<ToolCallReport>,
    pub successful: usize,
    pub failed: usize,
}

async fn execute_tools(
    State(state): State<AppState>,
    Extension(RequestId(request_id)): Extension<RequestId>,
    payload: Result<Json<ExecuteToolsRequest>, JsonRejection>,
) -> Result<Json<ExecuteToolsReply>, ApiError> {
    let Json(request) = payload.map_err(|rejection| ApiError::bad_request(rejection.body_text(), &request_id))?;

    let mut seen = HashSet::new();
    if let Some(duplicate) = request.calls.iter().find(|call| !seen.insert(call.id.as_str())) {
        return Err(ApiError::bad_request(format!("duplicate call id `{}`", duplicate.id), &request_id));
    }

    let cancel = state.work.child_token();
    let outcomes = state.runtime.dispatch_within(&cancel, request.calls, state.request_timeout()).await;
    cancel.cancel();

    let results: Vec<ToolCallReport> = outcomes.iter().map(ToolCallReport::from).collect();
    let successful = results.iter().filter(|result| result.success).count();
    let failed = results.len() - successful;
    info!(
        event_name = "server.api.tools_executed",
        correlation_id = %request_id,
        total = results.len(),
        successful,
        failed,
        "tool batch executed"
    );
    Ok(Json(ExecuteToolsReply { request_id, results, successful, failed }))
}
