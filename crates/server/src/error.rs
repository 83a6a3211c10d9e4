use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use kagent_core::errors::{ApplicationError, InterfaceError};
use serde::Serialize;
use tracing::warn;

/// An [`InterfaceError`] on its way out as an HTTP response.
#[derive(Debug)]
pub struct ApiError(pub InterfaceError);

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: &'static str,
    pub message: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    pub correlation_id: String,
}

impl ApiError {
    pub fn from_application(error: ApplicationError, correlation_id: &str) -> Self {
        Self(error.into_interface(correlation_id))
    }

    pub fn bad_request(message: impl Into<String>, correlation_id: &str) -> Self {
        Self::from_application(ApplicationError::InvalidRequest(message.into()), correlation_id)
    }

    pub fn status(&self) -> StatusCode {
        match &self.0 {
            InterfaceError::BadRequest { .. } => StatusCode::BAD_REQUEST,
            InterfaceError::TooManyRequests { .. } => StatusCode::TOO_MANY_REQUESTS,
            InterfaceError::GatewayTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            InterfaceError::BadGateway { .. } => StatusCode::BAD_GATEWAY,
            InterfaceError::ServiceUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    fn kind(&self) -> &'static str {
        match &self.0 {
            InterfaceError::BadRequest { .. } => "bad_request",
            InterfaceError::TooManyRequests { .. } => "rate_limited",
            InterfaceError::GatewayTimeout { .. } => "upstream_timeout",
            InterfaceError::BadGateway { .. } => "upstream_failure",
            InterfaceError::ServiceUnavailable { .. } => "unavailable",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        // Admission rejections answer before any handler runs, in plain text.
        if let InterfaceError::TooManyRequests { .. } = &self.0 {
            return (status, self.0.user_message()).into_response();
        }
        // Only input errors echo their detail; upstream text stays in the logs.
        let detail = match &self.0 {
            InterfaceError::BadRequest { message, .. } => Some(message.clone()),
            _ => None,
        };
        warn!(
            event_name = "server.api.error",
            correlation_id = %self.0.correlation_id(),
            status = status.as_u16(),
            error = %self.0,
            "request failed"
        );
        let body = ErrorBody {
            error: self.kind(),
            message: self.0.user_message(),
            detail,
            correlation_id: self.0.correlation_id().to_string(),
        };
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use axum::body::to_bytes;
    use axum::http::StatusCode;
    use axum::response::IntoResponse;
    use kagent_core::errors::ApplicationError;
    use serde_json::Value;

    use super::ApiError;

    #[tokio::test]
    async fn upstream_detail_is_not_echoed() {
        let response = ApiError::from_application(
            ApplicationError::Upstream("10.0.0.7:9000 refused".to_string()),
            "req-9",
        )
        .into_response();

        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        let body: Value =
            serde_json::from_slice(&to_bytes(response.into_body(), 4096).await.expect("body")).expect("json");
        assert_eq!(body["error"], "upstream_failure");
        assert_eq!(body["correlation_id"], "req-9");
        assert!(body.get("detail").is_none());
    }

    #[tokio::test]
    async fn admission_rejection_is_plain_text_429() {
        let response = ApiError::from_application(
            ApplicationError::AdmissionRejected { identity: "1.2.3.4".to_string() },
            "req-7",
        )
        .into_response();

        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        let body = to_bytes(response.into_body(), 4096).await.expect("body");
        assert_eq!(&body[..], b"Rate limit exceeded. Please try again later.");
    }

    #[tokio::test]
    async fn bad_request_carries_detail() {
        let response = ApiError::bad_request("message must not be empty", "req-1").into_response();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body: Value =
            serde_json::from_slice(&to_bytes(response.into_body(), 4096).await.expect("body")).expect("json");
        assert_eq!(body["detail"], "message must not be empty");
    }
}
