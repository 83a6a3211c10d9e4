use thiserror::Error;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ApplicationError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("admission rejected for `{identity}`")]
    AdmissionRejected { identity: String },
    #[error("upstream timed out: {0}")]
    UpstreamTimeout(String),
    #[error("upstream failure: {0}")]
    Upstream(String),
    #[error("operation cancelled")]
    Cancelled,
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum InterfaceError {
    #[error("bad request: {message}")]
    BadRequest { message: String, correlation_id: String },
    #[error("too many requests: {message}")]
    TooManyRequests { message: String, correlation_id: String },
    #[error("gateway timeout: {message}")]
    GatewayTimeout { message: String, correlation_id: String },
    #[error("bad gateway: {message}")]
    BadGateway { message: String, correlation_id: String },
    #[error("service unavailable: {message}")]
    ServiceUnavailable { message: String, correlation_id: String },
}

impl InterfaceError {
    pub fn user_message(&self) -> &'static str {
        match self {
            Self::BadRequest { .. } => {
                "The request could not be processed. Check inputs and try again."
            }
            Self::TooManyRequests { .. } => "Rate limit exceeded. Please try again later.",
            Self::GatewayTimeout { .. } => "An upstream service did not respond in time.",
            Self::BadGateway { .. } => "An upstream service failed. Please retry shortly.",
            Self::ServiceUnavailable { .. } => {
                "The service is temporarily unavailable. Please retry shortly."
            }
        }
    }

    pub fn correlation_id(&self) -> &str {
        match self {
            Self::BadRequest { correlation_id, .. }
            | Self::TooManyRequests { correlation_id, .. }
            | Self::GatewayTimeout { correlation_id, .. }
            | Self::BadGateway { correlation_id, .. }
            | Self::ServiceUnavailable { correlation_id, .. } => correlation_id,
        }
    }
}

impl ApplicationError {
    pub fn into_interface(self, correlation_id: impl Into<String>) -> InterfaceError {
        let correlation_id = correlation_id.into();
        let mut mapped = InterfaceError::from(self);
        match &mut mapped {
            InterfaceError::BadRequest { correlation_id: id, .. }
            | InterfaceError::TooManyRequests { correlation_id: id, .. }
            | InterfaceError::GatewayTimeout { correlation_id: id, .. }
            | InterfaceError::BadGateway { correlation_id: id, .. }
            | InterfaceError::ServiceUnavailable { correlation_id: id, .. } => *id = correlation_id,
        }
        mapped
    }
}

impl From<ApplicationError> for InterfaceError {
    fn from(value: ApplicationError) -> Self {
        let correlation_id = "unassigned".to_owned();
        match value {
            ApplicationError::InvalidRequest(message) => Self::BadRequest { message, correlation_id },
            ApplicationError::AdmissionRejected { identity } => Self::TooManyRequests {
                message: format!("token bucket empty for {identity}"),
                correlation_id,
            },
            ApplicationError::UpstreamTimeout(message) => {
                Self::GatewayTimeout { message, correlation_id }
            }
            ApplicationError::Upstream(message) => Self::BadGateway { message, correlation_id },
            ApplicationError::Cancelled => Self::ServiceUnavailable {
                message: "request cancelled before completion".to_owned(),
                correlation_id,
            },
        }
    }
}
