//! Outbound plumbing to remote tool servers and sub-agents.
//!
//! - `http`: [`http::RetryingTransport`], the status-classified retrying HTTP round trip
//! - `mcp`: connectors and sessions for MCP tool servers, with connect-level retries
//! - `a2a`: JSON-RPC client for remote sub-agents

pub mod a2a;
pub mod http;
mod jsonrpc;
pub mod mcp;

use std::io;

use kagent_core::retry::{RetryError, Retryable};
use thiserror::Error;

pub use a2a::SubAgentClient;
pub use http::{Auth, RetryingTransport, RoundTrip, TransportError};
pub use mcp::{Connect, McpSession, McpToolset, RemoteTool};

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("process io failure: {0}")]
    Io(#[from] io::Error),
    #[error("{service} answered with status {status}: {body}")]
    Status { service: String, status: u16, body: String },
    #[error("invalid response from {service}: {message}")]
    InvalidResponse { service: String, message: String },
    #[error("{service} returned error {code}: {message}")]
    Rpc { service: String, code: i64, message: String },
    #[error("tool `{tool}` reported failure: {message}")]
    ToolFailed { tool: String, message: String },
    #[error("missing credential `{0}`")]
    MissingCredential(String),
    #[error("misconfigured remote `{service}`: {message}")]
    Misconfigured { service: String, message: String },
    #[error("request cancelled")]
    Cancelled,
}

impl Retryable for RemoteError {
    fn is_retryable(&self) -> bool {
        match self {
            Self::Transport(error) => error.is_retryable(),
            Self::Io(error) => error.is_retryable(),
            Self::Status { status, .. } => {
                reqwest::StatusCode::from_u16(*status).map(http::is_retryable_status).unwrap_or(false)
            }
            _ => false,
        }
    }
}

impl From<RetryError<TransportError>> for RemoteError {
    fn from(value: RetryError<TransportError>) -> Self {
        match value {
            RetryError::Cancelled => Self::Cancelled,
            RetryError::Exhausted { last, .. } | RetryError::Fatal(last) => Self::Transport(last),
        }
    }
}

impl From<RetryError<RemoteError>> for RemoteError {
    fn from(value: RetryError<RemoteError>) -> Self {
        match value {
            RetryError::Cancelled => Self::Cancelled,
            RetryError::Exhausted { last, .. } | RetryError::Fatal(last) => last,
        }
    }
}

pub type RemoteResult<T> = Result<T, RemoteError>;
