//! Outbound HTTP with status-classified retries.

use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use kagent_core::config::{McpAuthConfig, SubAgentAuth};
use kagent_core::retry::{is_transient, RetryError, RetryPolicy, Retryable, RetryingCaller, Verdict};
use reqwest::{Request, RequestBuilder, Response, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::RemoteError;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("http transport failure: {0}")]
    Http(#[from] reqwest::Error),
    #[error("io failure: {0}")]
    Io(#[from] io::Error),
    #[error("request cannot be replayed: {0}")]
    NotReplayable(String),
}

impl Retryable for TransportError {
    fn is_retryable(&self) -> bool {
        match self {
            Self::Http(error) => error.is_timeout() || error.is_connect() || is_transient(error),
            Self::Io(error) => error.is_retryable(),
            Self::NotReplayable(_) => false,
        }
    }
}

/// Sends one request and returns whatever the peer answered.
#[async_trait]
pub trait RoundTrip: Send + Sync {
    async fn round_trip(&self, request: Request) -> Result<Response, TransportError>;
}

#[async_trait]
impl RoundTrip for reqwest::Client {
    async fn round_trip(&self, request: Request) -> Result<Response, TransportError> {
        Ok(self.execute(request).await?)
    }
}

#[async_trait]
impl<T: RoundTrip + ?Sized> RoundTrip for Arc<T> {
    async fn round_trip(&self, request: Request) -> Result<Response, TransportError> {
        (**self).round_trip(request).await
    }
}

pub fn is_retryable_status(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::BAD_GATEWAY
            | StatusCode::SERVICE_UNAVAILABLE
            | StatusCode::GATEWAY_TIMEOUT
            | StatusCode::TOO_MANY_REQUESTS
    )
}

fn classify(outcome: &Result<Response, TransportError>) -> Verdict {
    match outcome {
        Ok(response) if is_retryable_status(response.status()) => {
            Verdict::Retry(format!("status {}", response.status().as_u16()))
        }
        Err(error) if error.is_retryable() => Verdict::Retry(error.to_string()),
        _ => Verdict::Accept,
    }
}

/// Wraps a [`RoundTrip`] so transient failures and 429/502/503/504 answers are
/// retried. When every attempt ends in a retryable status the last response is
/// returned untouched, body included.
pub struct RetryingTransport<T> {
    inner: T,
    caller: RetryingCaller,
}

impl<T: RoundTrip> RetryingTransport<T> {
    pub fn new(name: impl Into<String>, inner: T, policy: RetryPolicy) -> Self {
        Self { inner, caller: RetryingCaller::new(name, policy) }
    }

    pub fn policy(&self) -> &RetryPolicy {
        self.caller.policy()
    }

    pub async fn send(
        &self,
        cancel: &CancellationToken,
        request: Request,
    ) -> Result<Response, RetryError<TransportError>> {
        let Some(template) = request.try_clone() else {
            debug!(
                event_name = "resilience.retry.skipped",
                caller = %self.caller.name(),
                url = %request.url(),
                "request body is streaming; sending once"
            );
            return tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(RetryError::Cancelled),
                outcome = self.inner.round_trip(request) => outcome.map_err(RetryError::Fatal),
            };
        };

        let inner = &self.inner;
        let template = &template;
        self.caller
            .execute(
                cancel,
                move |_| {
                    let attempt = template.try_clone();
                    async move {
                        match attempt {
                            Some(request) => inner.round_trip(request).await,
                            None => Err(TransportError::NotReplayable(template.url().to_string())),
                        }
                    }
                },
                classify,
            )
            .await
    }
}

/// Credentials attached to every outbound request.
#[derive(Clone, Debug, Default)]
pub enum Auth {
    #[default]
    None,
    Bearer(SecretString),
    Basic { username: String, password: Option<SecretString> },
    Header { name: String, value: SecretString },
}

impl Auth {
    pub fn decorate(&self, builder: RequestBuilder) -> RequestBuilder {
        match self {
            Self::None => builder,
            Self::Bearer(token) => builder.bearer_auth(token.expose_secret()),
            Self::Basic { username, password } => {
                builder.basic_auth(username, password.as_ref().map(|p| p.expose_secret()))
            }
            Self::Header { name, value } => builder.header(name.as_str(), value.expose_secret()),
        }
    }

    pub fn from_mcp(config: Option<&McpAuthConfig>) -> Result<Self, RemoteError> {
        match config {
            None => Ok(Self::None),
            Some(McpAuthConfig::Bearer { token: Some(token), .. }) => Ok(Self::Bearer(token.clone())),
            Some(McpAuthConfig::Bearer { token: None, token_env: Some(var) }) => {
                Ok(Self::Bearer(secret_from_env(var)?))
            }
            Some(McpAuthConfig::Bearer { token: None, token_env: None }) => {
                Err(RemoteError::MissingCredential("bearer token".to_string()))
            }
            Some(McpAuthConfig::Basic { username, password }) => {
                Ok(Self::Basic { username: username.clone(), password: password.clone() })
            }
        }
    }

    pub fn from_sub_agent(config: &SubAgentAuth) -> Result<Self, RemoteError> {
        match config {
            SubAgentAuth::None => Ok(Self::None),
            SubAgentAuth::ApiKey { header, key_env } => {
                Ok(Self::Header { name: header.clone(), value: secret_from_env(key_env)? })
            }
            SubAgentAuth::Bearer { token_env } => Ok(Self::Bearer(secret_from_env(token_env)?)),
        }
    }
}

fn secret_from_env(var: &str) -> Result<SecretString, RemoteError> {
    std::env::var(var)
        .ok()
        .filter(|value| !value.trim().is_empty())
        .map(SecretString::from)
        .ok_or_else(|| RemoteError::MissingCredential(var.to_string()))
}
