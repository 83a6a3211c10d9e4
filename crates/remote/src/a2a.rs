//! Client for remote sub-agents speaking A2A JSON-RPC.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use kagent_core::config::SubAgentConfig;
use kagent_core::retry::RetryPolicy;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

use crate::http::{Auth, RetryingTransport, RoundTrip, TransportError};
use crate::jsonrpc::{decode_body, JsonRpcRequest};
use crate::RemoteError;

pub struct SubAgentClient<T = reqwest::Client> {
    name: String,
    description: String,
    endpoint: String,
    auth: Auth,
    timeout: Duration,
    client: reqwest::Client,
    transport: RetryingTransport<T>,
    next_id: AtomicU64,
}

impl SubAgentClient<reqwest::Client> {
    pub fn from_config(config: &SubAgentConfig, policy: RetryPolicy) -> Result<Self, RemoteError> {
        let transport =
            RetryingTransport::new(format!("a2a:{}", config.name), reqwest::Client::new(), policy);
        Self::with_transport(config, transport)
    }
}

impl<T: RoundTrip> SubAgentClient<T> {
    pub fn with_transport(
        config: &SubAgentConfig,
        transport: RetryingTransport<T>,
    ) -> Result<Self, RemoteError> {
        Ok(Self {
            name: config.name.clone(),
            description: config.description.clone(),
            endpoint: config.endpoint.clone(),
            auth: Auth::from_sub_agent(&config.auth)?,
            timeout: Duration::from_secs(config.timeout_secs),
            client: reqwest::Client::new(),
            transport,
            next_id: AtomicU64::new(1),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    /// Sends `text` as a user message and returns the agent's text reply.
    pub async fn query(&self, cancel: &CancellationToken, text: &str) -> Result<String, RemoteError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let params = json!({
            "message": {
                "role": "user",
                "messageId": Uuid::new_v4().to_string(),
                "parts": [{ "kind": "text", "text": text }],
            }
        });
        let builder = self
            .client
            .post(&self.endpoint)
            .timeout(self.timeout)
            .header(ACCEPT, "application/json")
            .json(&JsonRpcRequest::call(id, "message/send", params));
        let request = self.auth.decorate(builder).build().map_err(TransportError::from)?;

        let response = self.transport.send(cancel, request).await?;
        let status = response.status();
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or("application/json")
            .to_string();
        let body = response.text().await.map_err(TransportError::from)?;
        if !status.is_success() {
            return Err(RemoteError::Status { service: self.name.clone(), status: status.as_u16(), body });
        }

        let result = decode_body(&self.name, &content_type, &body, id)?;
        let reply = reply_text(&result);
        debug!(
            event_name = "remote.a2a.reply",
            agent = %self.name,
            reply_len = reply.len(),
            "sub-agent replied"
        );
        Ok(reply)
    }
}

/// A reply is either a message with parts or a task whose status message and
/// artifacts carry parts.
fn reply_text(result: &Value) -> String {
    let mut texts = Vec::new();
    collect_text_parts(result.get("parts"), &mut texts);
    if let Some(status) = result.get("status") {
        collect_text_parts(status.get("message").and_then(|message| message.get("parts")), &mut texts);
    }
    if let Some(artifacts) = result.get("artifacts").and_then(Value::as_array) {
        for artifact in artifacts {
            collect_text_parts(artifact.get("parts"), &mut texts);
        }
    }
    texts.join("\n")
}

fn collect_text_parts(parts: Option<&Value>, out: &mut Vec<String>) {
    let Some(parts) = parts.and_then(Value::as_array) else {
        return;
    };
    out.extend(
        parts
            .iter()
            .filter(|part| part.get("kind").and_then(Value::as_str).unwrap_or("text") == "text")
            .filter_map(|part| part.get("text").and_then(Value::as_str))
            .map(str::to_string),
    );
}
