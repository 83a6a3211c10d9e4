//! MCP tool server connections.
//!
//! A [`Connect`] implementation establishes an initialized [`McpSession`].
//! Command servers are spawned fresh on every connect and retried at connect
//! time through [`RetryingConnector`]; streamable HTTP servers retry each
//! request at the transport layer instead.

use std::io;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use kagent_core::config::{CommandSpec, McpServerConfig, McpTransport};
use kagent_core::retry::{RetryPolicy, RetryingCaller};
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::http::{Auth, RetryingTransport, RoundTrip, TransportError};
use crate::jsonrpc::{decode_body, JsonRpcRequest, JsonRpcResponse};
use crate::RemoteError;

pub const PROTOCOL_VERSION: &str = "2025-03-26";
const SESSION_HEADER: &str = "mcp-session-id";

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct RemoteTool {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

#[async_trait]
pub trait RpcChannel: Send + Sync {
    async fn request(
        &self,
        cancel: &CancellationToken,
        method: &str,
        params: Value,
    ) -> Result<Value, RemoteError>;

    async fn notify(&self, method: &str, params: Value) -> Result<(), RemoteError>;
}

pub struct McpSession {
    server: String,
    channel: Box<dyn RpcChannel>,
    tool_filter: Vec<String>,
}

impl std::fmt::Debug for McpSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("McpSession").field("server", &self.server).finish_non_exhaustive()
    }
}

impl McpSession {
    /// Performs the `initialize` handshake over `channel`.
    pub async fn initialize(
        server: impl Into<String>,
        channel: Box<dyn RpcChannel>,
        tool_filter: Vec<String>,
        cancel: &CancellationToken,
    ) -> Result<Self, RemoteError> {
        let server = server.into();
        let params = json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": {},
            "clientInfo": { "name": "kagent", "version": env!("CARGO_PKG_VERSION") },
        });
        let info = channel.request(cancel, "initialize", params).await?;
        channel.notify("notifications/initialized", json!({})).await?;

        let server_info = info.get("serverInfo").cloned().unwrap_or(Value::Null);
        debug!(
            event_name = "remote.mcp.initialized",
            server = %server,
            server_info = %server_info,
            "mcp session initialized"
        );
        Ok(Self { server, channel, tool_filter })
    }

    pub fn server(&self) -> &str {
        &self.server
    }

    pub async fn list_tools(&self, cancel: &CancellationToken) -> Result<Vec<RemoteTool>, RemoteError> {
        let result = self.channel.request(cancel, "tools/list", json!({})).await?;
        let listed = result.get("tools").and_then(Value::as_array).ok_or_else(|| {
            RemoteError::InvalidResponse {
                service: self.server.clone(),
                message: "tools/list result has no `tools` array".to_string(),
            }
        })?;

        let tools = listed
            .iter()
            .filter_map(|tool| {
                let name = tool.get("name")?.as_str()?.to_string();
                Some(RemoteTool {
                    description: tool
                        .get("description")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                    input_schema: tool.get("inputSchema").cloned().unwrap_or_else(|| json!({})),
                    name,
                })
            })
            .filter(|tool| self.tool_filter.is_empty() || self.tool_filter.contains(&tool.name))
            .collect();
        Ok(tools)
    }

    pub async fn call_tool(
        &self,
        cancel: &CancellationToken,
        name: &str,
        arguments: Value,
    ) -> Result<Value, RemoteError> {
        let result = self
            .channel
            .request(cancel, "tools/call", json!({ "name": name, "arguments": arguments }))
            .await?;

        let text = result
            .get("content")
            .and_then(Value::as_array)
            .map(|parts| {
                parts
                    .iter()
                    .filter_map(|part| part.get("text").and_then(Value::as_str))
                    .collect::<Vec<_>>()
                    .join("\n")
            })
            .unwrap_or_default();

        if result.get("isError").and_then(Value::as_bool).unwrap_or(false) {
            return Err(RemoteError::ToolFailed { tool: name.to_string(), message: text });
        }
        if let Some(structured) = result.get("structuredContent") {
            return Ok(structured.clone());
        }
        if !text.is_empty() {
            return Ok(Value::String(text));
        }
        Ok(result)
    }
}

#[async_trait]
pub trait Connect: Send + Sync {
    fn server(&self) -> &str;

    async fn connect(&self, cancel: &CancellationToken) -> Result<McpSession, RemoteError>;
}

/// Retries connection establishment while the failure is transient.
pub struct RetryingConnector<C> {
    inner: C,
    caller: RetryingCaller,
}

impl<C: Connect> RetryingConnector<C> {
    pub fn new(inner: C, policy: RetryPolicy) -> Self {
        let caller = RetryingCaller::new(format!("mcp:{}", inner.server()), policy);
        Self { inner, caller }
    }
}

#[async_trait]
impl<C: Connect> Connect for RetryingConnector<C> {
    fn server(&self) -> &str {
        self.inner.server()
    }

    async fn connect(&self, cancel: &CancellationToken) -> Result<McpSession, RemoteError> {
        Ok(self.caller.call(cancel, |_| self.inner.connect(cancel)).await?)
    }
}

/// Spawns the server process on every connect and speaks line-delimited
/// JSON-RPC over its stdio.
pub struct CommandConnector {
    server: String,
    command: CommandSpec,
    tool_filter: Vec<String>,
    timeout: Duration,
}

impl CommandConnector {
    pub fn new(
        server: impl Into<String>,
        command: CommandSpec,
        tool_filter: Vec<String>,
        timeout: Duration,
    ) -> Self {
        Self { server: server.into(), command, tool_filter, timeout }
    }
}

#[async_trait]
impl Connect for CommandConnector {
    fn server(&self) -> &str {
        &self.server
    }

    async fn connect(&self, cancel: &CancellationToken) -> Result<McpSession, RemoteError> {
        let channel = StdioChannel::spawn(&self.server, &self.command, self.timeout)?;
        McpSession::initialize(self.server.clone(), Box::new(channel), self.tool_filter.clone(), cancel)
            .await
    }
}

fn closed_pipe(which: &str) -> RemoteError {
    RemoteError::Io(io::Error::new(io::ErrorKind::BrokenPipe, format!("child {which} unavailable")))
}

fn abandoned_exchange(server: &str) -> RemoteError {
    RemoteError::Io(io::Error::new(
        io::ErrorKind::BrokenPipe,
        format!("stdio session for `{server}` was interrupted mid-message; reconnect required"),
    ))
}

struct StdioPipes {
    _child: Child,
    stdin: ChildStdin,
    stdout: Lines<BufReader<ChildStdout>>,
    /// Set while a message is in flight. Still set afterwards means the
    /// exchange was interrupted and the stream position is unknown.
    broken: bool,
}

struct StdioChannel {
    server: String,
    timeout: Duration,
    next_id: AtomicU64,
    pipes: Mutex<StdioPipes>,
}

impl StdioChannel {
    fn spawn(server: &str, command: &CommandSpec, timeout: Duration) -> Result<Self, RemoteError> {
        let mut child = Command::new(&command.path)
            .args(&command.args)
            .envs(&command.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()?;

        let stdin = child.stdin.take().ok_or_else(|| closed_pipe("stdin"))?;
        let stdout = child.stdout.take().ok_or_else(|| closed_pipe("stdout"))?;
        Ok(Self {
            server: server.to_string(),
            timeout,
            next_id: AtomicU64::new(1),
            pipes: Mutex::new(StdioPipes {
                _child: child,
                stdin,
                stdout: BufReader::new(stdout).lines(),
                broken: false,
            }),
        })
    }

    async fn write_line(pipes: &mut StdioPipes, message: &JsonRpcRequest<'_>) -> Result<(), RemoteError> {
        let mut line = serde_json::to_vec(message).map_err(io::Error::from)?;
        line.push(b'\n');
        pipes.stdin.write_all(&line).await?;
        pipes.stdin.flush().await?;
        Ok(())
    }

    /// Reads stdout until the response to `id` shows up. Notifications and
    /// log noise in between are skipped.
    async fn exchange(
        &self,
        pipes: &mut StdioPipes,
        id: u64,
        method: &str,
        params: Value,
    ) -> Result<Value, RemoteError> {
        Self::write_line(pipes, &JsonRpcRequest::call(id, method, params)).await?;
        while let Some(line) = pipes.stdout.next_line().await? {
            match serde_json::from_str::<JsonRpcResponse>(&line) {
                Ok(response) if response.answers(id) => return response.into_result(&self.server),
                Ok(_) => {}
                Err(error) => {
                    debug!(server = %self.server, error = %error, "skipping non-json stdout line");
                }
            }
        }
        Err(RemoteError::Io(io::Error::new(io::ErrorKind::UnexpectedEof, "server closed stdout")))
    }
}

#[async_trait]
impl RpcChannel for StdioChannel {
    async fn request(
        &self,
        cancel: &CancellationToken,
        method: &str,
        params: Value,
    ) -> Result<Value, RemoteError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut pipes = self.pipes.lock().await;
        if pipes.broken {
            return Err(abandoned_exchange(&self.server));
        }
        if cancel.is_cancelled() {
            return Err(RemoteError::Cancelled);
        }

        pipes.broken = true;
        let finished = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            outcome = tokio::time::timeout(self.timeout, self.exchange(&mut pipes, id, method, params)) => outcome.ok(),
        };

        match finished {
            Some(result) => {
                // A read or write failure leaves the stream unusable.
                pipes.broken = matches!(result, Err(RemoteError::Io(_)));
                result
            }
            None => {
                warn!(
                    event_name = "remote.mcp.exchange_abandoned",
                    server = %self.server,
                    method,
                    "stdio exchange interrupted; session must reconnect"
                );
                if cancel.is_cancelled() {
                    Err(RemoteError::Cancelled)
                } else {
                    Err(RemoteError::Io(io::Error::new(
                        io::ErrorKind::TimedOut,
                        format!("{method} timed out after {:?}", self.timeout),
                    )))
                }
            }
        }
    }

    async fn notify(&self, method: &str, params: Value) -> Result<(), RemoteError> {
        let mut pipes = self.pipes.lock().await;
        if pipes.broken {
            return Err(abandoned_exchange(&self.server));
        }
        pipes.broken = true;
        let result = Self::write_line(&mut pipes, &JsonRpcRequest::notification(method, params)).await;
        pipes.broken = result.is_err();
        result
    }
}

/// Streamable HTTP transport: every message is a POST to the endpoint, the
/// session id handed out by `initialize` is echoed on later requests.
pub struct StreamableHttpConnector<T> {
    server: String,
    endpoint: String,
    auth: Auth,
    timeout: Duration,
    tool_filter: Vec<String>,
    client: reqwest::Client,
    transport: Arc<RetryingTransport<T>>,
}

impl<T: RoundTrip + 'static> StreamableHttpConnector<T> {
    pub fn new(
        server: impl Into<String>,
        endpoint: impl Into<String>,
        auth: Auth,
        timeout: Duration,
        tool_filter: Vec<String>,
        transport: RetryingTransport<T>,
    ) -> Self {
        Self {
            server: server.into(),
            endpoint: endpoint.into(),
            auth,
            timeout,
            tool_filter,
            client: reqwest::Client::new(),
            transport: Arc::new(transport),
        }
    }
}

#[async_trait]
impl<T: RoundTrip + 'static> Connect for StreamableHttpConnector<T> {
    fn server(&self) -> &str {
        &self.server
    }

    async fn connect(&self, cancel: &CancellationToken) -> Result<McpSession, RemoteError> {
        let channel = HttpChannel {
            server: self.server.clone(),
            endpoint: self.endpoint.clone(),
            auth: self.auth.clone(),
            timeout: self.timeout,
            client: self.client.clone(),
            transport: self.transport.clone(),
            session_id: RwLock::new(None),
            next_id: AtomicU64::new(1),
        };
        McpSession::initialize(self.server.clone(), Box::new(channel), self.tool_filter.clone(), cancel)
            .await
    }
}

struct HttpChannel<T> {
    server: String,
    endpoint: String,
    auth: Auth,
    timeout: Duration,
    client: reqwest::Client,
    transport: Arc<RetryingTransport<T>>,
    session_id: RwLock<Option<String>>,
    next_id: AtomicU64,
}

impl<T: RoundTrip> HttpChannel<T> {
    async fn post(
        &self,
        cancel: &CancellationToken,
        message: &JsonRpcRequest<'_>,
    ) -> Result<(reqwest::StatusCode, String, String), RemoteError> {
        let mut builder = self
            .client
            .post(&self.endpoint)
            .timeout(self.timeout)
            .header(ACCEPT, "application/json, text/event-stream")
            .json(message);
        let session = self.session_id.read().unwrap_or_else(PoisonError::into_inner).clone();
        if let Some(session) = session {
            builder = builder.header(SESSION_HEADER, session);
        }
        let request = self.auth.decorate(builder).build().map_err(TransportError::from)?;

        let response = self.transport.send(cancel, request).await?;
        if let Some(session) = response.headers().get(SESSION_HEADER).and_then(|v| v.to_str().ok()) {
            *self.session_id.write().unwrap_or_else(PoisonError::into_inner) = Some(session.to_string());
        }

        let status = response.status();
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or("application/json")
            .to_string();
        let body = response.text().await.map_err(TransportError::from)?;
        if !status.is_success() {
            return Err(RemoteError::Status { service: self.server.clone(), status: status.as_u16(), body });
        }
        Ok((status, content_type, body))
    }
}

#[async_trait]
impl<T: RoundTrip> RpcChannel for HttpChannel<T> {
    async fn request(
        &self,
        cancel: &CancellationToken,
        method: &str,
        params: Value,
    ) -> Result<Value, RemoteError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (_, content_type, body) = self.post(cancel, &JsonRpcRequest::call(id, method, params)).await?;
        decode_body(&self.server, &content_type, &body, id)
    }

    async fn notify(&self, method: &str, params: Value) -> Result<(), RemoteError> {
        let cancel = CancellationToken::new();
        self.post(&cancel, &JsonRpcRequest::notification(method, params)).await?;
        Ok(())
    }
}

/// Builds the connector described by `config`.
pub fn connector_for(
    config: &McpServerConfig,
    policy: RetryPolicy,
) -> Result<Box<dyn Connect>, RemoteError> {
    let timeout = Duration::from_secs(config.timeout_secs);
    match config.transport {
        McpTransport::Command => {
            let command = config.command.clone().ok_or_else(|| RemoteError::Misconfigured {
                service: config.name.clone(),
                message: "command transport without command".to_string(),
            })?;
            let connector =
                CommandConnector::new(config.name.clone(), command, config.tool_filter.clone(), timeout);
            Ok(Box::new(RetryingConnector::new(connector, policy)))
        }
        McpTransport::Streamable => {
            let endpoint = config.endpoint.clone().ok_or_else(|| RemoteError::Misconfigured {
                service: config.name.clone(),
                message: "streamable transport without endpoint".to_string(),
            })?;
            let transport = RetryingTransport::new(
                format!("mcp:{}", config.name),
                reqwest::Client::new(),
                policy,
            );
            Ok(Box::new(StreamableHttpConnector::new(
                config.name.clone(),
                endpoint,
                Auth::from_mcp(config.auth.as_ref())?,
                timeout,
                config.tool_filter.clone(),
                transport,
            )))
        }
    }
}

/// A connected server and the tools it exposes.
#[derive(Debug)]
pub struct McpToolset {
    pub server: String,
    pub description: String,
    pub session: Arc<McpSession>,
    pub tools: Vec<RemoteTool>,
}

pub async fn open_toolset(
    connector: &dyn Connect,
    description: &str,
    cancel: &CancellationToken,
) -> Result<McpToolset, RemoteError> {
    let session = connector.connect(cancel).await?;
    let tools = session.list_tools(cancel).await?;
    Ok(McpToolset {
        server: connector.server().to_string(),
        description: description.to_string(),
        session: Arc::new(session),
        tools,
    })
}

/// Connects every enabled server. A server that cannot be reached or fails
/// to enumerate its tools is logged and left out.
pub async fn load_toolsets(
    servers: &[McpServerConfig],
    policy: RetryPolicy,
    cancel: &CancellationToken,
) -> Vec<McpToolset> {
    let mut toolsets = Vec::new();
    for config in servers.iter().filter(|server| server.enabled) {
        let opened = match connector_for(config, policy) {
            Ok(connector) => open_toolset(connector.as_ref(), &config.description, cancel).await,
            Err(error) => Err(error),
        };
        match opened {
            Ok(toolset) => {
                info!(
                    event_name = "remote.mcp.toolset_loaded",
                    server = %toolset.server,
                    tool_count = toolset.tools.len(),
                    "mcp toolset loaded"
                );
                toolsets.push(toolset);
            }
            Err(error) => {
                warn!(
                    event_name = "remote.mcp.toolset_skipped",
                    server = %config.name,
                    error = %error,
                    "mcp toolset unavailable; continuing without it"
                );
            }
        }
    }
    toolsets
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::io;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use kagent_core::config::{CommandSpec, McpServerConfig, McpTransport};
    use kagent_core::retry::RetryPolicy;
    use reqwest::{Request, Response};
    use serde_json::{json, Value};
    use tokio::sync::Mutex as AsyncMutex;
    use tokio_util::sync::CancellationToken;

    use super::{
        load_toolsets, Connect, McpSession, RetryingConnector, RpcChannel, StdioChannel,
        StreamableHttpConnector,
    };
    use crate::http::{Auth, RetryingTransport, RoundTrip, TransportError};
    use crate::RemoteError;

    struct CannedChannel {
        tools: Value,
        call_result: Value,
    }

    #[async_trait]
    impl RpcChannel for CannedChannel {
        async fn request(
            &self,
            _cancel: &CancellationToken,
            method: &str,
            _params: Value,
        ) -> Result<Value, RemoteError> {
            match method {
                "initialize" => Ok(json!({ "serverInfo": { "name": "canned" } })),
                "tools/list" => Ok(json!({ "tools": self.tools.clone() })),
                "tools/call" => Ok(self.call_result.clone()),
                other => Err(RemoteError::Rpc {
                    service: "canned".to_string(),
                    code: -32601,
                    message: format!("unknown method {other}"),
                }),
            }
        }

        async fn notify(&self, _method: &str, _params: Value) -> Result<(), RemoteError> {
            Ok(())
        }
    }

    fn canned(call_result: Value) -> Box<dyn RpcChannel> {
        Box::new(CannedChannel {
            tools: json!([
                { "name": "search", "description": "full text search", "inputSchema": { "type": "object" } },
                { "name": "delete_index" },
            ]),
            call_result,
        })
    }

    struct FlakyConnector {
        failures: AtomicUsize,
        attempts: AtomicUsize,
        kind: io::ErrorKind,
    }

    #[async_trait]
    impl Connect for FlakyConnector {
        fn server(&self) -> &str {
            "flaky"
        }

        async fn connect(&self, cancel: &CancellationToken) -> Result<McpSession, RemoteError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            let remaining = self.failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failures.store(remaining - 1, Ordering::SeqCst);
                return Err(RemoteError::Io(io::Error::new(self.kind, "connect failed")));
            }
            McpSession::initialize("flaky", canned(json!({})), Vec::new(), cancel).await
        }
    }

    #[tokio::test]
    async fn tool_filter_limits_listed_tools() {
        let cancel = CancellationToken::new();
        let session =
            McpSession::initialize("canned", canned(json!({})), vec!["search".to_string()], &cancel)
                .await
                .expect("session");

        let tools = session.list_tools(&cancel).await.expect("tools");

        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].name, "search");
        assert_eq!(tools[0].description, "full text search");
    }

    #[tokio::test]
    async fn tool_error_result_becomes_tool_failed() {
        let cancel = CancellationToken::new();
        let session = McpSession::initialize(
            "canned",
            canned(json!({ "isError": true, "content": [{ "type": "text", "text": "index locked" }] })),
            Vec::new(),
            &cancel,
        )
        .await
        .expect("session");

        let error = session.call_tool(&cancel, "search", json!({})).await.expect_err("tool failure");

        match error {
            RemoteError::ToolFailed { tool, message } => {
                assert_eq!(tool, "search");
                assert_eq!(message, "index locked");
            }
            other => panic!("expected tool failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn text_content_is_joined() {
        let cancel = CancellationToken::new();
        let session = McpSession::initialize(
            "canned",
            canned(json!({ "content": [{ "type": "text", "text": "a" }, { "type": "text", "text": "b" }] })),
            Vec::new(),
            &cancel,
        )
        .await
        .expect("session");

        let value = session.call_tool(&cancel, "search", json!({})).await.expect("result");
        assert_eq!(value, json!("a\nb"));
    }

    #[tokio::test(start_paused = true)]
    async fn connector_retries_transient_connect_failures() {
        let connector = RetryingConnector::new(
            FlakyConnector {
                failures: AtomicUsize::new(2),
                attempts: AtomicUsize::new(0),
                kind: io::ErrorKind::ConnectionRefused,
            },
            RetryPolicy::new(3, Duration::from_millis(50), Duration::from_secs(1), 2.0),
        );

        let session = connector.connect(&CancellationToken::new()).await.expect("eventual session");

        assert_eq!(session.server(), "flaky");
        assert_eq!(connector.inner.attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn connector_does_not_retry_fatal_failures() {
        let connector = RetryingConnector::new(
            FlakyConnector {
                failures: AtomicUsize::new(5),
                attempts: AtomicUsize::new(0),
                kind: io::ErrorKind::PermissionDenied,
            },
            RetryPolicy::default(),
        );

        let error = connector.connect(&CancellationToken::new()).await.expect_err("fatal");

        assert!(matches!(error, RemoteError::Io(ref err) if err.kind() == io::ErrorKind::PermissionDenied));
        assert_eq!(connector.inner.attempts.load(Ordering::SeqCst), 1);
    }

    #[derive(Default)]
    struct McpHttpServer {
        seen_sessions: AsyncMutex<VecDeque<Option<String>>>,
    }

    #[async_trait]
    impl RoundTrip for McpHttpServer {
        async fn round_trip(&self, request: Request) -> Result<Response, TransportError> {
            let session = request
                .headers()
                .get("mcp-session-id")
                .and_then(|value| value.to_str().ok())
                .map(str::to_string);
            self.seen_sessions.lock().await.push_back(session);

            let body: Value = request
                .body()
                .and_then(|body| body.as_bytes())
                .and_then(|bytes| serde_json::from_slice(bytes).ok())
                .unwrap_or(Value::Null);
            let id = body.get("id").cloned();
            let method = body.get("method").and_then(Value::as_str).unwrap_or_default();

            let builder = http::Response::builder();
            let response = match (method, id) {
                ("initialize", Some(id)) => builder
                    .status(200)
                    .header("content-type", "application/json")
                    .header("mcp-session-id", "session-42")
                    .body(json!({ "jsonrpc": "2.0", "id": id, "result": {} }).to_string()),
                ("tools/list", Some(id)) => builder
                    .status(200)
                    .header("content-type", "text/event-stream")
                    .body(format!(
                        "event: message\ndata: {}\n\n",
                        json!({ "jsonrpc": "2.0", "id": id, "result": { "tools": [{ "name": "lookup" }] } })
                    )),
                _ => builder.status(202).body(String::new()),
            };
            Ok(Response::from(response.expect("canned response should build")))
        }
    }

    #[tokio::test]
    async fn streamable_session_id_is_echoed_after_initialize() {
        let server = Arc::new(McpHttpServer::default());
        let connector = StreamableHttpConnector::new(
            "lookup",
            "http://lookup.internal/mcp",
            Auth::None,
            Duration::from_secs(5),
            Vec::new(),
            RetryingTransport::new("mcp:lookup", server.clone(), RetryPolicy::default()),
        );
        let cancel = CancellationToken::new();

        let session = connector.connect(&cancel).await.expect("session");
        let tools = session.list_tools(&cancel).await.expect("tools");

        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].name, "lookup");
        let seen: Vec<_> = server.seen_sessions.lock().await.iter().cloned().collect();
        assert_eq!(
            seen,
            vec![None, Some("session-42".to_string()), Some("session-42".to_string())]
        );
    }

    #[tokio::test]
    async fn unreachable_servers_are_skipped() {
        let servers = vec![McpServerConfig {
            name: "missing".to_string(),
            description: String::new(),
            enabled: true,
            transport: McpTransport::Command,
            command: Some(CommandSpec {
                path: "/nonexistent/kagent-mcp-server".to_string(),
                ..CommandSpec::default()
            }),
            endpoint: None,
            auth: None,
            tool_filter: Vec::new(),
            timeout_secs: 5,
        }];

        let toolsets = load_toolsets(&servers, RetryPolicy::default(), &CancellationToken::new()).await;

        assert!(toolsets.is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn interrupted_stdio_exchange_poisons_the_session() {
        let silent = CommandSpec { path: "sleep".to_string(), args: vec!["30".to_string()], ..CommandSpec::default() };
        let channel = StdioChannel::spawn("silent", &silent, Duration::from_millis(100)).expect("spawn sleep");
        let cancel = CancellationToken::new();

        let first = channel.request(&cancel, "tools/list", json!({})).await;
        assert!(
            matches!(first, Err(RemoteError::Io(ref error)) if error.kind() == io::ErrorKind::TimedOut),
            "{first:?}"
        );

        let started = tokio::time::Instant::now();
        let second = channel.request(&cancel, "tools/list", json!({})).await;
        assert!(
            matches!(second, Err(RemoteError::Io(ref error)) if error.kind() == io::ErrorKind::BrokenPipe),
            "{second:?}"
        );
        assert!(started.elapsed() < Duration::from_millis(100), "no second exchange is attempted");
        assert!(channel.notify("notifications/cancelled", json!({})).await.is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn cancelled_request_before_writing_keeps_the_session() {
        let silent = CommandSpec { path: "sleep".to_string(), args: vec!["30".to_string()], ..CommandSpec::default() };
        let channel = StdioChannel::spawn("silent", &silent, Duration::from_millis(100)).expect("spawn sleep");
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = channel.request(&cancel, "tools/list", json!({})).await;

        assert!(matches!(result, Err(RemoteError::Cancelled)));
        assert!(channel.notify("notifications/initialized", json!({})).await.is_ok());
    }
}
