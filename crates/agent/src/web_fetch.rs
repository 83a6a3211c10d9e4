//! `fetch_url`: retrieves a public web page as plain text.
//!
//! Requests leave with a fixed, minimal header set and only after the target
//! passes the address guard in [`validate_url`].

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use kagent_core::config::WebFetchConfig;
use kagent_core::retry::{RetryError, RetryPolicy};
use kagent_remote::{RetryingTransport, RoundTrip, TransportError};
use reqwest::header::{ACCEPT, CONTENT_TYPE, USER_AGENT};
use reqwest::redirect;
use reqwest::{Response, StatusCode, Url};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::{debug, warn};

use crate::parallel::TaskContext;
use crate::tools::Tool;

pub const FETCH_URL: &str = "fetch_url";
pub const DEFAULT_MAX_LENGTH: usize = 10_000;
const MAX_REDIRECTS: usize = 5;
const FETCH_USER_AGENT: &str = "kagent/1.0 (web content fetcher)";
const FETCH_ACCEPT: &str = "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8";
const BLOCKED_HOSTS: &[&str] = &["localhost", "metadata.google.internal", "169.254.169.254"];

#[derive(Debug, Deserialize)]
struct FetchUrlArgs {
    #[serde(default)]
    url: String,
    #[serde(default)]
    max_length: Option<usize>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct FetchUrlResult {
    pub success: bool,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub content: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub error: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub content_type: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub final_url: String,
}

impl FetchUrlResult {
    fn failed(error: impl Into<String>) -> Self {
        Self { error: error.into(), ..Self::default() }
    }
}

pub struct FetchUrlTool<T = reqwest::Client> {
    client: reqwest::Client,
    transport: RetryingTransport<T>,
    timeout: Duration,
    default_max_length: usize,
}

impl FetchUrlTool<reqwest::Client> {
    /// Redirects are followed only while each hop passes the static host
    /// checks.
    pub fn from_config(config: &WebFetchConfig, policy: RetryPolicy) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .redirect(redirect::Policy::custom(|attempt| {
                if attempt.previous().len() >= MAX_REDIRECTS {
                    return attempt.error("too many redirects");
                }
                match check_static(attempt.url()) {
                    Ok(()) => attempt.follow(),
                    Err(reason) => attempt.error(reason),
                }
            }))
            .build()?;
        Ok(Self::with_transport(config, RetryingTransport::new(FETCH_URL, client, policy)))
    }
}

impl<T: RoundTrip> FetchUrlTool<T> {
    pub fn with_transport(config: &WebFetchConfig, transport: RetryingTransport<T>) -> Self {
        Self {
            client: reqwest::Client::new(),
            transport,
            timeout: Duration::from_secs(config.timeout_secs),
            default_max_length: if config.default_max_length == 0 {
                DEFAULT_MAX_LENGTH
            } else {
                config.default_max_length
            },
        }
    }

    pub async fn fetch(&self, ctx: &TaskContext, raw_url: &str, max_length: Option<usize>) -> FetchUrlResult {
        if raw_url.trim().is_empty() {
            return FetchUrlResult::failed("URL cannot be empty");
        }
        let url = match validate_url(raw_url).await {
            Ok(url) => url,
            Err(reason) => {
                warn!(event_name = "agent.web_fetch.blocked", url = %raw_url, reason = %reason, "url rejected");
                return FetchUrlResult::failed(format!("URL validation failed: {reason}"));
            }
        };
        let max_length = max_length.filter(|length| *length > 0).unwrap_or(self.default_max_length);

        let request = match self
            .client
            .get(url)
            .timeout(self.timeout)
            .header(USER_AGENT, FETCH_USER_AGENT)
            .header(ACCEPT, FETCH_ACCEPT)
            .build()
        {
            Ok(request) => request,
            Err(error) => return FetchUrlResult::failed(format!("Failed to create request: {error}")),
        };

        let response = match self.transport.send(ctx.cancellation(), request).await {
            Ok(response) => response,
            Err(RetryError::Cancelled) => return FetchUrlResult::failed("Fetch cancelled"),
            Err(error) => return FetchUrlResult::failed(format!("Failed to fetch URL: {error}")),
        };

        let final_url = response.url().to_string();
        let status = response.status();
        if status != StatusCode::OK {
            return FetchUrlResult {
                error: format!("HTTP {}: {}", status.as_u16(), status.canonical_reason().unwrap_or("unknown status")),
                final_url,
                ..FetchUrlResult::default()
            };
        }

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default()
            .to_string();
        let body = match read_capped(response, max_length).await {
            Ok(body) => body,
            Err(error) => {
                return FetchUrlResult {
                    error: format!("Failed to read content: {error}"),
                    final_url,
                    ..FetchUrlResult::default()
                }
            }
        };

        let raw = String::from_utf8_lossy(&body);
        let content = if content_type.to_ascii_lowercase().contains("text/html") {
            clean_html(&raw)
        } else {
            raw.into_owned()
        };
        debug!(
            event_name = "agent.web_fetch.fetched",
            url = %final_url,
            content_type = %content_type,
            bytes = body.len(),
            content_len = content.len(),
            "page fetched"
        );

        FetchUrlResult { success: true, content, error: String::new(), content_type, final_url }
    }
}

/// Reads at most `limit` bytes of the body; the rest is never pulled off the
/// connection.
async fn read_capped(mut response: Response, limit: usize) -> reqwest::Result<Vec<u8>> {
    let mut body = Vec::with_capacity(limit.min(64 * 1024));
    while body.len() < limit {
        let Some(chunk) = response.chunk().await? else {
            break;
        };
        let take = chunk.len().min(limit - body.len());
        body.extend_from_slice(&chunk[..take]);
    }
    Ok(body)
}

#[async_trait]
impl<T: RoundTrip + 'static> Tool for FetchUrlTool<T> {
    fn name(&self) -> &str {
        FETCH_URL
    }

    fn description(&self) -> &str {
        "Fetch a public web page and return its readable text. Internal and private addresses are refused."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "url": { "type": "string" },
                "max_length": { "type": "integer", "minimum": 1 }
            },
            "required": ["url"]
        })
    }

    async fn execute(&self, ctx: &TaskContext, input: Map<String, Value>) -> Result<Value> {
        let args: FetchUrlArgs = serde_json::from_value(Value::Object(input))?;
        let result = self.fetch(ctx, &args.url, args.max_length).await;
        Ok(serde_json::to_value(result)?)
    }
}

/// Rejects URLs that could reach loopback, private, link-local or metadata
/// addresses. Hostnames are resolved; a lookup failure is left for the fetch
/// itself to report.
pub async fn validate_url(raw: &str) -> Result<Url, String> {
    let url = Url::parse(raw).map_err(|error| format!("invalid URL format: {error}"))?;
    check_static(&url)?;

    if host_ip(&url).is_some() {
        return Ok(url);
    }
    let Some(host) = url.host_str() else {
        return Err("URL must have a valid hostname".to_string());
    };

    let port = url.port_or_known_default().unwrap_or(80);
    if let Ok(addresses) = tokio::net::lookup_host((host, port)).await {
        for address in addresses {
            if is_private_ip(address.ip()) {
                return Err(format!(
                    "access to private/internal IP addresses is not allowed (resolved to {})",
                    address.ip()
                ));
            }
        }
    }
    Ok(url)
}

/// Checks that need no DNS: scheme, blocked names and literal addresses.
fn check_static(url: &Url) -> Result<(), String> {
    let scheme = url.scheme();
    if scheme != "http" && scheme != "https" {
        return Err(format!("unsupported URL scheme '{scheme}': only http and https are allowed"));
    }
    if let Some(ip) = host_ip(url) {
        return reject_private(ip);
    }

    let name = url.host_str().unwrap_or_default().trim_end_matches('.').to_ascii_lowercase();
    if name.is_empty() {
        return Err("URL must have a valid hostname".to_string());
    }
    if BLOCKED_HOSTS.contains(&name.as_str()) {
        return Err(format!("access to '{name}' is not allowed (localhost/metadata service)"));
    }
    if name.ends_with(".svc.cluster.local") {
        return Err("access to Kubernetes internal services (*.svc.cluster.local) is not allowed".to_string());
    }
    Ok(())
}

/// The host as an address when it is written as one; IPv6 hosts come
/// bracketed.
fn host_ip(url: &Url) -> Option<IpAddr> {
    let host = url.host_str()?;
    host.trim_start_matches('[').trim_end_matches(']').parse().ok()
}

fn reject_private(ip: IpAddr) -> Result<(), String> {
    if is_private_ip(ip) {
        return Err(format!("access to private/internal IP addresses is not allowed ({ip})"));
    }
    Ok(())
}

pub fn is_private_ip(ip: IpAddr) -> bool {
    match ip.to_canonical() {
        IpAddr::V4(ip) => is_private_v4(ip),
        IpAddr::V6(ip) => is_private_v6(ip),
    }
}

fn is_private_v4(ip: Ipv4Addr) -> bool {
    let [a, b, c, _] = ip.octets();
    ip.is_private()
        || ip.is_loopback()
        || ip.is_link_local()
        || ip.is_documentation()
        || ip.is_multicast()
        || ip.is_broadcast()
        || a == 0
        || (a == 100 && (64..128).contains(&b))
        || (a == 192 && b == 0 && c == 0)
        || (a == 198 && (b == 18 || b == 19))
        || a >= 240
}

fn is_private_v6(ip: Ipv6Addr) -> bool {
    let first = ip.segments()[0];
    ip.is_loopback()
        || ip.is_unspecified()
        || (first & 0xffc0) == 0xfe80
        || (first & 0xfe00) == 0xfc00
        || (first & 0xff0f) == 0xff02
}

/// Drops `<script>` and `<style>` blocks, then every tag, and squeezes
/// runs of blank space.
pub fn clean_html(html: &str) -> String {
    let html = remove_blocks(html, "script");
    let html = remove_blocks(&html, "style");

    let mut text = String::with_capacity(html.len());
    let mut in_tag = false;
    for ch in html.chars() {
        match ch {
            '<' => {
                in_tag = true;
                text.push(' ');
            }
            '>' => {
                in_tag = false;
                text.push(' ');
            }
            _ if !in_tag => text.push(ch),
            _ => {}
        }
    }

    let mut lines = Vec::new();
    let mut blank_run = 0;
    for line in text.lines() {
        let line = line.split_whitespace().collect::<Vec<_>>().join(" ");
        if line.is_empty() {
            blank_run += 1;
            if blank_run > 1 {
                continue;
            }
        } else {
            blank_run = 0;
        }
        lines.push(line);
    }
    lines.join("\n").trim().to_string()
}

fn remove_blocks(html: &str, tag: &str) -> String {
    let lower = html.to_ascii_lowercase();
    let open = format!("<{tag}");
    let close = format!("</{tag}>");

    let mut out = String::with_capacity(html.len());
    let mut cursor = 0;
    while let Some(start) = lower[cursor..].find(&open).map(|offset| cursor + offset) {
        let Some(end) = lower[start..].find(&close).map(|offset| start + offset + close.len()) else {
            break;
        };
        out.push_str(&html[cursor..start]);
        cursor = end;
    }
    out.push_str(&html[cursor..]);
    out
}
