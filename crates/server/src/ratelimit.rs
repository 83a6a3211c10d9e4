//! Per-client admission control with token buckets.
//!
//! Clients are identified by their direct peer address. `X-Forwarded-For` is
//! honoured only when that peer is a configured trusted proxy, so a client
//! cannot pick its own bucket by forging the header.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use axum::extract::{ConnectInfo, Request, State};
use axum::http::HeaderMap;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use kagent_core::config::{RateLimitConfig, DEFAULT_BURST, DEFAULT_REQUESTS_PER_SECOND};
use kagent_core::errors::ApplicationError;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::ApiError;
use crate::routes::RequestId;

pub const UNKNOWN_IDENTITY: &str = "unknown";
pub const FORWARDED_FOR: &str = "x-forwarded-for";
const UNASSIGNED_REQUEST_ID: &str = "unassigned";
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(300);

struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

impl Bucket {
    fn full(burst: f64, now: Instant) -> Self {
        Self { tokens: burst, last_refill: now }
    }

    fn try_take(&mut self, rate: f64, burst: f64, now: Instant) -> bool {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * rate).min(burst);
        self.last_refill = now;
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

type Buckets = RwLock<HashMap<String, Mutex<Bucket>>>;

/// Token buckets keyed by client identity, cleared wholesale on a fixed
/// interval by a background sweep.
pub struct RateLimiter {
    buckets: Arc<Buckets>,
    rate: f64,
    burst: f64,
    shutdown: CancellationToken,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl RateLimiter {
    /// Must be called inside a tokio runtime; the sweep runs as a task. A rate
    /// that is not a positive number, or a zero burst or interval, selects the
    /// default.
    pub fn new(requests_per_second: f64, burst: u32, sweep_interval: Duration) -> Self {
        let rate = if requests_per_second.is_finite() && requests_per_second > 0.0 {
            requests_per_second
        } else {
            DEFAULT_REQUESTS_PER_SECOND
        };
        let burst = if burst == 0 { DEFAULT_BURST } else { burst };
        let sweep_interval =
            if sweep_interval.is_zero() { DEFAULT_SWEEP_INTERVAL } else { sweep_interval };
        let buckets: Arc<Buckets> = Arc::default();
        let shutdown = CancellationToken::new();
        let sweeper = tokio::spawn(sweep(buckets.clone(), sweep_interval, shutdown.clone()));

        Self {
            buckets,
            rate,
            burst: f64::from(burst),
            shutdown,
            sweeper: Mutex::new(Some(sweeper)),
        }
    }

    pub fn from_config(config: &RateLimitConfig) -> Self {
        Self::new(
            config.requests_per_second,
            config.burst,
            Duration::from_secs(config.sweep_interval_secs),
        )
    }

    /// Takes one token from `identity`'s bucket, creating a full bucket on
    /// first sight.
    pub fn allow(&self, identity: &str) -> bool {
        let now = Instant::now();
        {
            let buckets = self.buckets.read().unwrap_or_else(PoisonError::into_inner);
            if let Some(bucket) = buckets.get(identity) {
                return bucket
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .try_take(self.rate, self.burst, now);
            }
        }

        let mut buckets = self.buckets.write().unwrap_or_else(PoisonError::into_inner);
        buckets
            .entry(identity.to_string())
            .or_insert_with(|| Mutex::new(Bucket::full(self.burst, now)))
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .try_take(self.rate, self.burst, now)
    }

    pub fn tracked_clients(&self) -> usize {
        self.buckets.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn requests_per_second(&self) -> f64 {
        self.rate
    }

    pub fn burst(&self) -> u32 {
        self.burst as u32
    }

    /// Stops the sweep. Safe to call more than once.
    pub fn close(&self) {
        self.shutdown.cancel();
        if let Some(handle) = self.sweeper.lock().unwrap_or_else(PoisonError::into_inner).take() {
            handle.abort();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}

impl Drop for RateLimiter {
    fn drop(&mut self) {
        self.close();
    }
}

async fn sweep(buckets: Arc<Buckets>, every: Duration, shutdown: CancellationToken) {
    let mut ticker = tokio::time::interval_at(Instant::now() + every, every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                let cleared = {
                    let mut buckets = buckets.write().unwrap_or_else(PoisonError::into_inner);
                    let cleared = buckets.len();
                    buckets.clear();
                    cleared
                };
                debug!(event_name = "server.rate_limit.swept", cleared, "rate limit buckets cleared");
            }
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct IpRange {
    network: IpAddr,
    prefix: u8,
}

impl IpRange {
    fn parse(entry: &str) -> Option<Self> {
        let (address, prefix) = match entry.split_once('/') {
            Some((address, prefix)) => (address.trim(), Some(prefix.trim().parse::<u8>().ok()?)),
            None => (entry, None),
        };
        let address = address.parse::<IpAddr>().ok()?.to_canonical();
        let width = if address.is_ipv4() { 32 } else { 128 };
        let prefix = prefix.unwrap_or(width);
        if prefix > width {
            return None;
        }
        Some(Self { network: mask(address, prefix), prefix })
    }

    fn contains(&self, ip: IpAddr) -> bool {
        let ip = ip.to_canonical();
        ip.is_ipv4() == self.network.is_ipv4() && mask(ip, self.prefix) == self.network
    }
}

fn mask(ip: IpAddr, prefix: u8) -> IpAddr {
    match ip {
        IpAddr::V4(ip) => {
            let bits = u32::from(ip);
            let mask = u32::MAX.checked_shl(32 - u32::from(prefix)).unwrap_or(0);
            IpAddr::V4((bits & mask).into())
        }
        IpAddr::V6(ip) => {
            let bits = u128::from(ip);
            let mask = u128::MAX.checked_shl(128 - u32::from(prefix)).unwrap_or(0);
            IpAddr::V6((bits & mask).into())
        }
    }
}

/// Peers allowed to speak for a client through `X-Forwarded-For`.
#[derive(Clone, Debug, Default)]
pub struct TrustedProxySet {
    ranges: Vec<IpRange>,
}

impl TrustedProxySet {
    /// Accepts plain addresses and CIDR ranges. Anything else is logged and
    /// skipped.
    pub fn parse<S: AsRef<str>>(entries: &[S]) -> Self {
        let mut ranges = Vec::new();
        for entry in entries {
            let entry = entry.as_ref().trim();
            if entry.is_empty() {
                continue;
            }
            match IpRange::parse(entry) {
                Some(range) => ranges.push(range),
                None => warn!(
                    event_name = "server.rate_limit.invalid_proxy",
                    proxy = %entry,
                    hint = "use an IP address (1.2.3.4) or CIDR notation (10.0.0.0/8)",
                    "invalid trusted proxy ignored"
                ),
            }
        }
        if !ranges.is_empty() {
            info!(event_name = "server.rate_limit.trusted_proxies", count = ranges.len(), "trusted proxies configured");
        }
        Self { ranges }
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    pub fn contains(&self, ip: IpAddr) -> bool {
        self.ranges.iter().any(|range| range.contains(ip))
    }
}

/// Resolves the identity a request is rate-limited under.
pub fn client_identity(peer: Option<SocketAddr>, headers: &HeaderMap, proxies: &TrustedProxySet) -> String {
    let Some(peer) = peer else {
        return UNKNOWN_IDENTITY.to_string();
    };
    let direct = peer.ip().to_canonical();

    if proxies.contains(direct) {
        let forwarded = headers
            .get(FORWARDED_FOR)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.split(',').next())
            .map(strip_port)
            .filter(|client| !client.is_empty());
        if let Some(client) = forwarded {
            return match client.parse::<IpAddr>() {
                Ok(ip) => ip.to_canonical().to_string(),
                Err(_) => client.to_string(),
            };
        }
    }
    direct.to_string()
}

/// `1.2.3.4:80` → `1.2.3.4`, `[::1]:80` → `::1`; bare IPv6 stays intact.
fn strip_port(entry: &str) -> &str {
    let entry = entry.trim();
    if let Some(rest) = entry.strip_prefix('[') {
        return rest.split_once(']').map(|(host, _)| host).unwrap_or(rest);
    }
    match entry.split_once(':') {
        Some((host, port)) if !port.contains(':') => host,
        _ => entry,
    }
}

#[derive(Clone)]
pub struct RateLimitState {
    pub limiter: Arc<RateLimiter>,
    pub proxies: Arc<TrustedProxySet>,
}

/// Rejected requests are answered here with 429 and never reach the router
/// behind this layer.
pub async fn enforce_rate_limit(
    State(state): State<RateLimitState>,
    request: Request,
    next: Next,
) -> Response {
    let peer = request.extensions().get::<ConnectInfo<SocketAddr>>().map(|info| info.0);
    let identity = client_identity(peer, request.headers(), &state.proxies);

    if !state.limiter.allow(&identity) {
        warn!(
            event_name = "server.rate_limit.rejected",
            client_ip = %identity,
            direct_ip = %peer.map(|peer| peer.ip().to_string()).unwrap_or_else(|| UNKNOWN_IDENTITY.to_string()),
            path = %request.uri().path(),
            method = %request.method(),
            "rate limit exceeded"
        );
        let correlation_id = request
            .extensions()
            .get::<RequestId>()
            .map(|id| id.0.as_str())
            .unwrap_or(UNASSIGNED_REQUEST_ID);
        return ApiError::from_application(ApplicationError::AdmissionRejected { identity }, correlation_id)
            .into_response();
    }
    next.run(request).await
}
