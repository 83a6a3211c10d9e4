use std::collections::{BTreeMap, HashSet};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::retry::RetryPolicy;

pub const DEFAULT_SEQUENTIAL_TOOLS: &[&str] = &["save_to_memory"];
pub const DEFAULT_REQUESTS_PER_SECOND: f64 = 10.0;
pub const DEFAULT_BURST: u32 = 20;

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub parallel: ParallelConfig,
    pub mcp: McpConfig,
    pub a2a: A2aConfig,
    pub tools: ToolsConfig,
    pub logging: LoggingConfig,
}

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub bind_address: String,
    pub port: u16,
    pub request_timeout_secs: u64,
    pub graceful_shutdown_secs: u64,
    /// IPs or CIDR ranges whose `X-Forwarded-For` header is honoured.
    pub trusted_proxies: Vec<String>,
    pub rate_limit: RateLimitConfig,
}

#[derive(Clone, Debug)]
pub struct RateLimitConfig {
    pub enabled: bool,
    pub requests_per_second: f64,
    pub burst: u32,
    pub sweep_interval_secs: u64,
}

#[derive(Clone, Debug)]
pub struct ParallelConfig {
    pub enabled: bool,
    pub max_parallelism: usize,
    pub tool_timeout_secs: u64,
    pub sequential_tools: Vec<String>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct RetryConfig {
    pub enabled: bool,
    pub max_retries: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
}

#[derive(Clone, Debug)]
pub struct McpConfig {
    pub enabled: bool,
    pub retry: RetryConfig,
    pub servers: Vec<McpServerConfig>,
}

#[derive(Clone, Debug)]
pub struct McpServerConfig {
    pub name: String,
    pub description: String,
    pub enabled: bool,
    pub transport: McpTransport,
    pub command: Option<CommandSpec>,
    pub endpoint: Option<String>,
    pub auth: Option<McpAuthConfig>,
    pub tool_filter: Vec<String>,
    pub timeout_secs: u64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
pub struct CommandSpec {
    pub path: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

#[derive(Clone, Debug)]
pub enum McpAuthConfig {
    Bearer { token: Option<SecretString>, token_env: Option<String> },
    Basic { username: String, password: Option<SecretString> },
}

#[derive(Clone, Debug)]
pub struct A2aConfig {
    pub enabled: bool,
    pub retry: RetryConfig,
    pub sub_agents: Vec<SubAgentConfig>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SubAgentConfig {
    pub name: String,
    pub description: String,
    pub endpoint: String,
    pub auth: SubAgentAuth,
    pub timeout_secs: u64,
}

/// Credentials are resolved from the named environment variable at call time.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SubAgentAuth {
    None,
    ApiKey { header: String, key_env: String },
    Bearer { token_env: String },
}

#[derive(Clone, Debug)]
pub struct ToolsConfig {
    pub web_fetch: WebFetchConfig,
}

#[derive(Clone, Debug)]
pub struct WebFetchConfig {
    pub enabled: bool,
    pub timeout_secs: u64,
    pub default_max_length: usize,
}

#[derive(Clone, Debug)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum McpTransport {
    Command,
    Streamable,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Compact,
    Pretty,
    Json,
}

#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    pub bind_address: Option<String>,
    pub port: Option<u16>,
    pub log_level: Option<String>,
    pub trusted_proxies: Option<Vec<String>>,
    pub rate_limit_enabled: Option<bool>,
    pub rate_limit_rps: Option<f64>,
    pub rate_limit_burst: Option<u32>,
    pub parallel_enabled: Option<bool>,
    pub max_parallelism: Option<usize>,
    pub tool_timeout_secs: Option<u64>,
    pub mcp_enabled: Option<bool>,
    pub a2a_enabled: Option<bool>,
}

#[derive(Clone, Debug, Default)]
pub struct LoadOptions {
    pub config_path: Option<PathBuf>,
    pub require_file: bool,
    pub overrides: ConfigOverrides,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config file `{path}`: {source}")]
    ReadFile { path: PathBuf, source: std::io::Error },
    #[error("could not parse config file `{path}`: {source}")]
    ParseFile { path: PathBuf, source: toml::de::Error },
    #[error("required config file was not found: `{0}`")]
    MissingConfigFile(PathBuf),
    #[error("environment variable interpolation failed for `{var}`")]
    MissingEnvInterpolation { var: String },
    #[error("unterminated environment interpolation expression")]
    UnterminatedInterpolation,
    #[error("invalid environment override for `{key}`: `{value}`")]
    InvalidEnvOverride { key: String, value: String },
    #[error("configuration validation failed: {0}")]
    Validation(String),
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                bind_address: "0.0.0.0".to_string(),
                port: 8081,
                request_timeout_secs: 120,
                graceful_shutdown_secs: 15,
                trusted_proxies: Vec::new(),
                rate_limit: RateLimitConfig {
                    enabled: true,
                    requests_per_second: DEFAULT_REQUESTS_PER_SECOND,
                    burst: DEFAULT_BURST,
                    sweep_interval_secs: 300,
                },
            },
            parallel: ParallelConfig {
                enabled: true,
                max_parallelism: 5,
                tool_timeout_secs: 120,
                sequential_tools: DEFAULT_SEQUENTIAL_TOOLS
                    .iter()
                    .map(|tool| tool.to_string())
                    .collect(),
            },
            mcp: McpConfig { enabled: false, retry: RetryConfig::default(), servers: Vec::new() },
            a2a: A2aConfig { enabled: false, retry: RetryConfig::default(), sub_agents: Vec::new() },
            tools: ToolsConfig {
                web_fetch: WebFetchConfig {
                    enabled: true,
                    timeout_secs: 30,
                    default_max_length: 10_000,
                },
            },
            logging: LoggingConfig { level: "info".to_string(), format: LogFormat::Compact },
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_retries: 3,
            initial_delay_ms: 500,
            max_delay_ms: 30_000,
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// A disabled config still yields a usable policy that makes exactly one attempt.
    pub fn policy(&self) -> RetryPolicy {
        if !self.enabled {
            return RetryPolicy::single_attempt();
        }
        RetryPolicy::new(
            self.max_retries,
            Duration::from_millis(self.initial_delay_ms),
            Duration::from_millis(self.max_delay_ms),
            self.backoff_multiplier,
        )
    }

    fn apply_patch(&mut self, patch: RetryPatch) {
        if let Some(enabled) = patch.enabled {
            self.enabled = enabled;
        }
        if let Some(max_retries) = patch.max_retries {
            self.max_retries = max_retries;
        }
        if let Some(initial_delay_ms) = patch.initial_delay_ms {
            self.initial_delay_ms = initial_delay_ms;
        }
        if let Some(max_delay_ms) = patch.max_delay_ms {
            self.max_delay_ms = max_delay_ms;
        }
        if let Some(backoff_multiplier) = patch.backoff_multiplier {
            self.backoff_multiplier = backoff_multiplier;
        }
    }
}

impl ParallelConfig {
    pub fn tool_timeout(&self) -> Duration {
        Duration::from_secs(self.tool_timeout_secs)
    }
}

fn secret_value(value: String) -> SecretString {
    value.into()
}

impl std::str::FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "compact" => Ok(Self::Compact),
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(ConfigError::Validation(format!(
                "unsupported log format `{other}` (expected compact|pretty|json)"
            ))),
        }
    }
}

impl AppConfig {
    pub fn load(options: LoadOptions) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        let maybe_path = resolve_config_path(options.config_path.as_deref());

        if let Some(path) = maybe_path {
            let patch = read_patch(&path)?;
            config.apply_patch(patch)?;
        } else if options.require_file {
            let expected = options.config_path.unwrap_or_else(|| PathBuf::from("kagent.toml"));
            return Err(ConfigError::MissingConfigFile(expected));
        }

        config.apply_env_overrides()?;
        config.apply_overrides(options.overrides);
        config.validate()?;

        Ok(config)
    }

    fn apply_patch(&mut self, patch: ConfigPatch) -> Result<(), ConfigError> {
        if let Some(server) = patch.server {
            if let Some(bind_address) = server.bind_address {
                self.server.bind_address = bind_address;
            }
            if let Some(port) = server.port {
                self.server.port = port;
            }
            if let Some(request_timeout_secs) = server.request_timeout_secs {
                self.server.request_timeout_secs = request_timeout_secs;
            }
            if let Some(graceful_shutdown_secs) = server.graceful_shutdown_secs {
                self.server.graceful_shutdown_secs = graceful_shutdown_secs;
            }
            if let Some(trusted_proxies) = server.trusted_proxies {
                self.server.trusted_proxies = trusted_proxies;
            }
            if let Some(rate_limit) = server.rate_limit {
                let target = &mut self.server.rate_limit;
                if let Some(enabled) = rate_limit.enabled {
                    target.enabled = enabled;
                }
                if let Some(requests_per_second) = rate_limit.requests_per_second {
                    target.requests_per_second = requests_per_second;
                }
                if let Some(burst) = rate_limit.burst {
                    target.burst = burst;
                }
                if let Some(sweep_interval_secs) = rate_limit.sweep_interval_secs {
                    target.sweep_interval_secs = sweep_interval_secs;
                }
            }
        }

        if let Some(parallel) = patch.parallel {
            if let Some(enabled) = parallel.enabled {
                self.parallel.enabled = enabled;
            }
            if let Some(max_parallelism) = parallel.max_parallelism {
                self.parallel.max_parallelism = max_parallelism;
            }
            if let Some(tool_timeout_secs) = parallel.tool_timeout_secs {
                self.parallel.tool_timeout_secs = tool_timeout_secs;
            }
            if let Some(sequential_tools) = parallel.sequential_tools {
                self.parallel.sequential_tools = sequential_tools;
            }
        }

        if let Some(mcp) = patch.mcp {
            if let Some(enabled) = mcp.enabled {
                self.mcp.enabled = enabled;
            }
            if let Some(retry) = mcp.retry {
                self.mcp.retry.apply_patch(retry);
            }
            if let Some(servers) = mcp.servers {
                self.mcp.servers =
                    servers.into_iter().map(McpServerPatch::into_config).collect::<Result<_, _>>()?;
            }
        }

        if let Some(a2a) = patch.a2a {
            if let Some(enabled) = a2a.enabled {
                self.a2a.enabled = enabled;
            }
            if let Some(retry) = a2a.retry {
                self.a2a.retry.apply_patch(retry);
            }
            if let Some(sub_agents) = a2a.sub_agents {
                self.a2a.sub_agents = sub_agents
                    .into_iter()
                    .map(SubAgentPatch::into_config)
                    .collect::<Result<_, _>>()?;
            }
        }

        if let Some(web_fetch) = patch.tools.and_then(|tools| tools.web_fetch) {
            let target = &mut self.tools.web_fetch;
            if let Some(enabled) = web_fetch.enabled {
                target.enabled = enabled;
            }
            if let Some(timeout_secs) = web_fetch.timeout_secs {
                target.timeout_secs = timeout_secs;
            }
            if let Some(default_max_length) = web_fetch.default_max_length {
                target.default_max_length = default_max_length;
            }
        }

        if let Some(logging) = patch.logging {
            if let Some(level) = logging.level {
                self.logging.level = level;
            }
            if let Some(format) = logging.format {
                self.logging.format = format;
            }
        }

        Ok(())
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Some(value) = read_env("KAGENT_SERVER_BIND_ADDRESS") {
            self.server.bind_address = value;
        }
        if let Some(value) = read_env("KAGENT_SERVER_PORT") {
            self.server.port = parse_u16("KAGENT_SERVER_PORT", &value)?;
        }
        if let Some(value) = read_env("KAGENT_SERVER_REQUEST_TIMEOUT_SECS") {
            self.server.request_timeout_secs =
                parse_u64("KAGENT_SERVER_REQUEST_TIMEOUT_SECS", &value)?;
        }
        if let Some(value) = read_env("KAGENT_TRUSTED_PROXIES") {
            self.server.trusted_proxies = parse_list(&value);
        }

        if let Some(value) = read_env("KAGENT_RATE_LIMIT_ENABLED") {
            self.server.rate_limit.enabled = parse_bool("KAGENT_RATE_LIMIT_ENABLED", &value)?;
        }
        if let Some(value) = read_env("KAGENT_RATE_LIMIT_RPS") {
            self.server.rate_limit.requests_per_second =
                parse_f64("KAGENT_RATE_LIMIT_RPS", &value)?;
        }
        if let Some(value) = read_env("KAGENT_RATE_LIMIT_BURST") {
            self.server.rate_limit.burst = parse_u32("KAGENT_RATE_LIMIT_BURST", &value)?;
        }

        if let Some(value) = read_env("KAGENT_PARALLEL_ENABLED") {
            self.parallel.enabled = parse_bool("KAGENT_PARALLEL_ENABLED", &value)?;
        }
        if let Some(value) = read_env("KAGENT_PARALLEL_MAX") {
            self.parallel.max_parallelism = parse_usize("KAGENT_PARALLEL_MAX", &value)?;
        }
        if let Some(value) = read_env("KAGENT_PARALLEL_TOOL_TIMEOUT_SECS") {
            self.parallel.tool_timeout_secs =
                parse_u64("KAGENT_PARALLEL_TOOL_TIMEOUT_SECS", &value)?;
        }
        if let Some(value) = read_env("KAGENT_PARALLEL_SEQUENTIAL_TOOLS") {
            self.parallel.sequential_tools = parse_list(&value);
        }

        if let Some(value) = read_env("KAGENT_MCP_ENABLED") {
            self.mcp.enabled = parse_bool("KAGENT_MCP_ENABLED", &value)?;
        }
        if let Some(value) = read_env("KAGENT_A2A_ENABLED") {
            self.a2a.enabled = parse_bool("KAGENT_A2A_ENABLED", &value)?;
        }

        let log_level = read_env("KAGENT_LOGGING_LEVEL").or_else(|| read_env("KAGENT_LOG_LEVEL"));
        if let Some(value) = log_level {
            self.logging.level = value;
        }
        let log_format =
            read_env("KAGENT_LOGGING_FORMAT").or_else(|| read_env("KAGENT_LOG_FORMAT"));
        if let Some(value) = log_format {
            self.logging.format = value.parse()?;
        }

        Ok(())
    }

    fn apply_overrides(&mut self, overrides: ConfigOverrides) {
        if let Some(bind_address) = overrides.bind_address {
            self.server.bind_address = bind_address;
        }
        if let Some(port) = overrides.port {
            self.server.port = port;
        }
        if let Some(log_level) = overrides.log_level {
            self.logging.level = log_level;
        }
        if let Some(trusted_proxies) = overrides.trusted_proxies {
            self.server.trusted_proxies = trusted_proxies;
        }
        if let Some(enabled) = overrides.rate_limit_enabled {
            self.server.rate_limit.enabled = enabled;
        }
        if let Some(rps) = overrides.rate_limit_rps {
            self.server.rate_limit.requests_per_second = rps;
        }
        if let Some(burst) = overrides.rate_limit_burst {
            self.server.rate_limit.burst = burst;
        }
        if let Some(enabled) = overrides.parallel_enabled {
            self.parallel.enabled = enabled;
        }
        if let Some(max_parallelism) = overrides.max_parallelism {
            self.parallel.max_parallelism = max_parallelism;
        }
        if let Some(tool_timeout_secs) = overrides.tool_timeout_secs {
            self.parallel.tool_timeout_secs = tool_timeout_secs;
        }
        if let Some(enabled) = overrides.mcp_enabled {
            self.mcp.enabled = enabled;
        }
        if let Some(enabled) = overrides.a2a_enabled {
            self.a2a.enabled = enabled;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_server(&self.server)?;
        validate_parallel(&self.parallel)?;
        validate_retry("mcp.retry", &self.mcp.retry)?;
        validate_mcp_servers(&self.mcp.servers)?;
        validate_retry("a2a.retry", &self.a2a.retry)?;
        validate_sub_agents(&self.a2a.sub_agents)?;
        validate_web_fetch(&self.tools.web_fetch)?;
        validate_logging(&self.logging)?;
        Ok(())
    }
}

fn resolve_config_path(explicit_path: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit_path {
        return path.exists().then_some(path.to_path_buf());
    }

    [PathBuf::from("kagent.toml"), PathBuf::from("config/kagent.toml")]
        .into_iter()
        .find(|path| path.exists())
}

fn read_patch(path: &Path) -> Result<ConfigPatch, ConfigError> {
    let raw = fs::read_to_string(path)
        .map_err(|source| ConfigError::ReadFile { path: path.to_path_buf(), source })?;

    let interpolated = interpolate_env_vars(&raw)?;
    toml::from_str::<ConfigPatch>(&interpolated)
        .map_err(|source| ConfigError::ParseFile { path: path.to_path_buf(), source })
}

fn interpolate_env_vars(input: &str) -> Result<String, ConfigError> {
    let mut output = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch != '$' || !matches!(chars.peek(), Some('{')) {
            output.push(ch);
            continue;
        }
        chars.next();

        let mut key = String::new();
        loop {
            match chars.next() {
                Some('}') => break,
                Some(next) => key.push(next),
                None => return Err(ConfigError::UnterminatedInterpolation),
            }
        }

        let value =
            env::var(&key).map_err(|_| ConfigError::MissingEnvInterpolation { var: key.clone() })?;
        output.push_str(&value);
    }

    Ok(output)
}

fn validate_server(server: &ServerConfig) -> Result<(), ConfigError> {
    if server.port == 0 {
        return Err(ConfigError::Validation("server.port must be greater than zero".to_string()));
    }
    if server.request_timeout_secs == 0 {
        return Err(ConfigError::Validation(
            "server.request_timeout_secs must be greater than zero".to_string(),
        ));
    }
    if server.graceful_shutdown_secs == 0 {
        return Err(ConfigError::Validation(
            "server.graceful_shutdown_secs must be greater than zero".to_string(),
        ));
    }

    let rate_limit = &server.rate_limit;
    if !rate_limit.requests_per_second.is_finite() || rate_limit.requests_per_second <= 0.0 {
        return Err(ConfigError::Validation(
            "server.rate_limit.requests_per_second must be a positive number".to_string(),
        ));
    }
    if rate_limit.burst == 0 {
        return Err(ConfigError::Validation(
            "server.rate_limit.burst must be at least 1".to_string(),
        ));
    }
    if rate_limit.sweep_interval_secs == 0 {
        return Err(ConfigError::Validation(
            "server.rate_limit.sweep_interval_secs must be greater than zero".to_string(),
        ));
    }

    Ok(())
}

fn validate_parallel(parallel: &ParallelConfig) -> Result<(), ConfigError> {
    if parallel.max_parallelism > 1024 {
        return Err(ConfigError::Validation(
            "parallel.max_parallelism must be in range 0..=1024 (0 selects the default of 5)"
                .to_string(),
        ));
    }
    if parallel.sequential_tools.iter().any(|tool| tool.trim().is_empty()) {
        return Err(ConfigError::Validation(
            "parallel.sequential_tools must not contain empty names".to_string(),
        ));
    }
    Ok(())
}

fn validate_retry(section: &str, retry: &RetryConfig) -> Result<(), ConfigError> {
    if !retry.backoff_multiplier.is_finite() {
        return Err(ConfigError::Validation(format!(
            "{section}.backoff_multiplier must be a finite number"
        )));
    }
    if retry.max_retries > 20 {
        return Err(ConfigError::Validation(format!("{section}.max_retries must be at most 20")));
    }
    Ok(())
}

fn validate_mcp_servers(servers: &[McpServerConfig]) -> Result<(), ConfigError> {
    let mut seen = HashSet::new();
    for server in servers {
        if server.name.trim().is_empty() {
            return Err(ConfigError::Validation("mcp.servers[].name is required".to_string()));
        }
        if !seen.insert(server.name.as_str()) {
            return Err(ConfigError::Validation(format!(
                "mcp server `{}` is declared more than once",
                server.name
            )));
        }
        match server.transport {
            McpTransport::Command => {
                let missing =
                    server.command.as_ref().map(|cmd| cmd.path.trim().is_empty()).unwrap_or(true);
                if missing {
                    return Err(ConfigError::Validation(format!(
                        "mcp server `{}` uses the command transport but has no command.path",
                        server.name
                    )));
                }
            }
            McpTransport::Streamable => {
                let endpoint = server.endpoint.as_deref().unwrap_or_default();
                if !is_http_url(endpoint) {
                    return Err(ConfigError::Validation(format!(
                        "mcp server `{}` endpoint must start with http:// or https://",
                        server.name
                    )));
                }
            }
        }
        if let Some(McpAuthConfig::Bearer { token: None, token_env: None }) = &server.auth {
            return Err(ConfigError::Validation(format!(
                "mcp server `{}` bearer auth needs either token or token_env",
                server.name
            )));
        }
    }
    Ok(())
}

fn validate_sub_agents(sub_agents: &[SubAgentConfig]) -> Result<(), ConfigError> {
    let mut seen = HashSet::new();
    for agent in sub_agents {
        if agent.name.trim().is_empty() {
            return Err(ConfigError::Validation("a2a.sub_agents[].name is required".to_string()));
        }
        if !seen.insert(agent.name.as_str()) {
            return Err(ConfigError::Validation(format!(
                "sub-agent `{}` is declared more than once",
                agent.name
            )));
        }
        if !is_http_url(&agent.endpoint) {
            return Err(ConfigError::Validation(format!(
                "sub-agent `{}` endpoint must start with http:// or https://",
                agent.name
            )));
        }
        if agent.timeout_secs == 0 {
            return Err(ConfigError::Validation(format!(
                "sub-agent `{}` timeout_secs must be greater than zero",
                agent.name
            )));
        }
    }
    Ok(())
}

fn validate_web_fetch(web_fetch: &WebFetchConfig) -> Result<(), ConfigError> {
    if web_fetch.timeout_secs == 0 || web_fetch.timeout_secs > 300 {
        return Err(ConfigError::Validation(
            "tools.web_fetch.timeout_secs must be in range 1..=300".to_string(),
        ));
    }
    if web_fetch.default_max_length == 0 {
        return Err(ConfigError::Validation(
            "tools.web_fetch.default_max_length must be greater than zero".to_string(),
        ));
    }
    Ok(())
}

fn validate_logging(logging: &LoggingConfig) -> Result<(), ConfigError> {
    let level = logging.level.trim().to_ascii_lowercase();
    match level.as_str() {
        "trace" | "debug" | "info" | "warn" | "error" => Ok(()),
        _ => Err(ConfigError::Validation(
            "logging.level must be one of trace|debug|info|warn|error".to_string(),
        )),
    }
}

fn is_http_url(value: &str) -> bool {
    value.starts_with("http://") || value.starts_with("https://")
}

fn read_env(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn parse_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(str::to_string)
        .collect()
}

fn invalid_override(key: &str, value: &str) -> ConfigError {
    ConfigError::InvalidEnvOverride { key: key.to_string(), value: value.to_string() }
}

fn parse_u16(key: &str, value: &str) -> Result<u16, ConfigError> {
    value.parse::<u16>().map_err(|_| invalid_override(key, value))
}

fn parse_u32(key: &str, value: &str) -> Result<u32, ConfigError> {
    value.parse::<u32>().map_err(|_| invalid_override(key, value))
}

fn parse_u64(key: &str, value: &str) -> Result<u64, ConfigError> {
    value.parse::<u64>().map_err(|_| invalid_override(key, value))
}

fn parse_usize(key: &str, value: &str) -> Result<usize, ConfigError> {
    value.parse::<usize>().map_err(|_| invalid_override(key, value))
}

fn parse_f64(key: &str, value: &str) -> Result<f64, ConfigError> {
    value.parse::<f64>().map_err(|_| invalid_override(key, value))
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    value.parse::<bool>().map_err(|_| invalid_override(key, value))
}

#[derive(Debug, Default, Deserialize)]
struct ConfigPatch {
    server: Option<ServerPatch>,
    parallel: Option<ParallelPatch>,
    mcp: Option<McpPatch>,
    a2a: Option<A2aPatch>,
    tools: Option<ToolsPatch>,
    logging: Option<LoggingPatch>,
}

#[derive(Debug, Default, Deserialize)]
struct ServerPatch {
    bind_address: Option<String>,
    port: Option<u16>,
    request_timeout_secs: Option<u64>,
    graceful_shutdown_secs: Option<u64>,
    trusted_proxies: Option<Vec<String>>,
    rate_limit: Option<RateLimitPatch>,
}

#[derive(Debug, Default, Deserialize)]
struct RateLimitPatch {
    enabled: Option<bool>,
    requests_per_second: Option<f64>,
    burst: Option<u32>,
    sweep_interval_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct ParallelPatch {
    enabled: Option<bool>,
    max_parallelism: Option<usize>,
    tool_timeout_secs: Option<u64>,
    sequential_tools: Option<Vec<String>>,
}

#[derive(Debug, Default, Deserialize)]
struct RetryPatch {
    enabled: Option<bool>,
    max_retries: Option<u32>,
    initial_delay_ms: Option<u64>,
    max_delay_ms: Option<u64>,
    backoff_multiplier: Option<f64>,
}

#[derive(Debug, Default, Deserialize)]
struct McpPatch {
    enabled: Option<bool>,
    retry: Option<RetryPatch>,
    servers: Option<Vec<McpServerPatch>>,
}

#[derive(Debug, Deserialize)]
struct McpServerPatch {
    name: String,
    #[serde(default)]
    description: String,
    enabled: Option<bool>,
    transport: McpTransport,
    command: Option<CommandSpec>,
    endpoint: Option<String>,
    auth: Option<McpAuthPatch>,
    #[serde(default)]
    tool_filter: Vec<String>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct McpAuthPatch {
    #[serde(rename = "type")]
    kind: String,
    token: Option<String>,
    token_env: Option<String>,
    username: Option<String>,
    password: Option<String>,
}

impl McpServerPatch {
    fn into_config(self) -> Result<McpServerConfig, ConfigError> {
        let auth = match self.auth {
            None => None,
            Some(auth) => Some(match auth.kind.trim().to_ascii_lowercase().as_str() {
                "bearer" => McpAuthConfig::Bearer {
                    token: auth.token.map(secret_value),
                    token_env: auth.token_env,
                },
                "basic" => McpAuthConfig::Basic {
                    username: auth.username.ok_or_else(|| {
                        ConfigError::Validation(format!(
                            "mcp server `{}` basic auth requires username",
                            self.name
                        ))
                    })?,
                    password: auth.password.map(secret_value),
                },
                other => {
                    return Err(ConfigError::Validation(format!(
                        "mcp server `{}` has unsupported auth type `{other}` (expected bearer|basic)",
                        self.name
                    )))
                }
            }),
        };

        Ok(McpServerConfig {
            name: self.name,
            description: self.description,
            enabled: self.enabled.unwrap_or(true),
            transport: self.transport,
            command: self.command,
            endpoint: self.endpoint,
            auth,
            tool_filter: self.tool_filter,
            timeout_secs: self.timeout_secs.unwrap_or(30),
        })
    }
}

#[derive(Debug, Default, Deserialize)]
struct A2aPatch {
    enabled: Option<bool>,
    retry: Option<RetryPatch>,
    sub_agents: Option<Vec<SubAgentPatch>>,
}

#[derive(Debug, Deserialize)]
struct SubAgentPatch {
    name: String,
    #[serde(default)]
    description: String,
    endpoint: String,
    auth: Option<SubAgentAuthPatch>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct SubAgentAuthPatch {
    #[serde(rename = "type")]
    kind: String,
    header: Option<String>,
    key_env: Option<String>,
    token_env: Option<String>,
}

impl SubAgentPatch {
    fn into_config(self) -> Result<SubAgentConfig, ConfigError> {
        let missing = |field: &str| {
            ConfigError::Validation(format!("sub-agent `{}` auth requires {field}", self.name))
        };
        let auth = match self.auth {
            None => SubAgentAuth::None,
            Some(auth) => match auth.kind.trim().to_ascii_lowercase().as_str() {
                "none" | "" => SubAgentAuth::None,
                "api_key" => SubAgentAuth::ApiKey {
                    header: auth.header.unwrap_or_else(|| "X-API-Key".to_string()),
                    key_env: auth.key_env.ok_or_else(|| missing("key_env"))?,
                },
                "bearer" => SubAgentAuth::Bearer {
                    token_env: auth.token_env.ok_or_else(|| missing("token_env"))?,
                },
                other => {
                    return Err(ConfigError::Validation(format!(
                        "sub-agent `{}` has unsupported auth type `{other}` (expected none|api_key|bearer)",
                        self.name
                    )))
                }
            },
        };

        Ok(SubAgentConfig {
            name: self.name,
            description: self.description,
            endpoint: self.endpoint,
            auth,
            timeout_secs: self.timeout_secs.unwrap_or(30),
        })
    }
}

#[derive(Debug, Default, Deserialize)]
struct ToolsPatch {
    web_fetch: Option<WebFetchPatch>,
}

#[derive(Debug, Default, Deserialize)]
struct WebFetchPatch {
    enabled: Option<bool>,
    timeout_secs: Option<u64>,
    default_max_length: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
struct LoggingPatch {
    level: Option<String>,
    format: Option<LogFormat>,
}
