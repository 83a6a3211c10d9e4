pub mod config;
pub mod errors;
pub mod retry;

pub use config::{AppConfig, ConfigError, LoadOptions};
pub use errors::{ApplicationError, InterfaceError};
pub use retry::{RetryError, RetryPolicy, Retryable, RetryingCaller, Verdict};
