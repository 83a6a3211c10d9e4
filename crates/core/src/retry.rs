//! Bounded retries with capped exponential backoff and jitter.
//!
//! [`RetryingCaller::execute`] is the engine: every attempt is classified as
//! accepted or retryable, waits between attempts are cancellable, and once the
//! budget is spent the last attempt's outcome is handed back. Error-classified
//! callers use [`RetryingCaller::call`]; status-classified HTTP callers pass
//! their own classifier so a retryable response survives exhaustion intact.

use std::error::Error as StdError;
use std::future::Future;
use std::io;
use std::time::Duration;

use rand::Rng;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_INITIAL_DELAY: Duration = Duration::from_millis(500);
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(30);
pub const DEFAULT_BACKOFF_MULTIPLIER: f64 = 2.0;

const JITTER_FRACTION: f64 = 0.25;

/// Used only when a failure carries no structured kind.
const TRANSIENT_MESSAGE_PATTERNS: &[&str] = &[
    "connection refused",
    "connection reset",
    "connection aborted",
    "connection closed",
    "connection timed out",
    "timed out",
    "i/o timeout",
    "no such host",
    "dns error",
    "failed to lookup address",
    "broken pipe",
    "unexpected eof",
];

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RetryPolicy {
    max_retries: u32,
    initial_delay: Duration,
    max_delay: Duration,
    backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            initial_delay: DEFAULT_INITIAL_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
            backoff_multiplier: DEFAULT_BACKOFF_MULTIPLIER,
        }
    }
}

impl RetryPolicy {
    /// Zero or nonsensical values fall back to the defaults. A `max_delay`
    /// below `initial_delay` is raised to `initial_delay`.
    pub fn new(
        max_retries: u32,
        initial_delay: Duration,
        max_delay: Duration,
        backoff_multiplier: f64,
    ) -> Self {
        let max_retries = if max_retries == 0 { DEFAULT_MAX_RETRIES } else { max_retries };
        let initial_delay =
            if initial_delay.is_zero() { DEFAULT_INITIAL_DELAY } else { initial_delay };
        let max_delay = if max_delay.is_zero() { DEFAULT_MAX_DELAY } else { max_delay };
        let max_delay = max_delay.max(initial_delay);
        let backoff_multiplier = if backoff_multiplier.is_finite() && backoff_multiplier >= 1.0 {
            backoff_multiplier
        } else {
            DEFAULT_BACKOFF_MULTIPLIER
        };

        Self { max_retries, initial_delay, max_delay, backoff_multiplier }
    }

    /// One attempt, no retries.
    pub fn single_attempt() -> Self {
        Self { max_retries: 0, ..Self::default() }
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    pub fn initial_delay(&self) -> Duration {
        self.initial_delay
    }

    pub fn max_delay(&self) -> Duration {
        self.max_delay
    }

    pub fn backoff_multiplier(&self) -> f64 {
        self.backoff_multiplier
    }

    /// Un-jittered wait before retry `retry` (1-indexed). Retry 0 is the first
    /// attempt and never waits.
    pub fn base_delay(&self, retry: u32) -> Duration {
        if retry == 0 {
            return Duration::ZERO;
        }
        let exponent = i32::try_from(retry - 1).unwrap_or(i32::MAX);
        let scaled = self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(exponent);
        let capped = scaled.min(self.max_delay.as_secs_f64());
        Duration::from_secs_f64(capped)
    }

    /// [`Self::base_delay`] with uniform ±25% jitter applied.
    pub fn backoff_delay(&self, retry: u32) -> Duration {
        let base = self.base_delay(retry);
        if base.is_zero() {
            return base;
        }
        let factor = 1.0 + rand::thread_rng().gen_range(-JITTER_FRACTION..=JITTER_FRACTION);
        base.mul_f64(factor)
    }
}

/// Classification of a failed attempt.
pub trait Retryable {
    fn is_retryable(&self) -> bool;
}

impl Retryable for io::Error {
    fn is_retryable(&self) -> bool {
        is_transient(self)
    }
}

impl Retryable for anyhow::Error {
    fn is_retryable(&self) -> bool {
        is_transient(&**self)
    }
}

pub fn is_transient_io_kind(kind: io::ErrorKind) -> bool {
    matches!(
        kind,
        io::ErrorKind::TimedOut
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::NotConnected
            | io::ErrorKind::UnexpectedEof
            | io::ErrorKind::BrokenPipe
    )
}

/// Walks the source chain looking for a transient `io::Error` kind first, then
/// falls back to matching well-known transport failure messages.
pub fn is_transient(error: &(dyn StdError + 'static)) -> bool {
    let structured = source_chain(error)
        .filter_map(|err| err.downcast_ref::<io::Error>())
        .any(|io_error| is_transient_io_kind(io_error.kind()));
    if structured {
        return true;
    }

    source_chain(error).any(|err| {
        let message = err.to_string().to_ascii_lowercase();
        TRANSIENT_MESSAGE_PATTERNS.iter().any(|pattern| message.contains(pattern))
    })
}

fn source_chain<'a>(
    error: &'a (dyn StdError + 'static),
) -> impl Iterator<Item = &'a (dyn StdError + 'static)> {
    std::iter::successors(Some(error), |&err| err.source())
}

/// What to do with the outcome of one attempt.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Verdict {
    Accept,
    Retry(String),
}

#[derive(Debug, Error)]
pub enum RetryError<E> {
    #[error("operation cancelled")]
    Cancelled,
    #[error("giving up after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: E },
    #[error("{0}")]
    Fatal(E),
}

impl<E> RetryError<E> {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// The underlying error of the final attempt, if there was one.
    pub fn into_inner(self) -> Option<E> {
        match self {
            Self::Cancelled => None,
            Self::Exhausted { last, .. } | Self::Fatal(last) => Some(last),
        }
    }
}

#[derive(Clone, Debug)]
pub struct RetryingCaller {
    name: String,
    policy: RetryPolicy,
}

impl RetryingCaller {
    pub fn new(name: impl Into<String>, policy: RetryPolicy) -> Self {
        Self { name: name.into(), policy }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Retries `operation` while its error is [`Retryable`].
    pub async fn call<T, E, F, Fut>(
        &self,
        cancel: &CancellationToken,
        operation: F,
    ) -> Result<T, RetryError<E>>
    where
        E: Retryable + std::fmt::Display,
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.execute(cancel, operation, |outcome| match outcome {
            Err(error) if error.is_retryable() => Verdict::Retry(error.to_string()),
            _ => Verdict::Accept,
        })
        .await
    }

    /// Runs up to `max_retries + 1` attempts. `operation` receives the
    /// 0-indexed attempt number. After the last retryable attempt an `Ok`
    /// value is returned as-is and an `Err` becomes [`RetryError::Exhausted`].
    /// Cancellation during an attempt or a backoff wait yields
    /// [`RetryError::Cancelled`].
    pub async fn execute<T, E, F, Fut, C>(
        &self,
        cancel: &CancellationToken,
        mut operation: F,
        classify: C,
    ) -> Result<T, RetryError<E>>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        C: Fn(&Result<T, E>) -> Verdict,
    {
        let max_attempts = self.policy.max_attempts();
        let mut attempt = 0;

        loop {
            if attempt > 0 {
                let delay = self.policy.backoff_delay(attempt);
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(RetryError::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
            }

            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(RetryError::Cancelled),
                outcome = operation(attempt) => outcome,
            };
            attempt += 1;

            let reason = match classify(&outcome) {
                Verdict::Accept => return outcome.map_err(RetryError::Fatal),
                Verdict::Retry(reason) => reason,
            };

            if attempt >= max_attempts {
                if max_attempts > 1 {
                    error!(
                        event_name = "resilience.retry.exhausted",
                        caller = %self.name,
                        attempts = attempt,
                        reason = %reason,
                        "request failed after all retries"
                    );
                }
                return outcome.map_err(|last| RetryError::Exhausted { attempts: attempt, last });
            }

            info!(
                event_name = "resilience.retry.attempt",
                caller = %self.name,
                attempt,
                max_retries = self.policy.max_retries,
                base_delay_ms = self.policy.base_delay(attempt).as_millis() as u64,
                reason = %reason,
                "retrying after transient failure"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use tokio::time::Instant;
    use tokio_util::sync::CancellationToken;

    use super::{is_transient, RetryError, RetryPolicy, Retryable, RetryingCaller, Verdict};

    fn refused() -> io::Error {
        io::Error::new(io::ErrorKind::ConnectionRefused, "connection refused")
    }

    #[test]
    fn zero_fields_fall_back_to_defaults() {
        let policy = RetryPolicy::new(0, Duration::ZERO, Duration::ZERO, 0.5);

        assert_eq!(policy.max_retries(), 3);
        assert_eq!(policy.initial_delay(), Duration::from_millis(500));
        assert_eq!(policy.max_delay(), Duration::from_secs(30));
        assert_eq!(policy.backoff_multiplier(), 2.0);
    }

    #[test]
    fn max_delay_is_raised_to_initial_delay() {
        let policy =
            RetryPolicy::new(2, Duration::from_secs(2), Duration::from_millis(100), f64::NAN);

        assert_eq!(policy.max_delay(), Duration::from_secs(2));
        assert_eq!(policy.backoff_multiplier(), 2.0);
    }

    #[test]
    fn base_delay_grows_geometrically_and_caps() {
        let policy = RetryPolicy::new(
            10,
            Duration::from_millis(100),
            Duration::from_millis(1_000),
            2.0,
        );

        assert_eq!(policy.base_delay(0), Duration::ZERO);
        assert_eq!(policy.base_delay(1), Duration::from_millis(100));
        assert_eq!(policy.base_delay(2), Duration::from_millis(200));
        assert_eq!(policy.base_delay(3), Duration::from_millis(400));
        assert_eq!(policy.base_delay(5), Duration::from_millis(1_000));
        assert_eq!(policy.base_delay(u32::MAX), Duration::from_millis(1_000));
    }

    #[test]
    fn jitter_stays_within_a_quarter_of_the_base() {
        let policy =
            RetryPolicy::new(5, Duration::from_millis(400), Duration::from_secs(10), 2.0);

        for _ in 0..200 {
            let delay = policy.backoff_delay(1);
            assert!(delay >= Duration::from_millis(300), "{delay:?} below jitter floor");
            assert!(delay <= Duration::from_millis(500), "{delay:?} above jitter ceiling");
        }
    }

    #[test]
    fn io_kinds_are_classified_structurally() {
        assert!(refused().is_retryable());
        assert!(io::Error::from(io::ErrorKind::TimedOut).is_retryable());
        assert!(io::Error::from(io::ErrorKind::UnexpectedEof).is_retryable());
        assert!(!io::Error::from(io::ErrorKind::InvalidData).is_retryable());
        assert!(!io::Error::from(io::ErrorKind::PermissionDenied).is_retryable());
    }

    #[test]
    fn wrapped_errors_are_classified_through_the_source_chain() {
        let wrapped = anyhow::Error::new(refused()).context("connecting to search");
        assert!(wrapped.is_retryable());

        let parse = anyhow::anyhow!("expected value at line 1 column 1")
            .context("decoding tool response");
        assert!(!parse.is_retryable());
    }

    #[test]
    fn message_fallback_catches_unstructured_transport_failures() {
        let dns = io::Error::other("dns error: no such host is known");
        assert!(is_transient(&dns));

        let eof_while_parsing = io::Error::other("EOF while parsing a value at line 1 column 0");
        assert!(!is_transient(&eof_while_parsing));
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_schedule_spans_all_attempts() {
        let caller = RetryingCaller::new(
            "test",
            RetryPolicy::new(3, Duration::from_millis(100), Duration::from_secs(10), 2.0),
        );
        let invocations = Arc::new(AtomicU32::new(0));
        let started = Instant::now();

        let counter = invocations.clone();
        let result: Result<(), _> = caller
            .call(&CancellationToken::new(), |_| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(refused())
                }
            })
            .await;

        let elapsed = started.elapsed();
        assert_eq!(invocations.load(Ordering::SeqCst), 4);
        // 100 + 200 + 400ms, each jittered by at most 25%.
        assert!(elapsed >= Duration::from_millis(525), "elapsed {elapsed:?}");
        assert!(elapsed <= Duration::from_millis(875), "elapsed {elapsed:?}");

        match result {
            Err(RetryError::Exhausted { attempts, last }) => {
                assert_eq!(attempts, 4);
                assert_eq!(last.kind(), io::ErrorKind::ConnectionRefused);
            }
            other => panic!("expected exhaustion, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failure_then_success_returns_success() {
        let caller = RetryingCaller::new("test", RetryPolicy::default());

        let result = caller
            .call(&CancellationToken::new(), |attempt| async move {
                if attempt < 2 {
                    Err(refused())
                } else {
                    Ok(attempt)
                }
            })
            .await;

        assert_eq!(result.ok(), Some(2));
    }

    #[tokio::test(start_paused = true)]
    async fn fatal_error_is_returned_without_retry() {
        let caller = RetryingCaller::new("test", RetryPolicy::default());
        let invocations = AtomicU32::new(0);

        let result: Result<(), _> = caller
            .call(&CancellationToken::new(), |_| {
                invocations.fetch_add(1, Ordering::SeqCst);
                async { Err(anyhow::anyhow!("invalid character 'x' looking for beginning of value")) }
            })
            .await;

        assert_eq!(invocations.load(Ordering::SeqCst), 1);
        assert!(matches!(result, Err(RetryError::Fatal(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn single_attempt_policy_never_retries() {
        let caller = RetryingCaller::new("test", RetryPolicy::single_attempt());
        let invocations = AtomicU32::new(0);

        let result: Result<(), _> = caller
            .call(&CancellationToken::new(), |_| {
                invocations.fetch_add(1, Ordering::SeqCst);
                async { Err(refused()) }
            })
            .await;

        assert_eq!(invocations.load(Ordering::SeqCst), 1);
        assert!(matches!(result, Err(RetryError::Exhausted { attempts: 1, .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retryable_value_is_returned_unchanged() {
        let caller = RetryingCaller::new(
            "status",
            RetryPolicy::new(2, Duration::from_millis(10), Duration::from_millis(50), 2.0),
        );

        let result: Result<u16, RetryError<io::Error>> = caller
            .execute(
                &CancellationToken::new(),
                |_| async { Ok(503) },
                |outcome| match outcome {
                    Ok(503) => Verdict::Retry("status 503".to_string()),
                    _ => Verdict::Accept,
                },
            )
            .await;

        assert_eq!(result.ok(), Some(503));
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_during_backoff_aborts_without_another_attempt() {
        let caller = RetryingCaller::new(
            "test",
            RetryPolicy::new(5, Duration::from_secs(10), Duration::from_secs(60), 2.0),
        );
        let cancel = CancellationToken::new();
        let invocations = Arc::new(AtomicU32::new(0));

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            trigger.cancel();
        });

        let counter = invocations.clone();
        let result: Result<(), _> = caller
            .call(&cancel, |_| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(refused())
                }
            })
            .await;

        assert!(matches!(result, Err(RetryError::Cancelled)));
        assert_eq!(invocations.load(Ordering::SeqCst), 1);
    }
}
