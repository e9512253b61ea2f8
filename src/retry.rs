//! Retry utilities with exponential backoff, jitter and a deadline.
//!
//! [`retry_until`] drives an async operation until it succeeds, a failure is
//! classified as terminal, the deadline passes or the caller cancels. The
//! deadline and cancellation token are raced against both the attempt and the
//! backoff sleep, so neither can hold the caller past them.
//!
//! # Example
//!
//! ```ignore
//! use talos_provisioner::retry::{retry_until, RetryClass, RetryConfig};
//!
//! let disks = retry_until(
//!     &RetryConfig::default(),
//!     "disks",
//!     Instant::now() + Duration::from_secs(60),
//!     &cancel,
//!     |_| RetryClass::Retryable,
//!     || async { client.disks().await },
//! )
//! .await?;
//! ```

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

/// Configuration for operations that may fail transiently.
#[derive(Clone, Debug)]
pub struct RetryConfig {
    /// Maximum number of attempts (0 = until the deadline)
    pub max_attempts: u32,
    /// Initial delay between retries
    pub initial_delay: Duration,
    /// Maximum delay between retries
    pub max_delay: Duration,
    /// Multiplier for exponential backoff
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 0,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Create a config with a maximum number of attempts
    pub fn with_max_attempts(attempts: u32) -> Self {
        Self {
            max_attempts: attempts,
            ..Default::default()
        }
    }

    /// Create a config bounded only by the deadline
    pub fn until_deadline() -> Self {
        Self::default()
    }
}

/// How a failed attempt affects the retry loop
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RetryClass {
    /// Try again after a backoff
    Retryable,
    /// Stop and surface the error
    NonRetryable,
    /// Stop; the caller's own inputs are unusable
    Fatal,
}

/// Exponential backoff with 0.5x-1.5x jitter, capped at `max_delay`
#[derive(Clone, Debug)]
pub struct Backoff {
    delay: Duration,
    max_delay: Duration,
    multiplier: f64,
}

impl Backoff {
    /// Start a backoff sequence from `config`
    pub fn new(config: &RetryConfig) -> Self {
        Self {
            delay: config.initial_delay,
            max_delay: config.max_delay,
            multiplier: config.backoff_multiplier,
        }
    }

    /// Jittered delay for this step; advances the sequence
    pub fn next_delay(&mut self) -> Duration {
        let jitter = rand::thread_rng().gen_range(0.5..1.5);
        let jittered = Duration::from_secs_f64(self.delay.as_secs_f64() * jitter);

        self.delay = Duration::from_secs_f64(
            (self.delay.as_secs_f64() * self.multiplier).min(self.max_delay.as_secs_f64()),
        );
        jittered
    }
}

/// Why [`retry_until`] gave up
#[derive(Debug, PartialEq, Eq)]
pub enum RetryError<E> {
    /// A non-retryable failure
    Failed(E),
    /// A fatal failure
    Fatal(E),
    /// `max_attempts` reached; carries the last failure
    Exhausted {
        /// Number of attempts made
        attempts: u32,
        /// Failure of the final attempt
        last: E,
    },
    /// The deadline passed; carries the last failure, if any attempt finished
    DeadlineExceeded {
        /// Most recent failure
        last: Option<E>,
    },
    /// The cancellation token fired
    Cancelled {
        /// Most recent failure
        last: Option<E>,
    },
}

/// Execute `operation` with backoff until it succeeds or the loop must stop.
///
/// Each failure is passed to `classify`: retryable failures are retried after
/// a jittered backoff sleep, anything else ends the loop. The deadline and
/// `cancel` abort an in-flight attempt or sleep immediately.
pub async fn retry_until<F, Fut, T, E, C>(
    config: &RetryConfig,
    operation_name: &str,
    deadline: Instant,
    cancel: &CancellationToken,
    classify: C,
    mut operation: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    C: Fn(&E) -> RetryClass,
{
    let mut backoff = Backoff::new(config);
    let mut last: Option<E> = None;
    let mut attempt = 0u32;

    loop {
        attempt += 1;

        if cancel.is_cancelled() {
            return Err(RetryError::Cancelled { last });
        }
        if Instant::now() >= deadline {
            return Err(RetryError::DeadlineExceeded { last });
        }

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(RetryError::Cancelled { last }),
            _ = tokio::time::sleep_until(deadline) => {
                return Err(RetryError::DeadlineExceeded { last });
            }
            result = operation(attempt) => result,
        };

        let e = match result {
            Ok(value) => return Ok(value),
            Err(e) => e,
        };

        match classify(&e) {
            RetryClass::Retryable => {}
            RetryClass::NonRetryable => {
                warn!(
                    operation = %operation_name,
                    attempt = attempt,
                    error = %e,
                    "Operation failed with a non-retryable error"
                );
                return Err(RetryError::Failed(e));
            }
            RetryClass::Fatal => {
                error!(
                    operation = %operation_name,
                    attempt = attempt,
                    error = %e,
                    "Operation failed with a fatal error"
                );
                return Err(RetryError::Fatal(e));
            }
        }

        if config.max_attempts > 0 && attempt >= config.max_attempts {
            error!(
                operation = %operation_name,
                attempt = attempt,
                error = %e,
                "Operation failed after max retries"
            );
            return Err(RetryError::Exhausted { attempts: attempt, last: e });
        }

        let delay = backoff.next_delay();
        warn!(
            operation = %operation_name,
            attempt = attempt,
            error = %e,
            delay_ms = delay.as_millis(),
            "Operation failed, retrying"
        );
        last = Some(e);

        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(RetryError::Cancelled { last }),
            _ = tokio::time::sleep_until(deadline) => {
                return Err(RetryError::DeadlineExceeded { last });
            }
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast() -> RetryConfig {
        RetryConfig {
            max_attempts: 0,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
            backoff_multiplier: 2.0,
        }
    }

    fn far() -> Instant {
        Instant::now() + Duration::from_secs(60)
    }

    #[tokio::test]
    async fn test_succeeds_immediately() {
        let result: Result<i32, RetryError<&str>> = retry_until(
            &RetryConfig::with_max_attempts(3),
            "op",
            far(),
            &CancellationToken::new(),
            |_| RetryClass::Retryable,
            |_| async { Ok(42) },
        )
        .await;
        assert_eq!(result, Ok(42));
    }

    #[tokio::test]
    async fn test_succeeds_after_failures() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();

        let result: Result<i32, RetryError<&str>> = retry_until(
            &fast(),
            "op",
            far(),
            &CancellationToken::new(),
            |_| RetryClass::Retryable,
            |_| {
                let c = c.clone();
                async move {
                    if c.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err("fail")
                    } else {
                        Ok(42)
                    }
                }
            },
        )
        .await;

        assert_eq!(result, Ok(42));
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_exhausts_max_attempts() {
        let config = RetryConfig {
            max_attempts: 3,
            ..fast()
        };

        let result: Result<i32, RetryError<&str>> = retry_until(
            &config,
            "op",
            far(),
            &CancellationToken::new(),
            |_| RetryClass::Retryable,
            |_| async { Err("always fails") },
        )
        .await;

        assert_eq!(
            result,
            Err(RetryError::Exhausted {
                attempts: 3,
                last: "always fails"
            })
        );
    }

    #[tokio::test]
    async fn non_retryable_stops_after_one_attempt() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();

        let result: Result<(), RetryError<&str>> = retry_until(
            &fast(),
            "op",
            far(),
            &CancellationToken::new(),
            |e| {
                if *e == "invalid" {
                    RetryClass::NonRetryable
                } else {
                    RetryClass::Retryable
                }
            },
            |_| {
                c.fetch_add(1, Ordering::SeqCst);
                async { Err("invalid") }
            },
        )
        .await;

        assert_eq!(result, Err(RetryError::Failed("invalid")));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn fatal_is_reported_separately() {
        let result: Result<(), RetryError<&str>> = retry_until(
            &fast(),
            "op",
            far(),
            &CancellationToken::new(),
            |_| RetryClass::Fatal,
            |_| async { Err("bad identity") },
        )
        .await;
        assert_eq!(result, Err(RetryError::Fatal("bad identity")));
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_surfaces_last_error() {
        let deadline = Instant::now() + Duration::from_secs(5);

        let result: Result<(), RetryError<String>> = retry_until(
            &RetryConfig::default(),
            "op",
            deadline,
            &CancellationToken::new(),
            |_| RetryClass::Retryable,
            |attempt| async move { Err(format!("attempt {attempt} failed")) },
        )
        .await;

        match result {
            Err(RetryError::DeadlineExceeded { last: Some(last) }) => {
                assert!(last.starts_with("attempt "), "{last}");
            }
            other => panic!("unexpected result: {other:?}"),
        }
        assert!(Instant::now() >= deadline);
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_aborts_a_hung_attempt() {
        let deadline = Instant::now() + Duration::from_secs(1);

        let result: Result<(), RetryError<&str>> = retry_until(
            &fast(),
            "op",
            deadline,
            &CancellationToken::new(),
            |_| RetryClass::Retryable,
            |_| std::future::pending(),
        )
        .await;

        assert_eq!(result, Err(RetryError::DeadlineExceeded { last: None }));
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_interrupts_backoff_sleep() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(2)).await;
            trigger.cancel();
        });

        let config = RetryConfig {
            initial_delay: Duration::from_secs(60),
            max_delay: Duration::from_secs(60),
            ..RetryConfig::default()
        };
        let started = Instant::now();
        let result: Result<(), RetryError<&str>> = retry_until(
            &config,
            "op",
            started + Duration::from_secs(3600),
            &cancel,
            |_| RetryClass::Retryable,
            |_| async { Err("not yet") },
        )
        .await;

        assert_eq!(
            result,
            Err(RetryError::Cancelled {
                last: Some("not yet")
            })
        );
        assert!(Instant::now() - started < Duration::from_secs(30));
    }

    #[test]
    fn backoff_grows_and_caps() {
        let config = RetryConfig {
            max_attempts: 0,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(4),
            backoff_multiplier: 2.0,
        };
        let mut backoff = Backoff::new(&config);

        let delays: Vec<_> = (0..5).map(|_| backoff.next_delay()).collect();
        assert!(delays[0] >= Duration::from_millis(500) && delays[0] < Duration::from_millis(1500));
        assert!(delays[4] >= Duration::from_secs(2) && delays[4] < Duration::from_secs(6));
    }
}
