//! Bounded retries with capped exponential backoff.
//!
//! Every fallible network-facing operation in the bootstrap procedure is
//! wrapped in [`with_retries`]. Each call starts its own attempt counter; no
//! state is shared between calls.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;
use std::time::Duration;

use tokio_retry2::Retry;
use tokio_retry2::RetryError;
use tracing::warn;

use crate::BootstrapError;
use crate::Result;

/// A retry policy for a class of fallible operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// The maximum number of attempts, including the first.
    pub max_attempts: u32,
    /// The delay after the first failed attempt.
    pub base: Duration,
    /// The upper bound on any single delay.
    pub cap: Duration,
}

impl RetryPolicy {
    /// The policy for tool installer scripts and release downloads.
    pub const INSTALLER: Self = Self::new(3, Duration::from_secs(1), Duration::from_secs(30));

    /// The policy for cloning the source repository.
    pub const CLONE: Self = Self::new(5, Duration::from_secs(2), Duration::from_secs(30));

    /// The policy for package installation and submodule updates.
    pub const PACKAGES: Self = Self::new(3, Duration::from_secs(1), Duration::from_secs(30));

    /// Constructs a new retry policy.
    pub const fn new(max_attempts: u32, base: Duration, cap: Duration) -> Self {
        Self {
            max_attempts,
            base,
            cap,
        }
    }

    /// Gets the delay to sleep after the given (1-based) failed attempt.
    ///
    /// The delay is `min(cap, base * 2^(attempt - 1))`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.base
            .checked_mul(1u32 << exponent)
            .map_or(self.cap, |d| d.min(self.cap))
    }

    /// Gets the delays slept between attempts.
    ///
    /// There is one fewer delay than there are attempts.
    pub fn delays(&self) -> impl Iterator<Item = Duration> + use<> {
        let policy = *self;
        (1..policy.max_attempts).map(move |attempt| policy.delay(attempt))
    }
}

/// Runs `operation` until it succeeds or the policy's attempts are exhausted.
///
/// The operation receives the 1-based attempt number. Errors that are not
/// transient (see [`BootstrapError::is_transient`]) are returned immediately
/// without consuming the rest of the budget. When every attempt fails, a
/// [`BootstrapError::RetriesExhausted`] wrapping the last error is returned.
pub async fn with_retries<T, F, Fut>(
    policy: RetryPolicy,
    label: &str,
    mut operation: F,
) -> Result<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let attempts = Arc::new(AtomicU32::new(0));
    let notified = attempts.clone();
    let owned_label = label.to_string();
    let max_attempts = policy.max_attempts;

    let result = Retry::spawn_notify(
        policy.delays(),
        || {
            let attempt = attempts.fetch_add(1, Ordering::SeqCst) + 1;
            let fut = operation(attempt);
            async move {
                fut.await.map_err(|e| {
                    if e.is_transient() {
                        RetryError::transient(e)
                    } else {
                        RetryError::permanent(e)
                    }
                })
            }
        },
        move |e: &BootstrapError, pause: Duration| {
            warn!(
                e = %e,
                attempt = notified.load(Ordering::SeqCst),
                max_attempts,
                pause_secs = pause.as_secs_f64(),
                "`{owned_label}` failed; retrying"
            );
        },
    )
    .await;

    match result {
        Ok(value) => Ok(value),
        Err(e) if e.is_transient() => Err(BootstrapError::RetriesExhausted {
            label: label.to_string(),
            attempts: attempts.load(Ordering::SeqCst),
            last: Box::new(e),
        }),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod test {
    use std::os::unix::process::ExitStatusExt;
    use std::path::PathBuf;
    use std::process::ExitStatus;

    use pretty_assertions::assert_eq;
    use tokio::time::Instant;

    use super::*;

    fn failure(attempt: u32) -> BootstrapError {
        BootstrapError::CommandFailed {
            label: "flaky".into(),
            status: ExitStatus::from_raw(1 << 8),
            log: PathBuf::from(format!("/results/.gantry/logs/{attempt:03}-flaky.log")),
        }
    }

    #[test]
    fn delays_are_capped_and_non_decreasing() {
        let policy = RetryPolicy::new(8, Duration::from_secs(1), Duration::from_secs(10));
        let delays: Vec<_> = policy.delays().map(|d| d.as_secs()).collect();
        assert_eq!(delays, [1, 2, 4, 8, 10, 10, 10]);
        assert!(delays.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn huge_attempt_numbers_saturate_at_cap() {
        let policy = RetryPolicy::CLONE;
        assert_eq!(policy.delay(200), policy.cap);
    }

    #[tokio::test(start_paused = true)]
    async fn always_failing_operation_runs_exactly_max_attempts() {
        let calls = Cell::new(0);
        let start = Instant::now();

        let result: Result<()> = with_retries(RetryPolicy::INSTALLER, "flaky", |attempt| {
            calls.set(calls.get() + 1);
            async move { Err(failure(attempt)) }
        })
        .await;

        assert_eq!(calls.get(), 3);
        // Slept 1s then 2s between the three attempts.
        assert_eq!(start.elapsed().as_secs(), 3);
        match result {
            Err(BootstrapError::RetriesExhausted {
                label,
                attempts,
                last,
            }) => {
                assert_eq!(label, "flaky");
                assert_eq!(attempts, 3);
                assert_eq!(
                    last.log(),
                    Some(PathBuf::from("/results/.gantry/logs/003-flaky.log").as_path())
                );
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_after_transient_failures() {
        let value = with_retries(RetryPolicy::CLONE, "flaky", |attempt| async move {
            if attempt < 3 {
                Err(failure(attempt))
            } else {
                Ok(attempt)
            }
        })
        .await
        .unwrap();

        assert_eq!(value, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_errors_are_not_retried() {
        let calls = Cell::new(0);
        let result: Result<()> = with_retries(RetryPolicy::CLONE, "checkout", |_| {
            calls.set(calls.get() + 1);
            async {
                Err(BootstrapError::RefNotFound {
                    repo: "allenai/gantry".into(),
                    reference: "nope".into(),
                })
            }
        })
        .await;

        assert_eq!(calls.get(), 1);
        assert!(matches!(result, Err(BootstrapError::RefNotFound { .. })));
    }
}
