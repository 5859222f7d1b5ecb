//! Bounded retry with a delay schedule.
//!
//! Engine conflict recovery, ingress port resolution, and the bridge's
//! upstream connect all retry the same way: a bounded number of attempts,
//! a predicate deciding which errors are worth retrying, and a delay between
//! rounds. This helper is that loop, once.

use std::time::Duration;

/// How many attempts to make and how long to wait between them.
#[derive(Debug, Clone, Copy)]
pub struct Schedule {
    max_attempts: u32,
    base_delay: Duration,
    increment: Duration,
}

impl Schedule {
    /// Same delay between every round.
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay: delay,
            increment: Duration::ZERO,
        }
    }

    /// Increasing delay: `step`, `2*step`, `3*step`, ...
    pub fn linear(max_attempts: u32, step: Duration) -> Self {
        Self {
            max_attempts,
            base_delay: step,
            increment: step,
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    fn delay_after(&self, attempt: u32) -> Duration {
        self.base_delay + self.increment * attempt
    }
}

/// Run `op` until it succeeds, `should_retry` rejects the error, or the
/// schedule is exhausted. The final error is returned unchanged.
pub async fn with_backoff<T, E, F, Fut>(
    schedule: Schedule,
    should_retry: impl Fn(&E) -> bool,
    mut op: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let attempts = schedule.max_attempts.max(1);
    let mut last_attempt = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                if last_attempt + 1 >= attempts || !should_retry(&err) {
                    return Err(err);
                }
                tokio::time::sleep(schedule.delay_after(last_attempt)).await;
                last_attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn returns_first_success() {
        let calls = AtomicU32::new(0);
        let result: Result<u32, ()> = with_backoff(
            Schedule::fixed(3, Duration::ZERO),
            |_| true,
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok(7) }
            },
        )
        .await;
        assert_eq!(result, Ok(7));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retries_until_schedule_exhausted() {
        let calls = AtomicU32::new(0);
        let result: Result<(), u32> = with_backoff(
            Schedule::fixed(3, Duration::ZERO),
            |_| true,
            || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move { Err(n) }
            },
        )
        .await;
        assert_eq!(result, Err(2));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn stops_on_non_retryable_error() {
        let calls = AtomicU32::new(0);
        let result: Result<(), &str> = with_backoff(
            Schedule::linear(5, Duration::ZERO),
            |err: &&str| *err == "transient",
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err("fatal") }
            },
        )
        .await;
        assert_eq!(result, Err("fatal"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn recovers_after_transient_errors() {
        let calls = AtomicU32::new(0);
        let result: Result<&str, &str> = with_backoff(
            Schedule::linear(4, Duration::ZERO),
            |_| true,
            || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 { Err("transient") } else { Ok("done") }
                }
            },
        )
        .await;
        assert_eq!(result, Ok("done"));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
