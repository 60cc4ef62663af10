//! Finish strategies: the post-attempt policy of the dispatcher.
//!
//! After the handler chain runs, the dispatcher hands the last error (if
//! any) to the configured strategy. A `None` verdict commits the head; a
//! `Some` verdict retries the same head immediately, any pause having
//! already happened inside the strategy.

use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use rand::Rng;
use tokio_util::sync::CancellationToken;

/// Post-attempt policy consulted once per delivery attempt.
#[async_trait]
pub trait FinishStrategy: Send + Sync {
    /// Decides the fate of the current head.
    ///
    /// `last_error` is the error of the first failing handler, or `None`
    /// when the whole chain succeeded. Returning `None` commits; returning
    /// `Some` retries immediately.
    async fn done(
        &self,
        cancel: &CancellationToken,
        last_error: Option<anyhow::Error>,
    ) -> Option<anyhow::Error>;
}

/// Pauses for `interval` plus a uniform random `[0, jitter)` before every
/// retry; commits immediately on success.
///
/// A zero jitter means no jitter rather than a zero-range random draw.
/// Cancellation pre-empts the pause; the dispatcher then observes the
/// cancelled token at the top of its loop and terminates without
/// committing.
#[derive(Debug, Clone, Copy)]
pub struct Delay {
    interval: Duration,
    jitter: Duration,
}

impl Delay {
    /// Creates a delay strategy.
    pub fn new(interval: Duration, jitter: Duration) -> Self {
        Delay { interval, jitter }
    }

    fn pause(&self) -> Duration {
        self.interval + random_jitter(self.jitter)
    }
}

#[async_trait]
impl FinishStrategy for Delay {
    async fn done(
        &self,
        cancel: &CancellationToken,
        last_error: Option<anyhow::Error>,
    ) -> Option<anyhow::Error> {
        let err = last_error?;
        tokio::select! {
            _ = tokio::time::sleep(self.pause()) => Some(err),
            _ = cancel.cancelled() => Some(anyhow!("retry delay interrupted by cancellation")),
        }
    }
}

fn random_jitter(jitter: Duration) -> Duration {
    if jitter.is_zero() {
        return Duration::ZERO;
    }
    let nanos = rand::thread_rng().gen_range(0..jitter.as_nanos() as u64);
    Duration::from_nanos(nanos)
}

/// Commits every message regardless of the handler outcome. Useful for
/// best-effort relays where a failed delivery should not block the queue.
#[derive(Debug, Clone, Copy, Default)]
pub struct Ignore;

#[async_trait]
impl FinishStrategy for Ignore {
    async fn done(
        &self,
        _cancel: &CancellationToken,
        _last_error: Option<anyhow::Error>,
    ) -> Option<anyhow::Error> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::Instant;

    #[tokio::test]
    async fn delay_passes_success_through() {
        let strategy = Delay::new(Duration::from_secs(10), Duration::from_secs(10));
        let verdict = strategy.done(&CancellationToken::new(), None).await;
        assert!(verdict.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn delay_sleeps_within_the_jitter_window() {
        let interval = Duration::from_millis(50);
        let jitter = Duration::from_millis(10);
        let strategy = Delay::new(interval, jitter);

        let started = Instant::now();
        let verdict = strategy
            .done(&CancellationToken::new(), Some(anyhow!("boom")))
            .await;
        let elapsed = started.elapsed();

        assert!(verdict.is_some());
        assert!(elapsed >= interval, "paused for {elapsed:?}");
        assert!(elapsed < interval + jitter, "paused for {elapsed:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn zero_jitter_means_a_fixed_pause() {
        let interval = Duration::from_millis(50);
        let strategy = Delay::new(interval, Duration::ZERO);

        let started = Instant::now();
        let verdict = strategy
            .done(&CancellationToken::new(), Some(anyhow!("boom")))
            .await;

        assert!(verdict.is_some());
        assert_eq!(started.elapsed(), interval);
    }

    #[tokio::test]
    async fn delay_returns_the_original_error_for_retry() {
        let strategy = Delay::new(Duration::from_millis(1), Duration::ZERO);
        let verdict = strategy
            .done(&CancellationToken::new(), Some(anyhow!("original failure")))
            .await;
        assert_eq!(verdict.unwrap().to_string(), "original failure");
    }

    #[tokio::test]
    async fn cancellation_preempts_the_pause() {
        let strategy = Delay::new(Duration::from_secs(60), Duration::ZERO);
        let cancel = CancellationToken::new();

        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            canceller.cancel();
        });

        let started = Instant::now();
        let verdict = strategy.done(&cancel, Some(anyhow!("boom"))).await;

        assert!(verdict.is_some());
        assert!(started.elapsed() < Duration::from_secs(60));
    }

    #[tokio::test]
    async fn ignore_commits_failures() {
        let verdict = Ignore
            .done(&CancellationToken::new(), Some(anyhow!("ignored")))
            .await;
        assert!(verdict.is_none());
    }

    #[tokio::test]
    async fn ignore_commits_successes() {
        let verdict = Ignore.done(&CancellationToken::new(), None).await;
        assert!(verdict.is_none());
    }
}
