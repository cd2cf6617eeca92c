//! Exponential backoff for re-establishing tunnels

use crate::{Error, Result};
use std::future::Future;
use std::time::Duration;
use tracing::trace;

/// Capped exponential delay between attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub initial: Duration,
    pub multiplier: u32,
    pub max: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(100),
            multiplier: 2,
            max: Duration::from_secs(20),
        }
    }
}

impl Backoff {
    /// Delay after attempt number `attempt`, counting from 1
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1);
        self.multiplier
            .checked_pow(exponent)
            .and_then(|factor| self.initial.checked_mul(factor))
            .map_or(self.max, |delay| delay.min(self.max))
    }

    /// Run `attempt` forever, sleeping between runs.
    ///
    /// Each run receives the error of the previous one. A successful run is
    /// followed by another one, so a tunnel whose session ended gets set up
    /// again. Only [`Error::NotRetryable`] ends the loop, and is returned.
    pub async fn retry<F, Fut>(&self, mut attempt: F) -> Error
    where
        F: FnMut(Option<Error>) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let mut prev = None;
        let mut n: u32 = 0;

        loop {
            n = n.saturating_add(1);
            match attempt(prev.take()).await {
                Err(err @ Error::NotRetryable(_)) => return err,
                Err(err) => prev = Some(err),
                Ok(()) => {}
            }

            let delay = self.delay(n);
            trace!(attempt = n, ?delay, "Waiting before next attempt");
            tokio::time::sleep(delay).await;
        }
    }
}

/// Whether `err` should be logged loudly given the previous attempt's error.
///
/// Only the first failure after a clean attempt counts as new; repeated
/// failures stay quiet whatever their message.
pub fn is_new_error(prev: Option<&Error>, err: Option<&Error>) -> bool {
    err.is_some() && prev.is_none()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use tokio::time::Instant;

    #[test]
    fn test_backoff_delays() {
        let backoff = Backoff::default();
        let delays: Vec<u64> = (1..=10)
            .map(|n| backoff.delay(n).as_millis() as u64)
            .collect();

        assert_eq!(
            delays,
            vec![100, 200, 400, 800, 1600, 3200, 6400, 12800, 20000, 20000]
        );
        assert_eq!(backoff.delay(200), Duration::from_secs(20));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_stops_when_not_retryable() {
        let calls = Arc::new(AtomicU32::new(0));
        let start = Instant::now();

        let counter = calls.clone();
        let err = Backoff::default()
            .retry(move |_prev| {
                let counter = counter.clone();
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) == 3 {
                        return Err(Error::not_retryable(Error::UnknownClient));
                    }
                    Err(Error::Timeout)
                }
            })
            .await;

        assert!(!err.is_retryable());
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(start.elapsed(), Duration::from_millis(100 + 200 + 400));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_passes_previous_error() {
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));

        let log = seen.clone();
        let mut n = 0;
        Backoff::default()
            .retry(move |prev| {
                log.lock().push(prev.map(|e| e.to_string()));
                n += 1;
                let result = match n {
                    1 => Err(Error::Timeout),
                    2 => Ok(()),
                    _ => Err(Error::not_retryable(Error::UnknownClient)),
                };
                async move { result }
            })
            .await;

        assert_eq!(
            *seen.lock(),
            vec![None, Some("Timeout".to_string()), None]
        );
    }

    #[test]
    fn test_is_new_error() {
        let a = Error::Timeout;
        let b = Error::UnknownClient;

        assert!(is_new_error(None, Some(&a)));
        assert!(!is_new_error(Some(&a), Some(&b)));
        assert!(!is_new_error(Some(&a), Some(&a)));
        assert!(!is_new_error(None, None));
    }
}
