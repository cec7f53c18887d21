//! Caller-side retry policy.
//!
//! The core never retries on its own; collaborators that own a retry policy
//! (provider announcement, for one) wrap their calls with these helpers.
use std::time::Duration;
use futures::Future;
use once_cell::sync::Lazy;
use opentelemetry::{global, metrics::Counter};
use rand::{thread_rng, Rng};
use thiserror::Error;
use tracing::{debug, warn};

static RETRY_ATTEMPTS: Lazy<Counter<u64>> = Lazy::new(|| {
    global::meter("typemesh-resilience")
        .u64_counter("typemesh_resilience_retry_attempts_total")
        .with_description("Total retry attempts executed after a failed first try")
        .build()
});

static RETRY_EXHAUSTED: Lazy<Counter<u64>> = Lazy::new(|| {
    global::meter("typemesh-resilience")
        .u64_counter("typemesh_resilience_retry_exhausted_total")
        .with_description("Operations that failed after every allowed attempt")
        .build()
});

#[derive(Debug, Error)]
pub enum ResilienceError {
    #[error("invalid retry config: {0}")]
    InvalidConfig(&'static str),
}

#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter: f64, // 0.0 - 1.0
}

impl Default for RetryConfig {
    fn default() -> Self { Self { max_retries: 3, base_delay: Duration::from_millis(50), max_delay: Duration::from_millis(1500), jitter: 0.25 } }
}

impl RetryConfig {
    pub fn validate(&self) -> Result<(), ResilienceError> {
        if !(0.0..=1.0).contains(&self.jitter) { return Err(ResilienceError::InvalidConfig("jitter must be within 0.0..=1.0")); }
        if self.base_delay > self.max_delay { return Err(ResilienceError::InvalidConfig("base_delay exceeds max_delay")); }
        Ok(())
    }

    /// Backoff before retry number `attempt` (0-based), exponential and capped.
    pub fn delay_for(&self, attempt: usize) -> Duration {
        let exp = self.base_delay.saturating_mul(1u32 << attempt.min(16));
        let delay = std::cmp::min(exp, self.max_delay);
        if self.jitter <= 0.0 { return delay; }
        let jitter_ms = (delay.as_millis() as f64 * self.jitter) as i64;
        let offset: i64 = thread_rng().gen_range(-jitter_ms..=jitter_ms);
        Duration::from_millis((delay.as_millis() as i64 + offset).max(0) as u64)
    }
}

/// Retries every error up to `cfg.max_retries` times.
pub async fn retry_async<F, Fut, T, E>(cfg: &RetryConfig, op: F) -> Result<T, E>
where
    F: FnMut(usize) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    retry_async_if(cfg, |_| true, op).await
}

/// Retries only errors accepted by `should_retry`; anything else is returned at once.
pub async fn retry_async_if<F, Fut, T, E, P>(cfg: &RetryConfig, should_retry: P, mut op: F) -> Result<T, E>
where
    F: FnMut(usize) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
{
    let mut attempt = 0;
    loop {
        match op(attempt).await {
            Ok(v) => return Ok(v),
            Err(e) if !should_retry(&e) => return Err(e),
            Err(e) if attempt >= cfg.max_retries => {
                RETRY_EXHAUSTED.add(1, &[]);
                warn!(attempts = attempt + 1, "retry_exhausted");
                return Err(e);
            }
            Err(_) => {
                let delay = cfg.delay_for(attempt);
                debug!(attempt, delay_ms = delay.as_millis() as u64, "retry_scheduled");
                RETRY_ATTEMPTS.add(1, &[]);
                tokio::time::sleep(delay).await;
            }
        }
        attempt += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast() -> RetryConfig { RetryConfig { max_retries: 3, base_delay: Duration::from_millis(1), max_delay: Duration::from_millis(10), jitter: 0.0 } }

    #[tokio::test]
    async fn test_retry_eventual_success() {
        let mut attempts = 0;
        let res: Result<usize, &str> = retry_async(&fast(), |_i| {
            attempts += 1;
            let n = attempts;
            async move { if n < 3 { Err("fail") } else { Ok(42) } }
        }).await;
        assert_eq!(res.unwrap(), 42);
        assert_eq!(attempts, 3);
    }

    #[tokio::test]
    async fn test_retry_gives_up() {
        let mut attempts = 0;
        let res: Result<(), &str> = retry_async(&fast(), |_| { attempts += 1; async { Err("nope") } }).await;
        assert_eq!(res, Err("nope"));
        assert_eq!(attempts, 4);
    }

    #[tokio::test]
    async fn test_non_retryable_error_returns_immediately() {
        let mut attempts = 0;
        let res: Result<(), &str> = retry_async_if(&fast(), |e| *e == "transient", |_| { attempts += 1; async { Err("fatal") } }).await;
        assert_eq!(res, Err("fatal"));
        assert_eq!(attempts, 1);
    }

    #[test]
    fn delay_is_capped() {
        let cfg = RetryConfig { max_retries: 10, base_delay: Duration::from_millis(10), max_delay: Duration::from_millis(50), jitter: 0.0 };
        assert_eq!(cfg.delay_for(0), Duration::from_millis(10));
        assert_eq!(cfg.delay_for(1), Duration::from_millis(20));
        assert_eq!(cfg.delay_for(8), Duration::from_millis(50));
        assert!(cfg.validate().is_ok());
        assert!(RetryConfig { jitter: 2.0, ..cfg }.validate().is_err());
    }
}
