use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::Semaphore;

/// What the executor needs to know about a failed upstream call.
pub trait UpstreamFailure: std::fmt::Display {
    fn status_code(&self) -> Option<u16> {
        None
    }

    fn is_rate_limited(&self) -> bool {
        false
    }
}

pub fn is_retryable<E: UpstreamFailure>(err: &E) -> bool {
    if err.is_rate_limited() || matches!(err.status_code(), Some(429 | 503)) {
        return true;
    }
    let message = err.to_string().to_ascii_lowercase();
    message.contains("rate limit") || message.contains("too many requests")
}

#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    pub max_concurrency: usize,
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub jitter: Duration,
}

/// Bounds concurrent upstream calls and retries throttled ones with
/// exponential backoff plus jitter. Clones share the same slots.
#[derive(Clone)]
pub struct RateLimitedExecutor {
    slots: Arc<Semaphore>,
    max_attempts: u32,
    base_delay: Duration,
    jitter: Duration,
}

impl RateLimitedExecutor {
    pub fn new(config: ExecutorConfig) -> Result<Self, &'static str> {
        if config.max_concurrency == 0 {
            return Err("max_concurrency must be >= 1");
        }
        if config.max_attempts == 0 {
            return Err("max_attempts must be >= 1");
        }

        Ok(Self {
            slots: Arc::new(Semaphore::new(config.max_concurrency)),
            max_attempts: config.max_attempts,
            base_delay: config.base_delay,
            jitter: config.jitter,
        })
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Runs `operation` holding one slot across every attempt. The last
    /// failure is returned unchanged.
    pub async fn run<T, E, F, Fut>(&self, mut operation: F) -> Result<T, E>
    where
        E: UpstreamFailure,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let _permit = self.slots.acquire().await.ok();

        let mut attempt = 1u32;
        loop {
            match operation().await {
                Ok(value) => return Ok(value),
                Err(err) if attempt < self.max_attempts && is_retryable(&err) => {
                    let delay = self.backoff(attempt);
                    tracing::warn!(
                        attempt,
                        max_attempts = self.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "gateway.upstream_retry"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let base = self.base_delay.saturating_mul(1u32 << exponent);
        let jitter_ms = self.jitter.as_millis() as u64;
        if jitter_ms == 0 {
            return base;
        }
        base + Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
    }
}
