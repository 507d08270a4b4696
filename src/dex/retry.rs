use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, warn};

use crate::error::{BotError, BotResult};

/// Retry configuration for transient read failures
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub backoff_multiplier: f64,
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 200,
            backoff_multiplier: 2.0,
            max_delay_ms: 5_000,
        }
    }
}

impl RetryConfig {
    pub fn with_attempts(attempts: u32) -> Self {
        Self {
            max_attempts: attempts.max(1),
            ..Self::default()
        }
    }

    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        if !delay.is_zero() {
            self.initial_delay_ms = delay.as_millis() as u64;
        }
        self
    }

    /// Delay before retry number `attempt` (1-based), without jitter
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = self.backoff_multiplier.powi(attempt.saturating_sub(1) as i32);
        let millis = (self.initial_delay_ms as f64 * exp).min(self.max_delay_ms as f64);
        Duration::from_millis(millis as u64)
    }
}

/// Run `op` until it succeeds, fails with a non-transient error, or the
/// attempt budget is spent.
pub async fn retry_transient<T, F, Fut>(config: &RetryConfig, operation: &str, mut op: F) -> BotResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = BotResult<T>>,
{
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt < config.max_attempts => {
                let base = config.delay_for(attempt);
                let jitter = rand::thread_rng().gen_range(0..=base.as_millis() as u64 / 4);
                let delay = base + Duration::from_millis(jitter);
                warn!("{} failed (attempt {}/{}): {}, retrying in {:?}",
                      operation, attempt, config.max_attempts, e, delay);
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => {
                debug!("{} giving up after {} attempt(s)", operation, attempt);
                return Err(e);
            }
        }
    }
}

/// Wrap a DEX future with a deadline
pub async fn with_deadline<T, Fut>(operation: &str, budget: Duration, fut: Fut) -> BotResult<T>
where
    Fut: Future<Output = BotResult<T>>,
{
    match tokio::time::timeout(budget, fut).await {
        Ok(result) => result,
        Err(_) => Err(BotError::timeout(operation, budget)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_backoff_doubles_and_caps() {
        let config = RetryConfig::default();
        assert_eq!(config.delay_for(1), Duration::from_millis(200));
        assert_eq!(config.delay_for(2), Duration::from_millis(400));
        assert_eq!(config.delay_for(3), Duration::from_millis(800));
        assert_eq!(config.delay_for(20), Duration::from_millis(5_000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_transient_until_success() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result = retry_transient(&RetryConfig::with_attempts(3), "price", move || async move {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(BotError::TransientRpc("rate limited".into()))
            } else {
                Ok(42)
            }
        })
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_protocol_errors_not_retried() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result: BotResult<()> = retry_transient(&RetryConfig::with_attempts(5), "sell", move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(BotError::Protocol("slippage exceeded".into()))
        })
        .await;
        assert!(matches!(result, Err(BotError::Protocol(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempt_budget_respected() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result: BotResult<()> = retry_transient(&RetryConfig::with_attempts(2), "balance", move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(BotError::TransientRpc("reset".into()))
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_maps_to_timeout() {
        let result: BotResult<()> = with_deadline("sell", Duration::from_secs(1), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;
        assert!(matches!(result, Err(BotError::Timeout { .. })));
    }
}
