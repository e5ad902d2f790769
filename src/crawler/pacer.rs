use rand::{thread_rng, Rng};
use std::time::Duration;
use tokio::time::sleep;
use tracing::debug;

use crate::cli::config::PacingSettings;

/// Randomized request spacing and error backoff
#[derive(Debug, Clone)]
pub struct Pacer {
    request_delay_ms: (u64, u64),
    retry_delay_ms: (u64, u64),
}

impl Pacer {
    pub fn new(config: &PacingSettings) -> Self {
        Self {
            request_delay_ms: config.request_delay_ms,
            retry_delay_ms: config.retry_delay_ms,
        }
    }

    /// Wait to use before each request, uniform over the configured range
    pub fn delay_before_request(&self) -> Duration {
        Self::pick(self.request_delay_ms)
    }

    /// Backoff to use after a failed attempt
    pub fn delay_before_retry(&self) -> Duration {
        Self::pick(self.retry_delay_ms)
    }

    /// Sleep for a request delay. Dropping the future cancels the wait.
    pub async fn pause_before_request(&self) {
        let delay = self.delay_before_request();
        debug!("Waiting {} ms before request", delay.as_millis());
        sleep(delay).await;
    }

    /// Sleep for a retry backoff
    pub async fn pause_before_retry(&self) {
        let delay = self.delay_before_retry();
        debug!("Backing off {} ms before retry", delay.as_millis());
        sleep(delay).await;
    }

    fn pick((min, max): (u64, u64)) -> Duration {
        let ms = if min >= max {
            min
        } else {
            thread_rng().gen_range(min..=max)
        };
        Duration::from_millis(ms)
    }
}
