use std::sync::Arc;
use tracing::warn;

use crate::cli::config::PacingSettings;
use crate::crawler::error::FetchError;
use crate::crawler::fetcher::PositionLocator;
use crate::crawler::pacer::Pacer;
use crate::crawler::task::PositionResult;
use crate::utils::metrics::MetricsCollector;

/// Paced lookups with backoff-and-retry on failure
pub struct RetryingFetcher {
    locator: Arc<dyn PositionLocator>,
    pacer: Pacer,
    max_attempts: u32,
    metrics: MetricsCollector,
}

impl RetryingFetcher {
    pub fn new(locator: Arc<dyn PositionLocator>, pacing: &PacingSettings, metrics: MetricsCollector) -> Self {
        Self {
            locator,
            pacer: Pacer::new(pacing),
            max_attempts: pacing.max_attempts.max(1),
            metrics,
        }
    }

    pub fn metrics(&self) -> &MetricsCollector {
        &self.metrics
    }

    /// Wait a request delay, then look the identifier up. A retryable failure
    /// gets a backoff and another attempt until `max_attempts` is used up; the
    /// last failure is returned as is.
    pub async fn fetch_with_retry(
        &self,
        keyword: &str,
        identifier: &str,
        max_pages: u32,
    ) -> Result<PositionResult, FetchError> {
        self.pacer.pause_before_request().await;

        let mut attempt = 1;
        loop {
            let timer = self.metrics.start_timer();
            let result = self.locator.locate_position(keyword, identifier, max_pages).await;
            self.metrics.record_attempt(keyword, result.is_ok(), timer.end()).await;

            match result {
                Ok(position) => return Ok(position),
                Err(e) if e.is_retryable() && attempt < self.max_attempts => {
                    warn!(
                        "Lookup failed for '{}' / {} (attempt {}/{}): {}",
                        keyword, identifier, attempt, self.max_attempts, e
                    );
                    self.pacer.pause_before_retry().await;
                    self.metrics.record_retry().await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crawler::fetcher::MockPositionLocator;
    use std::time::Duration;
    use tokio::time::Instant;
    use tokio_test::{assert_err, assert_ok};

    fn instant_pacing(max_attempts: u32) -> PacingSettings {
        PacingSettings {
            request_delay_ms: (0, 0),
            retry_delay_ms: (0, 0),
            max_attempts,
        }
    }

    #[tokio::test]
    async fn test_success_needs_one_attempt() {
        let mut locator = MockPositionLocator::new();
        locator.expect_locate_position()
            .times(1)
            .returning(|_, _, _| Ok(PositionResult::organic(1, 4)));

        let fetcher = RetryingFetcher::new(Arc::new(locator), &instant_pacing(2), MetricsCollector::new());

        let result = assert_ok!(fetcher.fetch_with_retry("widget", "A1", 1).await);
        assert_eq!(result, PositionResult::organic(1, 4));
    }

    #[tokio::test]
    async fn test_single_retry_after_failure() {
        let mut locator = MockPositionLocator::new();
        let mut calls = 0;
        locator.expect_locate_position()
            .times(2)
            .returning(move |_, _, _| {
                calls += 1;
                if calls == 1 {
                    Err(FetchError::Status(429))
                } else {
                    Ok(PositionResult::not_found())
                }
            });

        let metrics = MetricsCollector::new();
        let fetcher = RetryingFetcher::new(Arc::new(locator), &instant_pacing(2), metrics.clone());

        assert_ok!(fetcher.fetch_with_retry("widget", "A1", 1).await);
        let snapshot = metrics.get_metrics().await;
        assert_eq!(snapshot.retries, 1);
        assert_eq!(snapshot.total_attempts, 2);
    }

    #[tokio::test]
    async fn test_second_failure_is_surfaced() {
        let mut locator = MockPositionLocator::new();
        locator.expect_locate_position()
            .times(2)
            .returning(|_, _, _| Err(FetchError::Transport("connection reset".into())));

        let fetcher = RetryingFetcher::new(Arc::new(locator), &instant_pacing(2), MetricsCollector::new());

        let error = assert_err!(fetcher.fetch_with_retry("widget", "A1", 1).await);
        assert_eq!(error, FetchError::Transport("connection reset".into()));
    }

    #[tokio::test]
    async fn test_unexpected_error_is_not_retried() {
        let mut locator = MockPositionLocator::new();
        locator.expect_locate_position()
            .times(1)
            .returning(|_, _, _| Err(FetchError::Unexpected("bad url".into())));

        let fetcher = RetryingFetcher::new(Arc::new(locator), &instant_pacing(3), MetricsCollector::new());

        assert_err!(fetcher.fetch_with_retry("widget", "A1", 1).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_default_pacing_waits_for_request_and_backoff() {
        let mut locator = MockPositionLocator::new();
        locator.expect_locate_position()
            .times(2)
            .returning(|_, _, _| Err(FetchError::Timeout(Duration::from_secs(30))));

        let fetcher = RetryingFetcher::new(Arc::new(locator), &PacingSettings::default(), MetricsCollector::new());
        let start = Instant::now();

        assert_err!(fetcher.fetch_with_retry("widget", "A1", 1).await);

        let waited = start.elapsed();
        assert!(waited >= Duration::from_millis(33_000));
        assert!(waited <= Duration::from_millis(65_001));
    }
}
