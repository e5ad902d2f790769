use chrono::{DateTime, Utc};
use serde::{Serialize, Deserialize};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::cli::config::IDENTIFIER_CAP;
use crate::crawler::error::BatchError;
use crate::crawler::retry::RetryingFetcher;
use crate::crawler::scheduler::Scheduler;
use crate::crawler::task::{RankRecord, Task};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchStatus {
    Idle,
    Running,
    Completed,
    Failed,
}

/// Counts reported back with every finished batch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchSummary {
    pub attempted: usize,
    pub found: usize,
    pub not_found: usize,
    /// Tasks skipped after their retry also failed
    pub failed: usize,
}

/// Progress of a running batch, one per task
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressUpdate {
    pub batch_id: Uuid,
    pub index: usize,
    pub total: usize,
    pub message: String,
}

pub type ProgressSender = mpsc::UnboundedSender<ProgressUpdate>;

/// State of one batch invocation
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchRun {
    pub id: Uuid,
    pub tasks: Vec<Task>,
    pub results: Vec<RankRecord>,
    pub status: BatchStatus,
    pub progress_message: String,
    pub summary: BatchSummary,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl BatchRun {
    fn new(tasks: Vec<Task>) -> Self {
        Self {
            id: Uuid::new_v4(),
            tasks,
            results: Vec::new(),
            status: BatchStatus::Idle,
            progress_message: String::new(),
            summary: BatchSummary::default(),
            error: None,
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    fn finish(&mut self, status: BatchStatus) {
        self.status = status;
        self.finished_at = Some(Utc::now());
    }
}

/// Clears the running flag however the batch ends, including cancellation
struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Runs keyword × identifier batches one task at a time
pub struct BatchRunner {
    fetcher: RetryingFetcher,
    scheduler: Scheduler,
    page_size: u32,
    running: AtomicBool,
}

impl BatchRunner {
    pub fn new(fetcher: RetryingFetcher, page_size: u32) -> Self {
        Self {
            fetcher,
            scheduler: Scheduler::new(IDENTIFIER_CAP),
            page_size,
            running: AtomicBool::new(false),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Run a batch to completion.
    ///
    /// Invalid input and overlapping batches are errors. Tasks whose lookup
    /// fails even after the retry are skipped; any other failure stops the
    /// batch and comes back as a `Failed` run.
    pub async fn run_batch(
        &self,
        keywords: &[String],
        identifiers: &[String],
        max_pages: u32,
        progress: Option<&ProgressSender>,
    ) -> Result<BatchRun, BatchError> {
        let tasks = self.scheduler.plan(keywords, identifiers, max_pages)?;

        if self.running.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire).is_err() {
            return Err(BatchError::Busy);
        }
        let _guard = RunningGuard(&self.running);

        let mut run = BatchRun::new(tasks);
        run.status = BatchStatus::Running;
        let total = run.tasks.len();

        info!("Starting batch {} with {} tasks", run.id, total);

        for index in 0..total {
            let task = run.tasks[index].clone();
            let message = format!("{}/{}: {}, {}", index + 1, total, task.keyword, task.identifier);
            debug!("{}", message);

            if let Some(sender) = progress {
                let _ = sender.send(ProgressUpdate {
                    batch_id: run.id,
                    index: index + 1,
                    total,
                    message: message.clone(),
                });
            }
            run.progress_message = message;
            run.summary.attempted += 1;

            match self.fetcher.fetch_with_retry(&task.keyword, &task.identifier, max_pages).await {
                Ok(position) => match RankRecord::from_position(&task, &position, self.page_size) {
                    Some(record) => {
                        debug!("Found {} for '{}' on page {}", task.identifier, task.keyword, record.page);
                        run.summary.found += 1;
                        run.results.push(record);
                    }
                    None => run.summary.not_found += 1,
                },
                Err(e) if e.is_retryable() => {
                    warn!("Skipping '{}' / {}: {}", task.keyword, task.identifier, e);
                    run.summary.failed += 1;
                }
                Err(e) => {
                    error!("Batch {} aborted on '{}' / {}: {}", run.id, task.keyword, task.identifier, e);
                    run.error = Some(e.to_string());
                    run.progress_message = format!("batch search failed: {}", e);
                    run.finish(BatchStatus::Failed);
                    return Ok(run);
                }
            }
        }

        run.progress_message = format!(
            "batch search complete, found {} of {}",
            run.summary.found, run.summary.attempted
        );
        run.finish(BatchStatus::Completed);
        info!("{}", run.progress_message);

        let metrics = self.fetcher.metrics().get_metrics().await;
        debug!(
            "Fetch metrics: {} attempts, {} failed, {} retries, mean {:?} ms",
            metrics.total_attempts,
            metrics.failed_attempts,
            metrics.retries,
            metrics.mean_duration_ms()
        );

        Ok(run)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::config::PacingSettings;
    use crate::crawler::error::FetchError;
    use crate::crawler::fetcher::MockPositionLocator;
    use crate::crawler::task::PositionResult;
    use crate::utils::metrics::MetricsCollector;
    use std::sync::Arc;
    use std::time::Duration;

    fn strings(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    fn runner(locator: MockPositionLocator) -> BatchRunner {
        let pacing = PacingSettings {
            request_delay_ms: (0, 0),
            retry_delay_ms: (0, 0),
            max_attempts: 2,
        };
        BatchRunner::new(RetryingFetcher::new(Arc::new(locator), &pacing, MetricsCollector::new()), 48)
    }

    #[tokio::test]
    async fn test_single_task_example() {
        let mut locator = MockPositionLocator::new();
        locator.expect_locate_position()
            .times(1)
            .returning(|keyword, identifier, max_pages| {
                assert_eq!((keyword, identifier, max_pages), ("widget", "A1", 1));
                Ok(PositionResult::organic(1, 5))
            });

        let run = runner(locator)
            .run_batch(&strings(&["widget"]), &strings(&["A1"]), 1, None)
            .await
            .unwrap();

        assert_eq!(run.status, BatchStatus::Completed);
        assert_eq!(run.results, vec![RankRecord {
            identifier: "A1".to_string(),
            keyword: "widget".to_string(),
            page: 1,
            position: Some(5),
            overall_rank: Some(5),
            is_promoted: false,
        }]);
    }

    #[tokio::test]
    async fn test_four_identifiers_rejected_before_fetching() {
        let mut locator = MockPositionLocator::new();
        locator.expect_locate_position().never();

        let result = runner(locator)
            .run_batch(&strings(&["widget"]), &strings(&["A", "B", "C", "D"]), 1, None)
            .await;

        assert!(matches!(result, Err(BatchError::Validation(_))));
    }

    #[tokio::test]
    async fn test_failed_task_is_skipped() {
        let mut locator = MockPositionLocator::new();
        locator.expect_locate_position()
            .returning(|keyword, _, _| {
                if keyword == "k3" {
                    Err(FetchError::Status(503))
                } else {
                    Ok(PositionResult::organic(2, 3))
                }
            });

        let keywords = strings(&["k1", "k2", "k3", "k4", "k5"]);
        let run = runner(locator)
            .run_batch(&keywords, &strings(&["A1"]), 2, None)
            .await
            .unwrap();

        assert_eq!(run.status, BatchStatus::Completed);
        assert_eq!(run.results.len(), 4);
        assert!(run.results.iter().all(|r| r.overall_rank == Some(51)));
        assert_eq!(run.summary, BatchSummary { attempted: 5, found: 4, not_found: 0, failed: 1 });

        let order: Vec<&str> = run.results.iter().map(|r| r.keyword.as_str()).collect();
        assert_eq!(order, vec!["k1", "k2", "k4", "k5"]);
    }

    #[tokio::test]
    async fn test_unexpected_error_fails_batch() {
        let mut locator = MockPositionLocator::new();
        locator.expect_locate_position()
            .times(1)
            .returning(|_, _, _| Err(FetchError::Unexpected("invalid listing URL".into())));

        let run = runner(locator)
            .run_batch(&strings(&["k1", "k2"]), &strings(&["A1"]), 1, None)
            .await
            .unwrap();

        assert_eq!(run.status, BatchStatus::Failed);
        assert!(run.error.unwrap().contains("invalid listing URL"));
        assert_eq!(run.summary.attempted, 1);
    }

    #[tokio::test]
    async fn test_progress_is_reported_per_task() {
        let mut locator = MockPositionLocator::new();
        locator.expect_locate_position()
            .returning(|_, _, _| Ok(PositionResult::not_found()));

        let (tx, mut rx) = mpsc::unbounded_channel();
        let run = runner(locator)
            .run_batch(&strings(&["lamp", "desk"]), &strings(&["A1"]), 1, Some(&tx))
            .await
            .unwrap();

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!(first.message, "1/2: lamp, A1");
        assert_eq!(second.message, "2/2: desk, A1");
        assert!(run.results.is_empty());
        assert_eq!(run.progress_message, "batch search complete, found 0 of 2");
    }

    #[tokio::test(start_paused = true)]
    async fn test_overlapping_batch_is_rejected() {
        let mut locator = MockPositionLocator::new();
        locator.expect_locate_position()
            .returning(|_, _, _| Ok(PositionResult::not_found()));

        let pacing = PacingSettings {
            request_delay_ms: (1000, 1000),
            retry_delay_ms: (0, 0),
            max_attempts: 2,
        };
        let runner = Arc::new(BatchRunner::new(
            RetryingFetcher::new(Arc::new(locator), &pacing, MetricsCollector::new()),
            48,
        ));

        let background = runner.clone();
        let first = tokio::spawn(async move {
            background.run_batch(&strings(&["lamp"]), &strings(&["A1"]), 1, None).await
        });
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert!(runner.is_running());
        let second = runner.run_batch(&strings(&["desk"]), &strings(&["A1"]), 1, None).await;
        assert_eq!(second.unwrap_err(), BatchError::Busy);

        let first = first.await.unwrap().unwrap();
        assert_eq!(first.status, BatchStatus::Completed);
        assert!(!runner.is_running());
    }
}
