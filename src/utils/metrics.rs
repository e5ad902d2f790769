use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;
use chrono::{DateTime, Utc};
use serde::{Serialize, Deserialize};

/// Fetch metrics collector shared across batches of one worker
#[derive(Debug, Clone)]
pub struct MetricsCollector {
    metrics: Arc<Mutex<Metrics>>,
}

/// Metrics data structure
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Metrics {
    /// Start time of the metrics collection
    pub start_time: DateTime<Utc>,

    /// Lookup attempts made, retries included
    pub total_attempts: usize,

    pub successful_attempts: usize,

    pub failed_attempts: usize,

    /// Attempts made after a backoff
    pub retries: usize,

    /// Attempt durations, keyed by keyword
    pub attempt_durations: HashMap<String, DurationStats>,
}

/// Running totals of attempt durations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct DurationStats {
    pub count: u64,
    pub total_ms: u64,
}

impl DurationStats {
    fn record(&mut self, duration_ms: u64) {
        self.count += 1;
        self.total_ms = self.total_ms.saturating_add(duration_ms);
    }

    pub fn mean_ms(&self) -> Option<u64> {
        (self.count > 0).then(|| self.total_ms / self.count)
    }
}

impl Metrics {
    /// Mean attempt duration across all keywords
    pub fn mean_duration_ms(&self) -> Option<u64> {
        let (sum, count) = self.attempt_durations
            .values()
            .fold((0u64, 0u64), |(sum, count), stats| {
                (sum.saturating_add(stats.total_ms), count + stats.count)
            });

        if count == 0 {
            None
        } else {
            Some(sum / count)
        }
    }
}

impl MetricsCollector {
    pub fn new() -> Self {
        let metrics = Metrics {
            start_time: Utc::now(),
            ..Default::default()
        };

        Self {
            metrics: Arc::new(Mutex::new(metrics)),
        }
    }

    /// Record one lookup attempt
    pub async fn record_attempt(&self, keyword: &str, success: bool, duration_ms: u64) {
        let mut metrics = self.metrics.lock().await;

        metrics.total_attempts += 1;
        if success {
            metrics.successful_attempts += 1;
        } else {
            metrics.failed_attempts += 1;
        }

        metrics.attempt_durations
            .entry(keyword.to_string())
            .or_default()
            .record(duration_ms);
    }

    pub async fn record_retry(&self) {
        self.metrics.lock().await.retries += 1;
    }

    /// Start timing an attempt
    pub fn start_timer(&self) -> RequestTimer {
        RequestTimer {
            start: Instant::now(),
        }
    }

    /// Get all metrics
    pub async fn get_metrics(&self) -> Metrics {
        self.metrics.lock().await.clone()
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

/// Request timer for measuring attempt durations
pub struct RequestTimer {
    start: Instant,
}

impl RequestTimer {
    /// End timing and get the duration in milliseconds
    pub fn end(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }
}
