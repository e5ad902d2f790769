use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::channel::protocol::{Request, Response};
use crate::channel::session::SessionSignal;
use crate::crawler::runner::{BatchRunner, ProgressSender};

/// What a dispatched request may talk back to
pub struct DispatchContext {
    pub signals: mpsc::UnboundedSender<SessionSignal>,
    pub progress: Option<ProgressSender>,
}

/// Routes requests to their handlers; shared by the channel and one-shot paths
pub struct Dispatcher {
    runner: Arc<BatchRunner>,
}

impl Dispatcher {
    pub fn new(runner: Arc<BatchRunner>) -> Self {
        Self { runner }
    }

    pub async fn dispatch(&self, request: Request, context: &DispatchContext) -> Response {
        match request {
            Request::BatchSearch { keywords, identifiers, max_pages } => {
                info!(
                    "Batch search requested: {} keywords, {} identifiers, {} pages",
                    keywords.len(),
                    identifiers.len(),
                    max_pages
                );
                match self
                    .runner
                    .run_batch(&keywords, &identifiers, max_pages, context.progress.as_ref())
                    .await
                {
                    Ok(run) => Response::from_batch(run),
                    Err(e) => {
                        warn!("Batch search rejected: {}", e);
                        Response::failure("batch search rejected", Some(e.to_string()))
                    }
                }
            }
            Request::ForceReconnect => {
                if context.signals.send(SessionSignal::ForceReconnect).is_err() {
                    return Response::failure("worker is shutting down", None);
                }
                Response::ok("reconnect scheduled")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::config::PacingSettings;
    use crate::crawler::error::FetchError;
    use crate::crawler::fetcher::MockPositionLocator;
    use crate::crawler::retry::RetryingFetcher;
    use crate::crawler::task::PositionResult;
    use crate::utils::metrics::MetricsCollector;

    fn dispatcher(locator: MockPositionLocator) -> Dispatcher {
        let pacing = PacingSettings {
            request_delay_ms: (0, 0),
            retry_delay_ms: (0, 0),
            max_attempts: 2,
        };
        let fetcher = RetryingFetcher::new(Arc::new(locator), &pacing, MetricsCollector::new());
        Dispatcher::new(Arc::new(BatchRunner::new(fetcher, 48)))
    }

    fn batch(identifiers: &[&str]) -> Request {
        Request::BatchSearch {
            keywords: vec!["widget".to_string()],
            identifiers: identifiers.iter().map(|i| i.to_string()).collect(),
            max_pages: 1,
        }
    }

    #[tokio::test]
    async fn test_batch_search_success() {
        let mut locator = MockPositionLocator::new();
        locator.expect_locate_position()
            .returning(|_, _, _| Ok(PositionResult::organic(1, 5)));

        let (signals, _signals_rx) = mpsc::unbounded_channel();
        let context = DispatchContext { signals, progress: None };

        let response = dispatcher(locator).dispatch(batch(&["A1"]), &context).await;

        assert!(response.success);
        assert_eq!(response.message, "batch search complete, found 1 of 1");
        assert_eq!(response.results.unwrap()[0].overall_rank, Some(5));
        assert_eq!(response.summary.unwrap().found, 1);
    }

    #[tokio::test]
    async fn test_validation_error_becomes_failure() {
        let mut locator = MockPositionLocator::new();
        locator.expect_locate_position().never();

        let (signals, _signals_rx) = mpsc::unbounded_channel();
        let context = DispatchContext { signals, progress: None };

        let response = dispatcher(locator).dispatch(batch(&["A", "B", "C", "D"]), &context).await;

        assert!(!response.success);
        assert!(response.results.is_none());
        assert!(response.error.unwrap().contains("identifiers"));
    }

    #[tokio::test]
    async fn test_unexpected_error_becomes_failure() {
        let mut locator = MockPositionLocator::new();
        locator.expect_locate_position()
            .returning(|_, _, _| Err(FetchError::Unexpected("selector parse failed".into())));

        let (signals, _signals_rx) = mpsc::unbounded_channel();
        let context = DispatchContext { signals, progress: None };

        let response = dispatcher(locator).dispatch(batch(&["A1"]), &context).await;

        assert!(!response.success);
        assert_eq!(response.message, "batch search failed");
        assert!(response.error.unwrap().contains("selector parse failed"));
    }

    #[tokio::test]
    async fn test_force_reconnect_signals_session() {
        let (signals, mut signals_rx) = mpsc::unbounded_channel();
        let context = DispatchContext { signals, progress: None };

        let response = dispatcher(MockPositionLocator::new())
            .dispatch(Request::ForceReconnect, &context)
            .await;

        assert_eq!(response, Response::ok("reconnect scheduled"));
        assert_eq!(signals_rx.recv().await, Some(SessionSignal::ForceReconnect));
    }
}
