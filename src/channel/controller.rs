use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::channel::error::ChannelError;
use crate::channel::protocol::{ControllerMessage, Request, Response, WorkerMessage};
use crate::channel::transport::{Hub, PortListener};

/// Progress line relayed from the worker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressEvent {
    pub correlation_id: Uuid,
    pub message: String,
}

struct ActivePort {
    id: u64,
    tx: mpsc::UnboundedSender<ControllerMessage>,
}

#[derive(Default)]
struct ControllerState {
    port: Option<ActivePort>,
    origin: Option<String>,
    /// Waiting callers, keyed by correlation id, with the port they went out on
    pending: HashMap<Uuid, (u64, oneshot::Sender<Response>)>,
    accepted: u64,
}

impl ControllerState {
    fn purge_port(&mut self, id: u64) {
        if self.port.as_ref().map(|p| p.id) == Some(id) {
            self.port = None;
            self.origin = None;
        }
        // dropping the senders wakes their callers with an error
        self.pending.retain(|_, (port_id, _)| *port_id != id);
    }
}

/// Issuing side: keeps the latest channel handle and falls back to one-shot
/// delivery whenever that handle is missing or stale.
pub struct Controller {
    hub: Hub,
    state: Arc<Mutex<ControllerState>>,
    progress: broadcast::Sender<ProgressEvent>,
    accept_task: JoinHandle<()>,
}

impl Controller {
    pub fn start(hub: Hub, listener: PortListener) -> Self {
        let state = Arc::new(Mutex::new(ControllerState::default()));
        let (progress, _) = broadcast::channel(256);

        let accept_task = tokio::spawn(accept_ports(listener, state.clone(), progress.clone()));

        Self {
            hub,
            state,
            progress,
            accept_task,
        }
    }

    pub fn subscribe_progress(&self) -> broadcast::Receiver<ProgressEvent> {
        self.progress.subscribe()
    }

    pub async fn has_handle(&self) -> bool {
        self.state.lock().await.port.is_some()
    }

    /// Origin announced in the current channel's handshake
    pub async fn origin(&self) -> Option<String> {
        self.state.lock().await.origin.clone()
    }

    /// Wait up to `limit` for a channel handle to show up
    pub async fn wait_connected(&self, limit: Duration) -> bool {
        let poll = async {
            while !self.has_handle().await {
                sleep(Duration::from_millis(10)).await;
            }
        };
        timeout(limit, poll).await.is_ok()
    }

    /// Channels accepted since start
    pub async fn connection_count(&self) -> u64 {
        self.state.lock().await.accepted
    }

    /// Send a request over the channel, or one-shot if that is not possible.
    /// Always yields a response; transport failures become a failed one.
    ///
    /// The one-shot fallback reuses the channel's correlation id, so a batch
    /// cut off by a suspension is answered by the run already under way.
    pub async fn request(&self, request: Request) -> Response {
        let correlation_id = Uuid::new_v4();
        match self.request_over_channel(correlation_id, request.clone()).await {
            Ok(response) => response,
            Err(e) => {
                debug!("Channel unavailable ({}), sending {} one-shot", e, correlation_id);
                self.send_one_shot(correlation_id, request).await
            }
        }
    }

    pub async fn request_one_shot(&self, request: Request) -> Response {
        self.send_one_shot(Uuid::new_v4(), request).await
    }

    async fn send_one_shot(&self, correlation_id: Uuid, request: Request) -> Response {
        let (progress_tx, mut progress_rx) = mpsc::unbounded_channel::<crate::crawler::runner::ProgressUpdate>();
        let relay = async {
            while let Some(update) = progress_rx.recv().await {
                let _ = self.progress.send(ProgressEvent {
                    correlation_id,
                    message: update.message,
                });
            }
        };

        let (result, ()) = tokio::join!(self.hub.send_one_shot(correlation_id, request, progress_tx), relay);
        match result {
            Ok(response) => response,
            Err(e) => {
                error!("One-shot request failed: {}", e);
                Response::failure("could not communicate with the worker", Some(e.to_string()))
            }
        }
    }

    async fn request_over_channel(&self, correlation_id: Uuid, request: Request) -> Result<Response, ChannelError> {
        let (reply_tx, reply_rx) = oneshot::channel();

        {
            let mut state = self.state.lock().await;
            let (port_id, tx) = match &state.port {
                Some(port) => (port.id, port.tx.clone()),
                None => return Err(ChannelError::NoHandle),
            };

            if tx.send(ControllerMessage::Ping).is_err() {
                debug!("Channel handle is stale, purging");
                state.purge_port(port_id);
                return Err(ChannelError::Disconnected);
            }

            state.pending.insert(correlation_id, (port_id, reply_tx));
            if tx.send(ControllerMessage::Request { correlation_id, request }).is_err() {
                state.purge_port(port_id);
                return Err(ChannelError::Disconnected);
            }
        }

        reply_rx.await.map_err(|_| ChannelError::Disconnected)
    }
}

impl Drop for Controller {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

async fn accept_ports(
    mut listener: PortListener,
    state: Arc<Mutex<ControllerState>>,
    progress: broadcast::Sender<ProgressEvent>,
) {
    let mut readers = Vec::new();

    while let Some(port) = listener.recv().await {
        let name = port.name().to_string();
        let (tx, rx) = port.split();

        let id = {
            let mut state = state.lock().await;
            state.accepted += 1;
            let id = state.accepted;
            state.port = Some(ActivePort { id, tx });
            id
        };
        info!("Worker opened channel '{}' (#{})", name, id);

        readers.retain(|reader: &JoinHandle<()>| !reader.is_finished());
        readers.push(tokio::spawn(read_port(id, rx, state.clone(), progress.clone())));
    }

    for reader in readers {
        reader.abort();
    }
}

async fn read_port(
    id: u64,
    mut rx: mpsc::UnboundedReceiver<WorkerMessage>,
    state: Arc<Mutex<ControllerState>>,
    progress: broadcast::Sender<ProgressEvent>,
) {
    while let Some(message) = rx.recv().await {
        match message {
            WorkerMessage::Connected { origin } => {
                debug!("Handshake on channel #{} from {}", id, origin);
                let mut state = state.lock().await;
                if state.port.as_ref().map(|p| p.id) == Some(id) {
                    state.origin = Some(origin);
                }
            }
            WorkerMessage::Progress { correlation_id, message } => {
                debug!("Progress {}: {}", correlation_id, message);
                let _ = progress.send(ProgressEvent { correlation_id, message });
            }
            WorkerMessage::Response { correlation_id, response } => {
                let waiting = state.lock().await.pending.remove(&correlation_id);
                match waiting {
                    Some((_, reply)) => {
                        let _ = reply.send(response);
                    }
                    None => debug!("No caller waiting for response {}", correlation_id),
                }
            }
        }
    }

    debug!("Channel #{} closed", id);
    state.lock().await.purge_port(id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::dispatch::Dispatcher;
    use crate::channel::session::ConnectionState;
    use crate::channel::worker::{Worker, WorkerHandle};
    use crate::cli::config::{ChannelSettings, PacingSettings, RankerConfig};
    use crate::crawler::fetcher::MockPositionLocator;
    use crate::crawler::retry::RetryingFetcher;
    use crate::crawler::runner::BatchRunner;
    use crate::crawler::task::PositionResult;
    use crate::utils::metrics::MetricsCollector;

    fn channel_settings() -> ChannelSettings {
        RankerConfig::default().channel
    }

    fn dispatcher() -> Arc<Dispatcher> {
        dispatcher_with_delay((0, 0))
    }

    fn dispatcher_with_delay(request_delay_ms: (u64, u64)) -> Arc<Dispatcher> {
        let mut locator = MockPositionLocator::new();
        locator.expect_locate_position()
            .returning(|_, identifier, _| {
                if identifier == "A1" {
                    Ok(PositionResult::organic(1, 5))
                } else {
                    Ok(PositionResult::not_found())
                }
            });

        let pacing = PacingSettings {
            request_delay_ms,
            retry_delay_ms: (0, 0),
            max_attempts: 2,
        };
        let fetcher = RetryingFetcher::new(Arc::new(locator), &pacing, MetricsCollector::new());
        Arc::new(Dispatcher::new(Arc::new(BatchRunner::new(fetcher, 48))))
    }

    fn batch() -> Request {
        Request::BatchSearch {
            keywords: vec!["widget".to_string()],
            identifiers: vec!["A1".to_string(), "B2".to_string()],
            max_pages: 1,
        }
    }

    async fn start() -> (Controller, WorkerHandle) {
        start_with(dispatcher()).await
    }

    async fn start_with(dispatcher: Arc<Dispatcher>) -> (Controller, WorkerHandle) {
        let (hub, listener) = Hub::new();
        let controller = Controller::start(hub.clone(), listener);
        let worker = Worker::spawn(hub, dispatcher, &channel_settings()).await;
        wait_for_state(&worker, ConnectionState::Connected).await;
        assert!(controller.wait_connected(Duration::from_secs(1)).await);
        (controller, worker)
    }

    async fn wait_for_state(worker: &WorkerHandle, expected: ConnectionState) {
        let mut state = worker.watch_state();
        tokio::time::timeout(Duration::from_secs(5), state.wait_for(|s| *s == expected))
            .await
            .expect("state change timed out")
            .unwrap();
    }

    async fn wait_for_handle(controller: &Controller, expected: bool) {
        for _ in 0..100 {
            if controller.has_handle().await == expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("controller handle never became {}", expected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_batch_over_channel() {
        let (controller, worker) = start().await;
        let mut progress = controller.subscribe_progress();

        assert_eq!(controller.origin().await.as_deref(), Some("https://www.amazon.com"));

        let response = controller.request(batch()).await;

        assert!(response.success);
        assert_eq!(response.message, "batch search complete, found 1 of 2");
        let results = response.results.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].identifier, "A1");
        assert_eq!(results[0].overall_rank, Some(5));

        assert_eq!(progress.recv().await.unwrap().message, "1/2: widget, A1");
        assert_eq!(progress.recv().await.unwrap().message, "2/2: widget, B2");

        worker.unload().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_suspended_worker_answers_one_shot() {
        let (controller, worker) = start().await;
        let over_channel = controller.request(batch()).await;

        worker.suspend();
        wait_for_state(&worker, ConnectionState::Disconnected).await;
        wait_for_handle(&controller, false).await;

        let fallback = controller.request(batch()).await;

        assert_eq!(
            serde_json::to_value(&fallback).unwrap(),
            serde_json::to_value(&over_channel).unwrap()
        );
        assert_eq!(controller.connection_count().await, 1);

        worker.unload().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_suspend_mid_batch_still_answers() {
        let (controller, worker) = start_with(dispatcher_with_delay((1000, 1000))).await;
        let mut progress = controller.subscribe_progress();

        let suspend = async {
            sleep(Duration::from_millis(500)).await;
            worker.suspend();
        };
        let (response, ()) = tokio::join!(controller.request(batch()), suspend);

        assert!(response.success, "{:?}", response);
        assert_eq!(response.message, "batch search complete, found 1 of 2");
        assert_eq!(response.results.unwrap().len(), 1);
        assert_eq!(worker.state(), ConnectionState::Disconnected);

        let mut messages = Vec::new();
        while let Ok(event) = progress.try_recv() {
            messages.push(event.message);
        }
        assert_eq!(messages, vec!["1/2: widget, A1", "2/2: widget, B2"]);

        worker.unload().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_batch_finished_after_disconnect_is_claimed_one_shot() {
        let (hub, mut listener) = Hub::new();
        let worker = Worker::spawn(hub.clone(), dispatcher_with_delay((1000, 1000)), &channel_settings()).await;
        let port = listener.recv().await.unwrap();

        let correlation_id = Uuid::new_v4();
        port.post(ControllerMessage::Request { correlation_id, request: batch() }).unwrap();
        drop(port);
        wait_for_state(&worker, ConnectionState::Disconnected).await;

        sleep(Duration::from_secs(3)).await;

        let (progress, _updates) = mpsc::unbounded_channel();
        let response = hub.send_one_shot(correlation_id, batch(), progress).await.unwrap();
        assert!(response.success, "{:?}", response);
        assert_eq!(response.message, "batch search complete, found 1 of 2");

        worker.unload().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_one_shot_progress_is_broadcast() {
        let (controller, worker) = start().await;
        let mut progress = controller.subscribe_progress();

        let response = controller.request_one_shot(batch()).await;
        assert!(response.success);

        assert_eq!(progress.recv().await.unwrap().message, "1/2: widget, A1");
        assert_eq!(progress.recv().await.unwrap().message, "2/2: widget, B2");

        worker.unload().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_resume_reconnects_after_delay() {
        let (controller, worker) = start().await;

        worker.suspend();
        wait_for_state(&worker, ConnectionState::Disconnected).await;

        let resumed_at = tokio::time::Instant::now();
        worker.resume();
        wait_for_state(&worker, ConnectionState::Connected).await;
        assert!(resumed_at.elapsed() >= Duration::from_millis(100));

        wait_for_handle(&controller, true).await;
        assert_eq!(controller.connection_count().await, 2);
        assert!(controller.request(batch()).await.success);

        worker.unload().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_force_reconnect_while_disconnected() {
        let (controller, worker) = start().await;

        worker.suspend();
        wait_for_state(&worker, ConnectionState::Disconnected).await;
        wait_for_handle(&controller, false).await;
        let mut transitions = worker.subscribe_transitions();

        let response = controller.request(Request::ForceReconnect).await;
        assert_eq!(response, Response::ok("reconnect scheduled"));

        wait_for_state(&worker, ConnectionState::Connected).await;
        wait_for_handle(&controller, true).await;
        tokio::time::sleep(Duration::from_secs(2)).await;

        let mut seen = Vec::new();
        while let Ok(state) = transitions.try_recv() {
            seen.push(state);
        }
        assert_eq!(seen, vec![ConnectionState::Connecting, ConnectionState::Connected]);
        assert_eq!(controller.connection_count().await, 2);

        worker.unload().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_force_reconnect_over_channel_is_answered_first() {
        let (controller, worker) = start().await;

        let response = controller.request(Request::ForceReconnect).await;
        assert!(response.success);

        wait_for_state(&worker, ConnectionState::Disconnected).await;
        wait_for_state(&worker, ConnectionState::Connected).await;
        wait_for_handle(&controller, true).await;
        assert_eq!(controller.connection_count().await, 2);

        worker.unload().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_lifecycle_force_reconnect() {
        let (controller, worker) = start().await;

        worker.force_reconnect();
        wait_for_state(&worker, ConnectionState::Disconnected).await;
        wait_for_state(&worker, ConnectionState::Connected).await;

        assert!(controller.wait_connected(Duration::from_secs(1)).await);
        assert_eq!(controller.connection_count().await, 2);

        worker.unload().await;
    }

    #[tokio::test]
    async fn test_unloaded_worker_yields_failure_response() {
        let (controller, worker) = start().await;

        worker.unload().await;
        wait_for_handle(&controller, false).await;

        let response = controller.request(batch()).await;

        assert!(!response.success);
        assert_eq!(response.message, "could not communicate with the worker");
        assert!(response.error.is_some());
    }
}
