use futures::FutureExt;
use std::any::Any;
use std::collections::{HashMap, HashSet, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::sleep;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use crate::channel::dispatch::{DispatchContext, Dispatcher};
use crate::channel::protocol::{ControllerMessage, Request, Response};
use crate::channel::session::{ChannelSession, ConnectionState, SessionSignal};
use crate::channel::transport::{Hub, OneShotRequest};
use crate::cli::config::ChannelSettings;
use crate::crawler::runner::ProgressUpdate;

/// Responses kept for one-shot callers after their channel closed
const PARKED_LIMIT: usize = 8;

/// Results of spawned dispatches heading back to the channel
enum Outbound {
    Progress { correlation_id: Uuid, update: ProgressUpdate },
    Response { correlation_id: Uuid, response: Response },
}

/// Control surface of a running worker
pub struct WorkerHandle {
    signals: mpsc::UnboundedSender<SessionSignal>,
    state: watch::Receiver<ConnectionState>,
    transitions: broadcast::Sender<ConnectionState>,
    task: Option<JoinHandle<()>>,
}

impl WorkerHandle {
    pub fn resume(&self) {
        let _ = self.signals.send(SessionSignal::Resume);
    }

    pub fn suspend(&self) {
        let _ = self.signals.send(SessionSignal::Suspend);
    }

    pub fn force_reconnect(&self) {
        let _ = self.signals.send(SessionSignal::ForceReconnect);
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    pub fn subscribe_transitions(&self) -> broadcast::Receiver<ConnectionState> {
        self.transitions.subscribe()
    }

    /// Stop the worker, abandoning in-flight requests
    pub async fn unload(mut self) {
        let _ = self.signals.send(SessionSignal::Unload);
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                error!("Worker task ended abnormally: {}", e);
            }
        }
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        if self.task.is_some() {
            let _ = self.signals.send(SessionSignal::Unload);
        }
    }
}

/// The executing side: owns the channel session and serves requests
pub struct Worker {
    session: ChannelSession,
    dispatcher: Arc<Dispatcher>,
    resume_delay: Duration,
    reconnect_delay: Duration,
    signals_tx: mpsc::UnboundedSender<SessionSignal>,
    signals_rx: mpsc::UnboundedReceiver<SessionSignal>,
    one_shot: mpsc::UnboundedReceiver<OneShotRequest>,
    outbound_tx: mpsc::UnboundedSender<Outbound>,
    outbound_rx: mpsc::UnboundedReceiver<Outbound>,
    in_flight: JoinSet<()>,
    /// Channel batches still being dispatched
    running: HashSet<Uuid>,
    /// One-shot callers re-sending a batch that is still running
    attached: HashMap<Uuid, Vec<OneShotRequest>>,
    /// Finished batches whose channel closed first, oldest first
    parked: VecDeque<(Uuid, Response)>,
}

impl Worker {
    /// Start serving on `hub`; connects right away
    pub async fn spawn(hub: Hub, dispatcher: Arc<Dispatcher>, settings: &ChannelSettings) -> WorkerHandle {
        let one_shot = hub.listen_one_shot().await;
        let session = ChannelSession::new(hub, settings);
        let state = session.watch_state();
        let transitions = session.transitions_sender();

        let (signals_tx, signals_rx) = mpsc::unbounded_channel();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();

        let worker = Worker {
            session,
            dispatcher,
            resume_delay: Duration::from_millis(settings.resume_delay_ms),
            reconnect_delay: Duration::from_millis(settings.reconnect_delay_ms),
            signals_tx: signals_tx.clone(),
            signals_rx,
            one_shot,
            outbound_tx,
            outbound_rx,
            in_flight: JoinSet::new(),
            running: HashSet::new(),
            attached: HashMap::new(),
            parked: VecDeque::new(),
        };

        WorkerHandle {
            signals: signals_tx,
            state,
            transitions,
            task: Some(tokio::spawn(worker.run())),
        }
    }

    async fn run(mut self) {
        if let Err(e) = self.session.connect() {
            warn!("Initial connect failed: {}", e);
        }

        loop {
            tokio::select! {
                signal = self.signals_rx.recv() => match signal {
                    Some(SessionSignal::Resume) => {
                        debug!("Resumed, reconnecting in {:?}", self.resume_delay);
                        self.schedule_reconnect(self.resume_delay);
                    }
                    Some(SessionSignal::Suspend) => {
                        info!("Suspended, closing channel");
                        self.session.disconnect();
                    }
                    Some(SessionSignal::Reconnect) => {
                        if let Err(e) = self.session.connect() {
                            warn!("Reconnect failed: {}", e);
                        }
                    }
                    Some(SessionSignal::ForceReconnect) => {
                        info!("Forced reconnect in {:?}", self.reconnect_delay);
                        self.session.disconnect();
                        self.schedule_reconnect(self.reconnect_delay);
                    }
                    Some(SessionSignal::Unload) | None => break,
                },
                inbound = self.session.recv(), if self.session.is_connected() => match inbound {
                    Some(ControllerMessage::Ping) => trace!("Liveness probe"),
                    Some(ControllerMessage::Request { correlation_id, request }) => {
                        self.session.accept(correlation_id);
                        self.handle_request(correlation_id, request).await;
                    }
                    None => {
                        self.session.handle_disconnect();
                    }
                },
                Some(incoming) = self.one_shot.recv() => self.handle_one_shot(incoming),
                Some(outbound) = self.outbound_rx.recv() => match outbound {
                    Outbound::Progress { correlation_id, update } => {
                        for waiter in self.attached.get(&correlation_id).into_iter().flatten() {
                            let _ = waiter.progress.send(update.clone());
                        }
                        self.session.forward_progress(correlation_id, update.message);
                    }
                    Outbound::Response { correlation_id, response } => {
                        self.complete(correlation_id, response);
                    }
                },
                Some(joined) = self.in_flight.join_next(), if !self.in_flight.is_empty() => {
                    if let Err(e) = joined {
                        if !e.is_cancelled() {
                            error!("Dispatch task failed: {}", e);
                        }
                    }
                }
            }
        }

        self.in_flight.abort_all();
        self.session.disconnect();
        info!("Worker unloaded");
    }

    fn schedule_reconnect(&self, delay: Duration) {
        let signals = self.signals_tx.clone();
        tokio::spawn(async move {
            sleep(delay).await;
            let _ = signals.send(SessionSignal::Reconnect);
        });
    }

    /// Batches run in the background; anything else is answered inline so
    /// its response goes out before any teardown it triggers.
    async fn handle_request(&mut self, correlation_id: Uuid, request: Request) {
        if !request.is_long_running() {
            let context = DispatchContext {
                signals: self.signals_tx.clone(),
                progress: None,
            };
            let response = guarded_dispatch(&self.dispatcher, request, context).await;
            if self.session.deliver(correlation_id, response).is_err() {
                debug!("Response {} dropped with its channel", correlation_id);
            }
            return;
        }

        self.running.insert(correlation_id);

        let dispatcher = self.dispatcher.clone();
        let signals = self.signals_tx.clone();
        let outbound = self.outbound_tx.clone();

        self.in_flight.spawn(async move {
            let (progress_tx, mut progress_rx) = mpsc::unbounded_channel();
            let context = DispatchContext {
                signals,
                progress: Some(progress_tx),
            };

            let forward = async {
                while let Some(update) = progress_rx.recv().await {
                    let _ = outbound.send(Outbound::Progress { correlation_id, update });
                }
            };
            let (response, ()) = tokio::join!(guarded_dispatch(&dispatcher, request, context), forward);

            let _ = outbound.send(Outbound::Response { correlation_id, response });
        });
    }

    /// Route a finished channel batch to whoever still waits for it
    fn complete(&mut self, correlation_id: Uuid, response: Response) {
        self.running.remove(&correlation_id);

        if let Some(waiters) = self.attached.remove(&correlation_id) {
            debug!("Answering request {} one-shot", correlation_id);
            for waiter in waiters {
                let _ = waiter.reply.send(response.clone());
            }
            return;
        }

        if let Err(response) = self.session.deliver(correlation_id, response) {
            debug!("Parking response {} until it is claimed", correlation_id);
            if self.parked.len() == PARKED_LIMIT {
                self.parked.pop_front();
            }
            self.parked.push_back((correlation_id, response));
        }
    }

    fn handle_one_shot(&mut self, incoming: OneShotRequest) {
        let correlation_id = incoming.correlation_id;

        if let Some(index) = self.parked.iter().position(|(id, _)| *id == correlation_id) {
            debug!("One-shot request {} already answered, replying from parked response", correlation_id);
            if let Some((_, response)) = self.parked.remove(index) {
                let _ = incoming.reply.send(response);
            }
            return;
        }

        if self.running.contains(&correlation_id) {
            debug!("One-shot request {} is still running, waiting on it", correlation_id);
            self.attached.entry(correlation_id).or_default().push(incoming);
            return;
        }

        debug!("One-shot request received");
        let OneShotRequest { request, progress, reply, .. } = incoming;
        let dispatcher = self.dispatcher.clone();
        let context = DispatchContext {
            signals: self.signals_tx.clone(),
            progress: Some(progress),
        };

        self.in_flight.spawn(async move {
            let response = guarded_dispatch(&dispatcher, request, context).await;
            if reply.send(response).is_err() {
                debug!("One-shot caller went away before the reply");
            }
        });
    }
}

/// Dispatch, turning a panic into a failure response. Takes the context by
/// value so the progress channel closes once the handler returns.
async fn guarded_dispatch(dispatcher: &Dispatcher, request: Request, context: DispatchContext) -> Response {
    let outcome = AssertUnwindSafe(async move { dispatcher.dispatch(request, &context).await })
        .catch_unwind()
        .await;

    match outcome {
        Ok(response) => response,
        Err(payload) => {
            let reason = panic_message(payload.as_ref());
            error!("Request handler panicked: {}", reason);
            Response::failure("request handler failed", Some(reason))
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
