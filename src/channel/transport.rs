use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::debug;
use uuid::Uuid;

use crate::channel::error::ChannelError;
use crate::channel::protocol::{ControllerMessage, Request, Response, WorkerMessage};
use crate::crawler::runner::ProgressSender;

/// One end of a named bidirectional channel.
///
/// Dropping either end is the disconnect notification for the other: its
/// `recv` yields `None` and its `post` fails.
pub struct Port<Out, In> {
    name: String,
    tx: mpsc::UnboundedSender<Out>,
    rx: mpsc::UnboundedReceiver<In>,
}

impl<Out, In> Port<Out, In> {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn post(&self, message: Out) -> Result<(), ChannelError> {
        self.tx.send(message).map_err(|_| ChannelError::Disconnected)
    }

    pub async fn recv(&mut self) -> Option<In> {
        self.rx.recv().await
    }

    pub fn split(self) -> (mpsc::UnboundedSender<Out>, mpsc::UnboundedReceiver<In>) {
        (self.tx, self.rx)
    }
}

pub type WorkerPort = Port<WorkerMessage, ControllerMessage>;
pub type ControllerPort = Port<ControllerMessage, WorkerMessage>;

/// Controller side of `Hub::connect`; yields every newly opened channel
pub type PortListener = mpsc::UnboundedReceiver<ControllerPort>;

/// A single request sent outside any channel, answered exactly once.
///
/// A request that already went out over a channel keeps its correlation id,
/// so the worker can answer it from the dispatch that is still running.
pub struct OneShotRequest {
    pub correlation_id: Uuid,
    pub request: Request,
    pub progress: ProgressSender,
    pub reply: oneshot::Sender<Response>,
}

struct HubInner {
    incoming: mpsc::UnboundedSender<ControllerPort>,
    one_shot: Mutex<Option<mpsc::UnboundedSender<OneShotRequest>>>,
}

/// Rendezvous point between the controller and the worker
#[derive(Clone)]
pub struct Hub {
    inner: Arc<HubInner>,
}

impl Hub {
    pub fn new() -> (Self, PortListener) {
        let (incoming, listener) = mpsc::unbounded_channel();
        let hub = Self {
            inner: Arc::new(HubInner {
                incoming,
                one_shot: Mutex::new(None),
            }),
        };
        (hub, listener)
    }

    /// Open a named channel towards the controller
    pub fn connect(&self, name: &str) -> Result<WorkerPort, ChannelError> {
        let (to_controller, from_worker) = mpsc::unbounded_channel();
        let (to_worker, from_controller) = mpsc::unbounded_channel();

        let controller_end = Port {
            name: name.to_string(),
            tx: to_worker,
            rx: from_worker,
        };
        self.inner
            .incoming
            .send(controller_end)
            .map_err(|_| ChannelError::Unreachable("no controller is listening".to_string()))?;

        debug!("Opened channel '{}'", name);
        Ok(Port {
            name: name.to_string(),
            tx: to_controller,
            rx: from_controller,
        })
    }

    /// Register the receiver of one-shot requests, replacing any earlier one
    pub async fn listen_one_shot(&self) -> mpsc::UnboundedReceiver<OneShotRequest> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.inner.one_shot.lock().await = Some(tx);
        rx
    }

    /// Deliver a request without a channel and wait for its reply
    pub async fn send_one_shot(
        &self,
        correlation_id: Uuid,
        request: Request,
        progress: ProgressSender,
    ) -> Result<Response, ChannelError> {
        let sender = self
            .inner
            .one_shot
            .lock()
            .await
            .clone()
            .ok_or_else(|| ChannelError::Unreachable("no worker is listening".to_string()))?;

        let (reply, response) = oneshot::channel();
        sender
            .send(OneShotRequest {
                correlation_id,
                request,
                progress,
                reply,
            })
            .map_err(|_| ChannelError::Unreachable("worker has exited".to_string()))?;

        response.await.map_err(|_| ChannelError::Disconnected)
    }
}
