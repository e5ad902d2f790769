use std::collections::HashSet;
use std::future;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::channel::error::ChannelError;
use crate::channel::protocol::{ControllerMessage, Response, WorkerMessage};
use crate::channel::transport::{Hub, WorkerPort};
use crate::cli::config::ChannelSettings;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Lifecycle events delivered to the worker loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionSignal {
    /// Context became active again; reconnect after the resume delay
    Resume,
    /// Context is being suspended; long-lived channels must be closed
    Suspend,
    /// Delayed reconnect is due
    Reconnect,
    /// Tear down and reconnect after the reconnect delay
    ForceReconnect,
    Unload,
}

/// Worker side of the channel: at most one live port plus the ids of the
/// requests that arrived on it and still await a response.
pub struct ChannelSession {
    hub: Hub,
    name: String,
    origin: String,
    port: Option<WorkerPort>,
    pending: HashSet<Uuid>,
    state: watch::Sender<ConnectionState>,
    transitions: broadcast::Sender<ConnectionState>,
}

impl ChannelSession {
    pub fn new(hub: Hub, settings: &ChannelSettings) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let (transitions, _) = broadcast::channel(32);
        Self {
            hub,
            name: settings.name.clone(),
            origin: settings.origin.clone(),
            port: None,
            pending: HashSet::new(),
            state,
            transitions,
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Every state change, in order
    pub fn subscribe_transitions(&self) -> broadcast::Receiver<ConnectionState> {
        self.transitions.subscribe()
    }

    pub fn transitions_sender(&self) -> broadcast::Sender<ConnectionState> {
        self.transitions.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.port.is_some() && self.state() == ConnectionState::Connected
    }

    fn set_state(&self, next: ConnectionState) {
        let changed = self.state.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
        if changed {
            debug!("Channel state: {:?}", next);
            let _ = self.transitions.send(next);
        }
    }

    /// Drop the port and forget its requests without touching the state
    fn drop_port(&mut self) {
        if self.port.take().is_some() {
            debug!("Closed channel '{}'", self.name);
        }
        if !self.pending.is_empty() {
            debug!("Dropping {} pending responses", self.pending.len());
            self.pending.clear();
        }
    }

    /// Replace any existing port with a fresh one and announce it
    pub fn connect(&mut self) -> Result<(), ChannelError> {
        self.drop_port();
        self.set_state(ConnectionState::Connecting);

        let port = match self.hub.connect(&self.name) {
            Ok(port) => port,
            Err(e) => {
                warn!("Could not open channel '{}': {}", self.name, e);
                self.set_state(ConnectionState::Disconnected);
                return Err(ChannelError::Handshake(e.to_string()));
            }
        };

        self.port = Some(port);
        self.set_state(ConnectionState::Connected);

        let handshake = WorkerMessage::Connected { origin: self.origin.clone() };
        if let Err(e) = self.post(handshake) {
            self.disconnect();
            return Err(ChannelError::Handshake(e.to_string()));
        }

        info!("Connected on channel '{}'", self.name);
        Ok(())
    }

    /// Close the port on our own initiative
    pub fn disconnect(&mut self) {
        self.drop_port();
        self.set_state(ConnectionState::Disconnected);
    }

    /// React to the other end going away. Returns false when the session
    /// was already down, in which case nothing is written.
    pub fn handle_disconnect(&mut self) -> bool {
        if self.port.is_none() && self.state() == ConnectionState::Disconnected {
            return false;
        }
        info!("Channel '{}' disconnected", self.name);
        self.disconnect();
        true
    }

    /// Next inbound message; never resolves while no port is open
    pub async fn recv(&mut self) -> Option<ControllerMessage> {
        match self.port.as_mut() {
            Some(port) => port.recv().await,
            None => future::pending().await,
        }
    }

    fn post(&self, message: WorkerMessage) -> Result<(), ChannelError> {
        match &self.port {
            Some(port) => port.post(message),
            None => Err(ChannelError::NoHandle),
        }
    }

    /// Remember a request received on the current port
    pub fn accept(&mut self, correlation_id: Uuid) {
        self.pending.insert(correlation_id);
    }

    /// Send a response if its request came in on the current port.
    /// Hands the response back when it could not go out on this port.
    pub fn deliver(&mut self, correlation_id: Uuid, response: Response) -> Result<(), Response> {
        if !self.pending.remove(&correlation_id) {
            debug!("No open request {} on the current channel", correlation_id);
            return Err(response);
        }
        let message = WorkerMessage::Response {
            correlation_id,
            response: response.clone(),
        };
        self.post(message).map_err(|e| {
            debug!("Response {} not delivered: {}", correlation_id, e);
            response
        })
    }

    pub fn forward_progress(&self, correlation_id: Uuid, message: String) {
        if self.pending.contains(&correlation_id) {
            let _ = self.post(WorkerMessage::Progress { correlation_id, message });
        }
    }
}
