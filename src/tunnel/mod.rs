//! Tunnel session to the relay.
//!
//! [`TunnelSession::open`] performs the relay handshake and returns once a
//! public URL is assigned. Inbound requests are then pulled one at a time
//! with [`TunnelSession::next_request`] until the session closes or the
//! tunnel is lost.
//!
//! Two relay transports are supported:
//! - `localtunnel` - HTTP handshake, then a pool of TCP sockets carrying HTTP/1.1
//! - `websocket` - JSON frames over a single WebSocket

mod localtunnel;
mod websocket;

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use std::future::Future;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

use crate::error::{TunnelDisconnect, TunnelError};
use crate::relay::InboundRequest;

pub const DEFAULT_LOCAL_PORT: u16 = 8954;
pub const DEFAULT_RELAY_HOST: &str = "https://localtunnel.me";
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(15);
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(90);

/// How long a closing transport may spend writing outstanding replies
const FLUSH_TIMEOUT: Duration = Duration::from_secs(10);

/// Inbound requests buffered between the transport and the consumer
const EVENT_QUEUE: usize = 64;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum RelayProtocol {
    #[default]
    Localtunnel,
    Websocket,
}

#[derive(Debug, Clone)]
pub struct TunnelConfig {
    /// Local port announced to the relay
    pub local_port: u16,
    /// `None` lets the relay assign one
    pub requested_subdomain: Option<String>,
    pub relay_host: String,
    pub protocol: RelayProtocol,
    pub handshake_timeout: Duration,
    /// A WebSocket relay silent for this long is considered lost
    pub idle_timeout: Duration,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            local_port: DEFAULT_LOCAL_PORT,
            requested_subdomain: None,
            relay_host: DEFAULT_RELAY_HOST.to_string(),
            protocol: RelayProtocol::default(),
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Open,
    Closed,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionState::Connecting => write!(f, "Connecting"),
            SessionState::Open => write!(f, "Open"),
            SessionState::Closed => write!(f, "Closed"),
        }
    }
}

pub type InboundEvent = Result<InboundRequest, TunnelDisconnect>;

/// Transport side of a session: where inbound requests are delivered and
/// how a lost tunnel is reported.
#[derive(Clone)]
pub(crate) struct SessionLink {
    events: mpsc::Sender<InboundEvent>,
    state: Arc<watch::Sender<SessionState>>,
    cancel: CancellationToken,
    tasks: TaskTracker,
}

impl SessionLink {
    /// Hand a request to the consumer. If the session is gone the request is
    /// dropped, which answers it with a 500.
    pub(crate) async fn deliver(&self, request: InboundRequest) {
        if self.events.send(Ok(request)).await.is_err() {
            debug!("Session closed, dropping inbound request");
        }
    }

    /// Report an unexpected loss of the tunnel. Only the first report of an
    /// open session reaches the consumer.
    pub(crate) async fn disconnect(&self, reason: impl Into<String>) {
        if !mark_closed(&self.state) {
            return;
        }
        self.cancel.cancel();
        let _ = self
            .events
            .send(Err(TunnelDisconnect::new(reason)))
            .await;
    }

    pub(crate) fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Run a transport task the session waits for when it closes
    pub(crate) fn spawn<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.tasks.spawn(task);
    }
}

/// Transition to Closed. Returns false if the session was already closed.
fn mark_closed(state: &watch::Sender<SessionState>) -> bool {
    state.send_if_modified(|current| {
        if *current == SessionState::Closed {
            false
        } else {
            *current = SessionState::Closed;
            true
        }
    })
}

/// An open tunnel to the relay
pub struct TunnelSession {
    public_url: String,
    state: Arc<watch::Sender<SessionState>>,
    events: mpsc::Receiver<InboundEvent>,
    cancel: CancellationToken,
    tasks: TaskTracker,
    ended: bool,
}

impl TunnelSession {
    /// Perform the relay handshake and return the open session
    pub async fn open(config: &TunnelConfig) -> Result<Self, TunnelError> {
        let (events_tx, events) = mpsc::channel(EVENT_QUEUE);
        let state = Arc::new(watch::channel(SessionState::Connecting).0);
        let cancel = CancellationToken::new();
        let tasks = TaskTracker::new();

        let link = SessionLink {
            events: events_tx,
            state: state.clone(),
            cancel: cancel.clone(),
            tasks: tasks.clone(),
        };

        let handshake = async {
            match config.protocol {
                RelayProtocol::Localtunnel => localtunnel::connect(config, link).await,
                RelayProtocol::Websocket => websocket::connect(config, link).await,
            }
        };

        let public_url = match tokio::time::timeout(config.handshake_timeout, handshake).await {
            Ok(Ok(url)) => url,
            Ok(Err(e)) => {
                cancel.cancel();
                return Err(e);
            }
            Err(_) => {
                cancel.cancel();
                return Err(TunnelError::timeout(config.handshake_timeout));
            }
        };

        state.send_if_modified(|current| {
            if *current == SessionState::Connecting {
                *current = SessionState::Open;
                true
            } else {
                false
            }
        });
        debug!("Tunnel open: {}", public_url);

        Ok(Self {
            public_url,
            state,
            events,
            cancel,
            tasks,
            ended: false,
        })
    }

    pub fn public_url(&self) -> &str {
        &self.public_url
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Lifecycle notifications: the receiver observes Open and Closed
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    /// Next inbound request.
    ///
    /// `None` once the session is closed. A lost tunnel yields one
    /// `Err(TunnelDisconnect)` before the sequence ends.
    pub async fn next_request(&mut self) -> Option<InboundEvent> {
        if self.ended {
            return None;
        }

        match self.events.recv().await {
            Some(Err(disconnect)) => {
                self.ended = true;
                Some(Err(disconnect))
            }
            Some(Ok(request)) => Some(Ok(request)),
            None => {
                self.ended = true;
                None
            }
        }
    }

    /// Stop taking requests and release the relay connection. Safe to call
    /// more than once.
    ///
    /// Requests already handed out keep their transport: their replies are
    /// still written once they arrive. Requests not yet handed out are
    /// answered with a 500. Use [`TunnelSession::wait_closed`] to wait for
    /// the outstanding replies to be written.
    pub fn close(&mut self) {
        self.events.close();
        // Undelivered requests answer 500 as they drop
        while self.events.try_recv().is_ok() {}
        self.ended = true;
        self.cancel.cancel();
        self.tasks.close();
        if mark_closed(&self.state) {
            debug!("Tunnel closed: {}", self.public_url);
        }
    }

    /// Wait for the transport to finish after [`TunnelSession::close`]
    pub async fn wait_closed(&self) {
        if tokio::time::timeout(FLUSH_TIMEOUT, self.tasks.wait())
            .await
            .is_err()
        {
            warn!(
                "Tunnel transport still busy after {:?}, giving up on {} task(s)",
                FLUSH_TIMEOUT,
                self.tasks.len()
            );
        }
    }
}

impl Drop for TunnelSession {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mark_closed_only_once() {
        let (state, _rx) = watch::channel(SessionState::Open);
        assert!(mark_closed(&state));
        assert!(!mark_closed(&state));
        assert_eq!(*state.borrow(), SessionState::Closed);
    }

    #[test]
    fn test_relay_protocol_parses_lowercase() {
        #[derive(Deserialize)]
        struct Wrapper {
            protocol: RelayProtocol,
        }
        let parsed: Wrapper = toml::from_str(r#"protocol = "websocket""#).unwrap();
        assert_eq!(parsed.protocol, RelayProtocol::Websocket);
    }
}
