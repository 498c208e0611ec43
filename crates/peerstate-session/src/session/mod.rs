//! Session kinds and the machinery they share.
//!
//! | Session | Topology | Remote view |
//! |---------|----------|-------------|
//! | [`HostSession`] | one partner | partner state |
//! | [`JoinSession`] | one partner | partner state |
//! | [`HostMultiSession`] | star, centre | peer registry |
//! | [`JoinMultiSession`] | star, leaf | host state + relayed siblings |
//!
//! Sessions never run on their own. Whoever owns one feeds it transport
//! events, either synchronously through [`Session::poll`] or from an async
//! loop (see [`crate::driver`]). Each handler runs to completion before the
//! next event is taken, and every local change is pushed out synchronously
//! inside the call that made it.

mod host;
mod host_multi;
mod join;
mod join_multi;
mod pair;

pub use host::HostSession;
pub use host_multi::HostMultiSession;
pub use join::JoinSession;
pub use join_multi::JoinMultiSession;

use serde_json::Value;
use tracing::{trace, warn};

use crate::controller::ConnectionController;
use crate::error::{Error, ErrorSlot};
use crate::identity::Identity;
use crate::transport::{PeerAddress, TransportEvent};

/// Something observers are told about.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionChange {
    /// The caller replaced the local state.
    LocalState,
    /// The single partner's state was replaced.
    RemoteState,
    /// A multi-peer joiner received a new host state.
    HostState,
    /// The peer registry changed.
    Peers,
    /// Single-partner connectivity flipped.
    Connectivity(bool),
    /// The number of live connections changed.
    Connections(usize),
    /// The session's own identity became known or changed.
    Identity(Identity),
    /// The error channel was set or cleared.
    Error(Option<String>),
}

type Listener = Box<dyn FnMut(&SessionChange) + Send>;

/// Outcome of pushing one payload to every tracked connection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Broadcast {
    /// Connections the payload was handed to.
    pub delivered: usize,
    /// Connections that were not ready.
    pub failed: Vec<PeerAddress>,
}

impl Broadcast {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Event-driven session fed by its controller's transport events.
pub trait Session {
    /// The controller owning this session's endpoint.
    fn controller(&mut self) -> &mut ConnectionController;

    /// Handle one transport event.
    fn dispatch(&mut self, event: TransportEvent);

    /// Handle every event that is already pending. Returns how many were
    /// handled.
    fn poll(&mut self) -> usize {
        let mut handled = 0;
        while let Some(event) = self.controller().try_next_event() {
            self.dispatch(event);
            handled += 1;
        }
        handled
    }
}

/// Controller, error channel and observers: the parts every session has.
pub(crate) struct SessionCore {
    pub controller: ConnectionController,
    pub errors: ErrorSlot,
    listeners: Vec<Listener>,
    last_connection_count: usize,
}

impl SessionCore {
    pub fn new(controller: ConnectionController) -> Self {
        Self {
            controller,
            errors: ErrorSlot::new(),
            listeners: Vec::new(),
            last_connection_count: 0,
        }
    }

    pub fn subscribe(&mut self, listener: Listener) {
        self.listeners.push(listener);
    }

    pub fn notify(&mut self, change: SessionChange) {
        trace!(?change, "Session change");
        for listener in &mut self.listeners {
            listener(&change);
        }
    }

    /// Report the connection count if it moved since the last report.
    pub fn notify_connections(&mut self) {
        let count = self.controller.connection_count();
        if count != self.last_connection_count {
            self.last_connection_count = count;
            self.notify(SessionChange::Connections(count));
        }
    }

    /// Put `error` in the error channel.
    pub fn fail(&mut self, error: &Error) {
        warn!(error = %error, "Session error");
        self.errors.set(error);
        let message = self.errors.get().map(str::to_string);
        self.notify(SessionChange::Error(message));
    }

    pub fn clear_error(&mut self) {
        if self.errors.clear() {
            self.notify(SessionChange::Error(None));
        }
    }

    /// Send `payload` to every tracked connection. A connection that is not
    /// ready is reported on the error channel, naming the identity last seen
    /// on it; the remaining connections are still served.
    pub fn broadcast<F>(&mut self, payload: &Value, previous: F) -> Broadcast
    where
        F: Fn(&PeerAddress) -> Option<Identity>,
    {
        let mut report = Broadcast::default();
        let mut lost = Vec::new();

        for conn in self.controller.connections() {
            let sent = conn.is_open() && conn.send(payload).is_ok();
            if sent {
                report.delivered += 1;
            } else {
                lost.push(conn.peer().clone());
            }
        }

        for peer in lost {
            let error = Error::ConnectionLost {
                previous: previous(&peer),
                peer: peer.clone(),
            };
            self.fail(&error);
            report.failed.push(peer);
        }

        trace!(
            delivered = report.delivered,
            failed = report.failed.len(),
            "Broadcast local state"
        );
        report
    }

    /// Send `payload` to one tracked connection. Returns false if it is
    /// missing or not ready.
    pub fn send_to(&mut self, peer: &PeerAddress, payload: &Value) -> bool {
        match self.controller.connection(peer) {
            Some(conn) if conn.is_open() => conn.send(payload).is_ok(),
            _ => false,
        }
    }

    /// Forward `payload` to every open connection except `origin`.
    pub fn relay(&mut self, origin: &PeerAddress, payload: &Value) -> usize {
        self.controller
            .connections()
            .iter()
            .filter(|c| c.peer() != origin && c.is_open())
            .filter(|c| c.send(payload).is_ok())
            .count()
    }
}
