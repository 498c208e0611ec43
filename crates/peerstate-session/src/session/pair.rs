//! State exchange with a single partner, shared by both 1:1 sessions.

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, trace, warn};

use super::{SessionChange, SessionCore};
use crate::error::Error;
use crate::transport::{ConnectionEvent, ConnectionRef, PeerAddress};
use crate::validator::{self, Shape};

pub(crate) struct Pair<T> {
    pub core: SessionCore,
    pub local: T,
    pub remote: Option<T>,
    pub connected: bool,
    pub partner: Option<PeerAddress>,
    shape: Shape,
}

impl<T> Pair<T>
where
    T: Serialize + DeserializeOwned,
{
    pub fn new(core: SessionCore, local: T, shape: Shape) -> Self {
        Self {
            core,
            local,
            remote: None,
            connected: false,
            partner: None,
            shape,
        }
    }

    pub fn set_connected(&mut self, connected: bool) {
        if self.connected != connected {
            self.connected = connected;
            debug!(connected, "Partner connectivity changed");
            self.core.notify(SessionChange::Connectivity(connected));
        }
    }

    /// Forget the partner (endpoint gone or being replaced).
    pub fn drop_partner(&mut self) {
        self.partner = None;
        self.set_connected(false);
    }

    pub fn set_local_state(&mut self, state: T) {
        self.local = state;
        self.core.notify(SessionChange::LocalState);
        if self.connected {
            self.push_local();
        }
    }

    /// Send the local state to the partner.
    pub fn push_local(&mut self) {
        let payload = match serde_json::to_value(&self.local) {
            Ok(payload) => payload,
            Err(e) => {
                self.core.fail(&Error::from(e));
                return;
            }
        };

        if self.core.controller.connection_count() == 0 {
            self.set_connected(false);
            return;
        }

        let report = self.core.broadcast(&payload, |_| None);
        if report.delivered == 0 {
            self.set_connected(false);
        }
    }

    /// Accept `conn` as the partner unless another live partner is being
    /// served, in which case `conn` is closed.
    pub fn adopt(&mut self, conn: &ConnectionRef) {
        let incoming = conn.peer().clone();
        let serving = self
            .partner
            .as_ref()
            .filter(|p| **p != incoming)
            .and_then(|p| self.core.controller.connection(p))
            .is_some();

        if serving {
            warn!(peer = %incoming, "Already serving a partner, closing extra connection");
            self.core.controller.disconnect(&incoming);
            self.core.notify_connections();
            return;
        }

        debug!(peer = %incoming, "Partner connection");
        self.partner = Some(incoming);
        self.core.notify_connections();
    }

    pub fn on_connection_event(&mut self, peer: PeerAddress, event: ConnectionEvent) {
        if self.partner.as_ref() != Some(&peer) {
            trace!(%peer, "Ignoring event from non-partner connection");
            return;
        }

        match event {
            ConnectionEvent::Open => {
                self.core.clear_error();
                self.set_connected(true);
                self.push_local();
            }
            ConnectionEvent::Data(payload) => match validator::decode::<T>(&self.shape, &payload) {
                Ok(state) => {
                    self.remote = Some(state);
                    self.core.clear_error();
                    self.set_connected(true);
                    self.core.notify(SessionChange::RemoteState);
                }
                Err(e) => self.core.fail(&e),
            },
            ConnectionEvent::Close | ConnectionEvent::Disconnected => {
                self.drop_partner();
                self.core.notify_connections();
            }
            ConnectionEvent::Error(message) => self.core.fail(&Error::Transport(message)),
        }
    }
}
