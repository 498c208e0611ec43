//! Single-partner joiner session.

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};

use super::pair::Pair;
use super::{Session, SessionChange, SessionCore};
use crate::config::SessionConfig;
use crate::controller::ConnectionController;
use crate::error::{Error, Result};
use crate::identity::{check_target, Identity};
use crate::transport::{EndpointEvent, Transport, TransportEvent};
use crate::validator::Shape;

/// Dials a host and exchanges state with it.
///
/// The joiner's own endpoint is anonymous. A target identity shorter than
/// the configured minimum is refused locally and never dialed.
pub struct JoinSession<T> {
    pair: Pair<T>,
    target: Identity,
    min_target_length: usize,
}

impl<T> JoinSession<T>
where
    T: Serialize + DeserializeOwned + Clone,
{
    pub fn new(
        transport: Arc<dyn Transport>,
        target: Identity,
        initial: T,
        config: SessionConfig,
    ) -> Result<Self> {
        config.validate()?;
        let shape = match config.peer_shape.clone() {
            Some(shape) => shape,
            None => Shape::from_sample(&initial)?,
        };

        let core = SessionCore::new(ConnectionController::new(transport));
        let mut session = Self {
            pair: Pair::new(core, initial, shape),
            target,
            min_target_length: config.min_target_length(),
        };
        session.start();
        Ok(session)
    }

    fn start(&mut self) {
        if let Err(e) = check_target(&self.target, self.min_target_length) {
            warn!(target = %self.target, "Target identity too short, not connecting");
            self.pair.core.fail(&e);
            return;
        }
        if let Err(e) = self.pair.core.controller.acquire(None) {
            self.pair.core.fail(&e);
        }
    }

    /// Point the session at a different host. The current endpoint and
    /// partner are dropped first.
    pub fn set_target(&mut self, target: Identity) {
        debug!(from = %self.target, to = %target, "Retargeting join session");
        self.target = target;
        self.pair.core.controller.reset();
        self.pair.drop_partner();
        self.pair.remote = None;
        self.pair.core.notify_connections();
        self.start();
    }

    pub fn target(&self) -> &Identity {
        &self.target
    }

    /// Host's last-known state.
    pub fn remote_state(&self) -> Option<&T> {
        self.pair.remote.as_ref()
    }

    pub fn local_state(&self) -> &T {
        &self.pair.local
    }

    /// Replace the local state and push it to the host if connected.
    pub fn set_local_state(&mut self, state: T) {
        self.pair.set_local_state(state);
    }

    pub fn is_connected(&self) -> bool {
        self.pair.connected
    }

    pub fn error(&self) -> Option<&str> {
        self.pair.core.errors.get()
    }

    pub fn subscribe<F>(&mut self, listener: F)
    where
        F: FnMut(&SessionChange) + Send + 'static,
    {
        self.pair.core.subscribe(Box::new(listener));
    }

    pub fn destroy(&mut self) {
        self.pair.core.controller.destroy();
        self.pair.drop_partner();
    }

    fn dial(&mut self) {
        let target = self.target.clone();
        match self.pair.core.controller.connect(&target) {
            Ok(conn) => {
                self.pair.partner = Some(conn.peer().clone());
                self.pair.core.notify_connections();
            }
            Err(e) => self.pair.core.fail(&e),
        }
    }
}

impl<T> Session for JoinSession<T>
where
    T: Serialize + DeserializeOwned + Clone,
{
    fn controller(&mut self) -> &mut ConnectionController {
        &mut self.pair.core.controller
    }

    fn dispatch(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Endpoint(EndpointEvent::Open(id)) => {
                debug!(identity = %id, target = %self.target, "Joiner endpoint open, dialing");
                self.dial();
            }
            TransportEvent::Endpoint(EndpointEvent::Connection(conn)) => self.pair.adopt(&conn),
            TransportEvent::Endpoint(EndpointEvent::Error(message)) => {
                self.pair.core.fail(&Error::Transport(message));
            }
            TransportEvent::Endpoint(EndpointEvent::Close) => {
                self.pair.drop_partner();
                self.pair.core.notify_connections();
            }
            TransportEvent::Endpoint(EndpointEvent::Disconnected) => {
                debug!("Joiner lost the broker");
            }
            TransportEvent::Connection { peer, event, .. } => {
                self.pair.on_connection_event(peer, event);
            }
        }
    }
}
