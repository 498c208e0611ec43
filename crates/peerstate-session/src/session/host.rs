//! Single-partner host session.

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, info};

use super::pair::Pair;
use super::{Session, SessionChange, SessionCore};
use crate::config::SessionConfig;
use crate::controller::ConnectionController;
use crate::error::{Error, Result};
use crate::identity::{Identity, IdentityManager, IdentityStore, Role};
use crate::transport::{EndpointEvent, Transport, TransportEvent};
use crate::validator::Shape;

/// Hosts a state exchange with exactly one partner.
///
/// The host binds its endpoint to its persisted identity, which is the
/// address a joiner dials. While a partner is live, further inbound
/// connections are closed.
pub struct HostSession<T> {
    pair: Pair<T>,
    identities: IdentityManager,
    requested: Identity,
    own_identity: Option<Identity>,
}

impl<T> HostSession<T>
where
    T: Serialize + DeserializeOwned + Clone,
{
    /// Acquire the host identity and request an endpoint bound to it.
    pub fn new(
        transport: Arc<dyn Transport>,
        store: Arc<dyn IdentityStore>,
        initial: T,
        config: SessionConfig,
    ) -> Result<Self> {
        config.validate()?;
        let shape = match config.peer_shape.clone() {
            Some(shape) => shape,
            None => Shape::from_sample(&initial)?,
        };
        let identities = config.identity_manager(store);
        let requested = identities.acquire(Role::Host)?;

        let core = SessionCore::new(ConnectionController::new(transport));
        let mut session = Self {
            pair: Pair::new(core, initial, shape),
            identities,
            requested,
            own_identity: None,
        };
        session.bind();
        Ok(session)
    }

    fn bind(&mut self) {
        self.own_identity = None;
        self.pair.drop_partner();
        self.pair.remote = None;
        let requested = self.requested.clone();
        if let Err(e) = self.pair.core.controller.acquire(Some(requested)) {
            self.pair.core.fail(&e);
        }
    }

    /// Partner's last-known state.
    pub fn remote_state(&self) -> Option<&T> {
        self.pair.remote.as_ref()
    }

    pub fn local_state(&self) -> &T {
        &self.pair.local
    }

    /// Replace the local state and push it to the partner if connected.
    pub fn set_local_state(&mut self, state: T) {
        self.pair.set_local_state(state);
    }

    pub fn is_connected(&self) -> bool {
        self.pair.connected
    }

    /// The identity a joiner dials. `None` until the endpoint opens.
    pub fn own_identity(&self) -> Option<&Identity> {
        self.own_identity.as_ref()
    }

    pub fn error(&self) -> Option<&str> {
        self.pair.core.errors.get()
    }

    /// Rotate to a freshly generated identity and rebind the endpoint.
    /// The current partner is dropped.
    pub fn regenerate_identity(&mut self) -> Result<Identity> {
        let identity = self.identities.regenerate(Role::Host)?;
        self.requested = identity.clone();
        self.bind();
        Ok(identity)
    }

    /// Register an observer.
    pub fn subscribe<F>(&mut self, listener: F)
    where
        F: FnMut(&SessionChange) + Send + 'static,
    {
        self.pair.core.subscribe(Box::new(listener));
    }

    /// Release the endpoint for good.
    pub fn destroy(&mut self) {
        self.pair.core.controller.destroy();
        self.pair.drop_partner();
    }
}

impl<T> Session for HostSession<T>
where
    T: Serialize + DeserializeOwned + Clone,
{
    fn controller(&mut self) -> &mut ConnectionController {
        &mut self.pair.core.controller
    }

    fn dispatch(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Endpoint(EndpointEvent::Open(id)) => {
                if id != self.requested {
                    info!(requested = %self.requested, effective = %id, "Host bound under a different identity");
                    if let Err(e) = self.identities.persist(Role::Host, &id) {
                        self.pair.core.fail(&e);
                    }
                    self.requested = id.clone();
                }
                self.own_identity = Some(id.clone());
                self.pair.core.notify(SessionChange::Identity(id));
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
                debug!("Host lost the broker");
                self.pair.set_connected(false);
            }
            TransportEvent::Connection { peer, event, .. } => {
                self.pair.on_connection_event(peer, event);
            }
        }
    }
}
