//! Multi-peer host session: the centre of a star.

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, trace};

use super::{Broadcast, Session, SessionChange, SessionCore};
use crate::config::SessionConfig;
use crate::controller::ConnectionController;
use crate::error::{Error, Result};
use crate::identity::{Identity, IdentityManager, IdentityStore, Role};
use crate::registry::{PeerEntry, PeerRegistry};
use crate::state::{departure_payload, is_departure, tagged_payload, PeerState};
use crate::transport::{ConnectionEvent, EndpointEvent, PeerAddress, Transport, TransportEvent};
use crate::validator::{self, Shape};

/// Hosts a star of joiners.
///
/// Every peer's state is kept in a [`PeerRegistry`] keyed by the identity the
/// peer declares in its frames, not by its connection address, so a peer
/// that reconnects from a new address is still recognized. With relaying
/// enabled each peer frame is also forwarded to every other joiner, and a
/// peer whose connection closes is announced to the rest as departed.
pub struct HostMultiSession<H, P> {
    core: SessionCore,
    identities: IdentityManager,
    identity: Identity,
    local: H,
    peers: PeerRegistry<P>,
    peer_shape: Shape,
    relay: bool,
}

impl<H, P> HostMultiSession<H, P>
where
    H: Serialize + Clone,
    P: Serialize + DeserializeOwned + Clone,
{
    /// Acquire the host identity and request an endpoint bound to it.
    ///
    /// `config` must carry a peer shape; every peer frame is checked against
    /// it before it reaches the registry.
    pub fn new(
        transport: Arc<dyn Transport>,
        store: Arc<dyn IdentityStore>,
        initial: H,
        config: SessionConfig,
    ) -> Result<Self> {
        config.validate()?;
        let peer_shape = config.require_peer_shape("multi-peer host")?;
        let identities = config.identity_manager(store);
        let identity = identities.acquire(Role::Host)?;

        let mut session = Self {
            core: SessionCore::new(ConnectionController::new(transport)),
            identities,
            identity,
            local: initial,
            peers: PeerRegistry::new(),
            peer_shape,
            relay: config.relay_peer_states,
        };
        session.bind();
        Ok(session)
    }

    fn bind(&mut self) {
        let identity = self.identity.clone();
        if let Err(e) = self.core.controller.acquire(Some(identity)) {
            self.core.fail(&e);
        }
        if !self.peers.is_empty() {
            self.peers.clear();
            self.core.notify(SessionChange::Peers);
        }
        self.core.notify_connections();
    }

    /// Peers' last-known states, oldest update first.
    pub fn peers(&self) -> Vec<PeerState<P>> {
        self.peers.views()
    }

    pub fn peer_entries(&self) -> &[PeerEntry<P>] {
        self.peers.entries()
    }

    pub fn local_state(&self) -> &H {
        &self.local
    }

    /// Replace the local state and broadcast it to every connection.
    pub fn set_local_state(&mut self, state: H) -> Broadcast {
        self.local = state;
        self.core.notify(SessionChange::LocalState);
        self.broadcast()
    }

    /// The identity joiners dial.
    pub fn own_identity(&self) -> &Identity {
        &self.identity
    }

    pub fn connection_count(&self) -> usize {
        self.core.controller.connection_count()
    }

    pub fn error(&self) -> Option<&str> {
        self.core.errors.get()
    }

    /// Rotate to a fresh identity. Every connection and peer entry is
    /// dropped with the old endpoint.
    pub fn regenerate_identity(&mut self) -> Result<Identity> {
        let identity = self.identities.regenerate(Role::Host)?;
        self.identity = identity.clone();
        self.core.notify(SessionChange::Identity(identity.clone()));
        self.bind();
        Ok(identity)
    }

    pub fn subscribe<F>(&mut self, listener: F)
    where
        F: FnMut(&SessionChange) + Send + 'static,
    {
        self.core.subscribe(Box::new(listener));
    }

    pub fn destroy(&mut self) {
        self.core.controller.destroy();
        self.peers.clear();
    }

    /// Send the tagged local state to every tracked connection.
    pub fn broadcast(&mut self) -> Broadcast {
        let payload = match tagged_payload(&self.identity, &self.local) {
            Ok(payload) => payload,
            Err(e) => {
                self.core.fail(&e);
                return Broadcast::default();
            }
        };
        let peers = &self.peers;
        self.core
            .broadcast(&payload, |addr| peers.identity_for_address(addr).cloned())
    }

    /// Bring a freshly opened connection up to date: our state, then (when
    /// relaying) every other peer's.
    fn greet(&mut self, peer: &PeerAddress) {
        match tagged_payload(&self.identity, &self.local) {
            Ok(payload) => {
                if !self.core.send_to(peer, &payload) {
                    debug!(%peer, "Connection not ready for greeting");
                    return;
                }
            }
            Err(e) => {
                self.core.fail(&e);
                return;
            }
        }

        if !self.relay {
            return;
        }
        let snapshots: Vec<Value> = self
            .peers
            .entries()
            .iter()
            .filter(|e| &e.address != peer)
            .filter_map(|e| tagged_payload(&e.identity, &e.last_state).ok())
            .collect();
        for snapshot in snapshots {
            self.core.send_to(peer, &snapshot);
        }
    }

    fn receive(&mut self, peer: PeerAddress, payload: Value) {
        if is_departure(&payload) {
            debug!(%peer, "Ignoring departure frame from a joiner");
            return;
        }

        let tagged = match validator::decode_tagged::<P>(&self.peer_shape, &payload) {
            Ok(tagged) => tagged,
            Err(e) => {
                self.core.fail(&e);
                return;
            }
        };

        if tagged.identity == self.identity {
            trace!(%peer, "Ignoring frame carrying our own identity");
            return;
        }

        self.peers
            .upsert_exclusive(tagged.identity, peer.clone(), tagged.state);
        self.core.clear_error();
        self.core.notify(SessionChange::Peers);

        if self.relay {
            let relayed = self.core.relay(&peer, &payload);
            trace!(%peer, relayed, "Relayed peer state");
        }
    }

    fn forget(&mut self, peer: &PeerAddress) {
        let removed = self.peers.remove_by_address(peer);
        if !removed.is_empty() {
            debug!(%peer, removed = removed.len(), "Peer left");
            self.core.notify(SessionChange::Peers);
        }
        if self.relay {
            for entry in &removed {
                let relayed = self
                    .core
                    .relay(peer, &departure_payload(&entry.identity));
                trace!(identity = %entry.identity, relayed, "Relayed departure");
            }
        }
        self.core.notify_connections();
    }
}

impl<H, P> Session for HostMultiSession<H, P>
where
    H: Serialize + Clone,
    P: Serialize + DeserializeOwned + Clone,
{
    fn controller(&mut self) -> &mut ConnectionController {
        &mut self.core.controller
    }

    fn dispatch(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Endpoint(EndpointEvent::Open(id)) => {
                if id != self.identity {
                    info!(requested = %self.identity, effective = %id, "Host bound under a different identity");
                    if let Err(e) = self.identities.persist(Role::Host, &id) {
                        self.core.fail(&e);
                    }
                    self.identity = id.clone();
                }
                self.core.notify(SessionChange::Identity(id));
            }
            TransportEvent::Endpoint(EndpointEvent::Connection(conn)) => {
                debug!(peer = %conn.peer(), "Peer connecting");
                self.core.notify_connections();
            }
            TransportEvent::Endpoint(EndpointEvent::Error(message)) => {
                self.core.fail(&Error::Transport(message));
            }
            TransportEvent::Endpoint(EndpointEvent::Close) => {
                self.peers.clear();
                self.core.notify(SessionChange::Peers);
                self.core.notify_connections();
            }
            TransportEvent::Endpoint(EndpointEvent::Disconnected) => {
                debug!("Host lost the broker, existing peers stay connected");
            }
            TransportEvent::Connection { peer, event, .. } => match event {
                ConnectionEvent::Open => self.greet(&peer),
                ConnectionEvent::Data(payload) => self.receive(peer, payload),
                ConnectionEvent::Close | ConnectionEvent::Disconnected => self.forget(&peer),
                ConnectionEvent::Error(message) => self.core.fail(&Error::Transport(message)),
            },
        }
    }
}
