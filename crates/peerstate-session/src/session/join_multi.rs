//! Multi-peer joiner session: a leaf of the star.

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, trace, warn};

use super::{Broadcast, Session, SessionChange, SessionCore};
use crate::config::SessionConfig;
use crate::controller::ConnectionController;
use crate::error::{Error, Result};
use crate::identity::{check_target, Identity, IdentityStore, Role};
use crate::registry::{PeerEntry, PeerRegistry};
use crate::state::{is_departure, tagged_payload, PeerState};
use crate::transport::{ConnectionEvent, EndpointEvent, PeerAddress, Transport, TransportEvent};
use crate::validator::{self, tag_of, Shape};

/// Joins a multi-peer host.
///
/// Frames tagged with the dialed host identity become the host state; frames
/// tagged with any other identity are sibling joiners' states relayed by the
/// host and land in the peer registry; the host's departure frames remove
/// them again. The joiner's own identity is persisted under the joiner role
/// so it survives reloads.
///
/// Like [`JoinSession`](super::JoinSession), a target identity shorter than
/// [`SessionConfig::min_target_length`] is refused locally. The guard is on
/// by default (the minimum is the configured identity length); lower it with
/// [`SessionConfig::with_min_identity_length`].
pub struct JoinMultiSession<H, P> {
    core: SessionCore,
    identity: Identity,
    target: Identity,
    min_target_length: usize,
    local: P,
    host_state: Option<H>,
    peers: PeerRegistry<P>,
    peer_shape: Shape,
    host_shape: Shape,
}

impl<H, P> JoinMultiSession<H, P>
where
    H: DeserializeOwned + Clone,
    P: Serialize + DeserializeOwned + Clone,
{
    /// `config` must carry a host shape. Sibling frames are checked against
    /// the peer shape, derived from `initial` unless configured.
    pub fn new(
        transport: Arc<dyn Transport>,
        store: Arc<dyn IdentityStore>,
        target: Identity,
        initial: P,
        config: SessionConfig,
    ) -> Result<Self> {
        config.validate()?;
        let host_shape = config.require_host_shape("multi-peer joiner")?;
        let peer_shape = match config.peer_shape.clone() {
            Some(shape) => shape,
            None => Shape::from_sample(&initial)?,
        };
        let identity = config.identity_manager(store).acquire(Role::Joiner)?;

        let mut session = Self {
            core: SessionCore::new(ConnectionController::new(transport)),
            identity,
            target,
            min_target_length: config.min_target_length(),
            local: initial,
            host_state: None,
            peers: PeerRegistry::new(),
            peer_shape,
            host_shape,
        };
        session.start();
        Ok(session)
    }

    fn start(&mut self) {
        if let Err(e) = check_target(&self.target, self.min_target_length) {
            warn!(target = %self.target, "Target identity too short, not connecting");
            self.core.fail(&e);
            return;
        }
        if let Err(e) = self.core.controller.acquire(None) {
            self.core.fail(&e);
        }
    }

    /// Point the session at a different host. The current endpoint, host
    /// state and peer entries are dropped first.
    pub fn set_target(&mut self, target: Identity) {
        debug!(from = %self.target, to = %target, "Retargeting multi-peer join session");
        self.target = target;
        self.core.controller.reset();
        self.host_state = None;
        self.peers.clear();
        self.core.notify(SessionChange::Peers);
        self.core.notify_connections();
        self.start();
    }

    pub fn target(&self) -> &Identity {
        &self.target
    }

    /// Sibling joiners' last-known states, oldest update first.
    pub fn peers(&self) -> Vec<PeerState<P>> {
        self.peers.views()
    }

    pub fn peer_entries(&self) -> &[PeerEntry<P>] {
        self.peers.entries()
    }

    /// The host's last-known state.
    pub fn host_state(&self) -> Option<&H> {
        self.host_state.as_ref()
    }

    pub fn local_state(&self) -> &P {
        &self.local
    }

    /// Replace the local state and broadcast it.
    pub fn set_local_state(&mut self, state: P) -> Broadcast {
        self.local = state;
        self.core.notify(SessionChange::LocalState);
        self.broadcast()
    }

    /// Persisted identity this joiner tags its state with.
    pub fn own_identity(&self) -> &Identity {
        &self.identity
    }

    pub fn connection_count(&self) -> usize {
        self.core.controller.connection_count()
    }

    pub fn error(&self) -> Option<&str> {
        self.core.errors.get()
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
        let target = &self.target;
        self.core.broadcast(&payload, |addr| {
            if addr.as_str() == target.as_str() {
                Some(target.clone())
            } else {
                peers.identity_for_address(addr).cloned()
            }
        })
    }

    fn dial(&mut self) {
        let target = self.target.clone();
        match self.core.controller.connect(&target) {
            Ok(conn) => {
                debug!(peer = %conn.peer(), "Dialing host");
                self.core.notify_connections();
            }
            Err(e) => self.core.fail(&e),
        }
    }

    fn greet(&mut self, peer: &PeerAddress) {
        match tagged_payload(&self.identity, &self.local) {
            Ok(payload) => {
                if self.core.send_to(peer, &payload) {
                    self.core.clear_error();
                }
            }
            Err(e) => self.core.fail(&e),
        }
    }

    fn receive(&mut self, peer: PeerAddress, payload: Value) {
        if is_departure(&payload) {
            if let Some(tag) = tag_of(&payload) {
                let identity = Identity::from(tag);
                if self.peers.remove(&identity).is_some() {
                    debug!(%identity, "Sibling left");
                    self.core.notify(SessionChange::Peers);
                }
            }
            return;
        }

        let from_host = tag_of(&payload) == Some(self.target.as_str());

        if from_host {
            match validator::decode_tagged::<H>(&self.host_shape, &payload) {
                Ok(tagged) => {
                    self.host_state = Some(tagged.into_state());
                    self.core.clear_error();
                    self.core.notify(SessionChange::HostState);
                }
                Err(e) => self.core.fail(&e),
            }
            return;
        }

        match validator::decode_tagged::<P>(&self.peer_shape, &payload) {
            Ok(tagged) if tagged.identity == self.identity => {
                trace!("Ignoring our own state echoed back");
            }
            Ok(tagged) => {
                self.peers.upsert(tagged.identity, peer, tagged.state);
                self.core.clear_error();
                self.core.notify(SessionChange::Peers);
            }
            Err(e) => self.core.fail(&e),
        }
    }

    fn forget(&mut self, peer: &PeerAddress) {
        let removed = self.peers.remove_by_address(peer);
        if !removed.is_empty() {
            self.core.notify(SessionChange::Peers);
        }
        self.core.clear_error();
        self.core.notify_connections();
    }
}

impl<H, P> Session for JoinMultiSession<H, P>
where
    H: DeserializeOwned + Clone,
    P: Serialize + DeserializeOwned + Clone,
{
    fn controller(&mut self) -> &mut ConnectionController {
        &mut self.core.controller
    }

    fn dispatch(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Endpoint(EndpointEvent::Open(id)) => {
                debug!(endpoint = %id, identity = %self.identity, "Joiner endpoint open");
                self.dial();
            }
            TransportEvent::Endpoint(EndpointEvent::Connection(conn)) => {
                // Joiners only talk through the host.
                debug!(peer = %conn.peer(), "Refusing direct connection");
                let peer = conn.peer().clone();
                self.core.controller.disconnect(&peer);
            }
            TransportEvent::Endpoint(EndpointEvent::Error(message)) => {
                self.core.fail(&Error::Transport(message));
            }
            TransportEvent::Endpoint(EndpointEvent::Close) => {
                if !self.peers.is_empty() {
                    self.peers.clear();
                    self.core.notify(SessionChange::Peers);
                }
                self.core.notify_connections();
            }
            TransportEvent::Endpoint(EndpointEvent::Disconnected) => {
                debug!("Joiner lost the broker");
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
