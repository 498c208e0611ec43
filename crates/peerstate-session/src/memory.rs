//! In-process transport with a brokering service.
//!
//! [`MemoryNetwork`] plays the role of the connection broker: endpoints
//! register under an identity, dial each other by identity, and exchange
//! payloads through linked half-connections. Delivery goes through each
//! endpoint's [`EventSink`], so it is asynchronous from the sender's point of
//! view exactly like a real network transport.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use serde_json::Value;
use tracing::{debug, trace, warn};

use crate::error::{Error, Result};
use crate::identity::{Identity, DEFAULT_IDENTITY_LENGTH};
use crate::transport::{
    Connection, ConnectionEvent, ConnectionId, ConnectionRef, Endpoint, EndpointEvent, EventSink,
    PeerAddress, Transport,
};

/// One half of an in-memory link.
#[derive(Debug)]
pub struct MemoryConnection {
    link: ConnectionId,
    local: PeerAddress,
    peer: PeerAddress,
    open: Arc<AtomicBool>,
    local_sink: EventSink,
    remote_sink: EventSink,
}

impl MemoryConnection {
    /// Close without notifying the local side (the local endpoint is going away).
    fn sever(&self) {
        if self.open.swap(false, Ordering::SeqCst) {
            self.remote_sink
                .connection(self.local.clone(), self.link, ConnectionEvent::Close);
        }
    }
}

impl Connection for MemoryConnection {
    fn id(&self) -> ConnectionId {
        self.link
    }

    fn peer(&self) -> &PeerAddress {
        &self.peer
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn send(&self, payload: &Value) -> Result<()> {
        if !self.is_open() {
            return Err(Error::Transport(format!(
                "connection to {} is not open",
                self.peer
            )));
        }
        trace!(from = %self.local, to = %self.peer, "Delivering payload");
        self.remote_sink.connection(
            self.local.clone(),
            self.link,
            ConnectionEvent::Data(payload.clone()),
        );
        Ok(())
    }

    fn close(&self) {
        if self.open.swap(false, Ordering::SeqCst) {
            debug!(local = %self.local, peer = %self.peer, "Closing link");
            self.local_sink
                .connection(self.peer.clone(), self.link, ConnectionEvent::Close);
            self.remote_sink
                .connection(self.local.clone(), self.link, ConnectionEvent::Close);
        }
    }
}

struct Registration {
    token: u64,
    sink: EventSink,
    links: Vec<Arc<MemoryConnection>>,
}

#[derive(Default)]
struct Broker {
    endpoints: HashMap<Identity, Registration>,
}

impl Broker {
    fn fresh_identity(&self) -> Identity {
        loop {
            let id = Identity::generate(DEFAULT_IDENTITY_LENGTH);
            if !self.endpoints.contains_key(&id) {
                return id;
            }
        }
    }

    fn prune_closed_links(&mut self) {
        for registration in self.endpoints.values_mut() {
            registration.links.retain(|link| link.is_open());
        }
    }
}

/// Shared in-memory network. Cloning yields another handle to the same broker.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    broker: Arc<Mutex<Broker>>,
    tokens: Arc<AtomicU64>,
}

impl std::fmt::Debug for MemoryNetwork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryNetwork")
            .field("endpoints", &self.endpoint_count())
            .finish()
    }
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Broker>> {
        self.broker
            .lock()
            .map_err(|_| Error::Transport("memory broker lock poisoned".to_string()))
    }

    /// Number of registered endpoints.
    pub fn endpoint_count(&self) -> usize {
        self.lock().map(|b| b.endpoints.len()).unwrap_or(0)
    }

    /// Whether an endpoint is registered under `id`.
    pub fn is_registered(&self, id: &Identity) -> bool {
        self.lock()
            .map(|b| b.endpoints.contains_key(id))
            .unwrap_or(false)
    }

    /// Simulate the transport closing an endpoint: its links are severed and
    /// the endpoint receives `Close`.
    pub fn close_endpoint(&self, id: &Identity) {
        let Ok(mut broker) = self.lock() else { return };
        if let Some(registration) = broker.endpoints.remove(id) {
            warn!(endpoint = %id, "Closing endpoint");
            for link in &registration.links {
                link.sever();
            }
            registration.sink.endpoint(EndpointEvent::Close);
            broker.prune_closed_links();
        }
    }

    /// Simulate losing contact with the broker. Existing links stay up.
    pub fn disconnect(&self, id: &Identity) {
        let Ok(broker) = self.lock() else { return };
        if let Some(registration) = broker.endpoints.get(id) {
            registration.sink.endpoint(EndpointEvent::Disconnected);
        }
    }

    /// Report a transport error on the endpoint registered under `id`.
    pub fn fail(&self, id: &Identity, message: &str) {
        let Ok(broker) = self.lock() else { return };
        if let Some(registration) = broker.endpoints.get(id) {
            registration
                .sink
                .endpoint(EndpointEvent::Error(message.to_string()));
        }
    }
}

impl Transport for MemoryNetwork {
    fn create_endpoint(
        &self,
        requested: Option<&Identity>,
        sink: EventSink,
    ) -> Result<Box<dyn Endpoint>> {
        let mut broker = self.lock()?;
        let id = match requested {
            Some(id) if !broker.endpoints.contains_key(id) => id.clone(),
            Some(id) => {
                let fresh = broker.fresh_identity();
                warn!(requested = %id, assigned = %fresh, "Requested identity is taken");
                fresh
            }
            None => broker.fresh_identity(),
        };

        let token = self.tokens.fetch_add(1, Ordering::SeqCst);
        sink.endpoint(EndpointEvent::Open(id.clone()));
        broker.endpoints.insert(
            id.clone(),
            Registration {
                token,
                sink,
                links: Vec::new(),
            },
        );

        Ok(Box::new(MemoryEndpoint {
            network: self.clone(),
            id,
            token,
        }))
    }
}

/// Endpoint registered with a [`MemoryNetwork`].
pub struct MemoryEndpoint {
    network: MemoryNetwork,
    id: Identity,
    token: u64,
}

impl MemoryEndpoint {
    pub fn id(&self) -> &Identity {
        &self.id
    }
}

impl Endpoint for MemoryEndpoint {
    fn connect(&mut self, target: &Identity) -> Result<ConnectionRef> {
        let mut broker = self.network.lock()?;

        let local_sink = match broker.endpoints.get(&self.id) {
            Some(reg) if reg.token == self.token => reg.sink.clone(),
            _ => {
                return Err(Error::Transport(format!(
                    "endpoint {} is no longer registered",
                    self.id
                )))
            }
        };
        let remote_sink = match broker.endpoints.get(target) {
            Some(reg) => reg.sink.clone(),
            None => {
                return Err(Error::Transport(format!(
                    "Could not connect to peer {}",
                    target
                )))
            }
        };

        let link = ConnectionId::fresh();
        let open = Arc::new(AtomicBool::new(true));
        let local_addr = PeerAddress::from(&self.id);
        let target_addr = PeerAddress::from(target);

        let outbound = Arc::new(MemoryConnection {
            link,
            local: local_addr.clone(),
            peer: target_addr.clone(),
            open: open.clone(),
            local_sink: local_sink.clone(),
            remote_sink: remote_sink.clone(),
        });
        let inbound = Arc::new(MemoryConnection {
            link,
            local: target_addr.clone(),
            peer: local_addr.clone(),
            open,
            local_sink: remote_sink.clone(),
            remote_sink: local_sink.clone(),
        });

        remote_sink.endpoint(EndpointEvent::Connection(inbound.clone()));
        remote_sink.connection(local_addr, link, ConnectionEvent::Open);
        local_sink.connection(target_addr, link, ConnectionEvent::Open);

        if let Some(reg) = broker.endpoints.get_mut(target) {
            reg.links.push(inbound);
        }
        if let Some(reg) = broker.endpoints.get_mut(&self.id) {
            reg.links.push(outbound.clone());
        }

        Ok(outbound)
    }

    fn destroy(&mut self) {
        let Ok(mut broker) = self.network.lock() else { return };
        let owned = matches!(broker.endpoints.get(&self.id), Some(reg) if reg.token == self.token);
        if !owned {
            return;
        }
        if let Some(registration) = broker.endpoints.remove(&self.id) {
            debug!(endpoint = %self.id, links = registration.links.len(), "Destroying endpoint");
            for link in &registration.links {
                link.sever();
            }
            broker.prune_closed_links();
        }
    }
}
