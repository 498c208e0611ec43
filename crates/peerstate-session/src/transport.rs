//! The narrow transport seam the engine depends on.
//!
//! A [`Transport`] hands out endpoints; an [`Endpoint`] dials connections;
//! a [`Connection`] sends payloads. Everything the transport observes
//! (open, inbound connections, data, close, errors) is pushed through the
//! [`EventSink`] it was given at endpoint creation. Each sink is stamped with
//! the generation of the acquisition that created it, which lets the
//! controller discard events from endpoints it has already torn down.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::error::Result;
use crate::identity::Identity;

/// Transport-level address of a remote endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerAddress(String);

impl PeerAddress {
    pub fn new(addr: impl Into<String>) -> Self {
        Self(addr.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerAddress {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<&Identity> for PeerAddress {
    fn from(id: &Identity) -> Self {
        Self(id.as_str().to_string())
    }
}

/// Identifies one link. Two connections from the same address (a redial)
/// carry different ids, so events of a replaced link can be told apart from
/// those of its successor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

impl ConnectionId {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// A process-wide unique id.
    pub fn fresh() -> Self {
        Self(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// One channel to exactly one remote endpoint.
pub trait Connection: Send + Sync + fmt::Debug {
    /// Link id, stamped on every [`ConnectionEvent`] this link produces.
    fn id(&self) -> ConnectionId;

    /// Address of the remote endpoint.
    fn peer(&self) -> &PeerAddress;

    /// Whether the channel is ready to carry data.
    fn is_open(&self) -> bool;

    /// Send a payload. Fails if the channel is not open.
    fn send(&self, payload: &Value) -> Result<()>;

    /// Close the channel from this side.
    fn close(&self);
}

/// Shared handle to a connection.
pub type ConnectionRef = Arc<dyn Connection>;

/// A local transport endpoint, bound to an identity or anonymous.
pub trait Endpoint: Send {
    /// Dial `target`. The returned connection reports `Open` through the
    /// endpoint's sink once it is ready.
    fn connect(&mut self, target: &Identity) -> Result<ConnectionRef>;

    /// Release the endpoint and every connection it owns.
    fn destroy(&mut self);
}

/// Factory for endpoints.
pub trait Transport: Send + Sync {
    /// Request a new endpoint. `requested` is the identity to bind to, or
    /// `None` for an anonymous endpoint. The effective identity is reported
    /// later through [`EndpointEvent::Open`].
    fn create_endpoint(
        &self,
        requested: Option<&Identity>,
        sink: EventSink,
    ) -> Result<Box<dyn Endpoint>>;
}

/// Lifecycle events of an endpoint.
#[derive(Debug, Clone)]
pub enum EndpointEvent {
    /// The endpoint is ready under the given effective identity.
    Open(Identity),
    /// A remote endpoint opened a connection to us.
    Connection(ConnectionRef),
    /// Non-fatal transport failure.
    Error(String),
    /// The endpoint is gone; every connection is dropped.
    Close,
    /// Lost contact with the brokering service.
    Disconnected,
}

/// Events of a single connection.
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    Open,
    Data(Value),
    Close,
    Error(String),
    Disconnected,
}

/// Anything a transport reports.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    Endpoint(EndpointEvent),
    Connection {
        peer: PeerAddress,
        link: ConnectionId,
        event: ConnectionEvent,
    },
}

/// A transport event stamped with the acquisition generation that produced it.
#[derive(Debug)]
pub struct Envelope {
    pub generation: u64,
    pub event: TransportEvent,
}

/// Sending half handed to a transport for one endpoint acquisition.
#[derive(Debug, Clone)]
pub struct EventSink {
    generation: u64,
    tx: mpsc::UnboundedSender<Envelope>,
}

impl EventSink {
    pub(crate) fn new(generation: u64, tx: mpsc::UnboundedSender<Envelope>) -> Self {
        Self { generation, tx }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Deliver an event. Returns false once the owning controller is gone.
    pub fn emit(&self, event: TransportEvent) -> bool {
        self.tx
            .send(Envelope {
                generation: self.generation,
                event,
            })
            .is_ok()
    }

    pub fn endpoint(&self, event: EndpointEvent) -> bool {
        self.emit(TransportEvent::Endpoint(event))
    }

    pub fn connection(
        &self,
        peer: PeerAddress,
        link: ConnectionId,
        event: ConnectionEvent,
    ) -> bool {
        self.emit(TransportEvent::Connection { peer, link, event })
    }
}
