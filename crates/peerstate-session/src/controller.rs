//! Connection Controller - owns the local endpoint and its live connections.
//!
//! # Phases
//!
//! ```text
//! Idle -> Acquiring -> Bound -> { Connected <-> PartiallyConnected } -> Destroyed
//! ```
//!
//! `Connected` and `PartiallyConnected` are derived from the connection set:
//! every tracked connection open vs. at least one still opening.
//!
//! Every acquisition bumps a generation counter. The transport's sink is
//! stamped with it, so once an endpoint is replaced or destroyed none of its
//! in-flight events reach session state.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use crate::error::{Error, Result};
use crate::identity::Identity;
use crate::transport::{
    ConnectionEvent, ConnectionRef, Endpoint, EndpointEvent, Envelope, EventSink, PeerAddress,
    Transport, TransportEvent,
};

/// Lifecycle phase of the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// No endpoint.
    Idle,
    /// Endpoint requested, waiting for the transport to open it.
    Acquiring,
    /// Endpoint open, no connections.
    Bound,
    /// Endpoint open, every tracked connection open.
    Connected,
    /// Endpoint open, some tracked connection not open yet.
    PartiallyConnected,
    /// Released for good; only [`ConnectionController::restart`] leaves this.
    Destroyed,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "Idle"),
            Self::Acquiring => write!(f, "Acquiring"),
            Self::Bound => write!(f, "Bound"),
            Self::Connected => write!(f, "Connected"),
            Self::PartiallyConnected => write!(f, "PartiallyConnected"),
            Self::Destroyed => write!(f, "Destroyed"),
        }
    }
}

#[derive(Debug, Clone)]
enum Binding {
    Idle,
    Acquiring { requested: Option<Identity> },
    Bound(Identity),
    Destroyed,
}

/// Owns the transport endpoint and the set of live connections.
pub struct ConnectionController {
    transport: Arc<dyn Transport>,
    endpoint: Option<Box<dyn Endpoint>>,
    binding: Binding,
    generation: u64,
    connections: Vec<ConnectionRef>,
    tx: mpsc::UnboundedSender<Envelope>,
    rx: mpsc::UnboundedReceiver<Envelope>,
}

impl std::fmt::Debug for ConnectionController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionController")
            .field("binding", &self.binding)
            .field("generation", &self.generation)
            .field("connections", &self.connections.len())
            .finish_non_exhaustive()
    }
}

impl ConnectionController {
    /// Create an idle controller over `transport`.
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            transport,
            endpoint: None,
            binding: Binding::Idle,
            generation: 0,
            connections: Vec::new(),
            tx,
            rx,
        }
    }

    /// Current phase.
    pub fn phase(&self) -> Phase {
        match &self.binding {
            Binding::Idle => Phase::Idle,
            Binding::Acquiring { .. } => Phase::Acquiring,
            Binding::Destroyed => Phase::Destroyed,
            Binding::Bound(_) if self.connections.is_empty() => Phase::Bound,
            Binding::Bound(_) if self.connections.iter().all(|c| c.is_open()) => Phase::Connected,
            Binding::Bound(_) => Phase::PartiallyConnected,
        }
    }

    /// Generation of the current (or most recent) acquisition.
    pub const fn generation(&self) -> u64 {
        self.generation
    }

    /// Effective identity of the bound endpoint.
    pub fn identity(&self) -> Option<&Identity> {
        match &self.binding {
            Binding::Bound(id) => Some(id),
            _ => None,
        }
    }

    /// Identity requested by the pending acquisition.
    pub fn requested(&self) -> Option<&Identity> {
        match &self.binding {
            Binding::Acquiring { requested } => requested.as_ref(),
            _ => None,
        }
    }

    /// Whether the endpoint is open.
    pub fn is_bound(&self) -> bool {
        matches!(self.binding, Binding::Bound(_))
    }

    /// Request a new endpoint, destroying the previous one and all of its
    /// connections first.
    pub fn acquire(&mut self, requested: Option<Identity>) -> Result<()> {
        if matches!(self.binding, Binding::Destroyed) {
            return Err(Error::InvalidState {
                expected: "Idle or Bound",
                actual: Phase::Destroyed.to_string(),
            });
        }

        self.release();
        self.generation += 1;
        debug!(
            generation = self.generation,
            requested = ?requested,
            "Acquiring endpoint"
        );

        let sink = EventSink::new(self.generation, self.tx.clone());
        match self.transport.create_endpoint(requested.as_ref(), sink) {
            Ok(endpoint) => {
                self.endpoint = Some(endpoint);
                self.binding = Binding::Acquiring { requested };
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "Endpoint creation failed");
                self.binding = Binding::Idle;
                Err(e)
            }
        }
    }

    /// Dial `target` from the bound endpoint and track the connection.
    pub fn connect(&mut self, target: &Identity) -> Result<ConnectionRef> {
        let phase = self.phase();
        let endpoint = match (&self.binding, self.endpoint.as_mut()) {
            (Binding::Bound(_), Some(endpoint)) => endpoint,
            _ => {
                return Err(Error::InvalidState {
                    expected: "Bound",
                    actual: phase.to_string(),
                })
            }
        };

        let conn = endpoint.connect(target)?;
        debug!(%target, peer = %conn.peer(), "Dialed peer");
        self.track(conn.clone());
        Ok(conn)
    }

    /// Tracked connections, in the order they were established.
    pub fn connections(&self) -> &[ConnectionRef] {
        &self.connections
    }

    pub fn connection(&self, peer: &PeerAddress) -> Option<&ConnectionRef> {
        self.connections.iter().find(|c| c.peer() == peer)
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Close and stop tracking the connection to `peer`.
    pub fn disconnect(&mut self, peer: &PeerAddress) -> Option<ConnectionRef> {
        let conn = self.untrack(peer)?;
        conn.close();
        Some(conn)
    }

    /// Release the endpoint and all connections. Terminal until
    /// [`restart`](Self::restart).
    pub fn destroy(&mut self) {
        self.release();
        self.generation += 1;
        self.binding = Binding::Destroyed;
        info!("Connection controller destroyed");
    }

    /// Drop the endpoint and connections without becoming terminal.
    /// Events already queued by the old endpoint are discarded.
    pub fn reset(&mut self) {
        self.release();
        self.generation += 1;
    }

    /// Return a destroyed controller to `Idle`.
    pub fn restart(&mut self) {
        if matches!(self.binding, Binding::Destroyed) {
            self.binding = Binding::Idle;
        }
    }

    /// Next pending event, without waiting. Stale events are skipped.
    pub fn try_next_event(&mut self) -> Option<TransportEvent> {
        while let Ok(envelope) = self.rx.try_recv() {
            if let Some(event) = self.accept(envelope) {
                return Some(event);
            }
        }
        None
    }

    /// Wait for the next event. Stale events are skipped.
    pub async fn next_event(&mut self) -> Option<TransportEvent> {
        loop {
            let envelope = self.rx.recv().await?;
            if let Some(event) = self.accept(envelope) {
                return Some(event);
            }
        }
    }

    fn release(&mut self) {
        if let Some(mut endpoint) = self.endpoint.take() {
            endpoint.destroy();
        }
        self.connections.clear();
        if !matches!(self.binding, Binding::Destroyed) {
            self.binding = Binding::Idle;
        }
    }

    fn track(&mut self, conn: ConnectionRef) {
        match self.connections.iter_mut().find(|c| c.peer() == conn.peer()) {
            Some(existing) => {
                if existing.id() != conn.id() {
                    debug!(peer = %conn.peer(), "Replacing connection from same address");
                    existing.close();
                    *existing = conn;
                }
            }
            None => self.connections.push(conn),
        }
    }

    fn untrack(&mut self, peer: &PeerAddress) -> Option<ConnectionRef> {
        let pos = self.connections.iter().position(|c| c.peer() == peer)?;
        Some(self.connections.remove(pos))
    }

    /// Apply controller bookkeeping and decide whether the event reaches the
    /// session.
    fn accept(&mut self, envelope: Envelope) -> Option<TransportEvent> {
        if envelope.generation != self.generation {
            trace!(
                generation = envelope.generation,
                current = self.generation,
                "Dropping event from stale endpoint"
            );
            return None;
        }

        match &envelope.event {
            TransportEvent::Endpoint(EndpointEvent::Open(id)) => {
                info!(identity = %id, generation = self.generation, "Endpoint open");
                self.binding = Binding::Bound(id.clone());
            }
            TransportEvent::Endpoint(EndpointEvent::Connection(conn)) => {
                debug!(peer = %conn.peer(), "Inbound connection");
                self.track(conn.clone());
            }
            TransportEvent::Endpoint(EndpointEvent::Close) => {
                warn!(
                    dropped = self.connections.len(),
                    "Endpoint closed, dropping all connections"
                );
                self.release();
            }
            TransportEvent::Endpoint(EndpointEvent::Error(e)) => {
                warn!(error = %e, "Endpoint error");
            }
            TransportEvent::Endpoint(EndpointEvent::Disconnected) => {
                debug!("Endpoint disconnected from broker");
            }
            TransportEvent::Connection { peer, link, event } => {
                let tracked = self.connection(peer).is_some_and(|c| c.id() == *link);
                if !tracked {
                    trace!(%peer, %link, "Dropping event for untracked connection");
                    return None;
                }
                if matches!(event, ConnectionEvent::Close | ConnectionEvent::Disconnected) {
                    debug!(%peer, "Connection closed");
                    self.untrack(peer);
                }
            }
        }

        Some(envelope.event)
    }
}

impl Drop for ConnectionController {
    fn drop(&mut self) {
        if let Some(mut endpoint) = self.endpoint.take() {
            endpoint.destroy();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryNetwork;

    fn drain(controller: &mut ConnectionController) -> Vec<TransportEvent> {
        std::iter::from_fn(|| controller.try_next_event()).collect()
    }

    #[test]
    fn acquire_then_open_binds() {
        let network = MemoryNetwork::new();
        let mut controller = ConnectionController::new(Arc::new(network));
        assert_eq!(controller.phase(), Phase::Idle);

        controller.acquire(Some(Identity::from("hostident"))).unwrap();
        assert_eq!(controller.phase(), Phase::Acquiring);
        assert_eq!(controller.requested().map(Identity::as_str), Some("hostident"));

        let events = drain(&mut controller);
        assert!(matches!(
            events.as_slice(),
            [TransportEvent::Endpoint(EndpointEvent::Open(_))]
        ));
        assert_eq!(controller.phase(), Phase::Bound);
        assert_eq!(controller.identity().map(Identity::as_str), Some("hostident"));
    }

    #[test]
    fn rebind_discards_stale_events() {
        let network = MemoryNetwork::new();
        let mut controller = ConnectionController::new(Arc::new(network));

        controller.acquire(Some(Identity::from("first-id"))).unwrap();
        // Open for "first-id" is queued but never processed before the rebind.
        controller.acquire(Some(Identity::from("second-id"))).unwrap();
        assert_eq!(controller.generation(), 2);

        let events = drain(&mut controller);
        assert_eq!(events.len(), 1);
        assert_eq!(controller.identity().map(Identity::as_str), Some("second-id"));
    }

    #[test]
    fn connect_requires_bound_endpoint() {
        let network = MemoryNetwork::new();
        let mut controller = ConnectionController::new(Arc::new(network));
        let err = controller.connect(&Identity::from("anyone")).unwrap_err();
        assert!(matches!(err, Error::InvalidState { expected: "Bound", .. }));
    }

    #[test]
    fn endpoint_close_returns_to_idle() {
        let network = MemoryNetwork::new();
        let mut host = ConnectionController::new(Arc::new(network.clone()));
        let mut joiner = ConnectionController::new(Arc::new(network.clone()));

        host.acquire(Some(Identity::from("the-host"))).unwrap();
        joiner.acquire(None).unwrap();
        drain(&mut host);
        drain(&mut joiner);

        joiner.connect(&Identity::from("the-host")).unwrap();
        drain(&mut host);
        drain(&mut joiner);
        assert_eq!(host.phase(), Phase::Connected);
        assert_eq!(joiner.phase(), Phase::Connected);

        network.close_endpoint(&Identity::from("the-host"));
        drain(&mut host);
        assert_eq!(host.phase(), Phase::Idle);
        assert_eq!(host.connection_count(), 0);

        drain(&mut joiner);
        assert_eq!(joiner.connection_count(), 0);
        assert_eq!(joiner.phase(), Phase::Bound);
    }

    #[test]
    fn redial_from_same_address_keeps_live_link() {
        let network = MemoryNetwork::new();
        let mut host = ConnectionController::new(Arc::new(network.clone()));
        let mut joiner = ConnectionController::new(Arc::new(network.clone()));

        host.acquire(Some(Identity::from("the-host"))).unwrap();
        joiner.acquire(None).unwrap();
        drain(&mut host);
        drain(&mut joiner);

        let first = joiner.connect(&Identity::from("the-host")).unwrap();
        let second = joiner.connect(&Identity::from("the-host")).unwrap();
        assert_ne!(first.id(), second.id());
        assert!(!first.is_open());

        let host_events = drain(&mut host);
        let joiner_events = drain(&mut joiner);
        // Close of the replaced link never reaches the session.
        let closes = host_events
            .iter()
            .chain(&joiner_events)
            .filter(|e| {
                matches!(
                    e,
                    TransportEvent::Connection {
                        event: ConnectionEvent::Close,
                        ..
                    }
                )
            })
            .count();
        assert_eq!(closes, 0);

        assert!(second.is_open());
        assert_eq!(joiner.connection_count(), 1);
        assert_eq!(host.connection_count(), 1);
        assert_eq!(joiner.phase(), Phase::Connected);
        assert_eq!(host.phase(), Phase::Connected);
        assert_eq!(host.connections()[0].id(), second.id());
    }

    #[test]
    fn destroy_is_terminal_until_restart() {
        let network = MemoryNetwork::new();
        let mut controller = ConnectionController::new(Arc::new(network));
        controller.acquire(None).unwrap();
        controller.destroy();

        assert_eq!(controller.phase(), Phase::Destroyed);
        assert!(drain(&mut controller).is_empty());
        assert!(controller.acquire(None).is_err());

        controller.restart();
        assert_eq!(controller.phase(), Phase::Idle);
        controller.acquire(None).unwrap();
        assert_eq!(drain(&mut controller).len(), 1);
    }
}
