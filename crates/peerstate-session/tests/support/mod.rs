//! Shared fixtures for session tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use peerstate_session::{
    Connection, ConnectionEvent, ConnectionId, ConnectionRef, Endpoint, EndpointEvent, Error,
    EventSink, Identity, PeerAddress, Result, SessionChange, SessionConfig, Transport,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Board {
    pub round: u32,
    pub title: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Player {
    pub name: String,
    pub score: u32,
}

pub fn board(round: u32) -> Board {
    Board {
        round,
        title: "lobby".to_string(),
    }
}

pub fn player(name: &str, score: u32) -> Player {
    Player {
        name: name.to_string(),
        score,
    }
}

/// Config for star sessions over `Board`/`Player`.
pub fn star_config() -> SessionConfig {
    SessionConfig::default()
        .with_peer_sample(&player("", 0))
        .and_then(|c| c.with_host_sample(&board(0)))
        .unwrap()
}

/// Connection whose readiness the test controls.
#[derive(Debug)]
pub struct MockConnection {
    link: ConnectionId,
    peer: PeerAddress,
    ready: AtomicBool,
    sent: Mutex<Vec<Value>>,
}

impl MockConnection {
    pub fn new(peer: &str) -> Arc<Self> {
        Arc::new(Self {
            link: ConnectionId::fresh(),
            peer: PeerAddress::from(peer),
            ready: AtomicBool::new(true),
            sent: Mutex::new(Vec::new()),
        })
    }

    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<Value> {
        self.sent.lock().unwrap().clone()
    }
}

impl Connection for MockConnection {
    fn id(&self) -> ConnectionId {
        self.link
    }

    fn peer(&self) -> &PeerAddress {
        &self.peer
    }

    fn is_open(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    fn send(&self, payload: &Value) -> Result<()> {
        if !self.is_open() {
            return Err(Error::Transport("not ready".to_string()));
        }
        self.sent.lock().unwrap().push(payload.clone());
        Ok(())
    }

    fn close(&self) {
        self.set_ready(false);
    }
}

/// Transport that hands its sinks to the test so events can be injected.
#[derive(Debug, Clone, Default)]
pub struct MockTransport {
    sinks: Arc<Mutex<Vec<EventSink>>>,
    accepted: Arc<Mutex<Vec<Arc<MockConnection>>>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sink of the most recent endpoint.
    pub fn sink(&self) -> EventSink {
        self.sinks
            .lock()
            .unwrap()
            .last()
            .cloned()
            .expect("no endpoint created")
    }

    pub fn endpoints_created(&self) -> usize {
        self.sinks.lock().unwrap().len()
    }

    pub fn open(&self, id: &str) {
        self.sink().endpoint(EndpointEvent::Open(Identity::from(id)));
    }

    pub fn accept(&self, conn: Arc<MockConnection>) {
        self.accepted.lock().unwrap().push(conn.clone());
        let conn: ConnectionRef = conn;
        self.sink().endpoint(EndpointEvent::Connection(conn));
    }

    /// Link id of the most recently accepted connection from `peer`.
    fn link(&self, peer: &str) -> ConnectionId {
        self.accepted
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|c| c.peer().as_str() == peer)
            .map(|c| c.id())
            .expect("no connection accepted from peer")
    }

    pub fn data(&self, peer: &str, payload: Value) {
        let link = self.link(peer);
        self.sink().connection(
            PeerAddress::from(peer),
            link,
            ConnectionEvent::Data(payload),
        );
    }

    /// Report `Close` for one specific link.
    pub fn close_link(&self, conn: &MockConnection) {
        self.sink()
            .connection(conn.peer().clone(), conn.id(), ConnectionEvent::Close);
    }

    pub fn close(&self, peer: &str) {
        let link = self.link(peer);
        self.sink()
            .connection(PeerAddress::from(peer), link, ConnectionEvent::Close);
    }
}

struct MockEndpoint;

impl Endpoint for MockEndpoint {
    fn connect(&mut self, target: &Identity) -> Result<ConnectionRef> {
        Err(Error::Transport(format!("mock endpoint cannot dial {}", target)))
    }

    fn destroy(&mut self) {}
}

impl Transport for MockTransport {
    fn create_endpoint(
        &self,
        _requested: Option<&Identity>,
        sink: EventSink,
    ) -> Result<Box<dyn Endpoint>> {
        self.sinks.lock().unwrap().push(sink);
        Ok(Box::new(MockEndpoint))
    }
}

/// Collects every change a session reports.
pub fn recorder() -> (
    Arc<Mutex<Vec<SessionChange>>>,
    impl FnMut(&SessionChange) + Send + 'static,
) {
    let changes = Arc::new(Mutex::new(Vec::new()));
    let sink = changes.clone();
    (changes, move |change: &SessionChange| {
        sink.lock().unwrap().push(change.clone())
    })
}
