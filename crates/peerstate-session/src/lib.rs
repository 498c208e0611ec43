//! Peerstate - peer-to-peer session lifecycle and state synchronization.
//!
//! Two or more participants keep a shared state in sync over direct
//! connections. One participant **hosts** under a stable, persisted identity;
//! the others **join** by dialing that identity.
//!
//! # Overview
//!
//! - **Identity**: [`IdentityManager`] produces short random identities and
//!   persists them per [`Role`] through an injected [`IdentityStore`].
//! - **Connection lifecycle**: [`ConnectionController`] owns the transport
//!   endpoint and its live connections, rebinding on identity change and
//!   discarding events from endpoints it has replaced.
//! - **Validation**: [`Shape`] gates every inbound payload on property
//!   presence before it is decoded as caller state.
//! - **Synchronization**: [`HostSession`] / [`JoinSession`] for a single
//!   partner, [`HostMultiSession`] / [`JoinMultiSession`] for a star backed by
//!   a [`PeerRegistry`].
//!
//! The transport is consumed through the narrow [`Transport`] seam.
//! [`MemoryNetwork`] is an in-process implementation with its own brokering
//! service.
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use peerstate_session::{
//!     driver, HostMultiSession, JoinMultiSession, MemoryNetwork, MemoryStore, Session,
//!     SessionConfig,
//! };
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Debug, Clone, Serialize, Deserialize)]
//! struct Board { round: u32 }
//!
//! #[derive(Debug, Clone, Serialize, Deserialize)]
//! struct Player { score: u32 }
//!
//! let network = Arc::new(MemoryNetwork::new());
//! let config = SessionConfig::default()
//!     .with_peer_sample(&Player { score: 0 })?
//!     .with_host_sample(&Board { round: 0 })?;
//!
//! let mut host: HostMultiSession<Board, Player> = HostMultiSession::new(
//!     network.clone(),
//!     Arc::new(MemoryStore::new()),
//!     Board { round: 1 },
//!     config.clone(),
//! )?;
//! host.poll();
//!
//! let mut player: JoinMultiSession<Board, Player> = JoinMultiSession::new(
//!     network,
//!     Arc::new(MemoryStore::new()),
//!     host.own_identity().clone(),
//!     Player { score: 0 },
//!     config,
//! )?;
//!
//! driver::settle(&mut [&mut host, &mut player]);
//! player.set_local_state(Player { score: 7 });
//! driver::settle(&mut [&mut host, &mut player]);
//!
//! assert_eq!(host.peers()[0].data.score, 7);
//! assert_eq!(player.host_state().map(|b| b.round), Some(1));
//! # Ok::<(), peerstate_session::Error>(())
//! ```

pub mod config;
pub mod controller;
pub mod driver;
pub mod error;
pub mod identity;
pub mod memory;
pub mod registry;
pub mod session;
pub mod state;
pub mod transport;
pub mod validator;

pub use config::SessionConfig;
pub use controller::{ConnectionController, Phase};
pub use error::{Error, ErrorSlot, Result};
pub use identity::{
    check_target, generate_identity, Identity, IdentityManager, IdentityStore, JsonFileStore,
    MemoryStore, Role, DEFAULT_IDENTITY_LENGTH,
};
pub use memory::{MemoryConnection, MemoryEndpoint, MemoryNetwork};
pub use registry::{PeerEntry, PeerRegistry};
pub use session::{
    Broadcast, HostMultiSession, HostSession, JoinMultiSession, JoinSession, Session,
    SessionChange,
};
pub use state::{is_departure, PeerState, Tagged, DEPARTED_KEY, TAG_KEY};
pub use transport::{
    Connection, ConnectionEvent, ConnectionId, ConnectionRef, Endpoint, EndpointEvent, EventSink,
    PeerAddress, Transport, TransportEvent,
};
pub use validator::Shape;
