//! Registry of remote peers and their last-known state.

use tracing::trace;

use crate::identity::Identity;
use crate::state::PeerState;
use crate::transport::PeerAddress;

/// One remote participant in a multi-peer session.
#[derive(Debug, Clone, PartialEq)]
pub struct PeerEntry<T> {
    /// Identity the peer declared in its frames.
    pub identity: Identity,
    /// Last validated state, replaced wholesale on every frame.
    pub last_state: T,
    /// Address of the connection the state arrived on.
    pub address: PeerAddress,
}

/// Ordered-by-update mapping from declared identity to last-known state.
///
/// Invariant: at most one entry per identity. The most recently updated
/// entry is last.
#[derive(Debug, Clone)]
pub struct PeerRegistry<T> {
    entries: Vec<PeerEntry<T>>,
}

impl<T> Default for PeerRegistry<T> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
        }
    }
}

impl<T> PeerRegistry<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the entry for `identity`, moving it to the back.
    ///
    /// Several identities may share an address: a joiner receives every
    /// sibling's state over its single connection to the host.
    pub fn upsert(&mut self, identity: Identity, address: PeerAddress, state: T) {
        self.entries.retain(|e| e.identity != identity);
        trace!(%identity, %address, "Upserting peer entry");
        self.entries.push(PeerEntry {
            identity,
            last_state: state,
            address,
        });
    }

    /// Like [`upsert`](Self::upsert), but the address is owned by exactly one
    /// identity: any other entry recorded for it is dropped, so a peer that
    /// changes its declared identity on a live connection leaves no ghost.
    pub fn upsert_exclusive(&mut self, identity: Identity, address: PeerAddress, state: T) {
        self.entries.retain(|e| e.address != address);
        self.upsert(identity, address, state);
    }

    /// Remove every entry that arrived over `address`.
    pub fn remove_by_address(&mut self, address: &PeerAddress) -> Vec<PeerEntry<T>> {
        let (removed, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut self.entries)
            .into_iter()
            .partition(|e| &e.address == address);
        self.entries = kept;
        removed
    }

    /// Remove the entry for `identity`.
    pub fn remove(&mut self, identity: &Identity) -> Option<PeerEntry<T>> {
        let pos = self.entries.iter().position(|e| &e.identity == identity)?;
        Some(self.entries.remove(pos))
    }

    /// Best-known declared identity for a connection address.
    pub fn identity_for_address(&self, address: &PeerAddress) -> Option<&Identity> {
        self.entries
            .iter()
            .find(|e| &e.address == address)
            .map(|e| &e.identity)
    }

    pub fn get(&self, identity: &Identity) -> Option<&PeerEntry<T>> {
        self.entries.iter().find(|e| &e.identity == identity)
    }

    pub fn entries(&self) -> &[PeerEntry<T>] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

impl<T: Clone> PeerRegistry<T> {
    /// Caller-facing views: identity and state only.
    pub fn views(&self) -> Vec<PeerState<T>> {
        self.entries
            .iter()
            .map(|e| PeerState {
                id: e.identity.clone(),
                data: e.last_state.clone(),
            })
            .collect()
    }
}
