//! Error types for peerstate sessions.

use thiserror::Error;

use crate::identity::Identity;
use crate::transport::PeerAddress;

/// Result type for peerstate operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while running a session.
#[derive(Debug, Error)]
pub enum Error {
    /// The target identity is shorter than the configured minimum.
    /// No connection is attempted.
    #[error("identity {identity:?} is too short to attempt connection (minimum length {min})")]
    IdentityTooShort { identity: String, min: usize },

    /// The transport reported a failure (dial failure, endpoint error).
    #[error("{0}")]
    Transport(String),

    /// An inbound payload failed the shape check or could not be decoded.
    #[error("Received data of incorrect type")]
    IncorrectType,

    /// A tracked connection was not ready when a broadcast reached it.
    #[error(
        "Connection lost to peer {peer} - previous identity {} when trying to send state",
        previous.as_ref().map(Identity::as_str).unwrap_or("unknown")
    )]
    ConnectionLost {
        peer: PeerAddress,
        previous: Option<Identity>,
    },

    /// The controller is in an invalid phase for the requested operation.
    #[error("invalid controller phase: expected {expected}, got {actual}")]
    InvalidState {
        expected: &'static str,
        actual: String,
    },

    /// Configuration could not be parsed or is unusable.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Identity persistence failed.
    #[error("storage error: {0}")]
    Storage(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// The single observable error slot surfaced by every session.
///
/// Each new error overwrites the previous one; nothing accumulates.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ErrorSlot {
    message: Option<String>,
}

impl ErrorSlot {
    /// Create an empty slot.
    pub const fn new() -> Self {
        Self { message: None }
    }

    /// Record an error, replacing whatever was there.
    pub fn set(&mut self, error: &Error) {
        self.message = Some(error.to_string());
    }

    /// Clear the slot. Returns true if a message was removed.
    pub fn clear(&mut self) -> bool {
        self.message.take().is_some()
    }

    /// The current message, if any.
    pub fn get(&self) -> Option<&str> {
        self.message.as_deref()
    }

    /// Check if an error is currently recorded.
    pub fn is_set(&self) -> bool {
        self.message.is_some()
    }
}
