//! Session configuration.

use std::sync::Arc;

use serde::Serialize;

use crate::error::{Error, Result};
use crate::identity::{IdentityManager, IdentityStore, DEFAULT_IDENTITY_LENGTH};
use crate::validator::Shape;

/// Configuration shared by every session kind.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Length of generated identities.
    pub identity_length: usize,

    /// Shortest target identity a joiner will dial.
    /// Defaults to `identity_length`.
    pub min_identity_length: Option<usize>,

    /// Prefix for identity storage keys, so several sessions can share one
    /// store without colliding.
    pub namespace: Option<String>,

    /// Whether a multi-peer host forwards each peer's state to the other
    /// peers.
    pub relay_peer_states: bool,

    /// Required properties of remote (partner or peer) state.
    /// When unset, sessions whose remote state has the same type as the local
    /// state derive it from the initial local state. A multi-peer host has no
    /// such sample and refuses to start without it.
    pub peer_shape: Option<Shape>,

    /// Required properties of the host state a multi-peer joiner receives.
    /// A multi-peer joiner refuses to start without it.
    pub host_shape: Option<Shape>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            identity_length: DEFAULT_IDENTITY_LENGTH,
            min_identity_length: None,
            namespace: None,
            relay_peer_states: true,
            peer_shape: None,
            host_shape: None,
        }
    }
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn parse_usize(name: &str, raw: &str) -> Result<usize> {
    raw.trim()
        .parse()
        .map_err(|_| Error::InvalidConfig(format!("{} must be a non-negative integer, got {:?}", name, raw)))
}

fn parse_bool(name: &str, raw: &str) -> Result<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(Error::InvalidConfig(format!("{} must be a boolean, got {:?}", name, raw))),
    }
}

impl SessionConfig {
    /// Read overrides from `PEERSTATE_IDENTITY_LENGTH`,
    /// `PEERSTATE_MIN_IDENTITY_LENGTH`, `PEERSTATE_NAMESPACE` and
    /// `PEERSTATE_RELAY`, falling back to defaults.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Some(raw) = env_var("PEERSTATE_IDENTITY_LENGTH") {
            config.identity_length = parse_usize("PEERSTATE_IDENTITY_LENGTH", &raw)?;
        }
        if let Some(raw) = env_var("PEERSTATE_MIN_IDENTITY_LENGTH") {
            config.min_identity_length =
                Some(parse_usize("PEERSTATE_MIN_IDENTITY_LENGTH", &raw)?);
        }
        config.namespace = env_var("PEERSTATE_NAMESPACE");
        if let Some(raw) = env_var("PEERSTATE_RELAY") {
            config.relay_peer_states = parse_bool("PEERSTATE_RELAY", &raw)?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject configurations no session can run with.
    pub fn validate(&self) -> Result<()> {
        if self.identity_length == 0 {
            return Err(Error::InvalidConfig(
                "identity length must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    #[must_use]
    pub fn with_identity_length(mut self, length: usize) -> Self {
        self.identity_length = length;
        self
    }

    #[must_use]
    pub fn with_min_identity_length(mut self, length: usize) -> Self {
        self.min_identity_length = Some(length);
        self
    }

    #[must_use]
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    /// Do not forward peer states between joiners.
    #[must_use]
    pub fn without_relay(mut self) -> Self {
        self.relay_peer_states = false;
        self
    }

    #[must_use]
    pub fn with_peer_shape(mut self, shape: Shape) -> Self {
        self.peer_shape = Some(shape);
        self
    }

    #[must_use]
    pub fn with_host_shape(mut self, shape: Shape) -> Self {
        self.host_shape = Some(shape);
        self
    }

    /// Like [`with_peer_shape`](Self::with_peer_shape), with the shape taken
    /// from a sample value. Optional fields count as required, so the sample
    /// should serialize them (as `null` if unset).
    pub fn with_peer_sample<T: Serialize>(self, sample: &T) -> Result<Self> {
        Ok(self.with_peer_shape(Shape::from_sample(sample)?))
    }

    pub fn with_host_sample<T: Serialize>(self, sample: &T) -> Result<Self> {
        Ok(self.with_host_shape(Shape::from_sample(sample)?))
    }

    /// The peer shape, or `InvalidConfig` naming the session that needs it.
    pub(crate) fn require_peer_shape(&self, session: &str) -> Result<Shape> {
        self.peer_shape.clone().ok_or_else(|| {
            Error::InvalidConfig(format!("{} needs a peer shape", session))
        })
    }

    pub(crate) fn require_host_shape(&self, session: &str) -> Result<Shape> {
        self.host_shape.clone().ok_or_else(|| {
            Error::InvalidConfig(format!("{} needs a host shape", session))
        })
    }

    /// Effective minimum length for dial targets.
    pub fn min_target_length(&self) -> usize {
        self.min_identity_length.unwrap_or(self.identity_length)
    }

    /// Identity manager over `store` honoring length and namespace.
    pub fn identity_manager(&self, store: Arc<dyn IdentityStore>) -> IdentityManager {
        let manager = IdentityManager::new(store, self.identity_length);
        match &self.namespace {
            Some(ns) => manager.with_namespace(ns.clone()),
            None => manager,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = SessionConfig::default();
        assert_eq!(config.identity_length, DEFAULT_IDENTITY_LENGTH);
        assert_eq!(config.min_target_length(), DEFAULT_IDENTITY_LENGTH);
        assert!(config.relay_peer_states);
        assert!(config.peer_shape.is_none());
        assert!(config.host_shape.is_none());
    }

    #[test]
    fn missing_shapes_are_config_errors() {
        let config = SessionConfig::default();
        assert!(matches!(
            config.require_peer_shape("multi-peer host"),
            Err(Error::InvalidConfig(_))
        ));
        assert!(matches!(
            config.require_host_shape("multi-peer joiner"),
            Err(Error::InvalidConfig(_))
        ));
    }

    #[test]
    fn sample_shape_keeps_optional_fields() {
        #[derive(Serialize)]
        struct Nick {
            name: String,
            nick: Option<String>,
        }
        let config = SessionConfig::default()
            .with_peer_sample(&Nick {
                name: String::new(),
                nick: None,
            })
            .unwrap();
        let shape = config.require_peer_shape("test").unwrap();
        assert_eq!(shape.required().collect::<Vec<_>>(), vec!["name", "nick"]);
    }

    #[test]
    fn builder_overrides() {
        let config = SessionConfig::default()
            .with_identity_length(6)
            .with_min_identity_length(4)
            .with_namespace("tab-1")
            .without_relay()
            .with_peer_shape(Shape::new(["x"]));

        assert_eq!(config.min_target_length(), 4);
        assert!(!config.relay_peer_states);
        assert_eq!(config.namespace.as_deref(), Some("tab-1"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn min_length_follows_identity_length() {
        let config = SessionConfig::default().with_identity_length(4);
        assert_eq!(config.min_target_length(), 4);
    }

    #[test]
    fn zero_length_is_rejected() {
        let config = SessionConfig::default().with_identity_length(0);
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn parse_helpers() {
        assert_eq!(parse_usize("X", " 12 ").unwrap(), 12);
        assert!(parse_usize("X", "twelve").is_err());
        assert!(parse_bool("X", "On").unwrap());
        assert!(!parse_bool("X", "0").unwrap());
        assert!(parse_bool("X", "maybe").is_err());
    }
}
