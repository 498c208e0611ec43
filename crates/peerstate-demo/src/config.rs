//! Demo settings read from the environment.

use std::path::PathBuf;

use anyhow::{Context, Result};

/// How many joiners to run, for how many rounds, and where the host keeps
/// its identity.
#[derive(Debug, Clone)]
pub struct DemoConfig {
    pub joiners: usize,
    pub rounds: u32,
    /// JSON file for the host identity. In-memory when unset.
    pub identity_file: Option<PathBuf>,
}

impl Default for DemoConfig {
    fn default() -> Self {
        Self {
            joiners: 3,
            rounds: 3,
            identity_file: None,
        }
    }
}

impl DemoConfig {
    /// Defaults overridden by `PEERSTATE_JOINERS`, `PEERSTATE_ROUNDS` and
    /// `PEERSTATE_IDENTITY_FILE`.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        if let Ok(raw) = std::env::var("PEERSTATE_JOINERS") {
            config.joiners = raw
                .trim()
                .parse()
                .with_context(|| format!("PEERSTATE_JOINERS must be an integer, got {:?}", raw))?;
        }
        if let Ok(raw) = std::env::var("PEERSTATE_ROUNDS") {
            config.rounds = raw
                .trim()
                .parse()
                .with_context(|| format!("PEERSTATE_ROUNDS must be an integer, got {:?}", raw))?;
        }
        if let Ok(path) = std::env::var("PEERSTATE_IDENTITY_FILE") {
            if !path.trim().is_empty() {
                config.identity_file = Some(PathBuf::from(path));
            }
        }
        Ok(config)
    }
}
