//! Participant identities and their persistence.
//!
//! A participant keeps the same [`Identity`] across reloads by storing it in an
//! injected [`IdentityStore`] under a key derived from its [`Role`]. Hosts use
//! their identity as the transport address; joiners use theirs only as the
//! tag on transmitted state.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Error, Result};

/// Default length of generated identities.
///
/// 36 symbols over 10 characters gives ~3.6e15 identities, which keeps
/// accidental collisions between concurrent sessions negligible.
pub const DEFAULT_IDENTITY_LENGTH: usize = 10;

const ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

/// A short persisted string identifying a participant across reconnects.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Identity(String);

impl Identity {
    /// Wrap an existing identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a fresh random identity of the given length.
    pub fn generate(len: usize) -> Self {
        Self(generate_identity(len))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.chars().count()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl std::fmt::Display for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Identity {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for Identity {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Generate a random lowercase alphanumeric identifier.
pub fn generate_identity(len: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
        .collect()
}

/// Reject a dial target shorter than `min` before any transport work happens.
pub fn check_target(target: &Identity, min: usize) -> Result<()> {
    if target.len() < min {
        return Err(Error::IdentityTooShort {
            identity: target.to_string(),
            min,
        });
    }
    Ok(())
}

/// Which side of a session an identity belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// Stable, discoverable participant others dial.
    Host,
    /// Participant that dials a known host.
    Joiner,
}

impl Role {
    /// Fixed storage key for this role.
    pub const fn storage_key(self) -> &'static str {
        match self {
            Self::Host => "identity.host",
            Self::Joiner => "identity.join",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Host => write!(f, "Host"),
            Self::Joiner => write!(f, "Joiner"),
        }
    }
}

/// Key-value persistence used to remember identities across reloads.
pub trait IdentityStore: Send + Sync {
    /// Read a stored value.
    fn get(&self, key: &str) -> Result<Option<String>>;

    /// Store a value, replacing any previous one.
    fn set(&self, key: &str, value: &str) -> Result<()>;

    /// Remove a value. Removing a missing key is not an error.
    fn remove(&self, key: &str) -> Result<()>;
}

fn lock_err<T>(_: std::sync::PoisonError<T>) -> Error {
    Error::Storage("identity store lock poisoned".to_string())
}

/// In-process identity store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    values: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl IdentityStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.values.lock().map_err(lock_err)?.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        self.values
            .lock()
            .map_err(lock_err)?
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.values.lock().map_err(lock_err)?.remove(key);
        Ok(())
    }
}

/// Identity store backed by a single JSON object file.
///
/// The file is created on first write. Every operation re-reads the file so
/// several stores pointed at the same path observe each other's writes.
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    guard: Mutex<()>,
}

impl JsonFileStore {
    /// Open (or lazily create) the store at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            guard: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> Result<BTreeMap<String, String>> {
        match std::fs::read(&self.path) {
            Ok(bytes) if bytes.is_empty() => Ok(BTreeMap::new()),
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(e) => Err(e.into()),
        }
    }

    fn save(&self, values: &BTreeMap<String, String>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        std::fs::write(&self.path, serde_json::to_vec_pretty(values)?)?;
        Ok(())
    }
}

impl IdentityStore for JsonFileStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let _guard = self.guard.lock().map_err(lock_err)?;
        Ok(self.load()?.remove(key))
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        let _guard = self.guard.lock().map_err(lock_err)?;
        let mut values = self.load()?;
        values.insert(key.to_string(), value.to_string());
        self.save(&values)
    }

    fn remove(&self, key: &str) -> Result<()> {
        let _guard = self.guard.lock().map_err(lock_err)?;
        let mut values = self.load()?;
        if values.remove(key).is_some() {
            self.save(&values)?;
        }
        Ok(())
    }
}

/// Produces, persists and rotates participant identities.
#[derive(Clone)]
pub struct IdentityManager {
    store: Arc<dyn IdentityStore>,
    namespace: Option<String>,
    length: usize,
}

impl std::fmt::Debug for IdentityManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityManager")
            .field("namespace", &self.namespace)
            .field("length", &self.length)
            .finish_non_exhaustive()
    }
}

impl IdentityManager {
    /// Create a manager over `store` generating identities of `length` chars.
    pub fn new(store: Arc<dyn IdentityStore>, length: usize) -> Self {
        Self {
            store,
            namespace: None,
            length,
        }
    }

    /// Prefix every storage key with `namespace`.
    #[must_use]
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        let namespace = namespace.into();
        self.namespace = (!namespace.is_empty()).then_some(namespace);
        self
    }

    /// Storage key used for `role`.
    pub fn key(&self, role: Role) -> String {
        match &self.namespace {
            Some(ns) => format!("{}.{}", ns, role.storage_key()),
            None => role.storage_key().to_string(),
        }
    }

    /// Return the persisted identity for `role`, generating and persisting
    /// one first if none exists.
    pub fn acquire(&self, role: Role) -> Result<Identity> {
        let key = self.key(role);
        if let Some(existing) = self.store.get(&key)? {
            if !existing.is_empty() {
                debug!(%role, identity = %existing, "Reusing persisted identity");
                return Ok(Identity(existing));
            }
        }
        let identity = Identity::generate(self.length);
        self.store.set(&key, identity.as_str())?;
        info!(%role, %identity, "Generated new identity");
        Ok(identity)
    }

    /// Discard the persisted identity for `role` and persist a new one.
    pub fn regenerate(&self, role: Role) -> Result<Identity> {
        let key = self.key(role);
        self.store.remove(&key)?;
        let identity = Identity::generate(self.length);
        self.store.set(&key, identity.as_str())?;
        info!(%role, %identity, "Rotated identity");
        Ok(identity)
    }

    /// Persist an identity chosen elsewhere (e.g. the effective identity the
    /// transport assigned).
    pub fn persist(&self, role: Role, identity: &Identity) -> Result<()> {
        self.store.set(&self.key(role), identity.as_str())
    }

    pub fn length(&self) -> usize {
        self.length
    }
}
