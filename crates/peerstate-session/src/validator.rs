//! Structural checks gating untrusted inbound payloads.
//!
//! The transport delivers untyped JSON. Before a payload is trusted as a
//! caller type it must expose every property the caller declared in its
//! [`Shape`]. Only presence is checked, never value types; the subsequent
//! serde decode is the only place a value's type matters, and a decode
//! failure is reported the same way as a missing property.

use std::collections::BTreeSet;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use crate::error::{Error, Result};
use crate::state::{Tagged, TAG_KEY};

/// The set of top-level property names a payload must carry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Shape {
    required: BTreeSet<String>,
}

impl Shape {
    /// A shape requiring exactly `keys`.
    pub fn new<I, S>(keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            required: keys.into_iter().map(Into::into).collect(),
        }
    }

    /// A shape requiring nothing beyond being an object.
    pub fn any() -> Self {
        Self::default()
    }

    /// Derive the shape from the top-level keys of a serialized sample.
    pub fn from_sample<T: Serialize>(sample: &T) -> Result<Self> {
        let keys = match serde_json::to_value(sample)? {
            Value::Object(map) => map.into_iter().map(|(k, _)| k).collect(),
            _ => BTreeSet::new(),
        };
        Ok(Self { required: keys })
    }

    /// Required property names.
    pub fn required(&self) -> impl Iterator<Item = &str> {
        self.required.iter().map(String::as_str)
    }

    /// True iff `candidate` is an object carrying every required property.
    pub fn is_well_formed(&self, candidate: &Value) -> bool {
        match candidate.as_object() {
            Some(map) => self.required.iter().all(|key| map.contains_key(key)),
            None => false,
        }
    }

    /// Like [`is_well_formed`](Self::is_well_formed), but additionally
    /// requires the identity tag to be present as a string.
    pub fn is_well_formed_tagged(&self, candidate: &Value) -> bool {
        tag_of(candidate).is_some() && self.is_well_formed(candidate)
    }
}

/// Read the identity tag of a payload without decoding the rest.
pub fn tag_of(candidate: &Value) -> Option<&str> {
    candidate.get(TAG_KEY)?.as_str()
}

/// Check `payload` against `shape` and decode it as a plain `T`.
pub fn decode<T: DeserializeOwned>(shape: &Shape, payload: &Value) -> Result<T> {
    if !shape.is_well_formed(payload) {
        return Err(Error::IncorrectType);
    }
    serde_json::from_value(payload.clone()).map_err(|e| {
        debug!(error = %e, "Payload passed shape check but failed to decode");
        Error::IncorrectType
    })
}

/// Check `payload` against `shape` plus the identity tag and decode it.
pub fn decode_tagged<T: DeserializeOwned>(shape: &Shape, payload: &Value) -> Result<Tagged<T>> {
    if !shape.is_well_formed_tagged(payload) {
        return Err(Error::IncorrectType);
    }
    serde_json::from_value(payload.clone()).map_err(|e| {
        debug!(error = %e, "Tagged payload passed shape check but failed to decode");
        Error::IncorrectType
    })
}
