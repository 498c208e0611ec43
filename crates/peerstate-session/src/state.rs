//! State values as they travel between participants.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::Result;
use crate::identity::Identity;

/// Reserved wire key carrying the owner's identity on every multi-peer frame.
pub const TAG_KEY: &str = "__internalIdentity";

/// Reserved wire key marking a frame that announces the tagged participant
/// has left the star.
pub const DEPARTED_KEY: &str = "__internalDeparted";

/// A caller state tagged with the identity of the participant that owns it.
///
/// `T` must serialize as a JSON object; the tag is flattened next to its
/// fields on the wire and never handed back to callers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tagged<T> {
    #[serde(rename = "__internalIdentity")]
    pub identity: Identity,
    #[serde(flatten)]
    pub state: T,
}

impl<T> Tagged<T> {
    pub fn new(identity: Identity, state: T) -> Self {
        Self { identity, state }
    }

    /// Drop the tag.
    pub fn into_state(self) -> T {
        self.state
    }
}

impl<T: Serialize> Tagged<T> {
    /// Encode as the wire payload.
    pub fn to_payload(&self) -> Result<Value> {
        Ok(serde_json::to_value(self)?)
    }
}

/// Encode a tagged payload from borrowed parts.
pub(crate) fn tagged_payload<T: Serialize>(identity: &Identity, state: &T) -> Result<Value> {
    #[derive(Serialize)]
    struct Borrowed<'a, T> {
        #[serde(rename = "__internalIdentity")]
        identity: &'a Identity,
        #[serde(flatten)]
        state: &'a T,
    }
    Ok(serde_json::to_value(Borrowed { identity, state })?)
}

/// Frame telling joiners that `identity` is gone.
pub(crate) fn departure_payload(identity: &Identity) -> Value {
    json!({ TAG_KEY: identity.as_str(), DEPARTED_KEY: true })
}

/// Whether `payload` is a departure frame rather than a state.
pub fn is_departure(payload: &Value) -> bool {
    payload
        .get(DEPARTED_KEY)
        .and_then(Value::as_bool)
        .unwrap_or(false)
}

/// A remote participant's last-known state, as exposed to callers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerState<T> {
    /// The peer's declared identity.
    pub id: Identity,
    /// The peer's state with the identity tag stripped.
    pub data: T,
}
