//! Strong identifier types.

use serde::Deserialize;
use serde::Serialize;

/// Identity of an exported object within one endpoint.
#[derive(Copy, Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ObjectId(pub u64);

impl ObjectId {
    /// Reserved for the bootstrap object of a freshly started worker.
    pub const BOOTSTRAP: ObjectId = ObjectId(0);
}

impl std::fmt::Display for ObjectId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "object-{}", self.0)
    }
}

/// Identity of one successful connection attempt.
///
/// Chosen at random by the accepting side, so it differs across reconnects
/// even between the same two endpoints.
#[derive(Copy, Clone, Debug, Hash, PartialEq, Eq)]
pub struct ConnectionId(pub u64);

impl ConnectionId {
    pub fn random() -> Self {
        Self(rand::random())
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "connection-{:016x}", self.0)
    }
}
