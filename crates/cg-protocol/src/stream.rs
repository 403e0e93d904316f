//! Stream identifier type

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of one logical stream inside a tunnel session.
///
/// The side that accepted the tunnel allocates odd ids, the side that dialed
/// it allocates even ids, so both ends can open streams without colliding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StreamId(pub u32);

impl StreamId {
    /// Create a new stream ID
    pub fn new(id: u32) -> Self {
        Self(id)
    }

    /// Get the raw ID value
    pub fn as_u32(&self) -> u32 {
        self.0
    }

    /// Whether this id was allocated by the accepting (server) side
    pub fn is_server_initiated(&self) -> bool {
        self.0 % 2 == 1
    }

    /// Stream used for session-level messages (heartbeats, advertisements)
    pub const CONTROL: StreamId = StreamId(0);

    /// Whether this is the control stream
    pub fn is_control(&self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stream-{}", self.0)
    }
}

impl From<u32> for StreamId {
    fn from(id: u32) -> Self {
        Self(id)
    }
}
