//! Message types for the clustergate tunnel protocol
//!
//! Messages are serialized into frames by the codec in `codec.rs`.
//!
//! # Message Flow
//!
//! 1. The agent (or a sibling replica) upgrades an HTTP connection; from then
//!    on both ends exchange frames.
//! 2. Either end opens a stream with `Connect`, naming the address the remote
//!    end should dial. A replica forwarding on behalf of a peer also names the
//!    `client_key` whose session should carry the stream.
//! 3. The remote end answers `Connected`, with `error` set if the dial failed.
//! 4. Bytes flow as `Data` in both directions until one side sends `Close`.
//!    A sender may have at most the stream window of unacknowledged `Data`
//!    in flight; the receiver returns credit with `WindowUpdate` as it
//!    consumes bytes.
//! 5. `Heartbeat`/`HeartbeatAck` travel on the control stream.
//! 6. On replica-to-replica links the accepting replica announces the keys
//!    of its local sessions with `AddClient`/`RemoveClient`.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::stream::StreamId;

/// Current protocol version string, sent as the `Upgrade` token suffix.
pub const PROTOCOL_VERSION: &str = "1.0";

/// Message type identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    /// Open a stream to an address on the remote end
    Connect = 0x01,
    /// Result of a `Connect`
    Connected = 0x02,
    /// Stream payload
    Data = 0x03,
    /// Send credit returned by the receiver of a stream
    WindowUpdate = 0x04,
    /// Stream closed
    Close = 0x05,
    /// Heartbeat ping
    Heartbeat = 0x06,
    /// Heartbeat acknowledgment
    HeartbeatAck = 0x07,
    /// A session key became reachable through the sender
    AddClient = 0x08,
    /// A session key is no longer reachable through the sender
    RemoveClient = 0x09,
    /// Error response
    Error = 0xFF,
}

impl MessageType {
    /// Convert to u8
    pub fn as_u8(&self) -> u8 {
        *self as u8
    }

    /// Convert from u8
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(Self::Connect),
            0x02 => Some(Self::Connected),
            0x03 => Some(Self::Data),
            0x04 => Some(Self::WindowUpdate),
            0x05 => Some(Self::Close),
            0x06 => Some(Self::Heartbeat),
            0x07 => Some(Self::HeartbeatAck),
            0x08 => Some(Self::AddClient),
            0x09 => Some(Self::RemoveClient),
            0xFF => Some(Self::Error),
            _ => None,
        }
    }

    /// Which streams may carry this message type
    pub fn scope(&self) -> StreamScope {
        match self {
            Self::Connect | Self::Connected | Self::Data | Self::WindowUpdate | Self::Close => {
                StreamScope::Stream
            }
            Self::Heartbeat | Self::HeartbeatAck | Self::AddClient | Self::RemoveClient => {
                StreamScope::Control
            }
            Self::Error => StreamScope::Any,
        }
    }
}

/// Where a message type is valid
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamScope {
    /// Only on the control stream (id 0)
    Control,
    /// Only on a data stream
    Stream,
    /// Either
    Any,
}

impl StreamScope {
    /// Whether a frame on `stream` may use this scope
    pub fn admits(&self, stream: StreamId) -> bool {
        match self {
            Self::Control => stream.is_control(),
            Self::Stream => !stream.is_control(),
            Self::Any => true,
        }
    }
}

/// Error codes for error messages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u16)]
pub enum ErrorCode {
    /// Unknown error
    Unknown = 0,
    /// Frame referenced a stream the receiver does not know
    StreamNotFound = 1,
    /// Dial to the requested address failed
    DialFailed = 2,
    /// Message was not valid in the current state
    InvalidMessage = 3,
}

/// Protocol messages
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Message {
    /// Ask the remote end to open a stream to `address`
    Connect {
        /// `host:port` the remote end should dial
        address: String,
        /// Route through the remote end's local session with this key
        /// instead of dialing directly (replica forwarding)
        #[serde(default)]
        client_key: Option<String>,
    },

    /// Outcome of a `Connect`
    Connected {
        /// Dial error, `None` on success
        error: Option<String>,
    },

    /// Stream payload
    Data(Bytes),

    /// Grant the sender of a stream `increment` more bytes of `Data`
    WindowUpdate {
        /// Bytes consumed since the last update
        increment: u32,
    },

    /// Close a stream
    Close {
        /// Reason, for logging only
        reason: Option<String>,
    },

    /// Heartbeat ping
    Heartbeat {
        /// Timestamp for latency measurement
        timestamp: u64,
    },

    /// Heartbeat acknowledgment
    HeartbeatAck {
        /// Echo of the original timestamp
        timestamp: u64,
    },

    /// Session key now served by the sender
    AddClient {
        /// Session key
        key: String,
    },

    /// Session key no longer served by the sender
    RemoveClient {
        /// Session key
        key: String,
    },

    /// Error response
    Error {
        /// Error code
        code: ErrorCode,
        /// Human-readable message
        message: String,
    },
}

impl Message {
    /// Get the message type for this message
    pub fn message_type(&self) -> MessageType {
        match self {
            Message::Connect { .. } => MessageType::Connect,
            Message::Connected { .. } => MessageType::Connected,
            Message::Data(_) => MessageType::Data,
            Message::WindowUpdate { .. } => MessageType::WindowUpdate,
            Message::Close { .. } => MessageType::Close,
            Message::Heartbeat { .. } => MessageType::Heartbeat,
            Message::HeartbeatAck { .. } => MessageType::HeartbeatAck,
            Message::AddClient { .. } => MessageType::AddClient,
            Message::RemoveClient { .. } => MessageType::RemoveClient,
            Message::Error { .. } => MessageType::Error,
        }
    }

    /// Convenience constructor for a stream close without reason
    pub fn close() -> Self {
        Message::Close { reason: None }
    }
}
