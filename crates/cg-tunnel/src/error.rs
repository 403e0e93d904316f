//! Tunnel error types

use cg_protocol::ProtocolError;
use thiserror::Error;

/// Errors raised by tunnel sessions, the session table and the client
#[derive(Error, Debug)]
pub enum TunnelError {
    /// No live session, local or through a peer, for the key
    #[error("no tunnel session for key {0}")]
    NoSession(String),

    /// The session closed before or during the operation
    #[error("tunnel session closed")]
    SessionClosed,

    /// The remote end could not reach the requested address
    #[error("dial {address} through tunnel failed: {reason}")]
    DialFailed { address: String, reason: String },

    /// Every stream id of this side's parity has been used
    #[error("tunnel session ran out of stream ids")]
    StreamIdsExhausted,

    /// The remote end did not answer the connect in time
    #[error("dial {0} through tunnel timed out")]
    DialTimeout(String),

    /// The registration endpoint did not switch protocols
    #[error("tunnel registration refused ({status}): {body}")]
    Refused { status: u16, body: String },

    /// Frame codec failure
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// HTTP failure while registering
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
