//! cg-tunnel: multiplexed reverse tunnels for clustergate
//!
//! An agent (or a sibling replica) registers by upgrading an HTTP/1.1
//! request on the manager's registration endpoint. Both ends then run a
//! [`Session`] over the upgraded connection and exchange `cg-protocol`
//! frames. The manager indexes sessions by key in a [`SessionTable`] and
//! dials through them to reach addresses only the agent can see.

pub mod client;
pub mod error;
pub mod handler;
pub mod reconnect;
pub mod server;
pub mod session;
pub mod stream;
pub mod table;

pub use client::TunnelClient;
pub use error::TunnelError;
pub use handler::{
    AsyncIo, BoxedIo, ConnectRequest, DirectConnect, PeerForward, PeerRouteUpdater, RejectConnect,
    SessionHandler,
};
pub use reconnect::ExponentialBackoff;
pub use server::{Authorizer, TunnelServer, PEER_ID_HEADER, PEER_TOKEN_HEADER, UPGRADE_PROTOCOL};
pub use session::{Role, Session, SessionConfig};
pub use stream::{TunnelStream, MAX_CHUNK_SIZE, STREAM_WINDOW};
pub use table::SessionTable;
