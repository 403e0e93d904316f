//! cg-protocol: Wire protocol for clustergate tunnels
//!
//! Every tunnel (agent -> manager, or replica -> replica) carries a sequence
//! of frames. Each frame names the logical stream it belongs to, so many
//! proxied HTTP connections share one upgraded TCP connection.

pub mod codec;
pub mod error;
pub mod message;
pub mod stream;

pub use codec::{Frame, FrameCodec, HEADER_SIZE, MAX_PAYLOAD_SIZE};
pub use error::ProtocolError;
pub use message::{ErrorCode, Message, MessageType, StreamScope, PROTOCOL_VERSION};
pub use stream::StreamId;
