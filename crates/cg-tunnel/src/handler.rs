//! Policies for streams opened by the remote end of a session

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

use crate::table::SessionTable;

/// Byte stream a session pipes an accepted tunnel stream into
pub trait AsyncIo: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncIo for T {}

/// Boxed [`AsyncIo`]
pub type BoxedIo = Box<dyn AsyncIo>;

/// A `Connect` received from the remote end
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectRequest {
    /// Address the remote end wants reached
    pub address: String,
    /// Local session to forward through, set by sibling replicas
    pub client_key: Option<String>,
}

/// Reacts to what the remote end of a session asks for
#[async_trait]
pub trait SessionHandler: Send + Sync + 'static {
    /// Produce the IO an inbound stream is piped to, or a reason for refusing
    async fn on_connect(&self, request: ConnectRequest) -> Result<BoxedIo, String>;

    /// The remote end now serves `key`
    fn on_add_client(&self, _key: String) {}

    /// The remote end no longer serves `key`
    fn on_remove_client(&self, _key: String) {}
}

/// Refuses every inbound stream. Used for agent sessions, where only the
/// manager dials.
#[derive(Debug, Default, Clone, Copy)]
pub struct RejectConnect;

#[async_trait]
impl SessionHandler for RejectConnect {
    async fn on_connect(&self, request: ConnectRequest) -> Result<BoxedIo, String> {
        Err(format!("connect to {} not permitted on this session", request.address))
    }
}

/// Accepts streams from a sibling replica and forwards each through the
/// local session named by its client key. Never forwards to another peer.
pub struct PeerForward {
    table: Arc<SessionTable>,
    dial_timeout: Duration,
}

impl PeerForward {
    /// Forward into `table`'s local sessions
    pub fn new(table: Arc<SessionTable>, dial_timeout: Duration) -> Self {
        Self { table, dial_timeout }
    }
}

#[async_trait]
impl SessionHandler for PeerForward {
    async fn on_connect(&self, request: ConnectRequest) -> Result<BoxedIo, String> {
        let key = request
            .client_key
            .ok_or_else(|| "peer connect without client key".to_string())?;
        let stream = self
            .table
            .dial_local(&key, &request.address, self.dial_timeout)
            .await
            .map_err(|e| e.to_string())?;
        Ok(Box::new(stream))
    }
}

/// Handler of an outbound link to a sibling replica: records the keys the
/// sibling advertises and refuses inbound streams.
pub struct PeerRouteUpdater {
    table: Arc<SessionTable>,
    peer_id: String,
}

impl PeerRouteUpdater {
    /// Record advertisements of `peer_id` in `table`
    pub fn new(table: Arc<SessionTable>, peer_id: impl Into<String>) -> Self {
        Self {
            table,
            peer_id: peer_id.into(),
        }
    }
}

#[async_trait]
impl SessionHandler for PeerRouteUpdater {
    async fn on_connect(&self, request: ConnectRequest) -> Result<BoxedIo, String> {
        Err(format!("peer {} may not open streams to {}", self.peer_id, request.address))
    }

    fn on_add_client(&self, key: String) {
        self.table.peer_add_key(&self.peer_id, key);
    }

    fn on_remove_client(&self, key: String) {
        self.table.peer_remove_key(&self.peer_id, &key);
    }
}

/// Agent-side handler: dials the requested address over TCP
#[derive(Debug, Clone)]
pub struct DirectConnect {
    timeout: Duration,
}

impl DirectConnect {
    /// Dial with a per-connect timeout
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl SessionHandler for DirectConnect {
    async fn on_connect(&self, request: ConnectRequest) -> Result<BoxedIo, String> {
        let stream = tokio::time::timeout(self.timeout, TcpStream::connect(&request.address))
            .await
            .map_err(|_| format!("connect to {} timed out", request.address))?
            .map_err(|e| format!("connect to {} failed: {}", request.address, e))?;
        let _ = stream.set_nodelay(true);
        Ok(Box::new(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_reject_connect() {
        let result = RejectConnect
            .on_connect(ConnectRequest {
                address: "10.0.0.5:6443".into(),
                client_key: None,
            })
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_peer_forward_requires_client_key() {
        let forward = PeerForward::new(Arc::new(SessionTable::new()), Duration::from_secs(1));
        let err = forward
            .on_connect(ConnectRequest {
                address: "10.0.0.5:6443".into(),
                client_key: None,
            })
            .await
            .err()
            .unwrap();
        assert!(err.contains("client key"));
    }

    #[tokio::test]
    async fn test_peer_forward_unknown_key() {
        let forward = PeerForward::new(Arc::new(SessionTable::new()), Duration::from_secs(1));
        let err = forward
            .on_connect(ConnectRequest {
                address: "10.0.0.5:6443".into(),
                client_key: Some("c-9".into()),
            })
            .await
            .err()
            .unwrap();
        assert!(err.contains("c-9"));
    }

    #[tokio::test]
    async fn test_direct_connect_refused() {
        // bind then drop to get a port nothing listens on
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let result = DirectConnect::new(Duration::from_secs(2))
            .on_connect(ConnectRequest {
                address: addr.to_string(),
                client_key: None,
            })
            .await;
        assert!(result.is_err());
    }
}
