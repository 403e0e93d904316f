//! Replica peer links
//!
//! Every replica keeps an outbound tunnel to each sibling it discovers. A
//! sibling that accepts the link advertises the cluster keys of its agents
//! over it, which is how a request landing here can reach a session held
//! elsewhere.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use http::{HeaderMap, HeaderValue};
use thiserror::Error;
use tokio::sync::{watch, Mutex};
use tokio_util::sync::CancellationToken;

use cg_core::config::BackoffConfig;
use cg_core::traits::{CallbackId, ServiceInstance, HTTP_PORT_KEY};
use cg_core::ServiceDiscovery;
use cg_tunnel::{
    ExponentialBackoff, PeerRouteUpdater, SessionConfig, SessionTable, TunnelClient,
    PEER_ID_HEADER, PEER_TOKEN_HEADER,
};

/// Opens and closes the link to one peer
#[async_trait]
pub trait PeerLinker: Send + Sync + 'static {
    /// Start linking to `peer` (`host:port`)
    async fn open(&self, peer: &str);

    /// Tear down the link to `peer`
    async fn close(&self, peer: &str);
}

/// Instance address that cannot be turned into `host:port`
#[derive(Error, Debug, PartialEq, Eq)]
pub enum AddressError {
    #[error("address {0} has no port")]
    MissingPort(String),

    #[error("address {0} has no host")]
    MissingHost(String),

    #[error("invalid port {port} for {address}")]
    InvalidPort { address: String, port: String },
}

/// HTTP `host:port` of an instance. The `httpport` metadata entry, when
/// present, replaces the dial port.
pub fn resolve_address(instance: &ServiceInstance) -> Result<String, AddressError> {
    let address = instance.address.trim();
    let (host, port) = address
        .rsplit_once(':')
        .ok_or_else(|| AddressError::MissingPort(address.to_string()))?;

    // a bare IPv6 literal splits inside the address itself
    if host.is_empty() || (host.contains(':') && !host.starts_with('[')) {
        return Err(AddressError::MissingHost(address.to_string()));
    }

    let port = instance
        .metadata
        .get(HTTP_PORT_KEY)
        .map(String::as_str)
        .unwrap_or(port)
        .trim();
    let port: u16 = port.parse().map_err(|_| AddressError::InvalidPort {
        address: address.to_string(),
        port: port.to_string(),
    })?;
    Ok(format!("{}:{}", host, port))
}

/// Links opened and closed by one membership change
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PeerDiff {
    pub to_create: Vec<String>,
    pub to_delete: Vec<String>,
}

impl PeerDiff {
    /// Whether the membership is unchanged
    pub fn is_empty(&self) -> bool {
        self.to_create.is_empty() && self.to_delete.is_empty()
    }
}

#[derive(Default)]
struct PeerState {
    peers: HashSet<String>,
    ready: bool,
    callback: Option<CallbackId>,
}

/// Reconciles peer links against discovered membership
pub struct PeerManager {
    self_address: String,
    discovery: Arc<dyn ServiceDiscovery>,
    linker: Arc<dyn PeerLinker>,
    state: Mutex<PeerState>,
    cancel: CancellationToken,
}

impl PeerManager {
    /// Manager for the replica reachable at `self_address`, which is never
    /// linked to itself. Nothing runs until [`PeerManager::start`].
    pub fn new(
        self_address: impl Into<String>,
        discovery: Arc<dyn ServiceDiscovery>,
        linker: Arc<dyn PeerLinker>,
    ) -> Self {
        Self {
            self_address: self_address.into(),
            discovery,
            linker,
            state: Mutex::new(PeerState::default()),
            cancel: CancellationToken::new(),
        }
    }

    /// Address this replica is known by
    pub fn self_address(&self) -> &str {
        &self.self_address
    }

    /// Subscribe to discovery. Snapshots are applied in order by a single
    /// task; a snapshot superseded before it was picked up is skipped.
    pub async fn start(self: &Arc<Self>) {
        let (tx, mut rx) = watch::channel(None::<Vec<ServiceInstance>>);
        let id = self
            .discovery
            .register_callback(Arc::new(move |instances: Vec<ServiceInstance>| {
                tx.send_replace(Some(instances));
            }));
        self.state.lock().await.callback = Some(id);

        let manager = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = manager.cancel.cancelled() => break,
                    changed = rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let snapshot = rx.borrow_and_update().clone();
                        if let Some(instances) = snapshot {
                            manager.on_membership_changed(instances).await;
                        }
                    }
                }
            }
            tracing::debug!("Peer reconciliation stopped");
        });
        tracing::info!(self_address = %self.self_address, callback = %id, "Peer manager started");
    }

    /// Apply one membership snapshot
    pub async fn on_membership_changed(&self, instances: Vec<ServiceInstance>) -> PeerDiff {
        let mut state = self.state.lock().await;
        if self.cancel.is_cancelled() {
            return PeerDiff::default();
        }

        let mut others = HashSet::new();
        for instance in &instances {
            match resolve_address(instance) {
                Ok(address) if address == self.self_address => {
                    if !state.ready {
                        tracing::info!(self_address = %address, "Observed self in discovery, ready");
                    }
                    state.ready = true;
                }
                Ok(address) => {
                    others.insert(address);
                }
                Err(e) => {
                    tracing::warn!(instance = %instance.address, error = %e, "Skipping unresolvable instance");
                }
            }
        }

        let mut diff = PeerDiff {
            to_create: others.difference(&state.peers).cloned().collect(),
            to_delete: state.peers.difference(&others).cloned().collect(),
        };
        diff.to_create.sort();
        diff.to_delete.sort();

        for peer in &diff.to_create {
            tracing::info!(peer = %peer, "Opening peer link");
            self.linker.open(peer).await;
        }
        for peer in &diff.to_delete {
            tracing::info!(peer = %peer, "Closing peer link");
            self.linker.close(peer).await;
        }
        state.peers = others;

        diff
    }

    /// Whether this replica has seen itself in discovery
    pub async fn is_ready(&self) -> bool {
        self.state.lock().await.ready
    }

    /// Currently linked peers, sorted
    pub async fn peers(&self) -> Vec<String> {
        let mut peers: Vec<String> = self.state.lock().await.peers.iter().cloned().collect();
        peers.sort();
        peers
    }

    /// Unsubscribe and close every link
    pub async fn stop(&self) {
        self.cancel.cancel();
        let mut state = self.state.lock().await;
        if let Some(id) = state.callback.take() {
            self.discovery.unregister_callback(id);
        }
        for peer in state.peers.drain() {
            self.linker.close(&peer).await;
        }
        tracing::info!("Peer manager stopped");
    }
}

/// Production linker: one reconnecting tunnel client per peer
pub struct TunnelPeerLinker {
    table: Arc<SessionTable>,
    self_id: String,
    token: String,
    scheme: &'static str,
    register_path: String,
    tls: Option<rustls::ClientConfig>,
    backoff: BackoffConfig,
    session: SessionConfig,
    links: DashMap<String, CancellationToken>,
}

impl TunnelPeerLinker {
    /// Linker authenticating as `self_id` with `token`. Links use https when
    /// `tls` is set.
    pub fn new(
        table: Arc<SessionTable>,
        self_id: impl Into<String>,
        token: impl Into<String>,
        register_path: impl Into<String>,
        tls: Option<rustls::ClientConfig>,
    ) -> Self {
        Self {
            table,
            self_id: self_id.into(),
            token: token.into(),
            scheme: if tls.is_some() { "https" } else { "http" },
            register_path: register_path.into(),
            tls,
            backoff: BackoffConfig::default(),
            session: SessionConfig::default(),
            links: DashMap::new(),
        }
    }

    /// Reconnect delays for dropped links
    pub fn with_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }

    /// Heartbeat settings for link sessions
    pub fn with_session_config(mut self, session: SessionConfig) -> Self {
        self.session = session;
        self
    }

    /// Peers with a running link task
    pub fn linked(&self) -> Vec<String> {
        let mut peers: Vec<String> = self.links.iter().map(|e| e.key().clone()).collect();
        peers.sort();
        peers
    }

    fn client(&self, peer: &str) -> Result<TunnelClient, String> {
        let mut headers = HeaderMap::new();
        let mut token = HeaderValue::from_str(&self.token).map_err(|e| e.to_string())?;
        token.set_sensitive(true);
        headers.insert(PEER_TOKEN_HEADER, token);
        headers.insert(
            PEER_ID_HEADER,
            HeaderValue::from_str(&self.self_id).map_err(|e| e.to_string())?,
        );

        let url = format!("{}://{}{}", self.scheme, peer, self.register_path);
        TunnelClient::new(url, headers, self.tls.clone())
            .map(|client| client.with_session_config(self.session.clone()))
            .map_err(|e| e.to_string())
    }
}

#[async_trait]
impl PeerLinker for TunnelPeerLinker {
    async fn open(&self, peer: &str) {
        if self.links.contains_key(peer) {
            return;
        }
        let client = match self.client(peer) {
            Ok(client) => client,
            Err(e) => {
                tracing::error!(peer = %peer, error = %e, "Cannot build peer link");
                return;
            }
        };

        let cancel = CancellationToken::new();
        self.links.insert(peer.to_string(), cancel.clone());

        let table = Arc::clone(&self.table);
        let handler = Arc::new(PeerRouteUpdater::new(Arc::clone(&table), peer));
        let backoff = ExponentialBackoff::from_config(&self.backoff);
        let peer = peer.to_string();
        tokio::spawn(async move {
            let up_table = Arc::clone(&table);
            let down_table = Arc::clone(&table);
            client
                .run_link(
                    handler,
                    backoff,
                    cancel,
                    |session| up_table.set_peer_route(&peer, Arc::clone(session)),
                    |session| down_table.remove_peer_route(&peer, session),
                )
                .await;
        });
    }

    async fn close(&self, peer: &str) {
        if let Some((_, cancel)) = self.links.remove(peer) {
            cancel.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::StaticDiscovery;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    /// Linker that records every call
    #[derive(Default)]
    struct RecordingLinker {
        calls: StdMutex<Vec<String>>,
    }

    impl RecordingLinker {
        fn take(&self) -> Vec<String> {
            std::mem::take(&mut *self.calls.lock().unwrap())
        }
    }

    #[async_trait]
    impl PeerLinker for RecordingLinker {
        async fn open(&self, peer: &str) {
            self.calls.lock().unwrap().push(format!("open {}", peer));
        }

        async fn close(&self, peer: &str) {
            self.calls.lock().unwrap().push(format!("close {}", peer));
        }
    }

    fn instances(addresses: &[&str]) -> Vec<ServiceInstance> {
        addresses.iter().map(|a| ServiceInstance::new(*a)).collect()
    }

    fn manager(linker: Arc<RecordingLinker>) -> (Arc<PeerManager>, Arc<StaticDiscovery>) {
        let discovery = Arc::new(StaticDiscovery::new(Vec::<String>::new()));
        let manager = Arc::new(PeerManager::new(
            "10.0.0.1:8080",
            Arc::clone(&discovery) as Arc<dyn ServiceDiscovery>,
            linker,
        ));
        (manager, discovery)
    }

    #[test]
    fn test_resolve_address() {
        assert_eq!(
            resolve_address(&ServiceInstance::new("10.0.0.2:9090")).unwrap(),
            "10.0.0.2:9090"
        );
        assert_eq!(
            resolve_address(&ServiceInstance::new("10.0.0.2:9090").with_metadata(HTTP_PORT_KEY, "8080"))
                .unwrap(),
            "10.0.0.2:8080"
        );
        assert_eq!(
            resolve_address(&ServiceInstance::new("[fd00::2]:9090")).unwrap(),
            "[fd00::2]:9090"
        );
        assert!(matches!(
            resolve_address(&ServiceInstance::new("10.0.0.2")),
            Err(AddressError::MissingPort(_))
        ));
        assert!(matches!(
            resolve_address(&ServiceInstance::new("fd00::2")),
            Err(AddressError::MissingHost(_))
        ));
        assert!(matches!(
            resolve_address(&ServiceInstance::new("10.0.0.2:9090").with_metadata(HTTP_PORT_KEY, "http")),
            Err(AddressError::InvalidPort { .. })
        ));
    }

    #[tokio::test]
    async fn test_diff_converges_and_is_idempotent() {
        let linker = Arc::new(RecordingLinker::default());
        let (manager, _) = manager(Arc::clone(&linker));

        let diff = manager
            .on_membership_changed(instances(&["10.0.0.2:8080", "10.0.0.3:8080"]))
            .await;
        assert_eq!(diff.to_create, vec!["10.0.0.2:8080", "10.0.0.3:8080"]);
        assert!(diff.to_delete.is_empty());

        let diff = manager
            .on_membership_changed(instances(&["10.0.0.3:8080", "10.0.0.4:8080"]))
            .await;
        assert_eq!(diff.to_create, vec!["10.0.0.4:8080"]);
        assert_eq!(diff.to_delete, vec!["10.0.0.2:8080"]);

        let again = manager
            .on_membership_changed(instances(&["10.0.0.4:8080", "10.0.0.3:8080"]))
            .await;
        assert!(again.is_empty());

        assert_eq!(
            linker.take(),
            vec![
                "open 10.0.0.2:8080",
                "open 10.0.0.3:8080",
                "open 10.0.0.4:8080",
                "close 10.0.0.2:8080",
            ]
        );
        assert_eq!(manager.peers().await, vec!["10.0.0.3:8080", "10.0.0.4:8080"]);
    }

    #[tokio::test]
    async fn test_self_marks_ready_and_is_never_linked() {
        let linker = Arc::new(RecordingLinker::default());
        let (manager, _) = manager(Arc::clone(&linker));
        assert!(!manager.is_ready().await);

        let diff = manager
            .on_membership_changed(instances(&["10.0.0.1:8080", "10.0.0.2:8080"]))
            .await;
        assert_eq!(diff.to_create, vec!["10.0.0.2:8080"]);
        assert!(manager.is_ready().await);

        // readiness survives a snapshot without self
        manager.on_membership_changed(instances(&["10.0.0.2:8080"])).await;
        assert!(manager.is_ready().await);
    }

    #[tokio::test]
    async fn test_http_port_metadata_and_bad_instances() {
        let linker = Arc::new(RecordingLinker::default());
        let (manager, _) = manager(Arc::clone(&linker));

        let diff = manager
            .on_membership_changed(vec![
                ServiceInstance::new("10.0.0.1:9090").with_metadata(HTTP_PORT_KEY, "8080"),
                ServiceInstance::new("10.0.0.2:9090").with_metadata(HTTP_PORT_KEY, "8080"),
                ServiceInstance::new("garbage"),
            ])
            .await;
        assert_eq!(diff.to_create, vec!["10.0.0.2:8080"]);
        assert!(manager.is_ready().await);
    }

    #[tokio::test]
    async fn test_start_follows_discovery_and_stop_closes_links() {
        let linker = Arc::new(RecordingLinker::default());
        let (manager, discovery) = manager(Arc::clone(&linker));
        manager.start().await;

        discovery.set_members(instances(&["10.0.0.1:8080", "10.0.0.2:8080"]));
        for _ in 0..200 {
            if manager.peers().await == vec!["10.0.0.2:8080".to_string()] {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(manager.peers().await, vec!["10.0.0.2:8080"]);
        assert!(manager.is_ready().await);

        manager.stop().await;
        assert!(manager.peers().await.is_empty());
        assert_eq!(
            linker.take(),
            vec!["open 10.0.0.2:8080", "close 10.0.0.2:8080"]
        );

        // unsubscribed: later changes are ignored
        discovery.set_members(instances(&["10.0.0.3:8080"]));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(linker.take().is_empty());
    }

    #[tokio::test]
    async fn test_tunnel_linker_tracks_links() {
        let linker = TunnelPeerLinker::new(
            Arc::new(SessionTable::new()),
            "10.0.0.1:8080",
            "peer-secret",
            "/tunnels/register",
            None,
        );
        linker.open("127.0.0.1:1").await;
        linker.open("127.0.0.1:1").await;
        assert_eq!(linker.linked(), vec!["127.0.0.1:1"]);

        linker.close("127.0.0.1:1").await;
        assert!(linker.linked().is_empty());
    }
}
