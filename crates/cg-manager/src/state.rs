//! Shared manager state

use std::sync::Arc;

use cg_core::config::ManagerConfig;
use cg_core::CredentialStore;
use cg_tunnel::{SessionConfig, SessionTable, TunnelServer};

use crate::auth::TunnelAuthorizer;
use crate::metrics::ProxyMetrics;
use crate::peer::PeerManager;
use crate::proxy::{K8sProxyDispatcher, MesosProxyDispatcher};

/// Everything request handlers need, built once at startup
pub struct ManagerState {
    /// Configuration
    pub config: ManagerConfig,
    /// Live agent sessions and peer routes
    pub table: Arc<SessionTable>,
    /// Credential store
    pub store: Arc<dyn CredentialStore>,
    /// Registration endpoint
    pub server: Arc<TunnelServer>,
    /// Path-addressed proxy
    pub k8s: Arc<K8sProxyDispatcher>,
    /// Header-addressed proxy
    pub mesos: Arc<MesosProxyDispatcher>,
    /// Proxy counters
    pub metrics: Arc<ProxyMetrics>,
    /// Peer reconciliation, absent when running as a lone replica
    pub peers: Option<Arc<PeerManager>>,
}

impl ManagerState {
    /// Build state over `store`. A non-empty `peer.token` enables inbound
    /// peer links.
    pub fn new(config: ManagerConfig, store: Arc<dyn CredentialStore>) -> Self {
        let table = Arc::new(SessionTable::new());
        let metrics = Arc::new(ProxyMetrics::new());

        let authorizer = Arc::new(TunnelAuthorizer::new(Arc::clone(&store)));
        let server = Arc::new(
            TunnelServer::new(Arc::clone(&table), authorizer)
                .with_peer_token(&config.peer.token)
                .with_session_config(SessionConfig::from(&config.heartbeat))
                .with_dial_timeout(config.dial_timeout),
        );

        let k8s = Arc::new(K8sProxyDispatcher::new(
            Arc::clone(&table),
            Arc::clone(&store),
            Arc::clone(&metrics),
            config.k8s_prefix.as_str(),
            config.dial_timeout,
        ));
        let mesos = Arc::new(MesosProxyDispatcher::new(
            Arc::clone(&table),
            Arc::clone(&store),
            Arc::clone(&metrics),
            config.mesos_prefix.as_str(),
            config.dial_timeout,
            config.max_request_body,
        ));

        Self {
            config,
            table,
            store,
            server,
            k8s,
            mesos,
            metrics,
            peers: None,
        }
    }

    /// Attach the peer manager feeding readiness
    pub fn with_peer_manager(mut self, peers: Arc<PeerManager>) -> Self {
        self.peers = Some(peers);
        self
    }

    /// Ready once this replica has seen itself in discovery. A lone replica
    /// is always ready.
    pub async fn is_ready(&self) -> bool {
        match &self.peers {
            Some(peers) => peers.is_ready().await,
            None => true,
        }
    }
}
