//! cg-manager: tunnel registration and cluster API proxying
//!
//! Agents inside tenant clusters dial out to the manager and register a
//! tunnel. The manager then proxies kube-apiserver and mesos-driver API
//! calls through those tunnels, forwarding across sibling replicas when
//! another replica holds the session.

pub mod auth;
pub mod discovery;
pub mod metrics;
pub mod peer;
pub mod proxy;
pub mod router;
pub mod state;
pub mod store;
pub mod transport;

pub use auth::TunnelAuthorizer;
pub use discovery::{DnsDiscovery, StaticDiscovery};
pub use metrics::{ProxyMetrics, ProxyStatus, ProxyTimer};
pub use peer::{PeerDiff, PeerLinker, PeerManager, TunnelPeerLinker};
pub use proxy::{K8sProxyDispatcher, MesosProxyDispatcher, ProxyError};
pub use router::build_router;
pub use state::ManagerState;
pub use store::{FileCredentialStore, MemoryCredentialStore};
pub use transport::{Transport, TransportCache, TransportError};
