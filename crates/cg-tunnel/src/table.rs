//! Index of live tunnel sessions

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;

use cg_protocol::Message;

use crate::error::TunnelError;
use crate::session::Session;
use crate::stream::TunnelStream;

/// A link this replica opened to a sibling, with the keys it advertised
struct PeerRoute {
    session: Arc<Session>,
    keys: HashSet<String>,
}

/// Live sessions of this replica, and the keys reachable through siblings.
///
/// Local sessions are registered by agents. Inbound peer sessions are links
/// siblings opened to us; they are told which keys we hold. Peer routes are
/// links we opened to siblings, annotated with the keys they hold.
#[derive(Default)]
pub struct SessionTable {
    local: DashMap<String, Vec<Arc<Session>>>,
    inbound_peers: DashMap<String, Arc<Session>>,
    peer_routes: DashMap<String, PeerRoute>,
}

impl SessionTable {
    /// Empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an agent session under `key`. The newest session of a key
    /// serves dials.
    pub fn add_local(&self, key: &str, session: Arc<Session>) {
        let first = {
            let mut sessions = self.local.entry(key.to_string()).or_default();
            sessions.retain(|s| !s.is_closed());
            sessions.push(session);
            sessions.len() == 1
        };
        tracing::info!(server_key = %key, "Tunnel session registered");
        if first {
            self.advertise(Message::AddClient { key: key.to_string() });
        }
    }

    /// Unregister one agent session of `key`
    pub fn remove_local(&self, key: &str, session: &Arc<Session>) {
        let emptied = match self.local.get_mut(key) {
            Some(mut sessions) => {
                sessions.retain(|s| !Arc::ptr_eq(s, session) && !s.is_closed());
                sessions.is_empty()
            }
            None => false,
        };
        tracing::info!(server_key = %key, "Tunnel session unregistered");
        if emptied && self.local.remove_if(key, |_, s| s.is_empty()).is_some() {
            self.advertise(Message::RemoveClient { key: key.to_string() });
        }
    }

    /// Register `session` under `key` until it closes
    pub async fn serve_local(&self, key: &str, session: Arc<Session>) {
        self.add_local(key, Arc::clone(&session));
        session.closed().await;
        self.remove_local(key, &session);
    }

    /// Newest open local session of `key`
    pub fn local_session(&self, key: &str) -> Option<Arc<Session>> {
        self.local
            .get(key)
            .and_then(|sessions| sessions.iter().rev().find(|s| !s.is_closed()).cloned())
    }

    /// Whether `key` is reachable, locally or through a sibling
    pub fn has_session(&self, key: &str) -> bool {
        self.local_session(key).is_some() || self.peer_session(key).is_some()
    }

    /// Keys with a local session
    pub fn local_keys(&self) -> Vec<String> {
        self.local
            .iter()
            .filter(|entry| entry.value().iter().any(|s| !s.is_closed()))
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Open a stream to `address` through the session of `key`.
    ///
    /// A local session wins; otherwise the stream is relayed by a sibling
    /// that advertised `key`.
    pub async fn dial(
        &self,
        key: &str,
        address: &str,
        timeout: Duration,
    ) -> Result<TunnelStream, TunnelError> {
        if let Some(session) = self.local_session(key) {
            return session.dial(address, None, timeout).await;
        }
        match self.peer_session(key) {
            Some(session) => {
                tracing::debug!(server_key = %key, peer = %session.label(), "Dialing through peer");
                session.dial(address, Some(key), timeout).await
            }
            None => Err(TunnelError::NoSession(key.to_string())),
        }
    }

    /// Like [`dial`](Self::dial), restricted to local sessions
    pub async fn dial_local(
        &self,
        key: &str,
        address: &str,
        timeout: Duration,
    ) -> Result<TunnelStream, TunnelError> {
        let session = self
            .local_session(key)
            .ok_or_else(|| TunnelError::NoSession(key.to_string()))?;
        session.dial(address, None, timeout).await
    }

    /// A sibling linked to us; it learns every key we currently hold
    pub fn add_inbound_peer(&self, peer_id: &str, session: Arc<Session>) {
        if let Some(old) = self
            .inbound_peers
            .insert(peer_id.to_string(), Arc::clone(&session))
        {
            old.close();
        }
        // keys added concurrently may be announced twice; the receiver keeps a set
        for key in self.local_keys() {
            session.send_control(Message::AddClient { key });
        }
        tracing::info!(peer = %peer_id, "Peer linked in");
    }

    /// Forget an inbound sibling link, if `session` is still the current one
    pub fn remove_inbound_peer(&self, peer_id: &str, session: &Arc<Session>) {
        if self
            .inbound_peers
            .remove_if(peer_id, |_, s| Arc::ptr_eq(s, session))
            .is_some()
        {
            tracing::info!(peer = %peer_id, "Peer link in closed");
        }
    }

    /// Record an outbound link to a sibling; it advertises no keys yet
    pub fn set_peer_route(&self, peer_id: &str, session: Arc<Session>) {
        self.peer_routes.insert(
            peer_id.to_string(),
            PeerRoute {
                session,
                keys: HashSet::new(),
            },
        );
    }

    /// Drop an outbound link, if `session` is still the current one
    pub fn remove_peer_route(&self, peer_id: &str, session: &Arc<Session>) {
        self.peer_routes
            .remove_if(peer_id, |_, route| Arc::ptr_eq(&route.session, session));
    }

    /// A sibling advertised `key`
    pub fn peer_add_key(&self, peer_id: &str, key: String) {
        if let Some(mut route) = self.peer_routes.get_mut(peer_id) {
            tracing::debug!(peer = %peer_id, server_key = %key, "Peer serves key");
            route.keys.insert(key);
        }
    }

    /// A sibling withdrew `key`
    pub fn peer_remove_key(&self, peer_id: &str, key: &str) {
        if let Some(mut route) = self.peer_routes.get_mut(peer_id) {
            tracing::debug!(peer = %peer_id, server_key = %key, "Peer no longer serves key");
            route.keys.remove(key);
        }
    }

    /// Sibling ids we hold outbound links to
    pub fn peer_ids(&self) -> Vec<String> {
        self.peer_routes.iter().map(|r| r.key().clone()).collect()
    }

    fn peer_session(&self, key: &str) -> Option<Arc<Session>> {
        self.peer_routes
            .iter()
            .find(|route| route.keys.contains(key) && !route.session.is_closed())
            .map(|route| Arc::clone(&route.session))
    }

    fn advertise(&self, message: Message) {
        for peer in self.inbound_peers.iter() {
            if !peer.value().send_control(message.clone()) {
                tracing::warn!(peer = %peer.key(), "Could not advertise key change to peer");
            }
        }
    }
}

impl std::fmt::Debug for SessionTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionTable")
            .field("local", &self.local.len())
            .field("inbound_peers", &self.inbound_peers.len())
            .field("peer_routes", &self.peer_routes.len())
            .finish()
    }
}
