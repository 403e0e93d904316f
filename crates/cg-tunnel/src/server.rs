//! Accepting side of tunnel registration

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::extract::Request;
use axum::response::{IntoResponse, Response};
use http::header::{CONNECTION, UPGRADE};
use http::{HeaderMap, HeaderValue, StatusCode};
use hyper_util::rt::TokioIo;
use sha2::{Digest, Sha256};

use cg_core::RegistrationError;

use crate::handler::{PeerForward, RejectConnect};
use crate::session::{Role, Session, SessionConfig};
use crate::table::SessionTable;

/// `Upgrade` token of the tunnel protocol
pub const UPGRADE_PROTOCOL: &str = "cg-tunnel";

/// Shared secret presented by sibling replicas
pub const PEER_TOKEN_HEADER: &str = "X-API-Tunnel-Token";

/// Identity of a linking sibling replica
pub const PEER_ID_HEADER: &str = "X-API-Tunnel-Peer-ID";

/// Decides whether an agent may register, and under which key
#[async_trait]
pub trait Authorizer: Send + Sync + 'static {
    /// Validate the registration headers and return the session key
    async fn authorize(&self, headers: &HeaderMap) -> Result<String, RegistrationError>;

    /// The session registered under `key` went away
    async fn on_disconnect(&self, _key: &str) {}
}

/// Outcome of checking a registration request
enum Registration {
    Agent(String),
    Peer(String),
}

/// Upgrades registration requests into tunnel sessions and records them in
/// the session table
pub struct TunnelServer {
    table: Arc<SessionTable>,
    authorizer: Arc<dyn Authorizer>,
    peer_token_digest: Option<Vec<u8>>,
    session_config: SessionConfig,
    dial_timeout: Duration,
}

impl TunnelServer {
    /// Create a server that accepts agents through `authorizer`. Siblings are
    /// refused until a peer token is set.
    pub fn new(table: Arc<SessionTable>, authorizer: Arc<dyn Authorizer>) -> Self {
        Self {
            table,
            authorizer,
            peer_token_digest: None,
            session_config: SessionConfig::default(),
            dial_timeout: Duration::from_secs(15),
        }
    }

    /// Accept sibling replicas presenting `token`. An empty token disables
    /// peer links.
    pub fn with_peer_token(mut self, token: &str) -> Self {
        self.peer_token_digest = if token.is_empty() {
            None
        } else {
            Some(Sha256::digest(token.as_bytes()).to_vec())
        };
        self
    }

    /// Heartbeat settings of accepted sessions
    pub fn with_session_config(mut self, config: SessionConfig) -> Self {
        self.session_config = config;
        self
    }

    /// Timeout for streams forwarded on behalf of siblings
    pub fn with_dial_timeout(mut self, timeout: Duration) -> Self {
        self.dial_timeout = timeout;
        self
    }

    /// Session table sessions are registered in
    pub fn table(&self) -> &Arc<SessionTable> {
        &self.table
    }

    /// Handle one registration request
    pub async fn accept(&self, mut request: Request) -> Response {
        if !is_upgrade_request(request.headers()) {
            return (
                StatusCode::UPGRADE_REQUIRED,
                format!("tunnel registration requires Upgrade: {}", UPGRADE_PROTOCOL),
            )
                .into_response();
        }

        let registration = match self.check(request.headers()).await {
            Ok(registration) => registration,
            Err(response) => return response,
        };

        let on_upgrade = hyper::upgrade::on(&mut request);
        let table = Arc::clone(&self.table);
        let authorizer = Arc::clone(&self.authorizer);
        let config = self.session_config.clone();
        let dial_timeout = self.dial_timeout;

        tokio::spawn(async move {
            let upgraded = match on_upgrade.await {
                Ok(upgraded) => TokioIo::new(upgraded),
                Err(e) => {
                    tracing::warn!("Tunnel upgrade failed: {}", e);
                    return;
                }
            };

            match registration {
                Registration::Agent(key) => {
                    let session = Session::spawn(
                        upgraded,
                        Role::Server,
                        key.clone(),
                        Arc::new(RejectConnect),
                        config,
                    );
                    table.serve_local(&key, session).await;
                    authorizer.on_disconnect(&key).await;
                }
                Registration::Peer(peer_id) => {
                    let handler = PeerForward::new(Arc::clone(&table), dial_timeout);
                    let session = Session::spawn(
                        upgraded,
                        Role::Server,
                        format!("peer:{}", peer_id),
                        Arc::new(handler),
                        config,
                    );
                    table.add_inbound_peer(&peer_id, Arc::clone(&session));
                    session.closed().await;
                    table.remove_inbound_peer(&peer_id, &session);
                }
            }
        });

        let mut response = Response::new(Body::empty());
        *response.status_mut() = StatusCode::SWITCHING_PROTOCOLS;
        response
            .headers_mut()
            .insert(CONNECTION, HeaderValue::from_static("upgrade"));
        response
            .headers_mut()
            .insert(UPGRADE, HeaderValue::from_static(UPGRADE_PROTOCOL));
        response
    }

    async fn check(&self, headers: &HeaderMap) -> Result<Registration, Response> {
        if let Some(token) = headers.get(PEER_TOKEN_HEADER) {
            let accepted = self
                .peer_token_digest
                .as_deref()
                .map(|expected| Sha256::digest(token.as_bytes()).as_slice() == expected)
                .unwrap_or(false);
            if !accepted {
                tracing::warn!("Rejected peer link with invalid token");
                return Err((StatusCode::UNAUTHORIZED, "invalid peer token").into_response());
            }

            let peer_id = headers
                .get(PEER_ID_HEADER)
                .and_then(|v| v.to_str().ok())
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .ok_or_else(|| {
                    (StatusCode::BAD_REQUEST, "missing peer id").into_response()
                })?;
            return Ok(Registration::Peer(peer_id.to_string()));
        }

        match self.authorizer.authorize(headers).await {
            Ok(key) => Ok(Registration::Agent(key)),
            Err(e) if e.is_rejection() => {
                tracing::info!("Tunnel registration rejected: {}", e);
                Err((StatusCode::BAD_REQUEST, e.to_string()).into_response())
            }
            Err(e) => {
                tracing::error!("Tunnel registration failed: {}", e);
                Err((StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response())
            }
        }
    }
}

/// `Connection: upgrade` plus `Upgrade: cg-tunnel`
fn is_upgrade_request(headers: &HeaderMap) -> bool {
    let connection_upgrade = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|token| token.trim().eq_ignore_ascii_case("upgrade"));
    let protocol = headers
        .get(UPGRADE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim().eq_ignore_ascii_case(UPGRADE_PROTOCOL))
        .unwrap_or(false);
    connection_upgrade && protocol
}
