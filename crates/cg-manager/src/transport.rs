//! HTTP transports bound to tunnel sessions
//!
//! A [`Transport`] is a pooled HTTP/1.1 client whose connections are tunnel
//! streams of one server key. The [`TransportCache`] keeps one per routing
//! key and rebuilds it when the credential it was built from changes.

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};
use std::time::Duration;

use axum::body::Body;
use http::header::AUTHORIZATION;
use http::{HeaderValue, Request, Response, Uri};
use hyper::body::Incoming;
use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
use hyper_util::client::legacy::connect::{Connected, Connection};
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo};
use rustls::pki_types::CertificateDer;
use rustls::{ClientConfig, RootCertStore};
use thiserror::Error;

use cg_core::ClusterCredential;
use cg_tunnel::{SessionTable, TunnelError, TunnelStream};

/// Idle pooled connections are dropped after this long
const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(90);

/// Transport failures
#[derive(Error, Debug)]
pub enum TransportError {
    /// CA bundle could not be parsed or held no certificate
    #[error("invalid CA data: {0}")]
    InvalidCaData(String),

    /// TLS configuration rejected
    #[error("TLS configuration error: {0}")]
    Tls(#[from] rustls::Error),

    /// Token is not a valid header value
    #[error("user token is not a valid header value")]
    InvalidToken,

    /// Request through the tunnel failed
    #[error("upstream request failed: {0}")]
    Request(#[from] hyper_util::client::legacy::Error),
}

/// Trust roots for `ca_cert_data`, or the public web PKI roots when absent.
///
/// When CA data is present it is the only root; nothing else is trusted.
pub fn root_store(ca_cert_data: Option<&str>) -> Result<RootCertStore, TransportError> {
    let Some(pem) = ca_cert_data else {
        return Ok(RootCertStore::from_iter(
            webpki_roots::TLS_SERVER_ROOTS.iter().cloned(),
        ));
    };

    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut pem.as_bytes())
        .collect::<Result<_, _>>()
        .map_err(|e| TransportError::InvalidCaData(e.to_string()))?;
    if certs.is_empty() {
        return Err(TransportError::InvalidCaData(
            "no certificate in PEM data".to_string(),
        ));
    }

    let mut roots = RootCertStore::empty();
    for cert in certs {
        roots
            .add(cert)
            .map_err(|e| TransportError::InvalidCaData(e.to_string()))?;
    }
    Ok(roots)
}

/// rustls client config trusting exactly `roots`
pub fn client_tls_config(roots: RootCertStore) -> Result<ClientConfig, TransportError> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    Ok(ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()?
        .with_root_certificates(roots)
        .with_no_client_auth())
}

/// Tunnel stream usable as a hyper connection
pub struct TunnelIo {
    inner: TokioIo<TunnelStream>,
}

impl TunnelIo {
    fn new(stream: TunnelStream) -> Self {
        Self {
            inner: TokioIo::new(stream),
        }
    }
}

impl hyper::rt::Read for TunnelIo {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: hyper::rt::ReadBufCursor<'_>,
    ) -> Poll<io::Result<()>> {
        hyper::rt::Read::poll_read(Pin::new(&mut self.inner), cx, buf)
    }
}

impl hyper::rt::Write for TunnelIo {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        hyper::rt::Write::poll_write(Pin::new(&mut self.inner), cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        hyper::rt::Write::poll_flush(Pin::new(&mut self.inner), cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        hyper::rt::Write::poll_shutdown(Pin::new(&mut self.inner), cx)
    }
}

impl Connection for TunnelIo {
    fn connected(&self) -> Connected {
        Connected::new()
    }
}

/// Connector dialing every connection through the session of one server
/// key. The session is looked up per dial, so a reconnected agent is picked
/// up without rebuilding the transport.
#[derive(Clone)]
pub struct TunnelConnector {
    table: Arc<SessionTable>,
    server_key: String,
    timeout: Duration,
}

impl TunnelConnector {
    /// Connector for `server_key`'s session
    pub fn new(table: Arc<SessionTable>, server_key: impl Into<String>, timeout: Duration) -> Self {
        Self {
            table,
            server_key: server_key.into(),
            timeout,
        }
    }
}

impl tower::Service<Uri> for TunnelConnector {
    type Response = TunnelIo;
    type Error = TunnelError;
    type Future = Pin<Box<dyn Future<Output = Result<TunnelIo, TunnelError>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, uri: Uri) -> Self::Future {
        let table = Arc::clone(&self.table);
        let server_key = self.server_key.clone();
        let timeout = self.timeout;

        Box::pin(async move {
            let host = uri.host().ok_or_else(|| TunnelError::DialFailed {
                address: uri.to_string(),
                reason: "missing host".to_string(),
            })?;
            let port = uri.port_u16().unwrap_or_else(|| {
                if uri.scheme_str() == Some("https") {
                    443
                } else {
                    80
                }
            });
            let address = format!("{}:{}", host, port);
            tracing::trace!(server_key = %server_key, address = %address, "Dialing upstream through tunnel");
            let stream = table.dial(&server_key, &address, timeout).await?;
            Ok(TunnelIo::new(stream))
        })
    }
}

type TunnelClient = Client<HttpsConnector<TunnelConnector>, Body>;

/// Pooled HTTP client for one credential, injecting its bearer token.
///
/// Closing only retires the transport from the cache: holders that already
/// have it keep sending, and the pooled connections go away with the last
/// holder.
pub struct Transport {
    client: TunnelClient,
    bearer: Option<HeaderValue>,
    closed: AtomicBool,
}

impl Transport {
    /// Build a transport for `credential` over `table`'s sessions
    pub fn build(
        table: Arc<SessionTable>,
        credential: &ClusterCredential,
        dial_timeout: Duration,
    ) -> Result<Self, TransportError> {
        let roots = root_store(credential.ca_cert_data.as_deref())?;
        let tls = client_tls_config(roots)?;

        let connector = TunnelConnector::new(table, credential.server_key.as_str(), dial_timeout);
        let https = HttpsConnectorBuilder::new()
            .with_tls_config(tls)
            .https_or_http()
            .enable_http1()
            .wrap_connector(connector);

        let client = Client::builder(TokioExecutor::new())
            .pool_idle_timeout(POOL_IDLE_TIMEOUT)
            .build(https);

        let bearer = if credential.user_token.is_empty() {
            None
        } else {
            let mut value = HeaderValue::from_str(&format!("Bearer {}", credential.user_token))
                .map_err(|_| TransportError::InvalidToken)?;
            value.set_sensitive(true);
            Some(value)
        };

        Ok(Self {
            client,
            bearer,
            closed: AtomicBool::new(false),
        })
    }

    /// Send `request`, replacing any `Authorization` header with the
    /// credential's bearer token when it has one
    pub async fn send(&self, mut request: Request<Body>) -> Result<Response<Incoming>, TransportError> {
        if let Some(bearer) = &self.bearer {
            request.headers_mut().insert(AUTHORIZATION, bearer.clone());
        }
        Ok(self.client.request(request).await?)
    }

    /// Mark the transport replaced so its idle connections are released
    /// once in-flight holders finish. Returns true for the call that
    /// performed the close, false for every later call.
    pub fn close_idle_connections(&self) -> bool {
        !self.closed.swap(true, Ordering::AcqRel)
    }

    /// Whether the transport is still the current one for its credential
    pub fn is_open(&self) -> bool {
        !self.closed.load(Ordering::Acquire)
    }
}

struct CacheEntry {
    server_address: String,
    ca_cert_data: Option<String>,
    user_token: String,
    transport: Arc<Transport>,
}

impl CacheEntry {
    fn matches(&self, credential: &ClusterCredential) -> bool {
        self.server_address == credential.server_address
            && self.ca_cert_data == credential.ca_cert_data
            && self.user_token == credential.user_token
    }
}

/// Transports keyed by routing key, rebuilt when their credential changes
pub struct TransportCache<K> {
    table: Arc<SessionTable>,
    dial_timeout: Duration,
    entries: Mutex<HashMap<K, CacheEntry>>,
}

impl<K> TransportCache<K>
where
    K: Eq + Hash + Clone + std::fmt::Debug,
{
    /// Empty cache building transports over `table`
    pub fn new(table: Arc<SessionTable>, dial_timeout: Duration) -> Self {
        Self {
            table,
            dial_timeout,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Transport for `key`, built or rebuilt from `credential` as needed
    pub fn get_or_create(
        &self,
        key: &K,
        credential: &ClusterCredential,
    ) -> Result<Arc<Transport>, TransportError> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);

        if let Some(entry) = entries.get(key) {
            if entry.matches(credential) {
                return Ok(Arc::clone(&entry.transport));
            }
            tracing::info!(key = ?key, server_key = %credential.server_key, "Credential changed, rebuilding transport");
        }

        // a failed build leaves the current entry in place
        let transport = Arc::new(Transport::build(
            Arc::clone(&self.table),
            credential,
            self.dial_timeout,
        )?);
        let replaced = entries.insert(
            key.clone(),
            CacheEntry {
                server_address: credential.server_address.clone(),
                ca_cert_data: credential.ca_cert_data.clone(),
                user_token: credential.user_token.clone(),
                transport: Arc::clone(&transport),
            },
        );
        if let Some(old) = replaced {
            old.transport.close_idle_connections();
        }
        Ok(transport)
    }

    /// Number of cached transports
    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Whether the cache is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cg_core::{ClientModule, ConnectMode, ServerKey};

    fn credential(address: &str, token: &str) -> ClusterCredential {
        ClusterCredential {
            server_key: ServerKey::new("c-1"),
            cluster_id: "c-1".to_string(),
            client_module: ClientModule::KubeAgent,
            server_address: address.to_string(),
            ca_cert_data: None,
            user_token: token.to_string(),
            connect_mode: ConnectMode::Tunnel,
        }
    }

    fn cache() -> TransportCache<String> {
        TransportCache::new(Arc::new(SessionTable::new()), Duration::from_secs(1))
    }

    #[test]
    fn test_matching_credential_reuses_transport() {
        let cache = cache();
        let key = "c-1".to_string();
        let cred = credential("https://10.0.0.5:6443", "tok");

        let first = cache.get_or_create(&key, &cred).unwrap();
        let second = cache.get_or_create(&key, &cred).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert!(first.is_open());
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_changed_credential_rebuilds_and_closes_old_once() {
        let cache = cache();
        let key = "c-1".to_string();

        let first = cache
            .get_or_create(&key, &credential("https://10.0.0.5:6443", "tok"))
            .unwrap();
        let second = cache
            .get_or_create(&key, &credential("https://10.0.0.5:6443", "rotated"))
            .unwrap();

        assert!(!Arc::ptr_eq(&first, &second));
        assert!(!first.is_open());
        assert!(second.is_open());
        // the rebuild already performed the close
        assert!(!first.close_idle_connections());
        assert_eq!(cache.len(), 1);

        let third = cache
            .get_or_create(&key, &credential("https://10.0.0.6:6443", "rotated"))
            .unwrap();
        assert!(!Arc::ptr_eq(&second, &third));
    }

    #[test]
    fn test_close_idle_connections_exactly_once() {
        let transport = Transport::build(
            Arc::new(SessionTable::new()),
            &credential("https://10.0.0.5:6443", "tok"),
            Duration::from_secs(1),
        )
        .unwrap();
        assert!(transport.close_idle_connections());
        assert!(!transport.close_idle_connections());
        assert!(!transport.is_open());
    }

    #[test]
    fn test_failed_rebuild_keeps_current_transport() {
        let cache = cache();
        let key = "c-1".to_string();
        let valid = credential("https://10.0.0.5:6443", "tok");

        let first = cache.get_or_create(&key, &valid).unwrap();

        let mut broken = valid.clone();
        broken.ca_cert_data = Some("garbage".to_string());
        assert!(matches!(
            cache.get_or_create(&key, &broken),
            Err(TransportError::InvalidCaData(_))
        ));
        assert!(first.is_open());

        let again = cache.get_or_create(&key, &valid).unwrap();
        assert!(Arc::ptr_eq(&first, &again));
        assert!(again.is_open());
    }

    #[tokio::test]
    async fn test_replaced_transport_still_sends() {
        let cache = cache();
        let key = "c-1".to_string();

        let held = cache
            .get_or_create(&key, &credential("http://10.0.0.5:8080", "tok"))
            .unwrap();
        cache
            .get_or_create(&key, &credential("http://10.0.0.5:8080", "rotated"))
            .unwrap();
        assert!(!held.is_open());

        // no session in the table: the request reaches the dial, not a
        // closed-transport error
        let request = Request::builder()
            .uri("http://10.0.0.5:8080/healthz")
            .body(Body::empty())
            .unwrap();
        assert!(matches!(
            held.send(request).await,
            Err(TransportError::Request(_))
        ));
    }

    #[test]
    fn test_public_roots_without_ca_data() {
        let roots = root_store(None).unwrap();
        assert!(!roots.is_empty());
        assert!(client_tls_config(roots).is_ok());
    }

    #[test]
    fn test_keys_are_independent() {
        let cache: TransportCache<(String, String)> =
            TransportCache::new(Arc::new(SessionTable::new()), Duration::from_secs(1));
        let cred = credential("http://10.0.0.7:8080", "");

        let a = cache
            .get_or_create(&("c-1".to_string(), "c-1-10.0.0.7".to_string()), &cred)
            .unwrap();
        let b = cache
            .get_or_create(&("c-1".to_string(), "c-1-10.0.0.8".to_string()), &cred)
            .unwrap();
        assert!(!Arc::ptr_eq(&a, &b));
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_invalid_ca_data() {
        let mut cred = credential("https://10.0.0.5:6443", "tok");
        cred.ca_cert_data = Some("not a certificate".to_string());

        let cache = cache();
        assert!(matches!(
            cache.get_or_create(&"c-1".to_string(), &cred),
            Err(TransportError::InvalidCaData(_))
        ));
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_send_without_session_fails() {
        let transport = Transport::build(
            Arc::new(SessionTable::new()),
            &credential("http://10.0.0.5:8080", "tok"),
            Duration::from_secs(1),
        )
        .unwrap();
        let request = Request::builder()
            .uri("http://10.0.0.5:8080/healthz")
            .body(Body::empty())
            .unwrap();
        assert!(matches!(
            transport.send(request).await,
            Err(TransportError::Request(_))
        ));
    }
}
