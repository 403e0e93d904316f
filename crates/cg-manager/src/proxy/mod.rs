//! Reverse-proxy dispatchers for cluster APIs reached through tunnels
//!
//! - [`K8sProxyDispatcher`]: path-addressed, one session per cluster
//! - [`MesosProxyDispatcher`]: header-addressed, several sessions per cluster

mod error;
mod k8s;
mod mesos;

pub use error::{K8sStatus, MesosEnvelope, ProxyError};
pub use k8s::K8sProxyDispatcher;
pub use mesos::{MesosProxyDispatcher, MESOS_CLUSTER_HEADER, YAML_CONTENT_TYPE};

use http::header::{self, HeaderMap, HeaderName};
use http::Uri;

/// Headers that describe a single connection and are never forwarded
static HOP_BY_HOP: [HeaderName; 8] = [
    header::CONNECTION,
    HeaderName::from_static("keep-alive"),
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
];

/// Whether the request asks for a protocol upgrade
pub(crate) fn is_upgrade(headers: &HeaderMap) -> bool {
    let connection_upgrade = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|token| token.trim().eq_ignore_ascii_case("upgrade"));
    connection_upgrade && headers.contains_key(header::UPGRADE)
}

/// Remove hop-by-hop headers, including any named in `Connection`
pub(crate) fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let named: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|token| HeaderName::from_bytes(token.trim().as_bytes()).ok())
        .collect();
    for name in named.iter().chain(HOP_BY_HOP.iter()) {
        headers.remove(name);
    }
}

/// Target URI for `path` and `query` on `server_address`.
///
/// `scheme` overrides the address's own scheme. Any path on the address is
/// kept as a base that `path` is appended to.
pub(crate) fn upstream_uri(
    server_address: &str,
    scheme: Option<&str>,
    path: &str,
    query: Option<&str>,
) -> Result<Uri, ProxyError> {
    let base: Uri = server_address
        .parse()
        .map_err(|e| ProxyError::Internal(format!("invalid server address {}: {}", server_address, e)))?;
    let authority = base
        .authority()
        .ok_or_else(|| ProxyError::Internal(format!("server address {} has no host", server_address)))?;
    let scheme = scheme.or(base.scheme_str()).unwrap_or("http");

    let base_path = base.path().trim_end_matches('/');
    let path = if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{}", path)
    };
    let mut target = format!("{}://{}{}{}", scheme, authority, base_path, path);
    if let Some(query) = query.filter(|q| !q.is_empty()) {
        target.push('?');
        target.push_str(query);
    }

    target
        .parse()
        .map_err(|e| ProxyError::Internal(format!("invalid upstream uri {}: {}", target, e)))
}
