//! mesos-driver proxying, addressed by the `BCS-ClusterID` header

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::Request;
use axum::response::{IntoResponse, Response};
use axum::routing::any;
use axum::Router;
use bytes::Bytes;
use http::header::{CONTENT_LENGTH, CONTENT_TYPE, HOST};
use http::{HeaderMap, HeaderValue, Version};
use rand::seq::SliceRandom;

use cg_core::{ClientModule, ClusterCredential, CredentialFilter, CredentialStore, ServerKey};
use cg_tunnel::SessionTable;

use super::{strip_hop_by_hop, upstream_uri, MesosEnvelope, ProxyError};
use crate::metrics::{Backend, ProxyMetrics, ProxyStatus, ProxyTimer};
use crate::transport::TransportCache;

/// Header naming the target cluster
pub const MESOS_CLUSTER_HEADER: &str = "BCS-ClusterID";

/// Request bodies of this type are converted to JSON before forwarding
pub const YAML_CONTENT_TYPE: &str = "application/x-yaml";

/// Routes header-addressed requests to one of a cluster's live drivers
pub struct MesosProxyDispatcher {
    table: Arc<SessionTable>,
    store: Arc<dyn CredentialStore>,
    transports: TransportCache<(String, ServerKey)>,
    metrics: Arc<ProxyMetrics>,
    prefix: String,
    max_body: usize,
}

impl MesosProxyDispatcher {
    /// Dispatcher serving `{prefix}/...` for Mesos driver clusters. Request
    /// bodies above `max_body` bytes are refused.
    pub fn new(
        table: Arc<SessionTable>,
        store: Arc<dyn CredentialStore>,
        metrics: Arc<ProxyMetrics>,
        prefix: impl Into<String>,
        dial_timeout: Duration,
        max_body: usize,
    ) -> Self {
        Self {
            transports: TransportCache::new(Arc::clone(&table), dial_timeout),
            table,
            store,
            metrics,
            prefix: prefix.into().trim_end_matches('/').to_string(),
            max_body,
        }
    }

    /// Routes for every path under the prefix
    pub fn router<S>(self: Arc<Self>) -> Router<S>
    where
        S: Clone + Send + Sync + 'static,
    {
        let root = if self.prefix.is_empty() {
            "/".to_string()
        } else {
            self.prefix.clone()
        };
        let nested = format!("{}/*path", self.prefix);
        let bare = Arc::clone(&self);
        Router::new()
            .route(
                &root,
                any(move |request: Request| {
                    let dispatcher = Arc::clone(&bare);
                    async move { dispatcher.dispatch(request).await }
                }),
            )
            .route(
                &nested,
                any(move |request: Request| {
                    let dispatcher = Arc::clone(&self);
                    async move { dispatcher.dispatch(request).await }
                }),
            )
    }

    /// Transports built so far, one per (cluster, driver)
    pub fn transports(&self) -> &TransportCache<(String, ServerKey)> {
        &self.transports
    }

    /// Proxy one request, rendering failures in the mesos envelope
    pub async fn dispatch(&self, request: Request) -> Response {
        match self.forward(request).await {
            Ok(response) => response,
            Err(err) => {
                tracing::debug!(error = %err, "Mesos proxy request failed");
                MesosEnvelope(err).into_response()
            }
        }
    }

    /// Pick a random candidate that has a live session
    fn select_live(&self, mut candidates: Vec<ClusterCredential>) -> Option<ClusterCredential> {
        candidates.shuffle(&mut rand::thread_rng());
        candidates
            .into_iter()
            .find(|c| self.table.has_session(c.server_key.as_str()))
    }

    async fn forward(&self, request: Request) -> Result<Response, ProxyError> {
        let cluster_id = request
            .headers()
            .get(MESOS_CLUSTER_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .ok_or(ProxyError::MissingParameter(MESOS_CLUSTER_HEADER))?
            .to_string();

        let (mut parts, body) = request.into_parts();
        let body = axum::body::to_bytes(body, self.max_body)
            .await
            .map_err(|e| ProxyError::Body(e.to_string()))?;
        let body = normalize_body(&mut parts.headers, body)?;

        let candidates = self
            .store
            .list(&CredentialFilter::cluster_module(
                cluster_id.as_str(),
                ClientModule::MesosDriver,
            ))
            .await?;
        if candidates.is_empty() {
            return Err(ProxyError::BackendUnavailable(cluster_id));
        }
        let credential = self
            .select_live(candidates)
            .ok_or_else(|| ProxyError::BackendUnavailable(cluster_id.clone()))?;

        let transport = self
            .transports
            .get_or_create(&(cluster_id.clone(), credential.server_key.clone()), &credential)
            .map_err(|e| ProxyError::from_transport(&cluster_id, e))?;

        let target = upstream_uri(
            &credential.server_address,
            None,
            parts.uri.path(),
            parts.uri.query(),
        )?;
        tracing::debug!(
            cluster = %cluster_id,
            server_key = %credential.server_key,
            method = %parts.method,
            target = %target,
            "Proxying mesos request"
        );

        parts.uri = target;
        parts.version = Version::HTTP_11;
        parts.headers.remove(HOST);
        parts.headers.remove(CONTENT_LENGTH);
        strip_hop_by_hop(&mut parts.headers);

        let timer = ProxyTimer::start(
            Arc::clone(&self.metrics),
            Backend::Mesos,
            cluster_id.as_str(),
            parts.method.as_str(),
        );
        let response = match transport
            .send(Request::from_parts(parts, Body::from(body)))
            .await
        {
            Ok(response) => response,
            Err(e) => {
                timer.complete(ProxyStatus::ServerError);
                return Err(ProxyError::Upstream(e.to_string()));
            }
        };
        timer.complete(ProxyStatus::from_status_code(response.status().as_u16()));

        let (upstream, body) = response.into_parts();
        let mut relayed = Response::new(Body::new(body));
        *relayed.status_mut() = upstream.status;
        if let Some(content_type) = upstream.headers.get(CONTENT_TYPE) {
            relayed
                .headers_mut()
                .insert(CONTENT_TYPE, content_type.clone());
        }
        Ok(relayed)
    }
}

/// Convert a YAML body to JSON, retagging the content type
fn normalize_body(headers: &mut HeaderMap, body: Bytes) -> Result<Bytes, ProxyError> {
    let is_yaml = headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(';').next())
        .is_some_and(|v| v.trim().eq_ignore_ascii_case(YAML_CONTENT_TYPE));
    if !is_yaml {
        return Ok(body);
    }

    let value: serde_json::Value =
        serde_yaml::from_slice(&body).map_err(|e| ProxyError::MediaConversion(e.to_string()))?;
    let json = serde_json::to_vec(&value).map_err(|e| ProxyError::MediaConversion(e.to_string()))?;
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    Ok(Bytes::from(json))
}
