//! kube-apiserver proxying under `{prefix}/clusters/{cluster_id}/...`

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::Request;
use axum::response::{IntoResponse, Response};
use axum::routing::any;
use axum::Router;
use http::header::{AUTHORIZATION, HOST};
use http::{StatusCode, Version};
use hyper_util::rt::TokioIo;

use cg_core::CredentialStore;
use cg_tunnel::SessionTable;

use super::{is_upgrade, strip_hop_by_hop, upstream_uri, K8sStatus, ProxyError};
use crate::metrics::{Backend, ProxyMetrics, ProxyStatus, ProxyTimer};
use crate::transport::{Transport, TransportCache};

/// Routes path-addressed requests to the cluster's apiserver tunnel
pub struct K8sProxyDispatcher {
    table: Arc<SessionTable>,
    store: Arc<dyn CredentialStore>,
    transports: TransportCache<String>,
    metrics: Arc<ProxyMetrics>,
    prefix: String,
}

impl K8sProxyDispatcher {
    /// Dispatcher serving `{prefix}/clusters/...`. `dial_timeout` bounds
    /// each tunnel dial made by its transports.
    pub fn new(
        table: Arc<SessionTable>,
        store: Arc<dyn CredentialStore>,
        metrics: Arc<ProxyMetrics>,
        prefix: impl Into<String>,
        dial_timeout: Duration,
    ) -> Self {
        Self {
            transports: TransportCache::new(Arc::clone(&table), dial_timeout),
            table,
            store,
            metrics,
            prefix: prefix.into().trim_end_matches('/').to_string(),
        }
    }

    /// Routes for the bare cluster path and everything below it
    pub fn router<S>(self: Arc<Self>) -> Router<S>
    where
        S: Clone + Send + Sync + 'static,
    {
        let base = format!("{}/clusters/:cluster_id", self.prefix);
        let nested = format!("{}/*path", base);
        let bare = Arc::clone(&self);
        Router::new()
            .route(
                &base,
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

    /// Transports built so far, one per cluster
    pub fn transports(&self) -> &TransportCache<String> {
        &self.transports
    }

    /// Proxy one request, rendering failures as a Kubernetes `Status`
    pub async fn dispatch(&self, request: Request) -> Response {
        match self.forward(request).await {
            Ok(response) => response,
            Err(err) => {
                tracing::debug!(error = %err, "K8s proxy request failed");
                K8sStatus(err).into_response()
            }
        }
    }

    /// Split `{prefix}/clusters/{id}{/rest}` into the id and the rest
    fn split_path<'a>(&self, path: &'a str) -> Option<(&'a str, &'a str)> {
        let after = path
            .strip_prefix(self.prefix.as_str())?
            .strip_prefix("/clusters/")?;
        let (cluster_id, rest) = match after.find('/') {
            Some(idx) => after.split_at(idx),
            None => (after, ""),
        };
        (!cluster_id.is_empty()).then_some((cluster_id, rest))
    }

    async fn forward(&self, mut request: Request) -> Result<Response, ProxyError> {
        let path = request.uri().path().to_string();
        let (cluster_id, sub_path) = self
            .split_path(&path)
            .ok_or_else(|| ProxyError::SessionNotFound(path.clone()))?;

        // checked before the store so unknown clusters cost nothing
        if !self.table.has_session(cluster_id) {
            return Err(ProxyError::SessionNotFound(cluster_id.to_string()));
        }

        let credential = self
            .store
            .get(cluster_id)
            .await?
            .ok_or_else(|| ProxyError::CredentialMissing(cluster_id.to_string()))?;
        let transport = self
            .transports
            .get_or_create(&cluster_id.to_string(), &credential)
            .map_err(|e| ProxyError::from_transport(cluster_id, e))?;

        let target = upstream_uri(
            &credential.server_address,
            Some("https"),
            sub_path,
            request.uri().query(),
        )?;
        tracing::debug!(cluster = %cluster_id, method = %request.method(), target = %target, "Proxying k8s request");

        let upgrade = is_upgrade(request.headers());
        let client_upgrade = upgrade.then(|| hyper::upgrade::on(&mut request));

        let (mut parts, body) = request.into_parts();
        parts.uri = target;
        parts.version = Version::HTTP_11;
        parts.headers.remove(AUTHORIZATION);
        parts.headers.remove(HOST);
        if !upgrade {
            strip_hop_by_hop(&mut parts.headers);
        }
        let upstream_request = Request::from_parts(parts, body);

        match client_upgrade {
            Some(client_upgrade) => {
                self.forward_upgrade(cluster_id, &transport, upstream_request, client_upgrade)
                    .await
            }
            None => self.forward_plain(cluster_id, &transport, upstream_request).await,
        }
    }

    async fn forward_plain(
        &self,
        cluster_id: &str,
        transport: &Transport,
        request: Request,
    ) -> Result<Response, ProxyError> {
        let timer = ProxyTimer::start(
            Arc::clone(&self.metrics),
            Backend::K8s,
            cluster_id,
            request.method().as_str(),
        );
        match transport.send(request).await {
            Ok(response) => {
                timer.complete(ProxyStatus::from_status_code(response.status().as_u16()));
                let (mut parts, body) = response.into_parts();
                strip_hop_by_hop(&mut parts.headers);
                Ok(Response::from_parts(parts, Body::new(body)))
            }
            Err(e) => {
                timer.complete(ProxyStatus::ServerError);
                Err(ProxyError::Upstream(e.to_string()))
            }
        }
    }

    async fn forward_upgrade(
        &self,
        cluster_id: &str,
        transport: &Transport,
        request: Request,
        client_upgrade: hyper::upgrade::OnUpgrade,
    ) -> Result<Response, ProxyError> {
        let mut response = transport
            .send(request)
            .await
            .map_err(|e| ProxyError::Upstream(e.to_string()))?;

        if response.status() != StatusCode::SWITCHING_PROTOCOLS {
            // upstream declined; relay its answer as-is
            let (parts, body) = response.into_parts();
            return Ok(Response::from_parts(parts, Body::new(body)));
        }

        self.metrics.record_upgrade(Backend::K8s, cluster_id);
        let upstream_upgrade = hyper::upgrade::on(&mut response);
        let cluster = cluster_id.to_string();
        tokio::spawn(async move {
            let (client, upstream) = match tokio::try_join!(client_upgrade, upstream_upgrade) {
                Ok(pair) => pair,
                Err(e) => {
                    tracing::warn!(cluster = %cluster, error = %e, "Failed to complete upgrade");
                    return;
                }
            };
            let mut client = TokioIo::new(client);
            let mut upstream = TokioIo::new(upstream);
            match tokio::io::copy_bidirectional(&mut client, &mut upstream).await {
                Ok((from_client, from_upstream)) => {
                    tracing::debug!(cluster = %cluster, from_client, from_upstream, "Upgrade stream ended");
                }
                Err(e) => {
                    tracing::debug!(cluster = %cluster, error = %e, "Upgrade stream error");
                }
            }
        });

        let (parts, _) = response.into_parts();
        Ok(Response::from_parts(parts, Body::empty()))
    }
}
