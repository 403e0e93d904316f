//! Proxy-time errors and their two wire envelopes

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;

use cg_core::StoreError;

use crate::transport::TransportError;

/// Failures surfaced to proxy callers
#[derive(Error, Debug)]
pub enum ProxyError {
    /// No live tunnel for the cluster
    #[error("cluster {0} has no live tunnel session")]
    SessionNotFound(String),

    /// Credentials exist but none has a live session, or none exist
    #[error("no available mesos driver backend for cluster {0}")]
    BackendUnavailable(String),

    /// Live session but no credential on record
    #[error("no credential recorded for cluster {0}")]
    CredentialMissing(String),

    /// Credential store failed
    #[error("credential store failure: {0}")]
    Store(#[from] StoreError),

    /// Required request parameter missing
    #[error("missing parameter: {0}")]
    MissingParameter(&'static str),

    /// YAML body could not be converted
    #[error("cannot convert request body from YAML: {0}")]
    MediaConversion(String),

    /// Request body could not be read or exceeded the limit
    #[error("cannot read request body: {0}")]
    Body(String),

    /// Upstream request failed after a transport was obtained
    #[error("upstream request failed: {0}")]
    Upstream(String),

    /// Anything else on our side
    #[error("internal error: {0}")]
    Internal(String),
}

impl ProxyError {
    /// HTTP status for this error
    pub fn status(&self) -> StatusCode {
        match self {
            Self::SessionNotFound(_) | Self::BackendUnavailable(_) => StatusCode::NOT_FOUND,
            Self::CredentialMissing(_) | Self::Store(_) | Self::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            Self::MissingParameter(_) | Self::Body(_) => StatusCode::BAD_REQUEST,
            Self::MediaConversion(_) => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            Self::Upstream(_) => StatusCode::BAD_GATEWAY,
        }
    }

    /// Kubernetes `Status.reason`
    fn k8s_reason(&self) -> &'static str {
        match self {
            Self::SessionNotFound(_) | Self::BackendUnavailable(_) => "NotFound",
            Self::MissingParameter(_) | Self::Body(_) => "BadRequest",
            Self::MediaConversion(_) => "UnsupportedMediaType",
            Self::Upstream(_) => "ServiceUnavailable",
            Self::CredentialMissing(_) | Self::Store(_) | Self::Internal(_) => "InternalError",
        }
    }

    /// Transport build failures look like a missing session to callers
    pub fn from_transport(cluster_id: &str, err: TransportError) -> Self {
        tracing::warn!(cluster = %cluster_id, error = %err, "Failed to build transport");
        Self::SessionNotFound(cluster_id.to_string())
    }
}

/// Kubernetes `metav1.Status` failure object
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Status<'a> {
    kind: &'static str,
    api_version: &'static str,
    metadata: serde_json::Map<String, serde_json::Value>,
    status: &'static str,
    message: String,
    reason: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<StatusDetails<'a>>,
    code: u16,
}

#[derive(Debug, Serialize)]
struct StatusDetails<'a> {
    name: &'a str,
    kind: &'static str,
}

/// Renders a [`ProxyError`] the way kube-apiserver renders failures
#[derive(Debug)]
pub struct K8sStatus(pub ProxyError);

impl From<ProxyError> for K8sStatus {
    fn from(err: ProxyError) -> Self {
        Self(err)
    }
}

impl IntoResponse for K8sStatus {
    fn into_response(self) -> Response {
        let status = self.0.status();
        let details = match &self.0 {
            ProxyError::SessionNotFound(cluster) => Some(StatusDetails {
                name: cluster,
                kind: "clusters",
            }),
            _ => None,
        };
        let body = Status {
            kind: "Status",
            api_version: "v1",
            metadata: serde_json::Map::new(),
            status: "Failure",
            message: self.0.to_string(),
            reason: self.0.k8s_reason(),
            details,
            code: status.as_u16(),
        };
        (status, Json(body)).into_response()
    }
}

/// Generic `{result, code, message, data}` envelope of the mesos API
#[derive(Debug)]
pub struct MesosEnvelope(pub ProxyError);

impl From<ProxyError> for MesosEnvelope {
    fn from(err: ProxyError) -> Self {
        Self(err)
    }
}

impl IntoResponse for MesosEnvelope {
    fn into_response(self) -> Response {
        let status = self.0.status();
        let body = serde_json::json!({
            "result": false,
            "code": status.as_u16(),
            "message": self.0.to_string(),
            "data": null,
        });
        (status, Json(body)).into_response()
    }
}
