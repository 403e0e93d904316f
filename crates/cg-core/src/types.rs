//! Core domain types

use base64::engine::general_purpose::{STANDARD, URL_SAFE};
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::RegistrationError;

/// Routing key under which a live tunnel session is registered
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ServerKey(pub String);

impl ServerKey {
    /// Create a new server key
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Get the raw key string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ServerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for ServerKey {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ServerKey {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Kind of tenant-side component that opened a tunnel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ClientModule {
    /// Proxies a cluster's kube-apiserver; one tunnel per cluster
    #[serde(rename = "kubeagent")]
    KubeAgent,
    /// Mesos driver; several instances may tunnel for one cluster
    #[serde(rename = "mesosdriver")]
    MesosDriver,
}

impl ClientModule {
    /// Wire name of the module
    pub const fn as_str(&self) -> &'static str {
        match self {
            ClientModule::KubeAgent => "kubeagent",
            ClientModule::MesosDriver => "mesosdriver",
        }
    }

    /// Check the module-specific requirements on registration params.
    ///
    /// Every module needs an address. A kube-agent must also hand over the
    /// apiserver's CA and a token, since requests are re-signed with them.
    pub fn validate(&self, params: &RegisterParams) -> Result<(), RegistrationError> {
        if params.address.trim().is_empty() {
            return Err(RegistrationError::MissingAddress);
        }
        if let ClientModule::KubeAgent = self {
            if params.ca_cert.as_deref().map_or(true, str::is_empty) {
                return Err(RegistrationError::MissingCaCert(self.as_str()));
            }
            if params.user_token.is_empty() {
                return Err(RegistrationError::MissingUserToken(self.as_str()));
            }
        }
        Ok(())
    }

    /// Derive the session key for a registration of this module kind.
    ///
    /// kube-agent: the cluster id. mesos-driver: `<cluster>-<host>` so each
    /// driver instance of a cluster gets its own session.
    pub fn server_key(&self, cluster_id: &str, address: &str) -> Result<ServerKey, RegistrationError> {
        match self {
            ClientModule::KubeAgent => Ok(ServerKey::new(cluster_id)),
            ClientModule::MesosDriver => {
                let host = address_host(address)
                    .ok_or_else(|| RegistrationError::InvalidAddress(address.to_string()))?;
                Ok(ServerKey::new(format!("{}-{}", cluster_id, host)))
            }
        }
    }
}

impl fmt::Display for ClientModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ClientModule {
    type Err = RegistrationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "" => Err(RegistrationError::MissingModule),
            "kubeagent" => Ok(ClientModule::KubeAgent),
            "mesosdriver" => Ok(ClientModule::MesosDriver),
            other => Err(RegistrationError::UnknownModule(other.to_string())),
        }
    }
}

/// How the manager reaches the cluster's control plane
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectMode {
    /// Through an agent-initiated tunnel
    #[default]
    Tunnel,
    /// Direct network route
    Direct,
}

/// Persisted routing and auth material for one tunnel session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterCredential {
    /// Session routing key
    pub server_key: ServerKey,
    /// Cluster the session belongs to
    pub cluster_id: String,
    /// Module kind that registered
    pub client_module: ClientModule,
    /// Control-plane address as seen from the agent
    pub server_address: String,
    /// PEM CA bundle for the control plane, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca_cert_data: Option<String>,
    /// Bearer token injected on proxied requests
    #[serde(default)]
    pub user_token: String,
    /// Connect mode
    #[serde(default)]
    pub connect_mode: ConnectMode,
}

/// Selection criteria for listing credentials
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CredentialFilter {
    /// Only credentials of this cluster
    pub cluster_id: Option<String>,
    /// Only credentials registered by this module kind
    pub client_module: Option<ClientModule>,
}

impl CredentialFilter {
    /// Credentials of one cluster registered by one module kind
    pub fn cluster_module(cluster_id: impl Into<String>, module: ClientModule) -> Self {
        Self {
            cluster_id: Some(cluster_id.into()),
            client_module: Some(module),
        }
    }

    /// Whether a credential satisfies every set criterion
    pub fn matches(&self, credential: &ClusterCredential) -> bool {
        self.cluster_id
            .as_deref()
            .map_or(true, |id| credential.cluster_id == id)
            && self
                .client_module
                .map_or(true, |m| credential.client_module == m)
    }
}

/// Payload an agent sends (base64 JSON) when registering a tunnel
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterParams {
    /// Control-plane address reachable from the agent
    #[serde(default)]
    pub address: String,
    /// Token for the control plane
    #[serde(default)]
    pub user_token: String,
    /// PEM CA bundle for the control plane
    #[serde(default)]
    pub ca_cert: Option<String>,
}

impl RegisterParams {
    /// Decode params from their header form: base64 (standard, falling back
    /// to URL-safe alphabet) of a JSON object.
    pub fn decode(encoded: &str) -> Result<Self, RegistrationError> {
        let encoded = encoded.trim();
        let raw = STANDARD
            .decode(encoded)
            .or_else(|_| URL_SAFE.decode(encoded))
            .map_err(|e| RegistrationError::MalformedParams(format!("base64: {}", e)))?;
        serde_json::from_slice(&raw)
            .map_err(|e| RegistrationError::MalformedParams(format!("json: {}", e)))
    }

    /// Encode params into their header form
    pub fn encode(&self) -> String {
        // serializing a struct of strings cannot fail
        let json = serde_json::to_vec(self).unwrap_or_default();
        STANDARD.encode(json)
    }
}

/// Host part of an address given as a URL (`https://10.0.0.5:6443`) or as a
/// bare authority (`10.0.0.5:6443`). IPv6 brackets are removed.
pub fn address_host(address: &str) -> Option<String> {
    let uri: http::Uri = address.trim().parse().ok()?;
    let host = uri.host()?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() {
        None
    } else {
        Some(host.to_string())
    }
}
