//! Tunnel registration authorization
//!
//! Agents register by upgrading a request that carries three headers: the
//! module kind, the cluster id and base64-encoded JSON params. A valid
//! registration is persisted as a [`ClusterCredential`] before the session
//! is accepted.

use std::sync::Arc;

use async_trait::async_trait;
use http::HeaderMap;

use cg_core::{
    ClientModule, ClusterCredential, ConnectMode, CredentialStore, RegisterParams,
    RegistrationError,
};
use cg_tunnel::Authorizer;

/// Module kind of the registering agent
pub const MODULE_HEADER: &str = "BCS-API-Tunnel-Module";

/// Cluster the agent serves
pub const CLUSTER_ID_HEADER: &str = "BCS-API-Tunnel-ClusterId";

/// base64(JSON) registration params
pub const PARAMS_HEADER: &str = "BCS-API-Tunnel-Params";

/// Validates agent registrations and records their credentials
pub struct TunnelAuthorizer {
    store: Arc<dyn CredentialStore>,
}

impl TunnelAuthorizer {
    /// Authorizer writing to `store`
    pub fn new(store: Arc<dyn CredentialStore>) -> Self {
        Self { store }
    }

    fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
    }
}

#[async_trait]
impl Authorizer for TunnelAuthorizer {
    async fn authorize(&self, headers: &HeaderMap) -> Result<String, RegistrationError> {
        let module: ClientModule = Self::header(headers, MODULE_HEADER)
            .unwrap_or_default()
            .parse()?;
        let cluster_id =
            Self::header(headers, CLUSTER_ID_HEADER).ok_or(RegistrationError::MissingClusterId)?;
        let params = RegisterParams::decode(
            Self::header(headers, PARAMS_HEADER).ok_or(RegistrationError::MissingParams)?,
        )?;
        module.validate(&params)?;

        let server_key = module.server_key(cluster_id, &params.address)?;
        let credential = ClusterCredential {
            server_key: server_key.clone(),
            cluster_id: cluster_id.to_string(),
            client_module: module,
            server_address: params.address,
            ca_cert_data: params.ca_cert.filter(|ca| !ca.is_empty()),
            user_token: params.user_token,
            connect_mode: ConnectMode::Tunnel,
        };
        self.store.put(credential).await?;

        tracing::info!(
            cluster = %cluster_id,
            server_key = %server_key,
            module = %module,
            "Tunnel registration accepted"
        );
        Ok(server_key.0)
    }

    async fn on_disconnect(&self, key: &str) {
        // credentials outlive their sessions
        tracing::debug!(server_key = %key, "Tunnel session disconnected");
    }
}
