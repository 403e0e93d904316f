//! Credential store contract

use async_trait::async_trait;

use crate::error::StoreError;
use crate::types::{ClusterCredential, CredentialFilter};

/// Read/write access to persisted cluster credentials.
///
/// Implementations must be safe to call concurrently from the registration
/// path and from every proxied request.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Credential whose server key equals `cluster_id`.
    ///
    /// For kube-agent registrations the server key is the cluster id, so
    /// this is the k8s proxy's lookup.
    async fn get(&self, cluster_id: &str) -> Result<Option<ClusterCredential>, StoreError>;

    /// Insert or replace the credential with the same server key
    async fn put(&self, credential: ClusterCredential) -> Result<(), StoreError>;

    /// All credentials matching `filter`
    async fn list(&self, filter: &CredentialFilter) -> Result<Vec<ClusterCredential>, StoreError>;
}
