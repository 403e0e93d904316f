//! Credential store implementations

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::sync::RwLock;

use cg_core::{ClusterCredential, CredentialFilter, CredentialStore, ServerKey, StoreError};

type CredentialMap = HashMap<ServerKey, ClusterCredential>;

fn select(map: &CredentialMap, filter: &CredentialFilter) -> Vec<ClusterCredential> {
    let mut matching: Vec<_> = map.values().filter(|c| filter.matches(c)).cloned().collect();
    matching.sort_by(|a, b| a.server_key.cmp(&b.server_key));
    matching
}

/// Credentials held in process memory
#[derive(Debug, Default)]
pub struct MemoryCredentialStore {
    credentials: RwLock<CredentialMap>,
}

impl MemoryCredentialStore {
    /// Empty store
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CredentialStore for MemoryCredentialStore {
    async fn get(&self, cluster_id: &str) -> Result<Option<ClusterCredential>, StoreError> {
        Ok(self
            .credentials
            .read()
            .await
            .get(&ServerKey::from(cluster_id))
            .cloned())
    }

    async fn put(&self, credential: ClusterCredential) -> Result<(), StoreError> {
        self.credentials
            .write()
            .await
            .insert(credential.server_key.clone(), credential);
        Ok(())
    }

    async fn list(&self, filter: &CredentialFilter) -> Result<Vec<ClusterCredential>, StoreError> {
        Ok(select(&*self.credentials.read().await, filter))
    }
}

/// Credentials persisted as a JSON array in a single file.
///
/// Every put rewrites the file through a temporary sibling and a rename, so
/// readers of the file never see a partial write.
#[derive(Debug)]
pub struct FileCredentialStore {
    path: PathBuf,
    credentials: RwLock<CredentialMap>,
}

impl FileCredentialStore {
    /// Open the store at `path`, loading existing credentials
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let credentials = match tokio::fs::read(&path).await {
            Ok(raw) => {
                let list: Vec<ClusterCredential> = serde_json::from_slice(&raw)?;
                list.into_iter()
                    .map(|c| (c.server_key.clone(), c))
                    .collect()
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => CredentialMap::new(),
            Err(e) => return Err(e.into()),
        };
        tracing::info!(path = %path.display(), count = credentials.len(), "Loaded credential store");
        Ok(Self {
            path,
            credentials: RwLock::new(credentials),
        })
    }

    /// File backing the store
    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn persist(&self, map: &CredentialMap) -> Result<(), StoreError> {
        let content = serde_json::to_vec_pretty(&select(map, &CredentialFilter::default()))?;
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, content).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

#[async_trait]
impl CredentialStore for FileCredentialStore {
    async fn get(&self, cluster_id: &str) -> Result<Option<ClusterCredential>, StoreError> {
        Ok(self
            .credentials
            .read()
            .await
            .get(&ServerKey::from(cluster_id))
            .cloned())
    }

    async fn put(&self, credential: ClusterCredential) -> Result<(), StoreError> {
        let mut map = self.credentials.write().await;
        let previous = map.insert(credential.server_key.clone(), credential.clone());
        if let Err(e) = self.persist(&map).await {
            // keep memory and disk in agreement
            match previous {
                Some(old) => map.insert(old.server_key.clone(), old),
                None => map.remove(&credential.server_key),
            };
            return Err(e);
        }
        Ok(())
    }

    async fn list(&self, filter: &CredentialFilter) -> Result<Vec<ClusterCredential>, StoreError> {
        Ok(select(&*self.credentials.read().await, filter))
    }
}
