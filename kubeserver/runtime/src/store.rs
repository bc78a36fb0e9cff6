use anyhow::{Context, Result};
use kubeserver_core::{Cluster, ClusterStore};
use std::path::Path;

/// Cluster records loaded from a JSON array.
#[derive(Clone, Debug, Default)]
pub struct FileClusterStore {
    clusters: Vec<Cluster>,
}

impl FileClusterStore {
    pub async fn load(path: &Path) -> Result<Self> {
        let json = tokio::fs::read(path)
            .await
            .with_context(|| format!("failed to read {}", path.display()))?;
        let clusters = serde_json::from_slice(&json)
            .with_context(|| format!("invalid cluster records in {}", path.display()))?;
        Ok(Self::new(clusters))
    }

    pub fn new(clusters: Vec<Cluster>) -> Self {
        Self { clusters }
    }

    pub fn len(&self) -> usize {
        self.clusters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clusters.is_empty()
    }
}

#[async_trait::async_trait]
impl ClusterStore for FileClusterStore {
    async fn fetch_cluster_by_id_or_name(&self, _token: &str, id: &str) -> Result<Option<Cluster>> {
        // Ids take precedence over names.
        let found = self
            .clusters
            .iter()
            .find(|c| c.id == id)
            .or_else(|| self.clusters.iter().find(|c| c.matches(id)));
        Ok(found.cloned())
    }
}
