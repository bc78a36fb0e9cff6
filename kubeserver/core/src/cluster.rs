use serde::{Deserialize, Serialize};

/// A registered worker cluster.
///
/// Cluster records are owned by an external store; the core treats them as immutable for the
/// duration of a request.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Cluster {
    pub id: String,
    pub name: String,

    /// The API server URL as seen from the agent, e.g. `https://kube.internal:6443`.
    pub api_server: String,

    /// Base64-encoded PEM CA bundle used to verify the API server, as in a kubeconfig's
    /// `certificate-authority-data`.
    #[serde(default)]
    pub ca_data: Option<String>,

    #[serde(default)]
    pub bearer_token: Option<String>,

    /// Base64-encoded PEM client certificate, used when no bearer token is configured.
    #[serde(default)]
    pub client_cert_data: Option<String>,

    #[serde(default)]
    pub client_key_data: Option<String>,

    /// A full kubeconfig document. When set, it takes precedence over the fields above for
    /// credentials and CA material; the API server URL is always taken from `api_server`.
    #[serde(default)]
    pub kubeconfig: Option<String>,
}

/// Resolves cluster records.
#[async_trait::async_trait]
pub trait ClusterStore: Send + Sync {
    /// Looks up a cluster by id, falling back to its human name.
    ///
    /// `token` is the caller's credential, passed through so that stores may scope lookups.
    async fn fetch_cluster_by_id_or_name(
        &self,
        token: &str,
        id: &str,
    ) -> anyhow::Result<Option<Cluster>>;
}

impl Cluster {
    /// The tunnel client key under which this cluster's agent registers.
    pub fn client_key(&self) -> &str {
        &self.id
    }

    pub fn matches(&self, id_or_name: &str) -> bool {
        self.id == id_or_name || self.name == id_or_name
    }
}
