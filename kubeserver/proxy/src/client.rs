use crate::{BoxError, ProxyError, TunnelConnector};
use hyper_util::rt::TokioExecutor;
use kube::{
    client::ConfigExt,
    config::{KubeConfigOptions, Kubeconfig},
};
use kubeserver_core::Cluster;
use kubeserver_tunnel::{Dialer, SessionManager};
use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;
use tower::{timeout::TimeoutLayer, ServiceBuilder};

/// Caches Kubernetes clients for worker clusters.
///
/// Clients are keyed by cluster id and API server so that a re-registered cluster is reached with
/// fresh settings. The least recently used client is evicted once the cache is full, closing its
/// idle connections.
pub struct ClientCache {
    manager: SessionManager,
    clients: Mutex<LruCache<(String, String), kube::Client>>,
}

impl ClientCache {
    pub fn new(manager: SessionManager, capacity: NonZeroUsize) -> Self {
        Self {
            manager,
            clients: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn dialer(&self, cluster: &Cluster) -> Dialer {
        self.manager.dialer(cluster.client_key())
    }

    /// Returns a client that reaches the cluster's API server through its tunnel.
    pub async fn client(&self, cluster: &Cluster) -> Result<kube::Client, ProxyError> {
        let key = (cluster.id.clone(), cluster.api_server.clone());
        let cached = self.clients.lock().get(&key).cloned();
        if let Some(client) = cached {
            return Ok(client);
        }

        let config = kube_config(cluster).await?;
        let client = tunnel_client(config, self.dialer(cluster)).map_err(|e| ProxyError::Config {
            cluster: cluster.id.clone(),
            source: e.into(),
        })?;
        tracing::debug!(cluster = %cluster.id, api_server = %cluster.api_server, "built client");
        self.clients.lock().put(key, client.clone());
        Ok(client)
    }

    pub fn len(&self) -> usize {
        self.clients.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Builds a client configuration from a cluster record.
///
/// A kubeconfig attached to the record supplies credentials and CA material; otherwise they are
/// taken from the record's own fields. The API server is always the record's.
pub async fn kube_config(cluster: &Cluster) -> Result<kube::Config, ProxyError> {
    let config_error = |source: BoxError| ProxyError::Config {
        cluster: cluster.id.clone(),
        source,
    };

    let kubeconfig = match cluster.kubeconfig.as_deref() {
        Some(yaml) => Kubeconfig::from_yaml(yaml).map_err(|e| config_error(e.into()))?,
        None => record_kubeconfig(cluster).map_err(|e| config_error(e.into()))?,
    };
    let mut config = kube::Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
        .await
        .map_err(|e| config_error(e.into()))?;
    config.cluster_url = cluster
        .api_server
        .parse()
        .map_err(|e: http::uri::InvalidUri| config_error(e.into()))?;
    Ok(config)
}

fn record_kubeconfig(cluster: &Cluster) -> Result<Kubeconfig, serde_json::Error> {
    let name = &cluster.id;
    serde_json::from_value(serde_json::json!({
        "apiVersion": "v1",
        "kind": "Config",
        "clusters": [{
            "name": name,
            "cluster": {
                "server": cluster.api_server,
                "certificate-authority-data": cluster.ca_data,
            },
        }],
        "users": [{
            "name": name,
            "user": {
                "token": cluster.bearer_token,
                "client-certificate-data": cluster.client_cert_data,
                "client-key-data": cluster.client_key_data,
            },
        }],
        "contexts": [{
            "name": name,
            "context": {
                "cluster": name,
                "user": name,
            },
        }],
        "current-context": name,
    }))
}

/// Builds a client whose connections are tunnel streams.
///
/// The config's connect timeout bounds each tunnel dial. Its read timeout bounds the wait for a
/// response head.
pub fn tunnel_client(config: kube::Config, dialer: Dialer) -> Result<kube::Client, kube::Error> {
    let connector = TunnelConnector::new(dialer).with_connect_timeout(config.connect_timeout);
    let https = config.rustls_https_connector_with_connector(connector)?;
    let service = ServiceBuilder::new()
        .layer(config.base_uri_layer())
        .option_layer(config.auth_layer()?)
        .map_err(BoxError::from)
        .option_layer(config.read_timeout.map(TimeoutLayer::new))
        .map_err(BoxError::from)
        .service(hyper_util::client::legacy::Client::builder(TokioExecutor::new()).build(https));
    Ok(kube::Client::new(service, config.default_namespace))
}
