//! Proxies Kubernetes API requests to worker clusters through their tunnels.

#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

mod client;
mod connector;
mod error;
mod proxy;


pub use self::{
    client::{kube_config, tunnel_client, ClientCache},
    connector::{TunnelConnector, TunnelIo},
    error::{error_response, ErrorBody, ProxyError},
    proxy::{
        split_cluster_path, ClusterProxy, Impersonation, CLUSTER_PATH_PREFIX, IMPERSONATE_GROUP,
        IMPERSONATE_USER,
    },
};

pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// The body of proxied responses.
pub type ProxyBody = http_body_util::combinators::UnsyncBoxBody<bytes::Bytes, BoxError>;
