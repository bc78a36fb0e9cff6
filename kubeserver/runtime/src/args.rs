use crate::{server, tls, FileClusterStore, Router, Webhook};
use anyhow::anyhow;
use clap::Parser;
use kubeserver_core::{ClusterStore, IdentityService};
use kubeserver_identity::{KeystoneClient, RoleAssignmentCache};
use kubeserver_k8s_rbac::Reconciler;
use kubeserver_proxy::ClientCache;
use kubeserver_tunnel::{
    Agent, Config, ConnectFilter, LocalConnector, Rule, SessionManager, TokenAuthorizer,
    TunnelMetrics,
};
use prometheus_client::registry::Registry;
use std::{net::SocketAddr, num::NonZeroUsize, path::PathBuf, sync::Arc, time::Duration};
use tracing::{info, info_span, warn, Instrument};

/// Arguments of the `kubeserver` process.
#[derive(Debug, Parser)]
#[clap(name = "kubeserver", about = "Multi-cluster Kubernetes API gateway")]
pub struct ServerArgs {
    #[clap(long, default_value = "kubeserver=info,warn", env = "KUBESERVER_LOG")]
    log_level: kubert::LogFilter,

    #[clap(long, default_value = "plain")]
    log_format: kubert::LogFormat,

    #[clap(flatten)]
    admin: kubert::AdminArgs,

    #[clap(long, default_value = "0.0.0.0:8443")]
    listen_https_addr: SocketAddr,

    #[clap(long)]
    tls_cert_file: PathBuf,

    #[clap(long)]
    tls_key_file: PathBuf,

    /// The base URL of the Keystone-compatible identity service.
    #[clap(long)]
    identity_service_url: String,

    #[clap(long, env = "KUBESERVER_IDENTITY_ADMIN_TOKEN", hide_env_values = true)]
    identity_admin_token: String,

    #[clap(long, default_value = "3600")]
    identity_refresh_interval_secs: u64,

    /// Creates a default `LimitRange` in every project namespace.
    #[clap(long)]
    default_limit_range_enabled: bool,

    /// A JSON file holding the registered cluster records.
    #[clap(long)]
    clusters_file: Option<PathBuf>,

    /// The bearer token agents present when opening a tunnel.
    #[clap(long, env = "KUBESERVER_TUNNEL_TOKEN", hide_env_values = true)]
    tunnel_token: String,

    #[clap(long, default_value = "15")]
    dial_timeout_secs: u64,

    #[clap(long, default_value = "45")]
    dial_total_timeout_secs: u64,

    #[clap(long, default_value = "4")]
    reconcile_workers: usize,

    #[clap(long, default_value = "64")]
    client_cache_size: NonZeroUsize,

    /// Serves HTTP/1.1 only, for clients that require HTTP/1.1 upgrades.
    #[clap(long, env = "DISABLE_HTTP2")]
    disable_http2: bool,
}

/// Arguments of the `kubeserver-agent` process.
#[derive(Debug, Parser)]
#[clap(name = "kubeserver-agent", about = "Opens a cluster's tunnel to kubeserver")]
pub struct AgentArgs {
    #[clap(long, default_value = "kubeserver=info,warn", env = "KUBESERVER_LOG")]
    log_level: kubert::LogFilter,

    #[clap(long, default_value = "plain")]
    log_format: kubert::LogFormat,

    #[clap(flatten)]
    admin: kubert::AdminArgs,

    /// The server's tunnel endpoint, e.g. `wss://kubeserver.example.com/connect`.
    #[clap(long)]
    connect: String,

    /// The tunnel id, which is the id of the cluster this agent serves.
    #[clap(long)]
    id: String,

    #[clap(long, env = "KUBESERVER_TUNNEL_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// A PEM bundle of CA certificates trusted for the server's certificate.
    #[clap(long)]
    ca_file: Option<PathBuf>,

    /// Destinations the server may dial through this agent, as `proto/pattern`.
    #[clap(long = "allow", default_value = "tcp/*")]
    allow: Vec<Rule>,

    /// Additional client keys reachable through this agent.
    #[clap(long = "client")]
    clients: Vec<String>,
}

/// A fatal process error.
#[derive(Debug, thiserror::Error)]
pub enum Fatal {
    #[error("initialization failed: {0:#}")]
    Init(anyhow::Error),

    #[error("{0:#}")]
    Bind(anyhow::Error),
}

// === impl Fatal ===

impl Fatal {
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::Init(_) => 1,
            Self::Bind(_) => 2,
        }
    }

    fn init(error: impl Into<anyhow::Error>) -> Self {
        Self::Init(error.into())
    }

    fn bind(error: impl Into<anyhow::Error>) -> Self {
        Self::Bind(error.into())
    }
}

// === impl ServerArgs ===

impl ServerArgs {
    #[inline]
    pub async fn parse_and_run() -> Result<(), Fatal> {
        Self::parse().run().await
    }

    pub async fn run(self) -> Result<(), Fatal> {
        let Self {
            log_level,
            log_format,
            admin,
            listen_https_addr,
            tls_cert_file,
            tls_key_file,
            identity_service_url,
            identity_admin_token,
            identity_refresh_interval_secs,
            default_limit_range_enabled,
            clusters_file,
            tunnel_token,
            dial_timeout_secs,
            dial_total_timeout_secs,
            reconcile_workers,
            client_cache_size,
            disable_http2,
        } = self;

        log_format.try_init(log_level).map_err(Fatal::init)?;

        let http2 = !disable_http2;
        let tls = tls::server_config(&tls_cert_file, &tls_key_file, http2)
            .await
            .map_err(Fatal::Init)?;

        let identity: Arc<dyn IdentityService> = Arc::new(
            KeystoneClient::new(&identity_service_url, identity_admin_token)
                .map_err(Fatal::init)?,
        );
        let clusters: Arc<dyn ClusterStore> = match clusters_file {
            Some(path) => {
                let store = FileClusterStore::load(&path).await.map_err(Fatal::Init)?;
                info!(clusters = store.len(), path = %path.display(), "Loaded cluster records");
                Arc::new(store)
            }
            None => {
                warn!("No cluster records configured");
                Arc::new(FileClusterStore::default())
            }
        };

        let mut prom = <Registry>::default();
        let metrics = TunnelMetrics::register(prom.sub_registry_with_prefix("tunnel"));

        let config = Config {
            dial_timeout: Duration::from_secs(dial_timeout_secs),
            dial_total_timeout: Duration::from_secs(dial_total_timeout_secs),
            ..Config::default()
        };
        let tunnels = SessionManager::new(
            Arc::new(TokenAuthorizer::new(tunnel_token)),
            config,
            metrics,
        );
        let clients = Arc::new(ClientCache::new(tunnels.clone(), client_cache_size));
        let assignments = Arc::new(RoleAssignmentCache::new(identity.clone()));
        let webhook = Webhook::new(
            identity.clone(),
            assignments.clone(),
            clusters.clone(),
            clients.clone(),
            Reconciler::new(reconcile_workers, default_limit_range_enabled),
        );
        let router = Router::new(tunnels.clone(), clients, clusters, identity, webhook);

        let admin = admin
            .into_builder()
            .with_prometheus(prom)
            .bind()
            .map_err(Fatal::bind)?;
        let server = server::bind(listen_https_addr, tls, http2)
            .await
            .map_err(Fatal::bind)?;
        let (shutdown, drain) = kubert::shutdown::sigint_or_sigterm().map_err(Fatal::init)?;

        tokio::spawn(
            assignments
                .run(
                    Duration::from_secs(identity_refresh_interval_secs),
                    drain.clone(),
                )
                .instrument(info_span!("identity_cache")),
        );
        info!(addr = %server.local_addr(), http2, "Serving");
        server.spawn(router, drain);

        admin.set_ready();
        admin.spawn();

        // Block on the shutdown signal. Once it fires, the listener and refresher drain before
        // tunnels are closed.
        let res = shutdown.signaled().await;
        tunnels.close_all();
        if res.is_err() {
            return Err(Fatal::Init(anyhow!("aborted")));
        }
        Ok(())
    }
}

// === impl AgentArgs ===

impl AgentArgs {
    #[inline]
    pub async fn parse_and_run() -> Result<(), Fatal> {
        Self::parse().run().await
    }

    pub async fn run(self) -> Result<(), Fatal> {
        let Self {
            log_level,
            log_format,
            admin,
            connect,
            id,
            token,
            ca_file,
            allow,
            clients,
        } = self;

        log_format.try_init(log_level).map_err(Fatal::init)?;

        let mut prom = <Registry>::default();
        let metrics = TunnelMetrics::register(prom.sub_registry_with_prefix("tunnel"));

        let filter = allow.into_iter().collect::<ConnectFilter>();
        let mut agent = Agent::new(connect, id, Arc::new(LocalConnector::new(filter)))
            .with_clients(clients)
            .with_metrics(metrics);
        if let Some(token) = token {
            agent = agent.with_token(token);
        }
        if let Some(ca) = ca_file {
            agent = agent.with_tls(tls::client_config(&ca).await.map_err(Fatal::Init)?);
        }

        let admin = admin
            .into_builder()
            .with_prometheus(prom)
            .bind()
            .map_err(Fatal::bind)?;
        let (shutdown, _drain) = kubert::shutdown::sigint_or_sigterm().map_err(Fatal::init)?;
        admin.set_ready();
        admin.spawn();

        tokio::select! {
            _ = agent.run() => Ok(()),
            res = shutdown.signaled() => {
                info!("Shutting down");
                res.map_err(|_| Fatal::Init(anyhow!("aborted")))
            }
        }
    }
}
