use crate::{
    connect::Connect,
    manager::TUNNEL_ID_HEADER,
    metrics::TunnelMetrics,
    session::{Session, SessionError, Side},
    Config,
};
use http::{header, HeaderValue};
use std::sync::Arc;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    time::Duration,
};
use tokio_tungstenite::{
    tungstenite::{self, client::IntoClientRequest},
    Connector, WebSocketStream,
};
use tracing::{debug, info, info_span, warn, Instrument};

/// The delay between tunnel reconnection attempts.
pub const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Maintains an agent's tunnel connection to the server.
#[derive(Clone)]
pub struct Agent {
    url: String,
    id: String,
    token: Option<String>,
    clients: Vec<String>,
    tls: Option<Arc<rustls::ClientConfig>>,
    connector: Arc<dyn Connect>,
    config: Config,
    metrics: TunnelMetrics,
}

#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("invalid tunnel request: {0}")]
    Request(#[source] tungstenite::Error),

    #[error("failed to connect: {0}")]
    Connect(#[source] tungstenite::Error),

    #[error(transparent)]
    Session(#[from] SessionError),
}

// === impl Agent ===

impl Agent {
    pub fn new(url: impl Into<String>, id: impl Into<String>, connector: Arc<dyn Connect>) -> Self {
        Self {
            url: url.into(),
            id: id.into(),
            token: None,
            clients: Vec::new(),
            tls: None,
            connector,
            config: Config::default(),
            metrics: TunnelMetrics::default(),
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    /// Sets the TLS configuration used for `wss` URLs. The webpki roots are used otherwise.
    pub fn with_tls(mut self, tls: Arc<rustls::ClientConfig>) -> Self {
        self.tls = Some(tls);
        self
    }

    /// Announces additional client keys the server may dial through this agent.
    pub fn with_clients(mut self, clients: impl IntoIterator<Item = String>) -> Self {
        self.clients = clients.into_iter().collect();
        self
    }

    pub fn with_config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    pub fn with_metrics(mut self, metrics: TunnelMetrics) -> Self {
        self.metrics = metrics;
        self
    }

    /// Connects to the server, reconnecting after [`RECONNECT_DELAY`] whenever the connection
    /// fails or closes. Never returns.
    pub async fn run(self) {
        loop {
            let span = info_span!("tunnel", url = %self.url, id = %self.id);
            match self.connect().instrument(span).await {
                Ok(()) => info!("tunnel closed; reconnecting"),
                Err(error) => warn!(%error, "tunnel failed; reconnecting"),
            }
            tokio::time::sleep(RECONNECT_DELAY).await;
        }
    }

    /// Connects to the server once and serves the session until it closes.
    pub async fn connect(&self) -> Result<(), AgentError> {
        let mut req = self
            .url
            .as_str()
            .into_client_request()
            .map_err(AgentError::Request)?;
        let id = HeaderValue::from_str(&self.id)
            .map_err(|e| AgentError::Request(tungstenite::Error::HttpFormat(e.into())))?;
        req.headers_mut().insert(TUNNEL_ID_HEADER, id);
        if let Some(token) = self.token.as_deref() {
            let auth = HeaderValue::from_str(&format!("Bearer {token}"))
                .map_err(|e| AgentError::Request(tungstenite::Error::HttpFormat(e.into())))?;
            req.headers_mut().insert(header::AUTHORIZATION, auth);
        }

        let connector = self.tls.clone().map(Connector::Rustls);
        let (ws, rsp) =
            tokio_tungstenite::connect_async_tls_with_config(req, None, false, connector)
                .await
                .map_err(AgentError::Connect)?;
        debug!(status = %rsp.status(), "connected");

        self.serve(ws).await?;
        Ok(())
    }

    /// Serves an established websocket until it closes.
    pub async fn serve<S>(&self, ws: WebSocketStream<S>) -> Result<(), SessionError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (session, run) = Session::new(
            self.id.clone(),
            Side::Agent,
            ws,
            self.connector.clone(),
            self.config.clone(),
            self.metrics.clone(),
        );
        let run = tokio::spawn(run.in_current_span());
        info!("tunnel session established");

        for client in &self.clients {
            if let Err(error) = session.add_client(client).await {
                debug!(%error, %client, "failed to announce client");
            }
        }

        match run.await {
            Ok(res) => res,
            Err(error) => {
                warn!(%error, "session task failed");
                Ok(())
            }
        }
    }
}

impl std::fmt::Debug for Agent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Agent")
            .field("url", &self.url)
            .field("id", &self.id)
            .field("clients", &self.clients)
            .finish_non_exhaustive()
    }
}
