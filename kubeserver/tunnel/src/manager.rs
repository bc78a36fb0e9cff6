use crate::{
    connect::Deny,
    frame::Destination,
    metrics::TunnelMetrics,
    session::{Session, SessionError, Side},
    stream::Stream,
    Config,
};
use http::{header, HeaderValue, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use parking_lot::RwLock;
use std::{collections::HashMap, sync::Arc};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    time::{self, Duration, Instant},
};
use tokio_tungstenite::{
    tungstenite::{handshake::derive_accept_key, protocol::Role},
    WebSocketStream,
};
use tracing::{debug, info, info_span, warn, Instrument};

/// The request header carrying an agent's client key.
pub const TUNNEL_ID_HEADER: &str = "x-tunnel-id";

const INITIAL_BACKOFF: Duration = Duration::from_millis(100);
const MAX_BACKOFF: Duration = Duration::from_secs(2);

/// Indexes live tunnel sessions by client key and dials through them.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<Inner>,
}

/// Authenticates an agent's websocket upgrade request, returning the client key under which its
/// session is registered.
pub trait Authorize: Send + Sync + 'static {
    fn authorize(&self, req: &http::request::Parts) -> Option<String>;
}

/// Admits agents presenting a shared bearer token, keyed by their `X-Tunnel-ID` header.
#[derive(Clone)]
pub struct TokenAuthorizer {
    token: Arc<str>,
}

/// Dials through the sessions registered under a single client key.
#[derive(Clone)]
pub struct Dialer {
    manager: SessionManager,
    key: Arc<str>,
}

#[derive(Clone, Debug, thiserror::Error, PartialEq, Eq)]
pub enum DialError {
    #[error("no tunnel session for {0}")]
    NoSession(String),

    #[error("dial timed out after {0:?}")]
    Timeout(Duration),

    #[error("dial rejected: {0}")]
    Rejected(String),

    #[error("tunnel session closed")]
    SessionClosed,
}

struct Inner {
    index: RwLock<HashMap<String, Vec<Session>>>,
    authorizer: Arc<dyn Authorize>,
    config: Config,
    metrics: TunnelMetrics,
}

// === impl SessionManager ===

impl SessionManager {
    pub fn new(authorizer: Arc<dyn Authorize>, config: Config, metrics: TunnelMetrics) -> Self {
        Self {
            inner: Arc::new(Inner {
                index: RwLock::new(HashMap::new()),
                authorizer,
                config,
                metrics,
            }),
        }
    }

    /// Handles an agent's websocket upgrade request.
    ///
    /// Unauthenticated requests are refused with a 401. Otherwise the handshake response is
    /// returned and, once the connection is upgraded, the session is served in the background.
    pub fn accept<B>(&self, req: Request<B>) -> Response<()>
    where
        B: Send + 'static,
    {
        let (parts, body) = req.into_parts();
        let Some(client_key) = self.inner.authorizer.authorize(&parts) else {
            debug!(uri = %parts.uri, "tunnel connection not authorized");
            return status(StatusCode::UNAUTHORIZED);
        };

        let accept = match websocket_accept(&parts) {
            Ok(accept) => accept,
            Err(reason) => {
                debug!(%reason, "invalid websocket upgrade");
                return status(StatusCode::BAD_REQUEST);
            }
        };

        let mut req = Request::from_parts(parts, body);
        let upgrade = hyper::upgrade::on(&mut req);
        let manager = self.clone();
        let span = info_span!("session", client = %client_key);
        tokio::spawn(
            async move {
                let upgraded = match upgrade.await {
                    Ok(upgraded) => upgraded,
                    Err(error) => {
                        warn!(%error, "websocket upgrade failed");
                        return;
                    }
                };
                let ws =
                    WebSocketStream::from_raw_socket(TokioIo::new(upgraded), Role::Server, None)
                        .await;
                // Errors are logged by the session.
                let _ = manager.serve(client_key, ws).await;
            }
            .instrument(span),
        );

        let mut rsp = Response::new(());
        *rsp.status_mut() = StatusCode::SWITCHING_PROTOCOLS;
        let headers = rsp.headers_mut();
        headers.insert(header::UPGRADE, HeaderValue::from_static("websocket"));
        headers.insert(header::CONNECTION, HeaderValue::from_static("Upgrade"));
        headers.insert(header::SEC_WEBSOCKET_ACCEPT, accept);
        rsp
    }

    /// Serves an established websocket as a session registered under `client_key`.
    ///
    /// The session is indexed until it terminates.
    pub async fn serve<S>(
        &self,
        client_key: String,
        ws: WebSocketStream<S>,
    ) -> Result<(), SessionError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (session, run) = Session::new(
            client_key.clone(),
            Side::Server,
            ws,
            Arc::new(Deny),
            self.inner.config.clone(),
            self.inner.metrics.clone(),
        );

        self.inner
            .index
            .write()
            .entry(client_key.clone())
            .or_default()
            .push(session.clone());
        info!("tunnel session established");

        let res = run.await;

        {
            let mut index = self.inner.index.write();
            if let Some(sessions) = index.get_mut(&client_key) {
                sessions.retain(|s| *s != session);
                if sessions.is_empty() {
                    index.remove(&client_key);
                }
            }
        }
        info!("tunnel session removed");
        res
    }

    /// Indicates whether any live session can serve dials for `key`.
    pub fn has_session(&self, key: &str) -> bool {
        self.session(key).is_some()
    }

    /// Returns the client keys of all registered sessions.
    pub fn client_keys(&self) -> Vec<String> {
        let mut keys = self.inner.index.read().keys().cloned().collect::<Vec<_>>();
        keys.sort();
        keys
    }

    /// Tears down every registered session.
    pub fn close_all(&self) {
        for sessions in self.inner.index.read().values() {
            for session in sessions {
                session.close();
            }
        }
    }

    pub fn dialer(&self, key: impl Into<Arc<str>>) -> Dialer {
        Dialer {
            manager: self.clone(),
            key: key.into(),
        }
    }

    /// Opens a stream to `dst` through a session registered under `key`.
    ///
    /// Fails immediately when no session can serve `key`. Dials that fail because their session
    /// closed underneath them are retried with backoff on another session until the total dial
    /// deadline passes.
    pub async fn dial(&self, key: &str, dst: Destination) -> Result<Stream, DialError> {
        let res = self.dial_with_retry(key, dst).await;
        self.inner.metrics.dialed(res.as_ref().map(|_| ()));
        res
    }

    async fn dial_with_retry(&self, key: &str, dst: Destination) -> Result<Stream, DialError> {
        let Config {
            dial_timeout,
            dial_total_timeout,
            ..
        } = self.inner.config;
        let deadline = Instant::now() + dial_total_timeout;
        let mut backoff = INITIAL_BACKOFF;
        loop {
            let session = self
                .session(key)
                .ok_or_else(|| DialError::NoSession(key.to_string()))?;
            let timeout = dial_timeout.min(deadline.saturating_duration_since(Instant::now()));
            match session.dial(dst.clone(), timeout).await {
                Err(DialError::SessionClosed) if Instant::now() + backoff < deadline => {
                    debug!(%key, %dst, ?backoff, "session closed while dialing; retrying");
                    time::sleep(backoff).await;
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                }
                res => return res,
            }
        }
    }

    /// Selects the newest live session registered under `key`, falling back to any session whose
    /// agent announced `key` as a client.
    fn session(&self, key: &str) -> Option<Session> {
        let index = self.inner.index.read();
        if let Some(session) = index
            .get(key)
            .and_then(|sessions| sessions.iter().rev().find(|s| !s.is_closed()))
        {
            return Some(session.clone());
        }
        index
            .values()
            .flatten()
            .find(|s| !s.is_closed() && s.serves(key))
            .cloned()
    }
}

fn websocket_accept(parts: &http::request::Parts) -> Result<HeaderValue, &'static str> {
    if parts.method != http::Method::GET {
        return Err("method must be GET");
    }
    let upgrade = parts
        .headers
        .get(header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if !upgrade.eq_ignore_ascii_case("websocket") {
        return Err("missing websocket upgrade");
    }
    if parts
        .headers
        .get(header::SEC_WEBSOCKET_VERSION)
        .map(|v| v.as_bytes())
        != Some(&b"13"[..])
    {
        return Err("unsupported websocket version");
    }
    let key = parts
        .headers
        .get(header::SEC_WEBSOCKET_KEY)
        .ok_or("missing websocket key")?;
    HeaderValue::from_str(&derive_accept_key(key.as_bytes())).map_err(|_| "invalid websocket key")
}

fn status(code: StatusCode) -> Response<()> {
    let mut rsp = Response::new(());
    *rsp.status_mut() = code;
    rsp
}

// === impl TokenAuthorizer ===

impl TokenAuthorizer {
    pub fn new(token: impl Into<Arc<str>>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

impl Authorize for TokenAuthorizer {
    fn authorize(&self, req: &http::request::Parts) -> Option<String> {
        let presented = req
            .headers
            .get(header::AUTHORIZATION)?
            .to_str()
            .ok()?
            .strip_prefix("Bearer ")?;
        if !constant_time_eq(presented.as_bytes(), self.token.as_bytes()) {
            return None;
        }

        let key = req.headers.get(TUNNEL_ID_HEADER)?.to_str().ok()?.trim();
        if key.is_empty() {
            return None;
        }
        Some(key.to_string())
    }
}

impl std::fmt::Debug for TokenAuthorizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenAuthorizer").finish_non_exhaustive()
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

// === impl Dialer ===

impl Dialer {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub async fn dial(&self, dst: Destination) -> Result<Stream, DialError> {
        self.manager.dial(&self.key, dst).await
    }

    pub fn has_session(&self) -> bool {
        self.manager.has_session(&self.key)
    }
}

impl std::fmt::Debug for Dialer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dialer").field("key", &self.key).finish()
    }
}

// === impl DialError ===

impl DialError {
    pub fn as_label(&self) -> &'static str {
        match self {
            Self::NoSession(_) => "no_session",
            Self::Timeout(_) => "timeout",
            Self::Rejected(_) => "rejected",
            Self::SessionClosed => "session_closed",
        }
    }
}

impl From<DialError> for std::io::Error {
    fn from(error: DialError) -> Self {
        let kind = match error {
            DialError::NoSession(_) => std::io::ErrorKind::NotConnected,
            DialError::Timeout(_) => std::io::ErrorKind::TimedOut,
            DialError::Rejected(_) => std::io::ErrorKind::ConnectionRefused,
            DialError::SessionClosed => std::io::ErrorKind::ConnectionAborted,
        };
        std::io::Error::new(kind, error)
    }
}
