use crate::Router;
use hyper_util::{
    rt::{TokioExecutor, TokioIo, TokioTimer},
    server::{conn::auto, graceful::GracefulShutdown},
    service::TowerToHyperService,
};
use rustls::ServerConfig;
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::{TcpListener, TcpStream},
    task::JoinHandle,
};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, info_span, Instrument};

const HEADER_READ_TIMEOUT: Duration = Duration::from_secs(10);

/// A bound HTTPS listener.
pub struct Bound {
    local_addr: SocketAddr,
    tcp: TcpListener,
    tls: TlsAcceptor,
    http2: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum BindError {
    #[error("failed to bind {0}: {1}")]
    Bind(SocketAddr, #[source] std::io::Error),

    #[error("failed to get local address: {0}")]
    LocalAddr(#[source] std::io::Error),
}

/// Binds the HTTPS listener.
///
/// When `http2` is false, connections are served with HTTP/1.1 only.
pub async fn bind(
    addr: SocketAddr,
    tls: Arc<ServerConfig>,
    http2: bool,
) -> Result<Bound, BindError> {
    let tcp = TcpListener::bind(addr)
        .await
        .map_err(|e| BindError::Bind(addr, e))?;
    let local_addr = tcp.local_addr().map_err(BindError::LocalAddr)?;
    Ok(Bound {
        local_addr,
        tcp,
        tls: TlsAcceptor::from(tls),
        http2,
    })
}

// === impl Bound ===

impl Bound {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Serves `router` on every accepted connection until `drain` is signaled.
    ///
    /// In-flight requests, including upgraded connections, are allowed to complete before the
    /// drain is released.
    pub fn spawn(self, router: Router, drain: drain::Watch) -> JoinHandle<()> {
        let span = info_span!("server", port = %self.local_addr.port());
        tokio::spawn(self.accept_loop(router, drain).instrument(span))
    }

    async fn accept_loop(self, router: Router, drain: drain::Watch) {
        debug!("Listening");
        loop {
            let socket = tokio::select! {
                biased;

                release = drain.clone().signaled() => {
                    drop(release);
                    return;
                }

                res = self.tcp.accept() => match res {
                    Ok((socket, _)) => socket,
                    Err(error) => {
                        error!(%error, "Failed to accept connection");
                        continue;
                    }
                },
            };

            let client = match socket.peer_addr() {
                Ok(addr) => addr,
                Err(error) => {
                    error!(%error, "Failed to get peer address");
                    continue;
                }
            };
            if let Err(error) = socket.set_nodelay(true) {
                error!(%error, "Failed to set TCP_NODELAY");
                continue;
            }

            tokio::spawn(
                accept_tls(socket, self.tls.clone(), router.clone(), self.http2, drain.clone())
                    .instrument(info_span!(
                        "conn",
                        client.ip = %client.ip(),
                        client.port = %client.port(),
                    )),
            );
        }
    }
}

async fn accept_tls(
    socket: TcpStream,
    tls: TlsAcceptor,
    router: Router,
    http2: bool,
    drain: drain::Watch,
) {
    let socket = match tls.accept(socket).await {
        Ok(socket) => socket,
        Err(error) => {
            info!(%error, "TLS handshake failed");
            return;
        }
    };
    serve_conn(socket, router, http2, drain).await
}

/// Serves HTTP on an accepted connection, with support for protocol upgrades.
pub(crate) async fn serve_conn<I>(io: I, router: Router, http2: bool, drain: drain::Watch)
where
    I: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let mut builder = auto::Builder::new(TokioExecutor::new());
    if http2 {
        // Lets HTTP/2 clients open websockets with extended CONNECT.
        builder.http2().enable_connect_protocol();
    } else {
        builder = builder.http1_only();
    }
    // Keep idle scanners from holding connections open.
    builder
        .http1()
        .header_read_timeout(HEADER_READ_TIMEOUT)
        .timer(TokioTimer::new());

    let graceful = GracefulShutdown::new();
    let conn = graceful.watch(
        builder
            .serve_connection_with_upgrades(TokioIo::new(io), TowerToHyperService::new(router))
            .into_owned(),
    );
    let mut task = tokio::spawn(
        async move {
            match conn.await {
                Ok(()) => debug!("Connection closed"),
                Err(error) => info!(%error, "Connection lost"),
            }
        }
        .in_current_span(),
    );

    // Hold the drain open only while the connection is being served.
    tokio::select! {
        _ = &mut task => {}
        release = drain.signaled() => {
            release.release_after(graceful.shutdown()).await;
        }
    }
}
