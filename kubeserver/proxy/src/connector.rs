use futures::future::BoxFuture;
use http::Uri;
use hyper_util::{
    client::legacy::connect::{Connected, Connection},
    rt::TokioIo,
};
use kubeserver_tunnel::{Destination, DialError, Dialer, Stream};
use std::{
    io,
    pin::Pin,
    task::{Context, Poll},
    time::Duration,
};
use tokio::time;

/// Connects HTTP clients to upstream hosts through a cluster's tunnel.
///
/// Each connection is a tunnel stream dialed to the URI's `host:port` on the agent's side.
#[derive(Clone, Debug)]
pub struct TunnelConnector {
    dialer: Dialer,
    connect_timeout: Option<Duration>,
}

/// A tunnel stream adapted to hyper's I/O traits.
#[derive(Debug)]
pub struct TunnelIo(TokioIo<Stream>);

// === impl TunnelConnector ===

impl TunnelConnector {
    pub fn new(dialer: Dialer) -> Self {
        Self {
            dialer,
            connect_timeout: None,
        }
    }

    /// Bounds each dial, including the agent's connect to the upstream host.
    pub fn with_connect_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

impl tower::Service<Uri> for TunnelConnector {
    type Response = TunnelIo;
    type Error = DialError;
    type Future = BoxFuture<'static, Result<TunnelIo, DialError>>;

    fn poll_ready(&mut self, _: &mut Context<'_>) -> Poll<Result<(), DialError>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, uri: Uri) -> Self::Future {
        let dialer = self.dialer.clone();
        let connect_timeout = self.connect_timeout;
        Box::pin(async move {
            let dst = destination(&uri)?;
            tracing::debug!(key = %dialer.key(), %dst, "connecting through tunnel");
            let stream = match connect_timeout {
                Some(timeout) => time::timeout(timeout, dialer.dial(dst))
                    .await
                    .map_err(|_| DialError::Timeout(timeout))??,
                None => dialer.dial(dst).await?,
            };
            Ok(TunnelIo(TokioIo::new(stream)))
        })
    }
}

/// Maps an upstream URI to the TCP destination the agent dials.
pub(crate) fn destination(uri: &Uri) -> Result<Destination, DialError> {
    let host = uri
        .host()
        .filter(|h| !h.is_empty())
        .ok_or_else(|| DialError::Rejected(format!("upstream URI {uri} has no host")))?;
    let port = uri.port_u16().unwrap_or_else(|| {
        if uri.scheme() == Some(&http::uri::Scheme::HTTPS) {
            443
        } else {
            80
        }
    });
    Ok(Destination::new("tcp", format!("{host}:{port}")))
}

// === impl TunnelIo ===

impl hyper::rt::Read for TunnelIo {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: hyper::rt::ReadBufCursor<'_>,
    ) -> Poll<io::Result<()>> {
        hyper::rt::Read::poll_read(Pin::new(&mut self.0), cx, buf)
    }
}

impl hyper::rt::Write for TunnelIo {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        hyper::rt::Write::poll_write(Pin::new(&mut self.0), cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        hyper::rt::Write::poll_flush(Pin::new(&mut self.0), cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        hyper::rt::Write::poll_shutdown(Pin::new(&mut self.0), cx)
    }
}

impl Connection for TunnelIo {
    fn connected(&self) -> Connected {
        Connected::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn destinations() {
        let dst = |uri: &str| destination(&uri.parse().unwrap());
        assert_eq!(
            dst("https://kube.internal:6443/api"),
            Ok(Destination::new("tcp", "kube.internal:6443"))
        );
        assert_eq!(
            dst("https://kube.internal/"),
            Ok(Destination::new("tcp", "kube.internal:443"))
        );
        assert_eq!(
            dst("http://10.0.0.1"),
            Ok(Destination::new("tcp", "10.0.0.1:80"))
        );
        assert_eq!(
            dst("https://[fd00::1]:6443"),
            Ok(Destination::new("tcp", "[fd00::1]:6443"))
        );
        assert!(dst("/api/v1").is_err());
    }
}
