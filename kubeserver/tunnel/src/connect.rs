use crate::{filter::ConnectFilter, frame::Destination};
use std::{io, pin::Pin};
use tokio::io::{AsyncRead, AsyncWrite};

/// The reason sent when a `CONNECT` is refused by the local connect policy.
pub const NOT_AUTHORIZED: &str = "not authorized";

/// A bidirectional byte stream to a backend.
pub trait Io: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> Io for T {}

pub type BoxedIo = Pin<Box<dyn Io>>;

/// Serves the `CONNECT` frames a peer sends over a session.
#[async_trait::async_trait]
pub trait Connect: Send + Sync + 'static {
    /// Decides whether the peer may reach `dst` at all.
    fn allows(&self, dst: &Destination) -> bool;

    /// Dials `dst`.
    async fn connect(&self, dst: &Destination) -> io::Result<BoxedIo>;
}

/// Refuses every `CONNECT`.
///
/// Servers use this so that agents can't reach into the control plane's network.
#[derive(Copy, Clone, Debug, Default)]
pub struct Deny;

/// Dials TCP and UNIX-domain destinations on the local host, subject to a connect filter.
#[derive(Clone, Debug)]
pub struct LocalConnector {
    filter: ConnectFilter,
}

// === impl Deny ===

#[async_trait::async_trait]
impl Connect for Deny {
    fn allows(&self, _: &Destination) -> bool {
        false
    }

    async fn connect(&self, _: &Destination) -> io::Result<BoxedIo> {
        Err(io::Error::new(
            io::ErrorKind::PermissionDenied,
            NOT_AUTHORIZED,
        ))
    }
}

// === impl LocalConnector ===

impl LocalConnector {
    pub fn new(filter: ConnectFilter) -> Self {
        Self { filter }
    }
}

#[async_trait::async_trait]
impl Connect for LocalConnector {
    fn allows(&self, dst: &Destination) -> bool {
        self.filter.allows(dst)
    }

    async fn connect(&self, dst: &Destination) -> io::Result<BoxedIo> {
        match dst.proto.as_str() {
            "tcp" | "tcp4" | "tcp6" => {
                let tcp = tokio::net::TcpStream::connect(&dst.address).await?;
                tcp.set_nodelay(true)?;
                Ok(Box::pin(tcp))
            }

            #[cfg(unix)]
            "unix" => {
                let uds = tokio::net::UnixStream::connect(&dst.address).await?;
                Ok(Box::pin(uds))
            }

            proto => Err(io::Error::new(
                io::ErrorKind::Unsupported,
                format!("unsupported protocol {proto}"),
            )),
        }
    }
}
