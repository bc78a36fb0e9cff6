use crate::{
    connect::{BoxedIo, Connect, NOT_AUTHORIZED},
    frame::{Destination, Frame, FrameError, Kind, EOF},
    metrics::TunnelMetrics,
    stream::{Direction, Shared, Stream, Terminal},
    Config, DialError,
};
use bytes::Bytes;
use futures::prelude::*;
use parking_lot::{Mutex, RwLock};
use std::{
    collections::{HashMap, HashSet},
    io,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::{mpsc, oneshot},
    time::{self, Duration, Instant},
};
use tokio_tungstenite::{
    tungstenite::{self, Message},
    WebSocketStream,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, debug_span, trace, warn, Instrument};

/// One live tunnel websocket and the streams multiplexed over it.
///
/// A single writer task owns the websocket sink. Streams, control replies and pings are all
/// submitted through a bounded queue, so frames submitted by one task reach the wire in
/// submission order and no producer holds a lock across a write.
/// The writer applies the configured write timeout to each message; an expired write tears the
/// session down, which in turn fails every producer blocked on the queue.
#[derive(Clone)]
pub struct Session(Arc<SessionInner>);

/// The side of the tunnel a session runs on.
///
/// Each side allocates connection ids of its own parity so that both may open streams without
/// coordination: the server's are even and the agent's are odd. Id 1 is the control stream.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Side {
    Server,
    Agent,
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("protocol error: {0}")]
    Protocol(#[from] FrameError),

    #[error("protocol violation: {0}")]
    Violation(String),

    #[error("websocket error: {0}")]
    Transport(#[from] tungstenite::Error),

    #[error("websocket write timed out")]
    WriteTimeout,

    #[error("peer silent for {0:?}")]
    Idle(Duration),
}

pub(crate) enum Outbound {
    Frame(Frame),
    Ping(Bytes),
    Pong(Bytes),
}

pub(crate) struct SessionInner {
    client_key: String,
    side: Side,
    config: Config,
    connector: Arc<dyn Connect>,
    metrics: TunnelMetrics,
    tx: mpsc::Sender<Outbound>,
    table: RwLock<Table>,
    clients: RwLock<HashSet<String>>,
    next_id: AtomicU64,
    /// When the peer was last heard from.
    last_seen: Mutex<Instant>,
    shutdown: CancellationToken,
}

struct Table {
    streams: HashMap<u64, Arc<Shared>>,
    /// Set, with the reason, once the session has torn down.
    closed: Option<String>,
}

// === impl Side ===

impl Side {
    fn first_id(self) -> u64 {
        match self {
            Self::Server => 2,
            Self::Agent => 3,
        }
    }

    fn owns(self, id: u64) -> bool {
        match self {
            Self::Server => id % 2 == 0,
            Self::Agent => id % 2 == 1,
        }
    }
}

// === impl Session ===

impl Session {
    /// Builds a session over an established websocket.
    ///
    /// The returned future drives the session and must be polled for it to make progress. It
    /// completes when the websocket closes or fails, at which point every stream has been failed
    /// with the session's terminal error.
    pub fn new<S>(
        client_key: impl Into<String>,
        side: Side,
        ws: WebSocketStream<S>,
        connector: Arc<dyn Connect>,
        config: Config,
        metrics: TunnelMetrics,
    ) -> (
        Self,
        impl Future<Output = Result<(), SessionError>> + Send + 'static,
    )
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(config.write_queue_capacity);
        metrics.session_opened();
        let inner = Arc::new(SessionInner {
            client_key: client_key.into(),
            side,
            next_id: AtomicU64::new(side.first_id()),
            config,
            connector,
            metrics,
            tx,
            table: RwLock::new(Table {
                streams: HashMap::new(),
                closed: None,
            }),
            clients: RwLock::new(HashSet::new()),
            last_seen: Mutex::new(Instant::now()),
            shutdown: CancellationToken::new(),
        });

        let session = Self(inner.clone());
        let serve = async move {
            let res = inner.run(ws, rx).await;
            inner.terminate(&res);
            res
        };
        (session, serve)
    }

    pub fn client_key(&self) -> &str {
        &self.0.client_key
    }

    pub fn side(&self) -> Side {
        self.0.side
    }

    /// Indicates whether dials for `key` may be served by this session, either because the agent
    /// registered under it or because the agent announced it with `ADD_CLIENT`.
    pub fn serves(&self, key: &str) -> bool {
        self.0.client_key == key || self.0.clients.read().contains(key)
    }

    /// Returns the logical clients announced by the peer.
    pub fn clients(&self) -> Vec<String> {
        let mut clients = self.0.clients.read().iter().cloned().collect::<Vec<_>>();
        clients.sort();
        clients
    }

    pub fn is_closed(&self) -> bool {
        self.0.table.read().closed.is_some()
    }

    pub fn stream_count(&self) -> usize {
        self.0.table.read().streams.len()
    }

    /// Tears the session down.
    pub fn close(&self) {
        self.0.shutdown.cancel();
    }

    /// Completes when the session has torn down.
    pub async fn closed(&self) {
        self.0.shutdown.cancelled().await
    }

    /// Announces a logical client reachable through this session.
    pub async fn add_client(&self, key: &str) -> Result<(), DialError> {
        self.0.send(Frame::add_client(key)).await
    }

    pub async fn remove_client(&self, key: &str) -> Result<(), DialError> {
        self.0.send(Frame::remove_client(key)).await
    }

    /// Opens a stream to `dst` through the peer.
    ///
    /// Completes once the peer confirms the dial with its first `DATA` frame, rejects it with an
    /// `ERROR` frame, or `timeout` elapses.
    pub async fn dial(&self, dst: Destination, timeout: Duration) -> Result<Stream, DialError> {
        let inner = &self.0;
        let id = inner.next_id.fetch_add(2, Ordering::Relaxed);
        let (confirm_tx, confirm_rx) = oneshot::channel();
        let mut stream = inner
            .register(id, Direction::Outgoing, dst.clone(), Some(confirm_tx))
            .ok_or(DialError::SessionClosed)?;
        trace!(id, %dst, "dialing");
        inner.send(Frame::connect(id, &dst)).await?;

        match time::timeout(timeout, confirm_rx).await {
            Ok(Ok(Ok(()))) => Ok(stream),
            // The peer connected and closed before sending any data.
            Ok(Ok(Err(Terminal::Eof))) => Ok(stream),
            Ok(Ok(Err(Terminal::Remote(reason)))) => Err(DialError::Rejected(reason)),
            Ok(Ok(Err(_))) | Ok(Err(_)) => Err(DialError::SessionClosed),
            Err(_) => {
                stream.abort(io::ErrorKind::TimedOut, "dial timeout");
                Err(DialError::Timeout(timeout))
            }
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("client_key", &self.0.client_key)
            .field("side", &self.0.side)
            .finish()
    }
}

impl PartialEq for Session {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

// === impl SessionInner ===

impl SessionInner {
    pub(crate) fn sender(&self) -> mpsc::Sender<Outbound> {
        self.tx.clone()
    }

    pub(crate) fn max_payload(&self) -> usize {
        self.config.max_payload
    }

    /// Removes a stream from the table. Idempotent.
    pub(crate) fn remove(&self, id: u64) {
        if self.table.write().streams.remove(&id).is_some() {
            self.metrics.stream_closed();
        }
    }

    /// Enqueues a frame without waiting for queue capacity.
    ///
    /// Used from synchronous contexts, like `Drop`. When the queue is full the frame is handed to
    /// a task so that it is still written in a bounded amount of time.
    pub(crate) fn send_nowait(&self, frame: Frame) {
        match self.tx.try_send(Outbound::Frame(frame)) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Closed(_)) => {}
            Err(mpsc::error::TrySendError::Full(out)) => {
                if let Ok(handle) = tokio::runtime::Handle::try_current() {
                    let tx = self.tx.clone();
                    handle.spawn(async move {
                        let _ = tx.send(out).await;
                    });
                }
            }
        }
    }

    async fn send(&self, frame: Frame) -> Result<(), DialError> {
        self.tx
            .send(Outbound::Frame(frame))
            .await
            .map_err(|_| DialError::SessionClosed)
    }

    fn stream(&self, id: u64) -> Option<Arc<Shared>> {
        self.table.read().streams.get(&id).cloned()
    }

    fn register(
        self: &Arc<Self>,
        id: u64,
        direction: Direction,
        dst: Destination,
        confirm: Option<oneshot::Sender<Result<(), Terminal>>>,
    ) -> Option<Stream> {
        let shared = Arc::new(Shared::new(
            id,
            direction,
            dst,
            self.config.high_water,
            confirm,
        ));
        {
            let mut table = self.table.write();
            if table.closed.is_some() {
                return None;
            }
            table.streams.insert(id, shared.clone());
        }
        self.metrics.stream_opened();
        Some(Stream::new(shared, self))
    }

    async fn run<S>(
        self: &Arc<Self>,
        ws: WebSocketStream<S>,
        rx: mpsc::Receiver<Outbound>,
    ) -> Result<(), SessionError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (sink, stream) = ws.split();
        tokio::select! {
            res = write_loop(sink, rx, self.config.write_timeout, self.metrics.clone()) => res,
            res = self.read_loop(stream) => res,
            res = self.keepalive() => res,
            () = self.shutdown.cancelled() => Ok(()),
        }
    }

    async fn read_loop<R>(self: &Arc<Self>, mut rx: R) -> Result<(), SessionError>
    where
        R: futures::Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
    {
        while let Some(msg) = rx.next().await {
            let msg = msg?;
            *self.last_seen.lock() = Instant::now();
            let payload = match msg {
                Message::Binary(bytes) => bytes,
                Message::Text(text) => Bytes::from(text),
                Message::Ping(data) => {
                    let _ = self.tx.send(Outbound::Pong(data)).await;
                    continue;
                }
                Message::Pong(_) => continue,
                Message::Close(_) => {
                    debug!("peer closed the websocket");
                    return Ok(());
                }
                Message::Frame(_) => continue,
            };

            let frame = Frame::decode(payload)?;
            self.metrics.frame_received(frame.kind);
            self.handle(frame).await?;
        }

        debug!("websocket stream ended");
        Ok(())
    }

    async fn handle(self: &Arc<Self>, frame: Frame) -> Result<(), SessionError> {
        let Frame { id, kind, payload } = frame;
        match kind {
            Kind::Data => {
                let Some(shared) = self.stream(id) else {
                    // The stream has already closed.
                    trace!(id, "discarding data for unknown stream");
                    return Ok(());
                };
                if !shared.push(payload) {
                    return Ok(());
                }
                // The consumer has fallen behind. The read loop keeps serving other streams; this
                // one is given until the backpressure timeout to catch up.
                if shared.buffered() > self.config.max_buffered {
                    warn!(id, "stream receive buffer overflowed");
                    self.abort(&shared, OVERFLOW);
                } else if shared.watch() {
                    let span = debug_span!("backpressure", id);
                    tokio::spawn(self.clone().await_drain(shared).instrument(span));
                }
            }

            Kind::Error => {
                let reason = text(&payload);
                trace!(id, %reason, "stream closed by peer");
                if let Some(shared) = self.take(id) {
                    let terminal = if reason == EOF {
                        Terminal::Eof
                    } else {
                        Terminal::Remote(reason)
                    };
                    shared.fail(terminal);
                }
            }

            Kind::Connect => {
                if self.side.owns(id) || self.stream(id).is_some() {
                    return Err(SessionError::Violation(format!(
                        "peer opened stream with invalid id {id}"
                    )));
                }
                let dst = text(&payload).parse::<Destination>()?;
                if !self.connector.allows(&dst) {
                    debug!(id, %dst, "connect not authorized");
                    self.send_nowait(Frame::error(id, NOT_AUTHORIZED));
                    return Ok(());
                }
                // The id is reserved while the backend is dialed, so a repeated CONNECT for it is
                // a violation rather than a second dial.
                let span = debug_span!("connect", id, %dst);
                let Some(stream) = self.register(id, Direction::Incoming, dst, None) else {
                    return Ok(());
                };
                tokio::spawn(connect_backend(self.clone(), stream).instrument(span));
            }

            Kind::AddClient => {
                let key = text(&payload);
                debug!(%key, "adding client");
                self.clients.write().insert(key);
            }

            Kind::RemoveClient => {
                let key = text(&payload);
                debug!(%key, "removing client");
                self.clients.write().remove(&key);
            }
        }

        Ok(())
    }

    /// Fails the session once the peer has been silent for longer than the ping timeout. The
    /// server also pings on every tick.
    async fn keepalive(&self) -> Result<(), SessionError> {
        let mut interval = time::interval(self.config.ping_interval);
        interval.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            let idle = self.last_seen.lock().elapsed();
            if idle > self.config.ping_timeout {
                return Err(SessionError::Idle(idle));
            }
            if self.side == Side::Server
                && self.tx.send(Outbound::Ping(Bytes::new())).await.is_err()
            {
                return Ok(());
            }
        }
    }

    /// Aborts `shared` unless its consumer drains it below the high-water mark in time.
    async fn await_drain(self: Arc<Self>, shared: Arc<Shared>) {
        let drained = time::timeout(self.config.backpressure_timeout, shared.drained()).await;
        shared.unwatch();
        if drained.is_err() {
            warn!("stream receive buffer did not drain");
            self.abort(&shared, OVERFLOW);
        }
    }

    fn take(&self, id: u64) -> Option<Arc<Shared>> {
        let shared = self.table.write().streams.remove(&id)?;
        self.metrics.stream_closed();
        Some(shared)
    }

    fn abort(&self, shared: &Shared, reason: &str) {
        self.remove(shared.id());
        if shared.fail(Terminal::Local(io::ErrorKind::Other, reason.to_string())) {
            self.send_nowait(Frame::error(shared.id(), reason));
        }
    }

    /// Fails every stream with the session's terminal error. Idempotent.
    fn terminate(&self, res: &Result<(), SessionError>) {
        let reason = match res {
            Ok(()) => "tunnel session closed".to_string(),
            Err(error) => error.to_string(),
        };
        let streams = {
            let mut table = self.table.write();
            if table.closed.is_some() {
                return;
            }
            table.closed = Some(reason.clone());
            std::mem::take(&mut table.streams)
        };

        match res {
            Ok(()) => debug!(streams = streams.len(), "session closed"),
            Err(error) => warn!(%error, streams = streams.len(), "session failed"),
        }
        for shared in streams.into_values() {
            shared.fail(Terminal::Session(reason.clone()));
            self.metrics.stream_closed();
        }
        self.shutdown.cancel();
        self.metrics.session_closed();
    }
}

async fn write_loop<W>(
    mut sink: W,
    mut rx: mpsc::Receiver<Outbound>,
    timeout: Duration,
    metrics: TunnelMetrics,
) -> Result<(), SessionError>
where
    W: Sink<Message, Error = tungstenite::Error> + Unpin,
{
    while let Some(out) = rx.recv().await {
        let msg = match out {
            Outbound::Frame(frame) => {
                metrics.frame_sent(frame.kind);
                Message::Binary(frame.encode())
            }
            Outbound::Ping(data) => Message::Ping(data),
            Outbound::Pong(data) => Message::Pong(data),
        };
        match time::timeout(timeout, sink.send(msg)).await {
            Ok(res) => res?,
            Err(_) => return Err(SessionError::WriteTimeout),
        }
    }
    Ok(())
}

/// Dials the backend named by a peer's `CONNECT` and bridges it to the incoming stream.
async fn connect_backend(session: Arc<SessionInner>, mut stream: Stream) {
    let dst = stream.destination().clone();
    let dialed = time::timeout(session.config.dial_timeout, session.connector.connect(&dst)).await;
    let mut io: BoxedIo = match dialed {
        Ok(Ok(io)) => io,
        Ok(Err(error)) => {
            debug!(%error, "backend dial failed");
            stream.abort(io::ErrorKind::ConnectionRefused, &error.to_string());
            return;
        }
        Err(_) => {
            debug!("backend dial timed out");
            stream.abort(io::ErrorKind::TimedOut, "dial timeout");
            return;
        }
    };

    if session.send(Frame::data(stream.id(), Bytes::new())).await.is_err() {
        return;
    }
    drop(session);

    match tokio::io::copy_bidirectional(&mut stream, &mut io).await {
        Ok((to_backend, from_backend)) => debug!(to_backend, from_backend, "stream complete"),
        Err(error) => debug!(%error, "stream failed"),
    }
}

const OVERFLOW: &str = "receive buffer overflow";

fn text(payload: &Bytes) -> String {
    String::from_utf8_lossy(payload).into_owned()
}
