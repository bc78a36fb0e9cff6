use crate::{
    frame::{Destination, Frame},
    session::{Outbound, SessionInner},
};
use bytes::{Buf, Bytes};
use parking_lot::Mutex;
use std::{
    collections::VecDeque,
    future::Future,
    io,
    pin::Pin,
    sync::{Arc, Weak},
    task::{Context, Poll, Waker},
};
use tokio::{
    io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf},
    sync::{oneshot, Notify},
    time::{self, Instant, Sleep},
};
use tokio_util::sync::PollSender;

/// A logical byte pipe multiplexed over a tunnel session.
///
/// Writes are fragmented into `DATA` frames no larger than the session's max payload. Shutting the
/// stream down (or dropping it) emits a single `ERROR(id, "EOF")`; reads then drain whatever was
/// already buffered before reporting end-of-stream.
pub struct Stream {
    shared: Arc<Shared>,
    session: Weak<SessionInner>,
    tx: PollSender<Outbound>,
    max_payload: usize,
    read_deadline: Option<Deadline>,
    write_deadline: Option<Deadline>,
}

/// An I/O deadline. Expiry fails the pending operation without closing the stream.
struct Deadline {
    at: Instant,
    sleep: Pin<Box<Sleep>>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Direction {
    /// Opened by the peer's `CONNECT`.
    Incoming,
    /// Opened by a local dial.
    Outgoing,
}

/// Records why a stream stopped receiving.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum Terminal {
    /// The peer closed the stream gracefully.
    Eof,
    /// The peer closed the stream with an error.
    Remote(String),
    /// The stream was aborted locally.
    Local(io::ErrorKind, String),
    /// The owning session was torn down.
    Session(String),
}

/// Stream state shared between the session's read loop and the stream handle.
pub(crate) struct Shared {
    id: u64,
    direction: Direction,
    dst: Destination,
    high_water: usize,
    state: Mutex<State>,
    drained: Notify,
}

struct State {
    buf: VecDeque<Bytes>,
    buffered: usize,
    terminal: Option<Terminal>,
    /// Set once the local side has closed the stream.
    closed: bool,
    /// Set while a task waits for the buffer to drain below its high-water mark.
    watched: bool,
    read_waker: Option<Waker>,
    /// Completes a pending dial on the first frame received for the stream.
    confirm: Option<oneshot::Sender<Result<(), Terminal>>>,
}

// === impl Stream ===

impl Stream {
    pub(crate) fn new(shared: Arc<Shared>, session: &Arc<SessionInner>) -> Self {
        Self {
            shared,
            session: Arc::downgrade(session),
            tx: PollSender::new(session.sender()),
            max_payload: session.max_payload(),
            read_deadline: None,
            write_deadline: None,
        }
    }

    pub fn id(&self) -> u64 {
        self.shared.id
    }

    pub fn direction(&self) -> Direction {
        self.shared.direction
    }

    pub fn destination(&self) -> &Destination {
        &self.shared.dst
    }

    /// Indicates whether the receive buffer is above its high-water mark.
    pub fn is_pressured(&self) -> bool {
        self.shared.is_pressured()
    }

    /// Sets both the read and write deadlines. `None` clears them.
    ///
    /// Once a deadline passes, the corresponding operations fail with `TimedOut` until the
    /// deadline is cleared or moved into the future.
    pub fn set_deadline(&mut self, deadline: Option<Instant>) {
        self.set_read_deadline(deadline);
        self.set_write_deadline(deadline);
    }

    pub fn set_read_deadline(&mut self, deadline: Option<Instant>) {
        self.read_deadline = deadline.map(Deadline::new);
    }

    pub fn set_write_deadline(&mut self, deadline: Option<Instant>) {
        self.write_deadline = deadline.map(Deadline::new);
    }

    /// Closes the stream gracefully. Idempotent.
    pub async fn close(&mut self) -> io::Result<()> {
        self.shutdown().await
    }

    /// Aborts the stream, notifying the peer with `reason`.
    pub(crate) fn abort(&mut self, kind: io::ErrorKind, reason: &str) {
        let notify = self.shared.fail(Terminal::Local(kind, reason.to_string()));
        self.shared.state.lock().closed = true;
        if let Some(session) = self.session.upgrade() {
            session.remove(self.shared.id);
            if notify {
                session.send_nowait(Frame::error(self.shared.id, reason));
            }
        }
    }

    fn deadline_exceeded(&self, kind: &'static str) -> io::Error {
        tracing::trace!(id = self.shared.id, "{kind} deadline exceeded");
        io::Error::new(io::ErrorKind::TimedOut, format!("{kind} deadline exceeded"))
    }

    fn detach(&self) {
        if let Some(session) = self.session.upgrade() {
            session.remove(self.shared.id);
        }
    }
}

impl AsyncRead for Stream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        {
            let mut state = this.shared.state.lock();
            if state.buffered > 0 {
                let was_pressured = state.buffered > this.shared.high_water;
                state.read_into(buf);
                let drained = was_pressured && state.buffered <= this.shared.high_water;
                drop(state);
                if drained {
                    this.shared.drained.notify_waiters();
                }
                return Poll::Ready(Ok(()));
            }

            if let Some(terminal) = state.terminal.as_ref() {
                return Poll::Ready(terminal.read_result());
            }

            if state.closed {
                return Poll::Ready(Ok(()));
            }

            state.read_waker = Some(cx.waker().clone());
        }

        if let Some(deadline) = this.read_deadline.as_mut() {
            if deadline.poll_expired(cx) {
                return Poll::Ready(Err(this.deadline_exceeded("read")));
            }
        }

        Poll::Pending
    }
}

impl AsyncWrite for Stream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        {
            let state = this.shared.state.lock();
            if let Some(terminal) = state.terminal.as_ref() {
                return Poll::Ready(Err(terminal.write_error()));
            }
            if state.closed {
                return Poll::Ready(Err(io::Error::new(
                    io::ErrorKind::BrokenPipe,
                    "stream is closed",
                )));
            }
        }

        if data.is_empty() {
            return Poll::Ready(Ok(0));
        }

        if let Some(deadline) = this.write_deadline.as_ref() {
            if deadline.expired() {
                return Poll::Ready(Err(this.deadline_exceeded("write")));
            }
        }

        match this.tx.poll_reserve(cx) {
            Poll::Ready(Ok(())) => {}
            Poll::Ready(Err(_)) => return Poll::Ready(Err(session_closed())),
            Poll::Pending => {
                if let Some(deadline) = this.write_deadline.as_mut() {
                    if deadline.poll_expired(cx) {
                        return Poll::Ready(Err(this.deadline_exceeded("write")));
                    }
                }
                return Poll::Pending;
            }
        }

        let n = data.len().min(this.max_payload);
        let frame = Frame::data(this.shared.id, Bytes::copy_from_slice(&data[..n]));
        if this.tx.send_item(Outbound::Frame(frame)).is_err() {
            return Poll::Ready(Err(session_closed()));
        }
        Poll::Ready(Ok(n))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        {
            let mut state = this.shared.state.lock();
            if state.closed || state.terminal.is_some() {
                state.closed = true;
                drop(state);
                this.detach();
                return Poll::Ready(Ok(()));
            }
        }

        let reserved = std::task::ready!(this.tx.poll_reserve(cx)).is_ok();
        this.shared.close();
        if reserved {
            // The session may have been torn down since the reservation; there is nothing left to
            // notify in that case.
            let _ = this.tx.send_item(Outbound::Frame(Frame::eof(this.shared.id)));
        }
        this.detach();
        Poll::Ready(Ok(()))
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        let notify = {
            let mut state = self.shared.state.lock();
            let notify = !state.closed && state.terminal.is_none();
            state.closed = true;
            notify
        };
        if let Some(session) = self.session.upgrade() {
            session.remove(self.shared.id);
            if notify {
                session.send_nowait(Frame::eof(self.shared.id));
            }
        }
    }
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stream")
            .field("id", &self.shared.id)
            .field("direction", &self.shared.direction)
            .field("dst", &self.shared.dst)
            .finish()
    }
}

// === impl Deadline ===

impl Deadline {
    fn new(at: Instant) -> Self {
        Self {
            at,
            sleep: Box::pin(time::sleep_until(at)),
        }
    }

    fn expired(&self) -> bool {
        Instant::now() >= self.at
    }

    /// Registers `cx` to be woken at the deadline, returning true if it has already passed.
    fn poll_expired(&mut self, cx: &mut Context<'_>) -> bool {
        self.expired() || self.sleep.as_mut().poll(cx).is_ready()
    }
}

fn session_closed() -> io::Error {
    io::Error::new(io::ErrorKind::ConnectionAborted, "tunnel session closed")
}

// === impl Shared ===

impl Shared {
    pub(crate) fn new(
        id: u64,
        direction: Direction,
        dst: Destination,
        high_water: usize,
        confirm: Option<oneshot::Sender<Result<(), Terminal>>>,
    ) -> Self {
        Self {
            id,
            direction,
            dst,
            high_water,
            state: Mutex::new(State {
                buf: VecDeque::new(),
                buffered: 0,
                terminal: None,
                closed: false,
                watched: false,
                read_waker: None,
                confirm,
            }),
            drained: Notify::new(),
        }
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    /// Appends received bytes, returning true if the buffer is now above its high-water mark.
    ///
    /// The first frame received for an outgoing stream confirms its dial, even when empty.
    pub(crate) fn push(&self, data: Bytes) -> bool {
        let mut state = self.state.lock();
        if let Some(confirm) = state.confirm.take() {
            let _ = confirm.send(Ok(()));
        }
        if state.closed || state.terminal.is_some() || data.is_empty() {
            return false;
        }

        state.buffered += data.len();
        state.buf.push_back(data);
        if let Some(waker) = state.read_waker.take() {
            waker.wake();
        }
        state.buffered > self.high_water
    }

    /// Records a terminal condition, waking any blocked reader.
    ///
    /// Returns false if the stream had already terminated.
    pub(crate) fn fail(&self, terminal: Terminal) -> bool {
        let mut state = self.state.lock();
        if state.terminal.is_some() {
            return false;
        }
        if let Some(confirm) = state.confirm.take() {
            let _ = confirm.send(Err(terminal.clone()));
        }
        // Abnormal terminations discard undelivered bytes; a graceful close lets readers drain.
        if terminal != Terminal::Eof {
            state.buf.clear();
            state.buffered = 0;
        }
        state.terminal = Some(terminal);
        if let Some(waker) = state.read_waker.take() {
            waker.wake();
        }
        drop(state);
        self.drained.notify_waiters();
        true
    }

    fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        if let Some(waker) = state.read_waker.take() {
            waker.wake();
        }
        drop(state);
        self.drained.notify_waiters();
    }

    pub(crate) fn is_pressured(&self) -> bool {
        self.state.lock().buffered > self.high_water
    }

    pub(crate) fn buffered(&self) -> usize {
        self.state.lock().buffered
    }

    /// Marks the stream as watched for draining, returning false if it already was.
    pub(crate) fn watch(&self) -> bool {
        !std::mem::replace(&mut self.state.lock().watched, true)
    }

    pub(crate) fn unwatch(&self) {
        self.state.lock().watched = false;
    }

    /// Completes once the receive buffer falls to its high-water mark or the stream terminates.
    pub(crate) async fn drained(&self) {
        loop {
            let notified = self.drained.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let state = self.state.lock();
                if state.buffered <= self.high_water || state.closed || state.terminal.is_some() {
                    return;
                }
            }
            notified.await;
        }
    }
}

// === impl State ===

impl State {
    fn read_into(&mut self, buf: &mut ReadBuf<'_>) {
        while buf.remaining() > 0 {
            let Some(chunk) = self.buf.front_mut() else {
                return;
            };
            let n = chunk.len().min(buf.remaining());
            buf.put_slice(&chunk[..n]);
            chunk.advance(n);
            self.buffered -= n;
            if chunk.is_empty() {
                self.buf.pop_front();
            }
        }
    }
}

// === impl Terminal ===

impl Terminal {
    fn read_result(&self) -> io::Result<()> {
        match self {
            Self::Eof => Ok(()),
            Self::Remote(reason) => Err(io::Error::new(
                io::ErrorKind::ConnectionReset,
                reason.clone(),
            )),
            Self::Local(kind, reason) => Err(io::Error::new(*kind, reason.clone())),
            Self::Session(reason) => Err(io::Error::new(
                io::ErrorKind::ConnectionAborted,
                reason.clone(),
            )),
        }
    }

    fn write_error(&self) -> io::Error {
        match self.read_result() {
            Ok(()) => io::Error::new(io::ErrorKind::BrokenPipe, "stream closed by peer"),
            Err(error) => error,
        }
    }
}
