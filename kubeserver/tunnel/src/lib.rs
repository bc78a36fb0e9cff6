//! A reverse tunnel that multiplexes byte streams over a single websocket.
//!
//! Agents running next to a cluster dial out to the server and hold a websocket open. The server
//! indexes these sessions by client key and opens streams through them to reach endpoints on the
//! agent's network, such as the cluster's API server.

#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

mod agent;
mod connect;
mod filter;
pub mod frame;
mod manager;
mod metrics;
mod session;
mod stream;

#[cfg(test)]
mod tests;

pub use self::{
    agent::{Agent, AgentError, RECONNECT_DELAY},
    connect::{BoxedIo, Connect, Deny, Io, LocalConnector, NOT_AUTHORIZED},
    filter::{ConnectFilter, InvalidRule, Rule},
    frame::{Destination, Frame, FrameError, Kind},
    manager::{Authorize, DialError, Dialer, SessionManager, TokenAuthorizer, TUNNEL_ID_HEADER},
    metrics::TunnelMetrics,
    session::{Session, SessionError, Side},
    stream::{Direction, Stream},
};

use std::time::Duration;

/// Tunnel session settings shared by the server and agents.
#[derive(Clone, Debug)]
pub struct Config {
    /// The largest `DATA` payload written to the wire.
    pub max_payload: usize,

    /// The number of buffered bytes above which a stream's receive buffer is considered full.
    pub high_water: usize,

    /// How long a stream may stay above `high_water` before it is aborted.
    pub backpressure_timeout: Duration,

    /// The number of buffered bytes at which a stream is aborted without waiting for it to drain.
    pub max_buffered: usize,

    /// The deadline for each websocket write. An expired write tears the session down.
    pub write_timeout: Duration,

    pub ping_interval: Duration,

    /// How long either side tolerates a silent peer before dropping the session. Only the server
    /// sends pings; agents rely on them to notice a server that has gone away.
    pub ping_timeout: Duration,

    /// The deadline for a single dial attempt.
    pub dial_timeout: Duration,

    /// The deadline across all attempts of a dial.
    pub dial_total_timeout: Duration,

    /// The number of outbound messages that may be queued for the websocket writer.
    pub write_queue_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_payload: 32 * 1024,
            high_water: 1024 * 1024,
            backpressure_timeout: Duration::from_secs(30),
            max_buffered: 8 * 1024 * 1024,
            write_timeout: Duration::from_secs(10),
            ping_interval: Duration::from_secs(5),
            ping_timeout: Duration::from_secs(60),
            dial_timeout: Duration::from_secs(15),
            dial_total_timeout: Duration::from_secs(45),
            write_queue_capacity: 128,
        }
    }
}
