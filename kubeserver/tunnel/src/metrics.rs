use crate::{frame::Kind, DialError};
use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{counter::Counter, family::Family, gauge::Gauge},
    registry::Registry,
};

/// Tunnel metrics.
///
/// The default value is not registered anywhere, which is convenient for agents and tests.
#[derive(Clone, Debug, Default)]
pub struct TunnelMetrics {
    sessions: Gauge,
    streams: Gauge,
    dials: Family<DialLabels, Counter>,
    frames_received: Family<FrameLabels, Counter>,
    frames_sent: Family<FrameLabels, Counter>,
}

#[derive(Clone, Hash, PartialEq, Eq, EncodeLabelSet, Debug)]
struct DialLabels {
    result: &'static str,
}

#[derive(Clone, Hash, PartialEq, Eq, EncodeLabelSet, Debug)]
struct FrameLabels {
    kind: &'static str,
}

// === impl TunnelMetrics ===

impl TunnelMetrics {
    pub fn register(reg: &mut Registry) -> Self {
        let sessions = Gauge::default();
        reg.register("sessions", "Number of live tunnel sessions", sessions.clone());

        let streams = Gauge::default();
        reg.register(
            "streams",
            "Number of streams multiplexed over live sessions",
            streams.clone(),
        );

        let dials = Family::<DialLabels, Counter>::default();
        reg.register(
            "dials",
            "Total number of dials through the tunnel, by result",
            dials.clone(),
        );

        let frames_received = Family::<FrameLabels, Counter>::default();
        reg.register(
            "frames_received",
            "Total number of frames read from tunnel websockets",
            frames_received.clone(),
        );

        let frames_sent = Family::<FrameLabels, Counter>::default();
        reg.register(
            "frames_sent",
            "Total number of frames written to tunnel websockets",
            frames_sent.clone(),
        );

        Self {
            sessions,
            streams,
            dials,
            frames_received,
            frames_sent,
        }
    }

    pub(crate) fn session_opened(&self) {
        self.sessions.inc();
    }

    pub(crate) fn session_closed(&self) {
        self.sessions.dec();
    }

    pub(crate) fn stream_opened(&self) {
        self.streams.inc();
    }

    pub(crate) fn stream_closed(&self) {
        self.streams.dec();
    }

    pub(crate) fn dialed(&self, res: Result<(), &DialError>) {
        let result = match res {
            Ok(()) => "ok",
            Err(e) => e.as_label(),
        };
        self.dials.get_or_create(&DialLabels { result }).inc();
    }

    pub(crate) fn frame_received(&self, kind: Kind) {
        self.frames_received
            .get_or_create(&FrameLabels {
                kind: kind.as_str(),
            })
            .inc();
    }

    pub(crate) fn frame_sent(&self, kind: Kind) {
        self.frames_sent
            .get_or_create(&FrameLabels {
                kind: kind.as_str(),
            })
            .inc();
    }
}
