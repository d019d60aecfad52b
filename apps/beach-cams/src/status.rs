use std::fmt;

use crate::registry::SlotIndex;

/// Lifecycle notification delivered to the status surface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Phase {
    Connecting,
    SignalingOpen,
    OfferReceived,
    Negotiating,
    Gathering,
    Ready,
    ConnectivityChanged(String),
    Closed,
    Error(String),
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Connecting => f.write_str("connecting to signaling server"),
            Phase::SignalingOpen => f.write_str("connected to signaling server, sending source"),
            Phase::OfferReceived => f.write_str("offer received, configuring peer connection"),
            Phase::Negotiating => f.write_str("creating answer"),
            Phase::Gathering => f.write_str("gathering ice candidates"),
            Phase::Ready => f.write_str("answer sent"),
            Phase::ConnectivityChanged(state) => write!(f, "peer connection {state}"),
            Phase::Closed => f.write_str("disconnected from signaling server"),
            Phase::Error(cause) => write!(f, "error: {cause}"),
        }
    }
}

/// Receives lifecycle notifications. Implementations must return promptly.
pub trait StatusReporter: Send + Sync {
    fn report(&self, slot: SlotIndex, phase: Phase);
}

/// Default reporter: one structured log line per notification.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingReporter;

impl StatusReporter for TracingReporter {
    fn report(&self, slot: SlotIndex, phase: Phase) {
        match &phase {
            Phase::Error(_) => tracing::warn!(target: "beach_cams::status", %slot, "{phase}"),
            _ => tracing::info!(target: "beach_cams::status", %slot, "{phase}"),
        }
    }
}
