//! Per-slot signaling channels.
//!
//! A [`SignalingChannel`] wraps one duplex text connection. The transport
//! underneath reports progress as typed [`ChannelEvent`]s tagged with the
//! slot and channel generation, so the registry can drop anything emitted by
//! a connection it has already discarded.

use tokio::sync::mpsc;
use url::Url;

use crate::error::ChannelError;
use crate::registry::{Generation, RegistryEvent, SlotIndex};

pub mod mock;
pub mod websocket;

pub use mock::{MockConnector, MockLink};
pub use websocket::WebSocketConnector;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    Opened,
    Message(String),
    Closed,
    Errored(String),
}

impl ChannelEvent {
    pub fn label(&self) -> &'static str {
        match self {
            ChannelEvent::Opened => "opened",
            ChannelEvent::Message(_) => "message",
            ChannelEvent::Closed => "closed",
            ChannelEvent::Errored(_) => "errored",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Connecting,
    Open,
    Closed,
    Errored,
}

impl ChannelState {
    pub fn is_terminal(self) -> bool {
        matches!(self, ChannelState::Closed | ChannelState::Errored)
    }
}

/// Sending half handed to a transport; tags every event with its origin.
#[derive(Debug, Clone)]
pub struct ChannelEvents {
    slot: SlotIndex,
    generation: Generation,
    tx: mpsc::UnboundedSender<RegistryEvent>,
}

impl ChannelEvents {
    pub(crate) fn new(
        slot: SlotIndex,
        generation: Generation,
        tx: mpsc::UnboundedSender<RegistryEvent>,
    ) -> Self {
        Self {
            slot,
            generation,
            tx,
        }
    }

    pub fn slot(&self) -> SlotIndex {
        self.slot
    }

    pub fn generation(&self) -> Generation {
        self.generation
    }

    /// Returns false once the registry has gone away.
    pub fn emit(&self, event: ChannelEvent) -> bool {
        self.tx
            .send(RegistryEvent::Channel {
                slot: self.slot,
                generation: self.generation,
                event,
            })
            .is_ok()
    }
}

/// Outbound half of a live connection. Dropping it asks the transport to
/// close the connection.
#[derive(Debug)]
pub struct ChannelLink {
    outbound: mpsc::UnboundedSender<String>,
}

impl ChannelLink {
    pub fn new(outbound: mpsc::UnboundedSender<String>) -> Self {
        Self { outbound }
    }
}

/// Opens duplex text connections to the signaling endpoint.
pub trait Connector: Send + Sync {
    fn connect(&self, endpoint: &Url, events: ChannelEvents) -> ChannelLink;
}

#[derive(Debug)]
pub struct SignalingChannel {
    slot: SlotIndex,
    generation: Generation,
    state: ChannelState,
    link: ChannelLink,
}

impl SignalingChannel {
    pub fn open(connector: &dyn Connector, endpoint: &Url, events: ChannelEvents) -> Self {
        let slot = events.slot();
        let generation = events.generation();
        let link = connector.connect(endpoint, events);
        tracing::debug!(
            target: "beach_cams::transport",
            %slot,
            generation,
            endpoint = %endpoint,
            "signaling channel connecting"
        );
        Self {
            slot,
            generation,
            state: ChannelState::Connecting,
            link,
        }
    }

    pub fn generation(&self) -> Generation {
        self.generation
    }

    pub fn state(&self) -> ChannelState {
        self.state
    }

    pub fn is_open(&self) -> bool {
        self.state == ChannelState::Open
    }

    /// Applies the delivery guarantees: `Opened` and `Closed` at most once,
    /// messages only while open, and nothing after a terminal event. Returns
    /// false for events that must be dropped.
    pub fn observe(&mut self, event: &ChannelEvent) -> bool {
        let accepted = match (self.state, event) {
            (ChannelState::Connecting, ChannelEvent::Opened) => {
                self.state = ChannelState::Open;
                true
            }
            (ChannelState::Open, ChannelEvent::Message(_)) => true,
            (state, ChannelEvent::Closed) if !state.is_terminal() => {
                self.state = ChannelState::Closed;
                true
            }
            (state, ChannelEvent::Errored(_)) if !state.is_terminal() => {
                self.state = ChannelState::Errored;
                true
            }
            _ => false,
        };
        if !accepted {
            tracing::trace!(
                target: "beach_cams::transport",
                slot = %self.slot,
                generation = self.generation,
                state = ?self.state,
                event = event.label(),
                "dropping channel event"
            );
        }
        accepted
    }

    pub fn send_text(&self, text: String) -> Result<(), ChannelError> {
        if !self.is_open() {
            return Err(ChannelError::NotOpen(self.slot));
        }
        tracing::trace!(
            target: "beach_cams::transport",
            slot = %self.slot,
            generation = self.generation,
            len = text.len(),
            "ws_out"
        );
        self.link
            .outbound
            .send(text)
            .map_err(|_| ChannelError::Closed(self.slot))
    }
}
