//! The slot table.
//!
//! [`SlotRegistry`] owns one record per slot, each holding at most one
//! signaling channel and one negotiation session. Transports and
//! capabilities never touch the table directly: they push tagged
//! [`RegistryEvent`]s into a single queue, and whoever drives the registry
//! feeds them back one at a time through [`SlotRegistry::dispatch`]. Every
//! channel and session carries the generation it was created under, so an
//! event from a discarded generation can be recognised and dropped before it
//! touches the slot's current state.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use tokio::sync::mpsc;
use url::Url;

use crate::error::{ActivationError, ChannelError, NegotiationError, SlotError};
use crate::media::MediaSink;
use crate::negotiation::{
    CapabilityFactory, NegotiationEvent, NegotiationSession, NegotiationState, SessionEvents,
    Transition,
};
use crate::protocol::{CLOSE_FRAME, SignalingMessage, SourceAddress};
use crate::status::{Phase, StatusReporter};
use crate::transport::{ChannelEvent, ChannelEvents, ChannelState, Connector, SignalingChannel};

/// Identity of one channel or session instance.
pub type Generation = u64;

/// One-based slot number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SlotIndex(usize);

impl SlotIndex {
    pub const fn new(index: usize) -> Self {
        Self(index)
    }

    pub fn get(self) -> usize {
        self.0
    }
}

impl fmt::Display for SlotIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Idle,
    Connecting,
    SignalingOpen,
    Closed,
    Errored,
}

#[derive(Debug)]
pub enum RegistryEvent {
    Channel {
        slot: SlotIndex,
        generation: Generation,
        event: ChannelEvent,
    },
    Negotiation {
        slot: SlotIndex,
        generation: Generation,
        event: NegotiationEvent,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryConfig {
    pub slot_count: usize,
    pub endpoint: Url,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotSnapshot {
    pub slot: SlotIndex,
    pub state: SlotState,
    pub source: Option<String>,
    pub channel: Option<ChannelState>,
    pub channel_generation: Option<Generation>,
    pub negotiation: Option<NegotiationState>,
    pub session_generation: Option<Generation>,
}

#[derive(Debug)]
struct Slot {
    index: SlotIndex,
    state: SlotState,
    source: Option<SourceAddress>,
    channel: Option<SignalingChannel>,
    session: Option<NegotiationSession>,
}

impl Slot {
    fn new(index: SlotIndex) -> Self {
        Self {
            index,
            state: SlotState::Idle,
            source: None,
            channel: None,
            session: None,
        }
    }

    fn snapshot(&self) -> SlotSnapshot {
        SlotSnapshot {
            slot: self.index,
            state: self.state,
            source: self.source.as_ref().map(|source| source.to_string()),
            channel: self.channel.as_ref().map(SignalingChannel::state),
            channel_generation: self.channel.as_ref().map(SignalingChannel::generation),
            negotiation: self.session.as_ref().map(NegotiationSession::state),
            session_generation: self.session.as_ref().map(NegotiationSession::generation),
        }
    }
}

pub struct SlotRegistry {
    endpoint: Url,
    slots: Vec<Slot>,
    connector: Arc<dyn Connector>,
    capabilities: Arc<dyn CapabilityFactory>,
    reporter: Arc<dyn StatusReporter>,
    sink: Arc<dyn MediaSink>,
    events_tx: mpsc::UnboundedSender<RegistryEvent>,
    events_rx: mpsc::UnboundedReceiver<RegistryEvent>,
    last_generation: Generation,
}

impl SlotRegistry {
    pub fn new(
        config: RegistryConfig,
        connector: Arc<dyn Connector>,
        capabilities: Arc<dyn CapabilityFactory>,
        reporter: Arc<dyn StatusReporter>,
        sink: Arc<dyn MediaSink>,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let slots = (1..=config.slot_count)
            .map(|index| Slot::new(SlotIndex::new(index)))
            .collect();
        Self {
            endpoint: config.endpoint,
            slots,
            connector,
            capabilities,
            reporter,
            sink,
            events_tx,
            events_rx,
            last_generation: 0,
        }
    }

    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    pub fn slot_state(&self, slot: SlotIndex) -> Option<SlotState> {
        self.slot(slot).map(|record| record.state)
    }

    pub fn channel_state(&self, slot: SlotIndex) -> Option<ChannelState> {
        self.slot(slot)
            .and_then(|record| record.channel.as_ref())
            .map(SignalingChannel::state)
    }

    pub fn negotiation_state(&self, slot: SlotIndex) -> Option<NegotiationState> {
        self.slot(slot)
            .and_then(|record| record.session.as_ref())
            .map(NegotiationSession::state)
    }

    pub fn pending_candidates(&self, slot: SlotIndex) -> Option<usize> {
        self.slot(slot)
            .and_then(|record| record.session.as_ref())
            .map(NegotiationSession::pending_candidates)
    }

    pub fn snapshot(&self) -> Vec<SlotSnapshot> {
        self.slots.iter().map(Slot::snapshot).collect()
    }

    /// Starts (or restarts) a slot: any previous channel and session are
    /// discarded before the new channel exists.
    pub fn activate(&mut self, slot: SlotIndex, source: &str) -> Result<(), ActivationError> {
        if self.slot(slot).is_none() {
            return Err(ActivationError::UnknownSlot(slot));
        }
        let source = match SourceAddress::parse(source) {
            Ok(source) => source,
            Err(err) => {
                self.reporter.report(slot, Phase::Error(err.to_string()));
                return Err(err);
            }
        };

        self.teardown(slot);
        let generation = self.next_generation();
        let events = ChannelEvents::new(slot, generation, self.events_tx.clone());
        let channel = SignalingChannel::open(self.connector.as_ref(), &self.endpoint, events);
        if let Some(record) = self.slot_mut(slot) {
            record.source = Some(source);
            record.channel = Some(channel);
            record.state = SlotState::Connecting;
        }
        tracing::info!(target: "beach_cams::registry", %slot, generation, "slot activated");
        self.reporter.report(slot, Phase::Connecting);
        Ok(())
    }

    /// Operator-initiated teardown. Asks the server to drop the stream when
    /// the channel is still open.
    pub fn deactivate(&mut self, slot: SlotIndex) -> Result<(), SlotError> {
        let record = self.slot_mut(slot).ok_or(SlotError::UnknownSlot(slot))?;
        if let Some(channel) = record.channel.as_ref().filter(|channel| channel.is_open()) {
            if let Err(err) = channel.send_text(CLOSE_FRAME.to_string()) {
                tracing::debug!(target: "beach_cams::registry", %slot, error = %err, "close frame not sent");
            }
        }
        let was_live = record.channel.is_some() || record.session.is_some();
        record.state = SlotState::Idle;
        self.teardown(slot);
        if was_live {
            tracing::info!(target: "beach_cams::registry", %slot, "slot deactivated");
            self.reporter.report(slot, Phase::Closed);
        }
        Ok(())
    }

    /// Deactivates every slot.
    pub fn shutdown(&mut self) {
        let indices: Vec<SlotIndex> = self.slots.iter().map(|record| record.index).collect();
        for slot in indices {
            let _ = self.deactivate(slot);
        }
    }

    pub fn on_channel_open(&mut self, slot: SlotIndex) -> Result<(), SlotError> {
        let record = self.slot_mut(slot).ok_or(SlotError::UnknownSlot(slot))?;
        record.state = SlotState::SignalingOpen;
        let first_frame = record.source.as_ref().map(SourceAddress::to_frame);
        self.reporter.report(slot, Phase::SignalingOpen);

        let Some(frame) = first_frame else {
            return Ok(());
        };
        let result = self
            .slot(slot)
            .and_then(|record| record.channel.as_ref())
            .ok_or(ChannelError::NotOpen(slot))
            .and_then(|channel| channel.send_text(frame));
        if let Err(err) = result {
            self.reporter.report(slot, Phase::Error(err.to_string()));
            return Err(err.into());
        }
        Ok(())
    }

    pub fn on_channel_message(&mut self, slot: SlotIndex, frame: &str) -> Result<(), SlotError> {
        if self.slot(slot).is_none() {
            return Err(SlotError::UnknownSlot(slot));
        }
        let message = match SignalingMessage::parse(frame) {
            Ok(message) => message,
            Err(err) => {
                tracing::warn!(target: "beach_cams::registry", %slot, error = %err, "ignoring malformed frame");
                self.reporter.report(slot, Phase::Error(err.to_string()));
                return Err(err.into());
            }
        };

        let has_session = self
            .slot(slot)
            .is_some_and(|record| record.session.is_some());
        let offer = match message {
            SignalingMessage::Offer(offer) if !has_session => offer,
            other => {
                let label = other.label();
                tracing::warn!(target: "beach_cams::registry", %slot, message = label, "unexpected signaling message");
                self.reporter
                    .report(slot, Phase::Error(format!("unexpected {label} message")));
                return Err(SlotError::UnexpectedMessage(label));
            }
        };

        let generation = self.next_generation();
        let events = SessionEvents::new(slot, generation, self.events_tx.clone());
        let mut session = NegotiationSession::new(self.capabilities.as_ref(), events);
        self.reporter.report(slot, Phase::OfferReceived);
        let transition = session.offer_received(offer);
        if let Some(record) = self.slot_mut(slot) {
            record.session = Some(session);
        }
        tracing::debug!(target: "beach_cams::registry", %slot, generation, "negotiation session created");
        self.after_transition(slot, transition)
    }

    pub fn on_channel_close(&mut self, slot: SlotIndex) {
        let Some(record) = self.slot_mut(slot) else {
            return;
        };
        record.state = SlotState::Closed;
        self.teardown(slot);
        self.reporter.report(slot, Phase::Closed);
    }

    pub fn on_channel_error(&mut self, slot: SlotIndex, detail: &str) {
        let Some(record) = self.slot_mut(slot) else {
            return;
        };
        record.state = SlotState::Errored;
        self.teardown(slot);
        self.reporter
            .report(slot, Phase::Error(format!("signaling channel error: {detail}")));
    }

    pub fn send_outbound(
        &mut self,
        slot: SlotIndex,
        message: &SignalingMessage,
    ) -> Result<(), SlotError> {
        let record = self.slot(slot).ok_or(SlotError::UnknownSlot(slot))?;
        let channel = record
            .channel
            .as_ref()
            .filter(|channel| channel.is_open())
            .ok_or(ChannelError::NotOpen(slot))?;
        let frame = message.encode()?;
        channel.send_text(frame)?;
        tracing::debug!(target: "beach_cams::registry", %slot, message = message.label(), "signaling message sent");
        Ok(())
    }

    pub async fn next_event(&mut self) -> Option<RegistryEvent> {
        self.events_rx.recv().await
    }

    pub fn try_next_event(&mut self) -> Option<RegistryEvent> {
        self.events_rx.try_recv().ok()
    }

    /// Routes one event to the slot it belongs to, dropping it if it comes
    /// from a generation the slot no longer owns.
    pub fn dispatch(&mut self, event: RegistryEvent) {
        match event {
            RegistryEvent::Channel {
                slot,
                generation,
                event,
            } => self.dispatch_channel(slot, generation, event),
            RegistryEvent::Negotiation {
                slot,
                generation,
                event,
            } => self.dispatch_negotiation(slot, generation, event),
        }
    }

    /// Processes events until `shutdown` resolves, then deactivates every slot.
    pub async fn run_until<F>(&mut self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                event = self.events_rx.recv() => match event {
                    Some(event) => self.dispatch(event),
                    None => break,
                },
            }
        }
        self.shutdown();
    }

    fn dispatch_channel(&mut self, slot: SlotIndex, generation: Generation, event: ChannelEvent) {
        let accepted = self
            .slot_mut(slot)
            .and_then(|record| record.channel.as_mut())
            .filter(|channel| channel.generation() == generation)
            .map(|channel| channel.observe(&event));
        match accepted {
            Some(true) => {}
            Some(false) => return,
            None => {
                tracing::trace!(
                    target: "beach_cams::registry",
                    %slot,
                    generation,
                    event = event.label(),
                    "discarding event from stale channel"
                );
                return;
            }
        }

        let result = match event {
            ChannelEvent::Opened => self.on_channel_open(slot),
            ChannelEvent::Message(frame) => self.on_channel_message(slot, &frame),
            ChannelEvent::Closed => {
                self.on_channel_close(slot);
                Ok(())
            }
            ChannelEvent::Errored(detail) => {
                self.on_channel_error(slot, &detail);
                Ok(())
            }
        };
        if let Err(err) = result {
            tracing::debug!(target: "beach_cams::registry", %slot, error = %err, "channel event handled with error");
        }
    }

    fn dispatch_negotiation(
        &mut self,
        slot: SlotIndex,
        generation: Generation,
        event: NegotiationEvent,
    ) {
        let current = self
            .slot(slot)
            .and_then(|record| record.session.as_ref())
            .is_some_and(|session| session.generation() == generation);
        if !current {
            tracing::trace!(
                target: "beach_cams::registry",
                %slot,
                generation,
                event = event.label(),
                "discarding event from stale session"
            );
            return;
        }

        match event {
            NegotiationEvent::Connectivity(state) => {
                self.reporter
                    .report(slot, Phase::ConnectivityChanged(state.to_string()));
            }
            NegotiationEvent::Track(stream) => self.sink.attach(slot, stream),
            event => {
                let Some(session) = self
                    .slot_mut(slot)
                    .and_then(|record| record.session.as_mut())
                else {
                    return;
                };
                let transition = session.handle(event);
                if let Err(err) = self.after_transition(slot, transition) {
                    tracing::debug!(target: "beach_cams::registry", %slot, error = %err, "negotiation event handled with error");
                }
            }
        }
    }

    fn after_transition(
        &mut self,
        slot: SlotIndex,
        transition: Result<Transition, NegotiationError>,
    ) -> Result<(), SlotError> {
        match transition {
            Ok(Transition::Unchanged) => Ok(()),
            Ok(Transition::Entered(state)) => {
                match state {
                    NegotiationState::GeneratingAnswer => {
                        self.reporter.report(slot, Phase::Negotiating)
                    }
                    NegotiationState::GatheringCandidates => {
                        self.reporter.report(slot, Phase::Gathering)
                    }
                    _ => {}
                }
                Ok(())
            }
            Ok(Transition::Ready(message)) => match self.send_outbound(slot, &message) {
                Ok(()) => {
                    tracing::info!(target: "beach_cams::registry", %slot, "local description sent");
                    self.reporter.report(slot, Phase::Ready);
                    Ok(())
                }
                Err(err) => {
                    if let Some(session) = self
                        .slot_mut(slot)
                        .and_then(|record| record.session.as_mut())
                    {
                        session.abort(err.to_string());
                    }
                    self.reporter.report(slot, Phase::Error(err.to_string()));
                    Err(err)
                }
            },
            Err(err @ NegotiationError::Capability { .. }) => {
                self.reporter.report(slot, Phase::Error(err.to_string()));
                Err(err.into())
            }
            Err(err @ NegotiationError::OutOfOrder { .. }) => {
                tracing::warn!(target: "beach_cams::registry", %slot, error = %err, "ignoring out-of-order negotiation event");
                Err(err.into())
            }
        }
    }

    fn teardown(&mut self, slot: SlotIndex) {
        let Some(record) = self.slot_mut(slot) else {
            return;
        };
        let channel = record.channel.take();
        let session = record.session.take();
        if let Some(channel) = channel {
            tracing::debug!(
                target: "beach_cams::registry",
                %slot,
                generation = channel.generation(),
                "signaling channel released"
            );
        }
        if let Some(session) = session {
            session.close();
            self.sink.detach(slot);
        }
    }

    fn next_generation(&mut self) -> Generation {
        self.last_generation += 1;
        self.last_generation
    }

    fn slot(&self, slot: SlotIndex) -> Option<&Slot> {
        slot.get()
            .checked_sub(1)
            .and_then(|offset| self.slots.get(offset))
    }

    fn slot_mut(&mut self, slot: SlotIndex) -> Option<&mut Slot> {
        slot.get()
            .checked_sub(1)
            .and_then(|offset| self.slots.get_mut(offset))
    }
}
