//! Offer/answer negotiation for a single slot.
//!
//! A [`NegotiationSession`] walks one negotiation lifecycle:
//!
//! ```text
//! AwaitingOffer -> DescribingRemote -> GeneratingAnswer -> GatheringCandidates -> Ready
//!        \________________\___________________\____________________\______-> Failed
//! ```
//!
//! The session never awaits anything itself. Each asynchronous step against
//! the [`NegotiationCapability`] is spawned, and its completion comes back
//! through [`SessionEvents`] tagged with the session's generation. The
//! registry feeds it back in via [`NegotiationSession::handle`], after
//! discarding anything addressed to a session it no longer owns.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::{CapabilityError, NegotiationError};
use crate::media::MediaStreamRef;
use crate::protocol::{SessionDescription, SignalingMessage};
use crate::registry::{Generation, RegistryEvent, SlotIndex};

pub mod webrtc;

pub use self::webrtc::WebRtcCapabilityFactory;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    AwaitingOffer,
    DescribingRemote,
    GeneratingAnswer,
    GatheringCandidates,
    Ready,
    Failed,
}

impl fmt::Display for NegotiationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NegotiationState::AwaitingOffer => "awaiting offer",
            NegotiationState::DescribingRemote => "describing remote",
            NegotiationState::GeneratingAnswer => "generating answer",
            NegotiationState::GatheringCandidates => "gathering candidates",
            NegotiationState::Ready => "ready",
            NegotiationState::Failed => "failed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IceCandidate {
    pub candidate: String,
    pub sdp_mid: Option<String>,
    pub sdp_mline_index: Option<u16>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl fmt::Display for ConnectivityState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectivityState::New => "new",
            ConnectivityState::Connecting => "connecting",
            ConnectivityState::Connected => "connected",
            ConnectivityState::Disconnected => "disconnected",
            ConnectivityState::Failed => "failed",
            ConnectivityState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Everything the capability reports back to the session's owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NegotiationEvent {
    RemoteApplied(Result<(), CapabilityError>),
    AnswerCreated(Result<SessionDescription, CapabilityError>),
    LocalApplied(Result<(), CapabilityError>),
    /// A discovered candidate, or `None` once discovery is exhausted.
    Candidate(Option<IceCandidate>),
    Connectivity(ConnectivityState),
    Track(MediaStreamRef),
}

impl NegotiationEvent {
    pub fn label(&self) -> &'static str {
        match self {
            NegotiationEvent::RemoteApplied(_) => "remote_applied",
            NegotiationEvent::AnswerCreated(_) => "answer_created",
            NegotiationEvent::LocalApplied(_) => "local_applied",
            NegotiationEvent::Candidate(Some(_)) => "candidate",
            NegotiationEvent::Candidate(None) => "gathering_complete",
            NegotiationEvent::Connectivity(_) => "connectivity",
            NegotiationEvent::Track(_) => "track",
        }
    }
}

/// Sending half handed to a capability; tags events with the session that
/// produced them.
#[derive(Debug, Clone)]
pub struct SessionEvents {
    slot: SlotIndex,
    generation: Generation,
    tx: mpsc::UnboundedSender<RegistryEvent>,
}

impl SessionEvents {
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

    pub fn generation(&self) -> Generation {
        self.generation
    }

    pub fn emit(&self, event: NegotiationEvent) -> bool {
        self.tx
            .send(RegistryEvent::Negotiation {
                slot: self.slot,
                generation: self.generation,
                event,
            })
            .is_ok()
    }
}

/// The external facility that performs media transport setup.
///
/// Candidate discovery, connectivity changes and arriving tracks are pushed
/// through the [`SessionEvents`] the capability was created with.
#[async_trait]
pub trait NegotiationCapability: Send + Sync {
    async fn apply_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), CapabilityError>;

    async fn create_answer(&self) -> Result<SessionDescription, CapabilityError>;

    async fn apply_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), CapabilityError>;

    /// The local description as it stands now, gathered candidates included.
    fn local_description(&self) -> Option<SessionDescription>;

    async fn close(&self);
}

pub trait CapabilityFactory: Send + Sync {
    fn create(&self, events: SessionEvents) -> Arc<dyn NegotiationCapability>;
}

/// What the owner has to do after feeding the session an event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    /// Nothing observable changed.
    Unchanged,
    /// The session moved to a new non-terminal state.
    Entered(NegotiationState),
    /// The session reached `Ready`; the message must go out on the channel.
    Ready(SignalingMessage),
}

pub struct NegotiationSession {
    slot: SlotIndex,
    generation: Generation,
    state: NegotiationState,
    remote: Option<SessionDescription>,
    local: Option<SessionDescription>,
    pending_candidates: usize,
    gathering_complete: bool,
    description_sent: bool,
    failure: Option<String>,
    capability: Arc<dyn NegotiationCapability>,
    events: SessionEvents,
}

impl fmt::Debug for NegotiationSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NegotiationSession")
            .field("slot", &self.slot)
            .field("generation", &self.generation)
            .field("state", &self.state)
            .field("pending_candidates", &self.pending_candidates)
            .field("description_sent", &self.description_sent)
            .finish_non_exhaustive()
    }
}

impl NegotiationSession {
    pub fn new(factory: &dyn CapabilityFactory, events: SessionEvents) -> Self {
        let capability = factory.create(events.clone());
        Self {
            slot: events.slot,
            generation: events.generation(),
            state: NegotiationState::AwaitingOffer,
            remote: None,
            local: None,
            pending_candidates: 0,
            gathering_complete: false,
            description_sent: false,
            failure: None,
            capability,
            events,
        }
    }

    pub fn generation(&self) -> Generation {
        self.generation
    }

    pub fn state(&self) -> NegotiationState {
        self.state
    }

    pub fn remote_description(&self) -> Option<&SessionDescription> {
        self.remote.as_ref()
    }

    pub fn local_description(&self) -> Option<&SessionDescription> {
        self.local.as_ref()
    }

    pub fn pending_candidates(&self) -> usize {
        self.pending_candidates
    }

    pub fn failure(&self) -> Option<&str> {
        self.failure.as_deref()
    }

    pub fn offer_received(
        &mut self,
        remote: SessionDescription,
    ) -> Result<Transition, NegotiationError> {
        if self.state != NegotiationState::AwaitingOffer {
            return Err(self.out_of_order("offer"));
        }
        self.remote = Some(remote.clone());
        self.enter(NegotiationState::DescribingRemote);

        let capability = Arc::clone(&self.capability);
        let events = self.events.clone();
        tokio::spawn(async move {
            let result = capability.apply_remote_description(remote).await;
            events.emit(NegotiationEvent::RemoteApplied(result));
        });
        Ok(Transition::Entered(NegotiationState::DescribingRemote))
    }

    /// Feed a capability event addressed to this session's generation.
    pub fn handle(&mut self, event: NegotiationEvent) -> Result<Transition, NegotiationError> {
        if self.state == NegotiationState::Failed {
            return Ok(Transition::Unchanged);
        }
        match event {
            NegotiationEvent::RemoteApplied(result) => {
                if self.state != NegotiationState::DescribingRemote {
                    return Err(self.out_of_order("remote_applied"));
                }
                result.map_err(|err| self.fail("apply remote description", err))?;
                self.enter(NegotiationState::GeneratingAnswer);

                let capability = Arc::clone(&self.capability);
                let events = self.events.clone();
                tokio::spawn(async move {
                    let result = capability.create_answer().await;
                    events.emit(NegotiationEvent::AnswerCreated(result));
                });
                Ok(Transition::Entered(NegotiationState::GeneratingAnswer))
            }
            NegotiationEvent::AnswerCreated(result) => {
                if self.state != NegotiationState::GeneratingAnswer || self.local.is_some() {
                    return Err(self.out_of_order("answer_created"));
                }
                let answer = result.map_err(|err| self.fail("create answer", err))?;
                self.local = Some(answer.clone());

                let capability = Arc::clone(&self.capability);
                let events = self.events.clone();
                tokio::spawn(async move {
                    let result = capability.apply_local_description(answer).await;
                    events.emit(NegotiationEvent::LocalApplied(result));
                });
                Ok(Transition::Unchanged)
            }
            NegotiationEvent::LocalApplied(result) => {
                if self.state != NegotiationState::GeneratingAnswer || self.local.is_none() {
                    return Err(self.out_of_order("local_applied"));
                }
                result.map_err(|err| self.fail("apply local description", err))?;
                self.enter(NegotiationState::GatheringCandidates);
                if self.gathering_complete {
                    return self.complete_gathering();
                }
                Ok(Transition::Entered(NegotiationState::GatheringCandidates))
            }
            NegotiationEvent::Candidate(candidate) => self.candidate(candidate),
            NegotiationEvent::Connectivity(_) | NegotiationEvent::Track(_) => {
                Ok(Transition::Unchanged)
            }
        }
    }

    fn candidate(
        &mut self,
        candidate: Option<IceCandidate>,
    ) -> Result<Transition, NegotiationError> {
        // Gathering starts while the local answer is still being applied, so
        // early candidates are counted in GeneratingAnswer as well.
        let collecting = matches!(
            self.state,
            NegotiationState::GeneratingAnswer | NegotiationState::GatheringCandidates
        );
        if !collecting {
            return Ok(Transition::Unchanged);
        }
        match candidate {
            Some(candidate) => {
                self.pending_candidates += 1;
                tracing::trace!(
                    target: "beach_cams::negotiation",
                    slot = %self.slot,
                    generation = self.generation,
                    pending = self.pending_candidates,
                    candidate = %candidate.candidate,
                    "candidate held for final description"
                );
                Ok(Transition::Unchanged)
            }
            None if self.state == NegotiationState::GatheringCandidates => {
                self.complete_gathering()
            }
            None => {
                self.gathering_complete = true;
                Ok(Transition::Unchanged)
            }
        }
    }

    fn complete_gathering(&mut self) -> Result<Transition, NegotiationError> {
        self.gathering_complete = true;
        if self.description_sent {
            return Ok(Transition::Unchanged);
        }
        let Some(description) = self
            .capability
            .local_description()
            .or_else(|| self.local.clone())
        else {
            return Err(self.fail(
                "gather candidates",
                CapabilityError::new("local description missing after gathering"),
            ));
        };
        self.local = Some(description.clone());
        self.description_sent = true;
        self.enter(NegotiationState::Ready);
        Ok(Transition::Ready(SignalingMessage::Description(description)))
    }

    /// Marks the session failed after its description could not be delivered.
    pub fn abort(&mut self, cause: impl Into<String>) {
        let cause = cause.into();
        self.failure = Some(cause);
        self.enter(NegotiationState::Failed);
    }

    /// Releases the capability. Completions still in flight are left to be
    /// discarded by generation.
    pub fn close(self) {
        tracing::debug!(
            target: "beach_cams::negotiation",
            slot = %self.slot,
            generation = self.generation,
            state = %self.state,
            "negotiation session discarded"
        );
        let capability = self.capability;
        tokio::spawn(async move {
            capability.close().await;
        });
    }

    fn enter(&mut self, state: NegotiationState) {
        tracing::debug!(
            target: "beach_cams::negotiation",
            slot = %self.slot,
            generation = self.generation,
            from = %self.state,
            to = %state,
            "negotiation transition"
        );
        self.state = state;
    }

    fn fail(&mut self, step: &'static str, err: CapabilityError) -> NegotiationError {
        let error = NegotiationError::capability(step, err);
        tracing::warn!(
            target: "beach_cams::negotiation",
            slot = %self.slot,
            generation = self.generation,
            error = %error,
            "negotiation failed"
        );
        self.abort(error.to_string());
        error
    }

    fn out_of_order(&self, event: &'static str) -> NegotiationError {
        NegotiationError::OutOfOrder {
            state: self.state,
            event,
        }
    }
}
