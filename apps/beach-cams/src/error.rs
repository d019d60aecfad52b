use thiserror::Error;

use crate::negotiation::NegotiationState;
use crate::registry::SlotIndex;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ActivationError {
    #[error("source address must not be empty")]
    InvalidInput,
    #[error("slot {0} is outside the configured range")]
    UnknownSlot(SlotIndex),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ChannelError {
    #[error("signaling channel for slot {0} is not open")]
    NotOpen(SlotIndex),
    #[error("signaling channel for slot {0} closed")]
    Closed(SlotIndex),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("malformed signaling message: {0}")]
    Malformed(String),
    #[error("failed to encode signaling message: {0}")]
    Encode(String),
}

/// Failure reported by the external negotiation capability.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct CapabilityError(pub String);

impl CapabilityError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

impl From<webrtc::Error> for CapabilityError {
    fn from(err: webrtc::Error) -> Self {
        Self(err.to_string())
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum NegotiationError {
    #[error("{step} failed: {cause}")]
    Capability { step: &'static str, cause: String },
    #[error("{event} is not valid while {state}")]
    OutOfOrder {
        state: NegotiationState,
        event: &'static str,
    },
}

impl NegotiationError {
    pub fn capability(step: &'static str, err: CapabilityError) -> Self {
        NegotiationError::Capability {
            step,
            cause: err.0,
        }
    }
}

/// Error surfaced by the registry's event handlers. None of these cross slots.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SlotError {
    #[error(transparent)]
    Activation(#[from] ActivationError),
    #[error(transparent)]
    Channel(#[from] ChannelError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Negotiation(#[from] NegotiationError),
    #[error("unexpected {0} message on slot")]
    UnexpectedMessage(&'static str),
    #[error("slot {0} is outside the configured range")]
    UnknownSlot(SlotIndex),
}
