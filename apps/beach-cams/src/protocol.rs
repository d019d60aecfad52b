//! Wire format spoken over a slot's signaling channel.
//!
//! The first outbound frame on every channel is the raw source address
//! (not JSON). Everything after that is a JSON session description:
//! `{"type":"offer","sdp":"..."}` inbound and `{"type":"answer","sdp":"..."}`
//! outbound. Frames are delimited by the transport's own message
//! boundaries.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{ActivationError, ProtocolError};

/// Plain-text frame asking the signaling server to drop the stream.
pub const CLOSE_FRAME: &str = "CLOSE";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
    Pranswer,
    Rollback,
}

impl SdpKind {
    pub fn as_str(self) -> &'static str {
        match self {
            SdpKind::Offer => "offer",
            SdpKind::Answer => "answer",
            SdpKind::Pranswer => "pranswer",
            SdpKind::Rollback => "rollback",
        }
    }
}

impl fmt::Display for SdpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An opaque negotiated-capabilities document exchanged between peers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalingMessage {
    /// Remote session description offered by the signaling server.
    Offer(SessionDescription),
    /// Local session description, sent once candidate gathering completes.
    Description(SessionDescription),
}

impl SignalingMessage {
    /// Parse an inbound JSON frame.
    pub fn parse(frame: &str) -> Result<Self, ProtocolError> {
        let description: SessionDescription = serde_json::from_str(frame)
            .map_err(|err| ProtocolError::Malformed(err.to_string()))?;
        Ok(match description.kind {
            SdpKind::Offer => SignalingMessage::Offer(description),
            _ => SignalingMessage::Description(description),
        })
    }

    /// Encode as the JSON frame carried on the wire. Both variants serialize
    /// as the bare description; the `type` field tells them apart.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self.description())
            .map_err(|err| ProtocolError::Encode(err.to_string()))
    }

    pub fn description(&self) -> &SessionDescription {
        match self {
            SignalingMessage::Offer(desc) | SignalingMessage::Description(desc) => desc,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            SignalingMessage::Offer(_) => "offer",
            SignalingMessage::Description(_) => "description",
        }
    }
}

/// Operator-entered media source address, sent verbatim as the first frame.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SourceAddress(String);

impl SourceAddress {
    /// Surrounding whitespace is dropped; nothing else is validated here.
    pub fn parse(raw: &str) -> Result<Self, ActivationError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(ActivationError::InvalidInput);
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn to_frame(&self) -> String {
        self.0.clone()
    }
}

impl fmt::Display for SourceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
