use std::collections::HashMap;

use parking_lot::Mutex;

use crate::registry::SlotIndex;

/// Reference to a negotiated remote media stream.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MediaStreamRef {
    pub stream_id: String,
    pub track_id: String,
    pub kind: String,
}

/// Receives negotiated media. `attach` may be called repeatedly with the same
/// stream and must treat repeats as no-ops.
pub trait MediaSink: Send + Sync {
    fn attach(&self, slot: SlotIndex, stream: MediaStreamRef);

    /// Called when the slot's session is discarded.
    fn detach(&self, _slot: SlotIndex) {}
}

/// Logs each newly attached stream and remembers the current stream per slot.
#[derive(Debug, Default)]
pub struct TracingSink {
    attached: Mutex<HashMap<SlotIndex, String>>,
}

impl TracingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self, slot: SlotIndex) -> Option<String> {
        self.attached.lock().get(&slot).cloned()
    }
}

impl MediaSink for TracingSink {
    fn attach(&self, slot: SlotIndex, stream: MediaStreamRef) {
        let mut attached = self.attached.lock();
        if attached.get(&slot) == Some(&stream.stream_id) {
            return;
        }
        tracing::info!(
            target: "beach_cams::media",
            %slot,
            stream_id = %stream.stream_id,
            track_id = %stream.track_id,
            kind = %stream.kind,
            "media stream attached"
        );
        attached.insert(slot, stream.stream_id);
    }

    fn detach(&self, slot: SlotIndex) {
        if self.attached.lock().remove(&slot).is_some() {
            tracing::debug!(target: "beach_cams::media", %slot, "media stream detached");
        }
    }
}
