use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc::{self, error::TryRecvError};
use url::Url;

use super::{ChannelEvent, ChannelEvents, ChannelLink, Connector};
use crate::registry::SlotIndex;

/// In-memory connector. Every `connect` call yields a [`MockLink`] through
/// which a test plays the remote side of the connection.
#[derive(Debug, Clone, Default)]
pub struct MockConnector {
    links: Arc<Mutex<Vec<Arc<MockLink>>>>,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn links(&self) -> Vec<Arc<MockLink>> {
        self.links.lock().clone()
    }

    pub fn links_for(&self, slot: SlotIndex) -> Vec<Arc<MockLink>> {
        self.links
            .lock()
            .iter()
            .filter(|link| link.slot() == slot)
            .cloned()
            .collect()
    }

    pub fn latest(&self, slot: SlotIndex) -> Option<Arc<MockLink>> {
        self.links_for(slot).pop()
    }
}

impl Connector for MockConnector {
    fn connect(&self, endpoint: &Url, events: ChannelEvents) -> ChannelLink {
        let (tx, rx) = mpsc::unbounded_channel();
        let link = Arc::new(MockLink {
            endpoint: endpoint.clone(),
            events,
            outbound: Mutex::new(rx),
            sent: Mutex::new(Vec::new()),
        });
        self.links.lock().push(link);
        ChannelLink::new(tx)
    }
}

#[derive(Debug)]
pub struct MockLink {
    endpoint: Url,
    events: ChannelEvents,
    outbound: Mutex<mpsc::UnboundedReceiver<String>>,
    sent: Mutex<Vec<String>>,
}

impl MockLink {
    pub fn slot(&self) -> SlotIndex {
        self.events.slot()
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    pub fn open(&self) {
        self.events.emit(ChannelEvent::Opened);
    }

    pub fn deliver(&self, frame: impl Into<String>) {
        self.events.emit(ChannelEvent::Message(frame.into()));
    }

    pub fn close(&self) {
        self.events.emit(ChannelEvent::Closed);
    }

    pub fn fail(&self, detail: impl Into<String>) {
        self.events.emit(ChannelEvent::Errored(detail.into()));
    }

    /// Refuses further frames from the client without emitting `Closed`, as
    /// when the socket writer dies first. Frames already written stay in `sent`.
    pub fn stop_accepting(&self) {
        self.drain();
        self.outbound.lock().close();
    }

    /// Every frame the client has written so far, in order.
    pub fn sent(&self) -> Vec<String> {
        self.drain();
        self.sent.lock().clone()
    }

    /// True once the owning channel has been dropped.
    pub fn is_released(&self) -> bool {
        self.drain()
    }

    fn drain(&self) -> bool {
        let mut outbound = self.outbound.lock();
        let mut sent = self.sent.lock();
        loop {
            match outbound.try_recv() {
                Ok(frame) => sent.push(frame),
                Err(TryRecvError::Empty) => return false,
                Err(TryRecvError::Disconnected) => return true,
            }
        }
    }
}
