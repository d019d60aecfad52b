use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::sync::Notify;
use tokio::time::timeout;
use tracing_subscriber::{EnvFilter, fmt::SubscriberBuilder};
use url::Url;

use beach_cams_core::error::CapabilityError;
use beach_cams_core::media::{MediaStreamRef, TracingSink};
use beach_cams_core::negotiation::{
    CapabilityFactory, IceCandidate, NegotiationCapability, NegotiationEvent, NegotiationState,
    SessionEvents,
};
use beach_cams_core::protocol::{CLOSE_FRAME, SessionDescription};
use beach_cams_core::registry::{
    RegistryConfig, RegistryEvent, SlotIndex, SlotRegistry, SlotState,
};
use beach_cams_core::status::{Phase, StatusReporter};
use beach_cams_core::transport::{ChannelState, MockConnector, MockLink};

const OFFER: &str = r#"{"type":"offer","sdp":"v=0\r\nm=video 9 UDP/TLS/RTP/SAVPF 96\r\n"}"#;

fn init_tracing() {
    let _ = SubscriberBuilder::default()
        .with_test_writer()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
}

#[derive(Debug, Clone, Copy, Default)]
struct Script {
    hold_remote: bool,
    hold_answer: bool,
    fail_answer: bool,
}

struct ScriptedCapability {
    events: SessionEvents,
    script: Script,
    release: Notify,
    final_description: Mutex<Option<SessionDescription>>,
    closed: AtomicBool,
}

impl ScriptedCapability {
    fn release(&self) {
        self.release.notify_one();
    }

    fn candidate(&self, n: u16) {
        self.events
            .emit(NegotiationEvent::Candidate(Some(IceCandidate {
                candidate: format!("candidate:{n} 1 udp 2122260223 192.168.1.{n} 5000 typ host"),
                sdp_mid: Some("0".into()),
                sdp_mline_index: Some(0),
            })));
    }

    fn finish_gathering(&self, sdp: &str) {
        *self.final_description.lock() = Some(SessionDescription::answer(sdp));
        self.events.emit(NegotiationEvent::Candidate(None));
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl NegotiationCapability for ScriptedCapability {
    async fn apply_remote_description(
        &self,
        _description: SessionDescription,
    ) -> Result<(), CapabilityError> {
        if self.script.hold_remote {
            self.release.notified().await;
        }
        Ok(())
    }

    async fn create_answer(&self) -> Result<SessionDescription, CapabilityError> {
        if self.script.hold_answer {
            self.release.notified().await;
        }
        if self.script.fail_answer {
            return Err(CapabilityError::new("no codecs in common"));
        }
        Ok(SessionDescription::answer("answer"))
    }

    async fn apply_local_description(
        &self,
        _description: SessionDescription,
    ) -> Result<(), CapabilityError> {
        Ok(())
    }

    fn local_description(&self) -> Option<SessionDescription> {
        self.final_description.lock().clone()
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

#[derive(Default)]
struct ScriptedFactory {
    script: Mutex<Script>,
    created: Mutex<Vec<Arc<ScriptedCapability>>>,
}

impl ScriptedFactory {
    fn set_script(&self, script: Script) {
        *self.script.lock() = script;
    }

    fn latest(&self) -> Arc<ScriptedCapability> {
        self.created
            .lock()
            .last()
            .cloned()
            .expect("no capability created yet")
    }

    fn count(&self) -> usize {
        self.created.lock().len()
    }
}

impl CapabilityFactory for ScriptedFactory {
    fn create(&self, events: SessionEvents) -> Arc<dyn NegotiationCapability> {
        let capability = Arc::new(ScriptedCapability {
            events,
            script: *self.script.lock(),
            release: Notify::new(),
            final_description: Mutex::new(None),
            closed: AtomicBool::new(false),
        });
        self.created.lock().push(Arc::clone(&capability));
        capability
    }
}

#[derive(Default)]
struct RecordingReporter(Mutex<Vec<(SlotIndex, Phase)>>);

impl RecordingReporter {
    fn phases(&self, slot: SlotIndex) -> Vec<Phase> {
        self.0
            .lock()
            .iter()
            .filter(|(s, _)| *s == slot)
            .map(|(_, phase)| phase.clone())
            .collect()
    }
}

impl StatusReporter for RecordingReporter {
    fn report(&self, slot: SlotIndex, phase: Phase) {
        self.0.lock().push((slot, phase));
    }
}

struct Harness {
    registry: SlotRegistry,
    connector: MockConnector,
    factory: Arc<ScriptedFactory>,
    reporter: Arc<RecordingReporter>,
    sink: Arc<TracingSink>,
}

impl Harness {
    fn new(slots: usize) -> Self {
        init_tracing();
        let connector = MockConnector::new();
        let factory = Arc::new(ScriptedFactory::default());
        let reporter = Arc::new(RecordingReporter::default());
        let sink = Arc::new(TracingSink::new());
        let registry = SlotRegistry::new(
            RegistryConfig {
                slot_count: slots,
                endpoint: Url::parse("ws://127.0.0.1:8080").unwrap(),
            },
            Arc::new(connector.clone()),
            factory.clone(),
            reporter.clone(),
            sink.clone(),
        );
        Self {
            registry,
            connector,
            factory,
            reporter,
            sink,
        }
    }

    fn link(&self, slot: SlotIndex) -> Arc<MockLink> {
        self.connector.latest(slot).expect("slot has a link")
    }

    /// Dispatches queued events until `done` holds.
    async fn pump_until(&mut self, done: impl Fn(&SlotRegistry) -> bool) {
        let registry = &mut self.registry;
        timeout(Duration::from_secs(5), async {
            while !done(&*registry) {
                let event = registry.next_event().await.expect("event queue open");
                registry.dispatch(event);
            }
        })
        .await
        .expect("registry did not reach expected state");
    }

    async fn next_event(&mut self) -> RegistryEvent {
        timeout(Duration::from_secs(5), self.registry.next_event())
            .await
            .expect("no event arrived")
            .expect("event queue open")
    }

    /// Gives spawned tasks a chance to run, then dispatches whatever they queued.
    async fn settle(&mut self) {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        while let Some(event) = self.registry.try_next_event() {
            self.registry.dispatch(event);
        }
    }

    async fn open(&mut self, slot: SlotIndex, source: &str) -> Arc<MockLink> {
        self.registry.activate(slot, source).unwrap();
        let link = self.link(slot);
        link.open();
        self.pump_until(|r| r.slot_state(slot) == Some(SlotState::SignalingOpen))
            .await;
        link
    }

    async fn reach(&mut self, slot: SlotIndex, state: NegotiationState) {
        self.pump_until(|r| r.negotiation_state(slot) == Some(state))
            .await;
    }
}

fn slot(n: usize) -> SlotIndex {
    SlotIndex::new(n)
}

#[tokio::test]
async fn first_frame_is_raw_source_address() {
    let mut h = Harness::new(4);
    let link = h.open(slot(2), "rtsp://cam2.local/stream").await;

    assert_eq!(link.sent(), vec!["rtsp://cam2.local/stream".to_string()]);
    assert_eq!(link.endpoint().as_str(), "ws://127.0.0.1:8080/");
    assert_eq!(
        h.reporter.phases(slot(2)),
        vec![Phase::Connecting, Phase::SignalingOpen]
    );
    assert!(h.reporter.phases(slot(1)).is_empty());
}

#[tokio::test]
async fn offer_moves_session_to_describing_remote() {
    let mut h = Harness::new(4);
    h.factory.set_script(Script {
        hold_remote: true,
        ..Script::default()
    });
    let link = h.open(slot(1), "rtsp://cam1").await;
    assert_eq!(h.registry.negotiation_state(slot(1)), None);

    link.deliver(OFFER);
    h.reach(slot(1), NegotiationState::DescribingRemote).await;
    h.settle().await;

    assert_eq!(
        h.registry.negotiation_state(slot(1)),
        Some(NegotiationState::DescribingRemote)
    );
    assert_eq!(h.factory.count(), 1);
    assert_eq!(
        h.reporter.phases(slot(1)).last(),
        Some(&Phase::OfferReceived)
    );
}

#[tokio::test]
async fn description_sent_once_after_gathering_completes() {
    let mut h = Harness::new(4);
    let link = h.open(slot(1), "rtsp://cam1").await;
    link.deliver(OFFER);
    h.reach(slot(1), NegotiationState::GatheringCandidates).await;

    let capability = h.factory.latest();
    for n in 1..=3 {
        capability.candidate(n);
    }
    h.pump_until(|r| r.pending_candidates(slot(1)) == Some(3))
        .await;
    assert_eq!(
        h.registry.negotiation_state(slot(1)),
        Some(NegotiationState::GatheringCandidates)
    );
    assert_eq!(link.sent().len(), 1, "nothing goes out before gathering ends");

    capability.finish_gathering("answer\r\na=candidate:1\r\na=candidate:2\r\na=candidate:3\r\n");
    h.reach(slot(1), NegotiationState::Ready).await;

    let sent = link.sent();
    assert_eq!(sent.len(), 2);
    let description: Value = serde_json::from_str(&sent[1]).unwrap();
    assert_eq!(
        description,
        json!({
            "type": "answer",
            "sdp": "answer\r\na=candidate:1\r\na=candidate:2\r\na=candidate:3\r\n",
        })
    );

    capability.finish_gathering("late");
    h.settle().await;
    assert_eq!(link.sent().len(), 2);

    assert_eq!(
        h.reporter.phases(slot(1)),
        vec![
            Phase::Connecting,
            Phase::SignalingOpen,
            Phase::OfferReceived,
            Phase::Negotiating,
            Phase::Gathering,
            Phase::Ready,
        ]
    );
}

#[tokio::test]
async fn description_on_dead_writer_fails_session() {
    let mut h = Harness::new(2);
    let link = h.open(slot(1), "rtsp://cam1").await;
    link.deliver(OFFER);
    h.reach(slot(1), NegotiationState::GatheringCandidates).await;

    link.stop_accepting();
    h.factory.latest().finish_gathering("answer");
    h.reach(slot(1), NegotiationState::Failed).await;

    let phases = h.reporter.phases(slot(1));
    assert_eq!(
        phases.last(),
        Some(&Phase::Error("signaling channel for slot 1 closed".into()))
    );
    assert!(!phases.contains(&Phase::Ready));
    assert_eq!(link.sent(), vec!["rtsp://cam1".to_string()]);
    assert_eq!(h.registry.slot_state(slot(1)), Some(SlotState::SignalingOpen));
}

#[tokio::test]
async fn failure_on_one_slot_leaves_others_untouched() {
    let mut h = Harness::new(4);
    let first = h.open(slot(1), "rtsp://cam1").await;
    let second = h.open(slot(2), "rtsp://cam2").await;
    second.deliver(OFFER);
    h.reach(slot(2), NegotiationState::GatheringCandidates).await;
    let before: Vec<_> = h
        .registry
        .snapshot()
        .into_iter()
        .filter(|s| s.slot != slot(1))
        .collect();

    first.deliver("{not json");
    first.fail("connection reset");
    h.pump_until(|r| r.slot_state(slot(1)) == Some(SlotState::Errored))
        .await;

    let after: Vec<_> = h
        .registry
        .snapshot()
        .into_iter()
        .filter(|s| s.slot != slot(1))
        .collect();
    assert_eq!(before, after);
    assert_eq!(h.registry.channel_state(slot(1)), None);
    assert_eq!(second.sent(), vec!["rtsp://cam2".to_string()]);
    assert!(matches!(
        h.reporter.phases(slot(1)).last(),
        Some(Phase::Error(_))
    ));
    assert!(
        !h.reporter
            .phases(slot(2))
            .iter()
            .any(|phase| matches!(phase, Phase::Error(_)))
    );
}

#[tokio::test]
async fn reactivation_leaves_one_live_channel() {
    let mut h = Harness::new(4);
    let old = h.open(slot(1), "rtsp://old").await;
    old.deliver(OFFER);
    h.reach(slot(1), NegotiationState::GatheringCandidates).await;
    let old_capability = h.factory.latest();

    h.registry.activate(slot(1), "rtsp://new").unwrap();
    let links = h.connector.links_for(slot(1));
    assert_eq!(links.len(), 2);
    assert!(links[0].is_released());
    assert!(!links[1].is_released());
    assert_eq!(h.registry.negotiation_state(slot(1)), None);
    assert_eq!(
        h.registry.channel_state(slot(1)),
        Some(ChannelState::Connecting)
    );

    // Late traffic from the discarded connection and session goes nowhere.
    old.deliver(OFFER);
    old.close();
    old_capability.finish_gathering("stale");
    h.settle().await;
    assert_eq!(h.registry.slot_state(slot(1)), Some(SlotState::Connecting));
    assert_eq!(h.registry.negotiation_state(slot(1)), None);
    assert_eq!(old.sent(), vec!["rtsp://old".to_string()]);
    h.settle().await;
    assert!(old_capability.is_closed());

    let new = h.link(slot(1));
    new.open();
    h.pump_until(|r| r.slot_state(slot(1)) == Some(SlotState::SignalingOpen))
        .await;
    assert_eq!(new.sent(), vec!["rtsp://new".to_string()]);
}

#[tokio::test]
async fn stale_completion_is_discarded_after_reactivation() {
    let mut h = Harness::new(4);
    h.factory.set_script(Script {
        hold_answer: true,
        ..Script::default()
    });
    let old = h.open(slot(1), "rtsp://cam1").await;
    old.deliver(OFFER);
    h.reach(slot(1), NegotiationState::GeneratingAnswer).await;
    let stale = h.factory.latest();

    let new = h.open(slot(1), "rtsp://cam1-alt").await;
    stale.release();

    let event = h.next_event().await;
    assert!(matches!(
        event,
        RegistryEvent::Negotiation {
            event: NegotiationEvent::AnswerCreated(Ok(_)),
            ..
        }
    ));
    h.registry.dispatch(event);
    h.settle().await;

    assert_eq!(h.registry.negotiation_state(slot(1)), None);
    assert_eq!(h.registry.slot_state(slot(1)), Some(SlotState::SignalingOpen));
    assert_eq!(new.sent(), vec!["rtsp://cam1-alt".to_string()]);
    assert_eq!(old.sent(), vec!["rtsp://cam1".to_string()]);
}

#[tokio::test]
async fn close_during_answer_generation_tears_down_quietly() {
    let mut h = Harness::new(4);
    h.factory.set_script(Script {
        hold_answer: true,
        ..Script::default()
    });
    let link = h.open(slot(3), "rtsp://cam3").await;
    link.deliver(OFFER);
    h.reach(slot(3), NegotiationState::GeneratingAnswer).await;
    let capability = h.factory.latest();

    link.close();
    h.pump_until(|r| r.slot_state(slot(3)) == Some(SlotState::Closed))
        .await;
    assert_eq!(h.registry.negotiation_state(slot(3)), None);
    assert_eq!(h.registry.channel_state(slot(3)), None);

    capability.release();
    h.settle().await;
    h.settle().await;
    assert_eq!(link.sent(), vec!["rtsp://cam3".to_string()]);
    assert_eq!(h.reporter.phases(slot(3)).last(), Some(&Phase::Closed));
    assert!(capability.is_closed());
}

#[tokio::test]
async fn capability_failure_fails_negotiation_but_keeps_channel() {
    let mut h = Harness::new(2);
    h.factory.set_script(Script {
        fail_answer: true,
        ..Script::default()
    });
    let link = h.open(slot(1), "rtsp://cam1").await;
    link.deliver(OFFER);
    h.reach(slot(1), NegotiationState::Failed).await;

    assert_eq!(h.registry.slot_state(slot(1)), Some(SlotState::SignalingOpen));
    assert_eq!(
        h.reporter.phases(slot(1)).last(),
        Some(&Phase::Error(
            "create answer failed: no codecs in common".to_string()
        ))
    );
    assert_eq!(link.sent().len(), 1);
}

#[tokio::test]
async fn second_offer_on_same_slot_is_reported_not_applied() {
    let mut h = Harness::new(2);
    h.factory.set_script(Script {
        hold_remote: true,
        ..Script::default()
    });
    let link = h.open(slot(1), "rtsp://cam1").await;
    link.deliver(OFFER);
    h.reach(slot(1), NegotiationState::DescribingRemote).await;

    link.deliver(OFFER);
    h.settle().await;
    assert_eq!(h.factory.count(), 1);
    assert_eq!(
        h.registry.negotiation_state(slot(1)),
        Some(NegotiationState::DescribingRemote)
    );
    assert_eq!(
        h.reporter.phases(slot(1)).last(),
        Some(&Phase::Error("unexpected offer message".to_string()))
    );
}

#[tokio::test]
async fn tracks_reach_sink_and_connectivity_is_reported() {
    let mut h = Harness::new(1);
    let link = h.open(slot(1), "rtsp://cam1").await;
    link.deliver(OFFER);
    h.reach(slot(1), NegotiationState::GatheringCandidates).await;

    let capability = h.factory.latest();
    let stream = MediaStreamRef {
        stream_id: "cam1".into(),
        track_id: "cam1-video".into(),
        kind: "video".into(),
    };
    capability
        .events
        .emit(NegotiationEvent::Track(stream.clone()));
    capability
        .events
        .emit(NegotiationEvent::Track(stream));
    capability.events.emit(NegotiationEvent::Connectivity(
        beach_cams_core::negotiation::ConnectivityState::Connected,
    ));
    h.settle().await;

    assert_eq!(h.sink.current(slot(1)).as_deref(), Some("cam1"));
    assert_eq!(
        h.reporter.phases(slot(1)).last(),
        Some(&Phase::ConnectivityChanged("connected".to_string()))
    );

    h.registry.deactivate(slot(1)).unwrap();
    assert_eq!(h.sink.current(slot(1)), None);
}

#[tokio::test]
async fn shutdown_closes_every_live_slot() {
    let mut h = Harness::new(3);
    let first = h.open(slot(1), "rtsp://cam1").await;
    h.registry.activate(slot(3), "rtsp://cam3").unwrap();
    let third = h.link(slot(3));

    h.registry.shutdown();

    assert_eq!(first.sent(), vec!["rtsp://cam1".to_string(), CLOSE_FRAME.to_string()]);
    assert!(first.is_released());
    assert!(third.is_released());
    assert!(third.sent().is_empty());
    for snapshot in h.registry.snapshot() {
        assert_eq!(snapshot.state, SlotState::Idle);
        assert_eq!(snapshot.channel, None);
    }
    assert!(h.reporter.phases(slot(2)).is_empty());
}

#[tokio::test]
async fn run_until_processes_events_and_shuts_down() {
    let mut h = Harness::new(1);
    h.registry.activate(slot(1), "rtsp://cam1").unwrap();
    let link = h.link(slot(1));
    link.open();

    let registry = &mut h.registry;
    registry
        .run_until(async {
            tokio::time::sleep(Duration::from_millis(50)).await;
        })
        .await;

    assert_eq!(link.sent(), vec!["rtsp://cam1".to_string(), CLOSE_FRAME.to_string()]);
    assert_eq!(h.registry.slot_state(slot(1)), Some(SlotState::Idle));
}
