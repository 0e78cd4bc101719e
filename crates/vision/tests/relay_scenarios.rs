use std::{
    io::Cursor,
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    thread,
};

use image::{ImageFormat, Rgb, RgbImage};
use ml_core::{Detection, DetectionEngine, DetectionError, DetectionParams};
use vision::{
    Broadcaster, CycleOutcome, DeliveryError, IngestSession, ProducerSlot, RelayConfig,
    SharedState, ViewerRegistry, ViewerSink,
};

/// Engine double that counts calls and labels each pass.
#[derive(Default)]
struct CountingEngine {
    calls: AtomicUsize,
}

impl DetectionEngine for CountingEngine {
    fn name(&self) -> &str {
        "counting"
    }

    fn detect(
        &self,
        _image: &RgbImage,
        _params: &DetectionParams,
    ) -> Result<Vec<Detection>, DetectionError> {
        let pass = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(vec![
            Detection::new(format!("object{pass}"), 0.734),
            Detection::new("person", 0.5),
        ])
    }
}

struct FailingEngine;

impl DetectionEngine for FailingEngine {
    fn name(&self) -> &str {
        "failing"
    }

    fn detect(
        &self,
        _image: &RgbImage,
        _params: &DetectionParams,
    ) -> Result<Vec<Detection>, DetectionError> {
        Err(DetectionError::Inference("device lost".into()))
    }
}

#[derive(Default)]
struct MemoryViewer {
    messages: Mutex<Vec<Arc<str>>>,
    broken: bool,
    closed: AtomicUsize,
}

impl MemoryViewer {
    fn broken() -> Self {
        Self {
            broken: true,
            ..Self::default()
        }
    }

    fn messages(&self) -> Vec<serde_json::Value> {
        self.messages
            .lock()
            .unwrap()
            .iter()
            .map(|raw| serde_json::from_str(raw).unwrap())
            .collect()
    }
}

impl ViewerSink for MemoryViewer {
    fn deliver(&self, payload: Arc<str>) -> Result<(), DeliveryError> {
        if self.broken {
            return Err(DeliveryError::Closed);
        }
        self.messages.lock().unwrap().push(payload);
        Ok(())
    }

    fn close(&self) {
        self.closed.fetch_add(1, Ordering::SeqCst);
    }
}

struct Relay {
    state: Arc<SharedState>,
    registry: Arc<ViewerRegistry>,
    broadcaster: Arc<Broadcaster>,
}

impl Relay {
    fn new() -> Self {
        let state = Arc::new(SharedState::new());
        let registry = Arc::new(ViewerRegistry::new());
        let broadcaster = Arc::new(Broadcaster::new(state.clone(), registry.clone()));
        Self {
            state,
            registry,
            broadcaster,
        }
    }

    fn session(&self, detect_every: u64, engine: Arc<dyn DetectionEngine>) -> IngestSession {
        let config = RelayConfig {
            detect_every,
            ..RelayConfig::default()
        };
        IngestSession::new(&config, engine, self.broadcaster.clone())
    }
}

fn jpeg_frame(shade: u8) -> Vec<u8> {
    let image = RgbImage::from_pixel(32, 24, Rgb([shade, shade, shade]));
    let mut out = Cursor::new(Vec::new());
    image.write_to(&mut out, ImageFormat::Jpeg).unwrap();
    out.into_inner()
}

fn classes(message: &serde_json::Value) -> Vec<String> {
    message["detections"]
        .as_array()
        .unwrap()
        .iter()
        .map(|d| d["class"].as_str().unwrap().to_owned())
        .collect()
}

#[test]
fn sampled_detection_and_full_fan_out() {
    let relay = Relay::new();
    let engine = Arc::new(CountingEngine::default());
    let mut session = relay.session(2, engine.clone());
    let viewers: Vec<_> = (0..3).map(|_| Arc::new(MemoryViewer::default())).collect();
    for viewer in &viewers {
        relay.registry.add(viewer.clone());
    }

    for shade in [10, 20, 30, 40] {
        session.process(&jpeg_frame(shade));
    }

    assert_eq!(engine.calls.load(Ordering::SeqCst), 2);
    let sends: usize = viewers.iter().map(|v| v.messages.lock().unwrap().len()).sum();
    assert_eq!(sends, 12);

    let messages = viewers[0].messages();
    assert_eq!(messages[0]["type"], "update");
    assert!(classes(&messages[0]).is_empty());
    assert_eq!(classes(&messages[1]), ["object1", "person"]);
    assert_eq!(classes(&messages[2]), ["object1", "person"]);
    assert_eq!(classes(&messages[3]), ["object2", "person"]);
    assert_eq!(messages[1]["detections"][0]["confidence"], 0.73);
}

#[test]
fn failing_viewers_are_pruned_without_affecting_the_rest() {
    let relay = Relay::new();
    let mut session = relay.session(1, Arc::new(CountingEngine::default()));
    let healthy: Vec<_> = (0..2).map(|_| Arc::new(MemoryViewer::default())).collect();
    let broken: Vec<_> = (0..3).map(|_| Arc::new(MemoryViewer::broken())).collect();
    for (good, bad) in healthy.iter().zip(&broken) {
        relay.registry.add(bad.clone());
        relay.registry.add(good.clone());
    }
    relay.registry.add(broken[2].clone());

    match session.process(&jpeg_frame(50)) {
        CycleOutcome::Published { report, .. } => {
            assert_eq!(report.delivered, 2);
            assert_eq!(report.pruned, 3);
        }
        other => panic!("unexpected outcome {other:?}"),
    }
    assert_eq!(relay.registry.len(), 2);
    for bad in &broken {
        assert_eq!(bad.closed.load(Ordering::SeqCst), 1);
    }

    session.process(&jpeg_frame(60));
    for good in &healthy {
        assert_eq!(good.messages.lock().unwrap().len(), 2);
    }
}

#[test]
fn corrupt_frame_leaves_published_state_untouched() {
    let relay = Relay::new();
    let mut session = relay.session(1, Arc::new(CountingEngine::default()));
    let viewer = Arc::new(MemoryViewer::default());
    relay.registry.add(viewer.clone());

    session.process(&jpeg_frame(70));
    let before = relay.state.read().unwrap();

    assert_eq!(session.process(&[0x00, 0x01, 0x02]), CycleOutcome::DecodeFailed);
    assert_eq!(session.process(&[]), CycleOutcome::DecodeFailed);

    let after = relay.state.read().unwrap();
    assert!(Arc::ptr_eq(&before, &after));
    assert_eq!(viewer.messages.lock().unwrap().len(), 1);
    assert_eq!(session.frame_counter(), 1);
}

#[test]
fn no_broadcast_before_the_first_frame() {
    let relay = Relay::new();
    let viewer = Arc::new(MemoryViewer::default());
    relay.registry.add(viewer.clone());
    assert_eq!(relay.broadcaster.broadcast_current().delivered, 0);
    assert!(relay.broadcaster.current_payload().is_none());
    assert!(viewer.messages.lock().unwrap().is_empty());
}

#[test]
fn producer_disconnect_keeps_last_frame_and_frees_the_slot() {
    let relay = Relay::new();
    let slot = Arc::new(ProducerSlot::new());
    let lease = slot.try_acquire().unwrap();
    assert!(slot.try_acquire().is_none());

    let session = relay
        .session(2, Arc::new(CountingEngine::default()))
        .with_lease(lease);
    let (tx, rx) = crossbeam_channel::bounded(2);
    let ingest = thread::spawn(move || session.run(rx));
    for shade in [1, 2, 3] {
        tx.send(jpeg_frame(shade)).unwrap();
    }
    drop(tx);

    let summary = ingest.join().unwrap();
    assert_eq!(summary.frames_received, 3);
    assert_eq!(summary.detection_passes, 1);
    assert!(!slot.is_active());

    let last = relay.state.read().unwrap();
    assert_eq!(last.frame_number, 3);
    assert!(relay.broadcaster.current_payload().is_some());

    let next = slot.try_acquire().unwrap();
    assert_eq!(next.id(), 2);
}

#[test]
fn detections_are_fresh_or_a_verbatim_carry_over() {
    let relay = Relay::new();
    let mut session = relay.session(3, Arc::new(CountingEngine::default()));
    let mut last_fresh: Option<Arc<[Detection]>> = None;

    for shade in 0..9u8 {
        session.process(&jpeg_frame(shade * 10));
        let state = relay.state.read().unwrap();
        if state.fresh {
            last_fresh = Some(state.detections.clone());
        } else {
            match &last_fresh {
                Some(previous) => assert!(Arc::ptr_eq(previous, &state.detections)),
                None => assert!(state.detections.is_empty()),
            }
        }
    }
}

#[test]
fn engine_errors_degrade_to_stale_reuse() {
    let relay = Relay::new();
    let mut session = relay.session(1, Arc::new(FailingEngine));
    let viewer = Arc::new(MemoryViewer::default());
    relay.registry.add(viewer.clone());

    for shade in [5, 15] {
        match session.process(&jpeg_frame(shade)) {
            CycleOutcome::Published { fresh, report, .. } => {
                assert!(!fresh);
                assert_eq!(report.delivered, 1);
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }
    assert_eq!(session.summary().detection_failures, 2);
    assert!(relay.state.read().unwrap().detections.is_empty());
}

#[test]
fn concurrent_viewer_churn_during_ingest() {
    let relay = Relay::new();
    let mut session = relay.session(1, Arc::new(CountingEngine::default()));
    let registry = relay.registry.clone();

    let churn = thread::spawn(move || {
        for _ in 0..200 {
            let id = registry.add(Arc::new(MemoryViewer::default()));
            registry.remove(id);
            assert!(!registry.remove(id));
        }
    });
    for shade in 0..20u8 {
        assert!(matches!(
            session.process(&jpeg_frame(shade)),
            CycleOutcome::Published { .. }
        ));
    }
    churn.join().unwrap();
    assert!(relay.registry.is_empty());
}
