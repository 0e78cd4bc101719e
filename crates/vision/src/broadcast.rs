//! Fan-out of the current frame to every registered viewer.
//!
//! A broadcast serialises the current [`FrameState`] once and hands the same
//! payload to each viewer's non-blocking sink. A viewer whose send fails is
//! pruned and closed; the remaining viewers are unaffected.

use std::sync::{Arc, Mutex, PoisonError};

use serde::Serialize;
use tracing::{debug, error, warn};

use crate::{
    encoding::FrameEncoder,
    registry::{ViewerId, ViewerRegistry},
    state::{FrameState, SharedState},
};

/// Wire record pushed to viewers.
#[derive(Serialize)]
struct UpdateMessage<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    frame: String,
    detections: Vec<WireDetection<'a>>,
}

#[derive(Serialize)]
struct WireDetection<'a> {
    class: &'a str,
    confidence: f64,
}

/// Round to two decimal places for the wire.
pub fn round_confidence(confidence: f32) -> f64 {
    (f64::from(confidence) * 100.0).round() / 100.0
}

/// Serialise a frame state into the viewer `update` message.
pub fn serialize_update(state: &FrameState) -> Result<String, serde_json::Error> {
    let message = UpdateMessage {
        kind: "update",
        frame: FrameEncoder::transport_text(&state.annotated_jpeg),
        detections: state
            .detections
            .iter()
            .map(|det| WireDetection {
                class: &det.label,
                confidence: round_confidence(det.confidence),
            })
            .collect(),
    };
    serde_json::to_string(&message)
}

/// Outcome of one broadcast.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,
    pub pruned: usize,
}

pub struct Broadcaster {
    state: Arc<SharedState>,
    registry: Arc<ViewerRegistry>,
    cached: Mutex<Option<(Arc<FrameState>, Arc<str>)>>,
}

impl Broadcaster {
    pub fn new(state: Arc<SharedState>, registry: Arc<ViewerRegistry>) -> Self {
        Self {
            state,
            registry,
            cached: Mutex::new(None),
        }
    }

    pub fn state(&self) -> &Arc<SharedState> {
        &self.state
    }

    pub fn registry(&self) -> &Arc<ViewerRegistry> {
        &self.registry
    }

    /// Serialised `update` for the current state, or `None` before the first frame.
    pub fn current_payload(&self) -> Option<Arc<str>> {
        let current = self.state.read()?;
        let mut cached = self.cached.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some((state, payload)) = cached.as_ref() {
            if Arc::ptr_eq(state, &current) {
                return Some(payload.clone());
            }
        }
        match serialize_update(&current) {
            Ok(json) => {
                let payload: Arc<str> = Arc::from(json);
                *cached = Some((current, payload.clone()));
                Some(payload)
            }
            Err(err) => {
                error!(error = %err, frame = current.frame_number, "failed to serialise update");
                None
            }
        }
    }

    /// Push the current state to every viewer, pruning those whose send fails.
    pub fn broadcast_current(&self) -> BroadcastReport {
        let Some(payload) = self.current_payload() else {
            return BroadcastReport::default();
        };

        let mut report = BroadcastReport::default();
        for (id, sink) in self.registry.snapshot() {
            match sink.deliver(payload.clone()) {
                Ok(()) => report.delivered += 1,
                Err(err) => {
                    warn!(viewer = %id, error = %err, "dropping viewer after failed send");
                    if self.prune(id) {
                        sink.close();
                        report.pruned += 1;
                    }
                }
            }
        }

        metrics::counter!("relay_viewer_sends_total").increment(report.delivered as u64);
        if report.pruned > 0 {
            metrics::counter!("relay_viewers_pruned_total").increment(report.pruned as u64);
        }
        debug!(
            delivered = report.delivered,
            pruned = report.pruned,
            bytes = payload.len(),
            "broadcast complete"
        );
        report
    }

    fn prune(&self, id: ViewerId) -> bool {
        self.registry.remove(id)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use ml_core::Detection;

    use super::*;
    use crate::registry::{DeliveryError, ViewerSink};

    #[derive(Default)]
    struct RecordingSink {
        received: Mutex<Vec<Arc<str>>>,
        fail_with: Option<DeliveryError>,
        closed: AtomicBool,
    }

    impl ViewerSink for RecordingSink {
        fn deliver(&self, payload: Arc<str>) -> Result<(), DeliveryError> {
            if let Some(err) = self.fail_with {
                return Err(err);
            }
            self.received.lock().unwrap().push(payload);
            Ok(())
        }

        fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    fn setup() -> (Arc<SharedState>, Arc<ViewerRegistry>, Broadcaster) {
        let state = Arc::new(SharedState::new());
        let registry = Arc::new(ViewerRegistry::new());
        let broadcaster = Broadcaster::new(state.clone(), registry.clone());
        (state, registry, broadcaster)
    }

    fn frame() -> FrameState {
        FrameState {
            annotated_jpeg: vec![0xFF, 0xD8, 0xFF],
            detections: vec![Detection::new("person", 0.876), Detection::new("dog", 0.5)].into(),
            frame_number: 7,
            timestamp_ms: 0,
            fresh: true,
        }
    }

    #[test]
    fn wire_format_matches_viewer_contract() {
        let json: serde_json::Value = serde_json::from_str(&serialize_update(&frame()).unwrap()).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "type": "update",
                "frame": "/9j/",
                "detections": [
                    {"class": "person", "confidence": 0.88},
                    {"class": "dog", "confidence": 0.5}
                ]
            })
        );
    }

    #[test]
    fn confidence_rounds_half_up() {
        assert_eq!(round_confidence(0.125), 0.13);
        assert_eq!(round_confidence(1.0), 1.0);
    }

    #[test]
    fn no_op_before_first_publish() {
        let (_, registry, broadcaster) = setup();
        let sink = Arc::new(RecordingSink::default());
        registry.add(sink.clone());
        assert_eq!(broadcaster.broadcast_current(), BroadcastReport::default());
        assert!(sink.received.lock().unwrap().is_empty());
    }

    #[test]
    fn failing_viewers_are_pruned_and_closed() {
        let (state, registry, broadcaster) = setup();
        state.publish(frame());
        let good = Arc::new(RecordingSink::default());
        let backlogged = Arc::new(RecordingSink {
            fail_with: Some(DeliveryError::Backlogged),
            ..Default::default()
        });
        let closed = Arc::new(RecordingSink {
            fail_with: Some(DeliveryError::Closed),
            ..Default::default()
        });
        registry.add(backlogged.clone());
        let good_id = registry.add(good.clone());
        registry.add(closed.clone());

        let report = broadcaster.broadcast_current();
        assert_eq!(report, BroadcastReport { delivered: 1, pruned: 2 });
        assert_eq!(good.received.lock().unwrap().len(), 1);
        assert!(backlogged.closed.load(Ordering::SeqCst));
        assert!(closed.closed.load(Ordering::SeqCst));
        assert!(!good.closed.load(Ordering::SeqCst));
        let remaining: Vec<_> = registry.snapshot().into_iter().map(|(id, _)| id).collect();
        assert_eq!(remaining, vec![good_id]);
    }

    #[test]
    fn every_viewer_gets_the_same_payload() {
        let (state, registry, broadcaster) = setup();
        state.publish(frame());
        let sinks: Vec<_> = (0..3).map(|_| Arc::new(RecordingSink::default())).collect();
        for sink in &sinks {
            registry.add(sink.clone());
        }
        broadcaster.broadcast_current();
        let first = sinks[0].received.lock().unwrap()[0].clone();
        for sink in &sinks {
            assert!(Arc::ptr_eq(&sink.received.lock().unwrap()[0], &first));
        }
    }

    #[test]
    fn payload_is_reserialised_after_a_new_publish() {
        let (state, _, broadcaster) = setup();
        state.publish(frame());
        let first = broadcaster.current_payload().unwrap();
        assert!(Arc::ptr_eq(&first, &broadcaster.current_payload().unwrap()));
        state.publish(FrameState {
            detections: Vec::new().into(),
            ..frame()
        });
        let second = broadcaster.current_payload().unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        assert!(second.contains("\"detections\":[]"));
    }

    struct SelfRemovingSink {
        registry: Arc<ViewerRegistry>,
        calls: AtomicUsize,
    }

    impl ViewerSink for SelfRemovingSink {
        fn deliver(&self, _payload: Arc<str>) -> Result<(), DeliveryError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            // Simulates a disconnect racing with the broadcast.
            for (id, _) in self.registry.snapshot() {
                self.registry.remove(id);
            }
            Ok(())
        }

        fn close(&self) {}
    }

    #[test]
    fn membership_changes_during_broadcast_do_not_disturb_iteration() {
        let (state, registry, broadcaster) = setup();
        state.publish(frame());
        let remover = Arc::new(SelfRemovingSink {
            registry: registry.clone(),
            calls: AtomicUsize::new(0),
        });
        let other = Arc::new(RecordingSink::default());
        registry.add(remover.clone());
        registry.add(other.clone());

        let report = broadcaster.broadcast_current();
        assert_eq!(report.delivered, 2);
        assert_eq!(remover.calls.load(Ordering::SeqCst), 1);
        assert_eq!(other.received.lock().unwrap().len(), 1);
        assert!(registry.is_empty());
    }
}
