//! The single current annotated frame and its detections.

use std::sync::{
    Arc, Mutex, PoisonError,
    atomic::{AtomicU64, Ordering},
};

use ml_core::Detection;

/// One ingest cycle's output. Published and replaced as a unit.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameState {
    pub annotated_jpeg: Vec<u8>,
    pub detections: Arc<[Detection]>,
    pub frame_number: u64,
    pub timestamp_ms: i64,
    /// Whether detection ran on this very frame.
    pub fresh: bool,
}

/// Latest-value slot shared between the ingest loop and readers.
///
/// `publish` swaps in a whole new `Arc<FrameState>`; readers get their own
/// `Arc` and never observe a half-written state.
#[derive(Debug, Default)]
pub struct SharedState {
    current: Mutex<Option<Arc<FrameState>>>,
    published: AtomicU64,
}

impl SharedState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish(&self, state: FrameState) -> Arc<FrameState> {
        let state = Arc::new(state);
        {
            let mut slot = self.current.lock().unwrap_or_else(PoisonError::into_inner);
            *slot = Some(state.clone());
        }
        self.published.fetch_add(1, Ordering::Relaxed);
        state
    }

    /// Latest published state, or `None` before the first frame.
    pub fn read(&self) -> Option<Arc<FrameState>> {
        self.current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn clear(&self) {
        self.current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }

    /// Number of publishes since start-up.
    pub fn published_count(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;

    fn frame(n: u64) -> FrameState {
        FrameState {
            annotated_jpeg: vec![n as u8; 4],
            detections: vec![Detection::new(format!("obj{n}"), 0.5)].into(),
            frame_number: n,
            timestamp_ms: n as i64,
            fresh: n % 2 == 0,
        }
    }

    #[test]
    fn empty_before_first_publish() {
        let state = SharedState::new();
        assert!(state.read().is_none());
        assert_eq!(state.published_count(), 0);
    }

    #[test]
    fn publish_overwrites_previous_state() {
        let state = SharedState::new();
        state.publish(frame(1));
        state.publish(frame(2));
        let current = state.read().unwrap();
        assert_eq!(current.frame_number, 2);
        assert_eq!(state.published_count(), 2);
    }

    #[test]
    fn readers_keep_their_snapshot_after_overwrite() {
        let state = SharedState::new();
        state.publish(frame(1));
        let snapshot = state.read().unwrap();
        state.publish(frame(2));
        assert_eq!(snapshot.frame_number, 1);
        assert_eq!(snapshot.detections[0].label, "obj1");
    }

    #[test]
    fn clear_empties_the_slot() {
        let state = SharedState::new();
        state.publish(frame(1));
        state.clear();
        assert!(state.read().is_none());
    }

    #[test]
    fn concurrent_readers_never_see_mixed_cycles() {
        let state = Arc::new(SharedState::new());
        state.publish(frame(0));

        let writer = {
            let state = state.clone();
            thread::spawn(move || {
                for n in 1..=500 {
                    state.publish(frame(n));
                }
            })
        };
        let readers: Vec<_> = (0..4)
            .map(|_| {
                let state = state.clone();
                thread::spawn(move || {
                    for _ in 0..500 {
                        let current = state.read().unwrap();
                        let n = current.frame_number;
                        assert_eq!(current.annotated_jpeg, vec![n as u8; 4]);
                        assert_eq!(current.detections[0].label, format!("obj{n}"));
                    }
                })
            })
            .collect();

        writer.join().unwrap();
        for reader in readers {
            reader.join().unwrap();
        }
        assert_eq!(state.read().unwrap().frame_number, 500);
    }
}
