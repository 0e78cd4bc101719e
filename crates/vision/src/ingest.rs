//! Producer ingest loop.
//!
//! One [`IngestSession`] exists per producer connection. It owns the frame
//! counter and the last detection set, and is the only writer of
//! [`SharedState`](crate::state::SharedState). Each buffer goes through
//! decode, scheduled detection, annotation, encode, publish and broadcast, in
//! arrival order.

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Instant,
};

use crossbeam_channel::Receiver;
use ml_core::{Detection, DetectionEngine, DetectionParams};
use tracing::{debug, info, info_span, warn};
use video_ingest::FrameDecoder;

use crate::{
    annotation::annotate_frame,
    broadcast::{BroadcastReport, Broadcaster},
    config::RelayConfig,
    encoding::FrameEncoder,
    scheduler::DetectionScheduler,
    state::FrameState,
    telemetry::record_stage,
};

/// Admission gate allowing one active producer at a time.
#[derive(Debug, Default)]
pub struct ProducerSlot {
    active: AtomicBool,
    next_id: AtomicU64,
}

impl ProducerSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the slot. `None` while another lease is alive.
    pub fn try_acquire(self: &Arc<Self>) -> Option<ProducerLease> {
        self.active
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        Some(ProducerLease {
            slot: Arc::clone(self),
            id,
        })
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }
}

/// Proof of producer admission; frees the slot when dropped.
#[derive(Debug)]
pub struct ProducerLease {
    slot: Arc<ProducerSlot>,
    id: u64,
}

impl ProducerLease {
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Drop for ProducerLease {
    fn drop(&mut self) {
        self.slot.active.store(false, Ordering::Release);
    }
}

/// Counters accumulated over one producer session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestSummary {
    pub frames_received: u64,
    pub frames_decoded: u64,
    pub detection_passes: u64,
    pub decode_failures: u64,
    pub detection_failures: u64,
}

/// What happened to one producer buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    Published {
        frame_number: u64,
        fresh: bool,
        report: BroadcastReport,
    },
    DecodeFailed,
    EncodeFailed {
        frame_number: u64,
    },
}

pub struct IngestSession {
    id: u64,
    lease: Option<ProducerLease>,
    frame_counter: u64,
    last_detections: Arc<[Detection]>,
    scheduler: DetectionScheduler,
    decoder: FrameDecoder,
    encoder: FrameEncoder,
    params: DetectionParams,
    engine: Arc<dyn DetectionEngine>,
    broadcaster: Arc<Broadcaster>,
    clear_on_disconnect: bool,
    summary: IngestSummary,
}

impl IngestSession {
    pub fn new(
        config: &RelayConfig,
        engine: Arc<dyn DetectionEngine>,
        broadcaster: Arc<Broadcaster>,
    ) -> Self {
        Self {
            id: 0,
            lease: None,
            frame_counter: 0,
            last_detections: Arc::from(Vec::new()),
            scheduler: DetectionScheduler::new(config.detect_every),
            decoder: FrameDecoder::new(config.max_dimension),
            encoder: FrameEncoder::new(config.jpeg_quality),
            params: config.detection,
            engine,
            broadcaster,
            clear_on_disconnect: config.clear_on_disconnect,
            summary: IngestSummary::default(),
        }
    }

    /// Bind the session to a producer lease, released when the session ends.
    pub fn with_lease(mut self, lease: ProducerLease) -> Self {
        self.id = lease.id();
        self.lease = Some(lease);
        self
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn frame_counter(&self) -> u64 {
        self.frame_counter
    }

    pub fn summary(&self) -> IngestSummary {
        self.summary
    }

    /// Drain producer buffers until every sender is gone.
    pub fn run(mut self, frames: Receiver<Vec<u8>>) -> IngestSummary {
        let span = info_span!("relay.ingest", producer = self.id);
        let _entered = span.enter();
        info!(
            engine = self.engine.name(),
            detect_every = self.scheduler.interval(),
            "producer session started"
        );

        while let Ok(buffer) = frames.recv() {
            self.process(&buffer);
        }

        if self.clear_on_disconnect {
            self.broadcaster.state().clear();
        }
        let summary = self.summary;
        info!(
            frames_received = summary.frames_received,
            frames_decoded = summary.frames_decoded,
            detection_passes = summary.detection_passes,
            decode_failures = summary.decode_failures,
            detection_failures = summary.detection_failures,
            "producer session ended"
        );
        summary
    }

    /// Run one ingest cycle over a single encoded image.
    pub fn process(&mut self, buffer: &[u8]) -> CycleOutcome {
        self.summary.frames_received += 1;
        metrics::counter!("relay_frames_received_total").increment(1);

        let started = Instant::now();
        let frame = match self.decoder.decode(buffer) {
            Ok(frame) => frame,
            Err(err) => {
                self.summary.decode_failures += 1;
                metrics::counter!("relay_decode_failures_total").increment(1);
                warn!(
                    producer = self.id,
                    after_frame = self.frame_counter,
                    bytes = buffer.len(),
                    error = %err,
                    "skipping undecodable frame"
                );
                return CycleOutcome::DecodeFailed;
            }
        };
        record_stage("decode", started.elapsed());
        self.summary.frames_decoded += 1;

        self.frame_counter += 1;
        let frame_number = self.frame_counter;
        let span = info_span!("frame", number = frame_number);
        let _entered = span.enter();

        let fresh = self.scheduler.should_detect(frame_number) && self.detect(&frame.image);

        let started = Instant::now();
        let annotated = if fresh {
            annotate_frame(&frame.image, &self.last_detections)
        } else {
            frame.image
        };
        record_stage("annotate", started.elapsed());

        let started = Instant::now();
        let annotated_jpeg = match self.encoder.encode_jpeg(&annotated) {
            Ok(jpeg) => jpeg,
            Err(err) => {
                warn!(producer = self.id, error = %err, "failed to encode annotated frame");
                return CycleOutcome::EncodeFailed { frame_number };
            }
        };
        record_stage("encode", started.elapsed());

        self.broadcaster.state().publish(FrameState {
            annotated_jpeg,
            detections: self.last_detections.clone(),
            frame_number,
            timestamp_ms: frame.timestamp_ms,
            fresh,
        });
        metrics::counter!("relay_frames_published_total").increment(1);

        let started = Instant::now();
        let report = self.broadcaster.broadcast_current();
        record_stage("broadcast", started.elapsed());

        CycleOutcome::Published {
            frame_number,
            fresh,
            report,
        }
    }

    /// Run the engine and replace the cached detections. Returns whether the
    /// pass succeeded; on failure the previous set is kept.
    fn detect(&mut self, image: &image::RgbImage) -> bool {
        let started = Instant::now();
        let result = self.engine.detect(image, &self.params);
        record_stage("detect", started.elapsed());
        match result {
            Ok(detections) => {
                self.summary.detection_passes += 1;
                metrics::counter!("relay_detection_passes_total").increment(1);
                debug!(count = detections.len(), "detection pass complete");
                self.last_detections = detections.into();
                true
            }
            Err(err) => {
                self.summary.detection_failures += 1;
                metrics::counter!("relay_detection_failures_total").increment(1);
                warn!(
                    producer = self.id,
                    frame = self.frame_counter,
                    engine = self.engine.name(),
                    error = %err,
                    "detection failed; reusing previous detections"
                );
                false
            }
        }
    }
}
