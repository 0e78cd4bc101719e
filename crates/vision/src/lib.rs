//! Relay core: turns a single producer's frame stream into annotated
//! snapshots and fans them out to every connected viewer.
//!
//! The [`ingest::IngestSession`] is the only writer of [`state::SharedState`].
//! After each publish it asks the [`broadcast::Broadcaster`] to push the new
//! state to the viewers held in [`registry::ViewerRegistry`]. Detection is
//! sampled by [`scheduler::DetectionScheduler`]; cycles in between reuse the
//! previous detection set.

pub mod annotation;
pub mod broadcast;
pub mod config;
pub mod encoding;
pub mod ingest;
pub mod registry;
pub mod scheduler;
pub mod state;
pub mod telemetry;

pub use broadcast::{BroadcastReport, Broadcaster};
pub use config::{IngestOverflow, RelayCliArgs, RelayConfig, TelemetryOptions};
pub use encoding::{EncodeError, FrameEncoder};
pub use ingest::{CycleOutcome, IngestSession, IngestSummary, ProducerLease, ProducerSlot};
pub use registry::{DeliveryError, ViewerId, ViewerRegistry, ViewerSink};
pub use scheduler::DetectionScheduler;
pub use state::{FrameState, SharedState};
