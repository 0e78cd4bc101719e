//! Configuration for the relay.
//!
//! This module owns translation of CLI arguments (and their environment
//! fallbacks) into a validated `RelayConfig` that downstream stages use
//! without re-parsing flags.

use std::{path::PathBuf, time::Duration};

use anyhow::{Result, bail};
use clap::{Args, ValueEnum};
use ml_core::DetectionParams;

#[derive(Clone, Debug)]
/// Canonical configuration shared by the ingest, broadcast, and server layers.
pub struct RelayConfig {
    /// Listen address.
    pub host: String,
    /// Listen port.
    pub port: u16,
    /// Run detection on every N-th decoded frame.
    pub detect_every: u64,
    /// Parameters forwarded to the detection engine.
    pub detection: DetectionParams,
    /// JPEG quality of the annotated frame sent to viewers.
    pub jpeg_quality: u8,
    /// Optional TorchScript model path.
    pub model_path: Option<PathBuf>,
    /// Optional labels file, one class name per line.
    pub labels_path: Option<PathBuf>,
    /// Force CPU inference.
    pub use_cpu: bool,
    /// Capacity of the producer to ingest channel.
    pub ingest_queue: usize,
    /// What the producer socket does while the ingest channel is full.
    pub ingest_overflow: IngestOverflow,
    /// Per-viewer outbound mailbox capacity.
    pub viewer_queue: usize,
    /// Largest producer WebSocket message accepted.
    pub max_frame_bytes: usize,
    /// Largest decoded width or height accepted.
    pub max_dimension: u32,
    /// Interval between WebSocket pings.
    pub heartbeat_interval: Duration,
    /// Silence after which a WebSocket peer is considered gone.
    pub client_timeout: Duration,
    /// Drop the current frame when the producer disconnects.
    pub clear_on_disconnect: bool,
    /// Telemetry and instrumentation options.
    pub telemetry: TelemetryOptions,
}

/// Behaviour of the producer socket when the ingest loop falls behind.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum IngestOverflow {
    /// Stop reading from the producer until the ingest channel has room.
    #[default]
    Backpressure,
    /// Discard the newest frame and keep reading.
    Drop,
}

#[derive(Clone, Debug, Default)]
/// Optional telemetry knobs for tracing.
pub struct TelemetryOptions {
    /// Write a Chrome trace JSON file capturing relay spans.
    pub chrome_trace_path: Option<PathBuf>,
}

/// CLI arguments for the relay.
#[derive(Debug, Clone, Args)]
pub struct RelayCliArgs {
    /// Address to listen on.
    #[arg(long, env = "RELAY_HOST", default_value = "0.0.0.0")]
    pub host: String,
    /// Port to listen on.
    #[arg(long, env = "RELAY_PORT", default_value_t = 8150)]
    pub port: u16,
    /// Run detection on every N-th frame; other frames reuse the last result.
    #[arg(long = "detect-every", env = "RELAY_DETECT_EVERY", value_name = "N", default_value_t = 2)]
    pub detect_every: u64,
    /// Minimum confidence for a detection to be reported (0-1).
    #[arg(long, env = "RELAY_CONFIDENCE", default_value_t = 0.5)]
    pub confidence: f32,
    /// Square inference resolution in pixels.
    #[arg(long = "inference-size", env = "RELAY_INFERENCE_SIZE", value_name = "PX", default_value_t = 320)]
    pub inference_size: u32,
    /// JPEG quality of frames sent to viewers (1-100).
    #[arg(long = "jpeg-quality", env = "RELAY_JPEG_QUALITY", value_name = "QUALITY", default_value_t = 85)]
    pub jpeg_quality: i32,
    /// TorchScript model path.
    #[arg(long = "model", env = "RELAY_MODEL", value_name = "PATH")]
    pub model_path: Option<PathBuf>,
    /// Labels file, one class name per line.
    #[arg(long = "labels", env = "RELAY_LABELS", value_name = "PATH")]
    pub labels_path: Option<PathBuf>,
    /// Force CPU inference.
    #[arg(long = "cpu", action = clap::ArgAction::SetTrue)]
    pub use_cpu: bool,
    /// Producer frames buffered ahead of the ingest loop.
    #[arg(long = "ingest-queue", value_name = "N", default_value_t = 4)]
    pub ingest_queue: usize,
    /// Producer handling while the ingest queue is full.
    #[arg(long = "on-ingest-full", value_enum, default_value_t = IngestOverflow::Backpressure)]
    pub ingest_overflow: IngestOverflow,
    /// Updates buffered per viewer before it is dropped as unresponsive.
    #[arg(long = "viewer-queue", value_name = "N", default_value_t = 4)]
    pub viewer_queue: usize,
    /// Largest producer message in bytes.
    #[arg(long = "max-frame-bytes", value_name = "BYTES", default_value_t = 4 * 1024 * 1024)]
    pub max_frame_bytes: usize,
    /// Largest decoded frame width or height.
    #[arg(long = "max-dimension", value_name = "PX", default_value_t = 4096)]
    pub max_dimension: u32,
    /// Seconds between WebSocket pings.
    #[arg(long = "heartbeat-secs", value_name = "SECS", default_value_t = 5)]
    pub heartbeat_secs: u64,
    /// Seconds of silence before a WebSocket peer is dropped.
    #[arg(long = "client-timeout-secs", value_name = "SECS", default_value_t = 10)]
    pub client_timeout_secs: u64,
    /// Clear the current frame when the producer disconnects.
    #[arg(long = "clear-on-disconnect", action = clap::ArgAction::SetTrue)]
    pub clear_on_disconnect: bool,
    /// Emit Chrome trace JSON for post-mortem analysis.
    #[arg(long = "chrome-trace", value_name = "PATH")]
    pub chrome_trace: Option<PathBuf>,
}

impl TryFrom<RelayCliArgs> for RelayConfig {
    type Error = anyhow::Error;

    fn try_from(args: RelayCliArgs) -> Result<Self> {
        if args.detect_every == 0 {
            bail!("--detect-every must be at least 1");
        }
        if !(0.0..=1.0).contains(&args.confidence) {
            bail!("--confidence must be between 0 and 1");
        }
        if args.inference_size < 32 || args.inference_size % 32 != 0 {
            bail!("--inference-size must be a multiple of 32 and at least 32");
        }
        if !(1..=100).contains(&args.jpeg_quality) {
            bail!("--jpeg-quality must be an integer between 1 and 100");
        }
        if args.ingest_queue == 0 {
            bail!("--ingest-queue must be at least 1");
        }
        if args.viewer_queue == 0 {
            bail!("--viewer-queue must be at least 1");
        }
        if args.max_frame_bytes == 0 {
            bail!("--max-frame-bytes must be positive");
        }
        if args.max_dimension == 0 {
            bail!("--max-dimension must be positive");
        }
        if args.heartbeat_secs == 0 {
            bail!("--heartbeat-secs must be at least 1");
        }
        if args.client_timeout_secs <= args.heartbeat_secs {
            bail!("--client-timeout-secs must exceed --heartbeat-secs");
        }

        Ok(Self {
            host: args.host,
            port: args.port,
            detect_every: args.detect_every,
            detection: DetectionParams {
                confidence_threshold: args.confidence,
                input_size: args.inference_size,
            },
            jpeg_quality: args.jpeg_quality as u8,
            model_path: args.model_path,
            labels_path: args.labels_path,
            use_cpu: args.use_cpu,
            ingest_queue: args.ingest_queue,
            ingest_overflow: args.ingest_overflow,
            viewer_queue: args.viewer_queue,
            max_frame_bytes: args.max_frame_bytes,
            max_dimension: args.max_dimension,
            heartbeat_interval: Duration::from_secs(args.heartbeat_secs),
            client_timeout: Duration::from_secs(args.client_timeout_secs),
            clear_on_disconnect: args.clear_on_disconnect,
            telemetry: TelemetryOptions {
                chrome_trace_path: args.chrome_trace,
            },
        })
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 8150,
            detect_every: 2,
            detection: DetectionParams::default(),
            jpeg_quality: 85,
            model_path: None,
            labels_path: None,
            use_cpu: false,
            ingest_queue: 4,
            ingest_overflow: IngestOverflow::Backpressure,
            viewer_queue: 4,
            max_frame_bytes: 4 * 1024 * 1024,
            max_dimension: video_ingest::DEFAULT_MAX_DIMENSION,
            heartbeat_interval: Duration::from_secs(5),
            client_timeout: Duration::from_secs(10),
            clear_on_disconnect: false,
            telemetry: TelemetryOptions::default(),
        }
    }
}
