mod engine;
mod server;
mod sessions;

use anyhow::Context;
use clap::Parser;
use vision::{RelayCliArgs, RelayConfig, telemetry};

/// Relay a single camera feed to many viewers with periodic object detection.
#[derive(Debug, Parser)]
#[command(name = "detection-relay", version, about)]
struct Cli {
    #[command(flatten)]
    relay: RelayCliArgs,
}

fn main() {
    if let Err(err) = run() {
        eprintln!("{err:?}");
        std::process::exit(1);
    }
}

fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = RelayConfig::try_from(cli.relay)?;
    let _telemetry = telemetry::init(&config.telemetry);
    telemetry::init_metrics_recorder()?;

    let engine = engine::build(&config)?;
    tracing::info!(
        engine = engine.name(),
        detect_every = config.detect_every,
        confidence = config.detection.confidence_threshold,
        inference_size = config.detection.input_size,
        "detection engine ready"
    );

    actix_web::rt::System::new()
        .block_on(server::serve(config, engine))
        .context("HTTP server error")
}
