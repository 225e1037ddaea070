//! Argus orchestration host

use std::path::PathBuf;
use std::sync::Arc;

use argus::capture::TestPatternCapture;
use argus::{Config, LogDisplay, Orchestrator, ProcessLauncher, SlotFrameSource};
use clap::Parser;
use color_eyre::Result;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(version, about = "Dispatch live camera frames to analysis worker processes")]
struct Args {
    /// TOML configuration file
    #[arg(short, long, env = "ARGUS_CONFIG")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("argus=info")),
        )
        .with_timer(tracing_subscriber::fmt::time::uptime())
        .init();

    info!("Argus launching...");

    let args = Args::parse();
    let config = Config::load(args.config.as_deref())?;

    // One slot per camera stream, fed by a test-pattern source until the
    // real decoder is attached.
    let source = Arc::new(SlotFrameSource::new());
    let mut captures = Vec::with_capacity(config.cameras.len());
    for camera in &config.cameras {
        let publisher = source.register(camera.stream())?;
        let capture = TestPatternCapture::new(camera, &config.capture);
        captures.push(tokio::spawn(capture.run(publisher)));
    }

    let mut orchestrator = Orchestrator::new(
        config,
        source,
        Arc::new(ProcessLauncher),
        Arc::new(LogDisplay),
    )?;
    orchestrator.start()?;

    tokio::signal::ctrl_c().await?;
    info!("Ctrl-C received");

    let stats = orchestrator.shutdown().await;
    for capture in captures {
        capture.abort();
    }

    info!(
        published = stats.published,
        out_of_order = stats.out_of_order,
        failures = stats.failures,
        "Argus shutting down"
    );
    Ok(())
}
