//! Reference analysis worker
//!
//! Speaks the host protocol on stdin/stdout and reports whether each frame is
//! bright or dark. Its knobs let tests simulate slow, dead and hung analyzers.

use std::io::{self, BufRead, Write};
use std::time::Duration;

use argus::worker::protocol::{FrameDescriptor, HostMessage, WorkerMessage, PROTOCOL_VERSION};
use argus::worker::read_payload;
use argus::{BoundingBox, DetectedObject};
use clap::Parser;
use color_eyre::Result;
use tracing::{debug, info, warn};

#[derive(Debug, Parser)]
#[command(version, about = "Mean-brightness analysis worker")]
struct Args {
    /// Simulated analysis time per frame
    #[arg(long, default_value_t = 0)]
    delay_ms: u64,

    /// Exit after answering this many frames
    #[arg(long)]
    exit_after: Option<u64>,

    /// Never answer READY?
    #[arg(long)]
    never_ready: bool,

    /// Stop answering frames after this many results
    #[arg(long)]
    hang_after: Option<u64>,

    /// Mean pixel value separating "dark" from "bright"
    #[arg(long, default_value_t = 128.0)]
    threshold: f32,

    #[arg(long, env = "ARGUS_CAMERA_ID", default_value = "unknown")]
    camera: String,

    #[arg(long, env = "ARGUS_PLUGIN_ID", default_value = "brightness")]
    plugin: String,
}

fn main() -> Result<()> {
    color_eyre::install()?;
    // stdout carries the protocol.
    tracing_subscriber::fmt()
        .with_writer(io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("argus_worker=info")),
        )
        .init();

    let mut args = Args::parse();
    info!(camera = %args.camera, plugin = %args.plugin, "worker starting");

    let stdin = io::stdin();
    let mut stdout = io::stdout().lock();
    let mut answered = 0u64;

    for line in stdin.lock().lines() {
        let line = line?;
        let message = match line.parse::<HostMessage>() {
            Ok(message) => message,
            Err(e) => {
                warn!("ignoring malformed line: {}", e);
                continue;
            }
        };

        let reply = match message {
            HostMessage::ReadyPoll if args.never_ready => None,
            HostMessage::ReadyPoll => Some(WorkerMessage::Ready {
                version: Some(PROTOCOL_VERSION),
            }),
            HostMessage::Set { key, value } => {
                apply_parameter(&mut args, &key, &value);
                None
            }
            HostMessage::Stop => {
                info!("stop requested");
                break;
            }
            HostMessage::Frame(_) if args.hang_after.is_some_and(|n| answered >= n) => {
                debug!("hanging");
                None
            }
            HostMessage::Frame(frame) => {
                if args.delay_ms > 0 {
                    std::thread::sleep(Duration::from_millis(args.delay_ms));
                }
                answered += 1;
                Some(analyse(&frame, args.threshold))
            }
        };

        if let Some(reply) = reply {
            writeln!(stdout, "{reply}")?;
            stdout.flush()?;
        }

        if args.exit_after.is_some_and(|n| answered >= n) {
            info!(answered, "exit requested");
            break;
        }
    }

    Ok(())
}

fn apply_parameter(args: &mut Args, key: &str, value: &str) {
    match (key, value.parse::<f32>()) {
        ("threshold", Ok(threshold)) => {
            info!(threshold, "threshold updated");
            args.threshold = threshold;
        }
        ("delay_ms", Ok(delay)) if delay >= 0.0 => args.delay_ms = delay as u64,
        _ => warn!(key, value, "unknown parameter"),
    }
}

fn analyse(frame: &FrameDescriptor, threshold: f32) -> WorkerMessage {
    let data = match read_payload(&frame.payload) {
        Ok(data) => data,
        Err(e) => return WorkerMessage::Error(format!("frame {}: {}", frame.sequence, e)),
    };
    if data.is_empty() {
        return WorkerMessage::Error(format!("frame {} is empty", frame.sequence));
    }

    let mean = data.iter().map(|&b| b as f32).sum::<f32>() / data.len() as f32;
    let label = if mean >= threshold { "bright" } else { "dark" };
    let confidence = (0.5 + (mean - threshold).abs() / 510.0).clamp(0.0, 1.0);

    WorkerMessage::Result {
        sequence: frame.sequence,
        timestamp_ms: frame.timestamp_ms,
        objects: vec![DetectedObject::new(label, confidence, BoundingBox::full_frame())],
    }
}
