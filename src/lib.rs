pub mod capture;
pub mod detection;
pub mod display;
pub mod error;
pub mod ids;
pub mod pipeline;
pub mod utils;
pub mod worker;

use std::path::{Path, PathBuf};
use std::time::Duration;

use capture::frame::PixelFormat;
use serde::{Deserialize, Serialize};

pub use capture::{Frame, FramePublisher, FrameSource, SlotFrameSource, SlotRead};
pub use detection::{BoundingBox, DetectedObject, DetectionResult};
pub use display::{ChannelDisplay, DisplayEvent, DisplaySink, LogDisplay};
pub use error::{Error, ProtocolError, WorkerError};
pub use ids::{BindingKey, CameraId, PluginId, StreamKey};
pub use pipeline::{AggregatorStats, Orchestrator};
pub use worker::{
    BindingSnapshot, InProcessLauncher, LaunchSpec, Launcher, ProcessLauncher, WorkerIo,
    WorkerState,
};

/// System configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub capture: CaptureConfig,
    pub pipeline: PipelineConfig,
    pub supervision: SupervisionConfig,
    pub transport: TransportConfig,
    pub plugins: Vec<PluginConfig>,
    pub cameras: Vec<CameraConfig>,
}

/// Defaults for cameras that don't specify their own stream geometry
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub format: PixelFormat,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub dispatch_tick_ms: u64,
    pub health_check_interval_ms: u64,
    /// Upper bound on frames in flight across every binding. `None` keeps
    /// bindings fully independent.
    pub max_in_flight_total: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisionConfig {
    pub ready_timeout_ms: u64,
    pub stale_after_ms: u64,
    pub send_timeout_ms: u64,
    pub stop_grace_ms: u64,
    pub max_restarts: u32,
    pub restart_window_secs: u64,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameTransport {
    SharedMemory,
    Inline,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    pub mode: FrameTransport,
    pub shm_dir: PathBuf,
}

/// An analysis plugin that can be bound to cameras
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginConfig {
    pub id: String,
    pub command: PathBuf,
    #[serde(default)]
    pub args: Vec<String>,
    /// Heavy detectors can restrict how many cameras run them at once.
    #[serde(default)]
    pub max_instances: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CameraConfig {
    pub id: String,
    #[serde(default)]
    pub tier: u32,
    #[serde(default)]
    pub width: Option<u32>,
    #[serde(default)]
    pub height: Option<u32>,
    #[serde(default)]
    pub fps: Option<u32>,
    #[serde(default)]
    pub plugins: Vec<String>,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            width: 480,
            height: 270,
            fps: 30,
            format: PixelFormat::Rgb24,
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            dispatch_tick_ms: 10,
            health_check_interval_ms: 1000,
            max_in_flight_total: None,
        }
    }
}

impl Default for SupervisionConfig {
    fn default() -> Self {
        Self {
            ready_timeout_ms: 5000,
            stale_after_ms: 3000,
            send_timeout_ms: 500,
            stop_grace_ms: 2000,
            max_restarts: 5,
            restart_window_secs: 60,
            backoff_base_ms: 250,
            backoff_max_ms: 10_000,
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            mode: FrameTransport::SharedMemory,
            shm_dir: utils::default_shm_dir(),
        }
    }
}

impl PipelineConfig {
    pub fn dispatch_tick(&self) -> Duration {
        Duration::from_millis(self.dispatch_tick_ms)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }
}

impl SupervisionConfig {
    pub fn ready_timeout(&self) -> Duration {
        Duration::from_millis(self.ready_timeout_ms)
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_millis(self.stale_after_ms)
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }

    pub fn restart_window(&self) -> Duration {
        Duration::from_secs(self.restart_window_secs)
    }

    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    pub fn backoff_max(&self) -> Duration {
        Duration::from_millis(self.backoff_max_ms)
    }
}

impl CameraConfig {
    pub fn stream(&self) -> StreamKey {
        StreamKey::new(self.id.as_str(), self.tier)
    }
}

impl Config {
    /// Load configuration from an optional TOML file, then apply
    /// `ARGUS__SECTION__KEY` environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, Error> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path));
        }

        let settings = builder
            .add_source(
                config::Environment::with_prefix("ARGUS")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the orchestrator cannot run.
    pub fn validate(&self) -> Result<(), Error> {
        if self.pipeline.dispatch_tick_ms == 0 || self.pipeline.health_check_interval_ms == 0 {
            return Err(Error::InvalidConfig(
                "dispatch and health-check intervals must be non-zero".into(),
            ));
        }
        if self.pipeline.max_in_flight_total == Some(0) {
            return Err(Error::InvalidConfig(
                "max_in_flight_total must allow at least one frame".into(),
            ));
        }

        // FRAME lines are whitespace-separated, so the export path can't contain any.
        if self.transport.mode == FrameTransport::SharedMemory
            && self
                .transport
                .shm_dir
                .to_string_lossy()
                .contains(char::is_whitespace)
        {
            return Err(Error::InvalidConfig(format!(
                "shm_dir `{}` must not contain whitespace",
                self.transport.shm_dir.display()
            )));
        }

        for plugin in &self.plugins {
            if plugin.id.trim().is_empty() {
                return Err(Error::InvalidConfig("plugin id must not be empty".into()));
            }
            if self.plugins.iter().filter(|p| p.id == plugin.id).count() > 1 {
                return Err(Error::InvalidConfig(format!(
                    "plugin `{}` is declared more than once",
                    plugin.id
                )));
            }
        }

        for camera in &self.cameras {
            if camera.id.trim().is_empty() {
                return Err(Error::InvalidConfig("camera id must not be empty".into()));
            }
            for plugin in &camera.plugins {
                if !self.plugins.iter().any(|p| &p.id == plugin) {
                    return Err(Error::UnknownPlugin(PluginId::from(plugin.as_str())));
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn shm_dir_with_whitespace_is_rejected() {
        let mut config = Config::default();
        config.transport.shm_dir = PathBuf::from("/tmp/frame exports");
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));

        config.transport.mode = FrameTransport::Inline;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.transport.mode, FrameTransport::SharedMemory);
        assert_eq!(config.supervision.stop_grace(), Duration::from_secs(2));
    }

    #[test]
    fn loads_toml_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
[pipeline]
dispatch_tick_ms = 5

[transport]
mode = "inline"

[[plugins]]
id = "movement"
command = "argus-worker"
args = ["--delay-ms", "40"]
max_instances = 2

[[cameras]]
id = "front-door"
plugins = ["movement"]
"#
        )
        .unwrap();

        let config = Config::load(Some(file.path())).unwrap();
        assert_eq!(config.pipeline.dispatch_tick(), Duration::from_millis(5));
        assert_eq!(config.pipeline.health_check_interval_ms, 1000);
        assert_eq!(config.transport.mode, FrameTransport::Inline);
        assert_eq!(config.plugins[0].max_instances, Some(2));
        assert_eq!(config.cameras[0].stream(), StreamKey::new("front-door", 0));
    }

    #[test]
    fn rejects_unknown_plugin_reference() {
        let mut config = Config::default();
        config.cameras.push(CameraConfig {
            id: "lobby".into(),
            tier: 0,
            width: None,
            height: None,
            fps: None,
            plugins: vec!["yolo".into()],
        });

        assert!(matches!(config.validate(), Err(Error::UnknownPlugin(_))));
    }

    #[test]
    fn rejects_zero_intervals() {
        let mut config = Config::default();
        config.pipeline.dispatch_tick_ms = 0;
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));
    }
}
