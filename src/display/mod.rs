//! Outbound boundary towards the display/overlay layer

pub mod log;
pub mod overlay;

pub use self::log::LogDisplay;
pub use overlay::{ChannelDisplay, DisplayEvent};

use crate::detection::DetectionResult;
use crate::ids::{CameraId, PluginId};

/// Receives accepted analysis results. Implementations must not block:
/// they are called from the aggregator task.
pub trait DisplaySink: Send + Sync {
    fn publish_detection(&self, camera: &CameraId, result: DetectionResult);

    /// A plugin stopped working on a camera and will not be restarted
    fn publish_failure(&self, camera: &CameraId, plugin: &PluginId, reason: &str);
}
