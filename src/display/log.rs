use tracing::{error, info};

use super::DisplaySink;
use crate::detection::DetectionResult;
use crate::ids::{CameraId, PluginId};

/// Display sink that only logs what it is given
#[derive(Debug, Default, Clone, Copy)]
pub struct LogDisplay;

impl DisplaySink for LogDisplay {
    fn publish_detection(&self, camera: &CameraId, result: DetectionResult) {
        let labels: Vec<&str> = result.objects.iter().map(|o| o.label.as_str()).collect();
        info!(
            %camera,
            plugin = %result.plugin,
            sequence = result.sequence,
            objects = result.objects.len(),
            ?labels,
            "detection"
        );
    }

    fn publish_failure(&self, camera: &CameraId, plugin: &PluginId, reason: &str) {
        error!(%camera, %plugin, "plugin failed: {}", reason);
    }
}
