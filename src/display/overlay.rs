//! Channel-backed sink for overlay renderers running on their own thread

use flume::{Receiver, Sender};

use super::DisplaySink;
use crate::detection::DetectionResult;
use crate::ids::{CameraId, PluginId};

#[derive(Debug, Clone, PartialEq)]
pub enum DisplayEvent {
    Detection {
        camera: CameraId,
        result: DetectionResult,
    },
    Failure {
        camera: CameraId,
        plugin: PluginId,
        reason: String,
    },
}

/// Forwards every published event into an unbounded flume channel
#[derive(Debug, Clone)]
pub struct ChannelDisplay {
    tx: Sender<DisplayEvent>,
}

impl ChannelDisplay {
    pub fn new() -> (Self, Receiver<DisplayEvent>) {
        let (tx, rx) = flume::unbounded();
        (Self { tx }, rx)
    }
}

impl DisplaySink for ChannelDisplay {
    fn publish_detection(&self, camera: &CameraId, result: DetectionResult) {
        // A renderer that went away is not our problem.
        let _ = self.tx.send(DisplayEvent::Detection {
            camera: camera.clone(),
            result,
        });
    }

    fn publish_failure(&self, camera: &CameraId, plugin: &PluginId, reason: &str) {
        let _ = self.tx.send(DisplayEvent::Failure {
            camera: camera.clone(),
            plugin: plugin.clone(),
            reason: reason.to_owned(),
        });
    }
}
