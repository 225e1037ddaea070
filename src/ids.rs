//! Identifiers shared across capture, supervision and display

use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CameraId(String);

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PluginId(String);

/// One decoded stream of a camera. Tier 0 is the full-resolution stream,
/// higher tiers are downscaled copies produced by the decoder.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamKey {
    pub camera: CameraId,
    pub tier: u32,
}

/// A camera stream paired with the plugin analysing it. The same plugin
/// may be bound to several tiers of one camera.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BindingKey {
    pub camera: CameraId,
    pub tier: u32,
    pub plugin: PluginId,
}

impl CameraId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl PluginId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl StreamKey {
    pub fn new(camera: impl Into<CameraId>, tier: u32) -> Self {
        Self {
            camera: camera.into(),
            tier,
        }
    }
}

impl BindingKey {
    /// Binding on the full-resolution stream
    pub fn new(camera: impl Into<CameraId>, plugin: impl Into<PluginId>) -> Self {
        Self::for_stream(StreamKey::new(camera, 0), plugin)
    }

    pub fn for_stream(stream: StreamKey, plugin: impl Into<PluginId>) -> Self {
        Self {
            camera: stream.camera,
            tier: stream.tier,
            plugin: plugin.into(),
        }
    }

    pub fn stream(&self) -> StreamKey {
        StreamKey::new(self.camera.clone(), self.tier)
    }
}

impl From<&str> for CameraId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl From<String> for CameraId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for PluginId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl From<String> for PluginId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for CameraId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Display for PluginId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Display for StreamKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.camera, self.tier)
    }
}

impl fmt::Display for BindingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.tier {
            0 => write!(f, "{}:{}", self.camera, self.plugin),
            tier => write!(f, "{}/{}:{}", self.camera, tier, self.plugin),
        }
    }
}
