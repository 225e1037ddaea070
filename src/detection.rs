//! Structured analysis results handed to the display layer

use std::fmt;

use crate::ids::PluginId;

/// Axis-aligned box in normalized image coordinates (0.0 ..= 1.0)
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingBox {
    pub left: f32,
    pub top: f32,
    pub right: f32,
    pub bottom: f32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DetectedObject {
    pub label: String,
    pub confidence: f32,
    pub bbox: BoundingBox,
}

/// Everything one plugin reported about one frame
#[derive(Debug, Clone, PartialEq)]
pub struct DetectionResult {
    pub plugin: PluginId,
    /// Sequence of the frame the result was computed from
    pub sequence: u64,
    pub timestamp_ms: u64,
    pub objects: Vec<DetectedObject>,
}

impl BoundingBox {
    /// Returns `None` unless the box lies inside the unit square with
    /// `left <= right` and `top <= bottom`.
    pub fn new(left: f32, top: f32, right: f32, bottom: f32) -> Option<Self> {
        let unit = |v: f32| (0.0..=1.0).contains(&v);
        if unit(left) && unit(top) && unit(right) && unit(bottom) && left <= right && top <= bottom
        {
            Some(Self {
                left,
                top,
                right,
                bottom,
            })
        } else {
            None
        }
    }

    pub fn full_frame() -> Self {
        Self {
            left: 0.0,
            top: 0.0,
            right: 1.0,
            bottom: 1.0,
        }
    }

    pub fn width(&self) -> f32 {
        self.right - self.left
    }

    pub fn height(&self) -> f32 {
        self.bottom - self.top
    }

    pub fn area(&self) -> f32 {
        self.width() * self.height()
    }
}

impl DetectedObject {
    pub fn new(label: impl Into<String>, confidence: f32, bbox: BoundingBox) -> Self {
        Self {
            label: label.into(),
            confidence,
            bbox,
        }
    }
}

/// Wire form: `label,confidence,left,top,right,bottom`
impl fmt::Display for DetectedObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label: String = self
            .label
            .chars()
            .map(|c| if matches!(c, ';' | '\n' | '\r') { ' ' } else { c })
            .collect();
        write!(
            f,
            "{},{},{},{},{},{}",
            label.trim(),
            self.confidence,
            self.bbox.left,
            self.bbox.top,
            self.bbox.right,
            self.bbox.bottom
        )
    }
}
