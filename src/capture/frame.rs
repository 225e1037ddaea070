use std::fmt;
use std::str::FromStr;
use std::time::Instant;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Frame data with zero-copy semantics
///
/// Frames are published into a slot as `Arc<Frame>` and never mutated
/// afterwards, so every reader sees the exact bytes the decoder produced.
#[derive(Clone)]
pub struct Frame {
    /// Immutable frame data - can be shared across threads without copying
    pub data: Bytes,

    /// Frame metadata
    pub meta: FrameMetadata,

    /// Host arrival time for latency tracking
    pub captured_at: Instant,
}

/// Frame metadata
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameMetadata {
    /// Monotonic per stream, starting at 1
    pub sequence: u64,
    /// Capture time, milliseconds since the UNIX epoch
    pub timestamp_ms: u64,
    pub width: u32,
    pub height: u32,
    pub stride: u32,
    pub format: PixelFormat,
}

/// Pixel formats we support
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PixelFormat {
    Rgb24,
    Bgr24,
    Yuyv4,
    Mjpeg,
    Nv12,
}

impl Frame {
    pub fn new(meta: FrameMetadata, data: impl Into<Bytes>) -> Self {
        Self {
            data: data.into(),
            meta,
            captured_at: Instant::now(),
        }
    }

    pub fn sequence(&self) -> u64 {
        self.meta.sequence
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("meta", &self.meta)
            .field("bytes", &self.data.len())
            .finish()
    }
}

impl FrameMetadata {
    /// Metadata for a tightly packed frame
    pub fn packed(
        sequence: u64,
        timestamp_ms: u64,
        width: u32,
        height: u32,
        format: PixelFormat,
    ) -> Self {
        let stride = format
            .bytes_per_pixel()
            .map(|bpp| width * bpp as u32)
            .unwrap_or(width);
        Self {
            sequence,
            timestamp_ms,
            width,
            height,
            stride,
            format,
        }
    }
}

impl PixelFormat {
    pub fn as_str(self) -> &'static str {
        match self {
            PixelFormat::Rgb24 => "rgb24",
            PixelFormat::Bgr24 => "bgr24",
            PixelFormat::Yuyv4 => "yuyv4",
            PixelFormat::Mjpeg => "mjpeg",
            PixelFormat::Nv12 => "nv12",
        }
    }

    /// Bytes per pixel for packed formats; `None` for compressed or planar ones
    pub fn bytes_per_pixel(self) -> Option<usize> {
        match self {
            PixelFormat::Rgb24 | PixelFormat::Bgr24 => Some(3),
            PixelFormat::Yuyv4 => Some(2),
            PixelFormat::Mjpeg | PixelFormat::Nv12 => None,
        }
    }
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PixelFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "rgb24" => Ok(PixelFormat::Rgb24),
            "bgr24" => Ok(PixelFormat::Bgr24),
            "yuyv4" => Ok(PixelFormat::Yuyv4),
            "mjpeg" => Ok(PixelFormat::Mjpeg),
            "nv12" => Ok(PixelFormat::Nv12),
            other => Err(format!("unknown pixel format `{other}`")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pixel_format_names_round_trip() {
        for format in [
            PixelFormat::Rgb24,
            PixelFormat::Bgr24,
            PixelFormat::Yuyv4,
            PixelFormat::Mjpeg,
            PixelFormat::Nv12,
        ] {
            assert_eq!(format.as_str().parse::<PixelFormat>(), Ok(format));
        }
        assert!("rgba".parse::<PixelFormat>().is_err());
    }

    #[test]
    fn packed_stride_follows_format() {
        let rgb = FrameMetadata::packed(1, 0, 640, 480, PixelFormat::Rgb24);
        assert_eq!(rgb.stride, 1920);

        let jpeg = FrameMetadata::packed(1, 0, 640, 480, PixelFormat::Mjpeg);
        assert_eq!(jpeg.stride, 640);
    }

    #[test]
    fn debug_omits_payload() {
        let frame = Frame::new(
            FrameMetadata::packed(7, 0, 2, 1, PixelFormat::Rgb24),
            vec![0u8; 6],
        );
        let text = format!("{frame:?}");
        assert!(text.contains("bytes: 6"));
        assert_eq!(frame.sequence(), 7);
    }
}
