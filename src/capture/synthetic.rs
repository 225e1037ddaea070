//! Test-pattern capture standing in for the external decode pipeline

use std::time::Duration;

use bytes::Bytes;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{info, instrument};

use crate::capture::frame::{Frame, FrameMetadata, PixelFormat};
use crate::capture::source::FramePublisher;
use crate::utils::unix_millis;
use crate::{CameraConfig, CaptureConfig};

/// Produces RGB24 frames whose brightness sweeps up and down over time
pub struct TestPatternCapture {
    width: u32,
    height: u32,
    fps: u32,
    sequence: u64,
}

impl TestPatternCapture {
    pub fn new(camera: &CameraConfig, defaults: &CaptureConfig) -> Self {
        let width = camera.width.unwrap_or(defaults.width).max(1);
        let height = camera.height.unwrap_or(defaults.height).max(1);
        let fps = camera.fps.unwrap_or(defaults.fps).max(1);

        info!(
            camera = %camera.id,
            width,
            height,
            fps,
            "Initializing test-pattern capture"
        );

        Self {
            width,
            height,
            fps,
            sequence: 0,
        }
    }

    pub fn frame_interval(&self) -> Duration {
        Duration::from_secs(1) / self.fps
    }

    /// Render the next frame of the pattern
    pub fn capture_frame(&mut self) -> Frame {
        self.sequence += 1;

        // Triangle wave over ~17 seconds at 30 fps.
        let phase = (self.sequence * 3) % 510;
        let level = (if phase > 255 { 510 - phase } else { phase }) as u8;

        let row_len = self.width as usize * 3;
        let mut data = Vec::with_capacity(row_len * self.height as usize);
        for y in 0..self.height {
            let shade = level.saturating_add((y % 16) as u8);
            data.extend(std::iter::repeat(shade).take(row_len));
        }

        let meta = FrameMetadata::packed(
            self.sequence,
            unix_millis(),
            self.width,
            self.height,
            PixelFormat::Rgb24,
        );

        Frame::new(meta, Bytes::from(data))
    }

    /// Publish frames at the configured rate until the task is aborted
    #[instrument(skip_all, fields(stream = %publisher.stream()))]
    pub async fn run(mut self, mut publisher: FramePublisher) {
        let mut ticker = interval(self.frame_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            ticker.tick().await;
            let frame = self.capture_frame();
            publisher.publish(frame);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn camera() -> CameraConfig {
        CameraConfig {
            id: "test".into(),
            tier: 0,
            width: Some(8),
            height: Some(4),
            fps: Some(25),
            plugins: Vec::new(),
        }
    }

    #[test]
    fn frames_advance_sequence_and_match_geometry() {
        let mut capture = TestPatternCapture::new(&camera(), &CaptureConfig::default());

        let first = capture.capture_frame();
        let second = capture.capture_frame();

        assert_eq!(first.sequence(), 1);
        assert_eq!(second.sequence(), 2);
        assert_eq!(first.data.len(), 8 * 4 * 3);
        assert_eq!(first.meta.stride, 24);
        assert_eq!(capture.frame_interval(), Duration::from_millis(40));
    }
}
