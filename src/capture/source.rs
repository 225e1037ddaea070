//! Frame source adapter: the boundary between the decode pipeline and dispatch

use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use tracing::{debug, warn};

use super::slot::{FrameSlot, SlotRead};
use crate::error::Error;
use crate::ids::StreamKey;
use crate::Frame;

/// Non-blocking access to the most recent frame of each stream
pub trait FrameSource: Send + Sync {
    /// Latest frame of `stream`. Unknown streams read as empty.
    fn latest_frame(&self, stream: &StreamKey) -> SlotRead;
}

/// Frame source backed by one [`FrameSlot`] per registered stream
///
/// The slot table itself is swapped atomically so lookups on the dispatch
/// path never take a lock, even while cameras are added or removed.
pub struct SlotFrameSource {
    slots: ArcSwap<HashMap<StreamKey, Arc<FrameSlot>>>,
}

/// Sole writer for one stream's slot
pub struct FramePublisher {
    stream: StreamKey,
    slot: Arc<FrameSlot>,
    last_sequence: u64,
}

impl SlotFrameSource {
    pub fn new() -> Self {
        Self {
            slots: ArcSwap::from_pointee(HashMap::new()),
        }
    }

    /// Create the slot for `stream` and hand out its only publisher
    pub fn register(&self, stream: StreamKey) -> Result<FramePublisher, Error> {
        let slot = Arc::new(FrameSlot::new());
        let mut inserted = false;

        self.slots.rcu(|current| {
            let mut next = HashMap::clone(current);
            inserted = !next.contains_key(&stream);
            if inserted {
                next.insert(stream.clone(), Arc::clone(&slot));
            }
            next
        });

        if !inserted {
            return Err(Error::StreamAlreadyPublished(stream));
        }

        debug!(%stream, "registered frame slot");
        Ok(FramePublisher {
            stream,
            slot,
            last_sequence: 0,
        })
    }

    /// Drop the slot for a removed camera stream
    pub fn unregister(&self, stream: &StreamKey) -> bool {
        let mut removed = false;
        self.slots.rcu(|current| {
            let mut next = HashMap::clone(current);
            removed = next.remove(stream).is_some();
            next
        });
        removed
    }

    pub fn slot(&self, stream: &StreamKey) -> Option<Arc<FrameSlot>> {
        self.slots.load().get(stream).cloned()
    }

    pub fn streams(&self) -> Vec<StreamKey> {
        let mut streams: Vec<_> = self.slots.load().keys().cloned().collect();
        streams.sort();
        streams
    }
}

impl Default for SlotFrameSource {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameSource for SlotFrameSource {
    fn latest_frame(&self, stream: &StreamKey) -> SlotRead {
        match self.slots.load().get(stream) {
            Some(slot) => slot.try_read(),
            None => SlotRead::Empty,
        }
    }
}

impl FramePublisher {
    pub fn stream(&self) -> &StreamKey {
        &self.stream
    }

    /// Publish a decoded frame. Frames whose sequence does not advance the
    /// stream are rejected so readers can rely on monotonic sequences.
    pub fn publish(&mut self, frame: Frame) -> bool {
        let sequence = frame.sequence();
        if sequence <= self.last_sequence {
            warn!(
                stream = %self.stream,
                sequence,
                last = self.last_sequence,
                "dropping non-monotonic frame"
            );
            return false;
        }

        self.last_sequence = sequence;
        self.slot.write(frame);
        true
    }

    pub fn last_sequence(&self) -> u64 {
        self.last_sequence
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::frame::{FrameMetadata, PixelFormat};

    fn frame(sequence: u64) -> Frame {
        Frame::new(
            FrameMetadata::packed(sequence, 0, 2, 2, PixelFormat::Rgb24),
            vec![0u8; 12],
        )
    }

    #[test]
    fn publisher_feeds_latest_frame() {
        let source = SlotFrameSource::new();
        let stream = StreamKey::new("front", 0);
        let mut publisher = source.register(stream.clone()).unwrap();

        assert!(matches!(source.latest_frame(&stream), SlotRead::Empty));
        assert!(publisher.publish(frame(1)));
        assert!(publisher.publish(frame(2)));

        match source.latest_frame(&stream) {
            SlotRead::Frame(f) => assert_eq!(f.sequence(), 2),
            other => panic!("unexpected read {other:?}"),
        }
    }

    #[test]
    fn second_publisher_is_refused() {
        let source = SlotFrameSource::new();
        let stream = StreamKey::new("front", 1);
        let _publisher = source.register(stream.clone()).unwrap();

        assert!(matches!(
            source.register(stream.clone()),
            Err(Error::StreamAlreadyPublished(_))
        ));

        assert!(source.unregister(&stream));
        assert!(source.register(stream).is_ok());
    }

    #[test]
    fn non_monotonic_frames_are_dropped() {
        let source = SlotFrameSource::new();
        let stream = StreamKey::new("yard", 0);
        let mut publisher = source.register(stream.clone()).unwrap();

        assert!(publisher.publish(frame(5)));
        assert!(!publisher.publish(frame(5)));
        assert!(!publisher.publish(frame(3)));
        assert_eq!(publisher.last_sequence(), 5);
        assert_eq!(source.slot(&stream).unwrap().generation(), 1);
    }

    #[test]
    fn unknown_stream_reads_empty() {
        let source = SlotFrameSource::new();
        assert!(matches!(
            source.latest_frame(&StreamKey::new("nowhere", 0)),
            SlotRead::Empty
        ));
        assert!(source.streams().is_empty());
    }
}
