//! Lock-free single-frame slot for the latest decoded frame of a stream

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use crossbeam::utils::CachePadded;

use crate::Frame;

/// Holds exactly one "current" frame, overwritten in place.
///
/// The generation counter is odd while a write is in progress and even when
/// the slot is quiescent. Readers sample it before and after loading the
/// frame; a mismatch means the read raced a write and is abandoned for this
/// cycle. Neither side ever waits on the other.
pub struct FrameSlot {
    current: ArcSwapOption<Frame>,

    generation: CachePadded<AtomicU64>,

    /// Statistics
    stats: CachePadded<Stats>,
}

#[derive(Default)]
struct Stats {
    frames_written: AtomicU64,
    frames_read: AtomicU64,
    races: AtomicU64,
}

/// Outcome of a non-blocking slot read
#[derive(Debug, Clone)]
pub enum SlotRead {
    Frame(Arc<Frame>),
    Empty,
    /// A write overlapped the read; try again next tick
    Raced,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SlotStats {
    pub frames_written: u64,
    pub frames_read: u64,
    pub races: u64,
}

impl FrameSlot {
    pub fn new() -> Self {
        Self {
            current: ArcSwapOption::empty(),
            generation: CachePadded::new(AtomicU64::new(0)),
            stats: CachePadded::new(Stats::default()),
        }
    }

    /// Writer: replace the current frame
    pub fn write(&self, frame: Frame) {
        let frame = Arc::new(frame);

        self.generation.fetch_add(1, Ordering::SeqCst);
        self.current.store(Some(frame));
        self.generation.fetch_add(1, Ordering::SeqCst);

        self.stats.frames_written.fetch_add(1, Ordering::Relaxed);
    }

    /// Reader: snapshot the current frame if no write overlapped the read
    pub fn try_read(&self) -> SlotRead {
        let before = self.generation.load(Ordering::SeqCst);
        if before & 1 == 1 {
            self.stats.races.fetch_add(1, Ordering::Relaxed);
            return SlotRead::Raced;
        }

        let frame = self.current.load_full();

        let after = self.generation.load(Ordering::SeqCst);
        if before != after {
            self.stats.races.fetch_add(1, Ordering::Relaxed);
            return SlotRead::Raced;
        }

        match frame {
            Some(frame) => {
                self.stats.frames_read.fetch_add(1, Ordering::Relaxed);
                SlotRead::Frame(frame)
            }
            None => SlotRead::Empty,
        }
    }

    /// Number of completed writes
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst) / 2
    }

    pub fn stats(&self) -> SlotStats {
        SlotStats {
            frames_written: self.stats.frames_written.load(Ordering::Relaxed),
            frames_read: self.stats.frames_read.load(Ordering::Relaxed),
            races: self.stats.races.load(Ordering::Relaxed),
        }
    }
}

impl Default for FrameSlot {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::frame::{FrameMetadata, PixelFormat};
    use std::thread;

    fn frame(sequence: u64, len: usize) -> Frame {
        Frame::new(
            FrameMetadata::packed(sequence, sequence * 33, 4, 4, PixelFormat::Rgb24),
            vec![(sequence % 251) as u8; len],
        )
    }

    #[test]
    fn empty_until_first_write() {
        let slot = FrameSlot::new();
        assert!(matches!(slot.try_read(), SlotRead::Empty));
        assert_eq!(slot.generation(), 0);

        slot.write(frame(1, 48));
        match slot.try_read() {
            SlotRead::Frame(f) => assert_eq!(f.sequence(), 1),
            other => panic!("unexpected read {other:?}"),
        }
        assert_eq!(slot.generation(), 1);
    }

    #[test]
    fn latest_write_wins() {
        let slot = FrameSlot::new();
        for seq in 1..=5 {
            slot.write(frame(seq, 48));
        }

        match slot.try_read() {
            SlotRead::Frame(f) => assert_eq!(f.sequence(), 5),
            other => panic!("unexpected read {other:?}"),
        }
        assert_eq!(slot.generation(), 5);
        assert_eq!(slot.stats().frames_written, 5);
    }

    #[test]
    fn write_in_progress_is_reported_as_race() {
        let slot = FrameSlot::new();
        slot.write(frame(1, 48));

        // Park the counter mid-write.
        slot.generation.fetch_add(1, Ordering::SeqCst);
        assert!(matches!(slot.try_read(), SlotRead::Raced));
        assert_eq!(slot.stats().races, 1);

        slot.generation.fetch_add(1, Ordering::SeqCst);
        assert!(matches!(slot.try_read(), SlotRead::Frame(_)));
    }

    #[test]
    fn readers_never_observe_torn_frames() {
        let slot = Arc::new(FrameSlot::new());
        let writer = {
            let slot = Arc::clone(&slot);
            thread::spawn(move || {
                for seq in 1..=20_000u64 {
                    slot.write(frame(seq, 256));
                }
            })
        };

        let readers: Vec<_> = (0..3)
            .map(|_| {
                let slot = Arc::clone(&slot);
                thread::spawn(move || {
                    let mut last = 0;
                    let mut seen = 0u64;
                    while last < 20_000 {
                        if let SlotRead::Frame(f) = slot.try_read() {
                            let expected = (f.sequence() % 251) as u8;
                            assert!(f.data.iter().all(|b| *b == expected));
                            assert_eq!(f.meta.timestamp_ms, f.sequence() * 33);
                            assert!(f.sequence() >= last, "sequence went backwards");
                            last = f.sequence();
                            seen += 1;
                        }
                    }
                    seen
                })
            })
            .collect();

        writer.join().unwrap();
        for reader in readers {
            assert!(reader.join().unwrap() > 0);
        }
    }
}
