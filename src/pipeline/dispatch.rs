//! Freshest-frame dispatch: one frame in flight per worker, never a queue

use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::capture::{FrameSource, SlotRead};
use crate::error::WorkerError;
use crate::worker::binding::{InFlight, WorkerBinding, WorkerState};
use crate::worker::channel::ResultChannel;
use crate::worker::protocol::{FrameDescriptor, HostMessage};
use crate::worker::shm::PayloadEncoder;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    Dispatched { sequence: u64, skipped: u64 },
    /// Worker is not Ready (busy, starting, down)
    NotReady,
    NoNewFrame,
    Raced,
    /// The global in-flight cap is reached
    Throttled,
}

pub struct Dispatcher {
    source: Arc<dyn FrameSource>,
    encoder: PayloadEncoder,
    permits: Option<Arc<Semaphore>>,
}

impl Dispatcher {
    pub fn new(
        source: Arc<dyn FrameSource>,
        encoder: PayloadEncoder,
        permits: Option<Arc<Semaphore>>,
    ) -> Self {
        Self {
            source,
            encoder,
            permits,
        }
    }

    /// Hand the newest frame to a Ready worker, if there is one it hasn't seen
    pub async fn tick(
        &mut self,
        binding: &mut WorkerBinding,
        channel: &mut ResultChannel,
    ) -> Result<DispatchOutcome, WorkerError> {
        if binding.state() != WorkerState::Ready {
            return Ok(DispatchOutcome::NotReady);
        }

        let frame = match self.source.latest_frame(&binding.stream) {
            SlotRead::Frame(frame) => frame,
            SlotRead::Empty => return Ok(DispatchOutcome::NoNewFrame),
            SlotRead::Raced => {
                metrics::counter!("argus_frame_races").increment(1);
                debug!(binding = %binding.key, "{}", WorkerError::FrameRace);
                return Ok(DispatchOutcome::Raced);
            }
        };

        let sequence = frame.sequence();
        if sequence <= binding.last_sent {
            return Ok(DispatchOutcome::NoNewFrame);
        }

        let permit = match &self.permits {
            Some(permits) => match Arc::clone(permits).try_acquire_owned() {
                Ok(permit) => Some(permit),
                Err(_) => return Ok(DispatchOutcome::Throttled),
            },
            None => None,
        };

        let payload = self.encoder.encode(&frame).map_err(WorkerError::Channel)?;
        let message = HostMessage::Frame(FrameDescriptor::new(&frame.meta, payload));
        channel.send(&message).await?;

        let skipped = sequence.saturating_sub(binding.last_sent + 1);
        let now = Instant::now();
        binding.begin_dispatch(
            InFlight {
                sequence,
                timestamp_ms: frame.meta.timestamp_ms,
                sent_at: now,
                permit,
            },
            skipped,
        );
        binding.touch(now);

        metrics::counter!("argus_frames_dispatched").increment(1);
        metrics::counter!("argus_frames_skipped").increment(skipped);
        trace!(binding = %binding.key, sequence, skipped, "frame dispatched");

        Ok(DispatchOutcome::Dispatched { sequence, skipped })
    }

    /// Accept a result only for the frame currently in flight
    pub fn acknowledge(
        &self,
        binding: &mut WorkerBinding,
        sequence: u64,
    ) -> Result<InFlight, WorkerError> {
        let tracked = binding.in_flight().map(|f| f.sequence) == Some(sequence);
        match tracked.then(|| binding.complete_dispatch()).flatten() {
            Some(flight) => {
                metrics::counter!("argus_results_accepted").increment(1);
                Ok(flight)
            }
            None => {
                binding.counters.results_stale += 1;
                metrics::counter!("argus_results_stale").increment(1);
                Err(WorkerError::StaleResult(sequence))
            }
        }
    }

    /// Drop the in-flight frame after the worker reported an error for it
    pub fn abandon(&self, binding: &mut WorkerBinding) -> Option<InFlight> {
        binding.abandon()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::io::{AsyncBufReadExt, BufReader, DuplexStream, Lines, ReadHalf};

    use super::*;
    use crate::capture::frame::{Frame, FrameMetadata, PixelFormat};
    use crate::capture::{FramePublisher, SlotFrameSource};
    use crate::ids::{BindingKey, StreamKey};
    use crate::worker::channel::LinkEvent;

    struct Harness {
        publisher: FramePublisher,
        dispatcher: Dispatcher,
        binding: WorkerBinding,
        channel: ResultChannel,
        worker_lines: Lines<BufReader<ReadHalf<DuplexStream>>>,
        _events: flume::Receiver<LinkEvent>,
        _worker_write: tokio::io::WriteHalf<DuplexStream>,
    }

    fn harness(permits: Option<Arc<Semaphore>>) -> Harness {
        let stream = StreamKey::new("cam", 0);
        let source = Arc::new(SlotFrameSource::new());
        let publisher = source.register(stream).unwrap();

        let (host, worker) = tokio::io::duplex(64 * 1024);
        let (host_read, host_write) = tokio::io::split(host);
        let (worker_read, worker_write) = tokio::io::split(worker);
        let (tx, rx) = flume::unbounded();
        let channel = ResultChannel::open(
            1,
            Box::new(host_write),
            Box::new(host_read),
            tx,
            Duration::from_secs(1),
        );

        let mut binding = WorkerBinding::new(BindingKey::new("cam", "plug"));
        binding.transition(WorkerState::Starting);
        binding.transition(WorkerState::Ready);

        Harness {
            publisher,
            dispatcher: Dispatcher::new(source, PayloadEncoder::Inline, permits),
            binding,
            channel,
            worker_lines: BufReader::new(worker_read).lines(),
            _events: rx,
            _worker_write: worker_write,
        }
    }

    fn frame(sequence: u64) -> Frame {
        Frame::new(
            FrameMetadata::packed(sequence, 1_000 + sequence, 2, 1, PixelFormat::Rgb24),
            vec![0u8; 6],
        )
    }

    #[tokio::test]
    async fn dispatches_only_newer_frames_to_ready_workers() {
        let mut h = harness(None);

        let outcome = h.dispatcher.tick(&mut h.binding, &mut h.channel).await.unwrap();
        assert_eq!(outcome, DispatchOutcome::NoNewFrame);

        h.publisher.publish(frame(1));
        h.publisher.publish(frame(2));
        let outcome = h.dispatcher.tick(&mut h.binding, &mut h.channel).await.unwrap();
        assert_eq!(
            outcome,
            DispatchOutcome::Dispatched {
                sequence: 2,
                skipped: 1
            }
        );
        assert_eq!(h.binding.state(), WorkerState::Busy);
        let line = h.worker_lines.next_line().await.unwrap().unwrap();
        assert!(line.starts_with("FRAME 2 1002 2x1 rgb24 inline:"), "{line}");

        // Busy workers are skipped however many frames arrive.
        h.publisher.publish(frame(3));
        let outcome = h.dispatcher.tick(&mut h.binding, &mut h.channel).await.unwrap();
        assert_eq!(outcome, DispatchOutcome::NotReady);

        h.dispatcher.acknowledge(&mut h.binding, 2).unwrap();
        let outcome = h.dispatcher.tick(&mut h.binding, &mut h.channel).await.unwrap();
        assert_eq!(
            outcome,
            DispatchOutcome::Dispatched {
                sequence: 3,
                skipped: 0
            }
        );

        h.dispatcher.acknowledge(&mut h.binding, 3).unwrap();
        let outcome = h.dispatcher.tick(&mut h.binding, &mut h.channel).await.unwrap();
        assert_eq!(outcome, DispatchOutcome::NoNewFrame);
    }

    #[tokio::test]
    async fn untracked_results_leave_state_alone() {
        let mut h = harness(None);
        h.publisher.publish(frame(5));
        h.dispatcher.tick(&mut h.binding, &mut h.channel).await.unwrap();

        let err = h.dispatcher.acknowledge(&mut h.binding, 4).unwrap_err();
        assert!(matches!(err, WorkerError::StaleResult(4)));
        assert_eq!(h.binding.state(), WorkerState::Busy);
        assert_eq!(h.binding.in_flight().map(|f| f.sequence), Some(5));
        assert_eq!(h.binding.counters.results_stale, 1);

        h.dispatcher.acknowledge(&mut h.binding, 5).unwrap();
        assert!(h.dispatcher.acknowledge(&mut h.binding, 5).is_err());
        assert_eq!(h.binding.state(), WorkerState::Ready);
    }

    #[tokio::test]
    async fn global_cap_throttles_and_releases() {
        let permits = Arc::new(Semaphore::new(1));
        let mut h = harness(Some(Arc::clone(&permits)));
        h.publisher.publish(frame(1));

        let _held = Arc::clone(&permits).try_acquire_owned().unwrap();
        let outcome = h.dispatcher.tick(&mut h.binding, &mut h.channel).await.unwrap();
        assert_eq!(outcome, DispatchOutcome::Throttled);
        assert_eq!(h.binding.state(), WorkerState::Ready);
        drop(_held);

        h.dispatcher.tick(&mut h.binding, &mut h.channel).await.unwrap();
        assert_eq!(permits.available_permits(), 0);

        h.dispatcher.acknowledge(&mut h.binding, 1).unwrap();
        assert_eq!(permits.available_permits(), 1);
    }
}
