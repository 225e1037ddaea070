//! Per-(camera, plugin) worker state

use std::fmt;

use tokio::sync::OwnedSemaphorePermit;
use tokio::time::Instant;
use tracing::warn;

use crate::ids::{BindingKey, StreamKey};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkerState {
    Starting,
    Ready,
    Busy,
    Unresponsive,
    Crashed,
    Terminating,
    Stopped,
}

impl WorkerState {
    pub fn can_transition_to(self, next: WorkerState) -> bool {
        use WorkerState::*;

        matches!(
            (self, next),
            (Stopped, Starting)
                | (Starting, Ready)
                | (Starting, Unresponsive)
                | (Ready, Busy)
                | (Ready, Unresponsive)
                | (Busy, Ready)
                | (Busy, Unresponsive)
                | (Unresponsive, Starting)
                | (Unresponsive, Crashed)
                | (Starting | Ready | Busy | Unresponsive, Terminating)
                | (Terminating, Stopped)
        )
    }

    /// A process is running and expected to answer
    pub fn is_live(self) -> bool {
        matches!(
            self,
            WorkerState::Starting | WorkerState::Ready | WorkerState::Busy
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            WorkerState::Starting => "starting",
            WorkerState::Ready => "ready",
            WorkerState::Busy => "busy",
            WorkerState::Unresponsive => "unresponsive",
            WorkerState::Crashed => "crashed",
            WorkerState::Terminating => "terminating",
            WorkerState::Stopped => "stopped",
        }
    }
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The one frame a worker is currently analysing
#[derive(Debug)]
pub struct InFlight {
    pub sequence: u64,
    pub timestamp_ms: u64,
    pub sent_at: Instant,
    /// Held while the frame is outstanding when a global cap is configured
    pub permit: Option<OwnedSemaphorePermit>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BindingCounters {
    pub frames_dispatched: u64,
    pub frames_skipped: u64,
    pub results_accepted: u64,
    pub results_stale: u64,
}

#[derive(Debug)]
pub struct WorkerBinding {
    pub key: BindingKey,
    pub stream: StreamKey,
    state: WorkerState,
    pub pid: Option<u32>,
    /// Incremented on every spawn; events tagged with an older epoch are stale
    pub epoch: u64,
    pub last_sent: u64,
    pub last_acknowledged: u64,
    in_flight: Option<InFlight>,
    pub restart_count: u32,
    pub last_activity: Instant,
    pub counters: BindingCounters,
}

/// Point-in-time view of a binding for status queries
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindingSnapshot {
    pub key: BindingKey,
    pub state: WorkerState,
    pub pid: Option<u32>,
    pub epoch: u64,
    pub restart_count: u32,
    pub last_acknowledged: u64,
    pub in_flight: Option<u64>,
    pub frames_dispatched: u64,
    pub frames_skipped: u64,
    pub results_accepted: u64,
    pub results_stale: u64,
}

impl WorkerBinding {
    pub fn new(key: BindingKey) -> Self {
        Self {
            stream: key.stream(),
            key,
            state: WorkerState::Stopped,
            pid: None,
            epoch: 0,
            last_sent: 0,
            last_acknowledged: 0,
            in_flight: None,
            restart_count: 0,
            last_activity: Instant::now(),
            counters: BindingCounters::default(),
        }
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    pub fn in_flight(&self) -> Option<&InFlight> {
        self.in_flight.as_ref()
    }

    /// Move to `next` if the lifecycle allows it. Busy ↔ Ready must go
    /// through [`begin_dispatch`](Self::begin_dispatch) and friends.
    pub fn transition(&mut self, next: WorkerState) -> bool {
        if !self.state.can_transition_to(next) {
            warn!(
                binding = %self.key,
                from = %self.state,
                to = %next,
                "refusing invalid worker state transition"
            );
            return false;
        }

        if self.state == WorkerState::Busy || next == WorkerState::Busy {
            // Leaving Busy any other way drops the in-flight frame.
            if next != WorkerState::Busy {
                self.in_flight = None;
            } else if self.in_flight.is_none() {
                warn!(binding = %self.key, "Busy requires an in-flight frame");
                return false;
            }
        }

        self.state = next;
        true
    }

    /// Ready → Busy with `flight` outstanding
    pub fn begin_dispatch(&mut self, flight: InFlight, skipped: u64) -> bool {
        if self.state != WorkerState::Ready {
            return false;
        }
        self.last_sent = flight.sequence;
        self.in_flight = Some(flight);
        self.state = WorkerState::Busy;
        self.counters.frames_dispatched += 1;
        self.counters.frames_skipped += skipped;
        true
    }

    /// Busy → Ready after the worker answered for the in-flight frame
    pub fn complete_dispatch(&mut self) -> Option<InFlight> {
        if self.state != WorkerState::Busy {
            return None;
        }
        let flight = self.in_flight.take()?;
        self.last_acknowledged = flight.sequence;
        self.counters.results_accepted += 1;
        self.state = WorkerState::Ready;
        Some(flight)
    }

    /// Busy → Ready without a result (worker reported an error)
    pub fn abandon(&mut self) -> Option<InFlight> {
        if self.state != WorkerState::Busy {
            return None;
        }
        let flight = self.in_flight.take();
        self.state = WorkerState::Ready;
        flight
    }

    /// Reset per-process fields for a fresh spawn
    pub fn begin_epoch(&mut self, pid: Option<u32>, now: Instant) -> u64 {
        self.epoch += 1;
        self.pid = pid;
        self.in_flight = None;
        self.last_activity = now;
        self.epoch
    }

    pub fn touch(&mut self, now: Instant) {
        self.last_activity = now;
    }

    pub fn snapshot(&self) -> BindingSnapshot {
        BindingSnapshot {
            key: self.key.clone(),
            state: self.state,
            pid: self.pid,
            epoch: self.epoch,
            restart_count: self.restart_count,
            last_acknowledged: self.last_acknowledged,
            in_flight: self.in_flight.as_ref().map(|f| f.sequence),
            frames_dispatched: self.counters.frames_dispatched,
            frames_skipped: self.counters.frames_skipped,
            results_accepted: self.counters.results_accepted,
            results_stale: self.counters.results_stale,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use WorkerState::*;

    fn binding() -> WorkerBinding {
        WorkerBinding::new(BindingKey::new("cam", "plug"))
    }

    fn flight(sequence: u64) -> InFlight {
        InFlight {
            sequence,
            timestamp_ms: 0,
            sent_at: Instant::now(),
            permit: None,
        }
    }

    #[test]
    fn lifecycle_table() {
        assert!(Stopped.can_transition_to(Starting));
        assert!(Starting.can_transition_to(Ready));
        assert!(Busy.can_transition_to(Unresponsive));
        assert!(Unresponsive.can_transition_to(Starting));
        assert!(Unresponsive.can_transition_to(Crashed));
        assert!(Ready.can_transition_to(Terminating));
        assert!(Terminating.can_transition_to(Stopped));

        assert!(!Crashed.can_transition_to(Starting));
        assert!(!Crashed.can_transition_to(Terminating));
        assert!(!Stopped.can_transition_to(Ready));
        assert!(!Starting.can_transition_to(Busy));
        assert!(!Unresponsive.can_transition_to(Ready));
    }

    #[test]
    fn invalid_transition_is_refused() {
        let mut b = binding();
        assert!(!b.transition(Ready));
        assert_eq!(b.state(), Stopped);
        assert!(b.transition(Starting));
        assert!(!b.transition(Busy));
        assert_eq!(b.state(), Starting);
    }

    #[test]
    fn busy_iff_one_frame_in_flight() {
        let mut b = binding();
        b.transition(Starting);
        b.transition(Ready);
        assert!(b.in_flight().is_none());

        assert!(b.begin_dispatch(flight(3), 2));
        assert_eq!(b.state(), Busy);
        assert_eq!(b.in_flight().map(|f| f.sequence), Some(3));
        assert!(!b.begin_dispatch(flight(4), 0));

        let done = b.complete_dispatch().unwrap();
        assert_eq!(done.sequence, 3);
        assert_eq!(b.state(), Ready);
        assert!(b.in_flight().is_none());
        assert_eq!(b.last_acknowledged, 3);

        let snap = b.snapshot();
        assert_eq!(snap.frames_dispatched, 1);
        assert_eq!(snap.frames_skipped, 2);
        assert_eq!(snap.results_accepted, 1);
    }

    #[test]
    fn leaving_busy_drops_the_in_flight_frame() {
        let mut b = binding();
        b.transition(Starting);
        b.transition(Ready);
        b.begin_dispatch(flight(1), 0);

        assert!(b.transition(Unresponsive));
        assert!(b.in_flight().is_none());
        assert_eq!(b.snapshot().in_flight, None);
    }

    #[test]
    fn abandon_returns_to_ready_without_acknowledging() {
        let mut b = binding();
        b.transition(Starting);
        b.transition(Ready);
        b.begin_dispatch(flight(5), 0);

        assert_eq!(b.abandon().map(|f| f.sequence), Some(5));
        assert_eq!(b.state(), Ready);
        assert_eq!(b.last_acknowledged, 0);
        assert_eq!(b.last_sent, 5);
    }

    #[test]
    fn new_epoch_per_spawn() {
        let mut b = binding();
        assert_eq!(b.begin_epoch(Some(10), Instant::now()), 1);
        assert_eq!(b.begin_epoch(Some(11), Instant::now()), 2);
        assert_eq!(b.pid, Some(11));
    }
}
