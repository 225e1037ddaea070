//! Worker process lifecycle: spawn, health checks, restarts and termination

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use flume::Sender;
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};

use super::binding::{WorkerBinding, WorkerState};
use super::channel::{LinkEvent, ResultChannel};
use super::launcher::{LaunchSpec, Launcher, Termination, WorkerProcess};
use super::protocol::{HostMessage, PROTOCOL_VERSION};
use crate::error::{ProtocolError, WorkerError};
use crate::SupervisionConfig;

/// Sliding-window restart budget with exponential backoff
#[derive(Debug)]
pub struct RestartTracker {
    max_restarts: u32,
    window: Duration,
    base: Duration,
    max: Duration,
    history: VecDeque<Instant>,
}

impl RestartTracker {
    pub fn new(settings: &SupervisionConfig) -> Self {
        Self {
            max_restarts: settings.max_restarts,
            window: settings.restart_window(),
            base: settings.backoff_base(),
            max: settings.backoff_max(),
            history: VecDeque::new(),
        }
    }

    /// Record a restart at `now`. Returns the delay before respawning, or
    /// `None` once the budget for the window is spent.
    pub fn record(&mut self, now: Instant) -> Option<Duration> {
        while let Some(&oldest) = self.history.front() {
            if now.duration_since(oldest) > self.window {
                self.history.pop_front();
            } else {
                break;
            }
        }

        if self.history.len() >= self.max_restarts as usize {
            return None;
        }

        self.history.push_back(now);
        Some(self.backoff(self.history.len() as u32))
    }

    /// Delay before the `attempt`-th restart (1-based)
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(20);
        self.base.saturating_mul(1 << exponent).min(self.max)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartOutcome {
    Scheduled(Duration),
    Exhausted,
}

struct ActiveWorker {
    channel: ResultChannel,
    process: WorkerProcess,
}

/// Owns the worker process behind one binding and drives its lifecycle
/// transitions. Ready ↔ Busy is left to the dispatch path.
pub struct ProcessManager {
    launcher: Arc<dyn Launcher>,
    spec: LaunchSpec,
    settings: SupervisionConfig,
    restarts: RestartTracker,
    events: Sender<LinkEvent>,
    worker: Option<ActiveWorker>,
    ready_deadline: Option<Instant>,
    respawn_at: Option<Instant>,
}

impl ProcessManager {
    pub fn new(
        launcher: Arc<dyn Launcher>,
        spec: LaunchSpec,
        settings: SupervisionConfig,
        events: Sender<LinkEvent>,
    ) -> Self {
        Self {
            launcher,
            restarts: RestartTracker::new(&settings),
            spec,
            settings,
            events,
            worker: None,
            ready_deadline: None,
            respawn_at: None,
        }
    }

    pub fn channel_mut(&mut self) -> Option<&mut ResultChannel> {
        self.worker.as_mut().map(|w| &mut w.channel)
    }

    /// Launch a worker and ask it to announce readiness
    #[instrument(skip_all, fields(binding = %binding.key))]
    pub async fn spawn(&mut self, binding: &mut WorkerBinding) -> Result<(), WorkerError> {
        if !binding.transition(WorkerState::Starting) {
            return Ok(());
        }

        let link = self
            .launcher
            .launch(&self.spec)
            .map_err(WorkerError::SpawnFailure)?;

        let now = Instant::now();
        let pid = link.process.id();
        let epoch = binding.begin_epoch(pid, now);
        let channel = ResultChannel::open(
            epoch,
            link.input,
            link.output,
            self.events.clone(),
            self.settings.send_timeout(),
        );

        self.worker = Some(ActiveWorker {
            channel,
            process: link.process,
        });
        self.ready_deadline = Some(now + self.settings.ready_timeout());

        info!(?pid, epoch, "worker started");
        self.send(&HostMessage::ReadyPoll).await
    }

    pub async fn send(&mut self, message: &HostMessage) -> Result<(), WorkerError> {
        let worker = self
            .worker
            .as_mut()
            .ok_or_else(|| WorkerError::Crash("no worker process".into()))?;
        worker.channel.send(message).await
    }

    /// Handle a `READY` announcement
    pub fn on_ready(
        &mut self,
        binding: &mut WorkerBinding,
        version: Option<u32>,
    ) -> Result<(), WorkerError> {
        if let Some(version) = version.filter(|v| *v != PROTOCOL_VERSION) {
            return Err(ProtocolError::UnsupportedVersion(version).into());
        }

        if binding.state() == WorkerState::Starting {
            binding.transition(WorkerState::Ready);
            self.ready_deadline = None;
            info!(binding = %binding.key, pid = ?binding.pid, "worker ready");
        } else {
            debug!(binding = %binding.key, state = %binding.state(), "ignoring repeated READY");
        }
        Ok(())
    }

    /// Respawn the worker once its backoff delay has elapsed
    pub async fn poll_respawn(
        &mut self,
        binding: &mut WorkerBinding,
        now: Instant,
    ) -> Result<(), WorkerError> {
        match self.respawn_at {
            Some(at) if at <= now => {
                self.respawn_at = None;
                self.spawn(binding).await
            }
            _ => Ok(()),
        }
    }

    /// Detect exited, silent and stuck workers
    pub fn health_check(&mut self, binding: &WorkerBinding, now: Instant) -> Result<(), WorkerError> {
        if !binding.state().is_live() {
            return Ok(());
        }

        if let Some(worker) = self.worker.as_mut() {
            if let Some(status) = worker.process.exit_status() {
                return Err(WorkerError::Crash(status));
            }
        }

        match binding.state() {
            WorkerState::Starting => match self.ready_deadline {
                Some(deadline) if now >= deadline => {
                    Err(WorkerError::Timeout(self.settings.ready_timeout()))
                }
                _ => Ok(()),
            },
            WorkerState::Busy
                if now.duration_since(binding.last_activity) > self.settings.stale_after() =>
            {
                Err(WorkerError::Timeout(self.settings.stale_after()))
            }
            _ => Ok(()),
        }
    }

    /// Mark the binding unresponsive and restart it, unless it is already
    /// finished or on its way out.
    #[instrument(skip_all, fields(binding = %binding.key))]
    pub async fn handle_fault(
        &mut self,
        binding: &mut WorkerBinding,
        fault: WorkerError,
    ) -> Option<RestartOutcome> {
        match binding.state() {
            WorkerState::Crashed | WorkerState::Stopped | WorkerState::Terminating => {
                debug!(state = %binding.state(), "ignoring fault: {}", fault);
                return None;
            }
            WorkerState::Unresponsive => {}
            _ => {
                binding.transition(WorkerState::Unresponsive);
            }
        }

        if matches!(fault, WorkerError::Protocol(_)) {
            metrics::counter!("argus_protocol_errors").increment(1);
        }
        warn!(pid = ?binding.pid, epoch = binding.epoch, "worker unresponsive: {}", fault);

        Some(self.restart(binding).await)
    }

    /// Tear the current process down and schedule a respawn with backoff
    pub async fn restart(&mut self, binding: &mut WorkerBinding) -> RestartOutcome {
        if let Some(worker) = self.worker.take() {
            worker.channel.close().await;
            let termination = worker
                .process
                .shutdown(self.settings.stop_grace(), true)
                .await;
            debug!(binding = %binding.key, ?termination, "previous worker gone");
        }
        self.ready_deadline = None;
        binding.pid = None;

        let now = Instant::now();
        match self.restarts.record(now) {
            Some(delay) => {
                binding.restart_count += 1;
                self.respawn_at = Some(now + delay);
                metrics::counter!("argus_worker_restarts").increment(1);
                info!(
                    binding = %binding.key,
                    restarts = binding.restart_count,
                    ?delay,
                    "worker restart scheduled"
                );
                RestartOutcome::Scheduled(delay)
            }
            None => {
                binding.transition(WorkerState::Crashed);
                self.respawn_at = None;
                error!(
                    binding = %binding.key,
                    restarts = binding.restart_count,
                    "restart limit reached, worker marked crashed"
                );
                RestartOutcome::Exhausted
            }
        }
    }

    /// Stop the worker for good: `STOP`, wait for the grace period, kill
    #[instrument(skip_all, fields(binding = %binding.key))]
    pub async fn terminate(&mut self, binding: &mut WorkerBinding) -> Option<Termination> {
        self.respawn_at = None;
        self.ready_deadline = None;

        if matches!(binding.state(), WorkerState::Crashed | WorkerState::Stopped)
            || !binding.transition(WorkerState::Terminating)
        {
            return None;
        }

        let termination = match self.worker.take() {
            Some(mut worker) => {
                if let Err(e) = worker.channel.send(&HostMessage::Stop).await {
                    debug!("STOP not delivered: {}", e);
                }
                worker.channel.close().await;
                Some(
                    worker
                        .process
                        .shutdown(self.settings.stop_grace(), false)
                        .await,
                )
            }
            None => None,
        };

        binding.pid = None;
        binding.transition(WorkerState::Stopped);
        info!(?termination, "worker stopped");
        termination
    }
}
