//! One task per binding: dispatch ticks, health checks, worker output and
//! control commands all funnel through a single `select!` loop, so the
//! binding itself needs no locking.

use std::time::Duration;

use flume::{Receiver, Sender};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, instrument, trace, warn};

use super::aggregator::AggregatorEvent;
use super::dispatch::Dispatcher;
use crate::detection::DetectionResult;
use crate::error::{Error, WorkerError};
use crate::worker::binding::{BindingSnapshot, WorkerBinding, WorkerState};
use crate::worker::channel::{LinkEvent, LinkEventKind};
use crate::worker::manager::{ProcessManager, RestartOutcome};
use crate::worker::protocol::{truncate, HostMessage, WorkerMessage};
use crate::PipelineConfig;

pub enum SupervisorCommand {
    SetParameter {
        key: String,
        value: String,
        reply: oneshot::Sender<Result<(), Error>>,
    },
    Stop,
}

pub struct Supervisor {
    binding: WorkerBinding,
    manager: ProcessManager,
    dispatcher: Dispatcher,
    events: Receiver<LinkEvent>,
    commands: Receiver<SupervisorCommand>,
    aggregator: Sender<AggregatorEvent>,
    status: watch::Sender<BindingSnapshot>,
    dispatch_tick: Duration,
    health_interval: Duration,
}

/// Control side of a running supervisor task
pub struct SupervisorHandle {
    commands: Sender<SupervisorCommand>,
    status: watch::Receiver<BindingSnapshot>,
    task: JoinHandle<BindingSnapshot>,
}

impl Supervisor {
    /// Start supervising `binding`. The worker is spawned from inside the task.
    pub fn spawn(
        binding: WorkerBinding,
        manager: ProcessManager,
        dispatcher: Dispatcher,
        events: Receiver<LinkEvent>,
        aggregator: Sender<AggregatorEvent>,
        pipeline: &PipelineConfig,
    ) -> SupervisorHandle {
        let (commands_tx, commands_rx) = flume::bounded(16);
        let (status_tx, status_rx) = watch::channel(binding.snapshot());

        let supervisor = Supervisor {
            binding,
            manager,
            dispatcher,
            events,
            commands: commands_rx,
            aggregator,
            status: status_tx,
            dispatch_tick: pipeline.dispatch_tick(),
            health_interval: pipeline.health_check_interval(),
        };

        SupervisorHandle {
            commands: commands_tx,
            status: status_rx,
            task: tokio::spawn(supervisor.run()),
        }
    }

    #[instrument(name = "supervisor", skip_all, fields(binding = %self.binding.key))]
    async fn run(mut self) -> BindingSnapshot {
        if let Err(e) = self.manager.spawn(&mut self.binding).await {
            self.fault(e).await;
        }
        self.publish_status();

        let mut dispatch = interval(self.dispatch_tick);
        dispatch.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut health = interval(self.health_interval);
        health.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                command = self.commands.recv_async() => match command {
                    Ok(SupervisorCommand::SetParameter { key, value, reply }) => {
                        let result = self.set_parameter(key, value).await;
                        let _ = reply.send(result);
                    }
                    Ok(SupervisorCommand::Stop) | Err(_) => break,
                },
                Ok(event) = self.events.recv_async() => self.on_link_event(event).await,
                _ = health.tick() => self.on_health_tick().await,
                _ = dispatch.tick() => self.on_dispatch_tick().await,
            }

            self.publish_status();
        }

        self.manager.terminate(&mut self.binding).await;
        self.publish_status();
        self.binding.snapshot()
    }

    fn publish_status(&self) {
        self.status.send_replace(self.binding.snapshot());
    }

    async fn fault(&mut self, fault: WorkerError) {
        let reason = fault.to_string();
        let outcome = self.manager.handle_fault(&mut self.binding, fault).await;
        if outcome == Some(RestartOutcome::Exhausted) {
            let _ = self.aggregator.send(AggregatorEvent::Failure {
                camera: self.binding.key.camera.clone(),
                plugin: self.binding.key.plugin.clone(),
                reason: format!(
                    "gave up after {} restarts: {}",
                    self.binding.restart_count, reason
                ),
            });
        }
    }

    async fn on_dispatch_tick(&mut self) {
        if let Err(e) = self.manager.poll_respawn(&mut self.binding, Instant::now()).await {
            self.fault(e).await;
            return;
        }

        let Some(channel) = self.manager.channel_mut() else {
            return;
        };
        let outcome = self.dispatcher.tick(&mut self.binding, channel).await;
        match outcome {
            Ok(outcome) => trace!(?outcome, "dispatch tick"),
            Err(e) => self.fault(e).await,
        }
    }

    async fn on_health_tick(&mut self) {
        let now = Instant::now();
        if let Err(e) = self.manager.poll_respawn(&mut self.binding, now).await {
            self.fault(e).await;
            return;
        }
        if let Err(e) = self.manager.health_check(&self.binding, now) {
            self.fault(e).await;
        }
    }

    async fn on_link_event(&mut self, event: LinkEvent) {
        if event.epoch != self.binding.epoch || !self.binding.state().is_live() {
            debug!(epoch = event.epoch, "discarding output of a previous worker process");
            return;
        }

        let line = match event.kind {
            LinkEventKind::Line(line) => line,
            LinkEventKind::Malformed(reason) => {
                metrics::counter!("argus_protocol_errors").increment(1);
                warn!("discarding unreadable worker line: {}", reason);
                return;
            }
            LinkEventKind::Closed => {
                self.fault(WorkerError::Crash("worker closed its output".into()))
                    .await;
                return;
            }
        };

        let message = match line.parse::<WorkerMessage>() {
            Ok(message) => message,
            Err(e) => {
                metrics::counter!("argus_protocol_errors").increment(1);
                warn!(line = %truncate(&line), "discarding malformed worker line: {}", e);
                return;
            }
        };

        let now = Instant::now();
        match message {
            WorkerMessage::Ready { version } => {
                self.binding.touch(now);
                if let Err(e) = self.manager.on_ready(&mut self.binding, version) {
                    self.fault(e).await;
                }
            }
            WorkerMessage::Result {
                sequence,
                timestamp_ms,
                objects,
            } => match self.dispatcher.acknowledge(&mut self.binding, sequence) {
                Ok(flight) => {
                    self.binding.touch(now);
                    let latency = now.duration_since(flight.sent_at);
                    metrics::histogram!("argus_analysis_latency_ms")
                        .record(latency.as_secs_f64() * 1_000.0);

                    let result = DetectionResult {
                        plugin: self.binding.key.plugin.clone(),
                        sequence,
                        timestamp_ms,
                        objects,
                    };
                    let _ = self.aggregator.send(AggregatorEvent::Detection {
                        binding: self.binding.key.clone(),
                        result,
                    });
                }
                Err(e) => debug!("discarding result: {}", e),
            },
            WorkerMessage::Error(reason) => {
                self.binding.touch(now);
                match self.dispatcher.abandon(&mut self.binding) {
                    Some(flight) => warn!(
                        sequence = flight.sequence,
                        "worker failed to analyse frame: {}", reason
                    ),
                    None => warn!("worker reported an error: {}", reason),
                }
            }
        }
    }

    async fn set_parameter(&mut self, key: String, value: String) -> Result<(), Error> {
        let state = self.binding.state();
        if !state.is_live() {
            return Err(WorkerError::Crash(format!("worker is {state}")).into());
        }
        self.manager
            .send(&HostMessage::Set { key, value })
            .await
            .map_err(Error::from)
    }
}

impl SupervisorHandle {
    pub fn status(&self) -> BindingSnapshot {
        self.status.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<BindingSnapshot> {
        self.status.clone()
    }

    pub async fn set_parameter(&self, key: String, value: String) -> Result<(), Error> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send_async(SupervisorCommand::SetParameter { key, value, reply })
            .await
            .map_err(|_| Error::ShuttingDown)?;
        response.await.map_err(|_| Error::ShuttingDown)?
    }

    /// Terminate the worker and wait for the supervisor to finish
    pub async fn stop(self) -> BindingSnapshot {
        let _ = self.commands.send_async(SupervisorCommand::Stop).await;
        match self.task.await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!("supervisor task failed: {}", e);
                let mut snapshot = self.status.borrow().clone();
                snapshot.state = WorkerState::Stopped;
                snapshot
            }
        }
    }
}
