//! Binding registry: wires frame streams, plugins and supervisors together

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use flume::Sender;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tracing::{info, instrument, warn};

use super::aggregator::{AggregatorEvent, AggregatorStats, ResultAggregator};
use super::dispatch::Dispatcher;
use super::supervisor::{Supervisor, SupervisorHandle};
use crate::capture::FrameSource;
use crate::display::DisplaySink;
use crate::error::{Error, ProtocolError, WorkerError};
use crate::ids::{BindingKey, CameraId, PluginId, StreamKey};
use crate::worker::binding::{BindingSnapshot, WorkerBinding, WorkerState};
use crate::worker::launcher::{LaunchSpec, Launcher};
use crate::worker::manager::ProcessManager;
use crate::worker::shm::PayloadEncoder;
use crate::{Config, PluginConfig};

/// Owns every worker binding. Must be created inside a Tokio runtime.
pub struct Orchestrator {
    config: Config,
    plugins: HashMap<PluginId, PluginConfig>,
    source: Arc<dyn FrameSource>,
    launcher: Arc<dyn Launcher>,
    permits: Option<Arc<Semaphore>>,
    aggregator: Option<Sender<AggregatorEvent>>,
    aggregator_task: Option<JoinHandle<AggregatorStats>>,
    bindings: BTreeMap<BindingKey, SupervisorHandle>,
}

impl Orchestrator {
    pub fn new(
        config: Config,
        source: Arc<dyn FrameSource>,
        launcher: Arc<dyn Launcher>,
        display: Arc<dyn DisplaySink>,
    ) -> Result<Self, Error> {
        config.validate()?;

        let plugins = config
            .plugins
            .iter()
            .map(|p| (PluginId::from(p.id.as_str()), p.clone()))
            .collect();
        let permits = config
            .pipeline
            .max_in_flight_total
            .map(|total| Arc::new(Semaphore::new(total)));
        let (aggregator, aggregator_task) = ResultAggregator::spawn(display);

        Ok(Self {
            config,
            plugins,
            source,
            launcher,
            permits,
            aggregator: Some(aggregator),
            aggregator_task: Some(aggregator_task),
            bindings: BTreeMap::new(),
        })
    }

    /// Bind every plugin listed under each configured camera
    pub fn start(&mut self) -> Result<(), Error> {
        let cameras = self.config.cameras.clone();
        for camera in &cameras {
            for plugin in &camera.plugins {
                self.bind(camera.stream(), &PluginId::from(plugin.as_str()))?;
            }
        }
        info!(bindings = self.bindings.len(), "orchestrator started");
        Ok(())
    }

    /// Start analysing `stream` with `plugin`
    #[instrument(skip_all, fields(stream = %stream, plugin = %plugin))]
    pub fn bind(&mut self, stream: StreamKey, plugin: &PluginId) -> Result<(), Error> {
        let aggregator = self.aggregator.clone().ok_or(Error::ShuttingDown)?;
        let plugin_config = self
            .plugins
            .get(plugin)
            .ok_or_else(|| Error::UnknownPlugin(plugin.clone()))?;

        let key = BindingKey::for_stream(stream, plugin.clone());
        if self.bindings.contains_key(&key) {
            return Err(Error::DuplicateBinding(key));
        }
        if let Some(max) = plugin_config.max_instances {
            // Crashed bindings hold no process and never respawn.
            let running = self
                .bindings
                .iter()
                .filter(|(k, handle)| {
                    &k.plugin == plugin && handle.status().state != WorkerState::Crashed
                })
                .count();
            if running >= max {
                return Err(Error::InstanceLimit {
                    plugin: plugin.clone(),
                    max,
                });
            }
        }

        let spec = LaunchSpec {
            camera: key.camera.clone(),
            plugin: plugin.clone(),
            tier: key.tier,
            command: plugin_config.command.clone(),
            args: plugin_config.args.clone(),
        };
        let (events_tx, events_rx) = flume::unbounded();
        let manager = ProcessManager::new(
            Arc::clone(&self.launcher),
            spec,
            self.config.supervision.clone(),
            events_tx,
        );
        let dispatcher = Dispatcher::new(
            Arc::clone(&self.source),
            PayloadEncoder::for_binding(&self.config.transport, &key),
            self.permits.clone(),
        );

        let handle = Supervisor::spawn(
            WorkerBinding::new(key.clone()),
            manager,
            dispatcher,
            events_rx,
            aggregator,
            &self.config.pipeline,
        );
        self.bindings.insert(key, handle);
        info!("binding created");
        Ok(())
    }

    /// Stop one binding and return its final state
    pub async fn unbind(&mut self, key: &BindingKey) -> Result<BindingSnapshot, Error> {
        let handle = self
            .bindings
            .remove(key)
            .ok_or_else(|| Error::UnknownBinding(key.clone()))?;
        let snapshot = handle.stop().await;
        self.forget(key.clone());
        Ok(snapshot)
    }

    /// Stop every binding of `camera`
    pub async fn remove_camera(&mut self, camera: &CameraId) -> Vec<BindingSnapshot> {
        let keys: Vec<BindingKey> = self
            .bindings
            .keys()
            .filter(|k| &k.camera == camera)
            .cloned()
            .collect();

        let handles = keys
            .iter()
            .filter_map(|k| self.bindings.remove(k))
            .collect();
        let stopped = stop_all(handles).await;
        for key in keys {
            self.forget(key);
        }
        info!(%camera, bindings = stopped.len(), "camera removed");
        stopped
    }

    /// Drop the aggregator's freshness record once a binding's supervisor
    /// has finished, so a replacement stream may restart its sequence.
    fn forget(&self, binding: BindingKey) {
        if let Some(aggregator) = &self.aggregator {
            let _ = aggregator.send(AggregatorEvent::Reset { binding });
        }
    }

    /// Forward a runtime parameter to a live worker as `SET <key> <value>`
    pub async fn set_parameter(
        &self,
        binding: &BindingKey,
        key: &str,
        value: &str,
    ) -> Result<(), Error> {
        if key.is_empty() || key.contains(char::is_whitespace) {
            return Err(WorkerError::from(ProtocolError::invalid("parameter key", key)).into());
        }
        if value.contains(['\n', '\r']) {
            return Err(WorkerError::from(ProtocolError::invalid("parameter value", value)).into());
        }

        let handle = self
            .bindings
            .get(binding)
            .ok_or_else(|| Error::UnknownBinding(binding.clone()))?;
        handle.set_parameter(key.to_owned(), value.to_owned()).await
    }

    pub fn status(&self) -> Vec<BindingSnapshot> {
        self.bindings.values().map(SupervisorHandle::status).collect()
    }

    pub fn snapshot(&self, binding: &BindingKey) -> Option<BindingSnapshot> {
        self.bindings.get(binding).map(SupervisorHandle::status)
    }

    /// Live view of a binding's state
    pub fn watch(&self, binding: &BindingKey) -> Option<watch::Receiver<BindingSnapshot>> {
        self.bindings.get(binding).map(SupervisorHandle::watch)
    }

    /// Stop all workers, drain the aggregator and report what it published
    pub async fn shutdown(mut self) -> AggregatorStats {
        info!(bindings = self.bindings.len(), "shutting down");
        let handles = std::mem::take(&mut self.bindings).into_values().collect();
        stop_all(handles).await;

        self.aggregator = None;
        match self.aggregator_task.take() {
            Some(task) => task.await.unwrap_or_else(|e| {
                warn!("result aggregator failed: {}", e);
                AggregatorStats::default()
            }),
            None => AggregatorStats::default(),
        }
    }
}

async fn stop_all(handles: Vec<SupervisorHandle>) -> Vec<BindingSnapshot> {
    let tasks: Vec<_> = handles
        .into_iter()
        .map(|handle| tokio::spawn(handle.stop()))
        .collect();

    let mut stopped = Vec::with_capacity(tasks.len());
    for task in tasks {
        match task.await {
            Ok(snapshot) => stopped.push(snapshot),
            Err(e) => warn!("failed to stop binding: {}", e),
        }
    }
    stopped
}
