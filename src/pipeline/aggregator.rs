//! Merges results from every binding and forwards them to the display layer

use std::collections::HashMap;
use std::sync::Arc;

use flume::{Receiver, Sender};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::detection::DetectionResult;
use crate::display::DisplaySink;
use crate::ids::{BindingKey, CameraId, PluginId};

#[derive(Debug, Clone, PartialEq)]
pub enum AggregatorEvent {
    Detection {
        binding: BindingKey,
        result: DetectionResult,
    },
    /// Permanent failure of one plugin on one camera
    Failure {
        camera: CameraId,
        plugin: PluginId,
        reason: String,
    },
    /// The binding was removed; a later binding with the same key starts
    /// its sequence afresh
    Reset { binding: BindingKey },
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct AggregatorStats {
    pub published: u64,
    pub out_of_order: u64,
    pub failures: u64,
}

pub struct ResultAggregator {
    display: Arc<dyn DisplaySink>,
    latest: HashMap<BindingKey, u64>,
    stats: AggregatorStats,
}

impl ResultAggregator {
    pub fn new(display: Arc<dyn DisplaySink>) -> Self {
        Self {
            display,
            latest: HashMap::new(),
            stats: AggregatorStats::default(),
        }
    }

    /// Start the aggregator task. It runs until every sender is dropped.
    pub fn spawn(display: Arc<dyn DisplaySink>) -> (Sender<AggregatorEvent>, JoinHandle<AggregatorStats>) {
        let (tx, rx) = flume::unbounded();
        let task = tokio::spawn(Self::new(display).run(rx));
        (tx, task)
    }

    pub async fn run(mut self, events: Receiver<AggregatorEvent>) -> AggregatorStats {
        while let Ok(event) = events.recv_async().await {
            self.handle(event);
        }

        info!(
            published = self.stats.published,
            out_of_order = self.stats.out_of_order,
            failures = self.stats.failures,
            "result aggregator finished"
        );
        self.stats
    }

    /// Returns whether the event reached the display
    pub fn handle(&mut self, event: AggregatorEvent) -> bool {
        match event {
            AggregatorEvent::Detection { binding, result } => {
                let last = self.latest.get(&binding).copied().unwrap_or(0);
                if result.sequence <= last {
                    debug!(
                        %binding,
                        sequence = result.sequence,
                        last,
                        "dropping out-of-order result"
                    );
                    self.stats.out_of_order += 1;
                    return false;
                }

                self.latest.insert(binding.clone(), result.sequence);
                self.display.publish_detection(&binding.camera, result);
                self.stats.published += 1;
                true
            }
            AggregatorEvent::Failure {
                camera,
                plugin,
                reason,
            } => {
                self.display.publish_failure(&camera, &plugin, &reason);
                self.stats.failures += 1;
                true
            }
            AggregatorEvent::Reset { binding } => {
                self.latest.remove(&binding);
                false
            }
        }
    }

    pub fn stats(&self) -> AggregatorStats {
        self.stats
    }
}
