//! Error taxonomy for the orchestration core

use std::io;
use std::time::Duration;

use thiserror::Error;

use crate::ids::{BindingKey, PluginId, StreamKey};

#[derive(Debug, Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("unknown plugin `{0}`")]
    UnknownPlugin(PluginId),

    #[error("binding {0} already exists")]
    DuplicateBinding(BindingKey),

    #[error("plugin `{plugin}` allows at most {max} instances")]
    InstanceLimit { plugin: PluginId, max: usize },

    #[error("no binding {0}")]
    UnknownBinding(BindingKey),

    #[error("stream {0} already has a publisher")]
    StreamAlreadyPublished(StreamKey),

    #[error("orchestrator is shutting down")]
    ShuttingDown,

    #[error(transparent)]
    Worker(#[from] WorkerError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Failures on the analysis path. All of these are recovered by the
/// supervisor; none of them reach the video path.
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("failed to spawn worker: {0}")]
    SpawnFailure(#[source] io::Error),

    #[error("worker did not respond within {0:?}")]
    Timeout(Duration),

    #[error("worker exited unexpectedly: {0}")]
    Crash(String),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("result for sequence {0} is not outstanding")]
    StaleResult(u64),

    #[error("frame slot was overwritten during read")]
    FrameRace,

    #[error("worker channel failed: {0}")]
    Channel(#[source] io::Error),
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ProtocolError {
    #[error("empty line")]
    Empty,

    #[error("unknown message `{0}`")]
    UnknownMessage(String),

    #[error("missing field `{0}`")]
    MissingField(&'static str),

    #[error("invalid {field}: `{value}`")]
    InvalidField { field: &'static str, value: String },

    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(u32),
}

impl ProtocolError {
    pub(crate) fn invalid(field: &'static str, value: impl Into<String>) -> Self {
        Self::InvalidField {
            field,
            value: value.into(),
        }
    }
}
