//! Starting analysis workers, either as OS processes or in-process tasks

use std::future::Future;
use std::io;
use std::path::PathBuf;
use std::pin::Pin;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::io::{
    split, AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, DuplexStream, Lines,
    ReadHalf, WriteHalf,
};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::protocol::{truncate, HostMessage, WorkerMessage, PROTOCOL_VERSION};
use crate::ids::{CameraId, PluginId};

/// Everything needed to start one worker for one binding
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub camera: CameraId,
    pub plugin: PluginId,
    pub tier: u32,
    pub command: PathBuf,
    pub args: Vec<String>,
}

/// A freshly started worker: its command input, result output and handle
pub struct WorkerLink {
    pub input: Box<dyn AsyncWrite + Send + Unpin>,
    pub output: Box<dyn AsyncRead + Send + Unpin>,
    pub process: WorkerProcess,
}

pub enum WorkerProcess {
    Os(Child),
    Task(JoinHandle<()>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    Graceful,
    Forced,
}

pub trait Launcher: Send + Sync {
    fn launch(&self, spec: &LaunchSpec) -> io::Result<WorkerLink>;
}

impl WorkerProcess {
    pub fn id(&self) -> Option<u32> {
        match self {
            WorkerProcess::Os(child) => child.id(),
            WorkerProcess::Task(_) => None,
        }
    }

    /// Describe how the worker ended, if it already has
    pub fn exit_status(&mut self) -> Option<String> {
        match self {
            WorkerProcess::Os(child) => match child.try_wait() {
                Ok(Some(status)) => Some(status.to_string()),
                Ok(None) => None,
                Err(e) => Some(format!("wait failed: {e}")),
            },
            WorkerProcess::Task(handle) => handle
                .is_finished()
                .then(|| "worker task finished".to_owned()),
        }
    }

    fn signal_terminate(&self) {
        if let Some(pid) = self.id() {
            if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                debug!(pid, "SIGTERM failed: {}", e);
            }
        }
    }

    /// Wait up to `grace` for the worker to exit, then kill it.
    /// With `signal` set the worker is sent SIGTERM first.
    pub async fn shutdown(self, grace: Duration, signal: bool) -> Termination {
        if signal {
            self.signal_terminate();
        }

        match self {
            WorkerProcess::Os(mut child) => {
                match tokio::time::timeout(grace, child.wait()).await {
                    Ok(_) => Termination::Graceful,
                    Err(_) => {
                        if let Err(e) = child.kill().await {
                            warn!("failed to kill worker process: {}", e);
                        }
                        Termination::Forced
                    }
                }
            }
            WorkerProcess::Task(mut handle) => {
                match tokio::time::timeout(grace, &mut handle).await {
                    Ok(_) => Termination::Graceful,
                    Err(_) => {
                        handle.abort();
                        Termination::Forced
                    }
                }
            }
        }
    }
}

/// Runs each worker as a child process talking over stdin/stdout
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessLauncher;

impl Launcher for ProcessLauncher {
    fn launch(&self, spec: &LaunchSpec) -> io::Result<WorkerLink> {
        let mut child = Command::new(&spec.command)
            .args(&spec.args)
            .env("ARGUS_CAMERA_ID", spec.camera.as_str())
            .env("ARGUS_PLUGIN_ID", spec.plugin.as_str())
            .env("ARGUS_STREAM_TIER", spec.tier.to_string())
            .env("ARGUS_PROTOCOL_VERSION", PROTOCOL_VERSION.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()?;

        let input = child
            .stdin
            .take()
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "worker stdin unavailable"))?;
        let output = child
            .stdout
            .take()
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "worker stdout unavailable"))?;

        Ok(WorkerLink {
            input: Box::new(input),
            output: Box::new(output),
            process: WorkerProcess::Os(child),
        })
    }
}

pub type WorkerFuture = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

type WorkerBody = dyn Fn(LaunchSpec, WorkerIo) -> WorkerFuture + Send + Sync;

/// Runs workers as Tokio tasks over in-memory pipes.
///
/// The task speaks exactly the same line protocol as an external process,
/// so embedders can host lightweight Rust analyzers without a fork.
#[derive(Clone)]
pub struct InProcessLauncher {
    body: Arc<WorkerBody>,
}

/// The worker's end of an in-process link
pub struct WorkerIo {
    lines: Lines<BufReader<ReadHalf<DuplexStream>>>,
    writer: WriteHalf<DuplexStream>,
}

const IN_PROCESS_BUFFER: usize = 256 * 1024;

impl InProcessLauncher {
    pub fn new<F, Fut>(body: F) -> Self
    where
        F: Fn(LaunchSpec, WorkerIo) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Self {
            body: Arc::new(move |spec, io| Box::pin(body(spec, io)) as WorkerFuture),
        }
    }
}

impl Launcher for InProcessLauncher {
    fn launch(&self, spec: &LaunchSpec) -> io::Result<WorkerLink> {
        let (host, worker) = tokio::io::duplex(IN_PROCESS_BUFFER);
        let (host_read, host_write) = split(host);
        let (worker_read, worker_write) = split(worker);

        let io = WorkerIo {
            lines: BufReader::new(worker_read).lines(),
            writer: worker_write,
        };
        let task = tokio::spawn((self.body)(spec.clone(), io));

        Ok(WorkerLink {
            input: Box::new(host_write),
            output: Box::new(host_read),
            process: WorkerProcess::Task(task),
        })
    }
}

impl WorkerIo {
    /// Next well-formed command from the host; `None` once the host hangs up
    pub async fn recv(&mut self) -> Option<HostMessage> {
        loop {
            match self.lines.next_line().await {
                Ok(Some(line)) => match line.parse() {
                    Ok(message) => return Some(message),
                    Err(e) => warn!(line = %truncate(&line), "ignoring malformed host line: {}", e),
                },
                Ok(None) | Err(_) => return None,
            }
        }
    }

    pub async fn send(&mut self, message: &WorkerMessage) -> io::Result<()> {
        self.send_line(&message.to_string()).await
    }

    /// Write an arbitrary line, well-formed or not
    pub async fn send_line(&mut self, line: &str) -> io::Result<()> {
        self.send_raw(line.as_bytes()).await
    }

    /// Write raw bytes followed by a newline
    pub async fn send_raw(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.writer.write_all(bytes).await?;
        self.writer.write_all(b"\n").await?;
        self.writer.flush().await
    }
}
