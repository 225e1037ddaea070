pub mod binding;
pub mod channel;
pub mod launcher;
pub mod manager;
pub mod protocol;
pub mod shm;

pub use binding::{BindingSnapshot, WorkerBinding, WorkerState};
pub use channel::{LinkEvent, LinkEventKind, ResultChannel};
pub use launcher::{InProcessLauncher, LaunchSpec, Launcher, ProcessLauncher, WorkerIo};
pub use manager::{ProcessManager, RestartOutcome};
pub use protocol::{HostMessage, WorkerMessage, PROTOCOL_VERSION};
pub use shm::{read_payload, PayloadEncoder};
