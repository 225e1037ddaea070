pub mod aggregator;
pub mod dispatch;
pub mod orchestrator;
pub mod supervisor;

pub use aggregator::{AggregatorEvent, AggregatorStats, ResultAggregator};
pub use dispatch::{DispatchOutcome, Dispatcher};
pub use orchestrator::Orchestrator;
pub use supervisor::{Supervisor, SupervisorCommand, SupervisorHandle};
