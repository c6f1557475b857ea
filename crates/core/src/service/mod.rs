pub mod host;
pub mod process;
pub mod shutdown;
pub mod state;
pub mod supervisor;
pub mod worker;

pub use host::{HostService, KeepAlive, LogKeepAlive};
pub use process::ProcessWorker;
pub use shutdown::ShutdownGuard;
pub use state::{StateHandle, StatePublisher};
pub use supervisor::{StartOutcome, Supervisor};
pub use worker::{EmbeddedWorker, ThreadWorker, WorkerError, WorkerParams, WorkerRun};
