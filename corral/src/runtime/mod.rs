/// Builder assembling a supervisor and its queue.
pub mod builder;
#[cfg(unix)]
/// Signal-to-intent mapping for a supervisor running as a daemon.
pub mod signals;
/// Control loop owning the worker pool.
pub mod supervisor;
/// Single-job-at-a-time workers and their shared state.
pub mod worker;

pub use builder::SupervisorBuilder;
#[cfg(unix)]
pub use signals::spawn_signal_listener;
pub use supervisor::{
    ControlIntent, ScaleRequest, ShutdownToken, Supervisor, SupervisorConfig, SupervisorHandle,
    SupervisorStatus,
};
pub use worker::{Worker, WorkerConfig, WorkerExit, WorkerShared, WorkerSnapshot, WorkerState};
