//! `aegis-kernel` – Supervision
//!
//! The gateway's brainstem. It does not process samples; it keeps the
//! long-running loops that do accountable.
//!
//! # Modules
//!
//! - [`task_supervisor`] – [`TaskSupervisor`][task_supervisor::TaskSupervisor]:
//!   tracks named tasks, enforces one live task per name, deregisters tasks
//!   as they finish, and cancels and joins everything on shutdown.

pub mod task_supervisor;

pub use task_supervisor::{TaskHandle, TaskOutcome, TaskState, TaskSupervisor};
pub use tokio_util::sync::CancellationToken;
