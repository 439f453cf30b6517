//! Cooperative thread scheduler.
//!
//! Each task gets its own OS thread named `kyromesh-task-{name}` and a
//! [`TaskControl`] token. Pause, resume, terminate and rate changes are
//! requests the task loop observes between invocations.

mod task;
mod threader;
mod worker;

pub use task::{Task, TaskControl, TaskState};
pub use threader::Threader;
