//! Supervisor for external programs.
//!
//! A [`JobRunner`] spawns one program per [`ProcessJob`], merges its stdout and
//! stderr into an append-only log, publishes output chunks and completion
//! through [`Subject`]s, and escalates termination requests (graceful signal,
//! kill, forced completion) so an unresponsive program cannot wedge its owner.

mod job;
mod runner;
mod subject;

pub use job::{ProcessJob, ProcessJobSummary, ProcessStatus};
pub use runner::{JobRunner, RunnerConfig, SpawnOptions};
pub use subject::{Listener, Subject, SubscriptionId};
