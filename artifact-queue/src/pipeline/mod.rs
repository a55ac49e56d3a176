//! Pipeline queue: sequencing of stage scripts over uploaded files.

pub mod job;
pub mod queue;
pub mod repository;
pub mod resolve;

pub use job::{PipelineJob, PipelineStatus, Stage, Variant};
pub use queue::{EnqueueRequest, PipelineQueue, QueueConfig, QueueStores, StageScripts};
pub use repository::{BacklogRepository, JsonFileBacklog, MemoryBacklog, SqliteBacklog};
pub use resolve::InputResolver;
