//! Collaborator stores consumed by the pipeline queue.
//!
//! All three are keyed by the original upload key (`/uploads/<file>`).

mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStores;

use async_trait::async_trait;

use crate::Result;

/// Maps an original upload key to the location of its upscaled artifact.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    async fn get_artifact(&self, key: &str) -> Result<Option<String>>;
    async fn set_artifact(&self, key: &str, path: &str) -> Result<()>;
}

/// Free-text processing status per upload (`Upscaled`, `Printify URL: ...`).
#[async_trait]
pub trait StatusStore: Send + Sync {
    async fn get_status(&self, key: &str) -> Result<Option<String>>;
    async fn set_status(&self, key: &str, status: &str) -> Result<()>;
}

/// Resolves the external record id used in convention-based filenames.
#[async_trait]
pub trait ExternalIdLookup: Send + Sync {
    async fn external_id(&self, key: &str) -> Result<Option<String>>;
}
