use async_trait::async_trait;
use dashmap::DashMap;

use super::{ArtifactStore, ExternalIdLookup, StatusStore};
use crate::Result;

/// In-memory key/value store usable in any collaborator role.
///
/// Use one instance per role; they all share the same key space otherwise.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: DashMap<String, String>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, key: impl Into<String>, value: impl Into<String>) {
        self.entries.insert(key.into(), value.into());
    }

    pub fn value(&self, key: &str) -> Option<String> {
        self.entries.get(key).map(|v| v.clone())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl ArtifactStore for MemoryStore {
    async fn get_artifact(&self, key: &str) -> Result<Option<String>> {
        Ok(self.value(key))
    }

    async fn set_artifact(&self, key: &str, path: &str) -> Result<()> {
        self.insert(key, path);
        Ok(())
    }
}

#[async_trait]
impl StatusStore for MemoryStore {
    async fn get_status(&self, key: &str) -> Result<Option<String>> {
        Ok(self.value(key))
    }

    async fn set_status(&self, key: &str, status: &str) -> Result<()> {
        self.insert(key, status);
        Ok(())
    }
}

#[async_trait]
impl ExternalIdLookup for MemoryStore {
    async fn external_id(&self, key: &str) -> Result<Option<String>> {
        Ok(self.value(key))
    }
}
