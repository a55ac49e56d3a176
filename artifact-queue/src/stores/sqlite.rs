use async_trait::async_trait;
use chrono::Utc;
use sqlx::SqlitePool;

use super::{ArtifactStore, ExternalIdLookup, StatusStore};
use crate::Result;

/// SQLx implementation of the collaborator stores.
#[derive(Debug, Clone)]
pub struct SqliteStores {
    pool: SqlitePool,
}

impl SqliteStores {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Register the external record id for an upload.
    pub async fn set_external_id(&self, key: &str, record_id: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO image_records (original_url, record_id) VALUES (?, ?)
            ON CONFLICT(original_url) DO UPDATE SET record_id = excluded.record_id
            "#,
        )
        .bind(key)
        .bind(record_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl ArtifactStore for SqliteStores {
    async fn get_artifact(&self, key: &str) -> Result<Option<String>> {
        let path = sqlx::query_scalar::<_, String>(
            "SELECT upscaled_path FROM upscaled_images WHERE original_url = ?",
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;
        Ok(path)
    }

    async fn set_artifact(&self, key: &str, path: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO upscaled_images (original_url, upscaled_path, updated_at) VALUES (?, ?, ?)
            ON CONFLICT(original_url) DO UPDATE SET
                upscaled_path = excluded.upscaled_path,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(key)
        .bind(path)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl StatusStore for SqliteStores {
    async fn get_status(&self, key: &str) -> Result<Option<String>> {
        let status =
            sqlx::query_scalar::<_, String>("SELECT status FROM image_status WHERE original_url = ?")
                .bind(key)
                .fetch_optional(&self.pool)
                .await?;
        Ok(status)
    }

    async fn set_status(&self, key: &str, status: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO image_status (original_url, status, updated_at) VALUES (?, ?, ?)
            ON CONFLICT(original_url) DO UPDATE SET
                status = excluded.status,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(key)
        .bind(status)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl ExternalIdLookup for SqliteStores {
    async fn external_id(&self, key: &str) -> Result<Option<String>> {
        let id = sqlx::query_scalar::<_, String>(
            "SELECT record_id FROM image_records WHERE original_url = ?",
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;
        Ok(id)
    }
}
