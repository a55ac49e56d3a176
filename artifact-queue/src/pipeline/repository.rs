//! Backlog persistence.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use std::path::{Path, PathBuf};
use tracing::warn;

use super::job::{PipelineJob, PipelineStatus, Stage, Variant};
use crate::Result;

/// Durable storage for the ordered backlog.
///
/// `save` replaces the whole list; implementations must preserve order.
#[async_trait]
pub trait BacklogRepository: Send + Sync {
    async fn load(&self) -> Result<Vec<PipelineJob>>;
    async fn save(&self, jobs: &[PipelineJob]) -> Result<()>;
}

/// Non-durable backlog, for tests and embedding.
#[derive(Debug, Default)]
pub struct MemoryBacklog {
    jobs: Mutex<Vec<PipelineJob>>,
    saves: Mutex<usize>,
}

impl MemoryBacklog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the backlog as if it had been persisted by an earlier run.
    pub fn with_jobs(jobs: Vec<PipelineJob>) -> Self {
        Self {
            jobs: Mutex::new(jobs),
            saves: Mutex::new(0),
        }
    }

    /// The last saved list.
    pub fn snapshot(&self) -> Vec<PipelineJob> {
        self.jobs.lock().clone()
    }

    pub fn save_count(&self) -> usize {
        *self.saves.lock()
    }
}

#[async_trait]
impl BacklogRepository for MemoryBacklog {
    async fn load(&self) -> Result<Vec<PipelineJob>> {
        Ok(self.snapshot())
    }

    async fn save(&self, jobs: &[PipelineJob]) -> Result<()> {
        *self.jobs.lock() = jobs.to_vec();
        *self.saves.lock() += 1;
        Ok(())
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct BacklogDocument {
    #[serde(default)]
    jobs: Vec<PipelineJob>,
}

/// Backlog stored as `{ "jobs": [...] }` in a single JSON file.
#[derive(Debug, Clone)]
pub struct JsonFileBacklog {
    path: PathBuf,
}

impl JsonFileBacklog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        self.sibling(".tmp")
    }

    fn sibling(&self, suffix: &str) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(suffix);
        self.path.with_file_name(name)
    }

    /// Move an unparsable document out of the way so later saves cannot
    /// overwrite it.
    async fn quarantine(&self) -> Option<PathBuf> {
        let target = self.sibling(&format!(
            ".corrupt-{}",
            chrono::Utc::now().format("%Y%m%d%H%M%S%3f")
        ));
        match tokio::fs::rename(&self.path, &target).await {
            Ok(()) => Some(target),
            Err(e) => {
                warn!(
                    path = %self.path.display(),
                    error = %e,
                    "Failed to move unreadable backlog aside"
                );
                None
            }
        }
    }
}

#[async_trait]
impl BacklogRepository for JsonFileBacklog {
    async fn load(&self) -> Result<Vec<PipelineJob>> {
        let raw = match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        match serde_json::from_str::<BacklogDocument>(&raw) {
            Ok(document) => Ok(document.jobs),
            Err(e) => {
                if let Some(moved) = self.quarantine().await {
                    warn!(
                        path = %self.path.display(),
                        moved_to = %moved.display(),
                        error = %e,
                        "Unparsable backlog moved aside"
                    );
                }
                Err(e.into())
            }
        }
    }

    async fn save(&self, jobs: &[PipelineJob]) -> Result<()> {
        let document = BacklogDocument {
            jobs: jobs.to_vec(),
        };
        let json = serde_json::to_string_pretty(&document)?;

        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await?;
        }
        let temp = self.temp_path();
        tokio::fs::write(&temp, json).await?;
        tokio::fs::rename(&temp, &self.path).await?;
        Ok(())
    }
}

#[derive(Debug, sqlx::FromRow)]
struct PipelineJobRow {
    id: String,
    file: String,
    stage: String,
    status: String,
    process_job_id: Option<String>,
    result_path: Option<String>,
    submission_url: Option<String>,
    external_id: Option<String>,
    variant: Option<String>,
}

impl PipelineJobRow {
    fn into_job(self) -> Result<PipelineJob> {
        Ok(PipelineJob {
            id: self.id,
            file: self.file,
            stage: self.stage.parse::<Stage>()?,
            status: self.status.parse::<PipelineStatus>()?,
            process_job_id: self.process_job_id,
            result_path: self.result_path,
            submission_url: self.submission_url,
            external_id: self.external_id,
            variant: self
                .variant
                .as_deref()
                .map(str::parse::<Variant>)
                .transpose()?,
        })
    }
}

/// Backlog stored in the `pipeline_jobs` table.
#[derive(Debug, Clone)]
pub struct SqliteBacklog {
    pool: SqlitePool,
}

impl SqliteBacklog {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl BacklogRepository for SqliteBacklog {
    async fn load(&self) -> Result<Vec<PipelineJob>> {
        let rows = sqlx::query_as::<_, PipelineJobRow>(
            r#"
            SELECT id, file, stage, status, process_job_id, result_path,
                   submission_url, external_id, variant
            FROM pipeline_jobs
            ORDER BY position ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(PipelineJobRow::into_job).collect()
    }

    async fn save(&self, jobs: &[PipelineJob]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM pipeline_jobs")
            .execute(&mut *tx)
            .await?;

        for (position, job) in jobs.iter().enumerate() {
            sqlx::query(
                r#"
                INSERT INTO pipeline_jobs (
                    id, position, file, stage, status, process_job_id,
                    result_path, submission_url, external_id, variant
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&job.id)
            .bind(position as i64)
            .bind(&job.file)
            .bind(job.stage.as_str())
            .bind(job.status.as_str())
            .bind(&job.process_job_id)
            .bind(&job.result_path)
            .bind(&job.submission_url)
            .bind(&job.external_id)
            .bind(job.variant.map(Variant::as_str))
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }
}
