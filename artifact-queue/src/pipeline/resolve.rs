//! Input file resolution for pipeline stages.
//!
//! Later stages operate on the output of an earlier upscale, which is found
//! by filename convention or, failing that, through the artifact store.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

use super::job::{PipelineJob, Variant};
use crate::stores::{ArtifactStore, ExternalIdLookup};
use crate::{Error, Result};

/// Suffixes tried after `<externalId>_upscale` for the normal artifact.
const NORMAL_SUFFIXES: &[&str] = &["_4096", "-4096", "_upscaled", "-upscaled"];

/// Suffixes tried after `<externalId>_nobg` for the background-removed artifact.
const NOBG_SUFFIXES: &[&str] = &[
    "_4096_nobg",
    "-4096-nobg",
    "_upscaled_nobg",
    "-upscaled-nobg",
    "_4096_no_bg",
    "-4096-no_bg",
    "_4096-no-bg",
    "-4096-no-bg",
    "_upscaled_no_bg",
    "-upscaled-no_bg",
    "_upscaled-no-bg",
    "-upscaled-no-bg",
];

/// Store key suffix for background-removed artifacts.
const NOBG_KEY_SUFFIX: &str = "-nobg";

pub struct InputResolver {
    uploads_dir: PathBuf,
    url_prefix: String,
    artifacts: Arc<dyn ArtifactStore>,
    external_ids: Arc<dyn ExternalIdLookup>,
}

impl InputResolver {
    pub fn new(
        uploads_dir: impl Into<PathBuf>,
        url_prefix: impl Into<String>,
        artifacts: Arc<dyn ArtifactStore>,
        external_ids: Arc<dyn ExternalIdLookup>,
    ) -> Self {
        Self {
            uploads_dir: uploads_dir.into(),
            url_prefix: url_prefix.into(),
            artifacts,
            external_ids,
        }
    }

    /// Store key for an upload, e.g. `/uploads/photo.png`.
    pub fn upload_key(&self, file: &str) -> String {
        format!("{}/{}", self.url_prefix.trim_end_matches('/'), file)
    }

    /// Path of the uploaded source file.
    pub fn source_path(&self, file: &str) -> PathBuf {
        self.uploads_dir.join(file)
    }

    /// Concrete input file for `job`'s stage.
    ///
    /// Upscale reads the upload itself. Submit and reprice read a prior
    /// upscale's output, preferring the job's variant (background-removed
    /// when unset) and falling back to the other one.
    pub async fn resolve_input_path(&self, job: &PipelineJob) -> Result<PathBuf> {
        if !job.stage.needs_upscaled_input() {
            let path = self.source_path(&job.file);
            return if path_exists(&path).await {
                Ok(path)
            } else {
                Err(Error::not_found("input file", path.display().to_string()))
            };
        }

        let external_id = match &job.external_id {
            Some(id) => Some(id.clone()),
            None => self.lookup_external_id(&job.file).await,
        };
        let preferred = job.variant.unwrap_or(Variant::BackgroundRemoved);
        let fallback = match preferred {
            Variant::Normal => Variant::BackgroundRemoved,
            Variant::BackgroundRemoved => Variant::Normal,
        };

        for variant in [preferred, fallback] {
            if let Some(path) = self
                .find_artifact(&job.file, external_id.as_deref(), variant)
                .await
            {
                debug!(
                    file = %job.file,
                    stage = %job.stage,
                    variant = variant.as_str(),
                    path = %path.display(),
                    "Resolved upscaled input"
                );
                return Ok(path);
            }
        }

        Err(Error::not_found("upscaled artifact", job.file.clone()))
    }

    /// Convention-based filenames for one variant, in lookup order.
    pub fn candidates(
        &self,
        file: &str,
        external_id: Option<&str>,
        variant: Variant,
    ) -> Vec<PathBuf> {
        let source = Path::new(file);
        let ext = source
            .extension()
            .map(|e| format!(".{}", e.to_string_lossy()))
            .unwrap_or_default();
        let base = source
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();

        let (id_suffix, suffixes) = match variant {
            Variant::Normal => ("_upscale", NORMAL_SUFFIXES),
            Variant::BackgroundRemoved => ("_nobg", NOBG_SUFFIXES),
        };

        let mut names = Vec::with_capacity(suffixes.len() + 1);
        if let Some(id) = external_id.filter(|id| !id.is_empty()) {
            names.push(format!("{}{}{}", id, id_suffix, ext));
        }
        names.extend(suffixes.iter().map(|suffix| format!("{}{}{}", base, suffix, ext)));

        names
            .into_iter()
            .map(|name| self.uploads_dir.join(name))
            .collect()
    }

    async fn find_artifact(
        &self,
        file: &str,
        external_id: Option<&str>,
        variant: Variant,
    ) -> Option<PathBuf> {
        for candidate in self.candidates(file, external_id, variant) {
            if path_exists(&candidate).await {
                return Some(candidate);
            }
        }

        let mut key = self.upload_key(file);
        if variant == Variant::BackgroundRemoved {
            key.push_str(NOBG_KEY_SUFFIX);
        }
        match self.artifacts.get_artifact(&key).await {
            Ok(Some(stored)) => {
                let path = PathBuf::from(stored);
                path_exists(&path).await.then_some(path)
            }
            Ok(None) => None,
            Err(e) => {
                warn!(key = %key, error = %e, "Artifact store lookup failed");
                None
            }
        }
    }

    async fn lookup_external_id(&self, file: &str) -> Option<String> {
        let key = self.upload_key(file);
        match self.external_ids.external_id(&key).await {
            Ok(id) => id,
            Err(e) => {
                warn!(key = %key, error = %e, "External id lookup failed");
                None
            }
        }
    }
}

async fn path_exists(path: &Path) -> bool {
    tokio::fs::try_exists(path).await.unwrap_or(false)
}
