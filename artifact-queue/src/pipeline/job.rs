//! Pipeline job records.

use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::Error;

/// Processing stage, each bound to one external script.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    /// Upscale the uploaded file.
    Upscale,
    /// Submit the upscaled artifact to the marketplace.
    #[serde(alias = "printify")]
    Submit,
    /// Reprice an existing submission, addressed by its URL.
    Reprice,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Upscale => "upscale",
            Self::Submit => "submit",
            Self::Reprice => "reprice",
        }
    }

    /// Whether this stage consumes the output of a prior upscale.
    pub fn needs_upscaled_input(self) -> bool {
        matches!(self, Self::Submit | Self::Reprice)
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "upscale" => Ok(Self::Upscale),
            "submit" | "printify" => Ok(Self::Submit),
            "reprice" => Ok(Self::Reprice),
            other => Err(Error::validation(format!("Unknown stage: {}", other))),
        }
    }
}

/// Which version of an upscaled artifact a stage should prefer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Variant {
    #[serde(rename = "normal")]
    Normal,
    #[serde(rename = "background-removed", alias = "nobg")]
    BackgroundRemoved,
}

impl Variant {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::BackgroundRemoved => "background-removed",
        }
    }
}

impl FromStr for Variant {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "normal" => Ok(Self::Normal),
            "background-removed" | "nobg" => Ok(Self::BackgroundRemoved),
            other => Err(Error::validation(format!("Unknown variant: {}", other))),
        }
    }
}

/// Pipeline job status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PipelineStatus {
    Queued,
    Running,
    Finished,
    Error,
}

impl PipelineStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Finished => "finished",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for PipelineStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PipelineStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "running" => Ok(Self::Running),
            "finished" => Ok(Self::Finished),
            "error" => Ok(Self::Error),
            other => Err(Error::validation(format!("Unknown job status: {}", other))),
        }
    }
}

/// A requested stage execution against a source file.
///
/// Serialized field names match the persisted backlog document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineJob {
    pub id: String,
    /// Upload name (relative to the uploads dir) or absolute path.
    pub file: String,
    #[serde(alias = "type")]
    pub stage: Stage,
    pub status: PipelineStatus,
    /// Backing process job, if one was spawned.
    #[serde(default, alias = "jobId")]
    pub process_job_id: Option<String>,
    #[serde(default)]
    pub result_path: Option<String>,
    #[serde(default)]
    pub submission_url: Option<String>,
    /// External record id used for convention-based filenames.
    #[serde(default, alias = "dbId", deserialize_with = "deserialize_record_id")]
    pub external_id: Option<String>,
    #[serde(default)]
    pub variant: Option<Variant>,
}

/// Read a record id written either as a JSON string or as a number.
pub(crate) fn deserialize_record_id<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RecordId {
        Text(String),
        Number(serde_json::Number),
    }

    Ok(match Option::<RecordId>::deserialize(deserializer)? {
        Some(RecordId::Text(id)) => Some(id),
        Some(RecordId::Number(id)) => Some(id.to_string()),
        None => None,
    })
}

impl PipelineJob {
    /// Create a queued job with a fresh id.
    pub fn new(file: impl Into<String>, stage: Stage) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            file: file.into(),
            stage,
            status: PipelineStatus::Queued,
            process_job_id: None,
            result_path: None,
            submission_url: None,
            external_id: None,
            variant: None,
        }
    }

    pub fn with_external_id(mut self, external_id: impl Into<String>) -> Self {
        self.external_id = Some(external_id.into());
        self
    }

    pub fn with_variant(mut self, variant: Variant) -> Self {
        self.variant = Some(variant);
        self
    }

    /// Undo an interrupted dispatch: the program is gone after a restart and
    /// must be re-dispatched, not reattached.
    pub fn normalize_after_restart(&mut self) -> bool {
        if self.status != PipelineStatus::Running {
            return false;
        }
        self.status = PipelineStatus::Queued;
        self.process_job_id = None;
        true
    }
}
