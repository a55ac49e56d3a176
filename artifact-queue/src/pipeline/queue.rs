//! Single-slot FIFO queue of pipeline stages.
//!
//! At most one pipeline job runs at a time. The backlog is persisted after
//! every mutation and a job left `running` by a previous process is
//! re-dispatched from the start on [`PipelineQueue::start`].

use job_runner::{JobRunner, ProcessJob, ProcessStatus, SpawnOptions};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use super::job::{PipelineJob, PipelineStatus, Stage, Variant};
use super::repository::BacklogRepository;
use super::resolve::InputResolver;
use crate::extract::{extract_artifact_path, extract_submission_url};
use crate::stores::{ArtifactStore, ExternalIdLookup, StatusStore};
use crate::{Error, Result};

/// Status recorded for an upload once its upscaled artifact is known.
pub const UPSCALED_STATUS: &str = "Upscaled";

/// External script for each stage.
#[derive(Debug, Clone)]
pub struct StageScripts {
    pub upscale: PathBuf,
    pub submit: PathBuf,
    pub reprice: PathBuf,
}

impl StageScripts {
    pub fn for_stage(&self, stage: Stage) -> &Path {
        match stage {
            Stage::Upscale => &self.upscale,
            Stage::Submit => &self.submit,
            Stage::Reprice => &self.reprice,
        }
    }
}

#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub uploads_dir: PathBuf,
    /// Prefix of the store keys, `/uploads` gives `/uploads/<file>`.
    pub url_prefix: String,
    pub scripts: StageScripts,
    /// Output line after which a lingering submit script is terminated.
    pub completion_marker: Option<String>,
    pub marker_kill_delay: Duration,
}

impl QueueConfig {
    pub fn new(uploads_dir: impl Into<PathBuf>, scripts: StageScripts) -> Self {
        Self {
            uploads_dir: uploads_dir.into(),
            url_prefix: "/uploads".to_string(),
            scripts,
            completion_marker: Some("All steps completed".to_string()),
            marker_kill_delay: Duration::from_secs(15),
        }
    }
}

/// Collaborator stores used by the queue.
#[derive(Clone)]
pub struct QueueStores {
    pub artifacts: Arc<dyn ArtifactStore>,
    pub statuses: Arc<dyn StatusStore>,
    pub external_ids: Arc<dyn ExternalIdLookup>,
}

/// Parameters of [`PipelineQueue::enqueue`].
#[derive(Debug, Clone)]
pub struct EnqueueRequest {
    pub file: String,
    pub stage: Stage,
    pub external_id: Option<String>,
    pub variant: Option<Variant>,
    /// Submission URL for a reprice, when already known to the caller.
    pub submission_url: Option<String>,
}

impl EnqueueRequest {
    pub fn new(file: impl Into<String>, stage: Stage) -> Self {
        Self {
            file: file.into(),
            stage,
            external_id: None,
            variant: None,
            submission_url: None,
        }
    }

    pub fn external_id(mut self, id: impl Into<String>) -> Self {
        self.external_id = Some(id.into());
        self
    }

    pub fn variant(mut self, variant: Variant) -> Self {
        self.variant = Some(variant);
        self
    }

    pub fn submission_url(mut self, url: impl Into<String>) -> Self {
        self.submission_url = Some(url.into());
        self
    }
}

#[derive(Debug, Default)]
struct QueueState {
    jobs: Vec<PipelineJob>,
    /// Id of the pipeline job occupying the running slot.
    current: Option<String>,
}

/// What a dispatched stage was started with.
struct Launch {
    process: Arc<ProcessJob>,
    submission_url: Option<String>,
}

pub struct PipelineQueue {
    runner: Arc<JobRunner>,
    backlog: Arc<dyn BacklogRepository>,
    stores: QueueStores,
    resolver: InputResolver,
    config: QueueConfig,
    state: Mutex<QueueState>,
}

impl PipelineQueue {
    pub fn new(
        runner: Arc<JobRunner>,
        config: QueueConfig,
        stores: QueueStores,
        backlog: Arc<dyn BacklogRepository>,
    ) -> Arc<Self> {
        let resolver = InputResolver::new(
            config.uploads_dir.clone(),
            config.url_prefix.clone(),
            stores.artifacts.clone(),
            stores.external_ids.clone(),
        );
        Arc::new(Self {
            runner,
            backlog,
            stores,
            resolver,
            config,
            state: Mutex::new(QueueState::default()),
        })
    }

    pub fn runner(&self) -> &Arc<JobRunner> {
        &self.runner
    }

    /// Load the persisted backlog and resume processing.
    ///
    /// Jobs persisted as `running` lost their program with the previous
    /// process; they go back to `queued` and are dispatched again. A backlog
    /// that cannot be loaded is left untouched and the queue starts empty.
    pub async fn start(self: &Arc<Self>) {
        let mut loaded = match self.backlog.load().await {
            Ok(jobs) => jobs,
            Err(e) => {
                error!(error = %e, "Failed to load pipeline backlog; starting empty");
                self.process_next().await;
                return;
            }
        };
        let recovered = loaded
            .iter_mut()
            .map(PipelineJob::normalize_after_restart)
            .filter(|normalized| *normalized)
            .count();

        let mut state = self.state.lock().await;
        loaded.append(&mut state.jobs);
        state.jobs = loaded;
        info!(
            jobs = state.jobs.len(),
            recovered, "Pipeline backlog loaded"
        );
        self.persist(&state.jobs).await;
        self.dispatch_locked(&mut state).await;
    }

    /// Append a job to the backlog and dispatch it if the queue is idle.
    pub async fn enqueue(self: &Arc<Self>, request: EnqueueRequest) -> Result<PipelineJob> {
        let file = request.file.trim();
        if file.is_empty() {
            return Err(Error::validation("file is required"));
        }

        let mut job = PipelineJob::new(file, request.stage);
        job.external_id = request.external_id.filter(|id| !id.is_empty());
        job.variant = request.variant;
        job.submission_url = request.submission_url.filter(|url| !url.is_empty());
        let id = job.id.clone();

        let mut state = self.state.lock().await;
        info!(job_id = %id, stage = %job.stage, file = %job.file, "Pipeline job enqueued");
        state.jobs.push(job);
        self.persist(&state.jobs).await;
        self.dispatch_locked(&mut state).await;

        state
            .jobs
            .iter()
            .find(|j| j.id == id)
            .cloned()
            .ok_or_else(|| Error::not_found("pipeline job", id))
    }

    /// Every job in backlog order.
    pub async fn list(&self) -> Vec<PipelineJob> {
        self.state.lock().await.jobs.clone()
    }

    pub async fn get(&self, id: &str) -> Option<PipelineJob> {
        self.state
            .lock()
            .await
            .jobs
            .iter()
            .find(|j| j.id == id)
            .cloned()
    }

    /// Delete a job, stopping its program if it is running.
    ///
    /// Returns `false` if no job has this id.
    pub async fn remove(self: &Arc<Self>, id: &str) -> bool {
        let mut state = self.state.lock().await;
        let Some(index) = state.jobs.iter().position(|j| j.id == id) else {
            return false;
        };
        let job = state.jobs.remove(index);

        if job.status == PipelineStatus::Running
            && let Some(process_id) = &job.process_job_id
        {
            self.runner.stop_job(process_id);
        }
        let was_current = state.current.as_deref() == Some(id);
        if was_current {
            state.current = None;
        }
        info!(job_id = %id, status = %job.status, "Pipeline job removed");

        self.persist(&state.jobs).await;
        if was_current {
            self.dispatch_locked(&mut state).await;
        }
        true
    }

    /// Start the next queued job unless one is already running.
    pub async fn process_next(self: &Arc<Self>) {
        let mut state = self.state.lock().await;
        self.dispatch_locked(&mut state).await;
    }

    /// Run the upscale script on an upload right away, outside the queue.
    ///
    /// The result is recorded in the stores exactly as a queued upscale
    /// would.
    pub async fn upscale_now(self: &Arc<Self>, file: &str) -> Result<Arc<ProcessJob>> {
        let file = file.trim();
        if file.is_empty() {
            return Err(Error::validation("file is required"));
        }
        let source = self.resolver.source_path(file);
        if !tokio::fs::try_exists(&source).await.unwrap_or(false) {
            return Err(Error::validation(format!(
                "File not found: {}",
                source.display()
            )));
        }
        let script = self.locate_script(Stage::Upscale).await?;
        let input = std::path::absolute(&source)?.to_string_lossy().into_owned();

        let process = self.spawn_script(&script, input, format!("upscale-now:{}", file));
        info!(process_job_id = %process.id(), file = %file, "Direct upscale started");

        let queue = Arc::downgrade(self);
        let weak_process = Arc::downgrade(&process);
        let file = file.to_string();
        process.add_completion_listener(move |_| {
            let (Some(queue), Some(process)) = (queue.upgrade(), weak_process.upgrade()) else {
                return;
            };
            let file = file.clone();
            tokio::spawn(async move {
                queue.record_upscale(&file, &process).await;
            });
        });

        Ok(process)
    }

    async fn dispatch_locked(self: &Arc<Self>, state: &mut QueueState) {
        loop {
            if state.current.is_some() {
                return;
            }
            let Some(index) = state
                .jobs
                .iter()
                .position(|j| j.status == PipelineStatus::Queued)
            else {
                return;
            };

            let id = state.jobs[index].id.clone();
            state.jobs[index].status = PipelineStatus::Running;
            state.current = Some(id.clone());
            self.persist(&state.jobs).await;

            let job = state.jobs[index].clone();
            match self.launch(&job, &state.jobs).await {
                Ok(launch) => {
                    info!(
                        job_id = %id,
                        stage = %job.stage,
                        file = %job.file,
                        process_job_id = %launch.process.id(),
                        "Pipeline job started"
                    );
                    let entry = &mut state.jobs[index];
                    entry.process_job_id = Some(launch.process.id().to_string());
                    if launch.submission_url.is_some() {
                        entry.submission_url = launch.submission_url;
                    }
                    self.persist(&state.jobs).await;
                    self.watch(id, &launch.process);
                    return;
                }
                Err(e) => {
                    warn!(
                        job_id = %id,
                        stage = %job.stage,
                        file = %job.file,
                        error = %e,
                        "Pipeline job could not be started"
                    );
                    state.jobs[index].status = PipelineStatus::Error;
                    state.current = None;
                    self.persist(&state.jobs).await;
                }
            }
        }
    }

    /// Resolve inputs and spawn the stage script.
    async fn launch(&self, job: &PipelineJob, jobs: &[PipelineJob]) -> Result<Launch> {
        let input = self.resolver.resolve_input_path(job).await?;
        let script = self.locate_script(job.stage).await?;

        let submission_url = if job.stage == Stage::Reprice {
            let url = self
                .resolve_submission_url(job, jobs)
                .await
                .ok_or_else(|| Error::validation("no submission URL to reprice"))?;
            Some(url)
        } else {
            None
        };

        let argument = match &submission_url {
            Some(url) => url.clone(),
            None => std::path::absolute(&input)?.to_string_lossy().into_owned(),
        };
        let process = self.spawn_script(&script, argument, format!("{}:{}", job.stage, job.file));

        if job.stage == Stage::Submit
            && let Some(marker) = &self.config.completion_marker
        {
            self.runner
                .terminate_after_marker(&process, marker, self.config.marker_kill_delay);
        }

        Ok(Launch {
            process,
            submission_url,
        })
    }

    /// Run `script` with a single argument, from the script's directory.
    fn spawn_script(&self, script: &Path, argument: String, label: String) -> Arc<ProcessJob> {
        let mut options = SpawnOptions::new().label(label);
        if let Some(dir) = script.parent() {
            options = options.working_dir(dir);
        }
        self.runner
            .create_job(script.to_string_lossy(), vec![argument], options)
    }

    async fn locate_script(&self, stage: Stage) -> Result<PathBuf> {
        let script = self.config.scripts.for_stage(stage);
        tokio::fs::canonicalize(script).await.map_err(|e| {
            Error::config(format!(
                "{} script not available at {}: {}",
                stage,
                script.display(),
                e
            ))
        })
    }

    /// The job's own URL, then the newest finished submit of the same file,
    /// then the status recorded in the status store.
    async fn resolve_submission_url(
        &self,
        job: &PipelineJob,
        jobs: &[PipelineJob],
    ) -> Option<String> {
        if let Some(url) = &job.submission_url {
            return Some(url.clone());
        }

        let from_backlog = jobs
            .iter()
            .rev()
            .filter(|j| {
                j.file == job.file
                    && j.stage == Stage::Submit
                    && j.status == PipelineStatus::Finished
            })
            .find_map(|j| j.submission_url.clone());
        if from_backlog.is_some() {
            return from_backlog;
        }

        let key = self.resolver.upload_key(&job.file);
        match self.stores.statuses.get_status(&key).await {
            Ok(status) => status.as_deref().and_then(extract_submission_url),
            Err(e) => {
                warn!(key = %key, error = %e, "Status store lookup failed");
                None
            }
        }
    }

    fn watch(self: &Arc<Self>, pipeline_id: String, process: &Arc<ProcessJob>) {
        let queue: Weak<Self> = Arc::downgrade(self);
        let weak_process = Arc::downgrade(process);
        process.add_completion_listener(move |status| {
            let (Some(queue), Some(process)) = (queue.upgrade(), weak_process.upgrade()) else {
                return;
            };
            let pipeline_id = pipeline_id.clone();
            let status = *status;
            tokio::spawn(async move {
                queue.handle_completion(pipeline_id, process, status).await;
            });
        });
    }

    async fn handle_completion(
        self: Arc<Self>,
        pipeline_id: String,
        process: Arc<ProcessJob>,
        status: ProcessStatus,
    ) {
        let mut state = self.state.lock().await;
        let Some(index) = state.jobs.iter().position(|j| j.id == pipeline_id) else {
            debug!(job_id = %pipeline_id, "Completion for removed pipeline job ignored");
            return;
        };
        let job = state.jobs[index].clone();

        let mut result_path = None;
        let mut submission_url = None;
        match job.stage {
            Stage::Upscale => result_path = self.record_upscale(&job.file, &process).await,
            Stage::Submit => submission_url = self.record_submission(&job.file, &process).await,
            Stage::Reprice => {}
        }

        let entry = &mut state.jobs[index];
        entry.status = match status {
            ProcessStatus::Finished => PipelineStatus::Finished,
            ProcessStatus::Error | ProcessStatus::Stopped => PipelineStatus::Error,
            ProcessStatus::Running => PipelineStatus::Running,
        };
        if result_path.is_some() {
            entry.result_path = result_path;
        }
        if submission_url.is_some() {
            entry.submission_url = submission_url;
        }
        info!(
            job_id = %pipeline_id,
            stage = %job.stage,
            file = %job.file,
            status = %entry.status,
            "Pipeline job completed"
        );

        if state.current.as_deref() == Some(pipeline_id.as_str()) {
            state.current = None;
        }
        self.persist(&state.jobs).await;
        self.dispatch_locked(&mut state).await;
    }

    /// Record the artifact printed by an upscale run.
    async fn record_upscale(&self, file: &str, process: &ProcessJob) -> Option<String> {
        let Some(path) = extract_artifact_path(&process.log()) else {
            debug!(
                file = %file,
                process_job_id = %process.id(),
                "Upscale printed no artifact path"
            );
            return None;
        };
        process.set_result_path(path.clone());

        let key = self.resolver.upload_key(file);
        if let Err(e) = self.stores.artifacts.set_artifact(&key, &path).await {
            warn!(key = %key, error = %e, "Failed to record upscaled artifact");
        }
        if let Err(e) = self.stores.statuses.set_status(&key, UPSCALED_STATUS).await {
            warn!(key = %key, error = %e, "Failed to record upscale status");
        }
        info!(file = %file, artifact = %path, "Upscaled artifact recorded");
        Some(path)
    }

    /// Record the URL printed by a submit run.
    async fn record_submission(&self, file: &str, process: &ProcessJob) -> Option<String> {
        let url = extract_submission_url(&process.log())?;
        process.set_derived_url(url.clone());

        let key = self.resolver.upload_key(file);
        let status = format!("Printify URL: {}", url);
        if let Err(e) = self.stores.statuses.set_status(&key, &status).await {
            warn!(key = %key, error = %e, "Failed to record submission URL");
        }
        info!(file = %file, url = %url, "Submission URL recorded");
        Some(url)
    }

    async fn persist(&self, jobs: &[PipelineJob]) {
        if let Err(e) = self.backlog.save(jobs).await {
            warn!(error = %e, "Failed to persist pipeline backlog");
        }
    }
}
