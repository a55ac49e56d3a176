//! Spawning and supervision of external programs.

use dashmap::DashMap;
use process_utils::{request_termination, tokio_command};
use std::path::PathBuf;
use std::process::ExitStatus;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Child;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::job::{ProcessJob, ProcessJobSummary, ProcessStatus};
use crate::subject::SubscriptionId;

/// Escalation and draining bounds.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// How long to wait after the graceful signal before force-killing.
    pub stop_grace: Duration,
    /// How long to wait after the force-kill before forcing `finished`.
    pub kill_grace: Duration,
    /// How long to wait for output readers after the process is gone.
    pub drain_timeout: Duration,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            stop_grace: Duration::from_secs(5),
            kill_grace: Duration::from_secs(2),
            drain_timeout: Duration::from_secs(2),
        }
    }
}

/// Options for [`JobRunner::create_job`].
#[derive(Debug, Clone, Default)]
pub struct SpawnOptions {
    pub working_dir: Option<PathBuf>,
    pub label: Option<String>,
}

impl SpawnOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }
}

enum Exit {
    Exited(ExitStatus),
    WaitFailed(std::io::Error),
    Unresponsive,
}

impl From<std::io::Result<ExitStatus>> for Exit {
    fn from(result: std::io::Result<ExitStatus>) -> Self {
        match result {
            Ok(status) => Self::Exited(status),
            Err(e) => Self::WaitFailed(e),
        }
    }
}

/// Tracks every process job spawned through it.
///
/// The runner has no notion of queues or stages: any number of jobs may run
/// at once. Must be used from within a Tokio runtime.
#[derive(Debug, Default)]
pub struct JobRunner {
    config: RunnerConfig,
    jobs: DashMap<String, Arc<ProcessJob>>,
}

impl JobRunner {
    pub fn new() -> Self {
        Self::with_config(RunnerConfig::default())
    }

    pub fn with_config(config: RunnerConfig) -> Self {
        Self {
            config,
            jobs: DashMap::new(),
        }
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    /// Spawn `command` with `args` and return its job immediately.
    ///
    /// Nothing is validated up front. A spawn failure is reported as an
    /// `error` completion with the error text in the log, never as a return
    /// value.
    pub fn create_job(
        &self,
        command: impl Into<String>,
        args: Vec<String>,
        options: SpawnOptions,
    ) -> Arc<ProcessJob> {
        let job = Arc::new(ProcessJob::new(
            uuid::Uuid::new_v4().to_string(),
            command.into(),
            args,
            options.working_dir,
            options.label,
        ));
        self.jobs.insert(job.id().to_string(), job.clone());

        let mut cmd = tokio_command(job.command());
        cmd.args(job.args());
        if let Some(dir) = job.working_dir() {
            cmd.current_dir(dir);
        }

        match cmd.spawn() {
            Ok(child) => {
                job.set_pid(child.id());
                info!(
                    job_id = %job.id(),
                    command = %job.command(),
                    pid = ?child.id(),
                    "Spawned process job"
                );
                tokio::spawn(supervise(job.clone(), child, self.config.clone()));
            }
            Err(e) => {
                error!(
                    job_id = %job.id(),
                    command = %job.command(),
                    error = %e,
                    "Failed to spawn process job"
                );
                job.append(&format!("[error] {}", e));
                job.complete(ProcessStatus::Error, None);
            }
        }

        job
    }

    pub fn get_job(&self, id: &str) -> Option<Arc<ProcessJob>> {
        self.jobs.get(id).map(|job| job.clone())
    }

    /// Summaries of every tracked job, oldest first.
    pub fn list_jobs(&self) -> Vec<ProcessJobSummary> {
        let mut jobs: Vec<ProcessJobSummary> =
            self.jobs.iter().map(|entry| entry.summary()).collect();
        jobs.sort_by(|a, b| a.started_at.cmp(&b.started_at).then(a.id.cmp(&b.id)));
        jobs
    }

    /// Request termination of a job.
    ///
    /// Returns `false` only if the id is unknown. A running job is marked
    /// `stopped` and escalated SIGTERM, then kill, then forced completion.
    pub fn stop_job(&self, id: &str) -> bool {
        let Some(job) = self.get_job(id) else {
            return false;
        };
        if job.mark_stopped() {
            info!(job_id = %id, "Stopping process job");
            job.request_termination();
        }
        true
    }

    /// Force a job stuck in `running` to `finished`.
    ///
    /// No-op (returns `false`) unless the job exists and is running.
    pub fn force_finish_job(&self, id: &str) -> bool {
        let Some(job) = self.get_job(id) else {
            return false;
        };
        let forced = job.force_finish();
        if forced {
            warn!(job_id = %id, "Process job force finished");
        }
        forced
    }

    /// Terminate `job` `delay` after its output first contains `marker`.
    ///
    /// Some scripts print their completion line and then linger (a browser
    /// kept open, a pipe held by a grandchild). The job is not marked
    /// `stopped`, so it still ends `finished`.
    pub fn terminate_after_marker(
        &self,
        job: &Arc<ProcessJob>,
        marker: &str,
        delay: Duration,
    ) -> SubscriptionId {
        let needle = marker.to_lowercase();
        let armed = Arc::new(AtomicBool::new(false));
        let weak = Arc::downgrade(job);

        job.add_output_listener(move |chunk| {
            if !chunk.to_lowercase().contains(&needle) || armed.swap(true, Ordering::SeqCst) {
                return;
            }
            let weak = weak.clone();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let Some(job) = weak.upgrade() else {
                    return;
                };
                if job.is_running() {
                    info!(
                        job_id = %job.id(),
                        delay_secs = delay.as_secs(),
                        "Completion marker seen; terminating lingering process"
                    );
                    job.request_termination();
                }
            });
        })
    }

    /// Forget terminal jobs that finished more than `max_age` ago.
    pub fn purge_terminal(&self, max_age: Duration) -> usize {
        let cutoff = chrono::Utc::now()
            - chrono::Duration::from_std(max_age).unwrap_or(chrono::Duration::MAX);
        let before = self.jobs.len();
        self.jobs.retain(|_, job| match job.finished_at() {
            Some(finished_at) => finished_at > cutoff,
            None => true,
        });
        let purged = before.saturating_sub(self.jobs.len());
        if purged > 0 {
            debug!(purged, "Purged terminal process jobs");
        }
        purged
    }
}

/// Own the child until it is gone, then complete the job.
async fn supervise(job: Arc<ProcessJob>, mut child: Child, config: RunnerConfig) {
    let mut readers: Vec<JoinHandle<()>> = Vec::with_capacity(2);
    if let Some(stdout) = child.stdout.take() {
        readers.push(tokio::spawn(pump_output(job.clone(), stdout, "stdout")));
    }
    if let Some(stderr) = child.stderr.take() {
        readers.push(tokio::spawn(pump_output(job.clone(), stderr, "stderr")));
    }

    let token = job.termination_token();
    let exit = tokio::select! {
        status = child.wait() => Exit::from(status),
        _ = token.cancelled() => escalate(&job, &mut child, &config).await,
    };

    let deadline = tokio::time::Instant::now() + config.drain_timeout;
    for mut reader in readers {
        if tokio::time::timeout_at(deadline, &mut reader).await.is_err() {
            debug!(job_id = %job.id(), "Output reader still open after exit; abandoning");
            reader.abort();
        }
    }

    match exit {
        Exit::Exited(status) => {
            let trailer = match status.code() {
                Some(code) => format!("\n[process exited with code {}]", code),
                None => format!("\n[process exited: {}]", status),
            };
            job.append(&trailer);
            if !status.success() {
                warn!(job_id = %job.id(), %status, "Process job exited unsuccessfully");
            } else {
                info!(job_id = %job.id(), "Process job exited");
            }
            job.complete(ProcessStatus::Finished, status.code());
        }
        Exit::WaitFailed(e) => {
            error!(job_id = %job.id(), error = %e, "Error waiting for process job");
            job.append(&format!("[error] {}", e));
            job.complete(ProcessStatus::Error, None);
        }
        Exit::Unresponsive => {
            error!(job_id = %job.id(), "Process did not exit after kill; forcing completion");
            if !job.force_finish() {
                job.complete(ProcessStatus::Finished, None);
            }
        }
    }
}

/// Graceful signal, then kill, then give up.
async fn escalate(job: &ProcessJob, child: &mut Child, config: &RunnerConfig) -> Exit {
    if let Some(pid) = child.id() {
        match request_termination(pid) {
            Ok(()) => {
                debug!(job_id = %job.id(), pid, "Sent graceful termination");
                if let Ok(status) = tokio::time::timeout(config.stop_grace, child.wait()).await {
                    return Exit::from(status);
                }
                warn!(
                    job_id = %job.id(),
                    grace_secs = config.stop_grace.as_secs(),
                    "Process ignored graceful termination; killing"
                );
            }
            Err(e) => {
                debug!(job_id = %job.id(), error = %e, "Graceful termination unavailable");
            }
        }
    }

    if let Err(e) = child.start_kill() {
        warn!(job_id = %job.id(), error = %e, "Failed to kill process");
    }
    match tokio::time::timeout(config.kill_grace, child.wait()).await {
        Ok(status) => Exit::from(status),
        Err(_) => Exit::Unresponsive,
    }
}

async fn pump_output<R>(job: Arc<ProcessJob>, stream: R, source: &'static str)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(stream);
    let mut buf = Vec::with_capacity(1024);
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let chunk = String::from_utf8_lossy(&buf);
                debug!(job_id = %job.id(), source, "{}", chunk.trim_end());
                job.append(&chunk);
            }
            Err(e) => {
                warn!(job_id = %job.id(), source, error = %e, "Error reading process output");
                break;
            }
        }
    }
}
