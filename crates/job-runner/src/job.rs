//! Process job record and its state machine.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;

use crate::subject::{Subject, SubscriptionId};

/// Status of a process job.
///
/// `Running` is the only non-terminal state; there is no way back to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessStatus {
    /// The program is running (or about to).
    Running,
    /// The program exited, regardless of exit code, or was forced finished.
    Finished,
    /// The program could not be spawned or waited on.
    Error,
    /// Termination was requested by the owner.
    Stopped,
}

impl ProcessStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Running)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Finished => "finished",
            Self::Error => "error",
            Self::Stopped => "stopped",
        }
    }
}

impl fmt::Display for ProcessStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Summary view of a job, without the output buffer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessJobSummary {
    pub id: String,
    pub label: Option<String>,
    pub command: String,
    pub status: ProcessStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub exit_code: Option<i32>,
    pub result_path: Option<String>,
    pub derived_url: Option<String>,
}

#[derive(Debug)]
struct JobState {
    status: ProcessStatus,
    log: String,
    completed: bool,
    pid: Option<u32>,
    exit_code: Option<i32>,
    finished_at: Option<DateTime<Utc>>,
    result_path: Option<String>,
    derived_url: Option<String>,
}

/// One spawned external program.
///
/// Created by [`JobRunner::create_job`](crate::JobRunner::create_job). Output
/// and exit events mutate it; once terminal only the owner-filled result
/// slots (`result_path`, `derived_url`) may still change.
#[derive(Debug)]
pub struct ProcessJob {
    id: String,
    label: Option<String>,
    command: String,
    args: Vec<String>,
    working_dir: Option<PathBuf>,
    started_at: DateTime<Utc>,
    state: Mutex<JobState>,
    /// Held while a chunk is logged and emitted, so snapshots never split one.
    output_gate: Mutex<()>,
    output: Subject<String>,
    completion: Subject<ProcessStatus>,
    terminate: CancellationToken,
}

impl ProcessJob {
    pub(crate) fn new(
        id: String,
        command: String,
        args: Vec<String>,
        working_dir: Option<PathBuf>,
        label: Option<String>,
    ) -> Self {
        Self {
            id,
            label,
            command,
            args,
            working_dir,
            started_at: Utc::now(),
            state: Mutex::new(JobState {
                status: ProcessStatus::Running,
                log: String::new(),
                completed: false,
                pid: None,
                exit_code: None,
                finished_at: None,
                result_path: None,
                derived_url: None,
            }),
            output_gate: Mutex::new(()),
            output: Subject::new(),
            completion: Subject::new(),
            terminate: CancellationToken::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn label(&self) -> Option<&str> {
        self.label.as_deref()
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    pub fn working_dir(&self) -> Option<&Path> {
        self.working_dir.as_deref()
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn status(&self) -> ProcessStatus {
        self.state.lock().status
    }

    pub fn is_running(&self) -> bool {
        self.status() == ProcessStatus::Running
    }

    /// Whether completion listeners have already fired.
    pub fn is_completed(&self) -> bool {
        self.state.lock().completed
    }

    /// Full captured output (stdout and stderr merged in arrival order).
    pub fn log(&self) -> String {
        self.state.lock().log.clone()
    }

    pub fn pid(&self) -> Option<u32> {
        self.state.lock().pid
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.state.lock().exit_code
    }

    pub fn finished_at(&self) -> Option<DateTime<Utc>> {
        self.state.lock().finished_at
    }

    pub fn result_path(&self) -> Option<String> {
        self.state.lock().result_path.clone()
    }

    pub fn set_result_path(&self, path: impl Into<String>) {
        self.state.lock().result_path = Some(path.into());
    }

    pub fn derived_url(&self) -> Option<String> {
        self.state.lock().derived_url.clone()
    }

    pub fn set_derived_url(&self, url: impl Into<String>) {
        self.state.lock().derived_url = Some(url.into());
    }

    pub fn summary(&self) -> ProcessJobSummary {
        let state = self.state.lock();
        ProcessJobSummary {
            id: self.id.clone(),
            label: self.label.clone(),
            command: self.command.clone(),
            status: state.status,
            started_at: self.started_at,
            finished_at: state.finished_at,
            exit_code: state.exit_code,
            result_path: state.result_path.clone(),
            derived_url: state.derived_url.clone(),
        }
    }

    /// Subscribe to incremental output chunks.
    pub fn add_output_listener<F>(&self, listener: F) -> SubscriptionId
    where
        F: Fn(&String) + Send + Sync + 'static,
    {
        self.output.subscribe(listener)
    }

    /// Subscribe to output, first replaying the log captured so far.
    ///
    /// The listener sees the current log as its first call and then every later
    /// chunk, in order, with nothing repeated or lost in between. The replay
    /// call must not append to this job.
    pub fn add_output_listener_with_replay<F>(&self, listener: F) -> SubscriptionId
    where
        F: Fn(&String) + Send + Sync + 'static,
    {
        let _gate = self.output_gate.lock();
        listener(&self.log());
        self.output.subscribe(listener)
    }

    pub fn remove_output_listener(&self, id: SubscriptionId) -> bool {
        self.output.unsubscribe(id)
    }

    /// Subscribe to completion.
    ///
    /// The listener runs exactly once with the terminal status. If the job has
    /// already completed it runs immediately on the caller's task.
    pub fn add_completion_listener<F>(&self, listener: F) -> SubscriptionId
    where
        F: Fn(&ProcessStatus) + Send + Sync + 'static,
    {
        let state = self.state.lock();
        if state.completed {
            let status = state.status;
            drop(state);
            listener(&status);
            return self.completion.allocate_id();
        }
        // Subscribing under the state lock orders us before `complete`.
        self.completion.subscribe(listener)
    }

    pub fn remove_completion_listener(&self, id: SubscriptionId) -> bool {
        self.completion.unsubscribe(id)
    }

    pub(crate) fn set_pid(&self, pid: Option<u32>) {
        self.state.lock().pid = pid;
    }

    pub(crate) fn termination_token(&self) -> CancellationToken {
        self.terminate.clone()
    }

    /// Signal the supervisor to run the termination escalation.
    pub(crate) fn request_termination(&self) {
        self.terminate.cancel();
    }

    /// Append a chunk to the log and notify output listeners.
    pub(crate) fn append(&self, chunk: &str) {
        if chunk.is_empty() {
            return;
        }
        let chunk = chunk.to_string();
        let _gate = self.output_gate.lock();
        self.state.lock().log.push_str(&chunk);
        self.output.emit(&chunk);
    }

    /// `running -> stopped`. Returns `false` if the job was already terminal.
    pub(crate) fn mark_stopped(&self) -> bool {
        let mut state = self.state.lock();
        if state.status != ProcessStatus::Running {
            return false;
        }
        state.status = ProcessStatus::Stopped;
        true
    }

    /// Force a stuck `running` job to `finished` and fire completion.
    pub(crate) fn force_finish(&self) -> bool {
        {
            let mut state = self.state.lock();
            if state.status != ProcessStatus::Running || state.completed {
                return false;
            }
            state.status = ProcessStatus::Finished;
        }
        self.append("\n[force finished]");
        self.complete(ProcessStatus::Finished, None);
        true
    }

    /// Reach the terminal state and fire completion listeners once.
    ///
    /// `status` only replaces `Running`; a job already marked `Stopped` keeps
    /// that status.
    pub(crate) fn complete(&self, status: ProcessStatus, exit_code: Option<i32>) -> bool {
        let final_status = {
            let mut state = self.state.lock();
            if state.completed {
                return false;
            }
            if state.status == ProcessStatus::Running {
                state.status = status;
            }
            state.completed = true;
            state.exit_code = exit_code;
            state.finished_at = Some(Utc::now());
            state.status
        };

        self.completion.emit(&final_status);
        self.completion.clear();
        self.output.clear();
        // A forced finish must not leave the process behind.
        self.terminate.cancel();
        true
    }
}
