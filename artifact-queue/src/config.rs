//! Application configuration from environment variables.

use job_runner::RunnerConfig;
use std::path::PathBuf;
use std::time::Duration;

use crate::api::server::ApiServerConfig;
use crate::pipeline::{QueueConfig, StageScripts};

/// Where the pipeline backlog is persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BacklogBackend {
    Json,
    Sqlite,
}

/// Console output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Clone)]
pub struct LoggingOptions {
    pub format: LogFormat,
    /// Daily rolling log files are written here when set.
    pub log_dir: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub queue: QueueConfig,
    pub runner: RunnerConfig,
    pub backlog_backend: BacklogBackend,
    /// JSON backlog file, used with [`BacklogBackend::Json`].
    pub queue_state_path: PathBuf,
    pub database_url: String,
    /// Terminal process jobs older than this are dropped from the runner.
    pub job_retention: Duration,
    pub api: ApiServerConfig,
    pub logging: LoggingOptions,
}

impl AppConfig {
    /// Load configuration from the process environment, falling back to defaults.
    pub fn from_env_or_default() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let path = |key: &str, default: &str| {
            PathBuf::from(var(key).unwrap_or_else(|| default.to_string()))
        };
        let secs = |key: &str, default: u64| {
            Duration::from_secs(
                var(key)
                    .and_then(|v| v.trim().parse::<u64>().ok())
                    .unwrap_or(default),
            )
        };

        let scripts = StageScripts {
            upscale: path("UPSCALE_SCRIPT_PATH", "./scripts/upscale.sh"),
            submit: path("PRINTIFY_SCRIPT_PATH", "./scripts/submit.sh"),
            reprice: path("REPRICE_SCRIPT_PATH", "./scripts/reprice.sh"),
        };
        let mut queue = QueueConfig::new(path("UPLOADS_DIR", "./uploads"), scripts);
        if let Some(prefix) = var("UPLOAD_URL_PREFIX") {
            queue.url_prefix = prefix;
        }
        if let Some(marker) = lookup("SUBMIT_COMPLETION_MARKER") {
            // Set but empty disables the delayed kill.
            queue.completion_marker = (!marker.trim().is_empty()).then_some(marker);
        }
        queue.marker_kill_delay = secs("SUBMIT_KILL_DELAY_SECS", 15);

        let runner = RunnerConfig {
            stop_grace: secs("STOP_GRACE_SECS", 5),
            kill_grace: secs("KILL_GRACE_SECS", 2),
            ..RunnerConfig::default()
        };

        let backlog_backend = match var("BACKLOG_BACKEND").as_deref().map(str::trim) {
            Some(v) if v.eq_ignore_ascii_case("sqlite") => BacklogBackend::Sqlite,
            _ => BacklogBackend::Json,
        };

        let mut api = ApiServerConfig::default();
        if let Some(bind_address) = var("API_BIND_ADDRESS") {
            api.bind_address = bind_address;
        }
        if let Some(port) = var("API_PORT")
            && let Ok(parsed) = port.trim().parse::<u16>()
        {
            api.port = parsed;
        }

        let logging = LoggingOptions {
            format: match var("LOG_FORMAT").as_deref() {
                Some(v) if v.eq_ignore_ascii_case("json") => LogFormat::Json,
                _ => LogFormat::Text,
            },
            log_dir: var("LOG_DIR").map(PathBuf::from),
        };

        Self {
            queue,
            runner,
            backlog_backend,
            queue_state_path: path("QUEUE_STATE_PATH", "./pipeline_queue.json"),
            database_url: var("DATABASE_URL")
                .unwrap_or_else(|| "sqlite:artifact-queue.db?mode=rwc".to_string()),
            job_retention: secs("PROCESS_JOB_RETENTION_SECS", 3600),
            api,
            logging,
        }
    }
}
