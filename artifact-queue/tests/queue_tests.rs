//! Pipeline queue integration tests driving real shell scripts.
#![cfg(unix)]

use artifact_queue::pipeline::{
    BacklogRepository, EnqueueRequest, JsonFileBacklog, MemoryBacklog, PipelineJob,
    PipelineQueue, PipelineStatus, QueueConfig, QueueStores, Stage, StageScripts, Variant,
};
use artifact_queue::stores::MemoryStore;
use artifact_queue::{Error, Result};
use async_trait::async_trait;
use job_runner::{JobRunner, ProcessStatus, RunnerConfig};
use parking_lot::Mutex;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;

const NOOP_SCRIPT: &str = "echo noop";

struct Harness {
    _dir: TempDir,
    uploads: PathBuf,
    artifacts: Arc<MemoryStore>,
    statuses: Arc<MemoryStore>,
    external_ids: Arc<MemoryStore>,
    runner: Arc<JobRunner>,
    queue: Arc<PipelineQueue>,
}

struct Scripts<'a> {
    upscale: &'a str,
    submit: &'a str,
    reprice: &'a str,
}

impl Default for Scripts<'_> {
    fn default() -> Self {
        Self {
            upscale: NOOP_SCRIPT,
            submit: NOOP_SCRIPT,
            reprice: NOOP_SCRIPT,
        }
    }
}

fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

fn fast_runner() -> Arc<JobRunner> {
    Arc::new(JobRunner::with_config(RunnerConfig {
        stop_grace: Duration::from_millis(300),
        kill_grace: Duration::from_millis(300),
        drain_timeout: Duration::from_millis(300),
    }))
}

impl Harness {
    fn new(scripts: Scripts<'_>) -> Self {
        Self::build(scripts, Arc::new(MemoryBacklog::new()), |_| {})
    }

    fn build(
        scripts: Scripts<'_>,
        backlog: Arc<dyn BacklogRepository>,
        tweak: impl FnOnce(&mut QueueConfig),
    ) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let uploads = dir.path().join("uploads");
        let script_dir = dir.path().join("scripts");
        std::fs::create_dir_all(&uploads).unwrap();
        std::fs::create_dir_all(&script_dir).unwrap();

        let stage_scripts = StageScripts {
            upscale: write_script(&script_dir, "upscale.sh", scripts.upscale),
            submit: write_script(&script_dir, "submit.sh", scripts.submit),
            reprice: write_script(&script_dir, "reprice.sh", scripts.reprice),
        };
        let mut config = QueueConfig::new(&uploads, stage_scripts);
        config.marker_kill_delay = Duration::from_millis(100);
        tweak(&mut config);

        let artifacts = Arc::new(MemoryStore::new());
        let statuses = Arc::new(MemoryStore::new());
        let external_ids = Arc::new(MemoryStore::new());
        let runner = fast_runner();
        let queue = PipelineQueue::new(
            runner.clone(),
            config,
            QueueStores {
                artifacts: artifacts.clone(),
                statuses: statuses.clone(),
                external_ids: external_ids.clone(),
            },
            backlog,
        );

        Self {
            _dir: dir,
            uploads,
            artifacts,
            statuses,
            external_ids,
            runner,
            queue,
        }
    }

    fn upload(&self, name: &str) -> PathBuf {
        let path = self.uploads.join(name);
        std::fs::write(&path, b"image").unwrap();
        path
    }

    async fn enqueue(&self, request: EnqueueRequest) -> PipelineJob {
        self.queue.enqueue(request).await.unwrap()
    }

    async fn wait_for<F>(&self, condition: F) -> Vec<PipelineJob>
    where
        F: Fn(&[PipelineJob]) -> bool,
    {
        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            let jobs = self.queue.list().await;
            if condition(jobs.as_slice()) {
                return jobs;
            }
            assert!(Instant::now() < deadline, "timed out waiting; jobs: {:?}", jobs);
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    async fn wait_for_status(&self, id: &str, status: PipelineStatus) -> PipelineJob {
        let jobs = self
            .wait_for(|jobs| jobs.iter().any(|j| j.id == id && j.status == status))
            .await;
        jobs.into_iter().find(|j| j.id == id).unwrap()
    }

    fn process_log(&self, job: &PipelineJob) -> String {
        let process_id = job.process_job_id.as_deref().expect("no process job");
        self.runner.get_job(process_id).expect("process job gone").log()
    }
}

fn running_count(jobs: &[PipelineJob]) -> usize {
    jobs.iter()
        .filter(|j| j.status == PipelineStatus::Running)
        .count()
}

#[tokio::test]
async fn test_upscale_records_artifact_and_status() {
    let harness = Harness::new(Scripts {
        upscale: "echo \"upscaling $1\"\necho 'Final output saved to: uploads/photo_upscaled.png'\nexit 0",
        ..Default::default()
    });
    let source = harness.upload("photo.png");

    let job = harness
        .enqueue(EnqueueRequest::new("photo.png", Stage::Upscale))
        .await;
    let job = harness.wait_for_status(&job.id, PipelineStatus::Finished).await;

    assert_eq!(job.result_path.as_deref(), Some("uploads/photo_upscaled.png"));
    assert_eq!(
        harness.artifacts.value("/uploads/photo.png").as_deref(),
        Some("uploads/photo_upscaled.png")
    );
    assert_eq!(
        harness.statuses.value("/uploads/photo.png").as_deref(),
        Some("Upscaled")
    );
    assert!(
        harness
            .process_log(&job)
            .contains(&format!("upscaling {}", source.display()))
    );
}

#[tokio::test]
async fn test_non_zero_exit_with_marker_is_finished() {
    let harness = Harness::new(Scripts {
        upscale: "echo 'Final output saved to: /out/a.png'\nexit 4",
        ..Default::default()
    });
    harness.upload("a.png");

    let job = harness
        .enqueue(EnqueueRequest::new("a.png", Stage::Upscale))
        .await;
    let job = harness.wait_for_status(&job.id, PipelineStatus::Finished).await;

    assert_eq!(job.result_path.as_deref(), Some("/out/a.png"));
    let process = harness
        .runner
        .get_job(job.process_job_id.as_deref().unwrap())
        .unwrap();
    assert_eq!(process.exit_code(), Some(4));
    assert_eq!(process.result_path().as_deref(), Some("/out/a.png"));
}

#[tokio::test]
async fn test_submit_without_upscaled_artifact_errors_without_spawning() {
    let harness = Harness::new(Scripts::default());
    harness.upload("photo.png");

    let job = harness
        .enqueue(EnqueueRequest::new("photo.png", Stage::Submit))
        .await;

    assert_eq!(job.status, PipelineStatus::Error);
    assert!(job.process_job_id.is_none());
    assert!(harness.runner.list_jobs().is_empty());
}

#[tokio::test]
async fn test_missing_script_errors_and_queue_advances() {
    let harness = Harness::build(Scripts::default(), Arc::new(MemoryBacklog::new()), |config| {
        config.scripts.upscale = PathBuf::from("/definitely/missing/upscale.sh");
    });
    harness.upload("a.png");
    harness.upload("b.png");
    harness.upload("b_upscaled.png");

    let first = harness
        .enqueue(EnqueueRequest::new("a.png", Stage::Upscale))
        .await;
    let second = harness
        .enqueue(EnqueueRequest::new("b.png", Stage::Submit))
        .await;

    assert_eq!(first.status, PipelineStatus::Error);
    harness
        .wait_for_status(&second.id, PipelineStatus::Finished)
        .await;
    assert_eq!(harness.runner.list_jobs().len(), 1);
}

#[tokio::test]
async fn test_back_to_back_jobs_run_in_order_one_at_a_time() {
    let harness = Harness::new(Scripts {
        upscale: "sleep 0.3\necho \"done $1\"",
        ..Default::default()
    });
    for name in ["a.png", "b.png", "c.png"] {
        harness.upload(name);
    }

    let mut ids = Vec::new();
    for name in ["a.png", "b.png", "c.png"] {
        ids.push(harness.enqueue(EnqueueRequest::new(name, Stage::Upscale)).await.id);
    }

    let jobs = harness.queue.list().await;
    assert_eq!(jobs[0].status, PipelineStatus::Running);
    assert_eq!(jobs[1].status, PipelineStatus::Queued);
    assert_eq!(jobs[2].status, PipelineStatus::Queued);

    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let jobs = harness.queue.list().await;
        assert!(running_count(&jobs) <= 1, "two jobs running: {:?}", jobs);
        if jobs.iter().all(|j| j.status == PipelineStatus::Finished) {
            break;
        }
        assert!(Instant::now() < deadline, "timed out; jobs: {:?}", jobs);
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let processes: Vec<_> = harness
        .queue
        .list()
        .await
        .iter()
        .map(|j| harness.runner.get_job(j.process_job_id.as_deref().unwrap()).unwrap())
        .collect();
    for pair in processes.windows(2) {
        assert!(pair[0].finished_at().unwrap() <= pair[1].started_at());
    }
}

#[tokio::test]
async fn test_remove_running_job_stops_it_and_starts_next() {
    let harness = Harness::new(Scripts {
        upscale: "sleep 30",
        ..Default::default()
    });
    harness.upload("a.png");
    harness.upload("b.png");

    let first = harness
        .enqueue(EnqueueRequest::new("a.png", Stage::Upscale))
        .await;
    let second = harness
        .enqueue(EnqueueRequest::new("b.png", Stage::Upscale))
        .await;
    let first_process = harness
        .runner
        .get_job(first.process_job_id.as_deref().unwrap())
        .unwrap();

    assert!(harness.queue.remove(&first.id).await);

    assert_eq!(first_process.status(), ProcessStatus::Stopped);
    let jobs = harness.queue.list().await;
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].id, second.id);
    assert_eq!(jobs[0].status, PipelineStatus::Running);
    assert!(!harness.queue.remove(&first.id).await);

    harness.queue.remove(&second.id).await;
}

#[tokio::test]
async fn test_late_completion_of_removed_job_keeps_running_slot() {
    let harness = Harness::new(Scripts {
        upscale: "sleep 30",
        ..Default::default()
    });
    for name in ["a.png", "b.png", "c.png"] {
        harness.upload(name);
    }

    let first = harness
        .enqueue(EnqueueRequest::new("a.png", Stage::Upscale))
        .await;
    let second = harness
        .enqueue(EnqueueRequest::new("b.png", Stage::Upscale))
        .await;
    let first_process = harness
        .runner
        .get_job(first.process_job_id.as_deref().unwrap())
        .unwrap();
    harness.queue.remove(&first.id).await;

    let deadline = Instant::now() + Duration::from_secs(10);
    while !first_process.is_completed() {
        assert!(Instant::now() < deadline, "removed job never completed");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    tokio::time::sleep(Duration::from_millis(100)).await;

    let third = harness
        .enqueue(EnqueueRequest::new("c.png", Stage::Upscale))
        .await;
    assert_eq!(third.status, PipelineStatus::Queued);
    let jobs = harness.queue.list().await;
    assert_eq!(running_count(&jobs), 1);
    assert_eq!(
        harness.queue.get(&second.id).await.unwrap().status,
        PipelineStatus::Running
    );

    harness.queue.remove(&second.id).await;
    harness.queue.remove(&third.id).await;
}

/// Records every saved list.
#[derive(Default)]
struct RecordingBacklog {
    initial: Vec<PipelineJob>,
    saves: Mutex<Vec<Vec<PipelineJob>>>,
}

#[async_trait]
impl BacklogRepository for RecordingBacklog {
    async fn load(&self) -> Result<Vec<PipelineJob>> {
        Ok(self.initial.clone())
    }

    async fn save(&self, jobs: &[PipelineJob]) -> Result<()> {
        self.saves.lock().push(jobs.to_vec());
        Ok(())
    }
}

#[tokio::test]
async fn test_start_requeues_interrupted_job_before_dispatch() {
    let mut interrupted = PipelineJob::new("a.png", Stage::Upscale);
    interrupted.status = PipelineStatus::Running;
    interrupted.process_job_id = Some("stale-process".to_string());
    let mut done = PipelineJob::new("z.png", Stage::Upscale);
    done.status = PipelineStatus::Finished;

    let backlog = Arc::new(RecordingBacklog {
        initial: vec![done.clone(), interrupted.clone()],
        ..Default::default()
    });
    let harness = Harness::build(
        Scripts {
            upscale: "echo again",
            ..Default::default()
        },
        backlog.clone(),
        |_| {},
    );
    harness.upload("a.png");

    harness.queue.start().await;

    let first_save = backlog.saves.lock()[0].clone();
    assert_eq!(first_save[0], done);
    assert_eq!(first_save[1].status, PipelineStatus::Queued);
    assert!(first_save[1].process_job_id.is_none());

    let job = harness
        .wait_for_status(&interrupted.id, PipelineStatus::Finished)
        .await;
    let process_id = job.process_job_id.unwrap();
    assert_ne!(process_id, "stale-process");
    assert!(harness.runner.get_job(&process_id).is_some());
}

#[tokio::test]
async fn test_start_resumes_backlog_with_numeric_record_id() {
    let dir = tempfile::tempdir().unwrap();
    let state_path = dir.path().join("pipeline_queue.json");
    std::fs::write(
        &state_path,
        r#"{"jobs":[{"id":"a1","file":"photo.png","type":"printify","status":"queued",
            "jobId":null,"resultPath":null,"dbId":12,"variant":"nobg"}]}"#,
    )
    .unwrap();
    let harness = Harness::build(
        Scripts {
            submit: "echo \"submitting $1\"",
            ..Default::default()
        },
        Arc::new(JsonFileBacklog::new(&state_path)),
        |_| {},
    );
    let by_id = harness.upload("12_nobg.png");

    harness.queue.start().await;

    let job = harness.wait_for_status("a1", PipelineStatus::Finished).await;
    assert_eq!(job.external_id.as_deref(), Some("12"));
    assert!(
        harness
            .process_log(&job)
            .contains(&format!("submitting {}", by_id.display()))
    );

    let raw: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&state_path).unwrap()).unwrap();
    assert_eq!(raw["jobs"][0]["id"], "a1");
    assert_eq!(raw["jobs"][0]["externalId"], "12");
}

#[tokio::test]
async fn test_start_keeps_unreadable_backlog() {
    let dir = tempfile::tempdir().unwrap();
    let state_path = dir.path().join("pipeline_queue.json");
    std::fs::write(&state_path, "{\"jobs\": [ truncated").unwrap();
    let harness = Harness::build(
        Scripts::default(),
        Arc::new(JsonFileBacklog::new(&state_path)),
        |_| {},
    );

    harness.queue.start().await;

    assert!(harness.queue.list().await.is_empty());
    assert!(!state_path.exists());
    let preserved: Vec<PathBuf> = std::fs::read_dir(dir.path())
        .unwrap()
        .map(|entry| entry.unwrap().path())
        .filter(|path| {
            path.file_name().is_some_and(|name| {
                name.to_string_lossy()
                    .starts_with("pipeline_queue.json.corrupt-")
            })
        })
        .collect();
    assert_eq!(preserved.len(), 1);
    assert_eq!(
        std::fs::read_to_string(&preserved[0]).unwrap(),
        "{\"jobs\": [ truncated"
    );

    let job = harness
        .enqueue(EnqueueRequest::new("missing.png", Stage::Upscale))
        .await;
    let raw: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&state_path).unwrap()).unwrap();
    assert_eq!(raw["jobs"][0]["id"], job.id.as_str());
    assert!(preserved[0].exists());
}

#[tokio::test]
async fn test_json_backlog_reflects_every_mutation() {
    let dir = tempfile::tempdir().unwrap();
    let state_path = dir.path().join("pipeline_queue.json");
    let harness = Harness::build(
        Scripts::default(),
        Arc::new(JsonFileBacklog::new(&state_path)),
        |_| {},
    );

    let job = harness
        .enqueue(EnqueueRequest::new("missing.png", Stage::Upscale).external_id("9"))
        .await;
    assert_eq!(job.status, PipelineStatus::Error);

    let raw: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&state_path).unwrap()).unwrap();
    assert_eq!(raw["jobs"][0]["id"], job.id.as_str());
    assert_eq!(raw["jobs"][0]["status"], "error");
    assert_eq!(raw["jobs"][0]["externalId"], "9");

    harness.queue.remove(&job.id).await;
    let raw: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&state_path).unwrap()).unwrap();
    assert!(raw["jobs"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn test_submit_prefers_requested_variant_with_fallback() {
    let harness = Harness::new(Scripts {
        submit: "echo \"submitting $1\"",
        ..Default::default()
    });
    harness.upload("photo.png");
    let nobg = harness.upload("photo_4096_nobg.png");

    let job = harness
        .enqueue(EnqueueRequest::new("photo.png", Stage::Submit).variant(Variant::Normal))
        .await;
    let job = harness.wait_for_status(&job.id, PipelineStatus::Finished).await;

    assert!(
        harness
            .process_log(&job)
            .contains(&format!("submitting {}", nobg.display()))
    );
}

#[tokio::test]
async fn test_submit_uses_external_id_from_lookup() {
    let harness = Harness::new(Scripts {
        submit: "echo \"submitting $1\"",
        ..Default::default()
    });
    harness.upload("photo.png");
    harness.upload("photo_upscaled.png");
    let by_id = harness.upload("17_upscale.png");
    harness.external_ids.insert("/uploads/photo.png", "17");

    let job = harness
        .enqueue(EnqueueRequest::new("photo.png", Stage::Submit).variant(Variant::Normal))
        .await;
    let job = harness.wait_for_status(&job.id, PipelineStatus::Finished).await;

    assert!(
        harness
            .process_log(&job)
            .contains(&format!("submitting {}", by_id.display()))
    );
}

#[tokio::test]
async fn test_submit_records_url_for_later_reprice() {
    let harness = Harness::new(Scripts {
        submit: "echo 'Product URL: https://shop.example/p/9'",
        reprice: "echo \"repricing $1\"",
        ..Default::default()
    });
    harness.upload("photo_upscaled.png");

    let submit = harness
        .enqueue(EnqueueRequest::new("photo.png", Stage::Submit))
        .await;
    let submit = harness
        .wait_for_status(&submit.id, PipelineStatus::Finished)
        .await;
    assert_eq!(
        submit.submission_url.as_deref(),
        Some("https://shop.example/p/9")
    );
    assert_eq!(
        harness.statuses.value("/uploads/photo.png").as_deref(),
        Some("Printify URL: https://shop.example/p/9")
    );

    let reprice = harness
        .enqueue(EnqueueRequest::new("photo.png", Stage::Reprice))
        .await;
    let reprice = harness
        .wait_for_status(&reprice.id, PipelineStatus::Finished)
        .await;
    assert!(
        harness
            .process_log(&reprice)
            .contains("repricing https://shop.example/p/9")
    );
}

#[tokio::test]
async fn test_reprice_reads_url_from_status_store() {
    let harness = Harness::new(Scripts {
        reprice: "echo \"repricing $1\"",
        ..Default::default()
    });
    harness.upload("photo-upscaled.png");
    harness
        .statuses
        .insert("/uploads/photo.png", "Printify URL: https://printify.example/x/3");

    let job = harness
        .enqueue(EnqueueRequest::new("photo.png", Stage::Reprice))
        .await;
    let job = harness.wait_for_status(&job.id, PipelineStatus::Finished).await;

    assert_eq!(
        job.submission_url.as_deref(),
        Some("https://printify.example/x/3")
    );
    assert!(
        harness
            .process_log(&job)
            .contains("repricing https://printify.example/x/3")
    );
}

#[tokio::test]
async fn test_reprice_without_url_errors_without_spawning() {
    let harness = Harness::new(Scripts::default());
    harness.upload("photo_upscaled.png");
    harness.statuses.insert("/uploads/photo.png", "Upscaled");

    let job = harness
        .enqueue(EnqueueRequest::new("photo.png", Stage::Reprice))
        .await;

    assert_eq!(job.status, PipelineStatus::Error);
    assert!(harness.runner.list_jobs().is_empty());
}

#[tokio::test]
async fn test_lingering_submit_is_terminated_after_marker() {
    let harness = Harness::new(Scripts {
        submit: "echo 'Product URL: https://shop.example/p/1'\necho 'All steps completed'\nsleep 30",
        ..Default::default()
    });
    harness.upload("photo_upscaled.png");

    let job = harness
        .enqueue(EnqueueRequest::new("photo.png", Stage::Submit))
        .await;
    let job = harness.wait_for_status(&job.id, PipelineStatus::Finished).await;

    assert_eq!(
        job.submission_url.as_deref(),
        Some("https://shop.example/p/1")
    );
}

#[tokio::test]
async fn test_upscale_now_bypasses_queue_and_records_result() {
    let harness = Harness::new(Scripts {
        upscale: "echo 'Final output saved to: /out/now.png'",
        ..Default::default()
    });

    let err = harness.queue.upscale_now("nope.png").await.unwrap_err();
    assert!(matches!(err, Error::Validation(_)));

    harness.upload("now.png");
    let process = harness.queue.upscale_now("now.png").await.unwrap();

    let deadline = Instant::now() + Duration::from_secs(10);
    while harness.artifacts.value("/uploads/now.png").is_none() {
        assert!(Instant::now() < deadline, "artifact never recorded");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(
        harness.artifacts.value("/uploads/now.png").as_deref(),
        Some("/out/now.png")
    );
    assert_eq!(process.result_path().as_deref(), Some("/out/now.png"));
    assert!(harness.queue.list().await.is_empty());
}

#[tokio::test]
async fn test_enqueue_rejects_empty_file() {
    let harness = Harness::new(Scripts::default());
    let err = harness
        .queue
        .enqueue(EnqueueRequest::new("  ", Stage::Upscale))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Validation(_)));
    assert!(harness.queue.list().await.is_empty());
}
