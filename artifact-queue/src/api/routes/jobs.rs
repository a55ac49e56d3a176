//! Process job routes.

use axum::{
    Json, Router,
    extract::{Path, State},
    http::header,
    response::{
        IntoResponse,
        sse::{Event, KeepAlive, KeepAliveStream, Sse},
    },
    routing::{get, post},
};
use futures::channel::mpsc::{self, UnboundedReceiver};
use futures::{Stream, StreamExt};
use job_runner::{ProcessJob, ProcessJobSummary, SubscriptionId};
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use crate::api::error::{ApiError, ApiResult};
use crate::api::server::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(list_jobs))
        .route("/{id}", get(get_job))
        .route("/{id}/log", get(get_log))
        .route("/{id}/stream", get(stream_log))
        .route("/{id}/stop", post(stop_job))
}

pub fn upscale_router() -> Router<AppState> {
    Router::new().route("/", post(upscale_now))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStartedResponse {
    pub job_id: String,
}

#[derive(Debug, Serialize)]
pub struct StopResponse {
    pub stopped: bool,
}

#[derive(Debug, Deserialize)]
pub struct UpscaleRequest {
    pub file: Option<String>,
}

async fn list_jobs(State(state): State<AppState>) -> Json<Vec<ProcessJobSummary>> {
    Json(state.runner.list_jobs())
}

fn find_job(state: &AppState, id: &str) -> ApiResult<Arc<ProcessJob>> {
    state
        .runner
        .get_job(id)
        .ok_or_else(|| ApiError::not_found("Job not found"))
}

async fn get_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<ProcessJobSummary>> {
    Ok(Json(find_job(&state, &id)?.summary()))
}

async fn get_log(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let job = find_job(&state, &id)?;
    Ok(([(header::CONTENT_TYPE, "text/plain; charset=utf-8")], job.log()))
}

async fn stop_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<StopResponse>> {
    if !state.runner.stop_job(&id) {
        return Err(ApiError::not_found("Job not found"));
    }
    Ok(Json(StopResponse { stopped: true }))
}

async fn upscale_now(
    State(state): State<AppState>,
    Json(request): Json<UpscaleRequest>,
) -> ApiResult<Json<JobStartedResponse>> {
    let file = request
        .file
        .filter(|f| !f.trim().is_empty())
        .ok_or_else(|| ApiError::bad_request("Missing file"))?;
    let job = state.queue.upscale_now(&file).await?;
    Ok(Json(JobStartedResponse {
        job_id: job.id().to_string(),
    }))
}

/// Stream the current buffer as one `log` event, then each new chunk, then
/// `done` once the job completes.
async fn stream_log(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Sse<KeepAliveStream<LogStream>>> {
    let job = find_job(&state, &id)?;
    Ok(Sse::new(LogStream::new(job)).keep_alive(KeepAlive::default()))
}

fn log_event(chunk: &str) -> Event {
    Event::default()
        .event("log")
        .data(serde_json::to_string(chunk).unwrap_or_default())
}

enum StreamMessage {
    Chunk(String),
    Done,
}

/// Live output of one job; unsubscribes when the client goes away.
pub struct LogStream {
    rx: UnboundedReceiver<StreamMessage>,
    job: Arc<ProcessJob>,
    output_id: SubscriptionId,
    completion_id: SubscriptionId,
    finished: bool,
}

impl LogStream {
    fn new(job: Arc<ProcessJob>) -> Self {
        let (tx, rx) = mpsc::unbounded();
        let output_tx = tx.clone();
        let output_id = job.add_output_listener_with_replay(move |chunk| {
            let _ = output_tx.unbounded_send(StreamMessage::Chunk(chunk.clone()));
        });
        let completion_id = job.add_completion_listener(move |_| {
            let _ = tx.unbounded_send(StreamMessage::Done);
        });

        Self {
            rx,
            job,
            output_id,
            completion_id,
            finished: false,
        }
    }
}

impl Stream for LogStream {
    type Item = Result<Event, Infallible>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.finished {
            return Poll::Ready(None);
        }
        match self.rx.poll_next_unpin(cx) {
            Poll::Ready(Some(StreamMessage::Chunk(chunk))) => {
                Poll::Ready(Some(Ok(log_event(&chunk))))
            }
            Poll::Ready(Some(StreamMessage::Done)) => {
                self.finished = true;
                Poll::Ready(Some(Ok(Event::default().event("done").data("done"))))
            }
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for LogStream {
    fn drop(&mut self) {
        self.job.remove_output_listener(self.output_id);
        self.job.remove_completion_listener(self.completion_id);
    }
}
