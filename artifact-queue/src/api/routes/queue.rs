//! Pipeline queue routes.

use axum::{
    Json, Router,
    extract::{Path, State},
    routing::get,
};
use serde::{Deserialize, Serialize};

use crate::api::error::{ApiError, ApiResult};
use crate::api::server::AppState;
use crate::pipeline::job::deserialize_record_id;
use crate::pipeline::{EnqueueRequest, PipelineJob, Stage, Variant};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(list_queue).post(enqueue))
        .route("/{id}", get(get_queued).delete(remove))
}

/// Request body for enqueueing; `type` and `dbId` are accepted for older clients.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnqueueBody {
    pub file: Option<String>,
    #[serde(alias = "type")]
    pub stage: Option<String>,
    #[serde(default, alias = "dbId", deserialize_with = "deserialize_record_id")]
    pub external_id: Option<String>,
    pub variant: Option<String>,
    #[serde(alias = "url")]
    pub submission_url: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EnqueueResponse {
    pub job_id: String,
    pub job: PipelineJob,
}

#[derive(Debug, Serialize)]
pub struct RemoveResponse {
    pub removed: bool,
}

impl EnqueueBody {
    fn into_request(self) -> ApiResult<EnqueueRequest> {
        let (Some(file), Some(stage)) = (
            self.file.filter(|f| !f.trim().is_empty()),
            self.stage.filter(|s| !s.trim().is_empty()),
        ) else {
            return Err(ApiError::bad_request("Missing file or type"));
        };

        let mut request = EnqueueRequest::new(file, stage.parse::<Stage>()?);
        request.external_id = self.external_id;
        request.variant = self
            .variant
            .filter(|v| !v.trim().is_empty())
            .map(|v| v.parse::<Variant>())
            .transpose()?;
        request.submission_url = self.submission_url;
        Ok(request)
    }
}

async fn list_queue(State(state): State<AppState>) -> Json<Vec<PipelineJob>> {
    Json(state.queue.list().await)
}

async fn get_queued(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<PipelineJob>> {
    state
        .queue
        .get(&id)
        .await
        .map(Json)
        .ok_or_else(|| ApiError::not_found("Job not found"))
}

async fn enqueue(
    State(state): State<AppState>,
    Json(body): Json<EnqueueBody>,
) -> ApiResult<Json<EnqueueResponse>> {
    let request = body.into_request()?;
    let job = state.queue.enqueue(request).await?;
    Ok(Json(EnqueueResponse {
        job_id: job.id.clone(),
        job,
    }))
}

async fn remove(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<RemoveResponse>> {
    if !state.queue.remove(&id).await {
        return Err(ApiError::not_found("Job not found"));
    }
    Ok(Json(RemoveResponse { removed: true }))
}
