//! API route modules.
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | GET | `/api/health` | Liveness |
//! | GET | `/api/jobs` | List process jobs |
//! | GET | `/api/jobs/{id}` | Process job summary |
//! | GET | `/api/jobs/{id}/log` | Full captured output |
//! | GET | `/api/jobs/{id}/stream` | Live output as server-sent events |
//! | POST | `/api/jobs/{id}/stop` | Stop a process job |
//! | POST | `/api/upscale` | Upscale an upload immediately |
//! | GET | `/api/pipeline-queue` | List the backlog |
//! | POST | `/api/pipeline-queue` | Enqueue a pipeline job |
//! | GET | `/api/pipeline-queue/{id}` | Pipeline job |
//! | DELETE | `/api/pipeline-queue/{id}` | Remove a pipeline job |

pub mod health;
pub mod jobs;
pub mod queue;

use axum::Router;

use crate::api::server::AppState;

/// Create the main API router with all routes.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .nest("/api/health", health::router())
        .nest("/api/jobs", jobs::router())
        .nest("/api/upscale", jobs::upscale_router())
        .nest("/api/pipeline-queue", queue::router())
        .with_state(state)
}
