use axum::{extract::State, response::Json};

use carewise_core::{
    analysis::{JobStatus, QueueSnapshot},
    api_types::ApiResponse,
};

use crate::infra::{app_state::AppState, errors::AppResult};

pub async fn queue_status_handler(
    State(state): State<AppState>,
) -> AppResult<Json<ApiResponse<QueueSnapshot>>> {
    let snapshot = state.orchestrator().queue_status().await?;
    Ok(Json(ApiResponse::success(snapshot)))
}

pub async fn pending_jobs_handler(
    State(state): State<AppState>,
) -> AppResult<Json<ApiResponse<Vec<JobStatus>>>> {
    let jobs = state.orchestrator().pending_jobs().await?;
    Ok(Json(ApiResponse::success(
        jobs.iter().map(JobStatus::from).collect(),
    )))
}

pub async fn failed_jobs_handler(
    State(state): State<AppState>,
) -> AppResult<Json<ApiResponse<Vec<JobStatus>>>> {
    let jobs = state.orchestrator().failed_jobs().await?;
    Ok(Json(ApiResponse::success(
        jobs.iter().map(JobStatus::from).collect(),
    )))
}
