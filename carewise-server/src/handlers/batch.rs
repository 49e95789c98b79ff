use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json},
};
use serde::Deserialize;
use uuid::Uuid;

use carewise_core::{
    analysis::{BatchId, BatchRequest, BatchStatus, JobPriority, PatientId},
    api_types::ApiResponse,
};

use super::parse_modules;
use crate::infra::{actor::RequestActor, app_state::AppState, errors::AppResult};

#[derive(Debug, Deserialize)]
pub struct CreateBatchRequest {
    pub patient_ids: Vec<String>,
    pub modules: Vec<String>,
    #[serde(default)]
    pub priority: JobPriority,
}

pub async fn create_batch_handler(
    State(state): State<AppState>,
    RequestActor(actor): RequestActor,
    Json(request): Json<CreateBatchRequest>,
) -> AppResult<impl IntoResponse> {
    let patient_ids = request
        .patient_ids
        .into_iter()
        .map(PatientId::try_new)
        .collect::<carewise_core::Result<Vec<_>>>()?;

    let submission = state
        .orchestrator()
        .submit_batch(BatchRequest {
            patient_ids,
            modules: parse_modules(&request.modules)?,
            requested_by: actor,
            priority: request.priority,
        })
        .await?;

    Ok((StatusCode::CREATED, Json(ApiResponse::success(submission))))
}

pub async fn get_batch_handler(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> AppResult<Json<ApiResponse<BatchStatus>>> {
    let status = state.orchestrator().get_batch(BatchId(id)).await?;
    Ok(Json(ApiResponse::success(status)))
}
