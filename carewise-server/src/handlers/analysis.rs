use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json},
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use carewise_core::{
    analysis::{
        Actor, AnalysisJob, AnalysisRequest, BatchId, CancelOutcome, Feedback, FeedbackInput,
        JobFilter, JobId, JobPriority, JobState, JobStatus, ModuleKind, ModuleOutcome, PatientId,
        SynthesisArtifact,
    },
    api_types::{ApiResponse, Page, PageRequest},
};

use super::parse_modules;
use crate::infra::{actor::RequestActor, app_state::AppState, errors::AppResult};

#[derive(Debug, Deserialize)]
pub struct CreateAnalysisRequest {
    pub patient_id: String,
    pub modules: Vec<String>,
    #[serde(default)]
    pub priority: JobPriority,
}

#[derive(Debug, Default, Deserialize)]
pub struct RetryAnalysisRequest {
    /// Narrow the retry to a subset of the original modules.
    #[serde(default)]
    pub modules: Option<Vec<String>>,
}

/// Query string shared by listing and export.
#[derive(Debug, Default, Deserialize)]
pub struct AnalysisQuery {
    pub patient_id: Option<String>,
    pub state: Option<String>,
    pub requested_by: Option<String>,
    pub batch_id: Option<Uuid>,
    pub retried_from: Option<Uuid>,
    pub page: Option<usize>,
    pub per_page: Option<usize>,
}

impl AnalysisQuery {
    fn filter(&self) -> carewise_core::Result<JobFilter> {
        Ok(JobFilter {
            patient_id: self
                .patient_id
                .as_deref()
                .map(PatientId::try_new)
                .transpose()?,
            state: self
                .state
                .as_deref()
                .map(str::parse::<JobState>)
                .transpose()?,
            requested_by: self.requested_by.as_deref().map(Actor::new),
            batch_id: self.batch_id.map(BatchId),
            retried_from: self.retried_from.map(JobId),
        })
    }

    fn page_request(&self) -> PageRequest {
        let defaults = PageRequest::default();
        PageRequest::new(
            self.page.unwrap_or(defaults.page),
            self.per_page.unwrap_or(defaults.per_page),
        )
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelDisposition {
    Cancelled,
    Requested,
}

#[derive(Debug, Serialize)]
pub struct CancelResponse {
    pub job_id: JobId,
    pub outcome: CancelDisposition,
    pub state: JobState,
}

pub async fn create_analysis_handler(
    State(state): State<AppState>,
    RequestActor(actor): RequestActor,
    Json(request): Json<CreateAnalysisRequest>,
) -> AppResult<impl IntoResponse> {
    let request = AnalysisRequest {
        patient_id: PatientId::try_new(request.patient_id)?,
        modules: parse_modules(&request.modules)?,
        requested_by: actor,
        priority: request.priority,
    };

    let job = state.orchestrator().request_analysis(request).await?;

    Ok((
        StatusCode::CREATED,
        Json(ApiResponse::success(JobStatus::from(&job))),
    ))
}

pub async fn list_analyses_handler(
    State(state): State<AppState>,
    Query(query): Query<AnalysisQuery>,
) -> AppResult<Json<ApiResponse<Vec<JobStatus>>>> {
    let page = state
        .orchestrator()
        .list_jobs(&query.filter()?, query.page_request())
        .await?;

    let page = Page {
        items: page.items.iter().map(JobStatus::from).collect(),
        pagination: page.pagination,
    };
    Ok(Json(ApiResponse::page(page)))
}

pub async fn export_analyses_handler(
    State(state): State<AppState>,
    Query(query): Query<AnalysisQuery>,
) -> AppResult<Json<ApiResponse<Vec<AnalysisJob>>>> {
    let jobs = state.orchestrator().export(&query.filter()?).await?;
    Ok(Json(ApiResponse::success(jobs)))
}

pub async fn get_analysis_handler(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> AppResult<Json<ApiResponse<JobStatus>>> {
    let status = state.orchestrator().status(JobId(id)).await?;
    Ok(Json(ApiResponse::success(status)))
}

pub async fn cancel_analysis_handler(
    State(state): State<AppState>,
    RequestActor(actor): RequestActor,
    Path(id): Path<Uuid>,
) -> AppResult<impl IntoResponse> {
    let (status, body) = match state.orchestrator().cancel(JobId(id), actor).await? {
        CancelOutcome::Cancelled(job) => (
            StatusCode::OK,
            CancelResponse {
                job_id: job.id,
                outcome: CancelDisposition::Cancelled,
                state: job.state,
            },
        ),
        CancelOutcome::Requested { job_id } => (
            StatusCode::ACCEPTED,
            CancelResponse {
                job_id,
                outcome: CancelDisposition::Requested,
                state: JobState::Processing,
            },
        ),
    };
    Ok((status, Json(ApiResponse::success(body))))
}

pub async fn retry_analysis_handler(
    State(state): State<AppState>,
    RequestActor(actor): RequestActor,
    Path(id): Path<Uuid>,
    body: Option<Json<RetryAnalysisRequest>>,
) -> AppResult<impl IntoResponse> {
    let request = body.map(|Json(request)| request).unwrap_or_default();
    let modules = request
        .modules
        .as_deref()
        .map(parse_modules)
        .transpose()?;

    let job = state.orchestrator().retry(JobId(id), modules, actor).await?;

    Ok((
        StatusCode::CREATED,
        Json(ApiResponse::success(JobStatus::from(&job))),
    ))
}

pub async fn module_result_handler(
    State(state): State<AppState>,
    Path((id, module)): Path<(Uuid, String)>,
) -> AppResult<Json<ApiResponse<ModuleOutcome>>> {
    let module: ModuleKind = module.parse()?;
    let outcome = state.orchestrator().module_result(JobId(id), module).await?;
    Ok(Json(ApiResponse::success(outcome)))
}

pub async fn analysis_result_handler(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> AppResult<Json<ApiResponse<SynthesisArtifact>>> {
    let artifact = state.orchestrator().result(JobId(id)).await?;
    Ok(Json(ApiResponse::success(artifact)))
}

pub async fn feedback_handler(
    State(state): State<AppState>,
    RequestActor(actor): RequestActor,
    Path(id): Path<Uuid>,
    Json(input): Json<FeedbackInput>,
) -> AppResult<impl IntoResponse> {
    let job = state
        .orchestrator()
        .provide_feedback(JobId(id), input, actor)
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(ApiResponse::<Vec<Feedback>>::success(job.feedback)),
    ))
}
