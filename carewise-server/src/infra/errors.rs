use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use std::fmt;

use carewise_core::{ErrorKind, OrchestratorError, api_types::ApiResponse};

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub message: String,
}

impl AppError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(StatusCode::CONFLICT, message)
    }

    pub fn rate_limited(message: impl Into<String>) -> Self {
        Self::new(StatusCode::TOO_MANY_REQUESTS, message)
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for AppError {}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = Json(ApiResponse::<()>::error(self.message));
        (self.status, body).into_response()
    }
}

impl From<OrchestratorError> for AppError {
    fn from(err: OrchestratorError) -> Self {
        match (&err, err.kind()) {
            (
                OrchestratorError::DuplicateInFlight { .. }
                | OrchestratorError::AdmissionPending { .. },
                _,
            ) => Self::conflict(err.to_string()),
            (_, ErrorKind::Capacity) => Self::rate_limited(err.to_string()),
            (_, ErrorKind::NotFound) => Self::not_found(err.to_string()),
            // Remaining conflicts are illegal requests for the job's state.
            (_, ErrorKind::Validation | ErrorKind::Conflict) => {
                Self::bad_request(err.to_string())
            }
            (_, ErrorKind::Internal) => {
                tracing::error!(error = %err, "orchestrator operation failed");
                Self::internal(err.to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use carewise_core::analysis::{JobId, JobState, PatientId};

    use super::*;

    #[test]
    fn maps_orchestrator_errors_to_statuses() {
        let cases = [
            (
                OrchestratorError::JobNotFound(JobId::new()),
                StatusCode::NOT_FOUND,
            ),
            (
                OrchestratorError::PatientNotFound(PatientId::from("p-9")),
                StatusCode::NOT_FOUND,
            ),
            (
                OrchestratorError::Validation("bad".into()),
                StatusCode::BAD_REQUEST,
            ),
            (
                OrchestratorError::AlreadyTerminal {
                    job_id: JobId::new(),
                    state: JobState::Completed,
                },
                StatusCode::BAD_REQUEST,
            ),
            (
                OrchestratorError::RetryLimitReached {
                    job_id: JobId::new(),
                    attempt: 5,
                },
                StatusCode::BAD_REQUEST,
            ),
            (
                OrchestratorError::DuplicateInFlight {
                    patient_id: PatientId::from("p-1"),
                    existing: JobId::new(),
                },
                StatusCode::CONFLICT,
            ),
            (
                OrchestratorError::AdmissionPending {
                    job_id: JobId::new(),
                    state: JobState::Queued,
                },
                StatusCode::CONFLICT,
            ),
            (
                OrchestratorError::QueueSaturated {
                    depth: 3,
                    max_depth: 3,
                },
                StatusCode::TOO_MANY_REQUESTS,
            ),
            (
                OrchestratorError::Internal("boom".into()),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];

        for (err, status) in cases {
            assert_eq!(AppError::from(err).status, status);
        }
    }
}
