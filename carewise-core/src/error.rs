use thiserror::Error;

use crate::analysis::{
    job::{BatchId, JobId, JobState, PatientId},
    module::ModuleKind,
};

/// Coarse classification used by callers that only need to know which
/// family an error belongs to (HTTP status mapping, metrics, audit).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ErrorKind {
    Validation,
    NotFound,
    Conflict,
    Capacity,
    Internal,
}

#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("Invalid request: {0}")]
    Validation(String),

    #[error("Patient not found: {0}")]
    PatientNotFound(PatientId),

    #[error("Analysis job not found: {0}")]
    JobNotFound(JobId),

    #[error("Batch not found: {0}")]
    BatchNotFound(BatchId),

    #[error("Module {module} was not requested for job {job_id}")]
    ModuleNotRequested { job_id: JobId, module: ModuleKind },

    #[error("Patient {patient_id} already has analysis {existing} in flight")]
    DuplicateInFlight {
        patient_id: PatientId,
        existing: JobId,
    },

    #[error("Analysis queue saturated ({depth}/{max_depth}); retry later")]
    QueueSaturated { depth: usize, max_depth: usize },

    #[error("Job {job_id} is already terminal ({state})")]
    AlreadyTerminal { job_id: JobId, state: JobState },

    #[error("Job {job_id} is still being admitted ({state}); retry shortly")]
    AdmissionPending { job_id: JobId, state: JobState },

    #[error("Job {job_id} cannot be retried from state {state}")]
    NotRetryable { job_id: JobId, state: JobState },

    #[error("Job {job_id} reached the retry ceiling ({attempt} attempts)")]
    RetryLimitReached { job_id: JobId, attempt: u32 },

    #[error("Result for job {job_id} is not ready ({state})")]
    NotReady { job_id: JobId, state: JobState },

    #[error("Illegal transition for job {job_id}: {from} -> {to}")]
    IllegalTransition {
        job_id: JobId,
        from: JobState,
        to: JobState,
    },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl OrchestratorError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            OrchestratorError::Validation(_)
            | OrchestratorError::ModuleNotRequested { .. } => {
                ErrorKind::Validation
            }
            OrchestratorError::PatientNotFound(_)
            | OrchestratorError::JobNotFound(_)
            | OrchestratorError::BatchNotFound(_) => ErrorKind::NotFound,
            OrchestratorError::DuplicateInFlight { .. }
            | OrchestratorError::AdmissionPending { .. }
            | OrchestratorError::AlreadyTerminal { .. }
            | OrchestratorError::NotRetryable { .. }
            | OrchestratorError::RetryLimitReached { .. }
            | OrchestratorError::NotReady { .. }
            | OrchestratorError::IllegalTransition { .. } => {
                ErrorKind::Conflict
            }
            OrchestratorError::QueueSaturated { .. } => ErrorKind::Capacity,
            OrchestratorError::Serialization(_)
            | OrchestratorError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// True for errors the caller can resolve by simply retrying later.
    pub fn is_transient(&self) -> bool {
        matches!(self.kind(), ErrorKind::Capacity)
            || matches!(self, OrchestratorError::AdmissionPending { .. })
    }
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;
