//! Analysis job orchestration: admission, queueing, dispatch, synthesis and
//! batch fan-out.

pub mod adapter;
pub mod admission;
pub mod batch;
pub mod config;
pub mod dispatcher;
pub mod events;
pub mod job;
pub mod module;
pub mod patient;
pub mod queue;
pub mod runtime;
pub mod service;
pub mod store;
pub mod synthesis;

pub use adapter::{ModuleAdapter, ModuleRegistry};
pub use admission::AdmissionControl;
pub use batch::{
    BatchCoordinator, BatchMemberStatus, BatchRejection, BatchRequest,
    BatchStatus, BatchSubmission,
};
pub use config::{
    AuditConfig, OrchestratorConfig, QueueConfig, RetryConfig, SynthesisPolicy,
    TimeoutConfig,
};
pub use dispatcher::{
    AnalysisDispatcher, CancelOutcome, DispatchContext, DispatchStatus,
    JobDispatcher,
};
pub use events::{AuditEventKind, AuditRecord, AuditSink, InProcAuditBus};
pub use job::{
    Actor, AnalysisJob, AnalysisRequest, BatchId, BatchJob, Feedback, JobId,
    JobPriority, JobState, PatientId, StateTransition,
};
pub use module::{
    FailureReason, ModuleKind, ModuleOutcome, ModulePayload, module_set,
};
pub use patient::{InMemoryPatientDirectory, PatientDirectory, PatientSnapshot};
pub use queue::{
    Admission, InMemoryQueueService, QueueEntry, QueueLease, QueueService,
    QueueSnapshot, RejectionReason,
};
pub use runtime::WorkerPool;
pub use service::{
    AnalysisOrchestrator, FeedbackInput, JobStatus, ModuleProgress,
    ModuleProgressStatus, OrchestratorParts,
};
pub use store::{InMemoryJobStore, JobFilter, JobMutation, JobStore};
pub use synthesis::{
    PlannedIntervention, SynthesisArtifact, SynthesisSummary, Synthesizer,
    TreatmentPlanDraft,
};
