use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
    sync::Arc,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{
    api_types::{Page, PageRequest},
    error::{OrchestratorError, Result},
};

use super::{
    adapter::ModuleRegistry,
    admission::AdmissionControl,
    batch::{BatchCoordinator, BatchRequest, BatchStatus, BatchSubmission},
    config::OrchestratorConfig,
    dispatcher::{
        AnalysisDispatcher, CancelOutcome, DispatchContext, JobDispatcher,
    },
    events::{AuditEventKind, AuditRecord, AuditSink, InProcAuditBus},
    job::{
        Actor, AnalysisJob, AnalysisRequest, BatchId, Feedback, JobId,
        JobPriority, JobState, PatientId,
    },
    module::{FailureReason, ModuleKind, ModuleOutcome},
    patient::PatientDirectory,
    queue::{InMemoryQueueService, QueueService, QueueSnapshot},
    runtime::WorkerPool,
    store::{InMemoryJobStore, JobFilter, JobStore},
    synthesis::{SynthesisArtifact, Synthesizer},
};

const MAX_FEEDBACK_CHARS: usize = 4_000;

/// Per-module progress as exposed by status reads.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ModuleProgress {
    pub status: ModuleProgressStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureReason>,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModuleProgressStatus {
    Pending,
    Succeeded,
    Failed,
}

impl From<&ModuleOutcome> for ModuleProgress {
    fn from(outcome: &ModuleOutcome) -> Self {
        match outcome {
            ModuleOutcome::Pending => Self {
                status: ModuleProgressStatus::Pending,
                failure: None,
            },
            ModuleOutcome::Succeeded(_) => Self {
                status: ModuleProgressStatus::Succeeded,
                failure: None,
            },
            ModuleOutcome::Failed(reason) => Self {
                status: ModuleProgressStatus::Failed,
                failure: Some(reason.clone()),
            },
        }
    }
}

/// Lightweight status view: state plus per-module progress.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct JobStatus {
    pub job_id: JobId,
    pub patient_id: PatientId,
    pub state: JobState,
    pub priority: JobPriority,
    pub attempt: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retried_from: Option<JobId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_id: Option<BatchId>,
    pub modules: BTreeMap<ModuleKind, ModuleProgress>,
    pub has_result: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<&AnalysisJob> for JobStatus {
    fn from(job: &AnalysisJob) -> Self {
        Self {
            job_id: job.id,
            patient_id: job.patient_id.clone(),
            state: job.state,
            priority: job.priority,
            attempt: job.attempt,
            retried_from: job.retried_from,
            batch_id: job.batch_id,
            modules: job
                .module_results
                .iter()
                .map(|(kind, outcome)| (*kind, ModuleProgress::from(outcome)))
                .collect(),
            has_result: job.synthesis.is_some(),
            failure: job.failure.clone(),
            created_at: job.created_at,
            updated_at: job.updated_at,
        }
    }
}

/// Advisory clinician feedback as submitted by callers.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FeedbackInput {
    #[serde(default)]
    pub rating: Option<u8>,
    #[serde(default)]
    pub comment: String,
}

/// Pluggable collaborators for [`AnalysisOrchestrator::with_parts`].
#[derive(Clone)]
pub struct OrchestratorParts {
    pub queue: Arc<dyn QueueService>,
    pub store: Arc<dyn JobStore>,
    pub patients: Arc<dyn PatientDirectory>,
    pub audit: Arc<dyn AuditSink>,
    pub modules: ModuleRegistry,
}

impl OrchestratorParts {
    /// In-memory queue, store and audit bus around the given collaborators.
    pub fn in_memory(
        config: &OrchestratorConfig,
        patients: Arc<dyn PatientDirectory>,
        modules: ModuleRegistry,
    ) -> Self {
        Self {
            queue: Arc::new(InMemoryQueueService::new(config.queue.max_depth)),
            store: Arc::new(InMemoryJobStore::new()),
            patients,
            audit: Arc::new(InProcAuditBus::new(config.audit.channel_capacity)),
            modules,
        }
    }
}

/// Public contract consumed by controllers. Reads come straight from the
/// store; every state change goes through the dispatcher.
pub struct AnalysisOrchestrator {
    config: OrchestratorConfig,
    queue: Arc<dyn QueueService>,
    store: Arc<dyn JobStore>,
    audit: Arc<dyn AuditSink>,
    admission: AdmissionControl,
    dispatcher: Arc<AnalysisDispatcher>,
    batches: BatchCoordinator,
    workers: WorkerPool,
    // Serializes the lineage check and admission of retries.
    retry_lock: Mutex<()>,
}

impl fmt::Debug for AnalysisOrchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AnalysisOrchestrator")
            .field("config", &self.config)
            .field("dispatcher", &self.dispatcher)
            .field("workers", &self.workers)
            .finish_non_exhaustive()
    }
}

impl AnalysisOrchestrator {
    pub fn new(
        config: OrchestratorConfig,
        patients: Arc<dyn PatientDirectory>,
        modules: ModuleRegistry,
    ) -> Self {
        let parts = OrchestratorParts::in_memory(&config, patients, modules);
        Self::with_parts(config, parts)
    }

    pub fn with_parts(
        config: OrchestratorConfig,
        parts: OrchestratorParts,
    ) -> Self {
        let shutdown = CancellationToken::new();
        let OrchestratorParts {
            queue,
            store,
            patients,
            audit,
            modules,
        } = parts;

        let admission = AdmissionControl::new(
            Arc::clone(&queue),
            Arc::clone(&store),
            Arc::clone(&patients),
            Arc::clone(&audit),
        );
        let dispatcher = Arc::new(AnalysisDispatcher::new(
            DispatchContext {
                queue: Arc::clone(&queue),
                store: Arc::clone(&store),
                patients,
                audit: Arc::clone(&audit),
                modules,
            },
            Synthesizer::new(config.synthesis.clone()),
            config.timeouts,
            shutdown.clone(),
        ));
        let batches = BatchCoordinator::new(
            admission.clone(),
            Arc::clone(&store),
            Arc::clone(&audit),
        );
        let workers = WorkerPool::new(
            config.queue.clone(),
            Arc::clone(&queue),
            Arc::clone(&dispatcher) as Arc<dyn JobDispatcher>,
            shutdown,
        );

        Self {
            config,
            queue,
            store,
            audit,
            admission,
            dispatcher,
            batches,
            workers,
            retry_lock: Mutex::new(()),
        }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn dispatcher(&self) -> Arc<AnalysisDispatcher> {
        Arc::clone(&self.dispatcher)
    }

    pub async fn start(&self) -> Result<()> {
        self.workers.start().await
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.workers.shutdown().await
    }

    pub async fn is_running(&self) -> bool {
        self.workers.is_running().await
    }

    /// Admits a new analysis. No job exists if this returns an error.
    pub async fn request_analysis(
        &self,
        request: AnalysisRequest,
    ) -> Result<AnalysisJob> {
        self.admission.admit(AnalysisJob::new(request)).await
    }

    pub async fn get_job(&self, job_id: JobId) -> Result<AnalysisJob> {
        self.store.get(job_id).await
    }

    pub async fn status(&self, job_id: JobId) -> Result<JobStatus> {
        let job = self.store.get(job_id).await?;
        Ok(JobStatus::from(&job))
    }

    pub async fn cancel(
        &self,
        job_id: JobId,
        actor: Actor,
    ) -> Result<CancelOutcome> {
        let outcome = self.dispatcher.cancel(job_id, actor).await?;
        info!(
            target: "analysis::dispatch",
            job = %job_id,
            outcome = outcome_label(&outcome),
            "cancel accepted"
        );
        Ok(outcome)
    }

    /// Creates a follow-up job for a `Failed` or `PartiallyFailed` one. The
    /// original record is never touched.
    ///
    /// A job has at most one follow-up: retrying it again returns the job
    /// already issued, so repeated calls neither duplicate work nor step
    /// around `retry.max_attempts`. Further attempts go through the
    /// follow-up itself.
    pub async fn retry(
        &self,
        job_id: JobId,
        modules: Option<BTreeSet<ModuleKind>>,
        actor: Actor,
    ) -> Result<AnalysisJob> {
        let _guard = self.retry_lock.lock().await;

        let original = self.store.get(job_id).await?;
        if !original.state.is_retryable() {
            return Err(OrchestratorError::NotRetryable {
                job_id,
                state: original.state,
            });
        }
        let issued = self.store.list(&JobFilter::retries_of(job_id)).await?;
        if let Some(existing) = issued.into_iter().next() {
            info!(
                target: "analysis::queue",
                job = %existing.id,
                retried_from = %job_id,
                "retry already issued"
            );
            return Ok(existing);
        }
        if original.attempt >= self.config.retry.max_attempts {
            return Err(OrchestratorError::RetryLimitReached {
                job_id,
                attempt: original.attempt,
            });
        }

        let modules = match modules {
            None => original.requested_modules.clone(),
            Some(narrowed) => {
                if narrowed.is_empty() {
                    return Err(OrchestratorError::Validation(
                        "retry module set must not be empty".into(),
                    ));
                }
                if !narrowed.is_subset(&original.requested_modules) {
                    return Err(OrchestratorError::Validation(
                        "retry modules must be a subset of the original \
                         request"
                            .into(),
                    ));
                }
                narrowed
            }
        };

        let job = self
            .admission
            .admit(AnalysisJob::retry_of(&original, modules, actor))
            .await?;
        info!(
            target: "analysis::queue",
            job = %job.id,
            retried_from = %job_id,
            attempt = job.attempt,
            "retry admitted"
        );
        Ok(job)
    }

    pub async fn result(&self, job_id: JobId) -> Result<SynthesisArtifact> {
        let job = self.store.get(job_id).await?;
        match job.synthesis {
            Some(artifact) if job.state.has_synthesis() => Ok(artifact),
            _ => Err(OrchestratorError::NotReady {
                job_id,
                state: job.state,
            }),
        }
    }

    pub async fn module_result(
        &self,
        job_id: JobId,
        module: ModuleKind,
    ) -> Result<ModuleOutcome> {
        let job = self.store.get(job_id).await?;
        job.module_results
            .get(&module)
            .cloned()
            .ok_or(OrchestratorError::ModuleNotRequested { job_id, module })
    }

    /// Stores advisory feedback. The job's state and results are untouched.
    pub async fn provide_feedback(
        &self,
        job_id: JobId,
        input: FeedbackInput,
        author: Actor,
    ) -> Result<AnalysisJob> {
        if let Some(rating) = input.rating
            && !(1..=5).contains(&rating)
        {
            return Err(OrchestratorError::Validation(
                "rating must be between 1 and 5".into(),
            ));
        }
        let comment = input.comment.trim().to_string();
        if comment.is_empty() && input.rating.is_none() {
            return Err(OrchestratorError::Validation(
                "feedback needs a rating or a comment".into(),
            ));
        }
        if comment.chars().count() > MAX_FEEDBACK_CHARS {
            return Err(OrchestratorError::Validation(format!(
                "feedback comment exceeds {MAX_FEEDBACK_CHARS} characters"
            )));
        }

        let feedback = Feedback {
            author: author.clone(),
            rating: input.rating,
            comment,
            submitted_at: Utc::now(),
        };
        let job = self
            .store
            .modify(
                job_id,
                Box::new(move |job: &mut AnalysisJob| {
                    job.feedback.push(feedback);
                    Ok(())
                }),
            )
            .await?;

        let record = AuditRecord::new(
            author,
            AuditEventKind::FeedbackRecorded {
                rating: input.rating,
            },
        )
        .with_job(job_id)
        .with_patient(&job.patient_id);
        if let Err(err) = self.audit.record(record).await {
            warn!(
                target: "analysis::audit",
                job = %job_id,
                error = %err,
                "audit write failed"
            );
        }
        Ok(job)
    }

    pub async fn queue_status(&self) -> Result<QueueSnapshot> {
        self.queue.snapshot().await
    }

    pub async fn list_jobs(
        &self,
        filter: &JobFilter,
        page: PageRequest,
    ) -> Result<Page<AnalysisJob>> {
        let jobs = self.store.list(filter).await?;
        Ok(Page::from_vec(jobs, page))
    }

    /// Queued and processing jobs, newest first.
    pub async fn pending_jobs(&self) -> Result<Vec<AnalysisJob>> {
        self.jobs_in_states(&[JobState::Queued, JobState::Processing])
            .await
    }

    /// Jobs eligible for retry, newest first.
    pub async fn failed_jobs(&self) -> Result<Vec<AnalysisJob>> {
        self.jobs_in_states(&[JobState::Failed, JobState::PartiallyFailed])
            .await
    }

    /// Full records for offline audit.
    pub async fn export(&self, filter: &JobFilter) -> Result<Vec<AnalysisJob>> {
        self.store.list(filter).await
    }

    pub async fn submit_batch(
        &self,
        request: BatchRequest,
    ) -> Result<BatchSubmission> {
        self.batches.submit(request).await
    }

    pub async fn get_batch(&self, batch_id: BatchId) -> Result<BatchStatus> {
        self.batches.status(batch_id).await
    }

    async fn jobs_in_states(
        &self,
        states: &[JobState],
    ) -> Result<Vec<AnalysisJob>> {
        let jobs = self.store.list(&JobFilter::default()).await?;
        Ok(jobs
            .into_iter()
            .filter(|job| states.contains(&job.state))
            .collect())
    }
}

fn outcome_label(outcome: &CancelOutcome) -> &'static str {
    match outcome {
        CancelOutcome::Cancelled(_) => "cancelled",
        CancelOutcome::Requested { .. } => "requested",
    }
}
