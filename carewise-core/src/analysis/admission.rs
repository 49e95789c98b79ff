use std::{fmt, sync::Arc};

use tracing::{debug, info, warn};

use crate::error::{OrchestratorError, Result};

use super::{
    events::{AuditEventKind, AuditRecord, AuditSink},
    job::AnalysisJob,
    patient::PatientDirectory,
    queue::{Admission, QueueEntry, QueueService, RejectionReason},
    store::JobStore,
};

/// Gate every new job passes before it exists for anyone else.
///
/// The record is staged in the store first so a worker that dequeues it
/// immediately always finds it. Listings only see it once the queue has
/// accepted it; a rejected job is discarded and never surfaces to callers.
#[derive(Clone)]
pub struct AdmissionControl {
    queue: Arc<dyn QueueService>,
    store: Arc<dyn JobStore>,
    patients: Arc<dyn PatientDirectory>,
    audit: Arc<dyn AuditSink>,
}

impl fmt::Debug for AdmissionControl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdmissionControl").finish_non_exhaustive()
    }
}

impl AdmissionControl {
    pub fn new(
        queue: Arc<dyn QueueService>,
        store: Arc<dyn JobStore>,
        patients: Arc<dyn PatientDirectory>,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        Self {
            queue,
            store,
            patients,
            audit,
        }
    }

    pub async fn admit(&self, job: AnalysisJob) -> Result<AnalysisJob> {
        if job.requested_modules.is_empty() {
            return Err(OrchestratorError::Validation(
                "at least one analysis module must be requested".into(),
            ));
        }
        if !self.patients.exists(&job.patient_id).await? {
            let reason = RejectionReason::PatientNotFound;
            return Err(self.reject(job, reason).await);
        }

        let entry = QueueEntry::for_job(&job);
        self.store.stage(job.clone()).await?;

        let admission = match self.enqueue(entry).await {
            Ok(admission) => admission,
            Err(err) => {
                self.store.discard(job.id).await?;
                return Err(err);
            }
        };

        match admission {
            Admission::Accepted { position } => {
                self.store.publish(job.id).await?;
                info!(
                    target: "analysis::queue",
                    job = %job.id,
                    patient = %job.patient_id,
                    attempt = job.attempt,
                    position,
                    "analysis admitted"
                );
                if let Some(transition) = job.transitions.first() {
                    self.audit(AuditRecord::transition(
                        job.id,
                        &job.patient_id,
                        transition,
                    ))
                    .await;
                }
                Ok(job)
            }
            Admission::Rejected(reason) => {
                self.store.discard(job.id).await?;
                Err(self.reject(job, reason).await)
            }
        }
    }

    /// Audits a rejection and turns it into the caller-facing error.
    async fn reject(
        &self,
        job: AnalysisJob,
        reason: RejectionReason,
    ) -> OrchestratorError {
        self.audit(
            AuditRecord::new(
                job.requested_by.clone(),
                AuditEventKind::AdmissionRejected {
                    reason: reason.clone(),
                },
            )
            .with_patient(&job.patient_id),
        )
        .await;
        match reason {
            RejectionReason::PatientNotFound => {
                OrchestratorError::PatientNotFound(job.patient_id)
            }
            RejectionReason::DuplicateInFlight { existing } => {
                OrchestratorError::DuplicateInFlight {
                    patient_id: job.patient_id,
                    existing,
                }
            }
            RejectionReason::QueueSaturated { depth, max_depth } => {
                OrchestratorError::QueueSaturated { depth, max_depth }
            }
        }
    }

    /// A worker writes the terminal record before it frees the patient slot,
    /// so a duplicate pointing at an already terminal job is stale: free the
    /// slot here and try once more.
    async fn enqueue(&self, entry: QueueEntry) -> Result<Admission> {
        let admission = self.queue.enqueue(entry.clone()).await?;
        let Admission::Rejected(RejectionReason::DuplicateInFlight {
            existing,
        }) = admission
        else {
            return Ok(admission);
        };

        match self.store.get(existing).await {
            Ok(job) if job.state.is_terminal() => {
                debug!(
                    target: "analysis::queue",
                    job = %existing,
                    state = %job.state,
                    "releasing stale in-flight slot"
                );
                self.queue.release(existing).await?;
                self.queue.enqueue(entry).await
            }
            _ => Ok(admission),
        }
    }

    async fn audit(&self, record: AuditRecord) {
        if let Err(err) = self.audit.record(record).await {
            warn!(
                target: "analysis::queue",
                error = %err,
                "audit write failed"
            );
        }
    }
}
