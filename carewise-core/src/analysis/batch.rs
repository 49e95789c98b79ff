use std::{
    collections::{BTreeMap, BTreeSet, HashSet},
    fmt,
    sync::Arc,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{ErrorKind, OrchestratorError, Result};

use super::{
    admission::AdmissionControl,
    events::{AuditEventKind, AuditRecord, AuditSink},
    job::{
        Actor, AnalysisJob, AnalysisRequest, BatchId, BatchJob, JobId,
        JobPriority,
        JobState, PatientId,
    },
    module::ModuleKind,
    store::JobStore,
};

/// Input for a multi-patient submission.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BatchRequest {
    pub patient_ids: Vec<PatientId>,
    pub modules: BTreeSet<ModuleKind>,
    pub requested_by: Actor,
    #[serde(default)]
    pub priority: JobPriority,
}

/// A patient whose member job could not be admitted.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BatchRejection {
    pub patient_id: PatientId,
    pub error: String,
    /// True when the caller may resubmit this patient later unchanged.
    pub transient: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BatchSubmission {
    pub batch_id: BatchId,
    pub member_job_ids: Vec<JobId>,
    pub rejected: Vec<BatchRejection>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BatchMemberStatus {
    pub job_id: JobId,
    pub patient_id: PatientId,
    pub state: JobState,
}

/// Live view over a batch's members, rebuilt on every read.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BatchStatus {
    pub batch_id: BatchId,
    pub created_by: Actor,
    pub created_at: DateTime<Utc>,
    pub members: Vec<BatchMemberStatus>,
    pub counts: BTreeMap<JobState, usize>,
    pub total: usize,
}

impl BatchStatus {
    pub fn is_settled(&self) -> bool {
        self.members.iter().all(|member| member.state.is_terminal())
    }
}

/// Fans one request out into independent member jobs. There is no
/// atomicity across members.
#[derive(Clone)]
pub struct BatchCoordinator {
    admission: AdmissionControl,
    store: Arc<dyn JobStore>,
    audit: Arc<dyn AuditSink>,
}

impl fmt::Debug for BatchCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BatchCoordinator")
            .field("admission", &self.admission)
            .finish_non_exhaustive()
    }
}

impl BatchCoordinator {
    pub fn new(
        admission: AdmissionControl,
        store: Arc<dyn JobStore>,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        Self {
            admission,
            store,
            audit,
        }
    }

    pub async fn submit(
        &self,
        request: BatchRequest,
    ) -> Result<BatchSubmission> {
        if request.patient_ids.is_empty() {
            return Err(OrchestratorError::Validation(
                "a batch needs at least one patient".into(),
            ));
        }
        if request.modules.is_empty() {
            return Err(OrchestratorError::Validation(
                "at least one analysis module must be requested".into(),
            ));
        }

        let batch_id = BatchId::new();
        let mut seen: HashSet<PatientId> = HashSet::new();
        let mut member_job_ids: Vec<JobId> = Vec::new();
        let mut rejected = Vec::new();

        for patient_id in request.patient_ids {
            if !seen.insert(patient_id.clone()) {
                continue;
            }

            let job = AnalysisJob::new(AnalysisRequest {
                patient_id: patient_id.clone(),
                modules: request.modules.clone(),
                requested_by: request.requested_by.clone(),
                priority: request.priority,
            })
            .with_batch(batch_id);

            match self.admission.admit(job).await {
                Ok(job) => member_job_ids.push(job.id),
                Err(OrchestratorError::DuplicateInFlight { existing, .. }) => {
                    if !member_job_ids.contains(&existing) {
                        member_job_ids.push(existing);
                    }
                }
                Err(err) if err.kind() == ErrorKind::Internal => {
                    return Err(err);
                }
                Err(err) => rejected.push(BatchRejection {
                    patient_id,
                    transient: err.is_transient(),
                    error: err.to_string(),
                }),
            }
        }

        let batch = BatchJob {
            batch_id,
            member_job_ids: member_job_ids.clone(),
            created_by: request.requested_by.clone(),
            created_at: Utc::now(),
        };
        self.store.insert_batch(batch).await?;

        info!(
            target: "analysis::batch",
            %batch_id,
            members = member_job_ids.len(),
            rejected = rejected.len(),
            "batch submitted"
        );
        let record = AuditRecord::new(
            request.requested_by,
            AuditEventKind::BatchCreated {
                batch_id,
                members: member_job_ids.len(),
                rejected: rejected.len(),
            },
        );
        if let Err(err) = self.audit.record(record).await {
            warn!(
                target: "analysis::batch",
                %batch_id,
                error = %err,
                "audit write failed"
            );
        }

        Ok(BatchSubmission {
            batch_id,
            member_job_ids,
            rejected,
        })
    }

    pub async fn status(&self, batch_id: BatchId) -> Result<BatchStatus> {
        let batch = self.store.get_batch(batch_id).await?;

        let mut members = Vec::with_capacity(batch.member_job_ids.len());
        let mut counts: BTreeMap<JobState, usize> = BTreeMap::new();
        for job_id in &batch.member_job_ids {
            let job = self.store.get(*job_id).await?;
            *counts.entry(job.state).or_default() += 1;
            members.push(BatchMemberStatus {
                job_id: job.id,
                patient_id: job.patient_id,
                state: job.state,
            });
        }

        Ok(BatchStatus {
            batch_id,
            created_by: batch.created_by,
            created_at: batch.created_at,
            total: members.len(),
            members,
            counts,
        })
    }
}
