use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{OrchestratorError, Result};

use super::{
    module::{ModuleKind, ModuleOutcome},
    synthesis::SynthesisArtifact,
};

/// Unique identifier for analysis jobs.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub Uuid);

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier grouping member jobs of one batch submission.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BatchId(pub Uuid);

impl Default for BatchId {
    fn default() -> Self {
        Self::new()
    }
}

impl BatchId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl fmt::Display for BatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque patient reference owned by the patient record service.
#[derive(
    Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct PatientId(String);

impl PatientId {
    pub fn try_new(raw: impl Into<String>) -> Result<Self> {
        let raw = raw.into();
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(OrchestratorError::Validation(
                "patient id must not be empty".into(),
            ));
        }
        if trimmed.len() > 128 || trimmed.chars().any(char::is_control) {
            return Err(OrchestratorError::Validation(format!(
                "malformed patient id '{trimmed}'"
            )));
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for PatientId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for PatientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Who caused something to happen: a user id or a system component.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Actor(String);

impl Actor {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn anonymous() -> Self {
        Self("anonymous".into())
    }

    pub fn dispatcher() -> Self {
        Self("system:dispatcher".into())
    }

    pub fn synthesizer() -> Self {
        Self("system:synthesizer".into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Actor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Priority bands. Lower discriminant is dispatched first.
#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    Eq,
    PartialEq,
    Hash,
    Ord,
    PartialOrd,
    Serialize,
    Deserialize,
)]
#[repr(u8)]
pub enum JobPriority {
    P0 = 0,
    #[default]
    P1 = 1,
    P2 = 2,
    P3 = 3,
}

impl JobPriority {
    pub fn rank(self) -> u8 {
        self as u8
    }
}

/// Lifecycle states of an analysis job.
#[derive(
    Clone,
    Copy,
    Debug,
    Eq,
    PartialEq,
    Hash,
    Ord,
    PartialOrd,
    Serialize,
    Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Processing,
    PartiallyFailed,
    Completed,
    Failed,
    Cancelled,
}

impl JobState {
    pub fn all_states() -> &'static [Self] {
        &[
            JobState::Queued,
            JobState::Processing,
            JobState::PartiallyFailed,
            JobState::Completed,
            JobState::Failed,
            JobState::Cancelled,
        ]
    }

    /// Queued or Processing: counts against the per-patient admission gate.
    pub fn is_in_flight(self) -> bool {
        matches!(self, JobState::Queued | JobState::Processing)
    }

    /// No further automatic processing happens once a job is here.
    pub fn is_terminal(self) -> bool {
        !self.is_in_flight()
    }

    pub fn is_retryable(self) -> bool {
        matches!(self, JobState::Failed | JobState::PartiallyFailed)
    }

    pub fn has_synthesis(self) -> bool {
        matches!(self, JobState::Completed | JobState::PartiallyFailed)
    }

    pub fn can_transition_to(self, next: JobState) -> bool {
        use JobState::*;
        matches!(
            (self, next),
            (Queued, Processing)
                | (Queued, Cancelled)
                | (Processing, Completed)
                | (Processing, PartiallyFailed)
                | (Processing, Failed)
                | (Processing, Cancelled)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Queued => "queued",
            JobState::Processing => "processing",
            JobState::PartiallyFailed => "partially_failed",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobState {
    type Err = OrchestratorError;

    fn from_str(s: &str) -> Result<Self> {
        JobState::all_states()
            .iter()
            .copied()
            .find(|state| state.as_str() == s.trim())
            .ok_or_else(|| {
                OrchestratorError::Validation(format!(
                    "unknown job state '{s}'"
                ))
            })
    }
}

/// One entry of a job's ordered state history.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct StateTransition {
    pub from: Option<JobState>,
    pub to: JobState,
    pub at: DateTime<Utc>,
    pub actor: Actor,
}

/// Advisory clinician feedback stored alongside a job.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Feedback {
    pub author: Actor,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rating: Option<u8>,
    pub comment: String,
    pub submitted_at: DateTime<Utc>,
}

/// Caller-facing parameters of a new analysis request.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AnalysisRequest {
    pub patient_id: PatientId,
    pub modules: BTreeSet<ModuleKind>,
    pub requested_by: Actor,
    #[serde(default)]
    pub priority: JobPriority,
}

/// Authoritative record of one analysis of one patient.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AnalysisJob {
    pub id: JobId,
    pub patient_id: PatientId,
    pub requested_modules: BTreeSet<ModuleKind>,
    pub requested_by: Actor,
    pub priority: JobPriority,
    pub state: JobState,
    pub module_results: BTreeMap<ModuleKind, ModuleOutcome>,
    pub attempt: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retried_from: Option<JobId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_id: Option<BatchId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub synthesis: Option<SynthesisArtifact>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
    #[serde(default)]
    pub feedback: Vec<Feedback>,
    pub transitions: Vec<StateTransition>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl AnalysisJob {
    pub fn new(request: AnalysisRequest) -> Self {
        let now = Utc::now();
        let module_results = request
            .modules
            .iter()
            .map(|kind| (*kind, ModuleOutcome::Pending))
            .collect();
        Self {
            id: JobId::new(),
            patient_id: request.patient_id,
            requested_modules: request.modules,
            requested_by: request.requested_by.clone(),
            priority: request.priority,
            state: JobState::Queued,
            module_results,
            attempt: 1,
            retried_from: None,
            batch_id: None,
            synthesis: None,
            failure: None,
            feedback: Vec::new(),
            transitions: vec![StateTransition {
                from: None,
                to: JobState::Queued,
                at: now,
                actor: request.requested_by,
            }],
            created_at: now,
            updated_at: now,
            started_at: None,
            finished_at: None,
        }
    }

    /// Builds the follow-up job for a retry. The original is left untouched.
    pub fn retry_of(
        original: &AnalysisJob,
        modules: BTreeSet<ModuleKind>,
        requested_by: Actor,
    ) -> Self {
        let mut job = AnalysisJob::new(AnalysisRequest {
            patient_id: original.patient_id.clone(),
            modules,
            requested_by,
            priority: original.priority,
        });
        job.attempt = original.attempt.saturating_add(1);
        job.retried_from = Some(original.id);
        job
    }

    pub fn with_batch(mut self, batch_id: BatchId) -> Self {
        self.batch_id = Some(batch_id);
        self
    }

    /// Applies a lifecycle transition, rejecting anything the state machine
    /// does not allow.
    pub fn transition(
        &mut self,
        to: JobState,
        actor: Actor,
    ) -> Result<StateTransition> {
        if !self.state.can_transition_to(to) {
            return Err(OrchestratorError::IllegalTransition {
                job_id: self.id,
                from: self.state,
                to,
            });
        }
        let now = Utc::now();
        let record = StateTransition {
            from: Some(self.state),
            to,
            at: now,
            actor,
        };
        self.state = to;
        self.updated_at = now;
        if to == JobState::Processing {
            self.started_at = Some(now);
        }
        if to.is_terminal() {
            self.finished_at = Some(now);
        }
        self.transitions.push(record.clone());
        Ok(record)
    }

    pub fn succeeded_modules(&self) -> BTreeSet<ModuleKind> {
        self.module_results
            .iter()
            .filter(|(_, outcome)| outcome.is_succeeded())
            .map(|(kind, _)| *kind)
            .collect()
    }

    pub fn failed_modules(&self) -> BTreeSet<ModuleKind> {
        self.module_results
            .iter()
            .filter(|(_, outcome)| outcome.is_failed())
            .map(|(kind, _)| *kind)
            .collect()
    }

    pub fn pending_modules(&self) -> BTreeSet<ModuleKind> {
        self.module_results
            .iter()
            .filter(|(_, outcome)| outcome.is_pending())
            .map(|(kind, _)| *kind)
            .collect()
    }

    pub fn reached(&self, state: JobState) -> bool {
        self.transitions.iter().any(|t| t.to == state)
    }
}

/// Batch grouping: a reporting view over member jobs, never a state machine.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BatchJob {
    pub batch_id: BatchId,
    pub member_job_ids: Vec<JobId>,
    pub created_by: Actor,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(modules: &[ModuleKind]) -> AnalysisRequest {
        AnalysisRequest {
            patient_id: PatientId::from("patient-1"),
            modules: modules.iter().copied().collect(),
            requested_by: Actor::new("dr-lee"),
            priority: JobPriority::P1,
        }
    }

    #[test]
    fn new_job_starts_queued_with_pending_slots() {
        let job = AnalysisJob::new(request(&[
            ModuleKind::Cognitive,
            ModuleKind::Biometric,
        ]));
        assert_eq!(job.state, JobState::Queued);
        assert_eq!(job.attempt, 1);
        assert_eq!(job.module_results.len(), 2);
        assert!(job.module_results.values().all(ModuleOutcome::is_pending));
        assert_eq!(job.transitions.len(), 1);
        assert_eq!(job.transitions[0].from, None);
    }

    #[test]
    fn transition_table_rejects_backwards_moves() {
        let mut job = AnalysisJob::new(request(&[ModuleKind::Social]));
        job.transition(JobState::Processing, Actor::dispatcher())
            .unwrap();
        job.transition(JobState::Completed, Actor::dispatcher())
            .unwrap();

        let err = job
            .transition(JobState::Processing, Actor::dispatcher())
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::IllegalTransition { .. }));
        assert_eq!(job.state, JobState::Completed);
        assert!(job.finished_at.is_some());
    }

    #[test]
    fn queued_job_cannot_complete_without_processing() {
        assert!(!JobState::Queued.can_transition_to(JobState::Completed));
        assert!(JobState::Queued.can_transition_to(JobState::Cancelled));
        assert!(!JobState::Cancelled.can_transition_to(JobState::Queued));
    }

    #[test]
    fn retry_links_lineage_and_bumps_attempt() {
        let original = AnalysisJob::new(request(&[
            ModuleKind::Cognitive,
            ModuleKind::Linguistic,
        ]));
        let retry = AnalysisJob::retry_of(
            &original,
            [ModuleKind::Linguistic].into_iter().collect(),
            Actor::new("dr-lee"),
        );
        assert_ne!(retry.id, original.id);
        assert_eq!(retry.retried_from, Some(original.id));
        assert_eq!(retry.attempt, 2);
        assert_eq!(retry.patient_id, original.patient_id);
        assert_eq!(retry.requested_modules.len(), 1);
    }

    #[test]
    fn patient_id_validation() {
        assert!(PatientId::try_new("   ").is_err());
        assert!(PatientId::try_new("abc\u{0007}").is_err());
        assert_eq!(PatientId::try_new(" p-42 ").unwrap().as_str(), "p-42");
    }

    #[test]
    fn state_parses_from_wire_names() {
        assert_eq!(
            "partially_failed".parse::<JobState>().unwrap(),
            JobState::PartiallyFailed
        );
        assert!("done".parse::<JobState>().is_err());
    }
}
