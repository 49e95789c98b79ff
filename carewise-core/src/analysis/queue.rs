use std::{
    collections::{BTreeMap, HashMap},
    fmt,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, Notify};
use tracing::debug;

use crate::error::Result;

use super::job::{AnalysisJob, JobId, JobPriority, PatientId};

/// What the queue needs to know about a job to order and gate it.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct QueueEntry {
    pub job_id: JobId,
    pub patient_id: PatientId,
    pub priority: JobPriority,
    pub enqueued_at: DateTime<Utc>,
}

impl QueueEntry {
    pub fn for_job(job: &AnalysisJob) -> Self {
        Self {
            job_id: job.id,
            patient_id: job.patient_id.clone(),
            priority: job.priority,
            enqueued_at: Utc::now(),
        }
    }
}

/// Ownership handed to exactly one worker on dequeue.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QueueLease {
    pub entry: QueueEntry,
    pub sequence: u64,
    pub leased_at: DateTime<Utc>,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum RejectionReason {
    PatientNotFound,
    DuplicateInFlight { existing: JobId },
    QueueSaturated { depth: usize, max_depth: usize },
}

impl fmt::Display for RejectionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectionReason::PatientNotFound => {
                f.write_str("patient not found")
            }
            RejectionReason::DuplicateInFlight { existing } => {
                write!(f, "duplicate in flight (existing job {existing})")
            }
            RejectionReason::QueueSaturated { depth, max_depth } => {
                write!(f, "queue saturated ({depth}/{max_depth})")
            }
        }
    }
}

/// Admission decision returned by [`QueueService::enqueue`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Admission {
    Accepted { position: usize },
    Rejected(RejectionReason),
}

/// Abstracts the backlog consumed by the worker pool. Implementations own the
/// admission gate so the duplicate and depth checks are atomic with insertion.
#[async_trait]
pub trait QueueService: Send + Sync {
    async fn enqueue(&self, entry: QueueEntry) -> Result<Admission>;

    /// Removes the highest-priority, oldest entry. Removal is the only point
    /// at which a worker takes ownership of a job.
    async fn dequeue_next(&self) -> Result<Option<QueueLease>>;

    /// Pulls a still-queued job out of the backlog. `None` means a worker
    /// already owns it (or it was never queued).
    async fn remove_queued(&self, job_id: JobId) -> Result<Option<QueueEntry>>;

    /// Frees the patient's in-flight slot once the job is terminal.
    async fn release(&self, job_id: JobId) -> Result<()>;

    async fn size(&self) -> Result<usize>;

    async fn peek_by_patient(
        &self,
        patient_id: &PatientId,
    ) -> Result<Vec<QueueEntry>>;

    async fn snapshot(&self) -> Result<QueueSnapshot>;

    /// Resolves when new work may be available. Backends without push
    /// notification never resolve and rely on the worker poll interval.
    async fn wait_for_work(&self) {
        futures::future::pending::<()>().await
    }
}

/// Point-in-time view of the backlog.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QueueSnapshot {
    pub sampled_at: DateTime<Utc>,
    pub depth: usize,
    pub leased: usize,
    pub max_depth: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub oldest_enqueued_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub oldest_age_ms: Option<i64>,
    pub by_priority: BTreeMap<JobPriority, usize>,
}

type ReadyKey = (u8, u64);

#[derive(Debug, Default)]
struct QueueState {
    ready: BTreeMap<ReadyKey, QueueEntry>,
    index: HashMap<JobId, ReadyKey>,
    inflight: HashMap<PatientId, JobId>,
    leased: HashMap<JobId, PatientId>,
    next_sequence: u64,
}

impl QueueState {
    fn free_patient_slot(&mut self, job_id: JobId, patient_id: &PatientId) {
        if self.inflight.get(patient_id) == Some(&job_id) {
            self.inflight.remove(patient_id);
        }
    }
}

/// Default in-memory queue: strict priority, FIFO within a band.
pub struct InMemoryQueueService {
    max_depth: usize,
    state: Mutex<QueueState>,
    notify: Notify,
}

impl fmt::Debug for InMemoryQueueService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("InMemoryQueueService");
        debug.field("max_depth", &self.max_depth);

        match self.state.try_lock() {
            Ok(state) => {
                debug
                    .field("ready", &state.ready.len())
                    .field("leased", &state.leased.len())
                    .field("next_sequence", &state.next_sequence);
            }
            Err(_) => {
                debug.field("state", &"<locked>");
            }
        }

        debug.finish()
    }
}

impl InMemoryQueueService {
    pub fn new(max_depth: usize) -> Self {
        Self {
            max_depth: max_depth.max(1),
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
        }
    }

    pub fn max_depth(&self) -> usize {
        self.max_depth
    }
}

#[async_trait]
impl QueueService for InMemoryQueueService {
    async fn enqueue(&self, entry: QueueEntry) -> Result<Admission> {
        let mut state = self.state.lock().await;

        if let Some(existing) = state.inflight.get(&entry.patient_id) {
            return Ok(Admission::Rejected(
                RejectionReason::DuplicateInFlight {
                    existing: *existing,
                },
            ));
        }

        let depth = state.ready.len();
        if depth >= self.max_depth {
            return Ok(Admission::Rejected(RejectionReason::QueueSaturated {
                depth,
                max_depth: self.max_depth,
            }));
        }

        let key = (entry.priority.rank(), state.next_sequence);
        state.next_sequence += 1;
        let position = state.ready.range(..key).count();

        state.inflight.insert(entry.patient_id.clone(), entry.job_id);
        state.index.insert(entry.job_id, key);
        debug!(
            target: "analysis::queue",
            job = %entry.job_id,
            priority = ?entry.priority,
            position,
            "job admitted"
        );
        state.ready.insert(key, entry);
        drop(state);

        self.notify.notify_one();
        Ok(Admission::Accepted { position })
    }

    async fn dequeue_next(&self) -> Result<Option<QueueLease>> {
        let mut state = self.state.lock().await;
        let Some(((_, sequence), entry)) = state.ready.pop_first() else {
            return Ok(None);
        };
        state.index.remove(&entry.job_id);
        state.leased.insert(entry.job_id, entry.patient_id.clone());

        Ok(Some(QueueLease {
            entry,
            sequence,
            leased_at: Utc::now(),
        }))
    }

    async fn remove_queued(&self, job_id: JobId) -> Result<Option<QueueEntry>> {
        let mut state = self.state.lock().await;
        let Some(key) = state.index.remove(&job_id) else {
            return Ok(None);
        };
        let removed = state.ready.remove(&key);
        if let Some(entry) = removed.as_ref() {
            state.free_patient_slot(entry.job_id, &entry.patient_id);
        }
        Ok(removed)
    }

    async fn release(&self, job_id: JobId) -> Result<()> {
        let mut state = self.state.lock().await;
        if let Some(patient_id) = state.leased.remove(&job_id) {
            state.free_patient_slot(job_id, &patient_id);
        }
        Ok(())
    }

    async fn size(&self) -> Result<usize> {
        Ok(self.state.lock().await.ready.len())
    }

    async fn peek_by_patient(
        &self,
        patient_id: &PatientId,
    ) -> Result<Vec<QueueEntry>> {
        let state = self.state.lock().await;
        Ok(state
            .ready
            .values()
            .filter(|entry| &entry.patient_id == patient_id)
            .cloned()
            .collect())
    }

    async fn snapshot(&self) -> Result<QueueSnapshot> {
        let state = self.state.lock().await;
        let now = Utc::now();
        let oldest_enqueued_at =
            state.ready.values().map(|entry| entry.enqueued_at).min();
        let mut by_priority = BTreeMap::new();
        for entry in state.ready.values() {
            *by_priority.entry(entry.priority).or_insert(0usize) += 1;
        }

        Ok(QueueSnapshot {
            sampled_at: now,
            depth: state.ready.len(),
            leased: state.leased.len(),
            max_depth: self.max_depth,
            oldest_enqueued_at,
            oldest_age_ms: oldest_enqueued_at
                .map(|at| (now - at).num_milliseconds().max(0)),
            by_priority,
        })
    }

    async fn wait_for_work(&self) {
        self.notify.notified().await
    }
}
