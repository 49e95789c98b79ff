use std::{
    collections::{HashMap, HashSet},
    fmt,
    sync::Arc,
};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::error::{OrchestratorError, Result};

use super::job::{
    Actor, AnalysisJob, BatchId, BatchJob, JobId, JobState, PatientId,
};

/// Read-modify-write applied atomically to one stored job. If it returns an
/// error nothing is written.
pub type JobMutation =
    Box<dyn FnOnce(&mut AnalysisJob) -> Result<()> + Send + 'static>;

/// Optional filters for listing jobs. Unset fields match everything.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct JobFilter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub patient_id: Option<PatientId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<JobState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requested_by: Option<Actor>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_id: Option<BatchId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retried_from: Option<JobId>,
}

impl JobFilter {
    pub fn with_state(state: JobState) -> Self {
        Self {
            state: Some(state),
            ..Self::default()
        }
    }

    /// Follow-up jobs created by retrying `job_id`.
    pub fn retries_of(job_id: JobId) -> Self {
        Self {
            retried_from: Some(job_id),
            ..Self::default()
        }
    }

    pub fn matches(&self, job: &AnalysisJob) -> bool {
        self.patient_id
            .as_ref()
            .is_none_or(|patient| &job.patient_id == patient)
            && self.state.is_none_or(|state| job.state == state)
            && self
                .requested_by
                .as_ref()
                .is_none_or(|actor| &job.requested_by == actor)
            && self
                .batch_id
                .is_none_or(|batch| job.batch_id == Some(batch))
            && self
                .retried_from
                .is_none_or(|origin| job.retried_from == Some(origin))
    }
}

/// Authoritative storage for job records and batch groupings.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn insert(&self, job: AnalysisJob) -> Result<()>;

    /// Stores a record that `get` and `modify` can reach but listings skip
    /// until [`JobStore::publish`] runs. Admission uses this so a job that
    /// may still be rejected never shows up in listings.
    async fn stage(&self, job: AnalysisJob) -> Result<()> {
        self.insert(job).await
    }

    async fn publish(&self, _id: JobId) -> Result<()> {
        Ok(())
    }

    async fn get(&self, id: JobId) -> Result<AnalysisJob>;

    /// Applies `mutation` under the store's write lock and returns the
    /// committed record.
    async fn modify(&self, id: JobId, mutation: JobMutation)
    -> Result<AnalysisJob>;

    /// Drops a record that never became visible to workers (rejected
    /// admission).
    async fn discard(&self, id: JobId) -> Result<()>;

    /// Matching published jobs, newest first.
    async fn list(&self, filter: &JobFilter) -> Result<Vec<AnalysisJob>>;

    async fn insert_batch(&self, batch: BatchJob) -> Result<()>;

    async fn get_batch(&self, id: BatchId) -> Result<BatchJob>;
}

#[derive(Clone, Default)]
pub struct InMemoryJobStore {
    jobs: Arc<RwLock<HashMap<JobId, AnalysisJob>>>,
    staged: Arc<RwLock<HashSet<JobId>>>,
    batches: Arc<RwLock<HashMap<BatchId, BatchJob>>>,
}

impl fmt::Debug for InMemoryJobStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("InMemoryJobStore");
        match self.jobs.try_read() {
            Ok(jobs) => debug.field("jobs", &jobs.len()),
            Err(_) => debug.field("jobs", &"<locked>"),
        };
        match self.batches.try_read() {
            Ok(batches) => debug.field("batches", &batches.len()),
            Err(_) => debug.field("batches", &"<locked>"),
        };
        debug.finish()
    }
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn insert(&self, job: AnalysisJob) -> Result<()> {
        let mut jobs = self.jobs.write().await;
        if jobs.contains_key(&job.id) {
            return Err(OrchestratorError::Internal(format!(
                "job {} already stored",
                job.id
            )));
        }
        jobs.insert(job.id, job);
        Ok(())
    }

    async fn stage(&self, job: AnalysisJob) -> Result<()> {
        let mut jobs = self.jobs.write().await;
        if jobs.contains_key(&job.id) {
            return Err(OrchestratorError::Internal(format!(
                "job {} already stored",
                job.id
            )));
        }
        self.staged.write().await.insert(job.id);
        jobs.insert(job.id, job);
        Ok(())
    }

    async fn publish(&self, id: JobId) -> Result<()> {
        self.staged.write().await.remove(&id);
        Ok(())
    }

    async fn get(&self, id: JobId) -> Result<AnalysisJob> {
        self.jobs
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(OrchestratorError::JobNotFound(id))
    }

    async fn modify(
        &self,
        id: JobId,
        mutation: JobMutation,
    ) -> Result<AnalysisJob> {
        let mut jobs = self.jobs.write().await;
        let stored =
            jobs.get_mut(&id).ok_or(OrchestratorError::JobNotFound(id))?;
        let mut draft = stored.clone();
        mutation(&mut draft)?;
        *stored = draft.clone();
        Ok(draft)
    }

    async fn discard(&self, id: JobId) -> Result<()> {
        let mut jobs = self.jobs.write().await;
        jobs.remove(&id);
        self.staged.write().await.remove(&id);
        Ok(())
    }

    async fn list(&self, filter: &JobFilter) -> Result<Vec<AnalysisJob>> {
        let jobs = self.jobs.read().await;
        let staged = self.staged.read().await;
        let mut matched: Vec<AnalysisJob> = jobs
            .values()
            .filter(|job| !staged.contains(&job.id) && filter.matches(job))
            .cloned()
            .collect();
        // v7 ids are time ordered, so they break created_at ties stably.
        matched.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.id.0.cmp(&a.id.0))
        });
        Ok(matched)
    }

    async fn insert_batch(&self, batch: BatchJob) -> Result<()> {
        self.batches.write().await.insert(batch.batch_id, batch);
        Ok(())
    }

    async fn get_batch(&self, id: BatchId) -> Result<BatchJob> {
        self.batches
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(OrchestratorError::BatchNotFound(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::{
        job::{AnalysisRequest, JobPriority},
        module::ModuleKind,
    };

    fn job(patient: &str) -> AnalysisJob {
        AnalysisJob::new(AnalysisRequest {
            patient_id: PatientId::from(patient),
            modules: [ModuleKind::Cognitive].into_iter().collect(),
            requested_by: Actor::new("dr-lee"),
            priority: JobPriority::P1,
        })
    }

    #[tokio::test]
    async fn failed_mutation_leaves_record_untouched() {
        let store = InMemoryJobStore::new();
        let stored = job("p-1");
        let id = stored.id;
        store.insert(stored).await.unwrap();

        let err = store
            .modify(
                id,
                Box::new(|job: &mut AnalysisJob| {
                    job.failure = Some("scribbled".into());
                    job.transition(JobState::Completed, Actor::dispatcher())
                        .map(|_| ())
                }),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::IllegalTransition { .. }));

        let reloaded = store.get(id).await.unwrap();
        assert_eq!(reloaded.state, JobState::Queued);
        assert!(reloaded.failure.is_none());
    }

    #[tokio::test]
    async fn list_filters_and_orders_newest_first() {
        let store = InMemoryJobStore::new();
        let first = job("p-1");
        let second = job("p-2");
        let third = job("p-1");
        for j in [&first, &second, &third] {
            store.insert(j.clone()).await.unwrap();
        }

        let all = store.list(&JobFilter::default()).await.unwrap();
        assert_eq!(
            all.iter().map(|j| j.id).collect::<Vec<_>>(),
            vec![third.id, second.id, first.id]
        );

        let filter = JobFilter {
            patient_id: Some(PatientId::from("p-1")),
            ..JobFilter::default()
        };
        let only_p1 = store.list(&filter).await.unwrap();
        assert_eq!(only_p1.len(), 2);
        assert!(only_p1.iter().all(|j| j.patient_id.as_str() == "p-1"));
    }

    #[tokio::test]
    async fn staged_records_stay_out_of_listings_until_published() {
        let store = InMemoryJobStore::new();
        let staged = job("p-1");
        let id = staged.id;
        store.stage(staged).await.unwrap();

        assert_eq!(store.get(id).await.unwrap().id, id);
        assert!(store.list(&JobFilter::default()).await.unwrap().is_empty());

        store.publish(id).await.unwrap();
        let listed = store.list(&JobFilter::default()).await.unwrap();
        assert_eq!(listed.iter().map(|j| j.id).collect::<Vec<_>>(), vec![id]);

        let dropped = job("p-2");
        let dropped_id = dropped.id;
        store.stage(dropped).await.unwrap();
        store.discard(dropped_id).await.unwrap();
        assert!(store.get(dropped_id).await.is_err());
    }

    #[tokio::test]
    async fn retries_of_matches_only_direct_follow_ups() {
        let store = InMemoryJobStore::new();
        let original = job("p-1");
        let mut follow_up = job("p-1");
        follow_up.retried_from = Some(original.id);
        let mut unrelated = job("p-1");
        unrelated.retried_from = Some(JobId::new());
        for j in [&original, &follow_up, &unrelated] {
            store.insert(j.clone()).await.unwrap();
        }

        let retries = store
            .list(&JobFilter::retries_of(original.id))
            .await
            .unwrap();
        assert_eq!(
            retries.iter().map(|j| j.id).collect::<Vec<_>>(),
            vec![follow_up.id]
        );
    }

    #[tokio::test]
    async fn missing_records_map_to_not_found() {
        let store = InMemoryJobStore::new();
        assert!(matches!(
            store.get(JobId::new()).await,
            Err(OrchestratorError::JobNotFound(_))
        ));
        assert!(matches!(
            store.get_batch(BatchId::new()).await,
            Err(OrchestratorError::BatchNotFound(_))
        ));
    }
}
