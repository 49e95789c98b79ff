use std::{collections::HashMap, fmt, sync::Arc, time::Instant};

use async_trait::async_trait;
use futures::{StreamExt, stream::FuturesUnordered};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info_span, warn};

use crate::error::{OrchestratorError, Result};

use super::{
    adapter::ModuleRegistry,
    config::TimeoutConfig,
    events::{AuditRecord, AuditSink},
    job::{Actor, AnalysisJob, JobId, JobState},
    module::{FailureReason, ModuleKind, ModuleOutcome},
    patient::{PatientDirectory, PatientSnapshot},
    queue::{QueueLease, QueueService},
    store::{JobMutation, JobStore},
    synthesis::Synthesizer,
};

/// Outcome of driving one dequeued job.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum DispatchStatus {
    /// The job reached a terminal state.
    Finalized { job_id: JobId, state: JobState },
    /// The job record could not be driven (missing or inconsistent); the
    /// queue slot was still released.
    Abandoned { job_id: JobId, error: String },
}

impl DispatchStatus {
    pub fn job_id(&self) -> JobId {
        match self {
            DispatchStatus::Finalized { job_id, .. }
            | DispatchStatus::Abandoned { job_id, .. } => *job_id,
        }
    }
}

/// Result of a cancellation request.
#[derive(Clone, Debug, PartialEq)]
pub enum CancelOutcome {
    /// The job was still queued and is now `Cancelled`.
    Cancelled(Box<AnalysisJob>),
    /// A worker owns the job; it will finalize as `Cancelled` at its next
    /// synchronisation point.
    Requested { job_id: JobId },
}

/// Contract used by worker loops and the facade.
#[async_trait]
pub trait JobDispatcher: Send + Sync {
    /// Takes the next job off the queue and drives it to a terminal state.
    /// `Ok(None)` means the queue was empty.
    async fn dispatch_next(&self) -> Result<Option<DispatchStatus>>;

    async fn cancel(
        &self,
        job_id: JobId,
        actor: Actor,
    ) -> Result<CancelOutcome>;
}

/// Collaborators the dispatcher drives.
#[derive(Clone)]
pub struct DispatchContext {
    pub queue: Arc<dyn QueueService>,
    pub store: Arc<dyn JobStore>,
    pub patients: Arc<dyn PatientDirectory>,
    pub audit: Arc<dyn AuditSink>,
    pub modules: ModuleRegistry,
}

impl fmt::Debug for DispatchContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DispatchContext")
            .field("queue", &"QueueService")
            .field("store", &"JobStore")
            .field("patients", &"PatientDirectory")
            .field("audit", &"AuditSink")
            .field("modules", &self.modules)
            .finish()
    }
}

#[derive(Debug)]
struct ActiveDispatch {
    token: CancellationToken,
    cancelled_by: Option<Actor>,
}

/// How a job leaves `Processing` (or `Queued`, when cancelled before start).
#[derive(Debug)]
enum Finalization {
    /// Settle module slots and derive the state from them.
    Settle { deadline_elapsed: bool },
    /// Fail without running modules.
    ForceFail(String),
}

pub struct AnalysisDispatcher {
    ctx: DispatchContext,
    synthesizer: Synthesizer,
    timeouts: TimeoutConfig,
    shutdown: CancellationToken,
    // Guards the hand-off between queue, worker and terminal write so a
    // cancel always finds the job in exactly one place.
    active: Mutex<HashMap<JobId, ActiveDispatch>>,
}

impl fmt::Debug for AnalysisDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let active = self
            .active
            .try_lock()
            .map(|guard| guard.len())
            .unwrap_or_default();
        f.debug_struct("AnalysisDispatcher")
            .field("ctx", &self.ctx)
            .field("timeouts", &self.timeouts)
            .field("active", &active)
            .field("shutdown_cancelled", &self.shutdown.is_cancelled())
            .finish()
    }
}

impl AnalysisDispatcher {
    pub fn new(
        ctx: DispatchContext,
        synthesizer: Synthesizer,
        timeouts: TimeoutConfig,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            ctx,
            synthesizer,
            timeouts,
            shutdown,
            active: Mutex::new(HashMap::new()),
        }
    }

    pub async fn active_jobs(&self) -> usize {
        self.active.lock().await.len()
    }

    async fn audit_last_transition(&self, job: &AnalysisJob) {
        if let Some(transition) = job.transitions.last() {
            let record =
                AuditRecord::transition(job.id, &job.patient_id, transition);
            if let Err(err) = self.ctx.audit.record(record).await {
                warn!(
                    target: "analysis::dispatch",
                    job = %job.id,
                    error = %err,
                    "audit write failed"
                );
            }
        }
    }

    async fn run(
        &self,
        lease: QueueLease,
        token: CancellationToken,
    ) -> DispatchStatus {
        let job_id = lease.entry.job_id;
        let started = Instant::now();

        if token.is_cancelled() {
            let settle = Finalization::Settle {
                deadline_elapsed: false,
            };
            return self.finish(job_id, settle).await;
        }

        let job = match self
            .ctx
            .store
            .modify(
                job_id,
                Box::new(|job: &mut AnalysisJob| {
                    job.transition(JobState::Processing, Actor::dispatcher())
                        .map(|_| ())
                }),
            )
            .await
        {
            Ok(job) => job,
            Err(err) => return self.abandon(job_id, err).await,
        };
        self.audit_last_transition(&job).await;

        let snapshot = match self.preflight(&job).await {
            Ok(snapshot) => snapshot,
            Err(reason) => {
                warn!(
                    target: "analysis::dispatch",
                    job = %job_id,
                    %reason,
                    "precondition failed"
                );
                return self
                    .finish(job_id, Finalization::ForceFail(reason))
                    .await;
            }
        };

        let deadline_elapsed = self.fan_out(&job, snapshot, &token).await;

        let status = self
            .finish(job_id, Finalization::Settle { deadline_elapsed })
            .await;
        debug!(
            target: "analysis::dispatch",
            job = %job_id,
            elapsed_ms = started.elapsed().as_millis() as u64,
            status = ?status,
            "dispatch finished"
        );
        status
    }

    /// Patient existence and adapter availability, checked before any
    /// module runs.
    async fn preflight(
        &self,
        job: &AnalysisJob,
    ) -> std::result::Result<Arc<PatientSnapshot>, String> {
        let missing: Vec<&str> = job
            .requested_modules
            .iter()
            .filter(|kind| !self.ctx.modules.contains(**kind))
            .map(ModuleKind::as_str)
            .collect();
        if !missing.is_empty() {
            return Err(format!(
                "no adapter registered for: {}",
                missing.join(", ")
            ));
        }

        match self.ctx.patients.snapshot(&job.patient_id).await {
            Ok(snapshot) => Ok(Arc::new(snapshot)),
            Err(OrchestratorError::PatientNotFound(patient)) => {
                Err(format!("patient {patient} not found"))
            }
            Err(err) => Err(format!("patient lookup failed: {err}")),
        }
    }

    /// Runs every requested module concurrently. Returns true when the
    /// dispatch deadline cut the fan-out short.
    async fn fan_out(
        &self,
        job: &AnalysisJob,
        snapshot: Arc<PatientSnapshot>,
        token: &CancellationToken,
    ) -> bool {
        let module_timeout = self.timeouts.module_timeout();
        let fan_out_token = token.child_token();
        let mut calls = FuturesUnordered::new();

        for kind in job.requested_modules.iter().copied() {
            let Some(adapter) = self.ctx.modules.get(kind) else {
                continue;
            };
            let snapshot = Arc::clone(&snapshot);
            let call_token = fan_out_token.child_token();
            calls.push(async move {
                let outcome = match tokio::time::timeout(
                    module_timeout,
                    adapter.invoke(&snapshot, call_token),
                )
                .await
                {
                    Ok(Ok(payload)) => ModuleOutcome::Succeeded(payload),
                    Ok(Err(reason)) => ModuleOutcome::Failed(reason),
                    Err(_) => ModuleOutcome::Failed(FailureReason::Timeout),
                };
                (kind, outcome)
            });
        }

        let deadline = tokio::time::sleep(self.timeouts.dispatch_deadline());
        tokio::pin!(deadline);
        let mut deadline_elapsed = false;

        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => {
                    debug!(
                        target: "analysis::dispatch",
                        job = %job.id,
                        "cancellation observed"
                    );
                    break;
                }
                _ = &mut deadline => {
                    warn!(
                        target: "analysis::dispatch",
                        job = %job.id,
                        "dispatch deadline elapsed"
                    );
                    deadline_elapsed = true;
                    break;
                }
                next = calls.next() => {
                    let Some((kind, outcome)) = next else { break };
                    debug!(
                        target: "analysis::dispatch",
                        job = %job.id,
                        module = %kind,
                        succeeded = outcome.is_succeeded(),
                        "module settled"
                    );
                    let recorded = self
                        .ctx
                        .store
                        .modify(
                            job.id,
                            Box::new(move |job: &mut AnalysisJob| {
                                job.module_results.insert(kind, outcome);
                                job.updated_at = chrono::Utc::now();
                                Ok(())
                            }),
                        )
                        .await;
                    if let Err(err) = recorded {
                        warn!(
                            target: "analysis::dispatch",
                            job = %job.id,
                            module = %kind,
                            error = %err,
                            "progress write failed"
                        );
                    }
                }
            }
        }

        fan_out_token.cancel();
        drop(calls);
        deadline_elapsed
    }

    /// Writes the terminal state. Holding `active` across the write means a
    /// concurrent cancel either lands before this (and wins) or sees a
    /// terminal record.
    async fn finish(
        &self,
        job_id: JobId,
        finalization: Finalization,
    ) -> DispatchStatus {
        let mut active = self.active.lock().await;
        let cancelled_by = active.remove(&job_id).and_then(|dispatch| {
            dispatch.token.is_cancelled().then(|| {
                dispatch
                    .cancelled_by
                    .unwrap_or_else(|| Actor::new("system:shutdown"))
            })
        });

        let synthesizer = self.synthesizer.clone();
        let mutation: JobMutation = Box::new(move |job: &mut AnalysisJob| {
            if let Some(actor) = cancelled_by {
                // returned payloads are discarded on cancel
                for outcome in job.module_results.values_mut() {
                    if outcome.is_succeeded() {
                        *outcome = ModuleOutcome::Pending;
                    }
                }
                return job.transition(JobState::Cancelled, actor).map(|_| ());
            }

            match finalization {
                Finalization::ForceFail(reason) => {
                    job.failure = Some(reason);
                    job.transition(JobState::Failed, Actor::dispatcher())
                        .map(|_| ())
                }
                Finalization::Settle { deadline_elapsed } => {
                    for outcome in job.module_results.values_mut() {
                        if outcome.is_pending() {
                            *outcome =
                                ModuleOutcome::Failed(FailureReason::Timeout);
                        }
                    }
                    let succeeded = job.succeeded_modules().len();
                    let state = if succeeded == 0 {
                        JobState::Failed
                    } else if succeeded == job.requested_modules.len() {
                        JobState::Completed
                    } else {
                        JobState::PartiallyFailed
                    };
                    if state == JobState::Failed && deadline_elapsed {
                        job.failure = Some(
                            "dispatch deadline elapsed with no module \
                             succeeding"
                                .into(),
                        );
                    }
                    if state.has_synthesis() {
                        job.synthesis = Some(synthesizer.synthesize(job));
                    }
                    job.transition(state, Actor::dispatcher()).map(|_| ())
                }
            }
        });

        let written = self.ctx.store.modify(job_id, mutation).await;
        drop(active);

        match written {
            Ok(job) => {
                self.audit_last_transition(&job).await;
                self.release(job_id).await;
                DispatchStatus::Finalized {
                    job_id,
                    state: job.state,
                }
            }
            Err(err) => self.abandon(job_id, err).await,
        }
    }

    async fn abandon(
        &self,
        job_id: JobId,
        err: OrchestratorError,
    ) -> DispatchStatus {
        warn!(
            target: "analysis::dispatch",
            job = %job_id,
            error = %err,
            "abandoning job"
        );
        self.active.lock().await.remove(&job_id);
        self.release(job_id).await;
        DispatchStatus::Abandoned {
            job_id,
            error: err.to_string(),
        }
    }

    async fn release(&self, job_id: JobId) {
        if let Err(err) = self.ctx.queue.release(job_id).await {
            warn!(
                target: "analysis::dispatch",
                job = %job_id,
                error = %err,
                "queue release failed"
            );
        }
    }
}

#[async_trait]
impl JobDispatcher for AnalysisDispatcher {
    async fn dispatch_next(&self) -> Result<Option<DispatchStatus>> {
        let (lease, token) = {
            let mut active = self.active.lock().await;
            let Some(lease) = self.ctx.queue.dequeue_next().await? else {
                return Ok(None);
            };
            let token = self.shutdown.child_token();
            active.insert(
                lease.entry.job_id,
                ActiveDispatch {
                    token: token.clone(),
                    cancelled_by: None,
                },
            );
            (lease, token)
        };

        let span = info_span!(
            "dispatch",
            job = %lease.entry.job_id,
            patient = %lease.entry.patient_id,
            priority = ?lease.entry.priority
        );
        Ok(Some(self.run(lease, token).instrument(span).await))
    }

    async fn cancel(
        &self,
        job_id: JobId,
        actor: Actor,
    ) -> Result<CancelOutcome> {
        let job = self.ctx.store.get(job_id).await?;
        if job.state.is_terminal() {
            return Err(OrchestratorError::AlreadyTerminal {
                job_id,
                state: job.state,
            });
        }

        let mut active = self.active.lock().await;

        if self.ctx.queue.remove_queued(job_id).await?.is_some() {
            let cancelled = self
                .ctx
                .store
                .modify(
                    job_id,
                    Box::new(move |job: &mut AnalysisJob| {
                        job.transition(JobState::Cancelled, actor).map(|_| ())
                    }),
                )
                .await?;
            drop(active);
            self.audit_last_transition(&cancelled).await;
            return Ok(CancelOutcome::Cancelled(Box::new(cancelled)));
        }

        if let Some(dispatch) = active.get_mut(&job_id) {
            dispatch.cancelled_by.get_or_insert(actor);
            dispatch.token.cancel();
            debug!(
                target: "analysis::dispatch",
                job = %job_id,
                "cancellation requested"
            );
            return Ok(CancelOutcome::Requested { job_id });
        }
        drop(active);

        // Neither queued nor owned: either a worker just finished it, or
        // admission has staged the record but not enqueued it yet.
        let job = self.ctx.store.get(job_id).await?;
        if job.state.is_terminal() {
            return Err(OrchestratorError::AlreadyTerminal {
                job_id,
                state: job.state,
            });
        }
        Err(OrchestratorError::AdmissionPending {
            job_id,
            state: job.state,
        })
    }
}
