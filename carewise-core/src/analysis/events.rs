use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::info;
use uuid::Uuid;

use crate::error::Result;

use super::{
    job::{Actor, BatchId, JobId, JobState, PatientId, StateTransition},
    queue::RejectionReason,
};

/// What an audit record is about.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AuditEventKind {
    Transition {
        #[serde(skip_serializing_if = "Option::is_none")]
        from: Option<JobState>,
        to: JobState,
    },
    AdmissionRejected {
        reason: RejectionReason,
    },
    FeedbackRecorded {
        #[serde(skip_serializing_if = "Option::is_none")]
        rating: Option<u8>,
    },
    BatchCreated {
        batch_id: BatchId,
        members: usize,
        rejected: usize,
    },
}

/// Append-only record of who did what to which job, and when.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AuditRecord {
    pub id: Uuid,
    pub at: DateTime<Utc>,
    pub actor: Actor,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_id: Option<JobId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub patient_id: Option<PatientId>,
    #[serde(flatten)]
    pub kind: AuditEventKind,
}

impl AuditRecord {
    pub fn new(actor: Actor, kind: AuditEventKind) -> Self {
        Self {
            id: Uuid::now_v7(),
            at: Utc::now(),
            actor,
            job_id: None,
            patient_id: None,
            kind,
        }
    }

    pub fn transition(
        job_id: JobId,
        patient_id: &PatientId,
        transition: &StateTransition,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            at: transition.at,
            actor: transition.actor.clone(),
            job_id: Some(job_id),
            patient_id: Some(patient_id.clone()),
            kind: AuditEventKind::Transition {
                from: transition.from,
                to: transition.to,
            },
        }
    }

    pub fn with_job(mut self, job_id: JobId) -> Self {
        self.job_id = Some(job_id);
        self
    }

    pub fn with_patient(mut self, patient_id: &PatientId) -> Self {
        self.patient_id = Some(patient_id.clone());
        self
    }
}

#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, record: AuditRecord) -> Result<()>;
}

/// In-process audit fan-out. Every record is also written to the
/// `analysis::audit` tracing target so a log pipeline keeps a durable copy.
pub struct InProcAuditBus {
    sender: broadcast::Sender<AuditRecord>,
    capacity: usize,
}

impl fmt::Debug for InProcAuditBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InProcAuditBus")
            .field("capacity", &self.capacity)
            .field("subscribers", &self.sender.receiver_count())
            .finish()
    }
}

impl InProcAuditBus {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (sender, _) = broadcast::channel(capacity);
        Self { sender, capacity }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AuditRecord> {
        self.sender.subscribe()
    }
}

#[async_trait]
impl AuditSink for InProcAuditBus {
    async fn record(&self, record: AuditRecord) -> Result<()> {
        match &record.kind {
            AuditEventKind::Transition { from, to } => info!(
                target: "analysis::audit",
                actor = %record.actor,
                job = ?record.job_id,
                from = ?from,
                to = %to,
                "job transition"
            ),
            AuditEventKind::AdmissionRejected { reason } => info!(
                target: "analysis::audit",
                actor = %record.actor,
                patient = ?record.patient_id,
                %reason,
                "admission rejected"
            ),
            AuditEventKind::FeedbackRecorded { rating } => info!(
                target: "analysis::audit",
                actor = %record.actor,
                job = ?record.job_id,
                rating = ?rating,
                "feedback recorded"
            ),
            AuditEventKind::BatchCreated {
                batch_id,
                members,
                rejected,
            } => info!(
                target: "analysis::audit",
                actor = %record.actor,
                %batch_id,
                members,
                rejected,
                "batch created"
            ),
        }
        // No subscribers is fine; the log line above is the durable copy.
        let _ = self.sender.send(record);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_records_in_order() {
        let bus = InProcAuditBus::new(8);
        let mut rx = bus.subscribe();
        let job_id = JobId::new();
        let patient = PatientId::from("p-9");

        for to in [JobState::Processing, JobState::Completed] {
            let transition = StateTransition {
                from: None,
                to,
                at: Utc::now(),
                actor: Actor::dispatcher(),
            };
            bus.record(AuditRecord::transition(job_id, &patient, &transition))
                .await
                .unwrap();
        }

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert!(matches!(
            first.kind,
            AuditEventKind::Transition {
                to: JobState::Processing,
                ..
            }
        ));
        assert!(matches!(
            second.kind,
            AuditEventKind::Transition {
                to: JobState::Completed,
                ..
            }
        ));
        assert_eq!(second.job_id, Some(job_id));
    }

    #[tokio::test]
    async fn record_without_subscribers_is_ok() {
        let bus = InProcAuditBus::new(1);
        let record = AuditRecord::new(
            Actor::anonymous(),
            AuditEventKind::AdmissionRejected {
                reason: RejectionReason::QueueSaturated {
                    depth: 1,
                    max_depth: 1,
                },
            },
        );
        assert!(bus.record(record).await.is_ok());
    }

    #[test]
    fn record_serializes_flat() {
        let record = AuditRecord::new(
            Actor::new("dr-lee"),
            AuditEventKind::FeedbackRecorded { rating: Some(4) },
        )
        .with_job(JobId::new());
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["event"], "feedback_recorded");
        assert_eq!(json["rating"], 4);
        assert_eq!(json["actor"], "dr-lee");
    }
}
