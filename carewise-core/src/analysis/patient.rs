use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::error::{OrchestratorError, Result};

use super::job::PatientId;

/// Read-only view of a patient record handed to every module adapter.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PatientSnapshot {
    pub patient_id: PatientId,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub record: serde_json::Value,
    pub fetched_at: DateTime<Utc>,
}

impl PatientSnapshot {
    pub fn new(patient_id: PatientId, record: serde_json::Value) -> Self {
        Self {
            patient_id,
            display_name: None,
            record,
            fetched_at: Utc::now(),
        }
    }
}

/// Source of patient records. The orchestrator only reads.
#[async_trait]
pub trait PatientDirectory: Send + Sync {
    async fn exists(&self, patient_id: &PatientId) -> Result<bool>;

    async fn snapshot(&self, patient_id: &PatientId) -> Result<PatientSnapshot>;
}

#[derive(Clone, Debug, Default)]
pub struct InMemoryPatientDirectory {
    patients: Arc<RwLock<HashMap<PatientId, PatientSnapshot>>>,
}

impl InMemoryPatientDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn upsert(&self, snapshot: PatientSnapshot) {
        self.patients
            .write()
            .await
            .insert(snapshot.patient_id.clone(), snapshot);
    }

    pub async fn remove(&self, patient_id: &PatientId) {
        self.patients.write().await.remove(patient_id);
    }
}

#[async_trait]
impl PatientDirectory for InMemoryPatientDirectory {
    async fn exists(&self, patient_id: &PatientId) -> Result<bool> {
        Ok(self.patients.read().await.contains_key(patient_id))
    }

    async fn snapshot(
        &self,
        patient_id: &PatientId,
    ) -> Result<PatientSnapshot> {
        self.patients
            .read()
            .await
            .get(patient_id)
            .cloned()
            .ok_or_else(|| {
                OrchestratorError::PatientNotFound(patient_id.clone())
            })
    }
}
