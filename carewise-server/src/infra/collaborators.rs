//! `reqwest`-backed clients for the patient record and module services.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use carewise_core::{
    OrchestratorError, Result,
    analysis::{
        FailureReason, ModuleAdapter, ModuleKind, ModulePayload, ModuleRegistry,
        PatientDirectory, PatientId, PatientSnapshot,
    },
};

pub fn build_http_client(timeout: Duration) -> anyhow::Result<Client> {
    Ok(Client::builder()
        .timeout(timeout)
        .user_agent(concat!("carewise-server/", env!("CARGO_PKG_VERSION")))
        .build()?)
}

#[derive(Debug, Deserialize)]
struct RemoteSnapshot {
    #[serde(default)]
    display_name: Option<String>,
    #[serde(default)]
    record: serde_json::Value,
}

/// Reads patient snapshots from `GET {base}/patients/{id}/snapshot`.
#[derive(Debug, Clone)]
pub struct HttpPatientDirectory {
    client: Client,
    base_url: String,
}

impl HttpPatientDirectory {
    pub fn new(client: Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    fn snapshot_url(&self, patient_id: &PatientId) -> String {
        format!("{}/patients/{}/snapshot", self.base_url, patient_id)
    }
}

#[async_trait]
impl PatientDirectory for HttpPatientDirectory {
    async fn exists(&self, patient_id: &PatientId) -> Result<bool> {
        match self.snapshot(patient_id).await {
            Ok(_) => Ok(true),
            Err(OrchestratorError::PatientNotFound(_)) => Ok(false),
            Err(err) => Err(err),
        }
    }

    async fn snapshot(&self, patient_id: &PatientId) -> Result<PatientSnapshot> {
        let response = self
            .client
            .get(self.snapshot_url(patient_id))
            .send()
            .await
            .map_err(|err| OrchestratorError::Internal(format!("patient service: {err}")))?;

        match response.status() {
            StatusCode::NOT_FOUND => Err(OrchestratorError::PatientNotFound(patient_id.clone())),
            status if !status.is_success() => Err(OrchestratorError::Internal(format!(
                "patient service returned {status} for {patient_id}"
            ))),
            _ => {
                let remote: RemoteSnapshot = response.json().await.map_err(|err| {
                    OrchestratorError::Internal(format!("patient service: {err}"))
                })?;
                let mut snapshot = PatientSnapshot::new(patient_id.clone(), remote.record);
                snapshot.display_name = remote.display_name;
                Ok(snapshot)
            }
        }
    }
}

/// Invokes one module via `POST {base}/modules/{kind}/invoke`.
#[derive(Debug, Clone)]
pub struct HttpModuleAdapter {
    client: Client,
    base_url: String,
    kind: ModuleKind,
}

impl HttpModuleAdapter {
    pub fn new(client: Client, base_url: impl Into<String>, kind: ModuleKind) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            kind,
        }
    }

    fn invoke_url(&self) -> String {
        format!("{}/modules/{}/invoke", self.base_url, self.kind)
    }

    async fn call(&self, snapshot: &PatientSnapshot) -> std::result::Result<ModulePayload, FailureReason> {
        let response = self
            .client
            .post(self.invoke_url())
            .json(snapshot)
            .send()
            .await
            .map_err(transport_failure)?;

        let status = response.status();
        if status.is_success() {
            return response.json::<ModulePayload>().await.map_err(transport_failure);
        }

        let body = response.text().await.unwrap_or_default();
        if status == StatusCode::UNPROCESSABLE_ENTITY {
            Err(FailureReason::InvalidInput(body))
        } else {
            Err(FailureReason::AdapterError(format!("{status}: {body}")))
        }
    }
}

fn transport_failure(err: reqwest::Error) -> FailureReason {
    if err.is_timeout() {
        FailureReason::Timeout
    } else {
        FailureReason::AdapterError(err.to_string())
    }
}

#[async_trait]
impl ModuleAdapter for HttpModuleAdapter {
    async fn invoke(
        &self,
        snapshot: &PatientSnapshot,
        cancel: CancellationToken,
    ) -> std::result::Result<ModulePayload, FailureReason> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!(module = %self.kind, patient = %snapshot.patient_id, "module call abandoned");
                Err(FailureReason::AdapterError("cancelled".into()))
            }
            result = self.call(snapshot) => result,
        }
    }
}

/// Registers an [`HttpModuleAdapter`] for every module kind.
pub fn http_module_registry(client: Client, base_url: &str) -> ModuleRegistry {
    let mut registry = ModuleRegistry::new();
    for kind in ModuleKind::all_kinds() {
        registry.register(
            *kind,
            Arc::new(HttpModuleAdapter::new(client.clone(), base_url, *kind)),
        );
    }
    registry
}
