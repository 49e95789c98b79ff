use std::sync::Arc;

use anyhow::Context;
use tracing::info;

use carewise_config::Config;
use carewise_core::analysis::{
    AnalysisOrchestrator, InMemoryPatientDirectory, ModuleRegistry, PatientDirectory,
};

use super::{
    app_state::AppState,
    collaborators::{HttpPatientDirectory, build_http_client, http_module_registry},
};

/// Wire the orchestrator to the configured collaborators. Workers are not
/// started here.
pub fn build_app_state(config: Config) -> anyhow::Result<AppState> {
    let client = build_http_client(config.collaborators.request_timeout())
        .context("failed to build collaborator HTTP client")?;

    let patients: Arc<dyn PatientDirectory> = match &config.collaborators.patient_service_url {
        Some(url) => {
            info!(url = %url, "using remote patient service");
            Arc::new(HttpPatientDirectory::new(client.clone(), url.as_str()))
        }
        None => Arc::new(InMemoryPatientDirectory::new()),
    };

    let modules = match &config.collaborators.module_service_url {
        Some(url) => {
            info!(url = %url, "using remote module service");
            http_module_registry(client, url)
        }
        None => ModuleRegistry::new(),
    };

    let orchestrator = AnalysisOrchestrator::new(config.orchestrator.clone(), patients, modules);
    Ok(AppState::new(Arc::new(orchestrator), Arc::new(config)))
}
