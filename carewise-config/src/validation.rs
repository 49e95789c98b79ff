use carewise_core::analysis::ModuleKind;
use thiserror::Error;

use super::models::{CollaboratorsConfig, Config};

const MAX_SENSIBLE_WORKERS: usize = 64;
const MAX_SENSIBLE_QUEUE_DEPTH: usize = 100_000;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigGuardRailError {
    #[error(
        "dispatch deadline ({deadline_ms} ms) must not be shorter than the module timeout ({module_timeout_ms} ms)"
    )]
    DeadlineBelowModuleTimeout {
        deadline_ms: u64,
        module_timeout_ms: u64,
    },
    #[error("module timeout must be greater than zero")]
    ZeroModuleTimeout,
    #[error("worker pool needs at least one worker")]
    NoWorkers,
    #[error("queue max depth must be at least 1")]
    ZeroQueueDepth,
    #[error("retry max attempts must be at least 1")]
    ZeroRetryAttempts,
    #[error("audit channel capacity must be at least 1")]
    ZeroAuditCapacity,
    #[error("collaborator URL {field} must be an absolute http(s) URL, got '{value}'")]
    InvalidCollaboratorUrl { field: &'static str, value: String },
}

#[derive(Debug, Clone)]
pub struct ConfigWarning {
    pub message: String,
    pub hint: Option<String>,
}

#[derive(Debug, Default, Clone)]
pub struct ConfigWarnings {
    pub items: Vec<ConfigWarning>,
}

impl ConfigWarnings {
    pub fn push<S: Into<String>>(&mut self, message: S) {
        self.items.push(ConfigWarning {
            message: message.into(),
            hint: None,
        });
    }

    pub fn push_with_hint<S: Into<String>, H: Into<String>>(&mut self, message: S, hint: H) {
        self.items.push(ConfigWarning {
            message: message.into(),
            hint: Some(hint.into()),
        });
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn extend(&mut self, other: ConfigWarnings) {
        self.items.extend(other.items);
    }
}

pub fn apply_guard_rails(config: &Config) -> Result<ConfigWarnings, ConfigGuardRailError> {
    let mut warnings = ConfigWarnings::default();
    let orchestrator = &config.orchestrator;

    if orchestrator.timeouts.module_timeout_ms == 0 {
        return Err(ConfigGuardRailError::ZeroModuleTimeout);
    }
    if orchestrator.timeouts.dispatch_deadline_ms < orchestrator.timeouts.module_timeout_ms {
        return Err(ConfigGuardRailError::DeadlineBelowModuleTimeout {
            deadline_ms: orchestrator.timeouts.dispatch_deadline_ms,
            module_timeout_ms: orchestrator.timeouts.module_timeout_ms,
        });
    }
    if orchestrator.queue.worker_count == 0 {
        return Err(ConfigGuardRailError::NoWorkers);
    }
    if orchestrator.queue.max_depth == 0 {
        return Err(ConfigGuardRailError::ZeroQueueDepth);
    }
    if orchestrator.retry.max_attempts == 0 {
        return Err(ConfigGuardRailError::ZeroRetryAttempts);
    }
    if orchestrator.audit.channel_capacity == 0 {
        return Err(ConfigGuardRailError::ZeroAuditCapacity);
    }

    validate_collaborators(&config.collaborators)?;

    if orchestrator.queue.worker_count > MAX_SENSIBLE_WORKERS {
        warnings.push_with_hint(
            format!(
                "worker_count is {}; each worker can hold one job's fan-out open",
                orchestrator.queue.worker_count
            ),
            format!(
                "Values above {MAX_SENSIBLE_WORKERS} rarely help; size the pool against module service capacity"
            ),
        );
    }
    if orchestrator.queue.max_depth > MAX_SENSIBLE_QUEUE_DEPTH {
        warnings.push_with_hint(
            format!(
                "queue max_depth is {}; the backlog is held in memory",
                orchestrator.queue.max_depth
            ),
            "Lower queue.max_depth so saturation is reported before memory pressure",
        );
    }
    if orchestrator.synthesis.min_succeeded_modules > ModuleKind::all_kinds().len() {
        warnings.push(
            "synthesis.min_succeeded_modules exceeds the number of modules; every synthesis will be low-confidence",
        );
    }

    if config.collaborators.patient_service_url.is_none() {
        warnings.push_with_hint(
            "No patient service configured; only locally registered patients are known",
            "Set CAREWISE_PATIENT_SERVICE_URL or collaborators.patient_service_url",
        );
    }
    if config.collaborators.module_service_url.is_none() {
        warnings.push_with_hint(
            "No module service configured; every dispatched module will fail",
            "Set CAREWISE_MODULE_SERVICE_URL or collaborators.module_service_url",
        );
    }

    if config.cors.is_wildcard_included() {
        warnings.push("CORS allows any origin");
    }

    Ok(warnings)
}

fn validate_collaborators(
    collaborators: &CollaboratorsConfig,
) -> Result<(), ConfigGuardRailError> {
    for (field, value) in [
        ("patient_service_url", collaborators.patient_service_url.as_ref()),
        ("module_service_url", collaborators.module_service_url.as_ref()),
    ] {
        if let Some(value) = value
            && !(value.starts_with("http://") || value.starts_with("https://"))
        {
            return Err(ConfigGuardRailError::InvalidCollaboratorUrl {
                field,
                value: value.clone(),
            });
        }
    }
    Ok(())
}
