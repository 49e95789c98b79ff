use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::util::{non_empty, parse_bool, parse_csv};

/// Raw configuration as defined in a TOML (or JSON) file.
#[derive(Debug, Default, Clone, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub struct FileConfig {
    #[serde(default)]
    pub server: FileServerConfig,
    #[serde(default)]
    pub queue: FileQueueConfig,
    #[serde(default)]
    pub timeouts: FileTimeoutConfig,
    #[serde(default)]
    pub retry: FileRetryConfig,
    #[serde(default)]
    pub synthesis: FileSynthesisConfig,
    #[serde(default)]
    pub audit: FileAuditConfig,
    #[serde(default)]
    pub collaborators: FileCollaboratorsConfig,
    #[serde(default)]
    pub cors: FileCorsConfig,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct FileServerConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct FileQueueConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_depth: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worker_count: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub poll_interval_ms: Option<u64>,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct FileTimeoutConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub module_timeout_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dispatch_deadline_ms: Option<u64>,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct FileRetryConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_attempts: Option<u32>,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct FileSynthesisConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_succeeded_modules: Option<usize>,
    /// Module names as they appear on the wire (`cognitive`, `biometric`, ...).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub anchor_modules: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub draft_treatment_plan: Option<bool>,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct FileAuditConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel_capacity: Option<usize>,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct FileCollaboratorsConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub patient_service_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub module_service_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_timeout_ms: Option<u64>,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct FileCorsConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allowed_origins: Option<Vec<String>>,
}

/// Environment-derived configuration values.
///
/// Unparseable numbers and booleans are ignored so the next source in line
/// wins.
#[derive(Debug, Default, Clone)]
pub struct EnvConfig {
    pub config_path: Option<PathBuf>,
    pub server_host: Option<String>,
    pub server_port: Option<u16>,
    pub max_queue_depth: Option<usize>,
    pub worker_count: Option<usize>,
    pub poll_interval_ms: Option<u64>,
    pub module_timeout_ms: Option<u64>,
    pub dispatch_deadline_ms: Option<u64>,
    pub max_attempts: Option<u32>,
    pub min_succeeded_modules: Option<usize>,
    pub anchor_modules: Option<Vec<String>>,
    pub draft_treatment_plan: Option<bool>,
    pub audit_channel_capacity: Option<usize>,
    pub patient_service_url: Option<String>,
    pub module_service_url: Option<String>,
    pub collaborator_timeout_ms: Option<u64>,
    pub cors_allowed_origins: Option<Vec<String>>,
}

impl EnvConfig {
    pub fn gather() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from an arbitrary variable lookup instead of the process
    /// environment.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let text = |name: &str| non_empty(lookup(name));
        let number = |name: &str| text(name).and_then(|raw| raw.parse::<u64>().ok());

        Self {
            config_path: text("CAREWISE_CONFIG_PATH").map(PathBuf::from),
            server_host: text("CAREWISE_HOST"),
            server_port: text("CAREWISE_PORT").and_then(|raw| raw.parse().ok()),
            max_queue_depth: number("CAREWISE_MAX_QUEUE_DEPTH").map(|v| v as usize),
            worker_count: number("CAREWISE_WORKER_COUNT").map(|v| v as usize),
            poll_interval_ms: number("CAREWISE_POLL_INTERVAL_MS"),
            module_timeout_ms: number("CAREWISE_MODULE_TIMEOUT_MS"),
            dispatch_deadline_ms: number("CAREWISE_DISPATCH_DEADLINE_MS"),
            max_attempts: text("CAREWISE_MAX_ATTEMPTS").and_then(|raw| raw.parse().ok()),
            min_succeeded_modules: number("CAREWISE_MIN_SUCCEEDED_MODULES")
                .map(|v| v as usize),
            anchor_modules: lookup("CAREWISE_ANCHOR_MODULES").map(|raw| parse_csv(&raw)),
            draft_treatment_plan: text("CAREWISE_DRAFT_TREATMENT_PLAN")
                .and_then(|raw| parse_bool(&raw)),
            audit_channel_capacity: number("CAREWISE_AUDIT_CHANNEL_CAPACITY")
                .map(|v| v as usize),
            patient_service_url: text("CAREWISE_PATIENT_SERVICE_URL"),
            module_service_url: text("CAREWISE_MODULE_SERVICE_URL"),
            collaborator_timeout_ms: number("CAREWISE_COLLABORATOR_TIMEOUT_MS"),
            cors_allowed_origins: text("CAREWISE_CORS_ALLOWED_ORIGINS")
                .map(|raw| parse_csv(&raw)),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn env(pairs: &[(&str, &str)]) -> EnvConfig {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        EnvConfig::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn reads_prefixed_variables() {
        let env = env(&[
            ("CAREWISE_PORT", "8088"),
            ("CAREWISE_WORKER_COUNT", "8"),
            ("CAREWISE_ANCHOR_MODULES", "cognitive, persona"),
            ("CAREWISE_DRAFT_TREATMENT_PLAN", "off"),
            ("CAREWISE_CONFIG_PATH", "/etc/carewise.toml"),
        ]);
        assert_eq!(env.server_port, Some(8088));
        assert_eq!(env.worker_count, Some(8));
        assert_eq!(
            env.anchor_modules,
            Some(vec!["cognitive".to_string(), "persona".to_string()])
        );
        assert_eq!(env.draft_treatment_plan, Some(false));
        assert_eq!(env.config_path, Some(PathBuf::from("/etc/carewise.toml")));
    }

    #[test]
    fn empty_anchor_list_is_kept_but_bad_numbers_are_dropped() {
        let env = env(&[
            ("CAREWISE_ANCHOR_MODULES", ""),
            ("CAREWISE_MAX_QUEUE_DEPTH", "lots"),
            ("CAREWISE_HOST", "   "),
        ]);
        assert_eq!(env.anchor_modules, Some(Vec::new()));
        assert_eq!(env.max_queue_depth, None);
        assert_eq!(env.server_host, None);
    }

    #[test]
    fn file_sections_are_optional() {
        let file: FileConfig = toml::from_str(
            r#"
            [queue]
            max_depth = 12

            [synthesis]
            anchor_modules = []
            "#,
        )
        .unwrap();
        assert_eq!(file.queue.max_depth, Some(12));
        assert_eq!(file.queue.worker_count, None);
        assert_eq!(file.synthesis.anchor_modules, Some(Vec::new()));
        assert!(file.server.host.is_none());
    }
}
