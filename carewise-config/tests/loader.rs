use std::{collections::HashMap, fs, path::PathBuf};

use carewise_config::{
    ConfigGuardRailError, ConfigLoadError, ConfigLoader, ConfigLoaderOptions, EnvConfig,
};
use carewise_core::analysis::ModuleKind;
use tempfile::TempDir;

fn env(pairs: &[(&str, &str)]) -> EnvConfig {
    let vars: HashMap<String, String> = pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    EnvConfig::from_lookup(|name| vars.get(name).cloned())
}

fn write_config(dir: &TempDir, name: &str, contents: &str) -> PathBuf {
    let path = dir.path().join(name);
    fs::write(&path, contents).unwrap();
    path
}

const SAMPLE: &str = r#"
[server]
host = "127.0.0.1"
port = 4100

[queue]
max_depth = 50
worker_count = 2

[timeouts]
module_timeout_ms = 2000
dispatch_deadline_ms = 5000

[synthesis]
anchor_modules = ["persona", "cognitive", "persona"]
draft_treatment_plan = false

[collaborators]
patient_service_url = "http://patients.internal/"
module_service_url = "http://modules.internal"
"#;

#[test]
fn file_values_fill_in_over_defaults() {
    let dir = TempDir::new().unwrap();
    let path = write_config(&dir, "carewise.toml", SAMPLE);

    let load = ConfigLoader::new()
        .with_config_path(&path)
        .load_with_env(EnvConfig::default())
        .unwrap();
    let config = load.config;

    assert_eq!(config.server.bind_address(), "127.0.0.1:4100");
    assert_eq!(config.orchestrator.queue.max_depth, 50);
    assert_eq!(config.orchestrator.queue.worker_count, 2);
    assert_eq!(config.orchestrator.queue.poll_interval_ms, 250);
    assert_eq!(config.orchestrator.timeouts.dispatch_deadline_ms, 5_000);
    assert_eq!(config.orchestrator.retry.max_attempts, 5);
    assert_eq!(
        config.orchestrator.synthesis.anchor_modules,
        vec![ModuleKind::Persona, ModuleKind::Cognitive]
    );
    assert!(!config.orchestrator.synthesis.draft_treatment_plan);
    assert_eq!(
        config.collaborators.patient_service_url.as_deref(),
        Some("http://patients.internal")
    );
    assert_eq!(config.metadata.config_path, Some(path));
    assert!(load.warnings.is_empty(), "{:?}", load.warnings);
}

#[test]
fn environment_overrides_file() {
    let dir = TempDir::new().unwrap();
    let path = write_config(&dir, "carewise.toml", SAMPLE);

    let load = ConfigLoader::new()
        .with_config_path(&path)
        .load_with_env(env(&[
            ("CAREWISE_PORT", "5000"),
            ("CAREWISE_WORKER_COUNT", "6"),
            ("CAREWISE_ANCHOR_MODULES", ""),
        ]))
        .unwrap();

    assert_eq!(load.config.server.port, 5000);
    assert_eq!(load.config.server.host, "127.0.0.1");
    assert_eq!(load.config.orchestrator.queue.worker_count, 6);
    assert!(load.config.orchestrator.synthesis.anchor_modules.is_empty());
}

#[test]
fn config_path_can_come_from_environment() {
    let dir = TempDir::new().unwrap();
    let path = write_config(&dir, "custom.toml", "[queue]\nmax_depth = 7\n");

    let load = ConfigLoader::new()
        .load_with_env(env(&[(
            "CAREWISE_CONFIG_PATH",
            path.to_str().unwrap(),
        )]))
        .unwrap();

    assert_eq!(load.config.orchestrator.queue.max_depth, 7);
}

#[test]
fn json_files_are_accepted() {
    let dir = TempDir::new().unwrap();
    let path = write_config(
        &dir,
        "carewise.json",
        r#"{ "retry": { "max_attempts": 2 }, "server": { "port": 9000 } }"#,
    );

    let load = ConfigLoader::new()
        .with_config_path(&path)
        .load_with_env(EnvConfig::default())
        .unwrap();

    assert_eq!(load.config.orchestrator.retry.max_attempts, 2);
    assert_eq!(load.config.server.port, 9000);
}

#[test]
fn defaults_apply_without_any_file() {
    let dir = TempDir::new().unwrap();
    let load = ConfigLoader::with_options(ConfigLoaderOptions {
        config_path: None,
        env_file: Some(dir.path().join("missing.env")),
    })
    .load_with_env(EnvConfig::default())
    .unwrap();

    assert_eq!(load.config.server.port, 3100);
    assert_eq!(load.config.server.host, "0.0.0.0");
    assert_eq!(load.config.orchestrator.queue.max_depth, 1_000);
    assert_eq!(load.config.collaborators.request_timeout_ms, 10_000);
    assert!(load.config.metadata.config_path.is_none());
    assert!(
        load.warnings
            .items
            .iter()
            .any(|w| w.message.contains("No carewise.toml"))
    );
}

#[test]
fn missing_explicit_file_is_an_error() {
    let dir = TempDir::new().unwrap();
    let err = ConfigLoader::new()
        .with_config_path(dir.path().join("absent.toml"))
        .load_with_env(EnvConfig::default())
        .unwrap_err();
    assert!(matches!(err, ConfigLoadError::MissingConfig { .. }));
}

#[test]
fn malformed_file_reports_parse_error() {
    let dir = TempDir::new().unwrap();
    let path = write_config(&dir, "carewise.toml", "[queue\nmax_depth = ");
    let err = ConfigLoader::new()
        .with_config_path(&path)
        .load_with_env(EnvConfig::default())
        .unwrap_err();
    assert!(matches!(err, ConfigLoadError::Parse { .. }));
}

#[test]
fn unknown_anchor_module_is_rejected() {
    let dir = TempDir::new().unwrap();
    let path = write_config(
        &dir,
        "carewise.toml",
        "[synthesis]\nanchor_modules = [\"astrology\"]\n",
    );
    let err = ConfigLoader::new()
        .with_config_path(&path)
        .load_with_env(EnvConfig::default())
        .unwrap_err();
    assert!(matches!(err, ConfigLoadError::UnknownModule { value } if value == "astrology"));
}

#[test]
fn guard_rails_run_on_the_resolved_config() {
    let dir = TempDir::new().unwrap();
    let path = write_config(&dir, "carewise.toml", SAMPLE);
    let err = ConfigLoader::new()
        .with_config_path(&path)
        .load_with_env(env(&[("CAREWISE_DISPATCH_DEADLINE_MS", "1000")]))
        .unwrap_err();
    assert!(matches!(
        err,
        ConfigLoadError::GuardRail(ConfigGuardRailError::DeadlineBelowModuleTimeout {
            deadline_ms: 1_000,
            module_timeout_ms: 2_000,
        })
    ));
}
