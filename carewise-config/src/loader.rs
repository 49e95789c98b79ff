use std::{
    fs,
    path::{Path, PathBuf},
};

use carewise_core::analysis::{
    AuditConfig, ModuleKind, OrchestratorConfig, QueueConfig, RetryConfig, SynthesisPolicy,
    TimeoutConfig,
};
use thiserror::Error;
use tracing::debug;

use crate::{
    models::{
        CollaboratorsConfig, Config, ConfigMetadata, CorsConfig, DEFAULT_COLLABORATOR_TIMEOUT_MS,
        DEFAULT_HOST, DEFAULT_PORT, ServerConfig, default_cors_origins,
        sources::{self, EnvConfig, FileConfig},
    },
    validation::{self, ConfigGuardRailError, ConfigWarnings},
};

const DEFAULT_CONFIG_LOCATIONS: &[&str] = &["carewise.toml", "config/carewise.toml"];

#[derive(Debug, Default, Clone)]
pub struct ConfigLoaderOptions {
    pub config_path: Option<PathBuf>,
    pub env_file: Option<PathBuf>,
}

#[derive(Debug, Default)]
pub struct ConfigLoader {
    options: ConfigLoaderOptions,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_options(options: ConfigLoaderOptions) -> Self {
        Self { options }
    }

    pub fn with_config_path<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.options.config_path = Some(path.into());
        self
    }

    pub fn with_env_file<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.options.env_file = Some(path.into());
        self
    }

    /// Load `.env`, read the process environment and resolve the config.
    pub fn load(&self) -> Result<ConfigLoad, ConfigLoadError> {
        let env_file_loaded = match &self.options.env_file {
            Some(path) => {
                dotenvy::from_path(path)
                    .map(|_| true)
                    .or_else(|err| match err {
                        dotenvy::Error::Io(_) => Ok(false),
                        _ => Err(err),
                    })?
            }
            None => dotenvy::dotenv().map(|_| true).or_else(|err| match err {
                dotenvy::Error::Io(_) => Ok(false),
                _ => Err(err),
            })?,
        };

        let mut load = self.load_with_env(EnvConfig::gather())?;
        load.config.metadata.env_file_loaded = env_file_loaded;
        Ok(load)
    }

    /// Resolve against an already gathered environment. The process
    /// environment and `.env` files are not consulted.
    pub fn load_with_env(&self, env: EnvConfig) -> Result<ConfigLoad, ConfigLoadError> {
        let (file_config, config_path) = self.load_file_config(&env)?;
        let (config, warnings) = compose_config(file_config, env, config_path)?;
        Ok(ConfigLoad { config, warnings })
    }

    fn load_file_config(
        &self,
        env: &EnvConfig,
    ) -> Result<(Option<FileConfig>, Option<PathBuf>), ConfigLoadError> {
        let path = if let Some(explicit) = self.options.config_path.as_ref() {
            explicit.clone()
        } else if let Some(from_env) = env.config_path.as_ref() {
            from_env.clone()
        } else {
            match DEFAULT_CONFIG_LOCATIONS
                .iter()
                .map(PathBuf::from)
                .find(|candidate| candidate.exists())
            {
                Some(found) => found,
                None => return Ok((None, None)),
            }
        };

        // Explicit and environment-provided paths must exist.
        if !path.exists() {
            return Err(ConfigLoadError::MissingConfig { path });
        }

        debug!(path = %path.display(), "reading configuration file");
        let contents = fs::read_to_string(&path).map_err(|source| ConfigLoadError::Io {
            path: path.clone(),
            source,
        })?;
        let file_config = parse_file_config(&path, &contents)?;

        Ok((Some(file_config), Some(path)))
    }
}

fn parse_file_config(path: &Path, contents: &str) -> Result<FileConfig, ConfigLoadError> {
    let is_json = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));

    if is_json {
        serde_json::from_str(contents).map_err(|source| ConfigLoadError::ParseJson {
            path: path.to_path_buf(),
            source,
        })
    } else {
        toml::from_str(contents).map_err(|source| ConfigLoadError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }
}

fn compose_config(
    file_config: Option<FileConfig>,
    env: EnvConfig,
    config_path: Option<PathBuf>,
) -> Result<(Config, ConfigWarnings), ConfigLoadError> {
    let mut warnings = ConfigWarnings::default();

    if config_path.is_none() {
        warnings.push_with_hint(
            "No carewise.toml detected; using environment variables and defaults",
            "Pass --config or set CAREWISE_CONFIG_PATH to use a configuration file",
        );
    }

    let FileConfig {
        server: file_server,
        queue: file_queue,
        timeouts: file_timeouts,
        retry: file_retry,
        synthesis: file_synthesis,
        audit: file_audit,
        collaborators: file_collaborators,
        cors: file_cors,
    } = file_config.unwrap_or_default();

    let server = ServerConfig {
        host: env
            .server_host
            .clone()
            .or(file_server.host)
            .unwrap_or_else(|| DEFAULT_HOST.to_string()),
        port: env.server_port.or(file_server.port).unwrap_or(DEFAULT_PORT),
    };

    let orchestrator = compose_orchestrator(
        &env,
        file_queue,
        file_timeouts,
        file_retry,
        file_synthesis,
        file_audit,
    )?;

    let collaborators = CollaboratorsConfig {
        patient_service_url: env
            .patient_service_url
            .clone()
            .or(file_collaborators.patient_service_url)
            .map(|url| url.trim_end_matches('/').to_string()),
        module_service_url: env
            .module_service_url
            .clone()
            .or(file_collaborators.module_service_url)
            .map(|url| url.trim_end_matches('/').to_string()),
        request_timeout_ms: env
            .collaborator_timeout_ms
            .or(file_collaborators.request_timeout_ms)
            .unwrap_or(DEFAULT_COLLABORATOR_TIMEOUT_MS),
    };

    let cors = CorsConfig {
        allowed_origins: env
            .cors_allowed_origins
            .clone()
            .or(file_cors.allowed_origins)
            .unwrap_or_else(default_cors_origins),
    };

    let config = Config {
        server,
        orchestrator,
        collaborators,
        cors,
        metadata: ConfigMetadata {
            config_path,
            env_file_loaded: false,
        },
    };

    let guard_warnings = validation::apply_guard_rails(&config)?;
    warnings.extend(guard_warnings);

    Ok((config, warnings))
}

fn compose_orchestrator(
    env: &EnvConfig,
    file_queue: sources::FileQueueConfig,
    file_timeouts: sources::FileTimeoutConfig,
    file_retry: sources::FileRetryConfig,
    file_synthesis: sources::FileSynthesisConfig,
    file_audit: sources::FileAuditConfig,
) -> Result<OrchestratorConfig, ConfigLoadError> {
    let defaults = OrchestratorConfig::default();

    let queue = QueueConfig {
        max_depth: env
            .max_queue_depth
            .or(file_queue.max_depth)
            .unwrap_or(defaults.queue.max_depth),
        worker_count: env
            .worker_count
            .or(file_queue.worker_count)
            .unwrap_or(defaults.queue.worker_count),
        poll_interval_ms: env
            .poll_interval_ms
            .or(file_queue.poll_interval_ms)
            .unwrap_or(defaults.queue.poll_interval_ms),
    };

    let timeouts = TimeoutConfig {
        module_timeout_ms: env
            .module_timeout_ms
            .or(file_timeouts.module_timeout_ms)
            .unwrap_or(defaults.timeouts.module_timeout_ms),
        dispatch_deadline_ms: env
            .dispatch_deadline_ms
            .or(file_timeouts.dispatch_deadline_ms)
            .unwrap_or(defaults.timeouts.dispatch_deadline_ms),
    };

    let retry = RetryConfig {
        max_attempts: env
            .max_attempts
            .or(file_retry.max_attempts)
            .unwrap_or(defaults.retry.max_attempts),
    };

    let anchor_modules = match env.anchor_modules.clone().or(file_synthesis.anchor_modules) {
        Some(names) => parse_modules(&names)?,
        None => defaults.synthesis.anchor_modules.clone(),
    };
    let synthesis = SynthesisPolicy {
        min_succeeded_modules: env
            .min_succeeded_modules
            .or(file_synthesis.min_succeeded_modules)
            .unwrap_or(defaults.synthesis.min_succeeded_modules),
        anchor_modules,
        draft_treatment_plan: env
            .draft_treatment_plan
            .or(file_synthesis.draft_treatment_plan)
            .unwrap_or(defaults.synthesis.draft_treatment_plan),
    };

    let audit = AuditConfig {
        channel_capacity: env
            .audit_channel_capacity
            .or(file_audit.channel_capacity)
            .unwrap_or(defaults.audit.channel_capacity),
    };

    Ok(OrchestratorConfig {
        queue,
        timeouts,
        retry,
        synthesis,
        audit,
    })
}

fn parse_modules(names: &[String]) -> Result<Vec<ModuleKind>, ConfigLoadError> {
    let mut modules = Vec::with_capacity(names.len());
    for name in names {
        let kind: ModuleKind = name.parse().map_err(|_| ConfigLoadError::UnknownModule {
            value: name.clone(),
        })?;
        if !modules.contains(&kind) {
            modules.push(kind);
        }
    }
    Ok(modules)
}

#[derive(Debug, Error)]
pub enum ConfigLoadError {
    #[error("configuration file {path} does not exist")]
    MissingConfig { path: PathBuf },
    #[error("failed to read configuration file {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse configuration file {path}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("failed to parse configuration file {path}")]
    ParseJson {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("unknown analysis module '{value}' in synthesis.anchor_modules")]
    UnknownModule { value: String },
    #[error(transparent)]
    GuardRail(#[from] ConfigGuardRailError),
    #[error(transparent)]
    EnvFile(#[from] dotenvy::Error),
}

#[derive(Debug)]
pub struct ConfigLoad {
    pub config: Config,
    pub warnings: ConfigWarnings,
}
