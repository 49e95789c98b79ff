use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::module::ModuleKind;

/// Global knobs that tune orchestrator behaviour.
///
/// All fields carry defaults so deployments can supply only the values they
/// care about.
#[derive(Clone, Debug, Serialize, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Queue sizing and worker pool parallelism.
    pub queue: QueueConfig,
    /// Per-module call timeout and per-job dispatch deadline.
    pub timeouts: TimeoutConfig,
    /// Retry ceiling for lineage chains.
    pub retry: RetryConfig,
    /// Low-confidence policy and treatment plan drafting.
    pub synthesis: SynthesisPolicy,
    /// Audit bus sizing.
    pub audit: AuditConfig,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct QueueConfig {
    /// Backlog size at which new admissions are rejected as saturated.
    pub max_depth: usize,
    /// Number of concurrent workers pulling from the queue.
    pub worker_count: usize,
    /// Fallback wake-up cadence for idle workers (ms).
    pub poll_interval_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_depth: 1_000,
            worker_count: 4,
            poll_interval_ms: 250,
        }
    }
}

impl QueueConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Bound on a single adapter invocation (ms).
    pub module_timeout_ms: u64,
    /// Bound on the whole fan-out of one job (ms). Must be >= module timeout.
    pub dispatch_deadline_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            module_timeout_ms: 30_000,
            dispatch_deadline_ms: 60_000,
        }
    }
}

impl TimeoutConfig {
    pub fn module_timeout(&self) -> Duration {
        Duration::from_millis(self.module_timeout_ms)
    }

    pub fn dispatch_deadline(&self) -> Duration {
        Duration::from_millis(self.dispatch_deadline_ms)
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetryConfig {
    /// Highest `attempt` value a lineage chain may reach.
    pub max_attempts: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self { max_attempts: 5 }
    }
}

/// Policy deciding when a synthesis is flagged low-confidence.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SynthesisPolicy {
    /// Fewer succeeded modules than this flags the artifact.
    pub min_succeeded_modules: usize,
    /// When non-empty, at least one of these must have succeeded.
    pub anchor_modules: Vec<ModuleKind>,
    /// Derive a treatment plan draft from merged recommendations.
    pub draft_treatment_plan: bool,
}

impl Default for SynthesisPolicy {
    fn default() -> Self {
        Self {
            min_succeeded_modules: 1,
            anchor_modules: vec![ModuleKind::Cognitive, ModuleKind::Biometric],
            draft_treatment_plan: true,
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AuditConfig {
    pub channel_capacity: usize,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 1_024,
        }
    }
}
