use std::{collections::BTreeSet, fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::error::{OrchestratorError, Result};

/// The independent analysis capabilities a job can fan out to.
#[derive(
    Clone,
    Copy,
    Debug,
    Eq,
    PartialEq,
    Hash,
    Ord,
    PartialOrd,
    Serialize,
    Deserialize,
)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum ModuleKind {
    Cognitive = 0,
    Biometric = 1,
    Persona = 2,
    Social = 3,
    Linguistic = 4,
    Holistic = 5,
}

impl ModuleKind {
    pub fn all_kinds() -> &'static [Self] {
        &[
            ModuleKind::Cognitive,
            ModuleKind::Biometric,
            ModuleKind::Persona,
            ModuleKind::Social,
            ModuleKind::Linguistic,
            ModuleKind::Holistic,
        ]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ModuleKind::Cognitive => "cognitive",
            ModuleKind::Biometric => "biometric",
            ModuleKind::Persona => "persona",
            ModuleKind::Social => "social",
            ModuleKind::Linguistic => "linguistic",
            ModuleKind::Holistic => "holistic",
        }
    }
}

impl fmt::Display for ModuleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ModuleKind {
    type Err = OrchestratorError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cognitive" => Ok(ModuleKind::Cognitive),
            "biometric" => Ok(ModuleKind::Biometric),
            // "cultural" was the persona module's name in older clients
            "persona" | "cultural" => Ok(ModuleKind::Persona),
            "social" => Ok(ModuleKind::Social),
            "linguistic" => Ok(ModuleKind::Linguistic),
            "holistic" => Ok(ModuleKind::Holistic),
            other => Err(OrchestratorError::Validation(format!(
                "unknown analysis module '{other}'"
            ))),
        }
    }
}

/// Normalises a caller-supplied module list into a non-empty set.
pub fn module_set<I>(modules: I) -> Result<BTreeSet<ModuleKind>>
where
    I: IntoIterator<Item = ModuleKind>,
{
    let set: BTreeSet<ModuleKind> = modules.into_iter().collect();
    if set.is_empty() {
        return Err(OrchestratorError::Validation(
            "at least one analysis module must be requested".into(),
        ));
    }
    Ok(set)
}

/// Typed output of one successful module invocation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, Default)]
pub struct ModulePayload {
    pub summary: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
    #[serde(default)]
    pub findings: Vec<String>,
    #[serde(default)]
    pub recommendations: Vec<String>,
    #[serde(default)]
    pub data: serde_json::Value,
}

/// Why a single module slot failed. Scoped to that slot only.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(tag = "reason", content = "detail", rename_all = "snake_case")]
pub enum FailureReason {
    Timeout,
    AdapterError(String),
    InvalidInput(String),
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::Timeout => write!(f, "timed out"),
            FailureReason::AdapterError(msg) => {
                write!(f, "adapter error: {msg}")
            }
            FailureReason::InvalidInput(msg) => {
                write!(f, "invalid input: {msg}")
            }
        }
    }
}

/// Progress of one requested module within a job.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, Default)]
#[serde(tag = "status", content = "value", rename_all = "snake_case")]
pub enum ModuleOutcome {
    #[default]
    Pending,
    Succeeded(ModulePayload),
    Failed(FailureReason),
}

impl ModuleOutcome {
    pub fn is_pending(&self) -> bool {
        matches!(self, ModuleOutcome::Pending)
    }

    pub fn is_succeeded(&self) -> bool {
        matches!(self, ModuleOutcome::Succeeded(_))
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, ModuleOutcome::Failed(_))
    }

    pub fn payload(&self) -> Option<&ModulePayload> {
        match self {
            ModuleOutcome::Succeeded(payload) => Some(payload),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_module_names_case_insensitively() {
        assert_eq!(
            "Biometric".parse::<ModuleKind>().unwrap(),
            ModuleKind::Biometric
        );
        assert_eq!(
            "cultural".parse::<ModuleKind>().unwrap(),
            ModuleKind::Persona
        );
        assert!("astrology".parse::<ModuleKind>().is_err());
    }

    #[test]
    fn module_set_rejects_empty_and_collapses_duplicates() {
        assert!(module_set(Vec::new()).is_err());

        let set = module_set([
            ModuleKind::Social,
            ModuleKind::Cognitive,
            ModuleKind::Social,
        ])
        .unwrap();
        assert_eq!(
            set.into_iter().collect::<Vec<_>>(),
            vec![ModuleKind::Cognitive, ModuleKind::Social]
        );
    }

    #[test]
    fn outcome_serializes_with_status_tag() {
        let failed = ModuleOutcome::Failed(FailureReason::Timeout);
        let json = serde_json::to_value(&failed).unwrap();
        assert_eq!(json["status"], "failed");
        assert_eq!(json["value"]["reason"], "timeout");
    }
}
