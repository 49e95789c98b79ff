use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use super::{
    config::SynthesisPolicy,
    job::{AnalysisJob, JobId, PatientId},
    module::{ModuleKind, ModulePayload},
};

/// Cross-module roll-up derived from the succeeded sections.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SynthesisSummary {
    pub modules_succeeded: Vec<ModuleKind>,
    pub modules_failed: Vec<ModuleKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mean_score: Option<f64>,
    pub key_findings: Vec<String>,
    pub recommendations: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PlannedIntervention {
    pub module: ModuleKind,
    pub description: String,
}

/// Draft plan assembled from module recommendations. Never final; a
/// clinician has to sign off.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TreatmentPlanDraft {
    pub title: String,
    pub goals: Vec<String>,
    pub interventions: Vec<PlannedIntervention>,
    pub requires_review: bool,
}

/// The merged result of a finished job.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SynthesisArtifact {
    pub job_id: JobId,
    pub patient_id: PatientId,
    pub sections: BTreeMap<ModuleKind, ModulePayload>,
    pub summary: SynthesisSummary,
    pub low_confidence: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub treatment_plan_draft: Option<TreatmentPlanDraft>,
}

/// Deterministic merge of succeeded module payloads.
///
/// Every collection in the artifact is keyed or sorted, so the output does
/// not depend on the order in which modules finished.
#[derive(Clone, Debug, Default)]
pub struct Synthesizer {
    policy: SynthesisPolicy,
}

impl Synthesizer {
    pub fn new(policy: SynthesisPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &SynthesisPolicy {
        &self.policy
    }

    pub fn synthesize(&self, job: &AnalysisJob) -> SynthesisArtifact {
        let sections: BTreeMap<ModuleKind, ModulePayload> = job
            .module_results
            .iter()
            .filter_map(|(kind, outcome)| {
                outcome.payload().map(|payload| (*kind, payload.clone()))
            })
            .collect();

        let modules_succeeded: Vec<ModuleKind> =
            sections.keys().copied().collect();
        let modules_failed: Vec<ModuleKind> =
            job.failed_modules().into_iter().collect();

        let scores: Vec<f64> = sections
            .values()
            .filter_map(|payload| payload.score)
            .filter(|score| score.is_finite())
            .collect();
        let mean_score = (!scores.is_empty())
            .then(|| scores.iter().sum::<f64>() / scores.len() as f64);

        let key_findings = merged(sections.values().map(|p| &p.findings));
        let recommendations =
            merged(sections.values().map(|p| &p.recommendations));

        let low_confidence = self.is_low_confidence(&modules_succeeded);

        let treatment_plan_draft = (self.policy.draft_treatment_plan
            && !recommendations.is_empty())
        .then(|| draft_plan(job, &sections, &key_findings));

        SynthesisArtifact {
            job_id: job.id,
            patient_id: job.patient_id.clone(),
            sections,
            summary: SynthesisSummary {
                modules_succeeded,
                modules_failed,
                mean_score,
                key_findings,
                recommendations,
            },
            low_confidence,
            treatment_plan_draft,
        }
    }

    fn is_low_confidence(&self, succeeded: &[ModuleKind]) -> bool {
        if succeeded.len() < self.policy.min_succeeded_modules {
            return true;
        }
        !self.policy.anchor_modules.is_empty()
            && !self
                .policy
                .anchor_modules
                .iter()
                .any(|anchor| succeeded.contains(anchor))
    }
}

fn merged<'a, I>(lists: I) -> Vec<String>
where
    I: Iterator<Item = &'a Vec<String>>,
{
    lists
        .flatten()
        .map(|item| item.trim())
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

fn draft_plan(
    job: &AnalysisJob,
    sections: &BTreeMap<ModuleKind, ModulePayload>,
    key_findings: &[String],
) -> TreatmentPlanDraft {
    let mut interventions = Vec::new();
    for (kind, payload) in sections {
        let unique: BTreeSet<&str> = payload
            .recommendations
            .iter()
            .map(|r| r.trim())
            .filter(|r| !r.is_empty())
            .collect();
        interventions.extend(unique.into_iter().map(|description| {
            PlannedIntervention {
                module: *kind,
                description: description.to_string(),
            }
        }));
    }

    let goals = key_findings
        .iter()
        .map(|finding| format!("Address: {finding}"))
        .collect();

    TreatmentPlanDraft {
        title: format!("Draft care plan for patient {}", job.patient_id),
        goals,
        interventions,
        requires_review: true,
    }
}
