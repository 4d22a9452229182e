//! Shared types for the pipeline driver and its stages

use crate::artifacts::{Artifact, DeploymentManifest};
use crate::document::Mapping;
use crate::error::PipelineError;
use crate::evidence::{EvidenceRecord, EvidenceStatus, GeneratedChain, Stage};
use crate::executor::ExecutionBatch;
use crate::governance::GovernanceResult;
use crate::loader::{ConflictResolver, LoadResult, MergeResult, MergeStrategy};
use crate::normalizer::NormalizerResult;
use crate::parser::ParseBatch;
use crate::renderer::RenderBatch;
use crate::validator::ValidationResult;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use uuid::Uuid;
use validator::Validate;

/// Outcome status shared by every stage result
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageStatus {
    Success,
    Warning,
    Error,
}

impl StageStatus {
    /// The more severe of two statuses
    pub fn worst(self, other: StageStatus) -> StageStatus {
        self.max(other)
    }

    pub fn is_error(&self) -> bool {
        matches!(self, StageStatus::Error)
    }
}

impl From<StageStatus> for EvidenceStatus {
    fn from(status: StageStatus) -> Self {
        match status {
            StageStatus::Success => EvidenceStatus::Success,
            StageStatus::Warning => EvidenceStatus::Warning,
            StageStatus::Error => EvidenceStatus::Error,
        }
    }
}

/// Per-run options
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct PipelineOptions {
    pub merge_strategy: MergeStrategy,
    /// Plan execution without side effects
    pub dry_run: bool,
    /// Proceed past stages that finished with warnings
    pub continue_on_warning: bool,
    /// Maximum number of remote hosts contacted at once
    #[validate(range(min = 1, max = 64))]
    pub remote_concurrency: usize,
    /// Environment-specific values deep-merged over the document
    #[serde(skip_serializing_if = "Option::is_none")]
    pub environment_overlay: Option<Mapping>,
    /// Resolver used by `MergeStrategy::Custom`
    #[serde(skip)]
    pub conflict_resolver: Option<ConflictResolver>,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            merge_strategy: MergeStrategy::Error,
            dry_run: false,
            continue_on_warning: false,
            remote_concurrency: 4,
            environment_overlay: None,
            conflict_resolver: None,
        }
    }
}

/// Closed set of stage results
#[derive(Debug, Clone)]
pub enum StageResult {
    Load(LoadResult),
    Parse(ParseBatch),
    Merge(MergeResult),
    Normalize(NormalizerResult),
    Validate(ValidationResult),
    Govern(GovernanceResult),
    Render(RenderBatch),
    Execute(ExecutionBatch),
}

impl StageResult {
    pub fn stage(&self) -> Stage {
        match self {
            StageResult::Load(_) | StageResult::Merge(_) => Stage::Load,
            StageResult::Parse(_) => Stage::Parse,
            StageResult::Normalize(_) => Stage::Normalize,
            StageResult::Validate(_) => Stage::Validate,
            StageResult::Govern(_) => Stage::Govern,
            StageResult::Render(_) => Stage::Render,
            StageResult::Execute(_) => Stage::Execute,
        }
    }

    /// Short name of the variant, used in pipeline evidence
    pub fn name(&self) -> &'static str {
        match self {
            StageResult::Load(_) => "load",
            StageResult::Parse(_) => "parse",
            StageResult::Merge(_) => "merge",
            StageResult::Normalize(_) => "normalize",
            StageResult::Validate(_) => "validate",
            StageResult::Govern(_) => "govern",
            StageResult::Render(_) => "render",
            StageResult::Execute(_) => "execute",
        }
    }

    pub fn status(&self) -> StageStatus {
        match self {
            StageResult::Load(r) => r.status,
            StageResult::Parse(r) => r.status,
            StageResult::Merge(r) => r.status,
            StageResult::Normalize(r) => r.status,
            StageResult::Validate(r) => r.status,
            StageResult::Govern(r) => r.status,
            StageResult::Render(r) => r.status,
            StageResult::Execute(r) => r.status,
        }
    }

    pub fn errors(&self) -> Vec<PipelineError> {
        match self {
            StageResult::Load(r) => r.errors.clone(),
            StageResult::Parse(r) => r.errors(),
            StageResult::Merge(r) => r.errors.clone(),
            StageResult::Normalize(r) => r.errors.clone(),
            StageResult::Validate(r) => r.errors.clone(),
            StageResult::Govern(r) => r.errors(),
            StageResult::Render(r) => r.errors(),
            StageResult::Execute(r) => r.errors(),
        }
    }

    /// Evidence produced by the stage, in production order
    pub fn evidence(&self) -> Vec<EvidenceRecord> {
        match self {
            StageResult::Load(r) => r.evidence.clone(),
            StageResult::Parse(r) => r.evidence(),
            StageResult::Merge(r) => r.evidence.clone(),
            StageResult::Normalize(r) => r.evidence.clone(),
            StageResult::Validate(r) => r.evidence.clone(),
            StageResult::Govern(r) => r.evidence.clone(),
            StageResult::Render(r) => r.evidence(),
            StageResult::Execute(r) => r.evidence(),
        }
    }

    /// Compact JSON description for evidence and CLI output
    pub fn summary(&self) -> Value {
        json!({
            "stage": self.name(),
            "status": self.status(),
            "errors": self.errors(),
        })
    }
}

/// Everything a caller receives from one run
#[derive(Debug, Clone)]
pub struct PipelineRun {
    pub run_id: Uuid,
    /// Result of the last stage that ran
    pub final_result: StageResult,
    pub evidence_chain: GeneratedChain,
    /// Stages that completed and let the run continue
    pub completed: Vec<String>,
    /// Stage the run halted at, if it did not finish
    pub halted_at: Option<String>,
    pub artifacts: Vec<Arc<Artifact>>,
    pub manifest: Option<DeploymentManifest>,
}

impl PipelineRun {
    pub fn succeeded(&self) -> bool {
        self.halted_at.is_none() && !self.final_result.status().is_error()
    }

    pub fn summary(&self) -> Value {
        json!({
            "runId": self.run_id,
            "succeeded": self.succeeded(),
            "completed": self.completed,
            "haltedAt": self.halted_at,
            "finalResult": self.final_result.summary(),
            "artifacts": self.artifacts.iter().map(|a| json!({
                "id": a.id,
                "name": a.name,
                "type": a.artifact_type,
                "contentHash": a.content_hash,
            })).collect::<Vec<_>>(),
            "manifestId": self.manifest.as_ref().map(|m| m.id),
            "evidenceChain": {
                "chainId": self.evidence_chain.chain_id,
                "records": self.evidence_chain.evidence.len(),
                "hash": self.evidence_chain.hash,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worst_status() {
        assert_eq!(StageStatus::Success.worst(StageStatus::Warning), StageStatus::Warning);
        assert_eq!(StageStatus::Error.worst(StageStatus::Warning), StageStatus::Error);
        assert_eq!(StageStatus::Success.worst(StageStatus::Success), StageStatus::Success);
    }

    #[test]
    fn test_default_options() {
        let options = PipelineOptions::default();
        assert!(options.validate().is_ok());
        assert_eq!(options.remote_concurrency, 4);
        assert!(!options.dry_run);

        let json = serde_json::to_value(&options).unwrap();
        assert_eq!(json["merge_strategy"], "error");
        assert!(json.get("environment_overlay").is_none());
    }

    #[test]
    fn test_options_deserialize_with_defaults() {
        let options: PipelineOptions =
            serde_json::from_value(json!({"merge_strategy": "newest", "dry_run": true})).unwrap();
        assert_eq!(options.merge_strategy, MergeStrategy::Newest);
        assert!(options.dry_run);
        assert!(!options.continue_on_warning);
        assert_eq!(options.remote_concurrency, 4);
    }
}
