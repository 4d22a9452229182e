//! Evidence chain
//!
//! Append-only, hash-chained audit trail of a single pipeline run. Every
//! record links to its predecessor through `previous_hash`, and the chain
//! carries a SHA-256 digest over the full serialized sequence which is
//! recomputed on every append.

use crate::document::Mapping;
use crate::error::PipelineError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Pipeline stage that produced a record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Load,
    Parse,
    Normalize,
    Validate,
    Govern,
    Render,
    Execute,
    Artifacts,
    Pipeline,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Load => "load",
            Stage::Parse => "parse",
            Stage::Normalize => "normalize",
            Stage::Validate => "validate",
            Stage::Govern => "govern",
            Stage::Render => "render",
            Stage::Execute => "execute",
            Stage::Artifacts => "artifacts",
            Stage::Pipeline => "pipeline",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EvidenceStatus {
    Success,
    Warning,
    Error,
}

/// One audited operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvidenceRecord {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub stage: Stage,
    pub component: String,
    pub action: String,
    pub status: EvidenceStatus,
    pub input: Value,
    pub output: Value,
    pub metrics: Mapping,
    /// Hash of the preceding record; assigned when the record joins a chain
    pub previous_hash: Option<String>,
    /// Hash of this record; assigned when the record joins a chain
    pub record_hash: String,
}

impl EvidenceRecord {
    pub fn new(
        stage: Stage,
        component: impl Into<String>,
        action: impl Into<String>,
        status: EvidenceStatus,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            stage,
            component: component.into(),
            action: action.into(),
            status,
            input: Value::Null,
            output: Value::Null,
            metrics: Mapping::new(),
            previous_hash: None,
            record_hash: String::new(),
        }
    }

    pub fn success(stage: Stage, component: impl Into<String>, action: impl Into<String>) -> Self {
        Self::new(stage, component, action, EvidenceStatus::Success)
    }

    pub fn warning(stage: Stage, component: impl Into<String>, action: impl Into<String>) -> Self {
        Self::new(stage, component, action, EvidenceStatus::Warning)
    }

    pub fn error(stage: Stage, component: impl Into<String>, action: impl Into<String>) -> Self {
        Self::new(stage, component, action, EvidenceStatus::Error)
    }

    pub fn with_input(mut self, input: Value) -> Self {
        self.input = input;
        self
    }

    pub fn with_output(mut self, output: Value) -> Self {
        self.output = output;
        self
    }

    pub fn with_metric(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metrics.insert(key.into(), value.into());
        self
    }

    /// Attach an error as the record output
    pub fn with_error(mut self, err: &PipelineError) -> Self {
        self.output = serde_json::to_value(err).unwrap_or(Value::Null);
        self
    }

    /// Hash over every field except `record_hash` itself
    pub fn compute_hash(&self) -> String {
        #[derive(Serialize)]
        struct Digestible<'a> {
            id: &'a Uuid,
            timestamp: String,
            stage: Stage,
            component: &'a str,
            action: &'a str,
            status: EvidenceStatus,
            input: &'a Value,
            output: &'a Value,
            metrics: &'a Mapping,
            previous_hash: Option<&'a str>,
        }

        let digestible = Digestible {
            id: &self.id,
            timestamp: self.timestamp.to_rfc3339(),
            stage: self.stage,
            component: &self.component,
            action: &self.action,
            status: self.status,
            input: &self.input,
            output: &self.output,
            metrics: &self.metrics,
            previous_hash: self.previous_hash.as_deref(),
        };

        let bytes = serde_json::to_vec(&digestible).unwrap_or_default();
        let mut hasher = Sha256::new();
        hasher.update(&bytes);
        hex::encode(hasher.finalize())
    }
}

/// Digest over the ordered, serialized record sequence
pub fn compute_chain_hash(records: &[EvidenceRecord]) -> String {
    let mut hasher = Sha256::new();
    for record in records {
        let bytes = serde_json::to_vec(record).unwrap_or_default();
        hasher.update((bytes.len() as u64).to_be_bytes());
        hasher.update(&bytes);
    }
    hex::encode(hasher.finalize())
}

/// Run-scoped evidence chain
#[derive(Debug, Clone)]
pub struct EvidenceChain {
    chain_id: Uuid,
    created_at: DateTime<Utc>,
    records: Vec<EvidenceRecord>,
    hash: String,
}

impl EvidenceChain {
    pub fn new() -> Self {
        Self {
            chain_id: Uuid::new_v4(),
            created_at: Utc::now(),
            records: Vec::new(),
            hash: compute_chain_hash(&[]),
        }
    }

    pub fn chain_id(&self) -> Uuid {
        self.chain_id
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn records(&self) -> &[EvidenceRecord] {
        &self.records
    }

    pub fn hash(&self) -> &str {
        &self.hash
    }

    /// Append a record, linking it to the current head and rehashing
    pub fn add(&mut self, mut record: EvidenceRecord) -> &EvidenceRecord {
        record.previous_hash = self.records.last().map(|r| r.record_hash.clone());
        record.record_hash = record.compute_hash();
        self.records.push(record);
        self.hash = compute_chain_hash(&self.records);
        &self.records[self.records.len() - 1]
    }

    pub fn extend(&mut self, records: impl IntoIterator<Item = EvidenceRecord>) {
        for record in records {
            self.add(record);
        }
    }

    /// Snapshot of the chain for callers and persistence
    pub fn generate(&self) -> GeneratedChain {
        let mut by_stage: BTreeMap<Stage, Vec<EvidenceRecord>> = BTreeMap::new();
        for record in &self.records {
            by_stage.entry(record.stage).or_default().push(record.clone());
        }

        GeneratedChain {
            chain_id: self.chain_id,
            created_at: self.created_at,
            evidence: self.records.clone(),
            by_stage,
            hash: self.hash.clone(),
        }
    }
}

impl Default for EvidenceChain {
    fn default() -> Self {
        Self::new()
    }
}

/// Output of `EvidenceChain::generate`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeneratedChain {
    pub chain_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub evidence: Vec<EvidenceRecord>,
    pub by_stage: BTreeMap<Stage, Vec<EvidenceRecord>>,
    pub hash: String,
}

impl GeneratedChain {
    /// Recompute every record hash, every link and the chain digest
    pub fn verify(&self) -> ChainVerification {
        let mut result = ChainVerification {
            valid: true,
            total_records: self.evidence.len(),
            verified_records: 0,
            first_invalid_index: None,
            error_message: None,
            recomputed_hash: compute_chain_hash(&self.evidence),
        };

        for (i, record) in self.evidence.iter().enumerate() {
            if record.compute_hash() != record.record_hash {
                result.fail(i, format!("Record {} has invalid hash", record.id));
                return result;
            }

            let expected_prev = if i == 0 {
                None
            } else {
                Some(&self.evidence[i - 1].record_hash)
            };
            if record.previous_hash.as_ref() != expected_prev {
                result.fail(
                    i,
                    format!(
                        "Record {} has broken chain link (expected prev: {:?}, got: {:?})",
                        record.id, expected_prev, record.previous_hash
                    ),
                );
                return result;
            }

            result.verified_records = i + 1;
        }

        if result.recomputed_hash != self.hash {
            result.valid = false;
            result.error_message = Some(format!(
                "Chain hash mismatch (stored: {}, computed: {})",
                self.hash, result.recomputed_hash
            ));
        }

        result
    }
}

/// Result of chain verification
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainVerification {
    pub valid: bool,
    pub total_records: usize,
    pub verified_records: usize,
    pub first_invalid_index: Option<usize>,
    pub error_message: Option<String>,
    pub recomputed_hash: String,
}

impl ChainVerification {
    fn fail(&mut self, index: usize, message: String) {
        self.valid = false;
        self.first_invalid_index = Some(index);
        self.error_message = Some(message);
    }
}
