//! Document merging
//!
//! Combines the parsed documents of one load into a single document. Keys
//! defined by several documents with different values are conflicts, and the
//! configured strategy decides the winner. Documents are always folded in
//! load order, so the outcome never depends on read completion order.

use crate::document::{join_path, ConfigDocument, Mapping, Provenance};
use crate::error::PipelineError;
use crate::evidence::{EvidenceRecord, Stage};
use crate::pipeline::types::StageStatus;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, warn};

const COMPONENT: &str = "merger";

/// Conflict resolution strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MergeStrategy {
    /// Fail the load on any conflict
    #[default]
    Error,
    /// Earliest document in load order wins
    First,
    /// Latest document in load order wins
    Last,
    /// Most recently modified document wins; ties fall back to `Last`
    Newest,
    /// A caller-supplied resolver decides
    Custom,
}

impl FromStr for MergeStrategy {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "error" => Ok(MergeStrategy::Error),
            "first" => Ok(MergeStrategy::First),
            "last" => Ok(MergeStrategy::Last),
            "newest" => Ok(MergeStrategy::Newest),
            "custom" => Ok(MergeStrategy::Custom),
            other => Err(PipelineError::Config {
                message: format!("Unknown merge strategy '{}'", other),
            }),
        }
    }
}

/// One side of a conflict
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MergeCandidate {
    pub value: Value,
    pub origin: String,
    pub order: usize,
    pub modified: Option<DateTime<Utc>>,
}

/// A key defined with different values by two documents
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MergeConflict {
    pub path: String,
    pub existing: MergeCandidate,
    pub incoming: MergeCandidate,
}

type ResolverFn = dyn Fn(&MergeConflict) -> Result<Value, String> + Send + Sync;

/// Caller-supplied conflict resolver used by `MergeStrategy::Custom`
#[derive(Clone)]
pub struct ConflictResolver(Arc<ResolverFn>);

impl ConflictResolver {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&MergeConflict) -> Result<Value, String> + Send + Sync + 'static,
    {
        Self(Arc::new(f))
    }

    pub fn resolve(&self, conflict: &MergeConflict) -> Result<Value, String> {
        (self.0)(conflict)
    }
}

impl fmt::Debug for ConflictResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ConflictResolver(..)")
    }
}

/// A parsed document with the load metadata needed for merging
#[derive(Debug, Clone)]
pub struct SourcedDocument {
    pub document: ConfigDocument,
    pub origin: String,
    pub order: usize,
    pub modified: Option<DateTime<Utc>>,
}

/// Recorded outcome of one conflict
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MergeDecision {
    pub path: String,
    pub winner: String,
    pub strategy: MergeStrategy,
}

/// Result of merging a load's documents
#[derive(Debug, Clone)]
pub struct MergeResult {
    pub status: StageStatus,
    pub data: ConfigDocument,
    pub decisions: Vec<MergeDecision>,
    pub errors: Vec<PipelineError>,
    pub evidence: Vec<EvidenceRecord>,
}

#[derive(Debug, Clone)]
struct Owner {
    origin: String,
    order: usize,
    modified: Option<DateTime<Utc>>,
}

/// Folds documents together under one strategy
pub struct DocumentMerger {
    strategy: MergeStrategy,
    resolver: Option<ConflictResolver>,
}

impl DocumentMerger {
    pub fn new(strategy: MergeStrategy, resolver: Option<ConflictResolver>) -> Self {
        Self { strategy, resolver }
    }

    pub fn merge(&self, mut documents: Vec<SourcedDocument>) -> MergeResult {
        documents.sort_by_key(|d| d.order);

        let mut errors = Vec::new();
        let mut evidence = Vec::new();
        let mut decisions = Vec::new();

        if self.strategy == MergeStrategy::Custom && self.resolver.is_none() {
            let err = PipelineError::Load {
                message: "Merge strategy 'custom' requires a conflict resolver".to_string(),
            };
            evidence.push(EvidenceRecord::error(Stage::Load, COMPONENT, "merge").with_error(&err));
            return MergeResult {
                status: StageStatus::Error,
                data: ConfigDocument::empty(),
                decisions,
                errors: vec![err],
                evidence,
            };
        }

        let mut root = Mapping::new();
        let mut owners: HashMap<String, Owner> = HashMap::new();
        let mut provenance: Vec<Provenance> = Vec::new();

        for doc in &documents {
            let owner = Owner {
                origin: doc.origin.clone(),
                order: doc.order,
                modified: doc.modified,
            };
            let mut ctx = MergeContext {
                merger: self,
                owners: &mut owners,
                incoming: &owner,
                errors: &mut errors,
                evidence: &mut evidence,
                decisions: &mut decisions,
            };
            ctx.merge_into(&mut root, doc.document.root(), "");
            for p in doc.document.provenance() {
                if !provenance.contains(p) {
                    provenance.push(p.clone());
                }
            }
        }

        let status = if errors.is_empty() {
            StageStatus::Success
        } else {
            StageStatus::Error
        };

        let summary = EvidenceRecord::new(Stage::Load, COMPONENT, "merge", status.into())
            .with_input(json!({
                "documents": documents.iter().map(|d| d.origin.clone()).collect::<Vec<_>>(),
                "strategy": self.strategy,
            }))
            .with_metric("documents", documents.len())
            .with_metric("conflicts", decisions.len() + errors.len())
            .with_metric("errors", errors.len());
        evidence.push(summary);

        let merged = if status == StageStatus::Error {
            ConfigDocument::empty()
        } else {
            ConfigDocument::from_parts(root, provenance)
        };

        MergeResult {
            status,
            data: merged,
            decisions,
            errors,
            evidence,
        }
    }
}

/// `a` was modified strictly later than `b`; unknown times never win
fn newer(a: &Owner, b: &Owner) -> bool {
    match (a.modified, b.modified) {
        (Some(a), Some(b)) => a > b,
        _ => false,
    }
}

struct MergeContext<'a> {
    merger: &'a DocumentMerger,
    owners: &'a mut HashMap<String, Owner>,
    incoming: &'a Owner,
    errors: &'a mut Vec<PipelineError>,
    evidence: &'a mut Vec<EvidenceRecord>,
    decisions: &'a mut Vec<MergeDecision>,
}

impl MergeContext<'_> {
    fn merge_into(&mut self, base: &mut Mapping, incoming: &Mapping, prefix: &str) {
        for (key, value) in incoming {
            let path = join_path(prefix, key);
            match base.get_mut(key) {
                None => {
                    base.insert(key.clone(), value.clone());
                    self.owners.insert(path, self.incoming.clone());
                }
                Some(Value::Object(existing)) if value.is_object() => {
                    if let Value::Object(incoming_map) = value {
                        self.merge_into(existing, incoming_map, &path);
                    }
                }
                Some(existing) if *existing == *value => {
                    let owner = self.owner_of(&path);
                    if self.incoming_outranks(&owner) {
                        self.owners.insert(path, self.incoming.clone());
                    }
                }
                Some(existing) => {
                    let owner = self.owner_of(&path);
                    if let Some(winner) = self.resolve(&path, &*existing, &owner, value) {
                        *existing = winner.0;
                        self.owners.insert(path, winner.1);
                    }
                }
            }
        }
    }

    /// Whether the incoming document would win a conflict against `owner`
    /// under an ordering strategy
    fn incoming_outranks(&self, owner: &Owner) -> bool {
        match self.merger.strategy {
            MergeStrategy::Last => true,
            MergeStrategy::Newest => !newer(owner, self.incoming),
            MergeStrategy::Error | MergeStrategy::First | MergeStrategy::Custom => false,
        }
    }

    /// Nearest recorded owner of `path` or one of its ancestors
    fn owner_of(&self, path: &str) -> Owner {
        let mut candidate = path;
        loop {
            if let Some(owner) = self.owners.get(candidate) {
                return owner.clone();
            }
            match candidate.rfind('.') {
                Some(idx) => candidate = &candidate[..idx],
                None => {
                    return Owner {
                        origin: "unknown".to_string(),
                        order: 0,
                        modified: None,
                    }
                }
            }
        }
    }

    /// Returns the replacement value and owner, or `None` to keep the existing one
    fn resolve(
        &mut self,
        path: &str,
        existing: &Value,
        owner: &Owner,
        incoming: &Value,
    ) -> Option<(Value, Owner)> {
        let conflict = MergeConflict {
            path: path.to_string(),
            existing: MergeCandidate {
                value: existing.clone(),
                origin: owner.origin.clone(),
                order: owner.order,
                modified: owner.modified,
            },
            incoming: MergeCandidate {
                value: incoming.clone(),
                origin: self.incoming.origin.clone(),
                order: self.incoming.order,
                modified: self.incoming.modified,
            },
        };
        let strategy = self.merger.strategy;

        let outcome: Result<Option<(Value, Owner)>, String> = match strategy {
            MergeStrategy::Error => Err(format!(
                "defined as {} in {} and {} in {}",
                existing, owner.origin, incoming, self.incoming.origin
            )),
            MergeStrategy::First => Ok(None),
            MergeStrategy::Last => Ok(Some((incoming.clone(), self.incoming.clone()))),
            MergeStrategy::Newest => {
                if newer(owner, self.incoming) {
                    Ok(None)
                } else {
                    Ok(Some((incoming.clone(), self.incoming.clone())))
                }
            }
            MergeStrategy::Custom => match &self.merger.resolver {
                Some(resolver) => resolver.resolve(&conflict).map(|v| {
                    let origin = Owner {
                        origin: format!("custom({})", self.incoming.origin),
                        ..self.incoming.clone()
                    };
                    Some((v, origin))
                }),
                None => Err("no conflict resolver configured".to_string()),
            },
        };

        match outcome {
            Ok(replacement) => {
                let winner = replacement
                    .as_ref()
                    .map(|(_, o)| o.origin.clone())
                    .unwrap_or_else(|| owner.origin.clone());
                debug!("Merge conflict at '{}' resolved by {:?}: {}", path, strategy, winner);
                self.evidence.push(
                    EvidenceRecord::success(Stage::Load, COMPONENT, "merge_decision")
                        .with_input(serde_json::to_value(&conflict).unwrap_or(Value::Null))
                        .with_output(json!({ "winner": winner, "strategy": strategy })),
                );
                self.decisions.push(MergeDecision {
                    path: path.to_string(),
                    winner,
                    strategy,
                });
                replacement
            }
            Err(message) => {
                warn!("Merge conflict at '{}': {}", path, message);
                let err = PipelineError::MergeConflict {
                    path: path.to_string(),
                    message,
                };
                self.evidence.push(
                    EvidenceRecord::error(Stage::Load, COMPONENT, "merge_decision")
                        .with_input(serde_json::to_value(&conflict).unwrap_or(Value::Null))
                        .with_error(&err),
                );
                self.errors.push(err);
                None
            }
        }
    }
}
