//! Normalizer Module
//!
//! Produces the canonical document: the environment overlay is deep-merged
//! over the document (overlay wins), schema defaults fill absent keys, and
//! deferred references are resolved. Which paths were overridden or
//! defaulted is reported in evidence, never written into the document.

use crate::document::{deep_merge, ConfigDocument, Mapping, Provenance};
use crate::error::PipelineError;
use crate::evidence::{EvidenceRecord, Stage};
use crate::pipeline::types::StageStatus;
use crate::references::resolve_references;
use crate::validator::Schema;
use serde_json::json;
use std::sync::Arc;
use tracing::debug;

const COMPONENT: &str = "normalizer";

/// Provenance entry recorded for overlay values
pub const OVERLAY_ORIGIN: &str = "environment-overlay";

#[derive(Debug, Clone)]
pub struct NormalizerResult {
    pub status: StageStatus,
    /// The canonical document; `None` on error
    pub data: Option<ConfigDocument>,
    pub overridden: Vec<String>,
    pub defaulted: Vec<String>,
    pub errors: Vec<PipelineError>,
    pub evidence: Vec<EvidenceRecord>,
}

#[derive(Debug, Clone, Default)]
pub struct Normalizer {
    schema: Option<Arc<Schema>>,
}

impl Normalizer {
    pub fn new(schema: Option<Arc<Schema>>) -> Self {
        Self { schema }
    }

    pub fn normalize(&self, document: &ConfigDocument, overlay: Option<&Mapping>) -> NormalizerResult {
        let mut root = document.root().clone();
        let mut overridden = Vec::new();
        if let Some(overlay) = overlay {
            deep_merge(&mut root, overlay, "", &mut overridden);
        }

        let defaulted = match &self.schema {
            Some(schema) => schema.apply_defaults(&mut root),
            None => Vec::new(),
        };

        let input = json!({
            "contentHash": document.content_hash(),
            "overlay": overlay.is_some(),
        });

        let errors: Vec<PipelineError> = match resolve_references(&root) {
            Ok(resolution) => {
                root = resolution.root;
                resolution
                    .unresolved
                    .iter()
                    .map(|u| PipelineError::Normalization {
                        message: u.to_string(),
                    })
                    .collect()
            }
            Err(cycle) => vec![PipelineError::Normalization {
                message: cycle.to_string(),
            }],
        };

        if !errors.is_empty() {
            let record = EvidenceRecord::error(Stage::Normalize, COMPONENT, "normalize")
                .with_input(input)
                .with_output(json!({ "errors": errors }))
                .with_metric("overridden", overridden.len())
                .with_metric("defaulted", defaulted.len());
            return NormalizerResult {
                status: StageStatus::Error,
                data: None,
                overridden,
                defaulted,
                errors,
                evidence: vec![record],
            };
        }

        let canonical = match overlay {
            Some(_) => {
                let overlay_doc =
                    ConfigDocument::from_parts(Mapping::new(), vec![Provenance::inline(OVERLAY_ORIGIN)]);
                document.derive_merged(root, &overlay_doc)
            }
            None => document.derive(root),
        };

        debug!(
            "Normalized document: {} overridden, {} defaulted",
            overridden.len(),
            defaulted.len()
        );

        let record = EvidenceRecord::success(Stage::Normalize, COMPONENT, "normalize")
            .with_input(input)
            .with_output(json!({
                "contentHash": canonical.content_hash(),
                "overridden": overridden,
                "defaulted": defaulted,
            }))
            .with_metric("overridden", overridden.len())
            .with_metric("defaulted", defaulted.len());

        NormalizerResult {
            status: StageStatus::Success,
            data: Some(canonical),
            overridden,
            defaulted,
            errors: Vec::new(),
            evidence: vec![record],
        }
    }
}
