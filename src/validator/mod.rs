//! Validator Module
//!
//! Checks canonical documents against a structural schema (types, required
//! keys, enumerations, patterns, ranges) and naming conventions. Structural
//! checks run through `jsonschema`; deprecation warnings and naming rules are
//! layered on top. Every failure is collected; the document is never
//! modified.

pub mod naming;
pub mod schema;

pub use naming::{NamingRule, NamingTarget};
pub use schema::{Schema, SchemaNode, SchemaType};

use crate::document::{join_path, ConfigDocument};
use crate::error::PipelineError;
use crate::evidence::{EvidenceRecord, Stage};
use crate::pipeline::types::StageStatus;
use jsonschema::error::ValidationErrorKind;
use jsonschema::ValidationError;
use serde_json::{json, Value};
use std::time::Instant;
use tracing::{debug, info};

const COMPONENT: &str = "validator";

#[derive(Debug, Clone)]
pub struct ValidationResult {
    pub valid: bool,
    pub status: StageStatus,
    pub errors: Vec<PipelineError>,
    pub warnings: Vec<String>,
    pub duration_ms: u64,
    pub evidence: Vec<EvidenceRecord>,
}

fn display(path: &str) -> String {
    if path.is_empty() {
        "$".to_string()
    } else {
        path.to_string()
    }
}

fn validation_error(path: &str, message: impl Into<String>) -> PipelineError {
    PipelineError::Validation {
        path: display(path),
        message: message.into(),
    }
}

/// JSON pointer (`/a/0/b`) to the dotted form used everywhere else
fn dotted(pointer: &str) -> String {
    pointer
        .split('/')
        .skip(1)
        .map(|segment| segment.replace("~1", "/").replace("~0", "~"))
        .collect::<Vec<_>>()
        .join(".")
}

/// One `PipelineError` per offending property where the keyword names them
fn schema_errors(error: ValidationError<'_>) -> Vec<PipelineError> {
    let at = dotted(&error.instance_path.to_string());
    match &error.kind {
        ValidationErrorKind::Required { property } => {
            let key = property.as_str().map(str::to_string).unwrap_or_else(|| property.to_string());
            vec![validation_error(&join_path(&at, &key), "required property is missing")]
        }
        ValidationErrorKind::AdditionalProperties { unexpected } => unexpected
            .iter()
            .map(|key| validation_error(&join_path(&at, key), "property is not allowed by the schema"))
            .collect(),
        _ => vec![validation_error(&at, error.to_string())],
    }
}

#[derive(Debug, Clone, Default)]
pub struct Validator;

impl Validator {
    pub fn new() -> Self {
        Self
    }

    /// Result for a run without a schema: nothing to check, recorded as such
    pub fn skipped(&self, document: &ConfigDocument) -> ValidationResult {
        debug!("No schema supplied; structural validation skipped");
        let record = EvidenceRecord::success(Stage::Validate, COMPONENT, "skipped")
            .with_input(json!({ "contentHash": document.content_hash() }))
            .with_output(json!({ "valid": true, "reason": "no schema supplied" }));
        ValidationResult {
            valid: true,
            status: StageStatus::Success,
            errors: Vec::new(),
            warnings: Vec::new(),
            duration_ms: 0,
            evidence: vec![record],
        }
    }

    pub fn validate(&self, document: &ConfigDocument, schema: &Schema) -> ValidationResult {
        let started = Instant::now();
        let root = document.to_value();

        let mut errors = Vec::new();
        match schema.compile() {
            Ok(compiled) => {
                for error in compiled.iter_errors(&root) {
                    errors.extend(schema_errors(error));
                }
            }
            Err(e) => errors.push(validation_error("", e.to_string())),
        }
        for rule in &schema.naming {
            for (path, message) in rule.check(&root) {
                errors.push(validation_error(&path, message));
            }
        }
        let warnings: Vec<String> = schema
            .deprecated_paths(&root)
            .into_iter()
            .map(|path| format!("'{}' is deprecated", path))
            .collect();

        let valid = errors.is_empty();
        let status = if !valid {
            StageStatus::Error
        } else if !warnings.is_empty() {
            StageStatus::Warning
        } else {
            StageStatus::Success
        };
        let duration_ms = started.elapsed().as_millis() as u64;

        if valid {
            debug!("Document valid ({} warnings)", warnings.len());
        } else {
            info!("❌ Validation failed with {} errors", errors.len());
        }

        let record = EvidenceRecord::new(Stage::Validate, COMPONENT, "validate", status.into())
            .with_input(json!({ "contentHash": document.content_hash() }))
            .with_output(json!({ "valid": valid, "errors": errors, "warnings": warnings }))
            .with_metric("errors", errors.len())
            .with_metric("warnings", warnings.len())
            .with_metric("naming_rules", schema.naming.len())
            .with_metric("duration_ms", duration_ms);

        ValidationResult {
            valid,
            status,
            errors,
            warnings,
            duration_ms,
            evidence: vec![record],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::Provenance;
    use pretty_assertions::assert_eq;

    fn doc(value: Value) -> ConfigDocument {
        ConfigDocument::from_value(value, Provenance::inline("test")).unwrap()
    }

    fn schema() -> Schema {
        Schema::from_yaml_str(
            r#"
type: object
required: [env, replicas]
additionalProperties: false
properties:
  env: { type: string, enum: [dev, staging, prod] }
  replicas: { type: integer, minimum: 1, maximum: 10 }
  image: { type: string, pattern: "^[a-z0-9./-]+:[A-Za-z0-9.]+$" }
  legacy_port: { type: integer, deprecated: true }
  ports: { type: array, items: { type: integer } }
naming:
  - target: key
    pattern: "^[a-z_]+$"
"#,
        )
        .unwrap()
    }

    #[test]
    fn test_valid_document() {
        let result = Validator::new().validate(
            &doc(json!({"env": "dev", "replicas": 2, "image": "nginx:1.25", "ports": [80]})),
            &schema(),
        );
        assert!(result.valid);
        assert_eq!(result.status, StageStatus::Success);
        assert_eq!(result.evidence.len(), 1);
    }

    #[test]
    fn test_collects_every_error() {
        let result = Validator::new().validate(
            &doc(json!({"env": "qa", "replicas": 0, "image": "Bad Image", "ports": [80, "x"], "Extra": 1})),
            &schema(),
        );
        assert!(!result.valid);
        assert_eq!(result.status, StageStatus::Error);

        let mut paths: Vec<_> = result.errors.iter().filter_map(|e| e.path()).collect();
        paths.sort();
        // `Extra` breaks both additionalProperties and the key naming rule
        assert_eq!(paths, vec!["Extra", "Extra", "env", "image", "ports.1", "replicas"]);
        assert!(result.errors.iter().all(|e| e.kind() == "ValidationError"));
    }

    #[test]
    fn test_missing_required_and_root_type() {
        let result = Validator::new().validate(&doc(json!({"env": "dev"})), &schema());
        assert_eq!(result.errors.len(), 1);
        assert_eq!(result.errors[0].path(), Some("replicas"));

        let mut array_root = Schema::default();
        array_root.root.node_type = Some(SchemaType::Array);
        let result = Validator::new().validate(&doc(json!({"a": 1})), &array_root);
        assert_eq!(result.errors[0].path(), Some("$"));
    }

    #[test]
    fn test_nested_errors_use_dotted_paths() {
        let schema = Schema::from_yaml_str(
            r#"
properties:
  service:
    required: [port]
    properties:
      name: { type: string }
"#,
        )
        .unwrap();
        let result =
            Validator::new().validate(&doc(json!({"service": {"name": 3}})), &schema);
        let mut paths: Vec<_> = result.errors.iter().filter_map(|e| e.path()).collect();
        paths.sort();
        assert_eq!(paths, vec!["service.name", "service.port"]);
    }

    #[test]
    fn test_uncompilable_schema_is_a_validation_error() {
        let schema = Schema::from_yaml_str("properties:\n  a: { pattern: \"([\" }\n").unwrap();
        let result = Validator::new().validate(&doc(json!({"a": "x"})), &schema);
        assert!(!result.valid);
        assert_eq!(result.errors[0].path(), Some("$"));
    }

    #[test]
    fn test_dotted_pointer() {
        assert_eq!(dotted(""), "");
        assert_eq!(dotted("/ports/1"), "ports.1");
        assert_eq!(dotted("/a~1b/c~0d"), "a/b.c~d");
    }

    #[test]
    fn test_deprecated_property_is_a_warning() {
        let result = Validator::new().validate(
            &doc(json!({"env": "prod", "replicas": 3, "legacy_port": 8080})),
            &schema(),
        );
        assert!(result.valid);
        assert_eq!(result.status, StageStatus::Warning);
        assert_eq!(result.warnings, vec!["'legacy_port' is deprecated"]);
    }

    #[test]
    fn test_skipped_without_schema_is_recorded() {
        let result = Validator::new().skipped(&doc(json!({"env": "dev"})));
        assert!(result.valid);
        assert_eq!(result.status, StageStatus::Success);
        assert_eq!(result.evidence.len(), 1);
        assert_eq!(result.evidence[0].action, "skipped");
        assert_eq!(result.evidence[0].stage, Stage::Validate);
    }

    #[test]
    fn test_validation_does_not_modify_document() {
        let d = doc(json!({"env": "dev", "replicas": 1}));
        let before = d.clone();
        Validator::new().validate(&d, &schema());
        assert_eq!(d, before);
    }
}
