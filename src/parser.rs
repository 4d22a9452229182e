//! Parser Module
//!
//! Turns raw file content into `ConfigDocument`s. YAML anchors and aliases
//! are expanded by the YAML library, `<<` merge keys are applied, and
//! `${path}` references are resolved against the same document. References
//! that cannot be resolved yet are warnings; the normalizer resolves them
//! once overlays and defaults are in place.

use crate::document::{ConfigDocument, Mapping, Provenance};
use crate::error::PipelineError;
use crate::evidence::{EvidenceRecord, Stage};
use crate::loader::{LoadedFile, SourcedDocument};
use crate::pipeline::types::StageStatus;
use crate::references::resolve_references;
use serde::{Deserialize, Serialize};
use serde_json::{json, Number, Value};
use std::path::Path;
use tracing::{debug, warn};

const COMPONENT: &str = "parser";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentFormat {
    Yaml,
    Json,
}

impl DocumentFormat {
    /// `.json` parses as JSON, everything else as YAML
    pub fn detect(path: &str) -> Self {
        match Path::new(path).extension().and_then(|e| e.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("json") => DocumentFormat::Json,
            _ => DocumentFormat::Yaml,
        }
    }
}

/// Result of parsing one file
#[derive(Debug, Clone)]
pub struct ParseResult {
    pub status: StageStatus,
    pub path: String,
    pub format: DocumentFormat,
    /// `None` when the content is unusable
    pub data: Option<ConfigDocument>,
    pub errors: Vec<PipelineError>,
    pub warnings: Vec<String>,
    pub evidence: Vec<EvidenceRecord>,
}

/// Parse results for every file of a load, in load order
#[derive(Debug, Clone)]
pub struct ParseBatch {
    pub status: StageStatus,
    pub results: Vec<ParseResult>,
    /// Successfully parsed documents ready for merging
    pub documents: Vec<SourcedDocument>,
}

impl ParseBatch {
    pub fn errors(&self) -> Vec<PipelineError> {
        self.results.iter().flat_map(|r| r.errors.clone()).collect()
    }

    pub fn warnings(&self) -> Vec<String> {
        self.results.iter().flat_map(|r| r.warnings.clone()).collect()
    }

    pub fn evidence(&self) -> Vec<EvidenceRecord> {
        self.results.iter().flat_map(|r| r.evidence.clone()).collect()
    }
}

#[derive(Debug, Clone, Default)]
pub struct Parser;

impl Parser {
    pub fn new() -> Self {
        Self
    }

    /// Parse content that did not come from a loader
    pub fn parse(&self, content: &[u8], path: &str) -> ParseResult {
        self.parse_with(content, path, Provenance::new(path, "inline", 0))
    }

    pub fn parse_file(&self, file: &LoadedFile) -> ParseResult {
        let provenance = Provenance::new(&file.relative_path, &file.source, file.order);
        self.parse_with(&file.content, &file.path, provenance)
    }

    pub fn parse_all(&self, files: &[LoadedFile]) -> ParseBatch {
        let mut status = StageStatus::Success;
        let mut results = Vec::with_capacity(files.len());
        let mut documents = Vec::new();

        for file in files {
            let result = self.parse_file(file);
            status = status.worst(result.status);
            if let Some(document) = &result.data {
                documents.push(SourcedDocument {
                    document: document.clone(),
                    origin: file.relative_path.clone(),
                    order: file.order,
                    modified: file.modified,
                });
            }
            results.push(result);
        }

        ParseBatch {
            status,
            results,
            documents,
        }
    }

    fn parse_with(&self, content: &[u8], path: &str, provenance: Provenance) -> ParseResult {
        let format = DocumentFormat::detect(path);
        let input = json!({ "path": path, "format": format, "bytes": content.len() });

        let outcome = std::str::from_utf8(content)
            .map_err(|e| format!("content is not valid UTF-8: {}", e))
            .and_then(|text| parse_text(text, format));

        let root = match outcome {
            Ok(Some(root)) => root,
            Ok(None) => {
                debug!("{} is empty", path);
                let message = "document is empty".to_string();
                let record = EvidenceRecord::warning(Stage::Parse, COMPONENT, "parse")
                    .with_input(input)
                    .with_output(json!({ "keys": 0, "warnings": [message] }));
                return ParseResult {
                    status: StageStatus::Warning,
                    path: path.to_string(),
                    format,
                    data: Some(ConfigDocument::new(Mapping::new(), provenance)),
                    errors: Vec::new(),
                    warnings: vec![message],
                    evidence: vec![record],
                };
            }
            Err(message) => return failure(path, format, input, message),
        };

        let resolution = match resolve_references(&root) {
            Ok(r) => r,
            Err(cycle) => return failure(path, format, input, cycle.to_string()),
        };

        let warnings: Vec<String> = resolution.unresolved.iter().map(|u| u.to_string()).collect();
        for w in &warnings {
            warn!("{}: {}", path, w);
        }
        let status = if warnings.is_empty() {
            StageStatus::Success
        } else {
            StageStatus::Warning
        };

        let document = ConfigDocument::new(resolution.root, provenance);
        let record = EvidenceRecord::new(Stage::Parse, COMPONENT, "parse", status.into())
            .with_input(input)
            .with_output(json!({
                "keys": document.root().len(),
                "contentHash": document.content_hash(),
                "warnings": warnings,
            }))
            .with_metric("references_resolved", resolution.resolved)
            .with_metric("references_unresolved", resolution.unresolved.len());

        ParseResult {
            status,
            path: path.to_string(),
            format,
            data: Some(document),
            errors: Vec::new(),
            warnings,
            evidence: vec![record],
        }
    }
}

fn failure(path: &str, format: DocumentFormat, input: Value, message: String) -> ParseResult {
    warn!("Failed to parse {}: {}", path, message);
    let error = PipelineError::Parse {
        path: path.to_string(),
        message,
    };
    let record = EvidenceRecord::error(Stage::Parse, COMPONENT, "parse")
        .with_input(input)
        .with_error(&error);
    ParseResult {
        status: StageStatus::Error,
        path: path.to_string(),
        format,
        data: None,
        errors: vec![error],
        warnings: Vec::new(),
        evidence: vec![record],
    }
}

/// `Ok(None)` for documents with no content
fn parse_text(text: &str, format: DocumentFormat) -> Result<Option<Mapping>, String> {
    if text.trim().is_empty() {
        return Ok(None);
    }

    let value = match format {
        DocumentFormat::Json => serde_json::from_str::<Value>(text).map_err(|e| e.to_string())?,
        DocumentFormat::Yaml => {
            let mut yaml: serde_yaml::Value =
                serde_yaml::from_str(text).map_err(|e| e.to_string())?;
            yaml.apply_merge().map_err(|e| format!("invalid merge key: {}", e))?;
            yaml_to_json(yaml, "")?
        }
    };

    match value {
        Value::Object(map) => Ok(Some(map)),
        Value::Null => Ok(None),
        other => Err(format!(
            "document root must be a mapping, found {}",
            crate::document::type_name(&other)
        )),
    }
}

fn yaml_to_json(value: serde_yaml::Value, at: &str) -> Result<Value, String> {
    use serde_yaml::Value as Y;

    Ok(match value {
        Y::Null => Value::Null,
        Y::Bool(b) => Value::Bool(b),
        Y::Number(n) => {
            if let Some(i) = n.as_i64() {
                Value::from(i)
            } else if let Some(u) = n.as_u64() {
                Value::from(u)
            } else {
                let f = n.as_f64().unwrap_or(f64::NAN);
                Value::Number(
                    Number::from_f64(f)
                        .ok_or_else(|| format!("non-finite number at '{}'", display(at)))?,
                )
            }
        }
        Y::String(s) => Value::String(s),
        Y::Sequence(items) => Value::Array(
            items
                .into_iter()
                .enumerate()
                .map(|(i, v)| yaml_to_json(v, &crate::document::join_path(at, &i.to_string())))
                .collect::<Result<_, _>>()?,
        ),
        Y::Mapping(entries) => {
            let mut map = Mapping::new();
            for (k, v) in entries {
                let key = match k {
                    Y::String(s) => s,
                    Y::Bool(b) => b.to_string(),
                    Y::Number(n) => n.to_string(),
                    Y::Null => "null".to_string(),
                    _ => return Err(format!("unsupported mapping key at '{}'", display(at))),
                };
                let child = yaml_to_json(v, &crate::document::join_path(at, &key))?;
                map.insert(key, child);
            }
            Value::Object(map)
        }
        Y::Tagged(tagged) => yaml_to_json(tagged.value, at)?,
    })
}

fn display(path: &str) -> &str {
    if path.is_empty() {
        "$"
    } else {
        path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_format_detection() {
        assert_eq!(DocumentFormat::detect("a/b.json"), DocumentFormat::Json);
        assert_eq!(DocumentFormat::detect("a/b.YML"), DocumentFormat::Yaml);
        assert_eq!(DocumentFormat::detect("noext"), DocumentFormat::Yaml);
    }

    #[test]
    fn test_yaml_anchors_and_merge_keys() {
        let yaml = r#"
base: &base
  image: nginx
  replicas: 1
web:
  <<: *base
  replicas: 3
copy: *base
"#;
        let result = Parser::new().parse(yaml.as_bytes(), "svc.yaml");
        assert_eq!(result.status, StageStatus::Success);
        let doc = result.data.unwrap();
        assert_eq!(doc.get("web.image"), Some(&json!("nginx")));
        assert_eq!(doc.get("web.replicas"), Some(&json!(3)));
        assert_eq!(doc.get("copy.replicas"), Some(&json!(1)));
        assert!(doc.get("web.<<").is_none());
    }

    #[test]
    fn test_key_order_is_preserved() {
        let result = Parser::new().parse(b"zeta: 1\nalpha: 2\nmid: 3\n", "order.yaml");
        let doc = result.data.unwrap();
        let keys: Vec<_> = doc.root().keys().cloned().collect();
        assert_eq!(keys, vec!["zeta", "alpha", "mid"]);
    }

    #[test]
    fn test_references_and_unresolved_warnings() {
        let yaml = "name: api\nurl: http://${name}.svc\nowner: ${team.owner}\n";
        let result = Parser::new().parse(yaml.as_bytes(), "refs.yaml");
        assert_eq!(result.status, StageStatus::Warning);
        assert_eq!(result.warnings.len(), 1);
        assert!(result.warnings[0].contains("team.owner"));
        let doc = result.data.unwrap();
        assert_eq!(doc.get("url"), Some(&json!("http://api.svc")));
        assert_eq!(doc.get("owner"), Some(&json!("${team.owner}")));
    }

    #[test]
    fn test_malformed_syntax_is_an_error() {
        let result = Parser::new().parse(b"a: [1, 2\nb: }", "broken.yaml");
        assert_eq!(result.status, StageStatus::Error);
        assert!(result.data.is_none());
        assert_eq!(result.errors[0].kind(), "ParseError");
        assert_eq!(result.errors[0].path(), Some("broken.yaml"));

        let json = Parser::new().parse(b"{\"a\": ", "broken.json");
        assert_eq!(json.status, StageStatus::Error);
    }

    #[test]
    fn test_non_mapping_root_is_rejected() {
        let result = Parser::new().parse(b"- 1\n- 2\n", "list.yaml");
        assert_eq!(result.status, StageStatus::Error);
        assert!(result.errors[0].to_string().contains("must be a mapping"));
    }

    #[test]
    fn test_empty_document_is_a_warning() {
        let result = Parser::new().parse(b"# only a comment\n", "empty.yaml");
        assert_eq!(result.status, StageStatus::Warning);
        assert!(result.data.unwrap().is_empty());
    }

    #[test]
    fn test_reference_cycle_is_a_parse_error() {
        let result = Parser::new().parse(b"a: ${b}\nb: ${a}\n", "cycle.yaml");
        assert_eq!(result.status, StageStatus::Error);
        assert!(result.errors[0].to_string().contains("reference cycle"));
    }

    #[test]
    fn test_non_string_keys_are_stringified() {
        let result = Parser::new().parse(b"ports:\n  80: http\n  true: yes\n", "keys.yaml");
        let doc = result.data.unwrap();
        assert_eq!(doc.get("ports.80"), Some(&json!("http")));
        assert_eq!(doc.get("ports.true"), Some(&json!("yes")));
    }

    #[test]
    fn test_parse_all_collects_documents_in_order() {
        let file = |name: &str, body: &str, order| LoadedFile {
            path: format!("/cfg/{}", name),
            relative_path: name.to_string(),
            source: "/cfg".to_string(),
            order,
            modified: None,
            content: body.as_bytes().to_vec(),
        };
        let batch = Parser::new().parse_all(&[
            file("a.yaml", "x: 1", 0),
            file("b.yaml", "x: [", 1),
            file("c.json", "{\"x\": 3}", 2),
        ]);
        assert_eq!(batch.status, StageStatus::Error);
        assert_eq!(batch.documents.len(), 2);
        assert_eq!(batch.documents[1].origin, "c.json");
        assert_eq!(batch.documents[1].document.provenance()[0].order, 2);
        assert_eq!(batch.evidence().len(), 3);
    }
}
