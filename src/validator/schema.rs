//! Declarative document schema

use crate::document::{join_path, Mapping};
use crate::error::{PipelineError, PipelineResult};
use crate::parser::DocumentFormat;
use crate::validator::naming::NamingRule;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::Path;

/// JSON Schema primitive types. An absent `type` accepts any value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SchemaType {
    String,
    Integer,
    Number,
    Boolean,
    Object,
    Array,
    Null,
}

/// Constraints for one node of the document tree
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SchemaNode {
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub node_type: Option<SchemaType>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub required: Vec<String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub properties: BTreeMap<String, SchemaNode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub items: Option<Box<SchemaNode>>,
    #[serde(rename = "enum", skip_serializing_if = "Option::is_none")]
    pub allowed: Option<Vec<Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub minimum: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub maximum: Option<f64>,
    /// Unknown keys are allowed unless this is `false`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub additional_properties: Option<bool>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub deprecated: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl SchemaNode {
    fn collect_deprecated(&self, value: &Value, path: &str, found: &mut Vec<String>) {
        match value {
            Value::Object(map) => {
                for (key, child) in map {
                    if let Some(node) = self.properties.get(key) {
                        let child_path = join_path(path, key);
                        if node.deprecated {
                            found.push(child_path.clone());
                        }
                        node.collect_deprecated(child, &child_path, found);
                    }
                }
            }
            Value::Array(items) => {
                if let Some(item_node) = &self.items {
                    for (i, item) in items.iter().enumerate() {
                        item_node.collect_deprecated(item, &join_path(path, &i.to_string()), found);
                    }
                }
            }
            _ => {}
        }
    }

    /// Fill absent properties that declare a default. Nested mappings are
    /// only descended into when they exist.
    fn apply_defaults(&self, map: &mut Mapping, prefix: &str, defaulted: &mut Vec<String>) {
        for (key, node) in &self.properties {
            let path = join_path(prefix, key);
            match map.get_mut(key) {
                None => {
                    if let Some(default) = &node.default {
                        map.insert(key.clone(), default.clone());
                        defaulted.push(path);
                    }
                }
                Some(value) => node.apply_defaults_to(value, &path, defaulted),
            }
        }
    }

    fn apply_defaults_to(&self, value: &mut Value, path: &str, defaulted: &mut Vec<String>) {
        match value {
            Value::Object(map) => self.apply_defaults(map, path, defaulted),
            Value::Array(items) => {
                if let Some(item_node) = &self.items {
                    for (i, item) in items.iter_mut().enumerate() {
                        item_node.apply_defaults_to(item, &join_path(path, &i.to_string()), defaulted);
                    }
                }
            }
            _ => {}
        }
    }
}

/// Root schema plus naming conventions
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Schema {
    #[serde(flatten)]
    pub root: SchemaNode,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub naming: Vec<NamingRule>,
}

impl Schema {
    pub fn new(root: SchemaNode) -> Self {
        Self {
            root,
            naming: Vec::new(),
        }
    }

    pub fn with_naming(mut self, rule: NamingRule) -> Self {
        self.naming.push(rule);
        self
    }

    pub fn from_yaml_str(text: &str) -> PipelineResult<Self> {
        serde_yaml::from_str(text).map_err(|e| PipelineError::Config {
            message: format!("Invalid schema: {}", e),
        })
    }

    pub fn from_json_str(text: &str) -> PipelineResult<Self> {
        serde_json::from_str(text).map_err(|e| PipelineError::Config {
            message: format!("Invalid schema: {}", e),
        })
    }

    /// Load a schema file; `.json` is JSON, anything else YAML
    pub async fn load(path: &Path) -> PipelineResult<Self> {
        let text = tokio::fs::read_to_string(path).await.map_err(|e| PipelineError::Config {
            message: format!("Cannot read schema {}: {}", path.display(), e),
        })?;
        match DocumentFormat::detect(&path.to_string_lossy()) {
            DocumentFormat::Json => Self::from_json_str(&text),
            DocumentFormat::Yaml => Self::from_yaml_str(&text),
        }
    }

    /// The structural part of the schema as a JSON Schema document
    pub fn json_schema(&self) -> PipelineResult<Value> {
        serde_json::to_value(&self.root).map_err(|e| PipelineError::Config {
            message: format!("Invalid schema: {}", e),
        })
    }

    /// Compile the structural part with `jsonschema`
    pub fn compile(&self) -> PipelineResult<jsonschema::Validator> {
        let schema = self.json_schema()?;
        jsonschema::validator_for(&schema).map_err(|e| PipelineError::Config {
            message: format!("Invalid schema: {}", e),
        })
    }

    /// Paths of present properties whose schema marks them deprecated
    pub fn deprecated_paths(&self, root: &Value) -> Vec<String> {
        let mut found = Vec::new();
        self.root.collect_deprecated(root, "", &mut found);
        found
    }

    /// Insert declared defaults for absent keys, returning the defaulted paths
    pub fn apply_defaults(&self, root: &mut Mapping) -> Vec<String> {
        let mut defaulted = Vec::new();
        self.root.apply_defaults(root, "", &mut defaulted);
        defaulted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const SCHEMA: &str = r#"
type: object
required: [service]
properties:
  service:
    type: object
    properties:
      replicas: { type: integer, default: 1, minimum: 1 }
      tier: { type: string, enum: [web, worker], default: web }
  containers:
    type: array
    items:
      type: object
      properties:
        pull: { type: string, default: IfNotPresent }
naming:
  - path: service
    target: key
    pattern: "^[a-z_]+$"
"#;

    #[test]
    fn test_schema_from_yaml() {
        let schema = Schema::from_yaml_str(SCHEMA).unwrap();
        assert_eq!(schema.root.node_type, Some(SchemaType::Object));
        assert_eq!(schema.root.required, vec!["service"]);
        assert_eq!(schema.naming.len(), 1);
        let replicas = &schema.root.properties["service"].properties["replicas"];
        assert_eq!(replicas.minimum, Some(1.0));
        assert_eq!(schema.root.additional_properties, None);
    }

    #[test]
    fn test_defaults_fill_only_absent_keys() {
        let schema = Schema::from_yaml_str(SCHEMA).unwrap();
        let mut root = json!({
            "service": {"replicas": 3},
            "containers": [{"name": "app"}, {"name": "side", "pull": "Always"}]
        })
        .as_object()
        .cloned()
        .unwrap();

        let defaulted = schema.apply_defaults(&mut root);
        assert_eq!(defaulted, vec!["containers.0.pull", "service.tier"]);
        assert_eq!(root["service"]["replicas"], json!(3));
        assert_eq!(root["service"]["tier"], json!("web"));
        assert_eq!(root["containers"][1]["pull"], json!("Always"));

        // second application is a no-op
        assert!(schema.apply_defaults(&mut root).is_empty());
    }

    #[test]
    fn test_structural_part_compiles_to_json_schema() {
        let schema = Schema::from_yaml_str(SCHEMA).unwrap();
        let json = schema.json_schema().unwrap();
        assert_eq!(json["required"], json!(["service"]));
        assert_eq!(json["properties"]["service"]["properties"]["replicas"]["minimum"], json!(1.0));
        assert!(json.get("naming").is_none());

        let validator = schema.compile().unwrap();
        assert!(validator.is_valid(&json!({"service": {"replicas": 2}})));
        assert!(!validator.is_valid(&json!({"service": {"replicas": 2.5}})));
        assert!(!validator.is_valid(&json!({"containers": []})));
    }

    #[test]
    fn test_invalid_pattern_fails_to_compile() {
        let schema = Schema::from_yaml_str("type: string\npattern: \"([a-z\"\n").unwrap();
        assert_eq!(schema.compile().unwrap_err().kind(), "ConfigError");
    }

    #[test]
    fn test_deprecated_paths() {
        let schema = Schema::from_yaml_str(
            r#"
properties:
  old: { deprecated: true }
  nested:
    properties:
      legacy: { type: integer, deprecated: true }
"#,
        )
        .unwrap();
        let paths = schema.deprecated_paths(&json!({"nested": {"legacy": 1}, "other": 2}));
        assert_eq!(paths, vec!["nested.legacy"]);
    }
}
