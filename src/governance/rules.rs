//! Governance rules
//!
//! Rules are plain data: an id, the document path they inspect, a severity
//! and a tagged kind carrying the payload its evaluator needs. Rule sets are
//! loaded from YAML or JSON files.

use crate::error::{PipelineError, PipelineResult};
use crate::parser::DocumentFormat;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::Path;

/// Rule severity levels
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord,
)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    #[default]
    Error,
    Block,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Error => "error",
            Severity::Block => "block",
        }
    }
}

/// What a rule checks
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RuleKind {
    /// The path must hold a non-null value
    Required,
    /// The path must be absent or null
    Forbidden,
    /// A present value must be a string matching `regex`
    Pattern { regex: String },
    /// A present value must be a number within the bounds (inclusive)
    Range {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        min: Option<f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max: Option<f64>,
    },
    /// A present value must be one of `values`
    Enum { values: Vec<Value> },
    /// A predicate registered with the engine decides
    Custom { predicate: String },
}

impl RuleKind {
    pub fn name(&self) -> &'static str {
        match self {
            RuleKind::Required => "required",
            RuleKind::Forbidden => "forbidden",
            RuleKind::Pattern { .. } => "pattern",
            RuleKind::Range { .. } => "range",
            RuleKind::Enum { .. } => "enum",
            RuleKind::Custom { .. } => "custom",
        }
    }
}

fn enabled_default() -> bool {
    true
}

/// A governance rule definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Rule {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Exact dotted path the rule inspects
    pub path: String,
    #[serde(default)]
    pub severity: Severity,
    pub kind: RuleKind,
    /// Environments the rule applies to; empty means all
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub environments: Vec<String>,
    /// Replaces the evaluator's failure message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default = "enabled_default")]
    pub enabled: bool,
}

impl Rule {
    pub fn new(id: impl Into<String>, path: impl Into<String>, kind: RuleKind) -> Self {
        let id = id.into();
        let path = path.into();
        Self {
            name: format!("{} {}", kind.name(), path),
            id,
            description: String::new(),
            path,
            severity: Severity::Error,
            kind,
            environments: Vec::new(),
            message: None,
            enabled: true,
        }
    }

    pub fn required(id: impl Into<String>, path: impl Into<String>) -> Self {
        Self::new(id, path, RuleKind::Required)
    }

    pub fn forbidden(id: impl Into<String>, path: impl Into<String>) -> Self {
        Self::new(id, path, RuleKind::Forbidden)
    }

    pub fn pattern(id: impl Into<String>, path: impl Into<String>, regex: impl Into<String>) -> Self {
        Self::new(id, path, RuleKind::Pattern { regex: regex.into() })
    }

    pub fn range(
        id: impl Into<String>,
        path: impl Into<String>,
        min: Option<f64>,
        max: Option<f64>,
    ) -> Self {
        Self::new(id, path, RuleKind::Range { min, max })
    }

    pub fn one_of(id: impl Into<String>, path: impl Into<String>, values: Vec<Value>) -> Self {
        Self::new(id, path, RuleKind::Enum { values })
    }

    pub fn custom(id: impl Into<String>, path: impl Into<String>, predicate: impl Into<String>) -> Self {
        Self::new(id, path, RuleKind::Custom { predicate: predicate.into() })
    }

    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn for_environments<I, S>(mut self, environments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.environments = environments.into_iter().map(Into::into).collect();
        self
    }

    pub fn applies_to(&self, environment: &str) -> bool {
        self.environments.is_empty() || self.environments.iter().any(|e| e == environment)
    }
}

/// An ordered list of rules as stored on disk
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RuleSet {
    #[serde(default)]
    pub rules: Vec<Rule>,
}

impl RuleSet {
    pub fn from_yaml_str(text: &str) -> PipelineResult<Self> {
        serde_yaml::from_str(text).map_err(|e| PipelineError::Config {
            message: format!("Invalid rule set: {}", e),
        })
    }

    pub fn from_json_str(text: &str) -> PipelineResult<Self> {
        serde_json::from_str(text).map_err(|e| PipelineError::Config {
            message: format!("Invalid rule set: {}", e),
        })
    }

    pub async fn load(path: &Path) -> PipelineResult<Self> {
        let text = tokio::fs::read_to_string(path).await.map_err(|e| PipelineError::Config {
            message: format!("Cannot read rule set {}: {}", path.display(), e),
        })?;
        match DocumentFormat::detect(&path.to_string_lossy()) {
            DocumentFormat::Json => Self::from_json_str(&text),
            DocumentFormat::Yaml => Self::from_yaml_str(&text),
        }
    }
}
