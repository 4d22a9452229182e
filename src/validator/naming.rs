//! Naming-convention rules

use crate::document::match_paths;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// What a naming rule constrains
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NamingTarget {
    /// Keys of the mapping(s) at `path`
    Key,
    /// String value(s) at `path`
    Value,
}

/// Regex convention applied to keys or values selected by a path pattern
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NamingRule {
    /// Dotted path; `*` matches any key or index, empty means the root
    #[serde(default)]
    pub path: String,
    pub target: NamingTarget,
    pub pattern: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// One naming failure: (path, message)
pub type NamingViolation = (String, String);

impl NamingRule {
    pub fn keys(path: impl Into<String>, pattern: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            target: NamingTarget::Key,
            pattern: pattern.into(),
            message: None,
        }
    }

    pub fn values(path: impl Into<String>, pattern: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            target: NamingTarget::Value,
            pattern: pattern.into(),
            message: None,
        }
    }

    pub fn check(&self, root: &Value) -> Vec<NamingViolation> {
        let regex = match Regex::new(&self.pattern) {
            Ok(r) => r,
            Err(e) => {
                return vec![(
                    self.path.clone(),
                    format!("invalid naming pattern '{}': {}", self.pattern, e),
                )]
            }
        };

        let describe = |default: String| self.message.clone().unwrap_or(default);
        let mut violations = Vec::new();

        for (path, value) in match_paths(root, &self.path) {
            match (self.target, value) {
                (NamingTarget::Key, Value::Object(map)) => {
                    for key in map.keys().filter(|k| !regex.is_match(k)) {
                        violations.push((
                            crate::document::join_path(&path, key),
                            describe(format!("key '{}' does not match '{}'", key, self.pattern)),
                        ));
                    }
                }
                (NamingTarget::Key, _) => {}
                (NamingTarget::Value, Value::String(s)) => {
                    if !regex.is_match(s) {
                        violations.push((
                            path,
                            describe(format!("value '{}' does not match '{}'", s, self.pattern)),
                        ));
                    }
                }
                (NamingTarget::Value, other) => violations.push((
                    path,
                    format!(
                        "naming rule expects a string, found {}",
                        crate::document::type_name(other)
                    ),
                )),
            }
        }
        violations
    }
}
