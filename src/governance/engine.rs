//! Governance Engine
//!
//! Evaluates an ordered rule list against a canonical document. Every rule
//! yields exactly one governance event (`rule.passed`, `rule.failed` or
//! `rule.skipped`) and every failure one violation. The document passes only
//! when there are no violations at all.

use crate::document::{ConfigDocument, Mapping};
use crate::error::PipelineError;
use crate::evidence::{EvidenceRecord, EvidenceStatus, Stage};
use crate::governance::rules::{Rule, RuleKind, Severity};
use crate::pipeline::types::StageStatus;
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

const COMPONENT: &str = "governance";

/// Caller-supplied facts available to custom predicates
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GovernanceContext {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actor: Option<String>,
    #[serde(default)]
    pub attributes: Mapping,
}

/// Custom rule evaluator: `Err` carries the failure message
pub type PredicateFn =
    dyn Fn(Option<&Value>, &ConfigDocument, &GovernanceContext) -> Result<(), String> + Send + Sync;

#[derive(Clone)]
pub struct Predicate(Arc<PredicateFn>);

impl Predicate {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(Option<&Value>, &ConfigDocument, &GovernanceContext) -> Result<(), String>
            + Send
            + Sync
            + 'static,
    {
        Self(Arc::new(f))
    }
}

impl fmt::Debug for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Predicate(..)")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GovernanceEvent {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "type")]
    pub event_type: String,
    pub stage: String,
    pub component: String,
    pub data: Value,
    pub metadata: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Violation {
    pub rule_id: String,
    pub path: String,
    pub message: String,
    pub severity: Severity,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GovernanceSummary {
    pub total_rules: usize,
    pub evaluated: usize,
    pub skipped: usize,
    pub violations_by_severity: BTreeMap<String, usize>,
    pub highest_severity: Option<Severity>,
}

#[derive(Debug, Clone)]
pub struct GovernanceResult {
    pub status: StageStatus,
    pub events: Vec<GovernanceEvent>,
    pub violations: Vec<Violation>,
    pub passed: bool,
    pub summary: GovernanceSummary,
    pub evidence: Vec<EvidenceRecord>,
}

impl GovernanceResult {
    /// A single veto error when the document failed governance
    pub fn errors(&self) -> Vec<PipelineError> {
        if self.passed {
            return Vec::new();
        }
        let detail = self
            .violations
            .iter()
            .map(|v| format!("[{}] {}: {}", v.rule_id, v.path, v.message))
            .collect::<Vec<_>>()
            .join("; ");
        vec![PipelineError::GovernanceViolation {
            message: format!("{} violation(s): {}", self.violations.len(), detail),
        }]
    }
}

enum Outcome {
    Passed,
    Failed(String),
    Skipped(&'static str),
}

/// The rules engine that enforces governance policies
#[derive(Debug, Clone, Default)]
pub struct GovernanceEngine {
    rules: Vec<Rule>,
    predicates: HashMap<String, Predicate>,
}

impl GovernanceEngine {
    pub fn new(rules: Vec<Rule>) -> Self {
        Self {
            rules,
            predicates: HashMap::new(),
        }
    }

    pub fn add_rule(&mut self, rule: Rule) {
        self.rules.push(rule);
    }

    /// Get all configured rules, in evaluation order
    pub fn list_rules(&self) -> &[Rule] {
        &self.rules
    }

    pub fn register_predicate(&mut self, name: impl Into<String>, predicate: Predicate) {
        self.predicates.insert(name.into(), predicate);
    }

    pub fn enforce(
        &self,
        document: &ConfigDocument,
        environment: &str,
        context: Option<&GovernanceContext>,
    ) -> GovernanceResult {
        let default_context = GovernanceContext::default();
        let context = context.unwrap_or(&default_context);

        let mut events = Vec::with_capacity(self.rules.len());
        let mut violations = Vec::new();
        let mut evidence = Vec::with_capacity(self.rules.len() + 1);
        let mut skipped = 0;

        for rule in &self.rules {
            let outcome = if !rule.enabled {
                Outcome::Skipped("disabled")
            } else if !rule.applies_to(environment) {
                Outcome::Skipped("environment")
            } else {
                self.evaluate(rule, document, context)
            };

            let (event_type, status, output) = match &outcome {
                Outcome::Passed => ("rule.passed", EvidenceStatus::Success, json!({ "outcome": "passed" })),
                Outcome::Failed(message) => {
                    warn!("⚠️ Rule {} failed at '{}': {}", rule.id, rule.path, message);
                    violations.push(Violation {
                        rule_id: rule.id.clone(),
                        path: rule.path.clone(),
                        message: message.clone(),
                        severity: rule.severity,
                    });
                    (
                        "rule.failed",
                        EvidenceStatus::Error,
                        json!({ "outcome": "failed", "message": message }),
                    )
                }
                Outcome::Skipped(reason) => {
                    skipped += 1;
                    (
                        "rule.skipped",
                        EvidenceStatus::Success,
                        json!({ "outcome": "skipped", "reason": reason }),
                    )
                }
            };

            let data = json!({
                "ruleId": rule.id,
                "ruleName": rule.name,
                "path": rule.path,
                "kind": rule.kind.name(),
                "severity": rule.severity,
                "result": output,
            });
            events.push(GovernanceEvent {
                id: Uuid::new_v4(),
                timestamp: Utc::now(),
                event_type: event_type.to_string(),
                stage: Stage::Govern.as_str().to_string(),
                component: COMPONENT.to_string(),
                data: data.clone(),
                metadata: json!({
                    "environment": environment,
                    "actor": context.actor,
                    "attributes": context.attributes,
                }),
            });
            evidence.push(
                EvidenceRecord::new(Stage::Govern, COMPONENT, "evaluate_rule", status)
                    .with_input(json!({ "ruleId": rule.id, "path": rule.path }))
                    .with_output(data),
            );
        }

        let mut violations_by_severity = BTreeMap::new();
        for v in &violations {
            *violations_by_severity
                .entry(v.severity.as_str().to_string())
                .or_insert(0) += 1;
        }
        let summary = GovernanceSummary {
            total_rules: self.rules.len(),
            evaluated: self.rules.len() - skipped,
            skipped,
            violations_by_severity,
            highest_severity: violations.iter().map(|v| v.severity).max(),
        };

        let passed = violations.is_empty();
        let status = if passed {
            StageStatus::Success
        } else {
            StageStatus::Error
        };

        if passed {
            debug!("Governance passed: {} rules, {} skipped", summary.total_rules, skipped);
        } else {
            info!(
                "🛑 Governance veto: {} violation(s) in environment {}",
                violations.len(),
                environment
            );
        }

        evidence.push(
            EvidenceRecord::new(Stage::Govern, COMPONENT, "enforce", status.into())
                .with_input(json!({
                    "environment": environment,
                    "contentHash": document.content_hash(),
                }))
                .with_output(json!({ "passed": passed, "summary": summary, "violations": violations }))
                .with_metric("rules", summary.total_rules)
                .with_metric("violations", violations.len())
                .with_metric("skipped", skipped),
        );

        GovernanceResult {
            status,
            events,
            violations,
            passed,
            summary,
            evidence,
        }
    }

    fn evaluate(&self, rule: &Rule, document: &ConfigDocument, context: &GovernanceContext) -> Outcome {
        let value = document.get(&rule.path);
        let result = match &rule.kind {
            RuleKind::Required => check_required(value),
            RuleKind::Forbidden => check_forbidden(value),
            RuleKind::Pattern { regex } => check_pattern(value, regex),
            RuleKind::Range { min, max } => check_range(value, *min, *max),
            RuleKind::Enum { values } => check_enum(value, values),
            RuleKind::Custom { predicate } => match self.predicates.get(predicate) {
                Some(p) => (p.0)(value, document, context),
                None => Err(format!("unknown predicate '{}'", predicate)),
            },
        };

        match result {
            Ok(()) => Outcome::Passed,
            Err(default_message) => Outcome::Failed(rule.message.clone().unwrap_or(default_message)),
        }
    }
}

/// Absent and null both count as missing
fn present(value: Option<&Value>) -> Option<&Value> {
    value.filter(|v| !v.is_null())
}

fn check_required(value: Option<&Value>) -> Result<(), String> {
    match present(value) {
        Some(_) => Ok(()),
        None => Err("required value is missing".to_string()),
    }
}

fn check_forbidden(value: Option<&Value>) -> Result<(), String> {
    match present(value) {
        Some(_) => Err("value must not be set".to_string()),
        None => Ok(()),
    }
}

fn check_pattern(value: Option<&Value>, regex: &str) -> Result<(), String> {
    let Some(value) = present(value) else {
        return Ok(());
    };
    let re = Regex::new(regex).map_err(|e| format!("invalid pattern '{}': {}", regex, e))?;
    match value {
        Value::String(s) if re.is_match(s) => Ok(()),
        Value::String(s) => Err(format!("'{}' does not match '{}'", s, regex)),
        other => Err(format!("expected a string, found {}", crate::document::type_name(other))),
    }
}

fn check_range(value: Option<&Value>, min: Option<f64>, max: Option<f64>) -> Result<(), String> {
    let Some(value) = present(value) else {
        return Ok(());
    };
    let n = value
        .as_f64()
        .ok_or_else(|| format!("expected a number, found {}", crate::document::type_name(value)))?;
    if let Some(min) = min {
        if n < min {
            return Err(format!("{} is below the minimum {}", value, min));
        }
    }
    if let Some(max) = max {
        if n > max {
            return Err(format!("{} is above the maximum {}", value, max));
        }
    }
    Ok(())
}

fn check_enum(value: Option<&Value>, values: &[Value]) -> Result<(), String> {
    match present(value) {
        Some(v) if !values.contains(v) => Err(format!(
            "{} is not one of {}",
            v,
            Value::Array(values.to_vec())
        )),
        _ => Ok(()),
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

    #[test]
    fn test_required_owner_yields_exactly_one_violation() {
        let engine = GovernanceEngine::new(vec![Rule::required("G001", "owner")]);
        let result = engine.enforce(&doc(json!({"env": "dev", "replicas": 1})), "dev", None);

        assert!(!result.passed);
        assert_eq!(result.status, StageStatus::Error);
        assert_eq!(result.violations.len(), 1);
        assert_eq!(result.violations[0].path, "owner");
        assert_eq!(result.events.len(), 1);
        assert_eq!(result.events[0].event_type, "rule.failed");
        assert_eq!(result.errors()[0].kind(), "GovernanceViolation");
    }

    #[test]
    fn test_one_event_per_rule_in_order() {
        let engine = GovernanceEngine::new(vec![
            Rule::required("R1", "owner"),
            Rule::forbidden("R2", "debug"),
            Rule::pattern("R3", "image", "^registry/"),
            Rule::range("R4", "replicas", Some(1.0), Some(5.0)),
            Rule::one_of("R5", "env", vec![json!("dev"), json!("prod")]),
        ]);
        let result = engine.enforce(
            &doc(json!({"owner": "core", "image": "registry/api", "replicas": 3, "env": "dev"})),
            "dev",
            None,
        );
        assert!(result.passed);
        let ids: Vec<_> = result.events.iter().map(|e| e.data["ruleId"].clone()).collect();
        assert_eq!(ids, vec![json!("R1"), json!("R2"), json!("R3"), json!("R4"), json!("R5")]);
        assert!(result.events.iter().all(|e| e.event_type == "rule.passed"));
        // one record per rule plus the summary
        assert_eq!(result.evidence.len(), 6);
    }

    #[test]
    fn test_each_kind_reports_failures() {
        let engine = GovernanceEngine::new(vec![
            Rule::forbidden("R2", "debug").with_severity(Severity::Warning),
            Rule::pattern("R3", "image", "^registry/"),
            Rule::range("R4", "replicas", Some(1.0), Some(5.0)).with_severity(Severity::Block),
            Rule::one_of("R5", "env", vec![json!("dev"), json!("prod")]),
        ]);
        let result = engine.enforce(
            &doc(json!({"debug": true, "image": "docker.io/api", "replicas": 9, "env": "qa"})),
            "dev",
            None,
        );
        assert_eq!(result.violations.len(), 4);
        assert_eq!(result.summary.highest_severity, Some(Severity::Block));
        assert_eq!(result.summary.violations_by_severity["error"], 2);
        assert_eq!(result.summary.violations_by_severity["warning"], 1);
    }

    #[test]
    fn test_absent_values_pass_value_rules() {
        let engine = GovernanceEngine::new(vec![
            Rule::pattern("R3", "image", "^registry/"),
            Rule::range("R4", "replicas", Some(1.0), None),
        ]);
        assert!(engine.enforce(&doc(json!({})), "dev", None).passed);
    }

    #[test]
    fn test_environment_filter_and_disabled_rules_are_skipped() {
        let mut disabled = Rule::required("R2", "cost_center");
        disabled.enabled = false;
        let engine = GovernanceEngine::new(vec![
            Rule::required("R1", "owner").for_environments(["prod"]),
            disabled,
        ]);
        let result = engine.enforce(&doc(json!({})), "dev", None);
        assert!(result.passed);
        assert_eq!(result.summary.skipped, 2);
        assert_eq!(result.events.len(), 2);
        assert!(result.events.iter().all(|e| e.event_type == "rule.skipped"));

        let prod = engine.enforce(&doc(json!({})), "prod", None);
        assert_eq!(prod.violations.len(), 1);
    }

    #[test]
    fn test_custom_predicates() {
        let mut engine = GovernanceEngine::new(vec![
            Rule::custom("C1", "replicas", "prod_needs_ha"),
            Rule::custom("C2", "replicas", "not_registered"),
        ]);
        engine.register_predicate(
            "prod_needs_ha",
            Predicate::new(|value, _doc, ctx| {
                let env_is_prod = ctx.attributes.get("tier") == Some(&json!("prod"));
                match value.and_then(Value::as_i64) {
                    Some(n) if env_is_prod && n < 2 => Err("prod needs at least 2 replicas".into()),
                    _ => Ok(()),
                }
            }),
        );

        let mut context = GovernanceContext::default();
        context.attributes.insert("tier".to_string(), json!("prod"));
        let result = engine.enforce(&doc(json!({"replicas": 1})), "prod", Some(&context));

        assert_eq!(result.violations.len(), 2);
        assert_eq!(result.violations[0].message, "prod needs at least 2 replicas");
        assert_eq!(result.violations[1].message, "unknown predicate 'not_registered'");
    }

    #[test]
    fn test_rule_message_overrides_default() {
        let engine = GovernanceEngine::new(vec![
            Rule::required("G001", "owner").with_message("every config needs an owning team"),
        ]);
        let result = engine.enforce(&doc(json!({})), "dev", None);
        assert_eq!(result.violations[0].message, "every config needs an owning team");
    }
}
