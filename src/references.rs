//! `${dotted.path}` references inside string values
//!
//! A string that is exactly one reference takes the referenced value with its
//! type; references embedded in longer strings are interpolated. References
//! are resolved in dependency order, and cycles are rejected.

use crate::document::{get_path, join_path, Mapping};
use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::fmt;

static REFERENCE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\$\{([A-Za-z0-9_.\-]+)\}").expect("reference pattern is valid")
});

/// A reference whose target does not exist
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnresolvedReference {
    /// Where the reference appears
    pub location: String,
    /// The path it points at
    pub reference: String,
}

impl fmt::Display for UnresolvedReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unresolved reference ${{{}}} at '{}'", self.reference, self.location)
    }
}

/// References that depend on each other in a loop
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReferenceCycle {
    pub chain: Vec<String>,
}

impl fmt::Display for ReferenceCycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "reference cycle: {}", self.chain.join(" -> "))
    }
}

#[derive(Debug, Clone)]
pub struct Resolution {
    pub root: Mapping,
    pub resolved: usize,
    pub unresolved: Vec<UnresolvedReference>,
}

pub fn has_references(s: &str) -> bool {
    REFERENCE.is_match(s)
}

/// Every reference target named in `s`
pub fn targets(s: &str) -> Vec<String> {
    REFERENCE
        .captures_iter(s)
        .map(|c| c[1].to_string())
        .collect()
}

/// Resolve every reference in `root` against `root` itself
pub fn resolve_references(root: &Mapping) -> Result<Resolution, ReferenceCycle> {
    let mut working = Value::Object(root.clone());

    let mut refs = BTreeMap::new();
    collect(&working, "", &mut refs);
    if refs.is_empty() {
        return Ok(Resolution {
            root: root.clone(),
            resolved: 0,
            unresolved: Vec::new(),
        });
    }

    let order = dependency_order(&refs)?;

    let mut resolved = 0;
    let mut unresolved = Vec::new();
    for location in order {
        let Some(template) = refs.get(&location) else {
            continue;
        };
        let (value, count, missing) = substitute(template, &working);
        resolved += count;
        unresolved.extend(missing.into_iter().map(|reference| UnresolvedReference {
            location: location.clone(),
            reference,
        }));
        if let Some(slot) = working.pointer_mut(&to_pointer(&location)) {
            *slot = value;
        }
    }

    let root = match working {
        Value::Object(map) => map,
        _ => root.clone(),
    };
    Ok(Resolution {
        root,
        resolved,
        unresolved,
    })
}

fn collect(value: &Value, prefix: &str, out: &mut BTreeMap<String, String>) {
    match value {
        Value::String(s) if has_references(s) => {
            out.insert(prefix.to_string(), s.clone());
        }
        Value::Object(map) => {
            for (k, v) in map {
                collect(v, &join_path(prefix, k), out);
            }
        }
        Value::Array(items) => {
            for (i, v) in items.iter().enumerate() {
                collect(v, &join_path(prefix, &i.to_string()), out);
            }
        }
        _ => {}
    }
}

/// Whether the value at `location` is, contains, or lies inside `target`
fn related(location: &str, target: &str) -> bool {
    location == target
        || location.starts_with(&format!("{}.", target))
        || target.starts_with(&format!("{}.", location))
}

#[derive(Clone, Copy, PartialEq)]
enum Mark {
    Visiting,
    Done,
}

/// Post-order over reference locations so targets resolve before their users
fn dependency_order(refs: &BTreeMap<String, String>) -> Result<Vec<String>, ReferenceCycle> {
    let deps: HashMap<String, Vec<String>> = refs
        .iter()
        .map(|(location, template)| {
            let wanted = targets(template);
            let edges = refs
                .keys()
                .filter(|other| wanted.iter().any(|t| related(other, t)))
                .cloned()
                .collect();
            (location.clone(), edges)
        })
        .collect();

    let mut marks = HashMap::new();
    let mut stack = Vec::new();
    let mut order = Vec::new();
    for location in refs.keys() {
        visit(location, &deps, &mut marks, &mut stack, &mut order)?;
    }
    Ok(order)
}

fn visit(
    node: &str,
    deps: &HashMap<String, Vec<String>>,
    marks: &mut HashMap<String, Mark>,
    stack: &mut Vec<String>,
    order: &mut Vec<String>,
) -> Result<(), ReferenceCycle> {
    match marks.get(node) {
        Some(Mark::Done) => return Ok(()),
        Some(Mark::Visiting) => {
            let start = stack.iter().position(|n| n == node).unwrap_or(0);
            let mut chain = stack[start..].to_vec();
            chain.push(node.to_string());
            return Err(ReferenceCycle { chain });
        }
        None => {}
    }

    marks.insert(node.to_string(), Mark::Visiting);
    stack.push(node.to_string());
    for dep in deps.get(node).map(Vec::as_slice).unwrap_or_default() {
        visit(dep, deps, marks, stack, order)?;
    }
    stack.pop();
    marks.insert(node.to_string(), Mark::Done);
    order.push(node.to_string());
    Ok(())
}

/// Returns the new value, the number of substituted references and the
/// targets that were missing
fn substitute(template: &str, working: &Value) -> (Value, usize, Vec<String>) {
    // whole-string reference keeps the target's type
    if let Some(caps) = REFERENCE.captures(template) {
        if caps.get(0).map(|m| m.as_str().len()) == Some(template.len()) {
            return match get_path(working, &caps[1]) {
                Some(v) => (v.clone(), 1, Vec::new()),
                None => (Value::String(template.to_string()), 0, vec![caps[1].to_string()]),
            };
        }
    }

    let mut count = 0;
    let mut missing = Vec::new();
    let text = REFERENCE.replace_all(template, |caps: &Captures| match get_path(working, &caps[1]) {
        Some(v) => {
            count += 1;
            scalar_text(v)
        }
        None => {
            missing.push(caps[1].to_string());
            caps[0].to_string()
        }
    });
    (Value::String(text.into_owned()), count, missing)
}

fn scalar_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn to_pointer(location: &str) -> String {
    location
        .split('.')
        .filter(|s| !s.is_empty())
        .map(|s| format!("/{}", s.replace('~', "~0").replace('/', "~1")))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn map(value: Value) -> Mapping {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_whole_reference_keeps_type() {
        let root = map(json!({"defaults": {"replicas": 3, "labels": {"team": "core"}},
            "replicas": "${defaults.replicas}", "labels": "${defaults.labels}"}));
        let res = resolve_references(&root).unwrap();
        assert_eq!(res.root["replicas"], json!(3));
        assert_eq!(res.root["labels"], json!({"team": "core"}));
        assert_eq!(res.resolved, 2);
        assert!(res.unresolved.is_empty());
    }

    #[test]
    fn test_embedded_references_interpolate() {
        let root = map(json!({"host": "db", "port": 5432, "url": "pg://${host}:${port}/app"}));
        let res = resolve_references(&root).unwrap();
        assert_eq!(res.root["url"], json!("pg://db:5432/app"));
    }

    #[test]
    fn test_chained_references_resolve_in_dependency_order() {
        let root = map(json!({"a": "${b}", "b": "${c.value}", "c": {"value": "final"}}));
        let res = resolve_references(&root).unwrap();
        assert_eq!(res.root["a"], json!("final"));
        assert_eq!(res.root["b"], json!("final"));
    }

    #[test]
    fn test_sequence_elements_are_addressable() {
        let root = map(json!({"ports": [80, 443], "tls": "${ports.1}", "list": ["${ports.0}"]}));
        let res = resolve_references(&root).unwrap();
        assert_eq!(res.root["tls"], json!(443));
        assert_eq!(res.root["list"], json!([80]));
    }

    #[test]
    fn test_missing_target_is_reported_and_kept() {
        let root = map(json!({"url": "http://${missing.host}/"}));
        let res = resolve_references(&root).unwrap();
        assert_eq!(res.root["url"], json!("http://${missing.host}/"));
        assert_eq!(
            res.unresolved,
            vec![UnresolvedReference {
                location: "url".to_string(),
                reference: "missing.host".to_string(),
            }]
        );
    }

    #[test]
    fn test_cycles_are_rejected() {
        let root = map(json!({"a": "${b}", "b": "${a}"}));
        let err = resolve_references(&root).unwrap_err();
        assert_eq!(err.chain.first(), err.chain.last());
        assert!(err.to_string().starts_with("reference cycle"));

        let ancestor = map(json!({"svc": {"name": "${svc}"}}));
        assert!(resolve_references(&ancestor).is_err());
    }
}
