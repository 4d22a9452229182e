//! Configuration document model
//!
//! A `ConfigDocument` is an ordered tree of string keys to JSON-compatible
//! values together with the provenance of every source that contributed to
//! it. Documents are never mutated in place: stages derive new documents.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

/// Ordered mapping used for every document node
pub type Mapping = Map<String, Value>;

/// Where a document (or part of it) came from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Provenance {
    /// Path of the source file relative to its source root
    pub origin: String,
    /// Source description (directory root or `repo@ref`)
    pub source: String,
    /// Position of the file in the deterministic load order
    pub order: usize,
}

impl Provenance {
    pub fn new(origin: impl Into<String>, source: impl Into<String>, order: usize) -> Self {
        Self {
            origin: origin.into(),
            source: source.into(),
            order,
        }
    }

    /// Provenance for documents built in memory (overlays, tests)
    pub fn inline(name: impl Into<String>) -> Self {
        Self::new(name, "inline", 0)
    }
}

/// Immutable configuration document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigDocument {
    root: Mapping,
    provenance: Vec<Provenance>,
}

impl ConfigDocument {
    pub fn new(root: Mapping, provenance: Provenance) -> Self {
        Self {
            root,
            provenance: vec![provenance],
        }
    }

    pub fn from_parts(root: Mapping, provenance: Vec<Provenance>) -> Self {
        Self { root, provenance }
    }

    pub fn empty() -> Self {
        Self {
            root: Mapping::new(),
            provenance: Vec::new(),
        }
    }

    /// Build a document from a JSON value; non-mapping roots are rejected
    pub fn from_value(value: Value, provenance: Provenance) -> Option<Self> {
        match value {
            Value::Object(root) => Some(Self::new(root, provenance)),
            _ => None,
        }
    }

    /// Derive a new document with a replaced tree and the same provenance
    pub fn derive(&self, root: Mapping) -> Self {
        Self {
            root,
            provenance: self.provenance.clone(),
        }
    }

    /// Derive a new document carrying the union of both provenance lists
    pub fn derive_merged(&self, root: Mapping, other: &ConfigDocument) -> Self {
        let mut provenance = self.provenance.clone();
        for p in &other.provenance {
            if !provenance.contains(p) {
                provenance.push(p.clone());
            }
        }
        Self { root, provenance }
    }

    pub fn root(&self) -> &Mapping {
        &self.root
    }

    pub fn to_value(&self) -> Value {
        Value::Object(self.root.clone())
    }

    pub fn provenance(&self) -> &[Provenance] {
        &self.provenance
    }

    pub fn is_empty(&self) -> bool {
        self.root.is_empty()
    }

    pub fn get(&self, path: &str) -> Option<&Value> {
        get_in_map(&self.root, path)
    }

    pub fn contains(&self, path: &str) -> bool {
        self.get(path).is_some()
    }

    /// SHA-256 over the serialized tree (declaration order preserved)
    pub fn content_hash(&self) -> String {
        let bytes = serde_json::to_vec(&self.root).unwrap_or_default();
        let mut hasher = Sha256::new();
        hasher.update(&bytes);
        hex::encode(hasher.finalize())
    }
}

/// Split a dotted path into segments, ignoring empty ones
pub fn split_path(path: &str) -> Vec<&str> {
    path.split('.').filter(|s| !s.is_empty()).collect()
}

pub fn join_path(prefix: &str, key: &str) -> String {
    if prefix.is_empty() {
        key.to_string()
    } else {
        format!("{}.{}", prefix, key)
    }
}

/// Resolve a dotted path; numeric segments index into sequences
pub fn get_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = value;
    for segment in split_path(path) {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

pub fn get_in_map<'a>(root: &'a Mapping, path: &str) -> Option<&'a Value> {
    let segments = split_path(path);
    let (first, rest) = segments.split_first()?;
    let head = root.get(*first)?;
    if rest.is_empty() {
        Some(head)
    } else {
        get_path(head, &rest.join("."))
    }
}

/// Set a value at a dotted path, creating intermediate mappings.
/// Returns false when an intermediate node exists but is not a mapping.
pub fn set_in_map(root: &mut Mapping, path: &str, value: Value) -> bool {
    let segments = split_path(path);
    let Some((last, parents)) = segments.split_last() else {
        return false;
    };

    let mut current = root;
    for segment in parents {
        let entry = current
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(Mapping::new()));
        match entry {
            Value::Object(map) => current = map,
            _ => return false,
        }
    }
    current.insert(last.to_string(), value);
    true
}

/// Expand a path pattern (`*` matches any key or index) into concrete paths
pub fn match_paths<'a>(value: &'a Value, pattern: &str) -> Vec<(String, &'a Value)> {
    let segments = split_path(pattern);
    let mut matches = Vec::new();
    collect_matches(value, &segments, String::new(), &mut matches);
    matches
}

fn collect_matches<'a>(
    value: &'a Value,
    segments: &[&str],
    prefix: String,
    out: &mut Vec<(String, &'a Value)>,
) {
    let Some((head, rest)) = segments.split_first() else {
        out.push((prefix, value));
        return;
    };

    let children: Vec<(String, &Value)> = match value {
        Value::Object(map) if *head == "*" => {
            map.iter().map(|(k, v)| (k.clone(), v)).collect()
        }
        Value::Object(map) => map
            .get(*head)
            .map(|v| vec![(head.to_string(), v)])
            .unwrap_or_default(),
        Value::Array(items) if *head == "*" => items
            .iter()
            .enumerate()
            .map(|(i, v)| (i.to_string(), v))
            .collect(),
        Value::Array(items) => head
            .parse::<usize>()
            .ok()
            .and_then(|i| items.get(i))
            .map(|v| vec![(head.to_string(), v)])
            .unwrap_or_default(),
        _ => Vec::new(),
    };

    for (key, child) in children {
        collect_matches(child, rest, join_path(&prefix, &key), out);
    }
}

/// Deep-merge `overlay` into `base`. Mappings merge recursively, everything
/// else is replaced. Paths whose value actually changed are appended to
/// `overridden`.
pub fn deep_merge(base: &mut Mapping, overlay: &Mapping, prefix: &str, overridden: &mut Vec<String>) {
    for (key, incoming) in overlay {
        let path = join_path(prefix, key);
        match (base.get_mut(key), incoming) {
            (Some(Value::Object(existing)), Value::Object(incoming_map)) => {
                deep_merge(existing, incoming_map, &path, overridden);
            }
            (Some(existing), _) => {
                if existing != incoming {
                    *existing = incoming.clone();
                    overridden.push(path);
                }
            }
            (None, _) => {
                base.insert(key.clone(), incoming.clone());
                overridden.push(path);
            }
        }
    }
}

/// Human-readable type name used in validation messages
pub fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(n) if n.is_i64() || n.is_u64() => "integer",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
