//! Chart value overlays.
//!
//! A typed, recursively defined configuration tree with an explicit merge.
//! The pipeline layers three sources in increasing priority: chart defaults,
//! environment overrides from the request, and the computed image
//! coordinates. Merging is key-path based with last-writer-wins on
//! conflicting leaves.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::{Result, SkiffError};

/// One node of the configuration tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Table(BTreeMap<String, Value>),
}

/// A string-keyed configuration tree.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Values(pub BTreeMap<String, Value>);

impl Values {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a YAML document into a tree. Empty input yields an empty tree.
    pub fn from_yaml(raw: &[u8]) -> Result<Self> {
        if raw.iter().all(|b| b.is_ascii_whitespace()) {
            return Ok(Self::new());
        }
        let doc: serde_yaml::Value = serde_yaml::from_slice(raw)
            .map_err(|e| SkiffError::InvalidValues { reason: e.to_string() })?;
        match convert_yaml(doc)? {
            Value::Table(table) => Ok(Self(table)),
            _ => Err(SkiffError::InvalidValues {
                reason: "top-level values must be a mapping".to_string(),
            }),
        }
    }

    /// Render the tree back to YAML for the release engine.
    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(&self.0)
            .map_err(|e| SkiffError::InvalidValues { reason: e.to_string() })
    }

    /// Merge `other` over `self`. Tables merge recursively; on a leaf
    /// conflict, or when a leaf meets a table, `other` wins.
    pub fn merge(&mut self, other: Values) {
        merge_tables(&mut self.0, other.0);
    }

    /// Set a dot-separated key path to a leaf value, creating intermediate
    /// tables as needed and overwriting whatever was there.
    pub fn set_path(&mut self, path: &str, value: Value) -> Result<()> {
        let mut segments = path.split('.').collect::<Vec<_>>();
        if segments.iter().any(|s| s.is_empty()) {
            return Err(SkiffError::InvalidValues {
                reason: format!("invalid key path {:?}", path),
            });
        }
        let leaf = segments.pop().ok_or_else(|| SkiffError::InvalidValues {
            reason: "empty key path".to_string(),
        })?;

        let mut table = &mut self.0;
        for segment in segments {
            let entry = table
                .entry(segment.to_string())
                .or_insert_with(|| Value::Table(BTreeMap::new()));
            if !matches!(entry, Value::Table(_)) {
                *entry = Value::Table(BTreeMap::new());
            }
            match entry {
                Value::Table(inner) => table = inner,
                _ => unreachable!(),
            }
        }
        table.insert(leaf.to_string(), value);
        Ok(())
    }

    /// Look up a dot-separated key path.
    pub fn get_path(&self, path: &str) -> Option<&Value> {
        let mut segments = path.split('.');
        let first = segments.next()?;
        let mut current = self.0.get(first)?;
        for segment in segments {
            match current {
                Value::Table(table) => current = table.get(segment)?,
                _ => return None,
            }
        }
        Some(current)
    }
}

/// Parse a flat `key=value[,key=value...]` override string into `values`.
///
/// Keys are dot-separated paths. Literal `true`/`false` become booleans and
/// integer literals become integers; everything else stays a string.
pub fn parse_set(spec: &str, values: &mut Values) -> Result<()> {
    for pair in spec.split(',') {
        let pair = pair.trim();
        if pair.is_empty() {
            continue;
        }
        let (key, raw) = pair.split_once('=').ok_or_else(|| SkiffError::InvalidValues {
            reason: format!("expected key=value, got {:?}", pair),
        })?;
        values.set_path(key.trim(), coerce(raw.trim()))?;
    }
    Ok(())
}

fn coerce(raw: &str) -> Value {
    match raw {
        "true" => Value::Bool(true),
        "false" => Value::Bool(false),
        _ => match raw.parse::<i64>() {
            Ok(n) => Value::Int(n),
            Err(_) => Value::String(raw.to_string()),
        },
    }
}

fn merge_tables(base: &mut BTreeMap<String, Value>, overlay: BTreeMap<String, Value>) {
    for (key, incoming) in overlay {
        match (base.get_mut(&key), incoming) {
            (Some(Value::Table(existing)), Value::Table(incoming)) => {
                merge_tables(existing, incoming);
            }
            (_, incoming) => {
                base.insert(key, incoming);
            }
        }
    }
}

fn convert_yaml(doc: serde_yaml::Value) -> Result<Value> {
    match doc {
        serde_yaml::Value::Bool(b) => Ok(Value::Bool(b)),
        serde_yaml::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Ok(Value::Int(i))
            } else {
                Ok(Value::Float(n.as_f64().unwrap_or_default()))
            }
        }
        serde_yaml::Value::String(s) => Ok(Value::String(s)),
        serde_yaml::Value::Null => Ok(Value::String(String::new())),
        serde_yaml::Value::Sequence(seq) => {
            // Sequences are uncommon in override trees; render them opaque.
            let rendered = serde_yaml::to_string(&seq)
                .map_err(|e| SkiffError::InvalidValues { reason: e.to_string() })?;
            Ok(Value::String(rendered.trim_end().to_string()))
        }
        serde_yaml::Value::Mapping(map) => {
            let mut table = BTreeMap::new();
            for (key, val) in map {
                let key = key.as_str().ok_or_else(|| SkiffError::InvalidValues {
                    reason: "mapping keys must be strings".to_string(),
                })?;
                table.insert(key.to_string(), convert_yaml(val)?);
            }
            Ok(Value::Table(table))
        }
        serde_yaml::Value::Tagged(tagged) => convert_yaml(tagged.value),
    }
}
