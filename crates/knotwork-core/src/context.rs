use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Flat key/value configuration handed to every lifecycle phase of a unit.
pub type Params = HashMap<String, serde_json::Value>;

/// Shallow-merge configuration layers; later layers win on conflicting keys.
pub fn merge_params(layers: &[&Params]) -> Params {
    let mut merged = Params::new();
    for layer in layers {
        for (k, v) in layer.iter() {
            merged.insert(k.clone(), v.clone());
        }
    }
    merged
}

/// Mutable state threaded through every phase of every unit for one run.
///
/// Keys are strings; values are JSON so nodes can exchange arbitrary data.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SharedContext {
    data: HashMap<String, serde_json::Value>,
}

impl SharedContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get a value by key.
    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.data.get(key)
    }

    /// Get a value as a string, if it's a string.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.data.get(key).and_then(|v| v.as_str())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.data.contains_key(key)
    }

    /// Set a value, returning the previous one.
    pub fn set(
        &mut self,
        key: impl Into<String>,
        value: serde_json::Value,
    ) -> Option<serde_json::Value> {
        self.data.insert(key.into(), value)
    }

    /// Set a string value.
    pub fn set_str(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.data
            .insert(key.into(), serde_json::Value::String(value.into()));
    }

    pub fn remove(&mut self, key: &str) -> Option<serde_json::Value> {
        self.data.remove(key)
    }

    /// Append a value to the array stored under `key`, creating it if missing.
    ///
    /// A non-array value under `key` is replaced by a one-element array.
    pub fn push(&mut self, key: impl Into<String>, value: serde_json::Value) {
        let slot = self
            .data
            .entry(key.into())
            .or_insert_with(|| serde_json::Value::Array(Vec::new()));
        match slot {
            serde_json::Value::Array(items) => items.push(value),
            other => *other = serde_json::Value::Array(vec![value]),
        }
    }

    /// Keys inserted, changed, or removed relative to `base`.
    pub fn delta_since(&self, base: &SharedContext) -> ContextDelta {
        let upserts = self
            .data
            .iter()
            .filter(|(k, v)| base.data.get(*k) != Some(*v))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        let mut removals: Vec<String> = base
            .data
            .keys()
            .filter(|k| !self.data.contains_key(*k))
            .cloned()
            .collect();
        removals.sort();
        ContextDelta { upserts, removals }
    }

    /// Apply a delta produced by [`SharedContext::delta_since`].
    pub fn apply(&mut self, delta: ContextDelta) {
        for key in &delta.removals {
            self.data.remove(key);
        }
        self.data.extend(delta.upserts);
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Changes one isolated branch made to its copy of the shared context.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContextDelta {
    pub upserts: HashMap<String, serde_json::Value>,
    pub removals: Vec<String>,
}

impl ContextDelta {
    pub fn is_empty(&self) -> bool {
        self.upserts.is_empty() && self.removals.is_empty()
    }
}
