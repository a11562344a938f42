//! Field patches with last-write-wins merge.
//!
//! A [`FieldPatch`] is the unit of a logical write: an ordered map of
//! top-level field names to JSON values. Merging is shallow; nested objects
//! are replaced wholesale, never deep-merged.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Ordered field map applied to a single document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FieldPatch {
    fields: BTreeMap<String, Value>,
}

impl FieldPatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    pub fn with(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(field.into(), value.into());
        self
    }

    /// Insert or replace a single field, returning the previous value.
    pub fn insert(&mut self, field: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.fields.insert(field.into(), value.into())
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    pub fn contains(&self, field: &str) -> bool {
        self.fields.contains_key(field)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.fields.iter()
    }

    /// Merge a newer patch on top of this one. Fields in `newer` win.
    ///
    /// Returns the number of fields that were overwritten.
    pub fn merge_newer(&mut self, newer: FieldPatch) -> usize {
        let mut overwritten = 0;
        for (field, value) in newer.fields {
            if self.fields.insert(field, value).is_some() {
                overwritten += 1;
            }
        }
        overwritten
    }

    /// Merge an older patch underneath this one. Existing fields win.
    pub fn merge_older(&mut self, older: FieldPatch) {
        for (field, value) in older.fields {
            self.fields.entry(field).or_insert(value);
        }
    }

    /// Build a patch from a JSON object. Returns `None` for any other value.
    pub fn from_json(value: Value) -> Option<Self> {
        match value {
            Value::Object(map) => Some(Self {
                fields: map.into_iter().collect(),
            }),
            _ => None,
        }
    }

    /// Render as a JSON object.
    pub fn to_json(&self) -> Value {
        Value::Object(
            self.fields
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        )
    }

    pub fn into_inner(self) -> BTreeMap<String, Value> {
        self.fields
    }
}

impl FromIterator<(String, Value)> for FieldPatch {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        Self {
            fields: iter.into_iter().collect(),
        }
    }
}

impl From<BTreeMap<String, Value>> for FieldPatch {
    fn from(fields: BTreeMap<String, Value>) -> Self {
        Self { fields }
    }
}
