use std::collections::hash_map::DefaultHasher;
use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Generic record (a data row). JSON keeps us format-agnostic; after the map
/// phase every record is a key/value object `{ "k": ..., "v": ... }`.
pub type Record = Value;

/// Closed set of map functions a job can reference by name.
/// The worker dispatches on the variant; there is no user code loading.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MapFn {
    /// Split a line on whitespace, normalize tokens, emit `{k: word, v: 1}`.
    TokenizeCount,
    /// Emit `{k: "all", v: <line>}` so a downstream reduce sees every line
    /// under one key (string concatenation style jobs).
    GroupLines,
}

/// Closed set of reduce functions.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ReduceFn {
    /// Sum numeric values per key.
    SumByKey,
    /// Concatenate string values per key, separated by a single space,
    /// in input order.
    ConcatByKey,
}

impl MapFn {
    /// Apply the map function to one input line.
    pub fn apply(&self, line: &str) -> Vec<Record> {
        match self {
            MapFn::TokenizeCount => {
                let mut out = Vec::new();
                for raw in line.split_whitespace() {
                    let cleaned: String = raw
                        .chars()
                        .filter(|c| c.is_alphanumeric() || *c == '_')
                        .collect::<String>()
                        .to_lowercase();
                    if !cleaned.is_empty() {
                        out.push(json!({ "k": cleaned, "v": 1_u64 }));
                    }
                }
                out
            }
            MapFn::GroupLines => {
                if line.is_empty() {
                    Vec::new()
                } else {
                    vec![json!({ "k": "all", "v": line })]
                }
            }
        }
    }
}

impl ReduceFn {
    /// Reduce values grouped by key. Output is sorted by key so repeated
    /// runs of the same partition are byte-identical.
    pub fn apply(&self, groups: BTreeMap<String, Vec<Value>>) -> Vec<(String, Value)> {
        match self {
            ReduceFn::SumByKey => groups
                .into_iter()
                .map(|(k, vs)| {
                    let sum: u64 = vs.iter().filter_map(|v| v.as_u64()).sum();
                    (k, json!(sum))
                })
                .collect(),
            ReduceFn::ConcatByKey => groups
                .into_iter()
                .map(|(k, vs)| {
                    let joined = vs
                        .iter()
                        .filter_map(|v| v.as_str())
                        .collect::<Vec<_>>()
                        .join(" ");
                    (k, json!(joined))
                })
                .collect(),
        }
    }
}

/// Extract the shuffle key of a post-map record.
pub fn record_key(rec: &Record) -> Option<&str> {
    rec.get("k").and_then(|v| v.as_str())
}

/// Deterministic key → reduce-partition assignment. Every map task must
/// agree on this, across processes, for the shuffle to line up.
pub fn partition_for_key(key: &str, num_partitions: u32) -> u32 {
    let mut h = DefaultHasher::new();
    key.hash(&mut h);
    (h.finish() % num_partitions.max(1) as u64) as u32
}

/// Group post-map records by key, preserving value order within a key.
pub fn group_by_key<I>(records: I) -> BTreeMap<String, Vec<Value>>
where
    I: IntoIterator<Item = Record>,
{
    let mut groups: BTreeMap<String, Vec<Value>> = BTreeMap::new();
    for rec in records {
        if let Some(key) = record_key(&rec) {
            let key = key.to_string();
            let val = rec.get("v").cloned().unwrap_or(Value::Null);
            groups.entry(key).or_default().push(val);
        }
    }
    groups
}
