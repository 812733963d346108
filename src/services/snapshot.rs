//! Reassembles sub-lists that the daemon reports incrementally.
//!
//! A poll response may omit a sub-list field entirely ("unchanged") or carry
//! only the entries that changed, keyed by an integer index. The merger keeps
//! the last full view per file hash and overlays each partial update on it.

use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, HashMap, HashSet};

use serde_json::{Map, Value};

use crate::utils::ed2k::normalize_hash;

type IndexedEntries = BTreeMap<i64, Map<String, Value>>;

pub struct SnapshotMerger {
    field: String,
    index_key: String,
    cache: HashMap<String, Value>,
}

impl SnapshotMerger {
    pub fn new(field: impl Into<String>, index_key: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            index_key: index_key.into(),
            cache: HashMap::new(),
        }
    }

    pub fn field(&self) -> &str {
        &self.field
    }

    pub fn cached(&self, hash: &str) -> Option<&Value> {
        self.cache.get(&normalize_hash(hash))
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    pub fn forget(&mut self, hash: &str) {
        self.cache.remove(&normalize_hash(hash));
    }

    /// Drops cache entries for files no longer present in live state.
    pub fn retain(&mut self, live_hashes: &HashSet<String>) {
        let live: HashSet<String> = live_hashes.iter().map(|hash| normalize_hash(hash)).collect();
        self.cache.retain(|hash, _| live.contains(hash));
    }

    /// Replaces the sub-list field of one file's poll record with the merged
    /// full view.
    pub fn merge(&mut self, hash: &str, record: &mut Map<String, Value>) {
        let hash = normalize_hash(hash);
        let Some(incoming) = record.remove(&self.field) else {
            if let Some(cached) = self.cache.get(&hash) {
                record.insert(self.field.clone(), cached.clone());
            }
            return;
        };

        let mut merged = self
            .cache
            .get(&hash)
            .map(|cached| self.index_entries(cached))
            .unwrap_or_default();
        for (index, entry) in self.index_entries(&incoming) {
            match merged.entry(index) {
                Entry::Occupied(mut slot) => slot.get_mut().extend(entry),
                Entry::Vacant(slot) => {
                    slot.insert(entry);
                }
            }
        }

        let value = collapse(merged);
        self.cache.insert(hash, value.clone());
        record.insert(self.field.clone(), value);
    }

    /// Merges every file record in a poll response and evicts cache entries
    /// for files the response no longer contains.
    pub fn merge_all(&mut self, files: &mut [Value], hash_key: &str) {
        let mut seen = HashSet::new();
        for file in files.iter_mut() {
            let Some(record) = file.as_object_mut() else {
                continue;
            };
            let Some(hash) = record.get(hash_key).and_then(Value::as_str).map(normalize_hash)
            else {
                continue;
            };
            self.merge(&hash, record);
            seen.insert(hash);
        }
        self.retain(&seen);
    }

    fn index_entries(&self, value: &Value) -> IndexedEntries {
        let mut entries = IndexedEntries::new();
        let items: Vec<&Value> = match value {
            Value::Array(items) => items.iter().collect(),
            Value::Object(_) => vec![value],
            _ => Vec::new(),
        };
        for item in items {
            let Some(entry) = item.as_object() else {
                continue;
            };
            match entry.get(&self.index_key).and_then(index_of) {
                Some(index) => {
                    entries.insert(index, entry.clone());
                }
                None => tracing::debug!(
                    "dropping {} entry without '{}' index",
                    self.field,
                    self.index_key
                ),
            }
        }
        entries
    }
}

fn index_of(value: &Value) -> Option<i64> {
    match value {
        Value::Number(number) => number.as_i64(),
        Value::String(raw) => raw.trim().parse().ok(),
        _ => None,
    }
}

/// One entry serializes as a bare object, anything else as an ascending list.
fn collapse(entries: IndexedEntries) -> Value {
    let mut values: Vec<Value> = entries.into_values().map(Value::Object).collect();
    if values.len() == 1 {
        return values.remove(0);
    }
    Value::Array(values)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const HASH: &str = "0123456789abcdef0123456789abcdef";

    fn record(value: Value) -> Map<String, Value> {
        value.as_object().expect("object").clone()
    }

    #[test]
    fn overlays_partial_update_on_cached_view() {
        let mut merger = SnapshotMerger::new("sources", "index");
        let mut first = record(json!({
            "sources": [{"index": 0, "name": "a"}, {"index": 1, "name": "b"}]
        }));
        merger.merge(HASH, &mut first);

        let mut second = record(json!({
            "sources": [{"index": 2, "name": "c"}, {"index": 1, "name": "b2"}]
        }));
        merger.merge(HASH, &mut second);

        assert_eq!(
            second["sources"],
            json!([
                {"index": 0, "name": "a"},
                {"index": 1, "name": "b2"},
                {"index": 2, "name": "c"}
            ])
        );
        assert_eq!(merger.cached(HASH), Some(&second["sources"]));
    }

    #[test]
    fn omitted_field_reuses_cached_value() {
        let mut merger = SnapshotMerger::new("sources", "index");
        let mut first = record(json!({"sources": [{"index": 0, "name": "a"}, {"index": 4, "name": "e"}]}));
        merger.merge(HASH, &mut first);

        let mut second = record(json!({"progress": 50}));
        merger.merge(&HASH.to_uppercase(), &mut second);
        assert_eq!(second["sources"], first["sources"]);
        assert_eq!(second["progress"], 50);

        let mut unknown = record(json!({"progress": 1}));
        merger.merge("ffffffffffffffffffffffffffffffff", &mut unknown);
        assert!(!unknown.contains_key("sources"));
    }

    #[test]
    fn existing_entries_merge_field_by_field() {
        let mut merger = SnapshotMerger::new("sources", "index");
        let mut first = record(json!({"sources": {"index": 0, "name": "a", "speed": 5}}));
        merger.merge(HASH, &mut first);
        assert_eq!(first["sources"], json!({"index": 0, "name": "a", "speed": 5}));

        let mut second = record(json!({"sources": {"index": "0", "speed": 7}}));
        merger.merge(HASH, &mut second);
        assert_eq!(second["sources"]["name"], "a");
        assert_eq!(second["sources"]["speed"], 7);
    }

    #[test]
    fn retain_matches_hashes_case_insensitively() {
        let mut merger = SnapshotMerger::new("sources", "index");
        let mut first = record(json!({"sources": {"index": 0, "name": "a"}}));
        merger.merge(HASH, &mut first);

        let live: HashSet<String> = [HASH.to_uppercase()].into_iter().collect();
        merger.retain(&live);
        assert!(merger.cached(HASH).is_some());

        merger.retain(&HashSet::new());
        assert!(merger.is_empty());
    }

    #[test]
    fn merge_all_evicts_files_that_disappeared() {
        let mut merger = SnapshotMerger::new("sources", "index");
        let other = "fedcba9876543210fedcba9876543210";
        let mut files = vec![
            json!({"hash": HASH, "sources": {"index": 0, "name": "a"}}),
            json!({"hash": other, "sources": {"index": 0, "name": "z"}}),
        ];
        merger.merge_all(&mut files, "hash");
        assert_eq!(merger.len(), 2);

        let mut files = vec![json!({"hash": HASH})];
        merger.merge_all(&mut files, "hash");
        assert_eq!(files[0]["sources"], json!({"index": 0, "name": "a"}));
        assert_eq!(merger.len(), 1);
        assert!(merger.cached(other).is_none());
    }
}
