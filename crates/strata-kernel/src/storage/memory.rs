//! In-process storage engine.
//!
//! Backs every kernel test and works as a real engine for single-process
//! deployments. Tables live behind one `RwLock`; each contract call holds
//! the lock for its whole duration, which is exactly the atomic
//! single-document guarantee the VM assumes.

use parking_lot::RwLock;
use rustc_hash::FxHashMap;

use super::{apply_update, matches, project, synthesize_from_filter, StorageEngine};
use crate::error::StorageError;
use crate::value::Value;

/// Map-backed [`StorageEngine`]. Stores spring into existence on first
/// write; reading an absent store behaves as reading an empty one.
pub struct MemoryStore {
    tables: RwLock<FxHashMap<String, Vec<Value>>>,
}

impl MemoryStore {
    /// Create an engine with no stores.
    pub fn new() -> Self {
        MemoryStore {
            tables: RwLock::new(FxHashMap::default()),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl StorageEngine for MemoryStore {
    fn append(&self, store: &str, value: Value) -> Result<(), StorageError> {
        let mut tables = self.tables.write();
        let table = tables.entry(store.to_string()).or_default();
        match value {
            Value::Array(items) => table.extend(items),
            other => table.push(other),
        }
        Ok(())
    }

    fn query(
        &self,
        store: &str,
        filter: &Value,
        projection: &Value,
    ) -> Result<Vec<Value>, StorageError> {
        let tables = self.tables.read();
        let mut out = Vec::new();
        for doc in tables.get(store).into_iter().flatten() {
            if matches(doc, filter)? {
                out.push(project(doc, projection));
            }
        }
        Ok(out)
    }

    fn find_one(
        &self,
        store: &str,
        filter: &Value,
        projection: &Value,
    ) -> Result<Option<Value>, StorageError> {
        let tables = self.tables.read();
        for doc in tables.get(store).into_iter().flatten() {
            if matches(doc, filter)? {
                return Ok(Some(project(doc, projection)));
            }
        }
        Ok(None)
    }

    fn delete_one(&self, store: &str, filter: &Value) -> Result<bool, StorageError> {
        let mut tables = self.tables.write();
        let table = match tables.get_mut(store) {
            Some(t) => t,
            None => return Ok(false),
        };
        for (i, doc) in table.iter().enumerate() {
            if matches(doc, filter)? {
                table.remove(i);
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn update_one(
        &self,
        store: &str,
        filter: &Value,
        update: &Value,
        upsert: bool,
    ) -> Result<Option<Value>, StorageError> {
        let mut tables = self.tables.write();
        let table = tables.entry(store.to_string()).or_default();
        for doc in table.iter_mut() {
            if matches(doc, filter)? {
                apply_update(doc, update)?;
                return Ok(Some(doc.clone()));
            }
        }
        if upsert {
            let mut doc = synthesize_from_filter(filter);
            apply_update(&mut doc, update)?;
            table.push(doc.clone());
            return Ok(Some(doc));
        }
        Ok(None)
    }

    fn replace_one(
        &self,
        store: &str,
        filter: &Value,
        replacement: &Value,
        upsert: bool,
    ) -> Result<bool, StorageError> {
        let mut tables = self.tables.write();
        let table = tables.entry(store.to_string()).or_default();
        for doc in table.iter_mut() {
            if matches(doc, filter)? {
                *doc = replacement.clone();
                return Ok(true);
            }
        }
        if upsert {
            table.push(replacement.clone());
            return Ok(true);
        }
        Ok(false)
    }

    fn measure(&self, store: &str, filter: &Value) -> Result<i64, StorageError> {
        let tables = self.tables.read();
        let mut count = 0;
        for doc in tables.get(store).into_iter().flatten() {
            if matches(doc, filter)? {
                count += 1;
            }
        }
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn v(j: serde_json::Value) -> Value {
        serde_json::from_value(j).unwrap()
    }

    #[test]
    fn test_append_and_query_everything() {
        let store = MemoryStore::new();
        store.append("docs", v(json!({"a": 1}))).unwrap();
        store.append("docs", v(json!({"a": 2}))).unwrap();
        let all = store.query("docs", &v(json!({})), &v(json!({}))).unwrap();
        assert_eq!(all, vec![v(json!({"a": 1})), v(json!({"a": 2}))]);
    }

    #[test]
    fn test_append_array_fans_out() {
        let store = MemoryStore::new();
        store
            .append("docs", v(json!([{"a": 1}, {"a": 2}, {"a": 3}])))
            .unwrap();
        assert_eq!(store.measure("docs", &v(json!({}))).unwrap(), 3);
    }

    #[test]
    fn test_absent_store_reads_empty() {
        let store = MemoryStore::new();
        assert_eq!(store.query("nope", &v(json!({})), &v(json!({}))).unwrap(), vec![]);
        assert_eq!(store.find_one("nope", &v(json!({})), &v(json!({}))).unwrap(), None);
        assert!(!store.delete_one("nope", &v(json!({}))).unwrap());
        assert_eq!(store.measure("nope", &v(json!({}))).unwrap(), 0);
    }

    #[test]
    fn test_find_one_with_projection() {
        let store = MemoryStore::new();
        store
            .append("g", v(json!({"_key": "k1", "_val": 7})))
            .unwrap();
        let found = store
            .find_one("g", &v(json!({"_key": "k1"})), &v(json!({"_val": false})))
            .unwrap();
        assert_eq!(found, Some(v(json!({"_key": "k1"}))));
    }

    #[test]
    fn test_delete_one_removes_first_match_only() {
        let store = MemoryStore::new();
        store.append("docs", v(json!({"k": 1, "tag": "a"}))).unwrap();
        store.append("docs", v(json!({"k": 1, "tag": "b"}))).unwrap();
        assert!(store.delete_one("docs", &v(json!({"k": 1}))).unwrap());
        let rest = store.query("docs", &v(json!({})), &v(json!({}))).unwrap();
        assert_eq!(rest, vec![v(json!({"k": 1, "tag": "b"}))]);
    }

    #[test]
    fn test_update_one_set_and_unset() {
        let store = MemoryStore::new();
        store
            .append("g", v(json!({"_key": "k", "_val": {"a": 1}})))
            .unwrap();
        let updated = store
            .update_one(
                "g",
                &v(json!({"_key": "k"})),
                &v(json!({"$set": {"_val.b": 2}})),
                false,
            )
            .unwrap();
        assert_eq!(updated, Some(v(json!({"_key": "k", "_val": {"a": 1, "b": 2}}))));
        store
            .update_one(
                "g",
                &v(json!({"_key": "k"})),
                &v(json!({"$unset": {"_val.a": ""}})),
                false,
            )
            .unwrap();
        let found = store
            .find_one("g", &v(json!({"_key": "k"})), &v(json!({})))
            .unwrap();
        assert_eq!(found, Some(v(json!({"_key": "k", "_val": {"b": 2}}))));
    }

    #[test]
    fn test_update_one_without_match() {
        let store = MemoryStore::new();
        let missed = store
            .update_one(
                "g",
                &v(json!({"_key": "k"})),
                &v(json!({"$set": {"_val.x": 1}})),
                false,
            )
            .unwrap();
        assert_eq!(missed, None);
    }

    #[test]
    fn test_update_one_upsert_synthesizes() {
        let store = MemoryStore::new();
        let created = store
            .update_one(
                "g",
                &v(json!({"_key": "k"})),
                &v(json!({"$set": {"_val": 42}})),
                true,
            )
            .unwrap();
        assert_eq!(created, Some(v(json!({"_key": "k", "_val": 42}))));
        assert_eq!(store.measure("g", &v(json!({}))).unwrap(), 1);
    }

    #[test]
    fn test_replace_one() {
        let store = MemoryStore::new();
        store.append("docs", v(json!({"k": 1, "old": true}))).unwrap();
        assert!(store
            .replace_one(
                "docs",
                &v(json!({"k": 1})),
                &v(json!({"k": 1, "fresh": true})),
                false
            )
            .unwrap());
        assert!(!store
            .replace_one("docs", &v(json!({"k": 2})), &v(json!({"k": 2})), false)
            .unwrap());
        assert!(store
            .replace_one("docs", &v(json!({"k": 2})), &v(json!({"k": 2})), true)
            .unwrap());
        assert_eq!(store.measure("docs", &v(json!({}))).unwrap(), 2);
    }

    #[test]
    fn test_measure_with_operator_filter() {
        let store = MemoryStore::new();
        for n in 0..5 {
            store.append("ns", v(json!({"n": n}))).unwrap();
        }
        assert_eq!(store.measure("ns", &v(json!({"n": {"$lte": 2}}))).unwrap(), 3);
    }
}
