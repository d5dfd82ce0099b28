//! Storage contract and document semantics.
//!
//! The VM talks to persistence through [`StorageEngine`], a narrow
//! synchronous contract: append, filtered reads with suppression
//! projections, single-document deletes, and operator-based updates. Each
//! call is atomic on one document, which is the only transactional
//! guarantee the kernel builds on. The filter, projection, and update-doc
//! semantics live here so every engine agrees on them;
//! [`memory::MemoryStore`] is the bundled in-process engine.
//!
//! Update documents use dot-joined paths: `{"$set": {"_val.a.b": 1}}` sets
//! a nested field, creating intermediate objects; numeric segments index
//! arrays.

pub mod memory;

pub use memory::MemoryStore;

use crate::error::StorageError;
use crate::value::Value;

/// Persistence backend contract.
///
/// Implementations must be shareable across concurrently executing
/// requests; every method is one atomic step.
pub trait StorageEngine: Send + Sync {
    /// Insert a document. An array inserts each element as its own
    /// document.
    fn append(&self, store: &str, value: Value) -> Result<(), StorageError>;

    /// All documents matching `filter`, each narrowed by `projection`.
    fn query(
        &self,
        store: &str,
        filter: &Value,
        projection: &Value,
    ) -> Result<Vec<Value>, StorageError>;

    /// First document matching `filter`, narrowed by `projection`.
    fn find_one(
        &self,
        store: &str,
        filter: &Value,
        projection: &Value,
    ) -> Result<Option<Value>, StorageError>;

    /// Remove the first match. `true` when a document was removed.
    fn delete_one(&self, store: &str, filter: &Value) -> Result<bool, StorageError>;

    /// Apply an update document to the first match and return the updated
    /// document. With `upsert`, a missing match synthesizes a document
    /// from the filter's equality fields first.
    fn update_one(
        &self,
        store: &str,
        filter: &Value,
        update: &Value,
        upsert: bool,
    ) -> Result<Option<Value>, StorageError>;

    /// Swap the first match for `replacement`. `true` when a document was
    /// written (replaced, or inserted under `upsert`).
    fn replace_one(
        &self,
        store: &str,
        filter: &Value,
        replacement: &Value,
        upsert: bool,
    ) -> Result<bool, StorageError>;

    /// Number of documents matching `filter`.
    fn measure(&self, store: &str, filter: &Value) -> Result<i64, StorageError>;
}

// ===== Filters =====

/// Check a document against a filter.
///
/// A filter is an object of field conditions. A condition whose value is an
/// object of `$`-prefixed keys applies comparison operators
/// (`$lt`/`$lte`/`$gt`/`$gte`/`$ne`); anything else must match
/// structurally. Field names may be dot-joined paths. The empty filter
/// matches every document.
pub fn matches(doc: &Value, filter: &Value) -> Result<bool, StorageError> {
    let conds = filter
        .as_object()
        .ok_or(StorageError::InvalidFilter(filter.type_name()))?;
    for (field, cond) in conds {
        let actual = walk_path(doc, field);
        if !condition_holds(actual, cond) {
            return Ok(false);
        }
    }
    Ok(true)
}

fn condition_holds(actual: Option<&Value>, cond: &Value) -> bool {
    if let Some(ops) = operator_object(cond) {
        return ops.iter().all(|(op, arg)| {
            let found = actual.unwrap_or(&Value::None);
            match op.as_str() {
                "$ne" => found != arg,
                "$lt" | "$lte" | "$gt" | "$gte" => {
                    match (found.as_numeric(), arg.as_numeric()) {
                        (Some(a), Some(b)) => {
                            let (a, b) = (a.widen(), b.widen());
                            match op.as_str() {
                                "$lt" => a < b,
                                "$lte" => a <= b,
                                "$gt" => a > b,
                                _ => a >= b,
                            }
                        }
                        _ => false,
                    }
                }
                _ => false,
            }
        });
    }
    actual == Some(cond)
}

fn operator_object(cond: &Value) -> Option<&crate::value::ValueMap> {
    let map = cond.as_object()?;
    if !map.is_empty() && map.keys().all(|k| k.starts_with('$')) {
        Some(map)
    } else {
        None
    }
}

// ===== Projections =====

/// Narrow a document by a suppression projection: every field mapped to
/// `false` is removed from the result. The empty projection keeps the
/// whole document.
pub fn project(doc: &Value, projection: &Value) -> Value {
    let suppressed = match projection.as_object() {
        Some(p) if !p.is_empty() => p,
        _ => return doc.clone(),
    };
    match doc.as_object() {
        Some(fields) => Value::Object(
            fields
                .iter()
                .filter(|(k, _)| suppressed.get(*k) != Some(&Value::Bool(false)))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        ),
        None => doc.clone(),
    }
}

// ===== Update documents =====

/// Apply an update document (`$set`/`$unset`/`$push` over dotted paths)
/// to a document in place.
pub fn apply_update(doc: &mut Value, update: &Value) -> Result<(), StorageError> {
    let operators = update
        .as_object()
        .ok_or_else(|| StorageError::InvalidUpdate(update.type_name().to_string()))?;
    for (operator, paths) in operators {
        let paths = paths
            .as_object()
            .ok_or_else(|| StorageError::InvalidUpdate(operator.clone()))?;
        for (path, arg) in paths {
            match operator.as_str() {
                "$set" => apply_set(doc, path, arg.clone())?,
                "$unset" => apply_unset(doc, path),
                "$push" => apply_push(doc, path, arg.clone())?,
                other => return Err(StorageError::InvalidUpdate(other.to_string())),
            }
        }
    }
    Ok(())
}

/// The document an upsert inserts when nothing matched: the filter's
/// equality fields, with operator conditions dropped.
pub fn synthesize_from_filter(filter: &Value) -> Value {
    match filter.as_object() {
        Some(conds) => Value::Object(
            conds
                .iter()
                .filter(|(_, cond)| operator_object(cond).is_none())
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        ),
        None => Value::Object(Default::default()),
    }
}

/// Read a dot-joined path out of a document.
fn walk_path<'a>(doc: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = doc;
    for segment in path.split('.') {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

fn apply_set(doc: &mut Value, path: &str, arg: Value) -> Result<(), StorageError> {
    let segments: Vec<&str> = path.split('.').collect();
    let (last, parents) = match segments.split_last() {
        Some(parts) => parts,
        None => return Err(StorageError::PathThroughNonContainer(path.to_string())),
    };
    let target = descend_creating(doc, parents, path)?;
    match target {
        Value::Object(map) => {
            map.insert((*last).to_string(), arg);
            Ok(())
        }
        Value::Array(items) => {
            let index = last
                .parse::<usize>()
                .map_err(|_| StorageError::PathThroughNonContainer(path.to_string()))?;
            if index >= items.len() {
                items.resize(index + 1, Value::None);
            }
            items[index] = arg;
            Ok(())
        }
        _ => Err(StorageError::PathThroughNonContainer(path.to_string())),
    }
}

fn apply_unset(doc: &mut Value, path: &str) {
    let segments: Vec<&str> = path.split('.').collect();
    let (last, parents) = match segments.split_last() {
        Some(parts) => parts,
        None => return,
    };
    let mut current = doc;
    for segment in parents {
        current = match current {
            Value::Object(map) => match map.get_mut(*segment) {
                Some(v) => v,
                None => return,
            },
            Value::Array(items) => match segment.parse::<usize>().ok().and_then(|i| items.get_mut(i)) {
                Some(v) => v,
                None => return,
            },
            _ => return,
        };
    }
    match current {
        Value::Object(map) => {
            map.remove(*last);
        }
        Value::Array(items) => {
            // Unset inside an array blanks the slot without shifting.
            if let Some(slot) = last.parse::<usize>().ok().and_then(|i| items.get_mut(i)) {
                *slot = Value::None;
            }
        }
        _ => {}
    }
}

fn apply_push(doc: &mut Value, path: &str, arg: Value) -> Result<(), StorageError> {
    let segments: Vec<&str> = path.split('.').collect();
    let (last, parents) = match segments.split_last() {
        Some(parts) => parts,
        None => return Err(StorageError::PathThroughNonContainer(path.to_string())),
    };
    let target = descend_creating(doc, parents, path)?;
    match target {
        Value::Object(map) => match map
            .entry((*last).to_string())
            .or_insert_with(|| Value::Array(Vec::new()))
        {
            Value::Array(items) => {
                items.push(arg);
                Ok(())
            }
            _ => Err(StorageError::PathThroughNonContainer(path.to_string())),
        },
        _ => Err(StorageError::PathThroughNonContainer(path.to_string())),
    }
}

/// Walk to the parent of a path's final segment, creating missing
/// intermediate objects. Arrays never auto-create: a numeric segment must
/// land on an existing element.
fn descend_creating<'a>(
    doc: &'a mut Value,
    parents: &[&str],
    path: &str,
) -> Result<&'a mut Value, StorageError> {
    let mut current = doc;
    for segment in parents {
        current = match current {
            Value::Object(map) => map
                .entry((*segment).to_string())
                .or_insert_with(|| Value::Object(Default::default())),
            Value::Array(items) => {
                let index = segment
                    .parse::<usize>()
                    .map_err(|_| StorageError::PathThroughNonContainer(path.to_string()))?;
                items
                    .get_mut(index)
                    .ok_or_else(|| StorageError::PathThroughNonContainer(path.to_string()))?
            }
            _ => return Err(StorageError::PathThroughNonContainer(path.to_string())),
        };
    }
    Ok(current)
}
