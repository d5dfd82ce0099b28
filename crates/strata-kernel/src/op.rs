//! The kernel instruction set.
//!
//! Fifty-nine instruction kinds. An [`Op`] is an immutable tagged instance
//! (kind plus decoded parameter), produced by the compiler and interpreted
//! by the VM; handlers live in [`crate::vm::exec`]. Binary ops pop the right
//! operand first: operands are pushed left then right.

use serde::{Deserialize, Serialize};

use crate::schema::Schema;
use crate::value::Value;

/// One VM instruction.
///
/// Serialized with an adjacent `kind`/`data` tagging so op sequences are
/// readable in manifests.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "camelCase")]
pub enum Op {
    // ===== Stack & Heap =====
    /// Do nothing
    Noop,
    /// Push a literal value
    Instantiate(Value),
    /// Pop and discard the top of the stack
    PopStack,
    /// Peek the top of the stack, push false if it is None, else true
    ToBool,
    /// Peek the top of the stack, push whether it is None
    IsLastNone,
    /// Push a clone of heap slot `index`
    CopyFromHeap(usize),
    /// Pop the stack top into a fresh heap slot
    MoveStackTopToHeap,
    /// Pop the stack top over an existing heap slot
    OverwriteHeap(usize),
    /// Drop the newest `n` heap slots
    TruncateHeap(usize),
    /// Pop the stack top and push it onto the array in heap slot `index`
    MoveStackToHeapArray(usize),
    /// Fault unless the heap holds exactly `n` slots
    AssertHeapLen(usize),
    /// Pop an array and push its elements (first element ends up on top)
    FlattenArray,
    /// Peek an array and pop one element off its end; None when empty
    PopArray,

    // ===== Structural =====
    /// Pop a value, push it onto the array beneath it
    ArrayPush,
    /// Peek an array, push its length without consuming it
    ArrayLen,
    /// Pop `n_strings` values, join them oldest-first with `joiner`;
    /// numeric parts render as decimal text
    #[serde(rename_all = "camelCase")]
    StringConcat {
        /// How many values to pop
        n_strings: usize,
        /// Text placed between parts
        joiner: String,
    },
    /// Pop an object, push the value found at each field path in turn
    ExtractFields(Vec<Vec<String>>),
    /// Pop `field_depth` path segments then a target; walk and push the
    /// field (None for a missing final key, fault for a missing
    /// intermediate)
    #[serde(rename_all = "camelCase")]
    GetField {
        /// Path segments popped off the stack
        field_depth: usize,
    },
    /// Pop a value, `field_depth` path segments, and a target; set the
    /// field and push the target back
    #[serde(rename_all = "camelCase")]
    SetField {
        /// Path segments popped off the stack
        field_depth: usize,
    },
    /// Pop `field_depth` path segments then a target; remove the final
    /// segment and push the target back
    #[serde(rename_all = "camelCase")]
    DeleteField {
        /// Path segments popped off the stack
        field_depth: usize,
    },
    /// Pop `field_depth` path segments, walk heap slot `index`, push a
    /// clone of the field
    #[serde(rename_all = "camelCase")]
    PushSavedField {
        /// Heap slot holding the walked value
        index: usize,
        /// Path segments popped off the stack
        field_depth: usize,
    },
    /// Pop a value and `field_depth` path segments, set the field in heap
    /// slot `index` in place
    #[serde(rename_all = "camelCase")]
    SetSavedField {
        /// Heap slot written in place
        index: usize,
        /// Path segments popped off the stack
        field_depth: usize,
    },
    /// Pop `field_depth` path segments, delete the field in heap slot
    /// `index` in place
    #[serde(rename_all = "camelCase")]
    DeleteSavedField {
        /// Heap slot written in place
        index: usize,
        /// Path segments popped off the stack
        field_depth: usize,
    },
    /// Pop an object, push its named field or None (object stays popped)
    TryGetField(String),
    /// Pop a field name then an object, push whether the field exists
    FieldExists,
    /// Pop a value then an object, insert it under the given key, push the
    /// object back
    AssignPreviousToField(String),
    /// Pop an object, push the array of its keys (ascending)
    ObjectKeys,

    // ===== Control Flow =====
    /// Jump relative to the following op; 0 is a no-op, negatives go back
    OffsetOpCursor(i64),
    /// Pop a bool; when true, skip the next `n` ops
    ConditionallySkip(u64),
    /// Pop a bool, push its negation
    NegatePrev,

    // ===== Arithmetic, Comparison, Boolean =====
    /// Pop b, pop a, push a + b; numeric addition, or string concatenation
    /// when either side is a string (numbers render as decimal text)
    Plus,
    /// Pop b, pop a, push a - b
    NMinus,
    /// Pop b, pop a, push a * b
    NMult,
    /// Pop b, pop a, push a / b (Int/Int stays Int; zero divisor faults)
    NDivide,
    /// Pop b, pop a, push a < b (false for any non-numeric pairing)
    Less,
    /// Pop b, pop a, push a <= b (false for any non-numeric pairing)
    LessEq,
    /// Pop b, pop a, push structural equality (same tag only)
    Equal,
    /// Pop b, pop a, push a && b
    BoolAnd,
    /// Pop b, pop a, push a || b
    BoolOr,

    // ===== Storage =====
    /// Append the value in heap slot `index` to a store
    InsertFromHeap {
        /// Heap slot holding the document
        index: usize,
        /// Destination store
        store: String,
    },
    /// Pop a value, append it to a store (arrays append per element)
    InsertFromStack {
        /// Destination store
        store: String,
    },
    /// Push every document in a store as an array
    GetAllFromStore {
        /// Store to read
        store: String,
    },
    /// Pop a filter, push all matching documents under `projection`
    QueryStore {
        /// Store to read
        store: String,
        /// Suppression projection applied to each match
        projection: Value,
    },
    /// Pop a filter, push the first matching document or None
    FindOneInStore {
        /// Store to read
        store: String,
        /// Suppression projection applied to the match
        projection: Value,
    },
    /// Pop a filter, delete the first match, push whether one was deleted
    DeleteOneInStore {
        /// Store to delete from
        store: String,
    },
    /// Pop a filter then an update document, apply it to the first match,
    /// push the updated document or None
    UpdateOne {
        /// Store to write
        store: String,
        /// Insert a synthesized document when nothing matches
        upsert: bool,
    },
    /// Pop a filter then a replacement, swap the first match for it, push
    /// whether a document was written
    ReplaceOne {
        /// Store to write
        store: String,
        /// Insert the replacement when nothing matches
        upsert: bool,
    },
    /// Pop a filter, push the number of matching documents
    StoreLen {
        /// Store to count
        store: String,
    },

    // ===== Control & Identity =====
    /// Pop `args` values into a fresh child frame and run the named
    /// procedure to completion; its return value lands on this stack
    Invoke {
        /// Procedure to run
        name: String,
        /// Stack values passed as the child heap
        args: usize,
    },
    /// Return the value in heap slot `index`
    ReturnVariable(usize),
    /// Pop the stack top and return it
    ReturnStackTop,
    /// Return None
    ReturnVoid,
    /// Abort the whole request with a message
    RaiseError(String),

    // ===== Resources =====
    /// Pop a lock name and block until the lock manager grants it
    Lock,
    /// Pop a lock name and release it (best-effort)
    Release,
    /// Pop a claim object, sign it, push it back with `_sig` attached
    SignRole,
    /// Pop a value, push its type name
    GetType,

    // ===== Schema Checks =====
    /// Push whether heap slot `heap_pos` adheres to the named schema
    #[serde(rename_all = "camelCase")]
    EnforceSchemaOnHeap {
        /// Heap slot checked
        heap_pos: usize,
        /// Registry schema name
        name: String,
    },
    /// Push whether heap slot `heap_pos` adheres to an inline schema
    #[serde(rename_all = "camelCase")]
    EnforceSchemaInstanceOnHeap {
        /// Heap slot checked
        heap_pos: usize,
        /// Schema checked against
        schema: Schema,
    },
}

impl Op {
    /// Kind name as it appears in serialized form, for diagnostics.
    pub fn kind(&self) -> &'static str {
        match self {
            Op::Noop => "noop",
            Op::Instantiate(_) => "instantiate",
            Op::PopStack => "popStack",
            Op::ToBool => "toBool",
            Op::IsLastNone => "isLastNone",
            Op::CopyFromHeap(_) => "copyFromHeap",
            Op::MoveStackTopToHeap => "moveStackTopToHeap",
            Op::OverwriteHeap(_) => "overwriteHeap",
            Op::TruncateHeap(_) => "truncateHeap",
            Op::MoveStackToHeapArray(_) => "moveStackToHeapArray",
            Op::AssertHeapLen(_) => "assertHeapLen",
            Op::FlattenArray => "flattenArray",
            Op::PopArray => "popArray",
            Op::ArrayPush => "arrayPush",
            Op::ArrayLen => "arrayLen",
            Op::StringConcat { .. } => "stringConcat",
            Op::ExtractFields(_) => "extractFields",
            Op::GetField { .. } => "getField",
            Op::SetField { .. } => "setField",
            Op::DeleteField { .. } => "deleteField",
            Op::PushSavedField { .. } => "pushSavedField",
            Op::SetSavedField { .. } => "setSavedField",
            Op::DeleteSavedField { .. } => "deleteSavedField",
            Op::TryGetField(_) => "tryGetField",
            Op::FieldExists => "fieldExists",
            Op::AssignPreviousToField(_) => "assignPreviousToField",
            Op::ObjectKeys => "objectKeys",
            Op::OffsetOpCursor(_) => "offsetOpCursor",
            Op::ConditionallySkip(_) => "conditionallySkip",
            Op::NegatePrev => "negatePrev",
            Op::Plus => "plus",
            Op::NMinus => "nMinus",
            Op::NMult => "nMult",
            Op::NDivide => "nDivide",
            Op::Less => "less",
            Op::LessEq => "lessEq",
            Op::Equal => "equal",
            Op::BoolAnd => "boolAnd",
            Op::BoolOr => "boolOr",
            Op::InsertFromHeap { .. } => "insertFromHeap",
            Op::InsertFromStack { .. } => "insertFromStack",
            Op::GetAllFromStore { .. } => "getAllFromStore",
            Op::QueryStore { .. } => "queryStore",
            Op::FindOneInStore { .. } => "findOneInStore",
            Op::DeleteOneInStore { .. } => "deleteOneInStore",
            Op::UpdateOne { .. } => "updateOne",
            Op::ReplaceOne { .. } => "replaceOne",
            Op::StoreLen { .. } => "storeLen",
            Op::Invoke { .. } => "invoke",
            Op::ReturnVariable(_) => "returnVariable",
            Op::ReturnStackTop => "returnStackTop",
            Op::ReturnVoid => "returnVoid",
            Op::RaiseError(_) => "raiseError",
            Op::Lock => "lock",
            Op::Release => "release",
            Op::SignRole => "signRole",
            Op::GetType => "getType",
            Op::EnforceSchemaOnHeap { .. } => "enforceSchemaOnHeap",
            Op::EnforceSchemaInstanceOnHeap { .. } => "enforceSchemaInstanceOnHeap",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_op_json_round_trip() {
        let ops = vec![
            Op::Instantiate(Value::Int(42)),
            Op::GetField { field_depth: 2 },
            Op::ConditionallySkip(3),
            Op::OffsetOpCursor(-4),
            Op::UpdateOne {
                store: "users".to_string(),
                upsert: true,
            },
            Op::EnforceSchemaInstanceOnHeap {
                heap_pos: 0,
                schema: Schema::Int,
            },
        ];
        let text = serde_json::to_string(&ops).unwrap();
        let back: Vec<Op> = serde_json::from_str(&text).unwrap();
        assert_eq!(ops, back);
    }

    #[test]
    fn test_kind_matches_serialized_tag() {
        let op = Op::PushSavedField {
            index: 1,
            field_depth: 2,
        };
        let json = serde_json::to_value(&op).unwrap();
        assert_eq!(json["kind"], op.kind());
        assert_eq!(json["data"]["fieldDepth"], 2);
    }
}
