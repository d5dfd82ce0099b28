//! The node tree procedures are written in.
//!
//! A procedure body is a list of statement nodes; expressions nest beneath
//! them. The enum is closed and serde-tagged by `kind`, so bodies travel
//! as plain JSON. Store access is written against [`Node::GlobalObject`]
//! roots; lowering rewrites those into the `*Stored*` forms before
//! emission, and the emitter never sees a bare global.

use serde::{Deserialize, Serialize};

use strata_kernel::Schema;

/// One procedure to compile: visibility, ordered parameter schemas, and a
/// statement body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcedureDef {
    /// Name the procedure is invoked by.
    pub name: String,
    /// Public procedures answer outside requests; private ones are only
    /// reachable through calls.
    pub public: bool,
    /// One schema per parameter, checked before the body runs.
    pub input: Vec<Schema>,
    /// Statements, run in order.
    pub body: Vec<Node>,
}

/// One expression or statement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum Node {
    // ===== Literals & expressions =====
    /// The nothing literal.
    None,
    /// A boolean literal.
    Bool {
        /// Literal value.
        value: bool,
    },
    /// An integer literal.
    Int {
        /// Literal value.
        value: i64,
    },
    /// A floating literal. Whole values normalize to integers.
    Double {
        /// Literal value.
        value: f64,
    },
    /// A string literal.
    String {
        /// Literal value.
        value: String,
    },
    /// A copy of heap slot `index`: a parameter or an earlier save.
    Saved {
        /// Heap slot to copy.
        index: usize,
    },
    /// An object literal.
    Object {
        /// Fields in insertion order.
        fields: Vec<Field>,
    },
    /// An array literal.
    ArrayLiteral {
        /// Elements in order.
        values: Vec<Node>,
    },
    /// Walk `level` down from `root` and yield what is found there.
    Selection {
        /// Value or store the walk starts from.
        root: Box<Node>,
        /// Path steps, outermost first.
        level: Vec<LevelItem>,
    },
    /// Whether an object (or store) carries a field.
    FieldExists {
        /// Object or store to look in.
        value: Box<Node>,
        /// Field name expression.
        field: Box<Node>,
    },
    /// A binary comparison.
    Comparison {
        /// Which comparison.
        sign: ComparisonSign,
        /// Left operand.
        left: Box<Node>,
        /// Right operand.
        right: Box<Node>,
    },
    /// Boolean conjunction or disjunction.
    BoolAlg {
        /// `and` or `or`.
        sign: BoolSign,
        /// Left operand.
        left: Box<Node>,
        /// Right operand.
        right: Box<Node>,
    },
    /// Binary arithmetic.
    Math {
        /// Which operation.
        sign: MathSign,
        /// Left operand.
        left: Box<Node>,
        /// Right operand.
        right: Box<Node>,
    },
    /// Run another procedure of this compilation and yield its result.
    Call {
        /// Callee, which may be private.
        function_name: String,
        /// Argument expressions.
        args: Vec<Node>,
    },
    /// A named store. Must sit under a selection, update, or field-exists;
    /// anywhere else is a compile error.
    GlobalObject {
        /// Store name.
        name: String,
    },

    // ===== Statements =====
    /// End the procedure with a value, or with nothing.
    Return {
        /// Result expression, when present.
        value: Option<Box<Node>>,
    },
    /// Evaluate a value into the next heap slot.
    Save {
        /// Expression to save.
        value: Box<Node>,
    },
    /// Write through a saved value or a store key path.
    Update {
        /// A `Saved` or `GlobalObject` node.
        root: Box<Node>,
        /// Path steps under the root, outermost first.
        level: Vec<LevelItem>,
        /// New value, a `Push`, or a `DeleteField`.
        operation: Box<Node>,
    },
    /// Append values to an array; only valid as an update operation.
    Push {
        /// Values appended in order.
        values: Vec<Node>,
    },
    /// Remove the addressed field; only valid as an update operation.
    DeleteField,
    /// A conditional chain.
    If {
        /// Segments in order: conditionals, optional else, optional
        /// terminal finally.
        conditionally: Vec<IfSegment>,
    },
    /// Run a body once per array element, newest heap slot holding the
    /// element.
    ArrayForEach {
        /// Array expression to iterate.
        target: Box<Node>,
        /// Loop body.
        #[serde(rename = "do")]
        body: Vec<Node>,
    },
    /// Block until the named mutex is granted.
    Lock {
        /// A `String` or `Saved` node naming the mutex.
        name: Box<Node>,
    },
    /// Release the named mutex.
    Release {
        /// A `String` or `Saved` node naming the mutex.
        name: Box<Node>,
    },

    // ===== Storage forms (lowering output) =====
    /// Read one key path out of a store.
    GetStoredKey {
        /// Store to read.
        store: String,
        /// Key path, first item selecting the document.
        key: Vec<LevelItem>,
    },
    /// Write one key path of a store.
    SetStoredKey {
        /// Store to write.
        store: String,
        /// Key path, first item selecting the document.
        key: Vec<LevelItem>,
        /// Value expression.
        value: Box<Node>,
    },
    /// Remove a key or a nested field of a store.
    DeleteStoredKey {
        /// Store to write.
        store: String,
        /// Key path, first item selecting the document.
        key: Vec<LevelItem>,
    },
    /// Whether a store carries a key.
    StoredKeyExists {
        /// Store to read.
        store: String,
        /// Key expression.
        key: Box<Node>,
    },
    /// The array of a store's keys.
    StoredKeys {
        /// Store to read.
        store: String,
    },
    /// The whole store as one object.
    GetWholeStore {
        /// Store to read.
        store: String,
    },
    /// Append values to an array held under a store key path.
    PushToStoredKey {
        /// Store to write.
        store: String,
        /// Key path, first item selecting the document.
        key: Vec<LevelItem>,
        /// Values appended in order.
        values: Vec<Node>,
    },
}

impl Node {
    /// Kind name as it appears in serialized form, for diagnostics.
    pub fn kind(&self) -> &'static str {
        match self {
            Node::None => "None",
            Node::Bool { .. } => "Bool",
            Node::Int { .. } => "Int",
            Node::Double { .. } => "Double",
            Node::String { .. } => "String",
            Node::Saved { .. } => "Saved",
            Node::Object { .. } => "Object",
            Node::ArrayLiteral { .. } => "ArrayLiteral",
            Node::Selection { .. } => "Selection",
            Node::FieldExists { .. } => "FieldExists",
            Node::Comparison { .. } => "Comparison",
            Node::BoolAlg { .. } => "BoolAlg",
            Node::Math { .. } => "Math",
            Node::Call { .. } => "Call",
            Node::GlobalObject { .. } => "GlobalObject",
            Node::Return { .. } => "Return",
            Node::Save { .. } => "Save",
            Node::Update { .. } => "Update",
            Node::Push { .. } => "Push",
            Node::DeleteField => "DeleteField",
            Node::If { .. } => "If",
            Node::ArrayForEach { .. } => "ArrayForEach",
            Node::Lock { .. } => "Lock",
            Node::Release { .. } => "Release",
            Node::GetStoredKey { .. } => "GetStoredKey",
            Node::SetStoredKey { .. } => "SetStoredKey",
            Node::DeleteStoredKey { .. } => "DeleteStoredKey",
            Node::StoredKeyExists { .. } => "StoredKeyExists",
            Node::StoredKeys { .. } => "StoredKeys",
            Node::GetWholeStore { .. } => "GetWholeStore",
            Node::PushToStoredKey { .. } => "PushToStoredKey",
        }
    }
}

/// One field of an object literal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Field {
    /// A `String` or `Saved` node.
    pub key: Node,
    /// Field value expression.
    pub value: Node,
}

/// One step of a selection or update path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum LevelItem {
    /// An object key.
    String {
        /// Key text.
        value: String,
    },
    /// An array position, or a numeric store key.
    Int {
        /// Position or key.
        value: i64,
    },
    /// A key or position taken from heap slot `index`.
    Saved {
        /// Heap slot to read.
        index: usize,
    },
    /// Replace the value walked to so far with the array of its keys.
    Keys,
}

/// One segment of an [`Node::If`] chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum IfSegment {
    /// Runs its body when the condition holds and no earlier segment ran.
    Conditional {
        /// Boolean expression.
        cond: Node,
        /// Branch body.
        #[serde(rename = "do")]
        body: Vec<Node>,
    },
    /// Runs when no conditional matched.
    Else {
        /// Branch body.
        #[serde(rename = "do")]
        body: Vec<Node>,
    },
    /// Join point: runs after whichever branch ran, and when none did.
    Finally {
        /// Join body.
        #[serde(rename = "do")]
        body: Vec<Node>,
    },
}

/// Comparison operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ComparisonSign {
    /// Structural equality.
    #[serde(rename = "==")]
    Equal,
    /// Structural inequality.
    #[serde(rename = "!=")]
    NotEqual,
    /// Numeric less-than.
    #[serde(rename = "<")]
    Less,
    /// Numeric greater-than.
    #[serde(rename = ">")]
    Greater,
    /// Numeric less-or-equal.
    #[serde(rename = "<=")]
    LessEq,
    /// Numeric greater-or-equal.
    #[serde(rename = ">=")]
    GreaterEq,
}

/// Boolean operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BoolSign {
    /// Both sides hold.
    #[serde(rename = "and")]
    And,
    /// Either side holds.
    #[serde(rename = "or")]
    Or,
}

/// Arithmetic operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MathSign {
    /// Addition, or string concatenation when either side is a string.
    #[serde(rename = "+")]
    Plus,
    /// Subtraction.
    #[serde(rename = "-")]
    Minus,
    /// Multiplication.
    #[serde(rename = "*")]
    Multiply,
    /// Division.
    #[serde(rename = "/")]
    Divide,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn node(j: serde_json::Value) -> Node {
        serde_json::from_value(j).unwrap()
    }

    #[test]
    fn test_node_kinds_parse_from_wire_json() {
        let parsed = node(json!({
            "kind": "Update",
            "root": {"kind": "Saved", "index": 0},
            "level": [{"kind": "String", "value": "nested"}, {"kind": "Int", "value": 2}],
            "operation": {"kind": "Push", "values": [{"kind": "Bool", "value": true}]}
        }));
        match parsed {
            Node::Update {
                root,
                level,
                operation,
            } => {
                assert_eq!(*root, Node::Saved { index: 0 });
                assert_eq!(level.len(), 2);
                assert_eq!(
                    level[1],
                    LevelItem::Int { value: 2 }
                );
                assert!(matches!(*operation, Node::Push { .. }));
            }
            other => panic!("parsed {:?}", other),
        }
    }

    #[test]
    fn test_return_without_value_parses() {
        assert_eq!(node(json!({"kind": "Return"})), Node::Return { value: None });
    }

    #[test]
    fn test_signs_use_operator_text() {
        let cmp = node(json!({
            "kind": "Comparison",
            "sign": "!=",
            "left": {"kind": "Int", "value": 1},
            "right": {"kind": "None"}
        }));
        assert!(matches!(
            cmp,
            Node::Comparison {
                sign: ComparisonSign::NotEqual,
                ..
            }
        ));
        let math = node(json!({
            "kind": "Math",
            "sign": "/",
            "left": {"kind": "Int", "value": 1},
            "right": {"kind": "Int", "value": 2}
        }));
        assert!(matches!(
            math,
            Node::Math {
                sign: MathSign::Divide,
                ..
            }
        ));
    }

    #[test]
    fn test_if_segments_carry_do_bodies() {
        let parsed: Vec<IfSegment> = serde_json::from_value(json!([
            {"kind": "Conditional", "cond": {"kind": "Bool", "value": true}, "do": [{"kind": "Return"}]},
            {"kind": "Else", "do": []},
            {"kind": "Finally", "do": []}
        ]))
        .unwrap();
        assert!(matches!(parsed[0], IfSegment::Conditional { .. }));
        assert!(matches!(parsed[1], IfSegment::Else { .. }));
        assert!(matches!(parsed[2], IfSegment::Finally { .. }));
    }

    #[test]
    fn test_kind_names_match_serialized_tag() {
        let n = Node::StoredKeys {
            store: "g".to_string(),
        };
        let json = serde_json::to_value(&n).unwrap();
        assert_eq!(json["kind"], n.kind());
    }
}
