//! Compiled procedures end to end: node trees in, VM results out.
//!
//! Bodies are written as the JSON the node enum deserializes from, which
//! doubles as a check that the wire shape holds while the semantics run.

use serde_json::json;
use strata_compiler::{Compilation, Node, ProcedureDef};
use strata_kernel::{Schema, Value, Vm, VmError};

fn body(nodes: serde_json::Value) -> Vec<Node> {
    serde_json::from_value(nodes).unwrap()
}

fn procedure(name: &str, input: Vec<Schema>, nodes: serde_json::Value) -> ProcedureDef {
    ProcedureDef {
        name: name.to_string(),
        public: true,
        input,
        body: body(nodes),
    }
}

fn deploy(defs: Vec<ProcedureDef>) -> Vm {
    let mut compilation = Compilation::new();
    for def in defs {
        compilation = compilation.procedure(def);
    }
    Vm::new(
        compilation
            .compile()
            .unwrap()
            .into_builder()
            .unwrap()
            .build(),
    )
}

fn val(j: serde_json::Value) -> Value {
    serde_json::from_value(j).unwrap()
}

// ============================================================
// Returns, inputs, and the prologue
// ============================================================

#[test]
fn test_return_without_a_value_yields_none() {
    let vm = deploy(vec![procedure("p", vec![], json!([{"kind": "Return"}]))]);
    assert_eq!(vm.invoke("p", vec![]).unwrap(), Value::None);
}

#[test]
fn test_literals_round_through() {
    let vm = deploy(vec![
        procedure(
            "text",
            vec![],
            json!([{"kind": "Return", "value": {"kind": "String", "value": "hi"}}]),
        ),
        procedure(
            "whole_double",
            vec![],
            json!([{"kind": "Return", "value": {"kind": "Double", "value": 12.0}}]),
        ),
    ]);
    assert_eq!(vm.invoke("text", vec![]).unwrap(), Value::string("hi"));
    // Whole doubles normalize to ints everywhere.
    assert_eq!(vm.invoke("whole_double", vec![]).unwrap(), Value::Int(12));
}

#[test]
fn test_inputs_echo_through_saved_slots() {
    let vm = deploy(vec![procedure(
        "echo",
        vec![Schema::Any],
        json!([{"kind": "Return", "value": {"kind": "Saved", "index": 0}}]),
    )]);
    let input = val(json!({"a": [1, 2]}));
    assert_eq!(vm.invoke("echo", vec![input.clone()]).unwrap(), input);
}

#[test]
fn test_arity_mismatch_faults() {
    let vm = deploy(vec![procedure(
        "one",
        vec![Schema::Any],
        json!([{"kind": "Return"}]),
    )]);
    assert!(matches!(
        vm.invoke("one", vec![]),
        Err(VmError::HeapLenMismatch {
            expected: 1,
            found: 0
        })
    ));
}

#[test]
fn test_schema_gate_raises_invalid_input() {
    let vm = deploy(vec![procedure(
        "takes_int",
        vec![Schema::Int],
        json!([{"kind": "Return", "value": {"kind": "Saved", "index": 0}}]),
    )]);
    assert_eq!(
        vm.invoke("takes_int", vec![Value::Int(3)]).unwrap(),
        Value::Int(3)
    );
    assert!(matches!(
        vm.invoke("takes_int", vec![Value::string("nope")]),
        Err(VmError::Raised(msg)) if msg == "invalid input"
    ));
}

#[test]
fn test_optional_input_tolerates_none() {
    let vm = deploy(vec![procedure(
        "maybe",
        vec![Schema::Optional(Box::new(Schema::Int))],
        json!([{"kind": "Return", "value": {"kind": "Saved", "index": 0}}]),
    )]);
    assert_eq!(vm.invoke("maybe", vec![Value::None]).unwrap(), Value::None);
    assert_eq!(
        vm.invoke("maybe", vec![Value::Int(4)]).unwrap(),
        Value::Int(4)
    );
}

// ============================================================
// Expressions
// ============================================================

#[test]
fn test_math_adds_and_divides() {
    let vm = deploy(vec![
        procedure(
            "add",
            vec![],
            json!([{"kind": "Return", "value": {
                "kind": "Math", "sign": "+",
                "left": {"kind": "Int", "value": 1},
                "right": {"kind": "Int", "value": 2}
            }}]),
        ),
        procedure(
            "halve",
            vec![],
            json!([{"kind": "Return", "value": {
                "kind": "Math", "sign": "/",
                "left": {"kind": "Int", "value": 7},
                "right": {"kind": "Int", "value": 2}
            }}]),
        ),
        procedure(
            "label",
            vec![],
            json!([{"kind": "Return", "value": {
                "kind": "Math", "sign": "+",
                "left": {"kind": "String", "value": "n="},
                "right": {"kind": "Int", "value": 3}
            }}]),
        ),
    ]);
    assert_eq!(vm.invoke("add", vec![]).unwrap(), Value::Int(3));
    assert_eq!(vm.invoke("halve", vec![]).unwrap(), Value::Int(3));
    assert_eq!(vm.invoke("label", vec![]).unwrap(), Value::string("n=3"));
}

#[test]
fn test_comparisons_and_bool_algebra() {
    let vm = deploy(vec![procedure(
        "check",
        vec![],
        json!([{"kind": "Return", "value": {
            "kind": "BoolAlg", "sign": "and",
            "left": {
                "kind": "Comparison", "sign": "<",
                "left": {"kind": "Int", "value": 1},
                "right": {"kind": "Int", "value": 2}
            },
            "right": {
                "kind": "Comparison", "sign": ">=",
                "left": {"kind": "Int", "value": 5},
                "right": {"kind": "Int", "value": 5}
            }
        }}]),
    )]);
    assert_eq!(vm.invoke("check", vec![]).unwrap(), Value::Bool(true));
}

#[test]
fn test_selection_walks_object_paths() {
    let vm = deploy(vec![procedure(
        "pick",
        vec![],
        json!([
            {"kind": "Save", "value": {"kind": "Object", "fields": [
                {"key": {"kind": "String", "value": "a"},
                 "value": {"kind": "Object", "fields": [
                    {"key": {"kind": "String", "value": "b"},
                     "value": {"kind": "Int", "value": 5}}
                 ]}}
            ]}},
            {"kind": "Return", "value": {"kind": "Selection",
                "root": {"kind": "Saved", "index": 0},
                "level": [
                    {"kind": "String", "value": "a"},
                    {"kind": "String", "value": "b"}
                ]}}
        ]),
    )]);
    assert_eq!(vm.invoke("pick", vec![]).unwrap(), Value::Int(5));
}

#[test]
fn test_dynamic_object_keys_come_from_the_heap() {
    let vm = deploy(vec![procedure(
        "keyed",
        vec![Schema::String],
        json!([{"kind": "Return", "value": {"kind": "Object", "fields": [
            {"key": {"kind": "Saved", "index": 0},
             "value": {"kind": "Int", "value": 1}}
        ]}}]),
    )]);
    assert_eq!(
        vm.invoke("keyed", vec![Value::string("dyn")]).unwrap(),
        val(json!({"dyn": 1}))
    );
}

#[test]
fn test_field_exists_checks_presence_not_value() {
    let vm = deploy(vec![procedure(
        "has",
        vec![Schema::String],
        json!([
            {"kind": "Save", "value": {"kind": "Object", "fields": [
                {"key": {"kind": "String", "value": "here"},
                 "value": {"kind": "None"}}
            ]}},
            {"kind": "Return", "value": {"kind": "FieldExists",
                "value": {"kind": "Saved", "index": 1},
                "field": {"kind": "Saved", "index": 0}}}
        ]),
    )]);
    assert_eq!(
        vm.invoke("has", vec![Value::string("here")]).unwrap(),
        Value::Bool(true)
    );
    assert_eq!(
        vm.invoke("has", vec![Value::string("absent")]).unwrap(),
        Value::Bool(false)
    );
}

#[test]
fn test_keys_selection_lists_object_keys() {
    let vm = deploy(vec![procedure(
        "keys",
        vec![],
        json!([
            {"kind": "Save", "value": {"kind": "Object", "fields": [
                {"key": {"kind": "String", "value": "k1"},
                 "value": {"kind": "Int", "value": 1}}
            ]}},
            {"kind": "Return", "value": {"kind": "Selection",
                "root": {"kind": "Saved", "index": 0},
                "level": [{"kind": "Keys"}]}}
        ]),
    )]);
    assert_eq!(vm.invoke("keys", vec![]).unwrap(), val(json!(["k1"])));
}

#[test]
fn test_keys_feed_further_selection() {
    let vm = deploy(vec![procedure(
        "first_key",
        vec![],
        json!([
            {"kind": "Save", "value": {"kind": "Object", "fields": [
                {"key": {"kind": "String", "value": "only"},
                 "value": {"kind": "Int", "value": 1}}
            ]}},
            {"kind": "Return", "value": {"kind": "Selection",
                "root": {"kind": "Saved", "index": 0},
                "level": [{"kind": "Keys"}, {"kind": "Int", "value": 0}]}}
        ]),
    )]);
    assert_eq!(
        vm.invoke("first_key", vec![]).unwrap(),
        Value::string("only")
    );
}

// ============================================================
// Statements
// ============================================================

#[test]
fn test_if_chains_join_on_finally() {
    let vm = deploy(vec![
        procedure(
            "matched",
            vec![],
            json!([{"kind": "If", "conditionally": [
                {"kind": "Conditional",
                 "cond": {"kind": "Bool", "value": true},
                 "do": [{"kind": "Return", "value": {"kind": "Int", "value": 1}}]},
                {"kind": "Finally",
                 "do": [{"kind": "Return", "value": {"kind": "Int", "value": 2}}]}
            ]}]),
        ),
        procedure(
            "unmatched",
            vec![],
            json!([{"kind": "If", "conditionally": [
                {"kind": "Conditional",
                 "cond": {"kind": "Bool", "value": false},
                 "do": [{"kind": "Return", "value": {"kind": "Int", "value": 1}}]}
            ]}]),
        ),
        procedure(
            "fallback",
            vec![],
            json!([{"kind": "If", "conditionally": [
                {"kind": "Conditional",
                 "cond": {"kind": "Bool", "value": false},
                 "do": [{"kind": "Return", "value": {"kind": "Int", "value": 1}}]},
                {"kind": "Finally",
                 "do": [{"kind": "Return", "value": {"kind": "Int", "value": 2}}]}
            ]}]),
        ),
        procedure(
            "else_arm",
            vec![],
            json!([{"kind": "If", "conditionally": [
                {"kind": "Conditional",
                 "cond": {"kind": "Bool", "value": false},
                 "do": [{"kind": "Return", "value": {"kind": "Int", "value": 1}}]},
                {"kind": "Else",
                 "do": [{"kind": "Return", "value": {"kind": "Int", "value": 3}}]}
            ]}]),
        ),
        procedure(
            "fallthrough",
            vec![],
            json!([{"kind": "If", "conditionally": [
                {"kind": "Conditional",
                 "cond": {"kind": "Bool", "value": true},
                 "do": []},
                {"kind": "Finally",
                 "do": [{"kind": "Return", "value": {"kind": "Int", "value": 5}}]}
            ]}]),
        ),
    ]);
    assert_eq!(vm.invoke("matched", vec![]).unwrap(), Value::Int(1));
    assert_eq!(vm.invoke("unmatched", vec![]).unwrap(), Value::None);
    assert_eq!(vm.invoke("fallback", vec![]).unwrap(), Value::Int(2));
    assert_eq!(vm.invoke("else_arm", vec![]).unwrap(), Value::Int(3));
    assert_eq!(vm.invoke("fallthrough", vec![]).unwrap(), Value::Int(5));
}

#[test]
fn test_branch_saves_do_not_shift_later_slots() {
    let vm = deploy(vec![procedure(
        "scoped",
        vec![],
        json!([
            {"kind": "If", "conditionally": [
                {"kind": "Conditional",
                 "cond": {"kind": "Bool", "value": true},
                 "do": [{"kind": "Save", "value": {"kind": "Int", "value": -1}}]}
            ]},
            {"kind": "Save", "value": {"kind": "Int", "value": 2}},
            {"kind": "Return", "value": {"kind": "Saved", "index": 0}}
        ]),
    )]);
    assert_eq!(vm.invoke("scoped", vec![]).unwrap(), Value::Int(2));
}

#[test]
fn test_foreach_accumulates_over_the_input_array() {
    let vm = deploy(vec![procedure(
        "sum",
        vec![Schema::Array(Box::new(Schema::Double))],
        json!([
            {"kind": "Save", "value": {"kind": "Int", "value": 0}},
            {"kind": "ArrayForEach",
             "target": {"kind": "Saved", "index": 0},
             "do": [
                {"kind": "Update",
                 "root": {"kind": "Saved", "index": 1},
                 "level": [],
                 "operation": {"kind": "Math", "sign": "+",
                    "left": {"kind": "Saved", "index": 1},
                    "right": {"kind": "Saved", "index": 2}}}
             ]},
            {"kind": "Return", "value": {"kind": "Saved", "index": 1}}
        ]),
    )]);
    assert_eq!(
        vm.invoke("sum", vec![val(json!([1, 2, 3]))]).unwrap(),
        Value::Int(6)
    );
    assert_eq!(
        vm.invoke("sum", vec![val(json!([]))]).unwrap(),
        Value::Int(0)
    );
}

#[test]
fn test_array_updates_push_and_overwrite() {
    let vm = deploy(vec![procedure(
        "grow",
        vec![],
        json!([
            {"kind": "Save", "value": {"kind": "ArrayLiteral", "values": [
                {"kind": "Int", "value": 1}
            ]}},
            {"kind": "Update",
             "root": {"kind": "Saved", "index": 0},
             "level": [],
             "operation": {"kind": "Push", "values": [
                {"kind": "Int", "value": 2},
                {"kind": "Int", "value": 3}
             ]}},
            {"kind": "Update",
             "root": {"kind": "Saved", "index": 0},
             "level": [{"kind": "Int", "value": 0}],
             "operation": {"kind": "Int", "value": 10}},
            {"kind": "Return", "value": {"kind": "Saved", "index": 0}}
        ]),
    )]);
    assert_eq!(vm.invoke("grow", vec![]).unwrap(), val(json!([10, 2, 3])));
}

#[test]
fn test_push_reaches_through_a_field_path() {
    let vm = deploy(vec![procedure(
        "nested_push",
        vec![],
        json!([
            {"kind": "Save", "value": {"kind": "Object", "fields": [
                {"key": {"kind": "String", "value": "list"},
                 "value": {"kind": "ArrayLiteral", "values": []}}
            ]}},
            {"kind": "Update",
             "root": {"kind": "Saved", "index": 0},
             "level": [{"kind": "String", "value": "list"}],
             "operation": {"kind": "Push", "values": [{"kind": "Int", "value": 5}]}},
            {"kind": "Return", "value": {"kind": "Selection",
                "root": {"kind": "Saved", "index": 0},
                "level": [{"kind": "String", "value": "list"}]}}
        ]),
    )]);
    assert_eq!(vm.invoke("nested_push", vec![]).unwrap(), val(json!([5])));
}

#[test]
fn test_delete_field_removes_just_that_field() {
    let vm = deploy(vec![procedure(
        "prune",
        vec![],
        json!([
            {"kind": "Save", "value": {"kind": "Object", "fields": [
                {"key": {"kind": "String", "value": "a"},
                 "value": {"kind": "Int", "value": 1}},
                {"key": {"kind": "String", "value": "b"},
                 "value": {"kind": "Int", "value": 2}}
            ]}},
            {"kind": "Update",
             "root": {"kind": "Saved", "index": 0},
             "level": [{"kind": "String", "value": "a"}],
             "operation": {"kind": "DeleteField"}},
            {"kind": "Return", "value": {"kind": "Saved", "index": 0}}
        ]),
    )]);
    assert_eq!(vm.invoke("prune", vec![]).unwrap(), val(json!({"b": 2})));
}

// ============================================================
// Calls
// ============================================================

#[test]
fn test_calls_reach_private_procedures() {
    let mut callee = procedure(
        "callee",
        vec![],
        json!([{"kind": "Return", "value": {"kind": "String", "value": "Hello"}}]),
    );
    callee.public = false;
    let vm = deploy(vec![
        procedure(
            "caller",
            vec![],
            json!([{"kind": "Return", "value": {
                "kind": "Call", "function_name": "callee", "args": []
            }}]),
        ),
        callee,
    ]);
    assert_eq!(vm.invoke("caller", vec![]).unwrap(), Value::string("Hello"));
    // From outside, the private callee does not exist.
    assert!(matches!(
        vm.invoke("callee", vec![]),
        Err(VmError::UnknownProcedure(_))
    ));
}

#[test]
fn test_call_arguments_land_in_the_callee_heap() {
    let vm = deploy(vec![
        procedure(
            "bump",
            vec![Schema::Int],
            json!([{"kind": "Return", "value": {"kind": "Math", "sign": "+",
                "left": {"kind": "Saved", "index": 0},
                "right": {"kind": "Int", "value": 1}}}]),
        ),
        procedure(
            "caller",
            vec![],
            json!([{"kind": "Return", "value": {
                "kind": "Call", "function_name": "bump",
                "args": [{"kind": "Int", "value": 41}]
            }}]),
        ),
    ]);
    assert_eq!(vm.invoke("caller", vec![]).unwrap(), Value::Int(42));
}

#[test]
fn test_callee_input_gate_applies_to_call_arguments() {
    let vm = deploy(vec![
        procedure(
            "strict",
            vec![Schema::Int],
            json!([{"kind": "Return", "value": {"kind": "Saved", "index": 0}}]),
        ),
        procedure(
            "sloppy",
            vec![],
            json!([{"kind": "Return", "value": {
                "kind": "Call", "function_name": "strict",
                "args": [{"kind": "String", "value": "wrong"}]
            }}]),
        ),
    ]);
    assert!(matches!(
        vm.invoke("sloppy", vec![]),
        Err(VmError::Raised(msg)) if msg == "invalid input"
    ));
}
