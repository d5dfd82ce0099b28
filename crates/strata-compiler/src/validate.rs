//! Shape checks ahead of lowering.
//!
//! Lowering and emission assume statements sit at statement position,
//! expressions at expression position, and if chains are well formed.
//! This pass establishes those assumptions so the later passes stay
//! total. Store legality is not checked here: a bare [`Node::GlobalObject`]
//! is fine in any expression slot as far as this pass is concerned, and
//! lowering rejects the positions that cannot take one.

use rustc_hash::FxHashSet;

use crate::error::CompileError;
use crate::node::{Field, IfSegment, LevelItem, Node};

/// Check every statement of a procedure body.
pub(crate) fn validate_body(
    body: &[Node],
    known: &FxHashSet<String>,
) -> Result<(), CompileError> {
    body.iter().try_for_each(|node| statement(node, known))
}

fn statement(node: &Node, known: &FxHashSet<String>) -> Result<(), CompileError> {
    match node {
        Node::Return { value } => match value {
            Some(value) => expression(value, known),
            None => Ok(()),
        },
        Node::Save { value } => expression(value, known),
        Node::Update { operation, .. } => match operation.as_ref() {
            Node::Push { values } => values.iter().try_for_each(|v| expression(v, known)),
            Node::DeleteField => Ok(()),
            value => expression(value, known),
        },
        Node::If { conditionally } => if_chain(conditionally, known),
        Node::ArrayForEach { target, body } => {
            expression(target, known)?;
            validate_body(body, known)
        }
        Node::Lock { name } | Node::Release { name } => match name.as_ref() {
            Node::String { .. } | Node::Saved { .. } => Ok(()),
            _ => Err(CompileError::BadLockName),
        },
        Node::SetStoredKey { key, value, .. } => {
            nonempty(key)?;
            expression(value, known)
        }
        Node::DeleteStoredKey { key, .. } => nonempty(key),
        Node::PushToStoredKey { key, values, .. } => {
            nonempty(key)?;
            values.iter().try_for_each(|v| expression(v, known))
        }
        Node::Push { .. } | Node::DeleteField => {
            Err(CompileError::MisplacedOperation(node.kind()))
        }
        other => Err(CompileError::ExpressionAsStatement(other.kind())),
    }
}

fn expression(node: &Node, known: &FxHashSet<String>) -> Result<(), CompileError> {
    match node {
        Node::None
        | Node::Bool { .. }
        | Node::Int { .. }
        | Node::Double { .. }
        | Node::String { .. }
        | Node::Saved { .. }
        | Node::GlobalObject { .. } => Ok(()),
        Node::Object { fields } => fields.iter().try_for_each(|f| field(f, known)),
        Node::ArrayLiteral { values } => {
            values.iter().try_for_each(|v| expression(v, known))
        }
        Node::Selection { root, .. } => expression(root, known),
        Node::FieldExists { value, field } => {
            expression(value, known)?;
            expression(field, known)
        }
        Node::Comparison { left, right, .. }
        | Node::BoolAlg { left, right, .. }
        | Node::Math { left, right, .. } => {
            expression(left, known)?;
            expression(right, known)
        }
        Node::Call {
            function_name,
            args,
        } => {
            if !known.contains(function_name) {
                return Err(CompileError::UnknownCallTarget(function_name.clone()));
            }
            args.iter().try_for_each(|a| expression(a, known))
        }
        Node::GetStoredKey { key, .. } => nonempty(key),
        Node::StoredKeyExists { key, .. } => expression(key, known),
        Node::StoredKeys { .. } | Node::GetWholeStore { .. } => Ok(()),
        Node::Push { .. } | Node::DeleteField => {
            Err(CompileError::MisplacedOperation(node.kind()))
        }
        other => Err(CompileError::StatementAsValue(other.kind())),
    }
}

fn field(field: &Field, known: &FxHashSet<String>) -> Result<(), CompileError> {
    match &field.key {
        Node::String { .. } | Node::Saved { .. } => expression(&field.value, known),
        _ => Err(CompileError::BadFieldKey),
    }
}

fn if_chain(segments: &[IfSegment], known: &FxHashSet<String>) -> Result<(), CompileError> {
    if !matches!(segments.first(), Some(IfSegment::Conditional { .. })) {
        return Err(CompileError::IfChainStart);
    }
    for (position, segment) in segments.iter().enumerate() {
        match segment {
            IfSegment::Conditional { cond, body } => {
                expression(cond, known)?;
                validate_body(body, known)?;
            }
            IfSegment::Else { body } => validate_body(body, known)?,
            IfSegment::Finally { body } => {
                if position + 1 != segments.len() {
                    return Err(CompileError::FinallyNotTerminal);
                }
                validate_body(body, known)?;
            }
        }
    }
    Ok(())
}

fn nonempty(key: &[LevelItem]) -> Result<(), CompileError> {
    if key.is_empty() {
        return Err(CompileError::EmptyStoreKey);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn known() -> FxHashSet<String> {
        let mut set = FxHashSet::default();
        set.insert("helper".to_string());
        set
    }

    #[test]
    fn test_if_chain_must_open_with_conditional() {
        let body = vec![Node::If {
            conditionally: vec![IfSegment::Else { body: vec![] }],
        }];
        assert_eq!(
            validate_body(&body, &known()),
            Err(CompileError::IfChainStart)
        );
    }

    #[test]
    fn test_finally_must_close_the_chain() {
        let body = vec![Node::If {
            conditionally: vec![
                IfSegment::Conditional {
                    cond: Node::Bool { value: true },
                    body: vec![],
                },
                IfSegment::Finally { body: vec![] },
                IfSegment::Else { body: vec![] },
            ],
        }];
        assert_eq!(
            validate_body(&body, &known()),
            Err(CompileError::FinallyNotTerminal)
        );
    }

    #[test]
    fn test_push_only_lives_under_update() {
        let body = vec![Node::Push {
            values: vec![Node::Int { value: 1 }],
        }];
        assert_eq!(
            validate_body(&body, &known()),
            Err(CompileError::MisplacedOperation("Push"))
        );
    }

    #[test]
    fn test_lock_name_must_be_string_or_saved() {
        let body = vec![Node::Lock {
            name: Box::new(Node::Int { value: 3 }),
        }];
        assert_eq!(validate_body(&body, &known()), Err(CompileError::BadLockName));
        let ok = vec![Node::Lock {
            name: Box::new(Node::Saved { index: 0 }),
        }];
        assert_eq!(validate_body(&ok, &known()), Ok(()));
    }

    #[test]
    fn test_calls_must_name_a_known_procedure() {
        let body = vec![Node::Return {
            value: Some(Box::new(Node::Call {
                function_name: "missing".to_string(),
                args: vec![],
            })),
        }];
        assert_eq!(
            validate_body(&body, &known()),
            Err(CompileError::UnknownCallTarget("missing".to_string()))
        );
    }

    #[test]
    fn test_statements_cannot_be_values() {
        let body = vec![Node::Save {
            value: Box::new(Node::Return { value: None }),
        }];
        assert_eq!(
            validate_body(&body, &known()),
            Err(CompileError::StatementAsValue("Return"))
        );
    }

    #[test]
    fn test_expressions_cannot_stand_alone() {
        let body = vec![Node::Int { value: 9 }];
        assert_eq!(
            validate_body(&body, &known()),
            Err(CompileError::ExpressionAsStatement("Int"))
        );
    }

    #[test]
    fn test_object_keys_are_strings_or_saved() {
        let body = vec![Node::Save {
            value: Box::new(Node::Object {
                fields: vec![Field {
                    key: Node::Int { value: 1 },
                    value: Node::None,
                }],
            }),
        }];
        assert_eq!(validate_body(&body, &known()), Err(CompileError::BadFieldKey));
    }
}
