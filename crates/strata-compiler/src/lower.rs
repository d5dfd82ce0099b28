//! Store-access lowering.
//!
//! Procedures are written against named stores through [`Node::GlobalObject`]
//! roots. This pass rewrites every such use into the explicit storage forms
//! and registers each touched store, so emission only ever sees locals and
//! `*Stored*` nodes. Positions that cannot take a store, such as a
//! comparison operand or a loop target, fail here with the position named.

use std::collections::BTreeMap;

use strata_kernel::Schema;

use crate::error::CompileError;
use crate::node::{Field, IfSegment, LevelItem, Node};

/// Lower one procedure body, recording every store it touches.
pub(crate) fn lower_body(
    body: Vec<Node>,
    stores: &mut BTreeMap<String, Schema>,
) -> Result<Vec<Node>, CompileError> {
    Lowerer { stores }.body(body)
}

struct Lowerer<'a> {
    stores: &'a mut BTreeMap<String, Schema>,
}

impl Lowerer<'_> {
    fn body(&mut self, body: Vec<Node>) -> Result<Vec<Node>, CompileError> {
        body.into_iter().map(|node| self.statement(node)).collect()
    }

    /// Undeclared stores default to a map of anything.
    fn register(&mut self, name: &str) {
        if !self.stores.contains_key(name) {
            self.stores
                .insert(name.to_string(), Schema::Map(Box::new(Schema::Any)));
        }
    }

    fn statement(&mut self, node: Node) -> Result<Node, CompileError> {
        match node {
            Node::Return { value } => Ok(Node::Return {
                value: match value {
                    Some(value) => Some(Box::new(self.value_at(*value, "returned")?)),
                    None => None,
                },
            }),
            Node::Save { value } => Ok(Node::Save {
                value: Box::new(self.value_at(*value, "saved")?),
            }),
            Node::Update {
                root,
                level,
                operation,
            } => self.update(*root, level, *operation),
            Node::If { conditionally } => {
                let conditionally = conditionally
                    .into_iter()
                    .map(|segment| self.segment(segment))
                    .collect::<Result<_, _>>()?;
                Ok(Node::If { conditionally })
            }
            Node::ArrayForEach { target, body } => Ok(Node::ArrayForEach {
                target: Box::new(self.value_at(*target, "iterated")?),
                body: self.body(body)?,
            }),
            Node::SetStoredKey { store, key, value } => {
                self.register(&store);
                Ok(Node::SetStoredKey {
                    store,
                    key,
                    value: Box::new(self.value(*value)?),
                })
            }
            Node::DeleteStoredKey { store, key } => {
                self.register(&store);
                Ok(Node::DeleteStoredKey { store, key })
            }
            Node::PushToStoredKey { store, key, values } => {
                self.register(&store);
                Ok(Node::PushToStoredKey {
                    store,
                    key,
                    values: self.pushed(values)?,
                })
            }
            other => Ok(other),
        }
    }

    fn segment(&mut self, segment: IfSegment) -> Result<IfSegment, CompileError> {
        Ok(match segment {
            IfSegment::Conditional { cond, body } => IfSegment::Conditional {
                cond: self.value_at(cond, "a condition")?,
                body: self.body(body)?,
            },
            IfSegment::Else { body } => IfSegment::Else {
                body: self.body(body)?,
            },
            IfSegment::Finally { body } => IfSegment::Finally {
                body: self.body(body)?,
            },
        })
    }

    fn update(
        &mut self,
        root: Node,
        level: Vec<LevelItem>,
        operation: Node,
    ) -> Result<Node, CompileError> {
        if level.iter().any(|item| matches!(item, LevelItem::Keys)) {
            return Err(CompileError::KeysNotAssignable);
        }
        match root {
            Node::Saved { index } => {
                let operation = match operation {
                    Node::Push { values } => Node::Push {
                        values: self.pushed(values)?,
                    },
                    Node::DeleteField => Node::DeleteField,
                    value => self.value(value)?,
                };
                Ok(Node::Update {
                    root: Box::new(Node::Saved { index }),
                    level,
                    operation: Box::new(operation),
                })
            }
            Node::GlobalObject { name } => {
                self.register(&name);
                if level.is_empty() {
                    return Err(CompileError::EmptyStoreKey);
                }
                match operation {
                    Node::DeleteField => Ok(Node::DeleteStoredKey {
                        store: name,
                        key: level,
                    }),
                    Node::Push { values } => Ok(Node::PushToStoredKey {
                        store: name,
                        key: level,
                        values: self.pushed(values)?,
                    }),
                    value => Ok(Node::SetStoredKey {
                        store: name,
                        key: level,
                        value: Box::new(self.value(value)?),
                    }),
                }
            }
            _ => Err(CompileError::BadUpdateRoot),
        }
    }

    fn pushed(&mut self, values: Vec<Node>) -> Result<Vec<Node>, CompileError> {
        values
            .into_iter()
            .map(|value| self.value_at(value, "a pushed value"))
            .collect()
    }

    fn value(&mut self, node: Node) -> Result<Node, CompileError> {
        self.value_at(node, "used as a value")
    }

    fn value_at(&mut self, node: Node, position: &'static str) -> Result<Node, CompileError> {
        match node {
            Node::GlobalObject { .. } => Err(CompileError::IllegalStoreUse(position)),
            Node::Selection { root, level } => match *root {
                Node::GlobalObject { name } => self.stored_selection(name, level),
                root => Ok(Node::Selection {
                    root: Box::new(self.value(root)?),
                    level,
                }),
            },
            Node::FieldExists { value, field } => match *value {
                Node::GlobalObject { name } => {
                    self.register(&name);
                    Ok(Node::StoredKeyExists {
                        store: name,
                        key: Box::new(self.value(*field)?),
                    })
                }
                value => Ok(Node::FieldExists {
                    value: Box::new(self.value(value)?),
                    field: Box::new(self.value(*field)?),
                }),
            },
            Node::Object { fields } => {
                let fields = fields
                    .into_iter()
                    .map(|field| {
                        Ok(Field {
                            key: field.key,
                            value: self.value(field.value)?,
                        })
                    })
                    .collect::<Result<_, CompileError>>()?;
                Ok(Node::Object { fields })
            }
            Node::ArrayLiteral { values } => {
                let values = values
                    .into_iter()
                    .map(|value| self.value_at(value, "an array element"))
                    .collect::<Result<_, _>>()?;
                Ok(Node::ArrayLiteral { values })
            }
            Node::Comparison { sign, left, right } => Ok(Node::Comparison {
                sign,
                left: Box::new(self.value_at(*left, "compared")?),
                right: Box::new(self.value_at(*right, "compared")?),
            }),
            Node::BoolAlg { sign, left, right } => Ok(Node::BoolAlg {
                sign,
                left: Box::new(self.value_at(*left, "a bool operand")?),
                right: Box::new(self.value_at(*right, "a bool operand")?),
            }),
            Node::Math { sign, left, right } => Ok(Node::Math {
                sign,
                left: Box::new(self.value(*left)?),
                right: Box::new(self.value(*right)?),
            }),
            Node::Call {
                function_name,
                args,
            } => {
                let args = args
                    .into_iter()
                    .map(|arg| self.value(arg))
                    .collect::<Result<_, _>>()?;
                Ok(Node::Call {
                    function_name,
                    args,
                })
            }
            Node::GetStoredKey { store, key } => {
                self.register(&store);
                Ok(Node::GetStoredKey { store, key })
            }
            Node::StoredKeyExists { store, key } => {
                self.register(&store);
                Ok(Node::StoredKeyExists {
                    store,
                    key: Box::new(self.value(*key)?),
                })
            }
            Node::StoredKeys { store } => {
                self.register(&store);
                Ok(Node::StoredKeys { store })
            }
            Node::GetWholeStore { store } => {
                self.register(&store);
                Ok(Node::GetWholeStore { store })
            }
            other => Ok(other),
        }
    }

    /// A selection rooted at a store. The level up to the first `Keys`
    /// segment addresses the store itself; anything after it applies to
    /// the fetched value.
    fn stored_selection(
        &mut self,
        store: String,
        mut level: Vec<LevelItem>,
    ) -> Result<Node, CompileError> {
        self.register(&store);
        match level
            .iter()
            .position(|item| matches!(item, LevelItem::Keys))
        {
            None if level.is_empty() => Ok(Node::GetWholeStore { store }),
            None => Ok(Node::GetStoredKey { store, key: level }),
            Some(0) => {
                level.remove(0);
                let keys = Node::StoredKeys { store };
                if level.is_empty() {
                    Ok(keys)
                } else {
                    Ok(Node::Selection {
                        root: Box::new(keys),
                        level,
                    })
                }
            }
            Some(split) => {
                let rest = level.split_off(split);
                Ok(Node::Selection {
                    root: Box::new(Node::GetStoredKey { store, key: level }),
                    level: rest,
                })
            }
        }
    }
}
