//! Store-access summaries.
//!
//! A deployment review tool: each procedure body reduces to the ordered
//! store actions it performs, and [`lock_requirements`] turns a summary
//! into the advisory lock set a safe concurrent deployment would hold.
//! Nothing here changes emitted ops. `Lock` and `Release` nodes remain
//! the mechanism that actually takes a mutex.
//!
//! The interesting part is taint: a mutation "uses" every store its
//! written value was computed from, including indirectly through saved
//! slots. A write whose value depends on its own store needs exclusivity;
//! one that depends on another store needs that store held steady.

use std::collections::{BTreeMap, BTreeSet};

use rustc_hash::FxHashMap;

use crate::error::CompileError;
use crate::lower;
use crate::node::{IfSegment, LevelItem, Node, ProcedureDef};

/// One store interaction, in body order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreAction {
    /// The procedure reads from `store`.
    Get {
        /// Store read from.
        store: String,
    },
    /// The procedure writes `store`; `uses` are the stores the written
    /// value was computed from.
    Mutation {
        /// Store written to.
        store: String,
        /// Stores the written value depends on, sorted.
        uses: Vec<String>,
    },
}

/// Advisory lock strength for one store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockKind {
    /// The store feeds a mutation of another store.
    Read,
    /// The store feeds a mutation and is itself mutated.
    Write,
}

/// Summarize one procedure into its ordered store actions.
pub fn summarize(def: &ProcedureDef) -> Result<Vec<StoreAction>, CompileError> {
    let mut scratch = BTreeMap::new();
    let lowered = lower::lower_body(def.body.clone(), &mut scratch)?;
    let mut summarizer = Summarizer {
        actions: Vec::new(),
        taints: FxHashMap::default(),
        next_var: def.input.len(),
    };
    for node in &lowered {
        summarizer.statement(node)?;
    }
    Ok(summarizer.actions)
}

/// Derive the advisory lock set from a summary. Pure reads and blind
/// writes want nothing; only data flowing between stores creates a
/// requirement.
pub fn lock_requirements(actions: &[StoreAction]) -> BTreeMap<String, LockKind> {
    let mut used = BTreeSet::new();
    let mut mutated = BTreeSet::new();
    for action in actions {
        if let StoreAction::Mutation { store, uses } = action {
            mutated.insert(store.clone());
            used.extend(uses.iter().cloned());
        }
    }
    used.into_iter()
        .map(|store| {
            let kind = if mutated.contains(&store) {
                LockKind::Write
            } else {
                LockKind::Read
            };
            (store, kind)
        })
        .collect()
}

struct Summarizer {
    actions: Vec<StoreAction>,
    /// Per heap slot, the stores its value was computed from.
    taints: FxHashMap<usize, BTreeSet<String>>,
    next_var: usize,
}

impl Summarizer {
    fn statement(&mut self, node: &Node) -> Result<(), CompileError> {
        match node {
            Node::Return { value } => {
                if let Some(value) = value {
                    self.expression(value, &mut BTreeSet::new())?;
                }
                Ok(())
            }
            Node::Save { value } => {
                let mut footprint = BTreeSet::new();
                self.expression(value, &mut footprint)?;
                self.taints.insert(self.next_var, footprint);
                self.next_var += 1;
                Ok(())
            }
            Node::Update {
                root,
                level,
                operation,
            } => {
                let index = match root.as_ref() {
                    Node::Saved { index } => *index,
                    _ => return Err(CompileError::BadUpdateRoot),
                };
                let mut footprint = BTreeSet::new();
                for item in level {
                    self.level_item(item, &mut footprint);
                }
                match operation.as_ref() {
                    Node::Push { values } => {
                        for value in values {
                            self.expression(value, &mut footprint)?;
                        }
                    }
                    Node::DeleteField => {}
                    value => self.expression(value, &mut footprint)?,
                }
                // Writing through a slot extends what it depends on.
                self.taints.entry(index).or_default().extend(footprint);
                Ok(())
            }
            Node::If { conditionally } => {
                for segment in conditionally {
                    match segment {
                        IfSegment::Conditional { cond, body } => {
                            self.expression(cond, &mut BTreeSet::new())?;
                            self.scoped(body)?;
                        }
                        IfSegment::Else { body } | IfSegment::Finally { body } => {
                            self.scoped(body)?;
                        }
                    }
                }
                Ok(())
            }
            Node::ArrayForEach { target, body } => {
                let mut footprint = BTreeSet::new();
                self.expression(target, &mut footprint)?;
                // The element slot carries whatever the array came from.
                let element = self.next_var;
                self.taints.insert(element, footprint);
                self.next_var += 1;
                for node in body {
                    self.statement(node)?;
                }
                self.drop_to(element);
                Ok(())
            }
            Node::Lock { name } | Node::Release { name } => {
                self.expression(name, &mut BTreeSet::new())
            }
            Node::SetStoredKey { store, key, value } => {
                let mut footprint = BTreeSet::new();
                for item in key {
                    self.level_item(item, &mut footprint);
                }
                self.expression(value, &mut footprint)?;
                self.mutation(store, footprint);
                Ok(())
            }
            Node::DeleteStoredKey { store, key } => {
                let mut footprint = BTreeSet::new();
                for item in key {
                    self.level_item(item, &mut footprint);
                }
                self.mutation(store, footprint);
                Ok(())
            }
            Node::PushToStoredKey { store, key, values } => {
                let mut footprint = BTreeSet::new();
                for item in key {
                    self.level_item(item, &mut footprint);
                }
                for value in values {
                    self.expression(value, &mut footprint)?;
                }
                self.mutation(store, footprint);
                Ok(())
            }
            Node::Push { .. } | Node::DeleteField => {
                Err(CompileError::MisplacedOperation(node.kind()))
            }
            other => Err(CompileError::ExpressionAsStatement(other.kind())),
        }
    }

    fn expression(
        &mut self,
        node: &Node,
        footprint: &mut BTreeSet<String>,
    ) -> Result<(), CompileError> {
        match node {
            Node::None
            | Node::Bool { .. }
            | Node::Int { .. }
            | Node::Double { .. }
            | Node::String { .. } => Ok(()),
            Node::Saved { index } => {
                if let Some(taint) = self.taints.get(index) {
                    footprint.extend(taint.iter().cloned());
                }
                Ok(())
            }
            Node::Object { fields } => {
                for field in fields {
                    self.expression(&field.key, footprint)?;
                    self.expression(&field.value, footprint)?;
                }
                Ok(())
            }
            Node::ArrayLiteral { values } => {
                for value in values {
                    self.expression(value, footprint)?;
                }
                Ok(())
            }
            Node::Selection { root, level } => {
                self.expression(root, footprint)?;
                for item in level {
                    self.level_item(item, footprint);
                }
                Ok(())
            }
            Node::FieldExists { value, field } => {
                self.expression(value, footprint)?;
                self.expression(field, footprint)
            }
            Node::Comparison { left, right, .. }
            | Node::BoolAlg { left, right, .. }
            | Node::Math { left, right, .. } => {
                self.expression(left, footprint)?;
                self.expression(right, footprint)
            }
            Node::Call { args, .. } => {
                // Callee effects are not folded in; arguments still count.
                for arg in args {
                    self.expression(arg, footprint)?;
                }
                Ok(())
            }
            Node::GetStoredKey { store, key } => {
                for item in key {
                    self.level_item(item, footprint);
                }
                self.read(store, footprint);
                Ok(())
            }
            Node::StoredKeyExists { store, key } => {
                self.expression(key, footprint)?;
                self.read(store, footprint);
                Ok(())
            }
            Node::StoredKeys { store } | Node::GetWholeStore { store } => {
                self.read(store, footprint);
                Ok(())
            }
            Node::GlobalObject { .. } => {
                Err(CompileError::IllegalStoreUse("used as a value"))
            }
            other => Err(CompileError::StatementAsValue(other.kind())),
        }
    }

    fn level_item(&self, item: &LevelItem, footprint: &mut BTreeSet<String>) {
        if let LevelItem::Saved { index } = item {
            if let Some(taint) = self.taints.get(index) {
                footprint.extend(taint.iter().cloned());
            }
        }
    }

    fn read(&mut self, store: &str, footprint: &mut BTreeSet<String>) {
        self.actions.push(StoreAction::Get {
            store: store.to_string(),
        });
        footprint.insert(store.to_string());
    }

    fn mutation(&mut self, store: &str, footprint: BTreeSet<String>) {
        self.actions.push(StoreAction::Mutation {
            store: store.to_string(),
            uses: footprint.into_iter().collect(),
        });
    }

    fn scoped(&mut self, body: &[Node]) -> Result<(), CompileError> {
        let depth = self.next_var;
        for node in body {
            self.statement(node)?;
        }
        self.drop_to(depth);
        Ok(())
    }

    fn drop_to(&mut self, depth: usize) {
        for slot in depth..self.next_var {
            self.taints.remove(&slot);
        }
        self.next_var = depth;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn get(store: &str) -> Node {
        Node::Selection {
            root: Box::new(Node::GlobalObject {
                name: store.to_string(),
            }),
            level: vec![LevelItem::String {
                value: "k".to_string(),
            }],
        }
    }

    fn set(store: &str, value: Node) -> Node {
        Node::Update {
            root: Box::new(Node::GlobalObject {
                name: store.to_string(),
            }),
            level: vec![LevelItem::String {
                value: "k".to_string(),
            }],
            operation: Box::new(value),
        }
    }

    fn requirements(body: Vec<Node>) -> BTreeMap<String, LockKind> {
        let def = ProcedureDef {
            name: "p".to_string(),
            public: true,
            input: vec![],
            body,
        };
        lock_requirements(&summarize(&def).unwrap())
    }

    #[test]
    fn test_reads_alone_need_no_locks() {
        let needs = requirements(vec![Node::Return {
            value: Some(Box::new(get("i"))),
        }]);
        assert!(needs.is_empty());
    }

    #[test]
    fn test_blind_writes_need_no_locks() {
        assert!(requirements(vec![set("i", Node::Int { value: 1 })]).is_empty());
        assert!(requirements(vec![
            set("i", Node::Int { value: 1 }),
            set("j", Node::Int { value: 2 }),
        ])
        .is_empty());
    }

    #[test]
    fn test_read_after_blind_write_stays_unlocked() {
        let needs = requirements(vec![
            set("i", Node::Int { value: 0 }),
            Node::Return {
                value: Some(Box::new(get("i"))),
            },
        ]);
        assert!(needs.is_empty());
    }

    #[test]
    fn test_dependent_write_wants_a_read_lock() {
        let needs = requirements(vec![set("i", get("j"))]);
        assert_eq!(
            needs,
            BTreeMap::from([("j".to_string(), LockKind::Read)])
        );
    }

    #[test]
    fn test_self_dependent_write_wants_a_write_lock() {
        let needs = requirements(vec![set("i", get("i"))]);
        assert_eq!(
            needs,
            BTreeMap::from([("i".to_string(), LockKind::Write)])
        );
    }

    #[test]
    fn test_dependency_written_later_escalates_to_write() {
        let needs = requirements(vec![
            set("i", get("j")),
            set("j", Node::Int { value: 1 }),
        ]);
        assert_eq!(
            needs,
            BTreeMap::from([("j".to_string(), LockKind::Write)])
        );
    }

    #[test]
    fn test_taint_flows_through_saves() {
        let needs = requirements(vec![
            Node::Save {
                value: Box::new(get("j")),
            },
            set("i", Node::Saved { index: 0 }),
        ]);
        assert_eq!(
            needs,
            BTreeMap::from([("j".to_string(), LockKind::Read)])
        );
    }

    #[test]
    fn test_taint_flows_through_slot_updates() {
        let needs = requirements(vec![
            Node::Save {
                value: Box::new(Node::None),
            },
            Node::Update {
                root: Box::new(Node::Saved { index: 0 }),
                level: vec![],
                operation: Box::new(get("j")),
            },
            set("i", Node::Saved { index: 0 }),
        ]);
        assert_eq!(
            needs,
            BTreeMap::from([("j".to_string(), LockKind::Read)])
        );
    }

    #[test]
    fn test_foreach_element_carries_the_target_taint() {
        let needs = requirements(vec![
            Node::Save {
                value: Box::new(get("j")),
            },
            Node::ArrayForEach {
                target: Box::new(Node::Saved { index: 0 }),
                body: vec![set("i", Node::Saved { index: 1 })],
            },
        ]);
        assert_eq!(
            needs,
            BTreeMap::from([("j".to_string(), LockKind::Read)])
        );
    }

    #[test]
    fn test_summary_keeps_body_order() {
        let def = ProcedureDef {
            name: "p".to_string(),
            public: true,
            input: vec![],
            body: vec![set("i", get("j"))],
        };
        assert_eq!(
            summarize(&def).unwrap(),
            vec![
                StoreAction::Get {
                    store: "j".to_string()
                },
                StoreAction::Mutation {
                    store: "i".to_string(),
                    uses: vec!["j".to_string()],
                },
            ]
        );
    }

    #[test]
    fn test_branch_saves_do_not_leak_taint() {
        // Slot 0 inside the branch is not slot 0 after it.
        let needs = requirements(vec![
            Node::If {
                conditionally: vec![IfSegment::Conditional {
                    cond: Node::Bool { value: false },
                    body: vec![Node::Save {
                        value: Box::new(get("j")),
                    }],
                }],
            },
            Node::Save {
                value: Box::new(Node::Int { value: 2 }),
            },
            set("i", Node::Saved { index: 0 }),
        ]);
        assert!(needs.is_empty());
    }
}
