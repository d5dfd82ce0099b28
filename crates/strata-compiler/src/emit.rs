//! Op emission.
//!
//! Walks a validated, lowered body and produces the flat op vector for one
//! procedure. Expressions leave exactly one value on the operand stack and
//! statements leave none; `next_var` mirrors the runtime heap length at
//! every statement boundary, which is what makes saved indices checkable
//! at compile time. Jump distances are computed bottom-up: branch and loop
//! bodies are emitted into a side buffer first, so the enclosing skips and
//! back-edges know their exact lengths.

use std::mem;

use strata_kernel::{Op, Schema, Value, ValueMap};

use crate::error::CompileError;
use crate::node::{BoolSign, ComparisonSign, IfSegment, LevelItem, MathSign, Node};

const INVALID_INPUT: &str = "invalid input";
const MISSING_KEY: &str = "key does not exist on store";
const MISSING_NESTED: &str = "nested key does not exist on store";

/// Emit the full op vector for one procedure.
pub(crate) fn emit_procedure(input: &[Schema], body: &[Node]) -> Result<Vec<Op>, CompileError> {
    let mut emitter = Emitter {
        ops: Vec::new(),
        next_var: input.len(),
    };
    emitter.prologue(input);
    for node in body {
        emitter.statement(node)?;
    }
    Ok(emitter.ops)
}

struct Emitter {
    ops: Vec<Op>,
    /// Heap length at the current statement boundary.
    next_var: usize,
}

impl Emitter {
    /// Arity check, then one schema gate per parameter. A failed gate
    /// raises before any body op can observe the bad input.
    fn prologue(&mut self, input: &[Schema]) {
        self.ops.push(Op::AssertHeapLen(input.len()));
        for (heap_pos, schema) in input.iter().enumerate() {
            self.ops.push(Op::EnforceSchemaInstanceOnHeap {
                heap_pos,
                schema: schema.clone(),
            });
            self.ops.push(Op::ConditionallySkip(1));
            self.ops.push(Op::RaiseError(INVALID_INPUT.to_string()));
        }
    }

    /// Run `emit` against an empty op buffer and hand back what it wrote.
    fn buffered(
        &mut self,
        emit: impl FnOnce(&mut Self) -> Result<(), CompileError>,
    ) -> Result<Vec<Op>, CompileError> {
        let outer = mem::take(&mut self.ops);
        let result = emit(self);
        let inner = mem::replace(&mut self.ops, outer);
        result.map(|_| inner)
    }

    /// Emit a branch or loop body into a buffer, dropping any heap slots
    /// it saved when it ends.
    fn scoped_body(&mut self, body: &[Node]) -> Result<Vec<Op>, CompileError> {
        let depth = self.next_var;
        let mut ops = self.buffered(|e| {
            for node in body {
                e.statement(node)?;
            }
            Ok(())
        })?;
        if self.next_var > depth {
            ops.push(Op::TruncateHeap(self.next_var - depth));
            self.next_var = depth;
        }
        Ok(ops)
    }

    fn check_saved(&self, index: usize) -> Result<(), CompileError> {
        if index >= self.next_var {
            return Err(CompileError::UnknownSaved(index));
        }
        Ok(())
    }

    // ===== Statements =====

    fn statement(&mut self, node: &Node) -> Result<(), CompileError> {
        match node {
            Node::Return { value } => {
                match value {
                    Some(value) => {
                        self.value(value)?;
                        self.ops.push(Op::ReturnStackTop);
                    }
                    None => self.ops.push(Op::ReturnVoid),
                }
                Ok(())
            }
            Node::Save { value } => {
                self.value(value)?;
                self.ops.push(Op::MoveStackTopToHeap);
                self.next_var += 1;
                Ok(())
            }
            Node::Update {
                root,
                level,
                operation,
            } => self.update(root, level, operation),
            Node::If { conditionally } => self.branch_chain(conditionally),
            Node::ArrayForEach { target, body } => self.foreach(target, body),
            Node::Lock { name } => {
                self.value(name)?;
                self.ops.push(Op::Lock);
                Ok(())
            }
            Node::Release { name } => {
                self.value(name)?;
                self.ops.push(Op::Release);
                Ok(())
            }
            Node::SetStoredKey { store, key, value } => self.stored_set(store, key, value),
            Node::DeleteStoredKey { store, key } => self.stored_delete(store, key),
            Node::PushToStoredKey { store, key, values } => {
                self.stored_push(store, key, values)
            }
            Node::Push { .. } | Node::DeleteField => {
                Err(CompileError::MisplacedOperation(node.kind()))
            }
            other => Err(CompileError::ExpressionAsStatement(other.kind())),
        }
    }

    /// `If` chains join on the finally body: a matched arm falls through
    /// to it past the later arms, and a chain with no match reaches it
    /// directly.
    fn branch_chain(&mut self, segments: &[IfSegment]) -> Result<(), CompileError> {
        if !matches!(segments.first(), Some(IfSegment::Conditional { .. })) {
            return Err(CompileError::IfChainStart);
        }
        let (finally, arms) = match segments.split_last() {
            Some((IfSegment::Finally { body }, rest)) => (Some(body.as_slice()), rest),
            _ => (None, segments),
        };
        let finally_ops = match finally {
            Some(body) => {
                let ops = self.scoped_body(body)?;
                if ops.is_empty() {
                    vec![Op::Noop]
                } else {
                    ops
                }
            }
            None => vec![Op::Noop],
        };
        // Arms build back-to-front so each knows how far the join sits
        // past the end of its body.
        let mut chain: Vec<Op> = Vec::new();
        for segment in arms.iter().rev() {
            let (cond_ops, body) = match segment {
                IfSegment::Conditional { cond, body } => {
                    (self.buffered(|e| e.value(cond))?, body.as_slice())
                }
                IfSegment::Else { body } => (
                    vec![Op::Instantiate(Value::Bool(true))],
                    body.as_slice(),
                ),
                IfSegment::Finally { .. } => return Err(CompileError::FinallyNotTerminal),
            };
            let body_ops = self.scoped_body(body)?;
            let mut arm = cond_ops;
            arm.push(Op::NegatePrev);
            arm.push(Op::ConditionallySkip(body_ops.len() as u64 + 1));
            arm.extend(body_ops);
            arm.push(Op::OffsetOpCursor(chain.len() as i64));
            arm.extend(mem::take(&mut chain));
            chain = arm;
        }
        self.ops.extend(chain);
        self.ops.extend(finally_ops);
        Ok(())
    }

    /// Elements pop off the end of the array, so iteration runs newest
    /// first. The element occupies the next heap slot for the body's
    /// duration.
    fn foreach(&mut self, target: &Node, body: &[Node]) -> Result<(), CompileError> {
        self.value(target)?;
        let body_ops = self.buffered(|e| {
            let element = e.next_var;
            e.next_var += 1;
            for node in body {
                e.statement(node)?;
            }
            e.ops.push(Op::TruncateHeap(e.next_var - element));
            e.next_var = element;
            Ok(())
        })?;
        let len = body_ops.len();
        self.ops.push(Op::ArrayLen);
        self.ops.push(Op::Instantiate(Value::Int(0)));
        self.ops.push(Op::Equal);
        self.ops.push(Op::ConditionallySkip(len as u64 + 3));
        self.ops.push(Op::PopArray);
        self.ops.push(Op::MoveStackTopToHeap);
        self.ops.extend(body_ops);
        self.ops.push(Op::OffsetOpCursor(-(len as i64 + 7)));
        self.ops.push(Op::PopStack);
        Ok(())
    }

    fn update(
        &mut self,
        root: &Node,
        level: &[LevelItem],
        operation: &Node,
    ) -> Result<(), CompileError> {
        let index = match root {
            Node::Saved { index } => *index,
            _ => return Err(CompileError::BadUpdateRoot),
        };
        self.check_saved(index)?;
        let depth = level.len();
        match operation {
            Node::Push { values } => {
                if level.is_empty() {
                    for value in values {
                        self.value(value)?;
                        self.ops.push(Op::MoveStackToHeapArray(index));
                    }
                    return Ok(());
                }
                // Two copies of the path: the lower one addresses the
                // write-back, the upper one the read. Segments are pure
                // single ops, so duplicating them is sound.
                for value in values {
                    for item in level {
                        self.segment(item)?;
                    }
                    for item in level {
                        self.segment(item)?;
                    }
                    self.ops.push(Op::PushSavedField {
                        index,
                        field_depth: depth,
                    });
                    self.value(value)?;
                    self.ops.push(Op::ArrayPush);
                    self.ops.push(Op::SetSavedField {
                        index,
                        field_depth: depth,
                    });
                }
                Ok(())
            }
            Node::DeleteField => {
                if level.is_empty() {
                    return Err(CompileError::DeleteWithoutField);
                }
                for item in level {
                    self.segment(item)?;
                }
                self.ops.push(Op::DeleteSavedField {
                    index,
                    field_depth: depth,
                });
                Ok(())
            }
            value => {
                if level.is_empty() {
                    self.value(value)?;
                    self.ops.push(Op::OverwriteHeap(index));
                } else {
                    for item in level {
                        self.segment(item)?;
                    }
                    self.value(value)?;
                    self.ops.push(Op::SetSavedField {
                        index,
                        field_depth: depth,
                    });
                }
                Ok(())
            }
        }
    }

    // ===== Expressions =====

    fn value(&mut self, node: &Node) -> Result<(), CompileError> {
        match node {
            Node::None => {
                self.ops.push(Op::Instantiate(Value::None));
                Ok(())
            }
            Node::Bool { value } => {
                self.ops.push(Op::Instantiate(Value::Bool(*value)));
                Ok(())
            }
            Node::Int { value } => {
                self.ops.push(Op::Instantiate(Value::Int(*value)));
                Ok(())
            }
            Node::Double { value } => {
                self.ops.push(Op::Instantiate(Value::number(*value)));
                Ok(())
            }
            Node::String { value } => {
                self.ops.push(Op::Instantiate(Value::String(value.clone())));
                Ok(())
            }
            Node::Saved { index } => {
                self.check_saved(*index)?;
                self.ops.push(Op::CopyFromHeap(*index));
                Ok(())
            }
            Node::Object { fields } => {
                self.ops.push(Op::Instantiate(Value::Object(ValueMap::new())));
                for field in fields {
                    match &field.key {
                        Node::String { value } => self
                            .ops
                            .push(Op::Instantiate(Value::String(value.clone()))),
                        Node::Saved { index } => {
                            self.check_saved(*index)?;
                            self.ops.push(Op::CopyFromHeap(*index));
                        }
                        _ => return Err(CompileError::BadFieldKey),
                    }
                    self.value(&field.value)?;
                    self.ops.push(Op::SetField { field_depth: 1 });
                }
                Ok(())
            }
            Node::ArrayLiteral { values } => {
                self.ops.push(Op::Instantiate(Value::Array(Vec::new())));
                for value in values {
                    self.value(value)?;
                    self.ops.push(Op::ArrayPush);
                }
                Ok(())
            }
            Node::Selection { root, level } => self.selection(root, level),
            Node::FieldExists { value, field } => {
                self.value(value)?;
                self.value(field)?;
                self.ops.push(Op::FieldExists);
                Ok(())
            }
            Node::Comparison { sign, left, right } => {
                self.value(left)?;
                self.value(right)?;
                self.ops.extend_from_slice(comparison_ops(*sign));
                Ok(())
            }
            Node::BoolAlg { sign, left, right } => {
                self.value(left)?;
                self.value(right)?;
                self.ops.push(match sign {
                    BoolSign::And => Op::BoolAnd,
                    BoolSign::Or => Op::BoolOr,
                });
                Ok(())
            }
            Node::Math { sign, left, right } => {
                self.value(left)?;
                self.value(right)?;
                self.ops.push(match sign {
                    MathSign::Plus => Op::Plus,
                    MathSign::Minus => Op::NMinus,
                    MathSign::Multiply => Op::NMult,
                    MathSign::Divide => Op::NDivide,
                });
                Ok(())
            }
            Node::Call {
                function_name,
                args,
            } => {
                for arg in args {
                    self.value(arg)?;
                }
                self.ops.push(Op::Invoke {
                    name: function_name.clone(),
                    args: args.len(),
                });
                Ok(())
            }
            Node::GetStoredKey { store, key } => self.stored_get(store, key),
            Node::StoredKeyExists { store, key } => self.stored_exists(store, key),
            Node::StoredKeys { store } => {
                self.stored_keys(store);
                Ok(())
            }
            Node::GetWholeStore { store } => {
                self.whole_store(store);
                Ok(())
            }
            Node::GlobalObject { .. } => Err(CompileError::IllegalStoreUse("used as a value")),
            other => Err(CompileError::StatementAsValue(other.kind())),
        }
    }

    /// Path walks batch plain segments into one `GetField`; a `Keys`
    /// segment flushes the batch and swaps the walked value for its key
    /// array. A plain path off a saved slot reads the heap directly.
    fn selection(&mut self, root: &Node, level: &[LevelItem]) -> Result<(), CompileError> {
        if let Node::Saved { index } = root {
            let plain = !level.is_empty()
                && !level.iter().any(|item| matches!(item, LevelItem::Keys));
            if plain {
                self.check_saved(*index)?;
                for item in level {
                    self.segment(item)?;
                }
                self.ops.push(Op::PushSavedField {
                    index: *index,
                    field_depth: level.len(),
                });
                return Ok(());
            }
        }
        self.value(root)?;
        let mut pending = 0usize;
        for item in level {
            match item {
                LevelItem::Keys => {
                    if pending > 0 {
                        self.ops.push(Op::GetField {
                            field_depth: pending,
                        });
                        pending = 0;
                    }
                    self.ops.push(Op::ObjectKeys);
                }
                plain => {
                    self.segment(plain)?;
                    pending += 1;
                }
            }
        }
        if pending > 0 {
            self.ops.push(Op::GetField {
                field_depth: pending,
            });
        }
        Ok(())
    }

    /// One op per segment; the storage sequences below count on that when
    /// they compute skip distances over segment runs.
    fn segment(&mut self, item: &LevelItem) -> Result<(), CompileError> {
        match item {
            LevelItem::String { value } => {
                self.ops.push(Op::Instantiate(Value::String(value.clone())));
                Ok(())
            }
            LevelItem::Int { value } => {
                self.ops.push(Op::Instantiate(Value::Int(*value)));
                Ok(())
            }
            LevelItem::Saved { index } => {
                self.check_saved(*index)?;
                self.ops.push(Op::CopyFromHeap(*index));
                Ok(())
            }
            LevelItem::Keys => Err(CompileError::KeysNotAssignable),
        }
    }

    // ===== Store access =====
    //
    // A store holds one document per key, shaped {_key, _val}. Every
    // sequence here builds an equality filter on _key and works against
    // _val, mirroring how the documents are laid out.

    /// Push `{"_key": <segment>}`.
    fn stored_filter(&mut self, key: &LevelItem) -> Result<(), CompileError> {
        self.ops.push(Op::Instantiate(Value::Object(ValueMap::new())));
        self.ops.push(Op::Instantiate(Value::string("_key")));
        self.segment(key)?;
        self.ops.push(Op::SetField { field_depth: 1 });
        Ok(())
    }

    /// Push `{"$op": {}}`, `"$op"`, and the dot-joined `_val` path, ready
    /// for the value and a `SetField {2}`.
    fn update_doc(&mut self, operator: &str, tail: &[LevelItem]) -> Result<(), CompileError> {
        self.ops.push(Op::Instantiate(Value::object([(
            operator.to_string(),
            Value::Object(ValueMap::new()),
        )])));
        self.ops
            .push(Op::Instantiate(Value::string(operator)));
        self.ops.push(Op::Instantiate(Value::string("_val")));
        if !tail.is_empty() {
            for item in tail {
                self.segment(item)?;
            }
            self.ops.push(Op::StringConcat {
                n_strings: tail.len() + 1,
                joiner: ".".to_string(),
            });
        }
        Ok(())
    }

    /// Raise when the write found no document; otherwise drop the echoed
    /// document.
    fn raise_if_missing(&mut self, message: &str) {
        self.ops.push(Op::IsLastNone);
        self.ops.push(Op::ConditionallySkip(2));
        self.ops.push(Op::PopStack);
        self.ops.push(Op::OffsetOpCursor(1));
        self.ops.push(Op::RaiseError(message.to_string()));
    }

    fn stored_get(&mut self, store: &str, key: &[LevelItem]) -> Result<(), CompileError> {
        let (head, tail) = match key.split_first() {
            Some(parts) => parts,
            None => return Err(CompileError::EmptyStoreKey),
        };
        self.stored_filter(head)?;
        self.ops.push(Op::FindOneInStore {
            store: store.to_string(),
            projection: Value::Object(ValueMap::new()),
        });
        self.ops.push(Op::IsLastNone);
        if tail.is_empty() {
            // Missing keys read back as a plain None.
            self.ops.push(Op::ConditionallySkip(2));
            self.ops.push(Op::TryGetField("_val".to_string()));
            self.ops.push(Op::OffsetOpCursor(2));
            self.ops.push(Op::PopStack);
            self.ops.push(Op::Instantiate(Value::None));
        } else {
            // A nested read needs the document to exist.
            self.ops
                .push(Op::ConditionallySkip(tail.len() as u64 + 3));
            self.ops.push(Op::TryGetField("_val".to_string()));
            for item in tail {
                self.segment(item)?;
            }
            self.ops.push(Op::GetField {
                field_depth: tail.len(),
            });
            self.ops.push(Op::OffsetOpCursor(1));
            self.ops.push(Op::RaiseError(MISSING_KEY.to_string()));
        }
        Ok(())
    }

    fn stored_set(
        &mut self,
        store: &str,
        key: &[LevelItem],
        value: &Node,
    ) -> Result<(), CompileError> {
        let (head, tail) = match key.split_first() {
            Some(parts) => parts,
            None => return Err(CompileError::EmptyStoreKey),
        };
        self.update_doc("$set", tail)?;
        self.value(value)?;
        self.ops.push(Op::SetField { field_depth: 2 });
        self.stored_filter(head)?;
        self.ops.push(Op::UpdateOne {
            store: store.to_string(),
            upsert: tail.is_empty(),
        });
        if tail.is_empty() {
            self.ops.push(Op::PopStack);
        } else {
            self.raise_if_missing(MISSING_NESTED);
        }
        Ok(())
    }

    fn stored_delete(&mut self, store: &str, key: &[LevelItem]) -> Result<(), CompileError> {
        let (head, tail) = match key.split_first() {
            Some(parts) => parts,
            None => return Err(CompileError::EmptyStoreKey),
        };
        if tail.is_empty() {
            self.stored_filter(head)?;
            self.ops.push(Op::DeleteOneInStore {
                store: store.to_string(),
            });
            self.ops.push(Op::PopStack);
        } else {
            // Deep deletes tolerate an absent document, like field_delete
            // tolerates an absent field.
            self.update_doc("$unset", tail)?;
            self.ops.push(Op::Instantiate(Value::string("")));
            self.ops.push(Op::SetField { field_depth: 2 });
            self.stored_filter(head)?;
            self.ops.push(Op::UpdateOne {
                store: store.to_string(),
                upsert: false,
            });
            self.ops.push(Op::PopStack);
        }
        Ok(())
    }

    fn stored_push(
        &mut self,
        store: &str,
        key: &[LevelItem],
        values: &[Node],
    ) -> Result<(), CompileError> {
        let (head, tail) = match key.split_first() {
            Some(parts) => parts,
            None => return Err(CompileError::EmptyStoreKey),
        };
        for value in values {
            self.update_doc("$push", tail)?;
            self.value(value)?;
            self.ops.push(Op::SetField { field_depth: 2 });
            self.stored_filter(head)?;
            self.ops.push(Op::UpdateOne {
                store: store.to_string(),
                upsert: false,
            });
            self.raise_if_missing(MISSING_KEY);
        }
        Ok(())
    }

    fn stored_exists(&mut self, store: &str, key: &Node) -> Result<(), CompileError> {
        self.ops.push(Op::Instantiate(Value::Object(ValueMap::new())));
        self.ops.push(Op::Instantiate(Value::string("_key")));
        self.value(key)?;
        self.ops.push(Op::SetField { field_depth: 1 });
        self.ops.push(Op::FindOneInStore {
            store: store.to_string(),
            projection: suppress_val(),
        });
        self.ops.push(Op::IsLastNone);
        self.ops.push(Op::ConditionallySkip(3));
        self.ops.push(Op::PopStack);
        self.ops.push(Op::Instantiate(Value::Bool(true)));
        self.ops.push(Op::OffsetOpCursor(2));
        self.ops.push(Op::PopStack);
        self.ops.push(Op::Instantiate(Value::Bool(false)));
        Ok(())
    }

    /// Query every `_key`, then drain the result array into a heap-held
    /// accumulator. The temp slot lives only inside this expression.
    fn stored_keys(&mut self, store: &str) {
        let slot = self.next_var;
        self.ops.push(Op::Instantiate(Value::Array(Vec::new())));
        self.ops.push(Op::MoveStackTopToHeap);
        self.ops.push(Op::Instantiate(Value::Object(ValueMap::new())));
        self.ops.push(Op::QueryStore {
            store: store.to_string(),
            projection: suppress_val(),
        });
        self.ops.push(Op::ArrayLen);
        self.ops.push(Op::Instantiate(Value::Int(0)));
        self.ops.push(Op::Equal);
        self.ops.push(Op::ConditionallySkip(4));
        self.ops.push(Op::PopArray);
        self.ops.push(Op::TryGetField("_key".to_string()));
        self.ops.push(Op::MoveStackToHeapArray(slot));
        self.ops.push(Op::OffsetOpCursor(-8));
        self.ops.push(Op::PopStack);
        self.ops.push(Op::CopyFromHeap(slot));
        self.ops.push(Op::TruncateHeap(1));
    }

    /// Assemble the full store into one object, key by key. Uses two temp
    /// slots: the accumulator and the document being unpacked.
    fn whole_store(&mut self, store: &str) {
        let result = self.next_var;
        self.ops.push(Op::Instantiate(Value::Object(ValueMap::new())));
        self.ops.push(Op::MoveStackTopToHeap);
        self.ops.push(Op::Instantiate(Value::Object(ValueMap::new())));
        self.ops.push(Op::QueryStore {
            store: store.to_string(),
            projection: Value::Object(ValueMap::new()),
        });
        self.ops.push(Op::ArrayLen);
        self.ops.push(Op::Instantiate(Value::Int(0)));
        self.ops.push(Op::Equal);
        self.ops.push(Op::ConditionallySkip(10));
        self.ops.push(Op::PopArray);
        self.ops.push(Op::MoveStackTopToHeap);
        self.ops.push(Op::CopyFromHeap(result + 1));
        self.ops.push(Op::TryGetField("_key".to_string()));
        // Numeric keys render to text so they can key the object.
        self.ops.push(Op::StringConcat {
            n_strings: 1,
            joiner: String::new(),
        });
        self.ops.push(Op::CopyFromHeap(result + 1));
        self.ops.push(Op::TryGetField("_val".to_string()));
        self.ops.push(Op::SetSavedField {
            index: result,
            field_depth: 1,
        });
        self.ops.push(Op::TruncateHeap(1));
        self.ops.push(Op::OffsetOpCursor(-14));
        self.ops.push(Op::PopStack);
        self.ops.push(Op::CopyFromHeap(result));
        self.ops.push(Op::TruncateHeap(1));
    }
}

fn comparison_ops(sign: ComparisonSign) -> &'static [Op] {
    match sign {
        ComparisonSign::Equal => &[Op::Equal],
        ComparisonSign::NotEqual => &[Op::Equal, Op::NegatePrev],
        ComparisonSign::Less => &[Op::Less],
        ComparisonSign::Greater => &[Op::LessEq, Op::NegatePrev],
        ComparisonSign::LessEq => &[Op::LessEq],
        ComparisonSign::GreaterEq => &[Op::Less, Op::NegatePrev],
    }
}

fn suppress_val() -> Value {
    Value::object([("_val".to_string(), Value::Bool(false))])
}
