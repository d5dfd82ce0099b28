//! Single-step op execution.
//!
//! [`step`] interprets one [`Op`] against the current frame and reports what
//! the frame loop should do next. Handlers never see other frames; anything
//! that crosses a frame boundary is expressed through [`ControlFlow`], and
//! faults come back as errors for the loop to unwind.

use std::sync::Arc;

use crate::error::{SignError, VmError, VmResult};
use crate::op::Op;
use crate::roles;
use crate::value::{Numeric, Value, ValueMap};
use crate::vm::context::Context;
use crate::vm::Globals;

/// What the frame loop should do after one op.
#[derive(Debug)]
pub enum ControlFlow {
    /// Advance to the following op
    Continue,
    /// Move the cursor to an absolute position
    Jump(usize),
    /// Finish the frame with a value
    Return(Value),
    /// Run another procedure in a child frame, pushing its result here
    Invoke {
        /// Op sequence of the callee
        ops: Arc<Vec<Op>>,
        /// Values seeding the child heap
        args: Vec<Value>,
    },
}

/// Execute one op against the frame.
pub(crate) fn step(op: &Op, ctx: &mut Context, globals: &Globals) -> VmResult<ControlFlow> {
    match op {
        // ===== Stack & Heap =====
        Op::Noop => Ok(ControlFlow::Continue),
        Op::Instantiate(value) => {
            ctx.push(value.clone());
            Ok(ControlFlow::Continue)
        }
        Op::PopStack => {
            ctx.pop()?;
            Ok(ControlFlow::Continue)
        }
        Op::ToBool => {
            let present = !ctx.peek()?.is_none();
            ctx.push(Value::Bool(present));
            Ok(ControlFlow::Continue)
        }
        Op::IsLastNone => {
            let none = ctx.peek()?.is_none();
            ctx.push(Value::Bool(none));
            Ok(ControlFlow::Continue)
        }
        Op::CopyFromHeap(index) => {
            let value = ctx.heap_get(*index)?.clone();
            ctx.push(value);
            Ok(ControlFlow::Continue)
        }
        Op::MoveStackTopToHeap => {
            let value = ctx.pop()?;
            ctx.heap_push(value);
            Ok(ControlFlow::Continue)
        }
        Op::OverwriteHeap(index) => {
            let value = ctx.pop()?;
            ctx.heap_set(*index, value)?;
            Ok(ControlFlow::Continue)
        }
        Op::TruncateHeap(n) => {
            ctx.heap_truncate(*n)?;
            Ok(ControlFlow::Continue)
        }
        Op::MoveStackToHeapArray(index) => {
            let value = ctx.pop()?;
            match ctx.heap_get_mut(*index)? {
                Value::Array(items) => items.push(value),
                other => return Err(VmError::type_mismatch("array", other)),
            }
            Ok(ControlFlow::Continue)
        }
        Op::AssertHeapLen(n) => {
            if ctx.heap_len() != *n {
                return Err(VmError::HeapLenMismatch {
                    expected: *n,
                    found: ctx.heap_len(),
                });
            }
            Ok(ControlFlow::Continue)
        }
        Op::FlattenArray => {
            let mut items = ctx.pop_array()?;
            items.reverse();
            for item in items {
                ctx.push(item);
            }
            Ok(ControlFlow::Continue)
        }
        Op::PopArray => {
            let element = match ctx.peek_mut()? {
                Value::Array(items) => items.pop().unwrap_or(Value::None),
                other => return Err(VmError::type_mismatch("array", other)),
            };
            ctx.push(element);
            Ok(ControlFlow::Continue)
        }

        // ===== Structural =====
        Op::ArrayPush => {
            let value = ctx.pop()?;
            match ctx.peek_mut()? {
                Value::Array(items) => items.push(value),
                other => return Err(VmError::type_mismatch("array", other)),
            }
            Ok(ControlFlow::Continue)
        }
        Op::ArrayLen => {
            let len = match ctx.peek()? {
                Value::Array(items) => items.len() as i64,
                other => return Err(VmError::type_mismatch("array", other)),
            };
            ctx.push(Value::Int(len));
            Ok(ControlFlow::Continue)
        }
        Op::StringConcat { n_strings, joiner } => {
            let mut parts = Vec::with_capacity(*n_strings);
            for _ in 0..*n_strings {
                let value = ctx.pop()?;
                parts.push(text_operand(&value)?);
            }
            parts.reverse();
            ctx.push(Value::String(parts.join(joiner)));
            Ok(ControlFlow::Continue)
        }
        Op::ExtractFields(paths) => {
            let object = ctx.pop()?;
            for path in paths {
                let mut cursor = &object;
                for key in path {
                    cursor = match cursor {
                        Value::Object(fields) => fields
                            .get(key)
                            .ok_or_else(|| VmError::MissingField(key.clone()))?,
                        other => return Err(VmError::type_mismatch("object", other)),
                    };
                }
                ctx.push(cursor.clone());
            }
            Ok(ControlFlow::Continue)
        }
        Op::GetField { field_depth } => {
            let segments = ctx.pop_many(*field_depth)?;
            let target = ctx.pop()?;
            let value = field_get(&target, &segments)?;
            ctx.push(value);
            Ok(ControlFlow::Continue)
        }
        Op::SetField { field_depth } => {
            let value = ctx.pop()?;
            let segments = ctx.pop_many(*field_depth)?;
            let mut target = ctx.pop()?;
            field_set(&mut target, &segments, value)?;
            ctx.push(target);
            Ok(ControlFlow::Continue)
        }
        Op::DeleteField { field_depth } => {
            let segments = ctx.pop_many(*field_depth)?;
            let mut target = ctx.pop()?;
            field_delete(&mut target, &segments)?;
            ctx.push(target);
            Ok(ControlFlow::Continue)
        }
        Op::PushSavedField { index, field_depth } => {
            let segments = ctx.pop_many(*field_depth)?;
            let value = field_get(ctx.heap_get(*index)?, &segments)?;
            ctx.push(value);
            Ok(ControlFlow::Continue)
        }
        Op::SetSavedField { index, field_depth } => {
            let value = ctx.pop()?;
            let segments = ctx.pop_many(*field_depth)?;
            field_set(ctx.heap_get_mut(*index)?, &segments, value)?;
            Ok(ControlFlow::Continue)
        }
        Op::DeleteSavedField { index, field_depth } => {
            let segments = ctx.pop_many(*field_depth)?;
            field_delete(ctx.heap_get_mut(*index)?, &segments)?;
            Ok(ControlFlow::Continue)
        }
        Op::TryGetField(name) => {
            let value = match ctx.pop()? {
                Value::Object(mut fields) => fields.remove(name).unwrap_or(Value::None),
                _ => Value::None,
            };
            ctx.push(value);
            Ok(ControlFlow::Continue)
        }
        Op::FieldExists => {
            let field = ctx.pop_string()?;
            let object = ctx.pop_object()?;
            ctx.push(Value::Bool(object.contains_key(&field)));
            Ok(ControlFlow::Continue)
        }
        Op::AssignPreviousToField(name) => {
            let value = ctx.pop()?;
            match ctx.peek_mut()? {
                Value::Object(fields) => {
                    fields.insert(name.clone(), value);
                }
                other => return Err(VmError::type_mismatch("object", other)),
            }
            Ok(ControlFlow::Continue)
        }
        Op::ObjectKeys => {
            let fields = ctx.pop_object()?;
            let keys = fields.into_keys().map(Value::String).collect();
            ctx.push(Value::Array(keys));
            Ok(ControlFlow::Continue)
        }

        // ===== Control Flow =====
        Op::OffsetOpCursor(delta) => jump_relative(ctx.ip, *delta),
        Op::ConditionallySkip(n) => {
            if ctx.pop_bool()? {
                let target = ctx.ip.saturating_add(1).saturating_add(*n as usize);
                Ok(ControlFlow::Jump(target))
            } else {
                Ok(ControlFlow::Continue)
            }
        }
        Op::NegatePrev => {
            let value = ctx.pop_bool()?;
            ctx.push(Value::Bool(!value));
            Ok(ControlFlow::Continue)
        }

        // ===== Arithmetic, Comparison, Boolean =====
        Op::Plus => {
            let right = ctx.pop()?;
            let left = ctx.pop()?;
            ctx.push(plus(left, right)?);
            Ok(ControlFlow::Continue)
        }
        Op::NMinus => {
            let (a, b) = pop_numeric_pair(ctx)?;
            ctx.push(numeric_binary(a, b, i64::checked_sub, |x, y| x - y));
            Ok(ControlFlow::Continue)
        }
        Op::NMult => {
            let (a, b) = pop_numeric_pair(ctx)?;
            ctx.push(numeric_binary(a, b, i64::checked_mul, |x, y| x * y));
            Ok(ControlFlow::Continue)
        }
        Op::NDivide => {
            let (a, b) = pop_numeric_pair(ctx)?;
            let zero = match b {
                Numeric::Int(i) => i == 0,
                Numeric::Double(d) => d == 0.0,
            };
            if zero {
                return Err(VmError::DivisionByZero);
            }
            ctx.push(numeric_binary(a, b, i64::checked_div, |x, y| x / y));
            Ok(ControlFlow::Continue)
        }
        Op::Less => {
            let right = ctx.pop()?;
            let left = ctx.pop()?;
            let outcome = match (left.as_numeric(), right.as_numeric()) {
                (Some(a), Some(b)) => numeric_less(a, b),
                _ => false,
            };
            ctx.push(Value::Bool(outcome));
            Ok(ControlFlow::Continue)
        }
        Op::LessEq => {
            let right = ctx.pop()?;
            let left = ctx.pop()?;
            let outcome = match (left.as_numeric(), right.as_numeric()) {
                (Some(a), Some(b)) => !numeric_less(b, a),
                _ => false,
            };
            ctx.push(Value::Bool(outcome));
            Ok(ControlFlow::Continue)
        }
        Op::Equal => {
            let right = ctx.pop()?;
            let left = ctx.pop()?;
            ctx.push(Value::Bool(left == right));
            Ok(ControlFlow::Continue)
        }
        Op::BoolAnd => {
            let right = ctx.pop_bool()?;
            let left = ctx.pop_bool()?;
            ctx.push(Value::Bool(left && right));
            Ok(ControlFlow::Continue)
        }
        Op::BoolOr => {
            let right = ctx.pop_bool()?;
            let left = ctx.pop_bool()?;
            ctx.push(Value::Bool(left || right));
            Ok(ControlFlow::Continue)
        }

        // ===== Storage =====
        Op::InsertFromHeap { index, store } => {
            let value = ctx.heap_get(*index)?.clone();
            globals.storage().append(store, value)?;
            Ok(ControlFlow::Continue)
        }
        Op::InsertFromStack { store } => {
            let value = ctx.pop()?;
            globals.storage().append(store, value)?;
            Ok(ControlFlow::Continue)
        }
        Op::GetAllFromStore { store } => {
            let everything = Value::Object(ValueMap::new());
            let docs = globals.storage().query(store, &everything, &everything)?;
            ctx.push(Value::Array(docs));
            Ok(ControlFlow::Continue)
        }
        Op::QueryStore { store, projection } => {
            let filter = ctx.pop()?;
            let docs = globals.storage().query(store, &filter, projection)?;
            ctx.push(Value::Array(docs));
            Ok(ControlFlow::Continue)
        }
        Op::FindOneInStore { store, projection } => {
            let filter = ctx.pop()?;
            let doc = globals.storage().find_one(store, &filter, projection)?;
            ctx.push(doc.unwrap_or(Value::None));
            Ok(ControlFlow::Continue)
        }
        Op::DeleteOneInStore { store } => {
            let filter = ctx.pop()?;
            let removed = globals.storage().delete_one(store, &filter)?;
            ctx.push(Value::Bool(removed));
            Ok(ControlFlow::Continue)
        }
        Op::UpdateOne { store, upsert } => {
            let filter = ctx.pop()?;
            let update = ctx.pop()?;
            let doc = globals
                .storage()
                .update_one(store, &filter, &update, *upsert)?;
            ctx.push(doc.unwrap_or(Value::None));
            Ok(ControlFlow::Continue)
        }
        Op::ReplaceOne { store, upsert } => {
            let filter = ctx.pop()?;
            let replacement = ctx.pop()?;
            let written = globals
                .storage()
                .replace_one(store, &filter, &replacement, *upsert)?;
            ctx.push(Value::Bool(written));
            Ok(ControlFlow::Continue)
        }
        Op::StoreLen { store } => {
            let filter = ctx.pop()?;
            let count = globals.storage().measure(store, &filter)?;
            ctx.push(Value::Int(count));
            Ok(ControlFlow::Continue)
        }

        // ===== Control & Identity =====
        Op::Invoke { name, args } => {
            let procedure = globals
                .procedure(name)
                .ok_or_else(|| VmError::UnknownProcedure(name.clone()))?;
            let ops = procedure.ops.clone();
            let arguments = ctx.pop_many(*args)?;
            Ok(ControlFlow::Invoke {
                ops,
                args: arguments,
            })
        }
        Op::ReturnVariable(index) => Ok(ControlFlow::Return(ctx.heap_get(*index)?.clone())),
        Op::ReturnStackTop => Ok(ControlFlow::Return(ctx.pop()?)),
        Op::ReturnVoid => Ok(ControlFlow::Return(Value::None)),
        Op::RaiseError(message) => Err(VmError::Raised(message.clone())),

        // ===== Resources =====
        Op::Lock => {
            let name = ctx.pop_string()?;
            globals.locks().acquire(&name)?;
            ctx.record_lock(name);
            Ok(ControlFlow::Continue)
        }
        Op::Release => {
            let name = ctx.pop_string()?;
            if let Err(error) = globals.locks().release(&name) {
                tracing::warn!(lock = %name, %error, "release failed");
            }
            ctx.forget_lock(&name);
            Ok(ControlFlow::Continue)
        }
        Op::SignRole => {
            let claim = ctx.pop()?;
            let keypair = globals
                .keypair()
                .ok_or(VmError::Sign(SignError::MissingKeypair))?;
            let signed = roles::sign_claim(keypair, claim)?;
            ctx.push(signed);
            Ok(ControlFlow::Continue)
        }
        Op::GetType => {
            let value = ctx.pop()?;
            ctx.push(Value::string(value.type_name()));
            Ok(ControlFlow::Continue)
        }

        // ===== Schema Checks =====
        Op::EnforceSchemaOnHeap { heap_pos, name } => {
            let schema = globals
                .schemas()
                .resolve(name)
                .ok_or_else(|| VmError::UnknownSchema(name.clone()))?;
            let ok = globals.schemas().adheres(ctx.heap_get(*heap_pos)?, schema);
            ctx.push(Value::Bool(ok));
            Ok(ControlFlow::Continue)
        }
        Op::EnforceSchemaInstanceOnHeap { heap_pos, schema } => {
            let ok = globals.schemas().adheres(ctx.heap_get(*heap_pos)?, schema);
            ctx.push(Value::Bool(ok));
            Ok(ControlFlow::Continue)
        }
    }
}

fn jump_relative(ip: usize, delta: i64) -> VmResult<ControlFlow> {
    let target = ip as i64 + 1 + delta;
    match usize::try_from(target) {
        Ok(t) => Ok(ControlFlow::Jump(t)),
        Err(_) => Err(VmError::InvalidJump(target)),
    }
}

// ===== Field paths =====
//
// A path segment is a string (object key) or an int (array index).
// Intermediate segments must resolve; only a missing final object key reads
// back as None.

fn step_into<'a>(value: &'a Value, segment: &Value) -> VmResult<&'a Value> {
    match (value, segment) {
        (Value::Object(fields), Value::String(key)) => fields
            .get(key)
            .ok_or_else(|| VmError::MissingField(key.clone())),
        (Value::Array(items), Value::Int(index)) => array_get(items, *index),
        (Value::Object(_), seg) => Err(VmError::type_mismatch("string", seg)),
        (Value::Array(_), seg) => Err(VmError::type_mismatch("int", seg)),
        (other, _) => Err(VmError::type_mismatch("object or array", other)),
    }
}

fn step_into_mut<'a>(value: &'a mut Value, segment: &Value) -> VmResult<&'a mut Value> {
    match (value, segment) {
        (Value::Object(fields), Value::String(key)) => fields
            .get_mut(key)
            .ok_or_else(|| VmError::MissingField(key.clone())),
        (Value::Array(items), Value::Int(index)) => {
            let len = items.len();
            usize::try_from(*index)
                .ok()
                .and_then(|i| items.get_mut(i))
                .ok_or(VmError::IndexOutOfRange {
                    index: *index,
                    len,
                })
        }
        (Value::Object(_), seg) => Err(VmError::type_mismatch("string", seg)),
        (Value::Array(_), seg) => Err(VmError::type_mismatch("int", seg)),
        (other, _) => Err(VmError::type_mismatch("object or array", other)),
    }
}

fn array_get(items: &[Value], index: i64) -> VmResult<&Value> {
    usize::try_from(index)
        .ok()
        .and_then(|i| items.get(i))
        .ok_or(VmError::IndexOutOfRange {
            index,
            len: items.len(),
        })
}

fn field_get(target: &Value, segments: &[Value]) -> VmResult<Value> {
    let (last, outer) = match segments.split_last() {
        Some(parts) => parts,
        None => return Ok(target.clone()),
    };
    let mut cursor = target;
    for segment in outer {
        cursor = step_into(cursor, segment)?;
    }
    match (cursor, last) {
        (Value::Object(fields), Value::String(key)) => {
            Ok(fields.get(key).cloned().unwrap_or(Value::None))
        }
        (Value::Array(items), Value::Int(index)) => Ok(array_get(items, *index)?.clone()),
        (Value::Object(_), seg) => Err(VmError::type_mismatch("string", seg)),
        (Value::Array(_), seg) => Err(VmError::type_mismatch("int", seg)),
        (other, _) => Err(VmError::type_mismatch("object or array", other)),
    }
}

fn field_set(target: &mut Value, segments: &[Value], value: Value) -> VmResult<()> {
    let (last, outer) = match segments.split_last() {
        Some(parts) => parts,
        None => {
            *target = value;
            return Ok(());
        }
    };
    let mut parent = target;
    for segment in outer {
        parent = step_into_mut(parent, segment)?;
    }
    match (parent, last) {
        (Value::Object(fields), Value::String(key)) => {
            fields.insert(key.clone(), value);
            Ok(())
        }
        (Value::Array(items), Value::Int(index)) => {
            let len = items.len();
            match usize::try_from(*index).ok().filter(|i| *i <= len) {
                Some(i) if i == len => items.push(value),
                Some(i) => items[i] = value,
                None => {
                    return Err(VmError::IndexOutOfRange {
                        index: *index,
                        len,
                    })
                }
            }
            Ok(())
        }
        (Value::Object(_), seg) => Err(VmError::type_mismatch("string", seg)),
        (Value::Array(_), seg) => Err(VmError::type_mismatch("int", seg)),
        (other, _) => Err(VmError::type_mismatch("object or array", other)),
    }
}

fn field_delete(target: &mut Value, segments: &[Value]) -> VmResult<()> {
    let (last, outer) = match segments.split_last() {
        Some(parts) => parts,
        None => return Ok(()),
    };
    let mut parent = target;
    for segment in outer {
        parent = step_into_mut(parent, segment)?;
    }
    match (parent, last) {
        (Value::Object(fields), Value::String(key)) => {
            fields.remove(key);
            Ok(())
        }
        (Value::Array(items), Value::Int(index)) => {
            if let Ok(i) = usize::try_from(*index) {
                if i < items.len() {
                    items.remove(i);
                }
            }
            Ok(())
        }
        (Value::Object(_), seg) => Err(VmError::type_mismatch("string", seg)),
        (Value::Array(_), seg) => Err(VmError::type_mismatch("int", seg)),
        (other, _) => Err(VmError::type_mismatch("object or array", other)),
    }
}

// ===== Numerics =====

fn pop_numeric_pair(ctx: &mut Context) -> VmResult<(Numeric, Numeric)> {
    let right = ctx.pop()?;
    let left = ctx.pop()?;
    let a = left
        .as_numeric()
        .ok_or_else(|| VmError::type_mismatch("number", &left))?;
    let b = right
        .as_numeric()
        .ok_or_else(|| VmError::type_mismatch("number", &right))?;
    Ok((a, b))
}

/// Int stays Int when both sides are Int and the result fits; any double
/// operand, or an overflowing Int result, widens to Double.
fn numeric_binary(
    a: Numeric,
    b: Numeric,
    int_op: fn(i64, i64) -> Option<i64>,
    double_op: fn(f64, f64) -> f64,
) -> Value {
    match (a, b) {
        (Numeric::Int(x), Numeric::Int(y)) => match int_op(x, y) {
            Some(out) => Value::Int(out),
            None => Value::Double(double_op(x as f64, y as f64)),
        },
        _ => Value::Double(double_op(a.widen(), b.widen())),
    }
}

fn numeric_less(a: Numeric, b: Numeric) -> bool {
    match (a, b) {
        (Numeric::Int(x), Numeric::Int(y)) => x < y,
        _ => a.widen() < b.widen(),
    }
}

fn plus(left: Value, right: Value) -> VmResult<Value> {
    match (left, right) {
        (Value::String(mut l), r) => {
            l.push_str(&text_operand(&r)?);
            Ok(Value::String(l))
        }
        (l, Value::String(r)) => {
            let mut s = text_operand(&l)?;
            s.push_str(&r);
            Ok(Value::String(s))
        }
        (l, r) => {
            let a = l
                .as_numeric()
                .ok_or_else(|| VmError::type_mismatch("string or number", &l))?;
            let b = r
                .as_numeric()
                .ok_or_else(|| VmError::type_mismatch("string or number", &r))?;
            Ok(numeric_binary(a, b, i64::checked_add, |x, y| x + y))
        }
    }
}

fn text_operand(value: &Value) -> VmResult<String> {
    match value.as_numeric() {
        Some(n) => Ok(n.render()),
        None => match value {
            Value::String(s) => Ok(s.clone()),
            other => Err(VmError::type_mismatch("string or number", other)),
        },
    }
}
