//! Per-frame execution state
//!
//! Each procedure activation gets its own [`Context`]: an operand stack, a
//! heap of saved slots (inputs first, locals after), an instruction cursor
//! and the list of lock names the frame has acquired and not yet released.
//! The op sequence itself lives outside the frame so that stepping can
//! borrow an op and mutate the frame at the same time.

use crate::error::{VmError, VmResult};
use crate::value::{Value, ValueMap};

/// Execution state for one procedure activation.
#[derive(Debug)]
pub struct Context {
    /// Instruction cursor into the frame's op sequence
    pub(crate) ip: usize,
    /// Saved slots: inputs occupy the lowest indices, locals follow
    heap: Vec<Value>,
    /// Operand stack
    stack: Vec<Value>,
    /// Names of locks this frame holds, in acquisition order
    locks: Vec<String>,
}

impl Context {
    /// Create a frame whose heap is seeded with the invocation arguments.
    pub fn new(args: Vec<Value>) -> Self {
        Context {
            ip: 0,
            heap: args,
            stack: Vec::new(),
            locks: Vec::new(),
        }
    }

    // ===== Operand stack =====

    /// Push onto the operand stack.
    #[inline]
    pub fn push(&mut self, value: Value) {
        self.stack.push(value);
    }

    /// Pop the newest operand.
    #[inline]
    pub fn pop(&mut self) -> VmResult<Value> {
        self.stack.pop().ok_or(VmError::StackUnderflow)
    }

    /// Borrow the newest operand.
    #[inline]
    pub fn peek(&self) -> VmResult<&Value> {
        self.stack.last().ok_or(VmError::StackUnderflow)
    }

    /// Mutably borrow the newest operand.
    #[inline]
    pub fn peek_mut(&mut self) -> VmResult<&mut Value> {
        self.stack.last_mut().ok_or(VmError::StackUnderflow)
    }

    /// Pop a value that must be a boolean.
    pub fn pop_bool(&mut self) -> VmResult<bool> {
        let value = self.pop()?;
        value
            .as_bool()
            .ok_or_else(|| VmError::type_mismatch("bool", &value))
    }

    /// Pop a value that must be a string.
    pub fn pop_string(&mut self) -> VmResult<String> {
        match self.pop()? {
            Value::String(s) => Ok(s),
            other => Err(VmError::type_mismatch("string", &other)),
        }
    }

    /// Pop a value that must be an array.
    pub fn pop_array(&mut self) -> VmResult<Vec<Value>> {
        match self.pop()? {
            Value::Array(items) => Ok(items),
            other => Err(VmError::type_mismatch("array", &other)),
        }
    }

    /// Pop a value that must be an object.
    pub fn pop_object(&mut self) -> VmResult<ValueMap> {
        match self.pop()? {
            Value::Object(fields) => Ok(fields),
            other => Err(VmError::type_mismatch("object", &other)),
        }
    }

    /// Pop `n` values, kept in push order: the oldest of the `n` comes
    /// first.
    pub fn pop_many(&mut self, n: usize) -> VmResult<Vec<Value>> {
        if self.stack.len() < n {
            return Err(VmError::StackUnderflow);
        }
        Ok(self.stack.split_off(self.stack.len() - n))
    }

    // ===== Heap =====

    /// Number of saved slots.
    #[inline]
    pub fn heap_len(&self) -> usize {
        self.heap.len()
    }

    /// Borrow a saved slot.
    pub fn heap_get(&self, index: usize) -> VmResult<&Value> {
        self.heap.get(index).ok_or(VmError::HeapSlotMissing(index))
    }

    /// Mutably borrow a saved slot.
    pub fn heap_get_mut(&mut self, index: usize) -> VmResult<&mut Value> {
        self.heap
            .get_mut(index)
            .ok_or(VmError::HeapSlotMissing(index))
    }

    /// Overwrite a saved slot.
    pub fn heap_set(&mut self, index: usize, value: Value) -> VmResult<()> {
        *self.heap_get_mut(index)? = value;
        Ok(())
    }

    /// Append a fresh saved slot.
    #[inline]
    pub fn heap_push(&mut self, value: Value) {
        self.heap.push(value);
    }

    /// Drop the `n` newest heap slots.
    pub fn heap_truncate(&mut self, n: usize) -> VmResult<()> {
        if n > self.heap.len() {
            return Err(VmError::HeapUnderflow);
        }
        let keep = self.heap.len() - n;
        self.heap.truncate(keep);
        Ok(())
    }

    // ===== Held locks =====

    /// Record a lock acquired by this frame.
    pub fn record_lock(&mut self, name: String) {
        self.locks.push(name);
    }

    /// Forget a lock the frame released explicitly.
    pub fn forget_lock(&mut self, name: &str) {
        if let Some(pos) = self.locks.iter().rposition(|held| held == name) {
            self.locks.remove(pos);
        }
    }

    /// Take the held lock names, newest first.
    pub fn drain_locks(&mut self) -> Vec<String> {
        let mut names: Vec<String> = self.locks.drain(..).collect();
        names.reverse();
        names
    }
}
