//! Kernel error types.
//!
//! Faults are split by concern: [`VmError`] aborts a whole request,
//! [`SchemaError`] rejects a malformed schema before it is ever used,
//! [`StorageError`] and [`LockError`] surface backend failures, and
//! [`SignError`] covers role-claim signing. Schema *mismatches* are not
//! errors at all; they are boolean values programs branch on.

use crate::value::Value;

/// Errors that abort an executing request.
///
/// Any of these unwinds the entire frame chain, releasing every held lock
/// along the way. There is no in-language catch construct.
#[derive(Debug, thiserror::Error)]
pub enum VmError {
    /// Pop on an empty evaluation stack
    #[error("stack underflow")]
    StackUnderflow,

    /// Heap slot index past the end of the current frame's heap
    #[error("no heap slot at index {0}")]
    HeapSlotMissing(usize),

    /// An op found a value of the wrong shape
    #[error("type mismatch: expected {expected}, found {found}")]
    TypeMismatch {
        /// Type name the op required
        expected: &'static str,
        /// Type name of the value found
        found: &'static str,
    },

    /// Array index outside the array's bounds
    #[error("index {index} out of range for array of length {len}")]
    IndexOutOfRange {
        /// Index asked for
        index: i64,
        /// Length of the indexed array
        len: usize,
    },

    /// Field access that walked through a missing intermediate
    #[error("no field {0:?} on the walked value")]
    MissingField(String),

    /// Declared input arity differs from what was passed
    #[error("unexpected heap length: expected {expected}, found {found}")]
    HeapLenMismatch {
        /// Slots the procedure declared
        expected: usize,
        /// Slots actually present
        found: usize,
    },

    /// Truncation of more heap slots than the frame holds
    #[error("heap underflow")]
    HeapUnderflow,

    /// Invoke nesting past the frame ceiling
    #[error("call depth exceeded")]
    CallDepthExceeded,

    /// Jump target outside the op sequence
    #[error("jump to op {0} is out of bounds")]
    InvalidJump(i64),

    /// Numeric division with a zero divisor
    #[error("division by zero")]
    DivisionByZero,

    /// Invocation of a name that is not a public procedure
    #[error("unknown procedure {0:?}")]
    UnknownProcedure(String),

    /// Schema name not present in the registry
    #[error("unknown schema {0:?}")]
    UnknownSchema(String),

    /// Raised by the program itself via the raise op
    #[error("{0}")]
    Raised(String),

    /// Storage backend failure
    #[error("storage: {0}")]
    Storage(#[from] StorageError),

    /// Lock manager failure during acquisition
    #[error("lock: {0}")]
    Lock(#[from] LockError),

    /// Role signing failure
    #[error("sign: {0}")]
    Sign(#[from] SignError),
}

impl VmError {
    /// Shorthand for the pervasive wrong-shape fault.
    pub fn type_mismatch(expected: &'static str, found: &Value) -> Self {
        VmError::TypeMismatch {
            expected,
            found: found.type_name(),
        }
    }
}

/// Kernel result alias.
pub type VmResult<T> = Result<T, VmError>;

/// Errors detected while constructing schemas or a schema registry.
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum SchemaError {
    /// `Optional(Optional(_))` collapses to the same set of values and is
    /// rejected rather than silently flattened
    #[error("optional schemas may not be directly nested")]
    NestedOptional,

    /// Alias referencing a name the registry does not define
    #[error("schema alias {0:?} is not defined")]
    UnknownAlias(String),

    /// Alias cycle with no intervening Object/Array/Map wrapper; adherence
    /// over such a schema would never terminate
    #[error("schema alias {0:?} recurses without a guarding container")]
    UnguardedAliasCycle(String),
}

/// Errors surfaced by a storage engine.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Filters must be objects
    #[error("filter must be an object, found {0}")]
    InvalidFilter(&'static str),

    /// Update document with a key that is not `$set`/`$unset`/`$push`
    #[error("unsupported update document: {0}")]
    InvalidUpdate(String),

    /// Dotted path that walks through a non-container value
    #[error("path {0:?} traverses a non-container value")]
    PathThroughNonContainer(String),

    /// Anything an external engine wants to report
    #[error("{0}")]
    Engine(String),
}

/// Errors surfaced by a lock manager.
#[derive(Debug, thiserror::Error)]
pub enum LockError {
    /// Release of a lock the caller does not hold
    #[error("lock {0:?} is not held")]
    NotHeld(String),

    /// Anything an external manager wants to report
    #[error("{0}")]
    Backend(String),
}

/// Errors surfaced while signing a role claim.
#[derive(Debug, thiserror::Error)]
pub enum SignError {
    /// Signing requested but no keypair is configured
    #[error("no signing keypair configured")]
    MissingKeypair,

    /// Claims must be objects
    #[error("role claim must be an object, found {0}")]
    NotAnObject(&'static str),

    /// Claims must carry a string `_name`
    #[error("role claim is missing a string _name field")]
    MissingName,
}
