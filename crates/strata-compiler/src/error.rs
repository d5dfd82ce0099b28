//! Compile-time failures.
//!
//! Every variant blocks deployment: no ops are produced for a procedure
//! set that fails a single check, so a deployed manifest is structurally
//! sound by construction.

use thiserror::Error;

/// A structural problem detected before any ops are emitted.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CompileError {
    /// Two procedure definitions share one name
    #[error("procedure {0} is defined twice")]
    DuplicateProcedure(String),

    /// The reserved health-probe name cannot be redefined
    #[error("{0} is a reserved procedure name")]
    ReservedProcedure(String),

    /// An if chain whose first segment is not a conditional
    #[error("an if chain must start with a conditional")]
    IfChainStart,

    /// A finally segment followed by further segments
    #[error("finally must be the last segment of an if chain")]
    FinallyNotTerminal,

    /// A saved index with no heap slot at this point of the procedure
    #[error("saved index {0} does not exist here")]
    UnknownSaved(usize),

    /// A store in a position that only takes plain values
    #[error("a store cannot be {0}")]
    IllegalStoreUse(&'static str),

    /// Store access with an empty key path
    #[error("store access requires at least one key")]
    EmptyStoreKey,

    /// A keys segment on the left side of an update
    #[error("keys cannot be assigned")]
    KeysNotAssignable,

    /// A field delete with nothing to delete
    #[error("delete requires at least one field segment")]
    DeleteWithoutField,

    /// A push or field delete outside an update operation
    #[error("{0} only appears as an update operation")]
    MisplacedOperation(&'static str),

    /// A lock or release naming node of the wrong kind
    #[error("a lock name must be a string or a saved value")]
    BadLockName,

    /// An object literal keyed by something other than a string or saved
    /// value
    #[error("an object field key must be a string or a saved value")]
    BadFieldKey,

    /// An update whose root is neither a saved value nor a store
    #[error("updates target a saved value or a store")]
    BadUpdateRoot,

    /// A statement node in expression position
    #[error("{0} is a statement, not a value")]
    StatementAsValue(&'static str),

    /// An expression node in statement position
    #[error("{0} has no effect as a statement")]
    ExpressionAsStatement(&'static str),

    /// A call naming a procedure outside the compilation
    #[error("call to unknown procedure {0}")]
    UnknownCallTarget(String),
}
