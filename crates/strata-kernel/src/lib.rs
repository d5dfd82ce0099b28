//! Strata execution kernel
//!
//! This crate provides the runtime half of Strata:
//! - Stack-and-heap bytecode interpreter over a closed op set
//! - JSON-shaped values and structural schemas with adherence checks
//! - Storage engine contract plus the bundled in-process store
//! - Blocking named locks with lease bookkeeping
//! - Ed25519-signed role claims
//!
//! The compiler half lives in `strata-compiler`, which lowers procedure
//! trees into the op sequences this crate interprets.

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod error;
pub mod locks;
pub mod op;
pub mod roles;
pub mod schema;
pub mod storage;
pub mod value;
pub mod vm;

pub use error::{LockError, SchemaError, SignError, StorageError, VmError, VmResult};
pub use locks::{LeaseLockManager, LockManager};
pub use op::Op;
pub use roles::RoleKeypair;
pub use schema::{Schema, SchemaRegistry};
pub use storage::{MemoryStore, StorageEngine};
pub use value::{Value, ValueMap};
pub use vm::{Globals, GlobalsBuilder, Procedure, Request, Vm, NOOP_PROCEDURE};
