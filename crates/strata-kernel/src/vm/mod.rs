//! The request interpreter.
//!
//! A [`Vm`] executes compiled procedures against a fixed [`Globals`]
//! deployment: procedures, a schema registry, store declarations, a
//! storage engine, a lock manager, and an optional signing identity.
//! Execution is synchronous; each request runs one public procedure to
//! completion through [`Vm::handle`] or [`Vm::invoke`].
//!
//! # Frames and unwinding
//!
//! Each procedure activation runs in its own [`Context`]. Invocation is
//! native recursion with one guard per frame: when a frame exits, whether
//! by an explicit return, by running off the end of its ops, or by a
//! fault, the locks it still holds are released before control reaches
//! the caller. A fault therefore unwinds the whole chain and no lock
//! outlives its request.

mod context;
mod exec;

pub use context::Context;
pub use exec::ControlFlow;

use std::sync::Arc;

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::error::{VmError, VmResult};
use crate::locks::{LeaseLockManager, LockManager};
use crate::op::Op;
use crate::roles::RoleKeypair;
use crate::schema::{Schema, SchemaRegistry};
use crate::storage::{MemoryStore, StorageEngine};
use crate::value::Value;

/// Invoke nesting limit.
const MAX_CALL_DEPTH: usize = 256;

/// Procedure name reserved for health probes. Every deployment answers it.
pub const NOOP_PROCEDURE: &str = "noop";

/// A compiled procedure and its visibility.
#[derive(Debug, Clone)]
pub struct Procedure {
    /// Op sequence run on invocation.
    pub ops: Arc<Vec<Op>>,
    /// Private procedures are reachable through invoke ops only, never
    /// from outside the deployment.
    pub public: bool,
}

impl Procedure {
    /// Wrap ops as an externally callable procedure.
    pub fn public(ops: Vec<Op>) -> Self {
        Procedure {
            ops: Arc::new(ops),
            public: true,
        }
    }

    /// Wrap ops as a procedure reachable only from other procedures.
    pub fn private(ops: Vec<Op>) -> Self {
        Procedure {
            ops: Arc::new(ops),
            public: false,
        }
    }
}

/// One deployment's fixed execution environment.
pub struct Globals {
    procedures: FxHashMap<String, Procedure>,
    schemas: SchemaRegistry,
    stores: FxHashMap<String, Schema>,
    storage: Arc<dyn StorageEngine>,
    locks: Arc<dyn LockManager>,
    keypair: Option<RoleKeypair>,
}

impl Globals {
    /// Start assembling a deployment.
    pub fn builder() -> GlobalsBuilder {
        GlobalsBuilder::new()
    }

    /// Look up a procedure regardless of visibility. In-VM invokes may
    /// reach private procedures.
    pub(crate) fn procedure(&self, name: &str) -> Option<&Procedure> {
        self.procedures.get(name)
    }

    /// The deployment's schema registry.
    #[inline]
    pub fn schemas(&self) -> &SchemaRegistry {
        &self.schemas
    }

    /// Declared schema of a store, if the deployment declares one.
    pub fn store_schema(&self, name: &str) -> Option<&Schema> {
        self.stores.get(name)
    }

    /// The engine every storage op runs against.
    #[inline]
    pub fn storage(&self) -> &dyn StorageEngine {
        self.storage.as_ref()
    }

    /// The manager every lock op runs against.
    #[inline]
    pub fn locks(&self) -> &dyn LockManager {
        self.locks.as_ref()
    }

    /// Signing identity, when one is configured.
    #[inline]
    pub fn keypair(&self) -> Option<&RoleKeypair> {
        self.keypair.as_ref()
    }
}

/// Assembles a [`Globals`] piece by piece.
///
/// Storage defaults to an in-process [`MemoryStore`] and locking to a
/// [`LeaseLockManager`]. When a keypair is configured, its verifying key
/// becomes the registry's trusted role verifier.
pub struct GlobalsBuilder {
    procedures: FxHashMap<String, Procedure>,
    schemas: SchemaRegistry,
    stores: FxHashMap<String, Schema>,
    storage: Option<Arc<dyn StorageEngine>>,
    locks: Option<Arc<dyn LockManager>>,
    keypair: Option<RoleKeypair>,
}

impl GlobalsBuilder {
    /// A builder with nothing configured.
    pub fn new() -> Self {
        GlobalsBuilder {
            procedures: FxHashMap::default(),
            schemas: SchemaRegistry::new(),
            stores: FxHashMap::default(),
            storage: None,
            locks: None,
            keypair: None,
        }
    }

    /// Register a public procedure.
    pub fn procedure(mut self, name: impl Into<String>, ops: Vec<Op>) -> Self {
        self.procedures.insert(name.into(), Procedure::public(ops));
        self
    }

    /// Register a procedure reachable only from other procedures.
    pub fn private_procedure(mut self, name: impl Into<String>, ops: Vec<Op>) -> Self {
        self.procedures.insert(name.into(), Procedure::private(ops));
        self
    }

    /// Use this schema registry.
    pub fn schemas(mut self, registry: SchemaRegistry) -> Self {
        self.schemas = registry;
        self
    }

    /// Declare a store and the schema its documents adhere to.
    pub fn store(mut self, name: impl Into<String>, schema: Schema) -> Self {
        self.stores.insert(name.into(), schema);
        self
    }

    /// Use this storage engine instead of the in-process default.
    pub fn storage(mut self, engine: Arc<dyn StorageEngine>) -> Self {
        self.storage = Some(engine);
        self
    }

    /// Use this lock manager instead of the in-process default.
    pub fn locks(mut self, manager: Arc<dyn LockManager>) -> Self {
        self.locks = Some(manager);
        self
    }

    /// Sign role claims with this keypair and trust its verifying key.
    pub fn keypair(mut self, keypair: RoleKeypair) -> Self {
        self.keypair = Some(keypair);
        self
    }

    /// Finish the deployment. The health-probe procedure is inserted if
    /// nothing else claimed its name.
    pub fn build(self) -> Globals {
        let GlobalsBuilder {
            mut procedures,
            mut schemas,
            stores,
            storage,
            locks,
            keypair,
        } = self;
        procedures
            .entry(NOOP_PROCEDURE.to_string())
            .or_insert_with(|| Procedure::public(Vec::new()));
        if let Some(kp) = &keypair {
            schemas = schemas.with_verifying_key(kp.verifying_key());
        }
        Globals {
            procedures,
            schemas,
            stores,
            storage: storage.unwrap_or_else(|| Arc::new(MemoryStore::new())),
            locks: locks.unwrap_or_else(|| Arc::new(LeaseLockManager::new())),
            keypair,
        }
    }
}

impl Default for GlobalsBuilder {
    fn default() -> Self {
        GlobalsBuilder::new()
    }
}

/// External request surface.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "camelCase")]
pub enum Request {
    /// Liveness probe; answers None without running any procedure
    Ping,
    /// Run a public procedure with positional arguments
    Exec {
        /// Public procedure name
        procedure: String,
        /// Positional arguments, one heap slot each
        arguments: Vec<Value>,
    },
}

/// The interpreter for one deployment.
pub struct Vm {
    globals: Globals,
}

impl Vm {
    /// An interpreter over a finished deployment.
    pub fn new(globals: Globals) -> Self {
        Vm { globals }
    }

    /// The deployment this interpreter executes against.
    #[inline]
    pub fn globals(&self) -> &Globals {
        &self.globals
    }

    /// Serve one request.
    pub fn handle(&self, request: Request) -> VmResult<Value> {
        match request {
            Request::Ping => Ok(Value::None),
            Request::Exec {
                procedure,
                arguments,
            } => self.invoke(&procedure, arguments),
        }
    }

    /// Run a public procedure to completion.
    ///
    /// Private procedures answer exactly like unknown names, so outside
    /// callers cannot probe which private procedures exist.
    pub fn invoke(&self, name: &str, arguments: Vec<Value>) -> VmResult<Value> {
        let procedure = match self.globals.procedures.get(name) {
            Some(p) if p.public => p,
            _ => return Err(VmError::UnknownProcedure(name.to_string())),
        };
        let ops = procedure.ops.clone();
        tracing::debug!(procedure = name, args = arguments.len(), "invoke");
        let outcome = self.run_frame(&ops, arguments, 0);
        if let Err(error) = &outcome {
            tracing::debug!(procedure = name, %error, "invoke failed");
        }
        outcome
    }

    /// Run one frame to completion, releasing its locks on every exit
    /// path before handing control back.
    fn run_frame(&self, ops: &[Op], args: Vec<Value>, depth: usize) -> VmResult<Value> {
        if depth >= MAX_CALL_DEPTH {
            return Err(VmError::CallDepthExceeded);
        }
        let mut ctx = Context::new(args);
        let outcome = self.exec_frame(ops, &mut ctx, depth);
        self.release_held_locks(&mut ctx);
        outcome
    }

    fn exec_frame(&self, ops: &[Op], ctx: &mut Context, depth: usize) -> VmResult<Value> {
        while let Some(op) = ops.get(ctx.ip) {
            match exec::step(op, ctx, &self.globals)? {
                ControlFlow::Continue => ctx.ip += 1,
                ControlFlow::Jump(target) => {
                    if target > ops.len() {
                        return Err(VmError::InvalidJump(target as i64));
                    }
                    ctx.ip = target;
                }
                ControlFlow::Return(value) => return Ok(value),
                ControlFlow::Invoke { ops: callee, args } => {
                    // The caller's cursor moves first so the child's result
                    // lands before the op after the invoke.
                    ctx.ip += 1;
                    let value = self.run_frame(&callee, args, depth + 1)?;
                    ctx.push(value);
                }
            }
        }
        // Ran off the end: a procedure without an explicit return yields
        // None.
        Ok(Value::None)
    }

    fn release_held_locks(&self, ctx: &mut Context) {
        for name in ctx.drain_locks() {
            if let Err(error) = self.globals.locks.release(&name) {
                tracing::warn!(lock = %name, %error, "failed to release lock on frame exit");
            }
        }
    }
}
