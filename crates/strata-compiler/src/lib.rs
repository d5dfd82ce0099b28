//! Strata node compiler
//!
//! The build-time half of Strata: procedure trees go in, a deployable
//! [`Manifest`] of flat op vectors comes out. A [`Compilation`] gathers
//! procedure definitions, named schemas, and store declarations, then
//! runs each body through three passes:
//!
//! 1. shape validation (if chains, operation placement, call targets),
//! 2. store lowering (`GlobalObject` roots become explicit storage forms,
//!    touched stores are registered),
//! 3. emission (ops with exact jump distances and the input prologue).
//!
//! [`analysis`] summarizes store access per procedure for deployment
//! review; it never alters what is emitted.

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod analysis;
mod emit;
pub mod error;
mod lower;
pub mod manifest;
pub mod node;
mod validate;

pub use error::CompileError;
pub use manifest::{Manifest, ManifestProcedure};
pub use node::{Node, ProcedureDef};

use std::collections::BTreeMap;

use rustc_hash::FxHashSet;

use strata_kernel::{Op, Schema, NOOP_PROCEDURE};

/// One application's worth of procedures, schemas, and stores, ready to
/// compile into a [`Manifest`].
#[derive(Debug, Clone, Default)]
pub struct Compilation {
    procedures: Vec<ProcedureDef>,
    schemas: BTreeMap<String, Schema>,
    stores: BTreeMap<String, Schema>,
}

impl Compilation {
    /// An empty compilation.
    pub fn new() -> Self {
        Compilation::default()
    }

    /// Add a procedure definition.
    pub fn procedure(mut self, def: ProcedureDef) -> Self {
        self.procedures.push(def);
        self
    }

    /// Name a schema for runtime lookups.
    pub fn schema(mut self, name: impl Into<String>, schema: Schema) -> Self {
        self.schemas.insert(name.into(), schema);
        self
    }

    /// Declare a store's schema up front. Stores that are only touched by
    /// procedure bodies register themselves as maps of anything.
    pub fn store(mut self, name: impl Into<String>, schema: Schema) -> Self {
        self.stores.insert(name.into(), schema);
        self
    }

    /// Compile every procedure. Nothing is produced unless the whole set
    /// passes, so a manifest is structurally sound end to end.
    pub fn compile(self) -> Result<Manifest, CompileError> {
        let Compilation {
            procedures,
            schemas,
            mut stores,
        } = self;

        let mut known: FxHashSet<String> = FxHashSet::default();
        known.insert(NOOP_PROCEDURE.to_string());
        for def in &procedures {
            if def.name == NOOP_PROCEDURE {
                return Err(CompileError::ReservedProcedure(def.name.clone()));
            }
            if !known.insert(def.name.clone()) {
                return Err(CompileError::DuplicateProcedure(def.name.clone()));
            }
        }

        let mut compiled = BTreeMap::new();
        for def in procedures {
            validate::validate_body(&def.body, &known)?;
            let lowered = lower::lower_body(def.body, &mut stores)?;
            let ops = emit::emit_procedure(&def.input, &lowered)?;
            tracing::debug!(procedure = %def.name, ops = ops.len(), "compiled");
            compiled.insert(
                def.name,
                ManifestProcedure {
                    public: def.public,
                    ops,
                },
            );
        }
        compiled.insert(
            NOOP_PROCEDURE.to_string(),
            ManifestProcedure {
                public: true,
                ops: vec![Op::Noop],
            },
        );

        Ok(Manifest {
            procedures: compiled,
            schemas,
            stores,
        })
    }
}
