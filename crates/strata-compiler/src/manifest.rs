//! Deployable compilation output.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use strata_kernel::{GlobalsBuilder, Op, Schema, SchemaError, SchemaRegistry};

/// Everything a node needs to serve one compiled application.
///
/// The maps are ordered, so equal inputs serialize to byte-equal JSON and
/// a manifest can be diffed or content-addressed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    /// Compiled procedures by name.
    pub procedures: BTreeMap<String, ManifestProcedure>,
    /// Named schemas, resolvable at runtime by name.
    pub schemas: BTreeMap<String, Schema>,
    /// Store schemas, declared or inferred during lowering.
    pub stores: BTreeMap<String, Schema>,
}

/// One compiled procedure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestProcedure {
    /// Whether outside requests may run it.
    pub public: bool,
    /// The flat op vector, prologue included.
    pub ops: Vec<Op>,
}

impl Manifest {
    /// Start a deployment from this manifest. Storage, locking, and the
    /// signing identity stay configurable on the returned builder.
    pub fn into_builder(self) -> Result<GlobalsBuilder, SchemaError> {
        let registry = SchemaRegistry::build(self.schemas)?;
        let mut builder = GlobalsBuilder::new().schemas(registry);
        for (name, procedure) in self.procedures {
            builder = if procedure.public {
                builder.procedure(name, procedure.ops)
            } else {
                builder.private_procedure(name, procedure.ops)
            };
        }
        for (name, schema) in self.stores {
            builder = builder.store(name, schema);
        }
        Ok(builder)
    }
}
