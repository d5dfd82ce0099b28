//! Structural schemas and adherence checking.
//!
//! A [`Schema`] describes the shape a value must have before it may be used
//! as a procedure input or a role claim. Checking is *total*: `adheres`
//! returns a bool and never raises, so compiled programs can branch on the
//! verdict. Malformed schemas are rejected when the registry is built, not
//! when a value is checked.

use std::collections::BTreeMap;

use ed25519_dalek::VerifyingKey;
use rustc_hash::FxHashMap;
use rustc_hash::FxHashSet;
use serde::{Deserialize, Serialize};

use crate::error::SchemaError;
use crate::roles;
use crate::value::Value;

/// Recursion ceiling for adherence over deeply nested values. Exceeding it
/// yields `false` rather than exhausting the native stack.
const MAX_ADHERENCE_DEPTH: usize = 128;

/// Structural type descriptor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "camelCase")]
pub enum Schema {
    /// Boolean values.
    Bool,
    /// Integer values. An int also adheres to [`Schema::Double`].
    Int,
    /// Double values. A double never adheres to [`Schema::Int`].
    Double,
    /// String values.
    String,
    /// Every value, including `None`.
    Any,
    /// `None` or the inner schema. Direct nesting is rejected at
    /// construction.
    Optional(Box<Schema>),
    /// Arrays whose every element adheres to the inner schema.
    Array(Box<Schema>),
    /// Objects with exactly these fields: each declared field must adhere
    /// (absent fields are checked as `None`, so optional fields may be
    /// omitted) and no undeclared field may appear.
    Object(BTreeMap<String, Schema>),
    /// Objects with arbitrary keys whose every value adheres to the inner
    /// schema.
    Map(Box<Schema>),
    /// A signed claim: an object carrying `_name`, optional `_state`, and a
    /// verifiable `_sig`.
    Role {
        /// Role name the claim's `_name` must equal
        name: String,
        /// Schema of the claim's `_state`, when the role carries one
        state: Option<Box<Schema>>,
    },
    /// Reference to a named schema in the registry. Enables recursion.
    Alias(String),
}

impl Schema {
    /// Wrap a schema in `Optional`, rejecting direct nesting.
    pub fn optional(inner: Schema) -> Result<Schema, SchemaError> {
        if matches!(inner, Schema::Optional(_)) {
            return Err(SchemaError::NestedOptional);
        }
        Ok(Schema::Optional(Box::new(inner)))
    }

    /// Convenience constructor for object schemas.
    pub fn object(fields: impl IntoIterator<Item = (String, Schema)>) -> Schema {
        Schema::Object(fields.into_iter().collect())
    }

    /// Structural well-formedness, applied to every schema a registry
    /// accepts (deserialized schemas bypass [`Schema::optional`]).
    pub fn validate(&self) -> Result<(), SchemaError> {
        match self {
            Schema::Optional(inner) => {
                if matches!(**inner, Schema::Optional(_)) {
                    return Err(SchemaError::NestedOptional);
                }
                inner.validate()
            }
            Schema::Array(inner) | Schema::Map(inner) => inner.validate(),
            Schema::Object(fields) => fields.values().try_for_each(Schema::validate),
            Schema::Role { state, .. } => match state {
                Some(s) => s.validate(),
                None => Ok(()),
            },
            _ => Ok(()),
        }
    }

    /// Collect every alias name referenced beneath this schema.
    fn referenced_aliases<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            Schema::Alias(name) => out.push(name),
            Schema::Optional(inner) | Schema::Array(inner) | Schema::Map(inner) => {
                inner.referenced_aliases(out)
            }
            Schema::Object(fields) => {
                for s in fields.values() {
                    s.referenced_aliases(out);
                }
            }
            Schema::Role { state: Some(s), .. } => s.referenced_aliases(out),
            _ => {}
        }
    }

    /// Collect aliases reachable without crossing a container. A cycle made
    /// only of such edges never consumes any part of the checked value, so
    /// adherence over it would not terminate.
    fn unguarded_aliases<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            Schema::Alias(name) => out.push(name),
            Schema::Optional(inner) => inner.unguarded_aliases(out),
            _ => {}
        }
    }
}

/// Named schemas plus the key used to verify role claims.
///
/// Built once per deployment and shared read-only by every request.
#[derive(Debug)]
pub struct SchemaRegistry {
    aliases: FxHashMap<String, Schema>,
    verifying_key: Option<VerifyingKey>,
}

impl SchemaRegistry {
    /// An empty registry with no aliases and no verifying key.
    pub fn new() -> Self {
        SchemaRegistry {
            aliases: FxHashMap::default(),
            verifying_key: None,
        }
    }

    /// Build a registry from named schemas, validating each schema, every
    /// alias target, and the guardedness of alias recursion.
    pub fn build(
        aliases: impl IntoIterator<Item = (String, Schema)>,
    ) -> Result<Self, SchemaError> {
        let aliases: FxHashMap<String, Schema> = aliases.into_iter().collect();

        for schema in aliases.values() {
            schema.validate()?;
            let mut referenced = Vec::new();
            schema.referenced_aliases(&mut referenced);
            for name in referenced {
                if !aliases.contains_key(name) {
                    return Err(SchemaError::UnknownAlias(name.to_string()));
                }
            }
        }

        // Cycle detection over unguarded edges only.
        for start in aliases.keys() {
            let mut visited = FxHashSet::default();
            let mut frontier = vec![start.as_str()];
            while let Some(name) = frontier.pop() {
                let mut next = Vec::new();
                aliases[name].unguarded_aliases(&mut next);
                for referenced in next {
                    if referenced == start {
                        return Err(SchemaError::UnguardedAliasCycle(start.clone()));
                    }
                    if visited.insert(referenced) {
                        frontier.push(referenced);
                    }
                }
            }
        }

        Ok(SchemaRegistry {
            aliases,
            verifying_key: None,
        })
    }

    /// Attach the public key role adherence verifies signatures with.
    pub fn with_verifying_key(mut self, key: VerifyingKey) -> Self {
        self.verifying_key = Some(key);
        self
    }

    /// Look up a named schema.
    pub fn resolve(&self, name: &str) -> Option<&Schema> {
        self.aliases.get(name)
    }

    /// Whether a named schema exists.
    pub fn contains(&self, name: &str) -> bool {
        self.aliases.contains_key(name)
    }

    /// Check a value against a schema. Total: every failure mode is `false`.
    pub fn adheres(&self, value: &Value, schema: &Schema) -> bool {
        self.adheres_at(value, schema, 0)
    }

    fn adheres_at(&self, value: &Value, schema: &Schema, depth: usize) -> bool {
        if depth > MAX_ADHERENCE_DEPTH {
            return false;
        }
        match schema {
            Schema::Any => true,
            Schema::Bool => matches!(value, Value::Bool(_)),
            Schema::Int => matches!(value, Value::Int(_)),
            Schema::Double => matches!(value, Value::Int(_) | Value::Double(_)),
            Schema::String => matches!(value, Value::String(_)),
            Schema::Optional(inner) => {
                value.is_none() || self.adheres_at(value, inner, depth + 1)
            }
            Schema::Array(inner) => match value {
                Value::Array(items) => items
                    .iter()
                    .all(|v| self.adheres_at(v, inner, depth + 1)),
                _ => false,
            },
            Schema::Object(fields) => match value.as_object() {
                Some(map) => {
                    let declared = fields
                        .iter()
                        .all(|(name, field_schema)| match map.get(name) {
                            Some(v) => self.adheres_at(v, field_schema, depth + 1),
                            None => self.adheres_at(&Value::None, field_schema, depth + 1),
                        });
                    declared && map.keys().all(|k| fields.contains_key(k))
                }
                None => false,
            },
            Schema::Map(inner) => match value.as_object() {
                Some(map) => map
                    .values()
                    .all(|v| self.adheres_at(v, inner, depth + 1)),
                _ => false,
            },
            Schema::Role { name, state } => self.adheres_to_role(value, name, state.as_deref(), depth),
            Schema::Alias(name) => match self.aliases.get(name) {
                Some(resolved) => self.adheres_at(value, resolved, depth + 1),
                None => false,
            },
        }
    }

    fn adheres_to_role(
        &self,
        value: &Value,
        role_name: &str,
        state_schema: Option<&Schema>,
        depth: usize,
    ) -> bool {
        let map = match value.as_object() {
            Some(m) => m,
            None => return false,
        };
        if map.keys().any(|k| k != "_name" && k != "_state" && k != "_sig") {
            return false;
        }
        match map.get("_name").and_then(Value::as_str) {
            Some(n) if n == role_name => {}
            _ => return false,
        }
        let state = map.get("_state");
        match state_schema {
            Some(schema) => {
                let checked = state.unwrap_or(&Value::None);
                if !self.adheres_at(checked, schema, depth + 1) {
                    return false;
                }
            }
            None => {
                if state.is_some() {
                    return false;
                }
            }
        }
        let sig = match map.get("_sig").and_then(Value::as_str) {
            Some(s) => s,
            None => return false,
        };
        match &self.verifying_key {
            Some(key) => roles::verify_claim(key, role_name, state, sig),
            None => false,
        }
    }
}

impl Default for SchemaRegistry {
    fn default() -> Self {
        Self::new()
    }
}
