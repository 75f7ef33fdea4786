// SPDX-License-Identifier: AGPL-3.0-or-later
//! Role argument references
//!
//! Most role arguments are plain values. A table carrying the `_ref` key is a
//! reference instead, resolved when the role is instantiated for a node:
//!
//! ```toml
//! password = { _ref = "secret", name = "db_password" }
//! homedir = { _ref = "calculation", role = "account", key = "homedir" }
//! serial = { _ref = "sitedata", key = "serial" }
//! ```
//!
//! `secret` and `calculation` are built in. Any other tag is dispatched to the
//! [`ReferenceResolver`] registered for it in the [`ReferenceRegistry`].

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use super::{get_inherited_secret, HostStore, SecretStore};
use crate::error::{Result, RoostError};

/// Key marking a table as a reference
pub const REFERENCE_KEY: &str = "_ref";

/// A role argument as declared in a node or group file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Value", into = "Value")]
pub enum RoleArgument {
    /// A literal value
    Value(Value),
    /// A value known only at resolution time
    Reference(ArgumentReference),
}

/// A lazy placeholder resolved when a role is instantiated
#[derive(Debug, Clone, PartialEq)]
pub enum ArgumentReference {
    /// An encrypted secret, looked up through node then group inheritance
    Secret { name: String },

    /// A key of another role's `calculations()` on the same node
    Calculation { role: String, key: String },

    /// A site-defined reference, dispatched by tag
    Custom { tag: String, payload: Value },
}

/// Resolver for one custom reference tag
pub trait ReferenceResolver: Send + Sync {
    /// Produce the final value for `payload` on node `node`
    fn dereference(
        &self,
        payload: &Value,
        node: &str,
        hosts: &HostStore,
        secrets: &dyn SecretStore,
    ) -> Result<Value>;
}

/// Custom reference resolvers keyed by tag
#[derive(Clone, Default)]
pub struct ReferenceRegistry {
    resolvers: BTreeMap<String, Arc<dyn ReferenceResolver>>,
}

/// Resolves `{ _ref = "sitedata", key = "..." }` from the node's site data
#[derive(Debug, Default)]
pub struct SitedataResolver;

impl ArgumentReference {
    /// Get the final value of this reference for a node
    pub fn dereference(
        &self,
        node: &str,
        hosts: &HostStore,
        secrets: &dyn SecretStore,
    ) -> Result<Value> {
        match self {
            ArgumentReference::Secret { name } => {
                let secret = get_inherited_secret(hosts, secrets, node, name)?;
                Ok(Value::String(secret.decrypt()?))
            }
            ArgumentReference::Calculation { role, key } => {
                let instance = hosts.node_role(secrets, node, role)?;
                instance
                    .calculations()
                    .remove(key)
                    .ok_or_else(|| RoostError::CalculationNotFound {
                        node: node.to_string(),
                        role: role.clone(),
                        key: key.clone(),
                    })
            }
            ArgumentReference::Custom { tag, payload } => {
                let resolver = hosts
                    .references()
                    .get(tag)
                    .ok_or_else(|| RoostError::UnknownReference { tag: tag.clone() })?;
                resolver.dereference(payload, node, hosts, secrets)
            }
        }
    }

    /// The reference's tag as written in `_ref`
    pub fn tag(&self) -> &str {
        match self {
            ArgumentReference::Secret { .. } => "secret",
            ArgumentReference::Calculation { .. } => "calculation",
            ArgumentReference::Custom { tag, .. } => tag,
        }
    }
}

impl fmt::Display for ArgumentReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArgumentReference::Secret { name } => write!(f, "secret '{}'", name),
            ArgumentReference::Calculation { role, key } => {
                write!(f, "calculation '{}' of role '{}'", key, role)
            }
            ArgumentReference::Custom { tag, .. } => write!(f, "{} reference", tag),
        }
    }
}

impl RoleArgument {
    /// Shorthand for a secret reference
    pub fn secret(name: impl Into<String>) -> Self {
        RoleArgument::Reference(ArgumentReference::Secret { name: name.into() })
    }

    /// Shorthand for a calculation reference
    pub fn calculation(role: impl Into<String>, key: impl Into<String>) -> Self {
        RoleArgument::Reference(ArgumentReference::Calculation {
            role: role.into(),
            key: key.into(),
        })
    }

    /// Shorthand for a custom reference
    pub fn custom(tag: impl Into<String>, payload: Value) -> Self {
        RoleArgument::Reference(ArgumentReference::Custom {
            tag: tag.into(),
            payload,
        })
    }
}

impl From<&str> for RoleArgument {
    fn from(value: &str) -> Self {
        RoleArgument::Value(Value::String(value.to_string()))
    }
}

impl TryFrom<Value> for RoleArgument {
    type Error = String;

    fn try_from(value: Value) -> std::result::Result<Self, Self::Error> {
        let Value::Object(mut table) = value else {
            return Ok(RoleArgument::Value(value));
        };
        let tag = match table.remove(REFERENCE_KEY) {
            None => return Ok(RoleArgument::Value(Value::Object(table))),
            Some(Value::String(tag)) => tag,
            Some(other) => {
                return Err(format!("'{}' must be a string, got {}", REFERENCE_KEY, other))
            }
        };

        let reference = match tag.as_str() {
            "secret" => ArgumentReference::Secret {
                name: required_string(&table, &tag, "name")?,
            },
            "calculation" => ArgumentReference::Calculation {
                role: required_string(&table, &tag, "role")?,
                key: required_string(&table, &tag, "key")?,
            },
            _ => ArgumentReference::Custom {
                tag,
                payload: Value::Object(table),
            },
        };
        Ok(RoleArgument::Reference(reference))
    }
}

impl From<RoleArgument> for Value {
    fn from(argument: RoleArgument) -> Self {
        let reference = match argument {
            RoleArgument::Value(value) => return value,
            RoleArgument::Reference(reference) => reference,
        };

        let mut table = Map::new();
        table.insert(
            REFERENCE_KEY.to_string(),
            Value::String(reference.tag().to_string()),
        );
        match reference {
            ArgumentReference::Secret { name } => {
                table.insert("name".to_string(), Value::String(name));
            }
            ArgumentReference::Calculation { role, key } => {
                table.insert("role".to_string(), Value::String(role));
                table.insert("key".to_string(), Value::String(key));
            }
            ArgumentReference::Custom { payload, .. } => {
                if let Value::Object(fields) = payload {
                    table.extend(fields);
                }
            }
        }
        Value::Object(table)
    }
}

fn required_string(
    table: &Map<String, Value>,
    tag: &str,
    field: &str,
) -> std::result::Result<String, String> {
    match table.get(field) {
        Some(Value::String(value)) => Ok(value.clone()),
        _ => Err(format!(
            "{} reference requires a string '{}' field",
            tag, field
        )),
    }
}

impl ReferenceRegistry {
    /// An empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with the resolvers every site gets
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        registry.register("sitedata", SitedataResolver);
        registry
    }

    /// Register a resolver for a tag, replacing any previous one
    pub fn register<R: ReferenceResolver + 'static>(&mut self, tag: &str, resolver: R) {
        self.resolvers.insert(tag.to_string(), Arc::new(resolver));
    }

    /// Look up the resolver for a tag
    pub fn get(&self, tag: &str) -> Option<&Arc<dyn ReferenceResolver>> {
        self.resolvers.get(tag)
    }

    /// Registered tags
    pub fn tags(&self) -> impl Iterator<Item = &str> {
        self.resolvers.keys().map(String::as_str)
    }
}

impl fmt::Debug for ReferenceRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.resolvers.keys()).finish()
    }
}

impl ReferenceResolver for SitedataResolver {
    fn dereference(
        &self,
        payload: &Value,
        node: &str,
        hosts: &HostStore,
        _secrets: &dyn SecretStore,
    ) -> Result<Value> {
        let key = payload
            .get("key")
            .and_then(Value::as_str)
            .ok_or_else(|| RoostError::InvalidConfig {
                message: "sitedata reference requires a string 'key' field".to_string(),
            })?;
        let definition = hosts.node(node)?;
        definition
            .sitedata
            .get(key)
            .cloned()
            .ok_or_else(|| RoostError::InvalidConfig {
                message: format!("Node '{}' has no sitedata key '{}'", node, key),
            })
    }
}
