// SPDX-License-Identifier: AGPL-3.0-or-later
//! Roles and role argument collection

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::{HostStore, InventoryNode, RoleArgument, RoleArguments, UNIVERSAL_GROUP};
use crate::error::{Result, RoostError};
use crate::localhost::Localhost;

/// A role that can be applied to a node
///
/// `calculations()` returns data the role can derive from its arguments
/// before it is applied, for other roles to reference. A role that creates a
/// user might calculate `{"homedir": "/home/ops"}`; the directory may not
/// exist until the role has actually run.
#[async_trait]
pub trait Role: Send + Sync + fmt::Debug {
    /// Name, node and file handle shared by every role
    fn base(&self) -> &RoleBase;

    /// The role name
    fn name(&self) -> &str {
        &self.base().name
    }

    /// Apply the role to the local machine
    async fn apply(&self, localhost: &Localhost) -> Result<()>;

    /// Values other roles may reference
    fn calculations(&self) -> Map<String, Value> {
        Map::new()
    }

    /// A file bundled with the role, such as a template
    fn role_file(&self, filename: &str) -> Result<RoleFile> {
        self.base().role_file(filename)
    }
}

/// The part of a role every implementation carries
#[derive(Debug, Clone)]
pub struct RoleBase {
    /// The role name
    pub name: String,
    /// The node the role was resolved for
    pub node: Arc<InventoryNode>,
    /// Where the role's bundled files live
    pub files: RoleFiles,
}

/// Locations of a role's bundled files
///
/// A file in the site's `roles/<role>/` directory takes precedence over a
/// file compiled into the binary, so sites can override built-in templates.
#[derive(Debug, Clone, Default)]
pub struct RoleFiles {
    /// `roles/<role>` inside the site directory
    pub directory: Option<PathBuf>,
    /// Files compiled into the binary, as (name, contents)
    pub embedded: &'static [(&'static str, &'static str)],
}

/// Handle to one bundled role file
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoleFile {
    /// A file on disk
    Path(PathBuf),
    /// A file compiled into the binary
    Embedded {
        name: &'static str,
        contents: &'static str,
    },
}

type Constructor = dyn Fn(RoleBase, Map<String, Value>) -> Result<Arc<dyn Role>> + Send + Sync;

/// How to build a role from resolved arguments
pub struct RoleDefinition {
    defaults: Map<String, Value>,
    files: &'static [(&'static str, &'static str)],
    constructor: Box<Constructor>,
}

/// Role definitions keyed by role name
#[derive(Clone, Default)]
pub struct RoleRegistry {
    definitions: BTreeMap<String, Arc<RoleDefinition>>,
}

impl RoleBase {
    /// Resolve a bundled file by name
    pub fn role_file(&self, filename: &str) -> Result<RoleFile> {
        self.files.find(filename).ok_or_else(|| {
            RoostError::IoError(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("Role '{}' has no file named '{}'", self.name, filename),
            ))
        })
    }
}

impl RoleFiles {
    fn find(&self, filename: &str) -> Option<RoleFile> {
        if let Some(dir) = &self.directory {
            let path = dir.join(filename);
            if path.is_file() {
                return Some(RoleFile::Path(path));
            }
        }
        self.embedded
            .iter()
            .find(|(name, _)| *name == filename)
            .map(|(name, contents)| RoleFile::Embedded { name, contents })
    }
}

impl RoleFile {
    /// Read the file contents
    pub fn read_to_string(&self) -> Result<String> {
        match self {
            RoleFile::Path(path) => Ok(std::fs::read_to_string(path)?),
            RoleFile::Embedded { contents, .. } => Ok((*contents).to_string()),
        }
    }

    /// Path on disk, if the file is not embedded
    pub fn path(&self) -> Option<&Path> {
        match self {
            RoleFile::Path(path) => Some(path),
            RoleFile::Embedded { .. } => None,
        }
    }
}

impl RoleDefinition {
    /// Define a role whose arguments deserialize into `A`
    ///
    /// Missing, mistyped or unknown fields (with `deny_unknown_fields`) fail
    /// with `InvalidRoleArguments`.
    pub fn new<A, R, F>(constructor: F) -> Self
    where
        A: DeserializeOwned,
        R: Role + 'static,
        F: Fn(RoleBase, A) -> R + Send + Sync + 'static,
    {
        Self {
            defaults: Map::new(),
            files: &[],
            constructor: Box::new(move |base: RoleBase, args: Map<String, Value>| {
                let args: A = serde_json::from_value(Value::Object(args)).map_err(|e| {
                    RoostError::InvalidRoleArguments {
                        role: base.name.clone(),
                        node: base.node.name.clone(),
                        message: e.to_string(),
                    }
                })?;
                Ok(Arc::new(constructor(base, args)) as Arc<dyn Role>)
            }),
        }
    }

    /// Declare a default argument value
    pub fn with_default(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.defaults.insert(key.to_string(), value.into());
        self
    }

    /// Bundle files compiled into the binary
    pub fn with_files(mut self, files: &'static [(&'static str, &'static str)]) -> Self {
        self.files = files;
        self
    }

    /// Declared default arguments
    pub fn defaults(&self) -> &Map<String, Value> {
        &self.defaults
    }

    /// Embedded files
    pub fn files(&self) -> &'static [(&'static str, &'static str)] {
        self.files
    }

    /// Build the role from fully-dereferenced arguments
    ///
    /// A value whose JSON kind differs from the kind of the declared default
    /// for the same key is rejected before the role sees it.
    pub fn construct(&self, base: RoleBase, args: Map<String, Value>) -> Result<Arc<dyn Role>> {
        for (key, default) in &self.defaults {
            let Some(value) = args.get(key) else { continue };
            if !default.is_null() && !value.is_null() && kind(default) != kind(value) {
                return Err(RoostError::InvalidRoleArguments {
                    role: base.name.clone(),
                    node: base.node.name.clone(),
                    message: format!(
                        "argument '{}' defaults to a {} but was set to a {}",
                        key,
                        kind(default),
                        kind(value)
                    ),
                });
            }
        }
        (self.constructor)(base, args)
    }
}

impl fmt::Debug for RoleDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RoleDefinition")
            .field("defaults", &self.defaults)
            .field("files", &self.files.iter().map(|(n, _)| *n).collect::<Vec<_>>())
            .finish()
    }
}

fn kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "table",
    }
}

impl RoleRegistry {
    /// An empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a role definition under a name, replacing any previous one
    pub fn register(&mut self, name: &str, definition: RoleDefinition) {
        self.definitions
            .insert(name.to_string(), Arc::new(definition));
    }

    /// Builder-style [`register`](Self::register)
    pub fn with(mut self, name: &str, definition: RoleDefinition) -> Self {
        self.register(name, definition);
        self
    }

    /// Look up a definition
    pub fn get(&self, name: &str) -> Option<&Arc<RoleDefinition>> {
        self.definitions.get(name)
    }

    /// Whether a role is registered
    pub fn contains(&self, name: &str) -> bool {
        self.definitions.contains_key(name)
    }

    /// Registered role names
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.definitions.keys().map(String::as_str)
    }
}

impl fmt::Debug for RoleRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.definitions.iter()).finish()
    }
}

/// Collect the arguments for a role on a node, before dereferencing
///
/// Sources are applied from lowest to highest priority:
///
/// * defaults declared by the role definition
/// * the `universal` group
/// * the node's other groups, in name order
/// * the node itself
///
/// Two non-universal groups setting the same key to different values is a
/// `GroupArgumentConflict`, unless the node overrides that key itself.
pub fn collect_role_arguments(
    hosts: &HostStore,
    node: &InventoryNode,
    definition: &RoleDefinition,
    role: &str,
) -> Result<RoleArguments> {
    let mut args: RoleArguments = definition
        .defaults()
        .iter()
        .map(|(key, value)| (key.clone(), RoleArgument::Value(value.clone())))
        .collect();

    let mut set_by_group: BTreeMap<&str, &str> = BTreeMap::new();
    let mut conflicts = Vec::new();

    for group in hosts.node_groups(&node.name)? {
        let Some(overrides) = hosts.group_role_arguments(group, role)? else {
            continue;
        };
        for (key, value) in overrides {
            if group != UNIVERSAL_GROUP {
                if let Some(previous) = set_by_group.insert(key.as_str(), group.as_str()) {
                    if args.get(key) != Some(value) {
                        conflicts.push((key.clone(), previous.to_string(), group.clone()));
                    }
                }
            }
            args.insert(key.clone(), value.clone());
        }
    }

    let node_overrides = node.roles.get(role);
    if let Some(overrides) = node_overrides {
        for (key, value) in overrides {
            args.insert(key.clone(), value.clone());
        }
    }

    let unresolved = conflicts.into_iter().find(|(key, _, _)| {
        node_overrides.map_or(true, |overrides| !overrides.contains_key(key))
    });
    if let Some((key, first, second)) = unresolved {
        return Err(RoostError::GroupArgumentConflict {
            node: node.name.clone(),
            role: role.to_string(),
            key,
            first,
            second,
        });
    }

    Ok(args)
}
