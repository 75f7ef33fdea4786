// SPDX-License-Identifier: AGPL-3.0-or-later
//! The host store: topology, node and group definitions, and role resolution

use serde_json::Map;
use std::cell::{OnceCell, RefCell};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::Arc;

use tracing::{debug, error};

use super::{
    collect_role_arguments, InventoryGroup, InventoryNode, ReferenceRegistry, Role, RoleArgument,
    RoleArguments, RoleBase, RoleFiles, RoleRegistry, SecretStore, UNIVERSAL_GROUP,
};
use crate::config::SiteConfig;
use crate::error::{Result, RoostError};

/// Who belongs where: groups, node functions and function role lists
#[derive(Debug, Clone, Default)]
pub struct Topology {
    /// Group name to members, excluding `universal`
    pub groups: BTreeMap<String, Vec<String>>,
    /// Node name to function name
    pub node_function: BTreeMap<String, String>,
    /// Function name to ordered role names
    pub function_roles: BTreeMap<String, Vec<String>>,
}

impl Topology {
    /// Take the topology from a site configuration
    pub fn from_config(config: &SiteConfig) -> Self {
        Self {
            groups: config
                .groups
                .iter()
                .map(|(name, members)| (name.clone(), members.0.clone()))
                .collect(),
            node_function: config.node_function_map.clone(),
            function_roles: config
                .function_role_map
                .iter()
                .map(|(name, roles)| (name.clone(), roles.0.clone()))
                .collect(),
        }
    }
}

/// The inventory of a site
///
/// Holds the topology plus node and group definitions, and resolves role
/// instances for nodes. Resolved roles are cached for the lifetime of the
/// store, so a role referenced by several others is constructed (and its
/// secrets decrypted) once.
///
/// The caches use `RefCell`, so a `HostStore` is not `Sync`. Resolution is
/// meant to happen on one thread; a long-running service sharing a store
/// across requests would need to put it behind a mutex.
pub struct HostStore {
    topology: Topology,
    group_members: BTreeMap<String, Vec<String>>,
    nodes: BTreeMap<String, Arc<InventoryNode>>,
    groups: BTreeMap<String, InventoryGroup>,
    roles: RoleRegistry,
    references: ReferenceRegistry,
    role_directory: Option<PathBuf>,
    node_groups: OnceCell<BTreeMap<String, Vec<String>>>,
    function_nodes: OnceCell<BTreeMap<String, Vec<String>>>,
    role_cache: RefCell<HashMap<(String, String), Arc<dyn Role>>>,
    resolving: RefCell<Vec<(String, String)>>,
}

impl HostStore {
    /// Create a store for a topology, with no node or group definitions yet
    pub fn new(topology: Topology) -> Self {
        let mut group_members = BTreeMap::new();
        group_members.insert(
            UNIVERSAL_GROUP.to_string(),
            topology.node_function.keys().cloned().collect(),
        );
        for (name, members) in &topology.groups {
            group_members.insert(name.clone(), members.clone());
        }

        Self {
            topology,
            group_members,
            nodes: BTreeMap::new(),
            groups: BTreeMap::new(),
            roles: RoleRegistry::new(),
            references: ReferenceRegistry::builtin(),
            role_directory: None,
            node_groups: OnceCell::new(),
            function_nodes: OnceCell::new(),
            role_cache: RefCell::new(HashMap::new()),
            resolving: RefCell::new(Vec::new()),
        }
    }

    /// Create a store for the topology of a site configuration
    pub fn from_config(config: &SiteConfig) -> Self {
        Self::new(Topology::from_config(config))
    }

    /// Add a node definition
    pub fn with_node(mut self, node: InventoryNode) -> Self {
        self.nodes.insert(node.name.clone(), Arc::new(node));
        self
    }

    /// Add a group definition
    pub fn with_group(mut self, group: InventoryGroup) -> Self {
        self.groups.insert(group.name.clone(), group);
        self
    }

    /// Set the role registry
    pub fn with_roles(mut self, roles: RoleRegistry) -> Self {
        self.roles = roles;
        self
    }

    /// Set the reference registry
    pub fn with_references(mut self, references: ReferenceRegistry) -> Self {
        self.references = references;
        self
    }

    /// Directory holding site-specific role files, one subdirectory per role
    pub fn with_role_directory(mut self, directory: impl Into<PathBuf>) -> Self {
        self.role_directory = Some(directory.into());
        self
    }

    /// All node names
    pub fn nodes(&self) -> impl Iterator<Item = &str> {
        self.topology.node_function.keys().map(String::as_str)
    }

    /// All group names, `universal` first
    pub fn groups(&self) -> Vec<&str> {
        let mut groups = vec![UNIVERSAL_GROUP];
        groups.extend(self.topology.groups.keys().map(String::as_str));
        groups
    }

    /// All function names
    pub fn functions(&self) -> impl Iterator<Item = &str> {
        self.topology.function_roles.keys().map(String::as_str)
    }

    /// Every role named by some function, deduplicated and sorted
    pub fn roles(&self) -> impl Iterator<Item = &str> {
        self.topology
            .function_roles
            .values()
            .flatten()
            .map(String::as_str)
            .collect::<BTreeSet<_>>()
            .into_iter()
    }

    /// The role registry
    pub fn role_registry(&self) -> &RoleRegistry {
        &self.roles
    }

    /// The reference registry
    pub fn references(&self) -> &ReferenceRegistry {
        &self.references
    }

    /// The topology this store was built from
    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    /// A node's definition
    pub fn node(&self, name: &str) -> Result<Arc<InventoryNode>> {
        self.nodes
            .get(name)
            .cloned()
            .ok_or_else(|| RoostError::UnknownNode {
                name: name.to_string(),
            })
    }

    /// A group's definition, if it has one
    pub fn group(&self, name: &str) -> Option<&InventoryGroup> {
        self.groups.get(name)
    }

    /// Members of a group; `universal` has every node
    pub fn group_members(&self, name: &str) -> Result<&[String]> {
        self.group_members
            .get(name)
            .map(Vec::as_slice)
            .ok_or_else(|| RoostError::UnknownGroup {
                name: name.to_string(),
            })
    }

    /// Groups a node belongs to, `universal` first
    ///
    /// Computed for every node on first use.
    pub fn node_groups(&self, node: &str) -> Result<&[String]> {
        let map = self.node_groups.get_or_init(|| {
            let mut map: BTreeMap<String, Vec<String>> = self
                .topology
                .node_function
                .keys()
                .map(|node| (node.clone(), Vec::new()))
                .collect();
            for group in self.groups() {
                for member in &self.group_members[group] {
                    if let Some(groups) = map.get_mut(member) {
                        groups.push(group.to_string());
                    }
                }
            }
            map
        });

        map.get(node)
            .map(Vec::as_slice)
            .ok_or_else(|| RoostError::UnknownNode {
                name: node.to_string(),
            })
    }

    /// Nodes assigned to a function
    pub fn function_nodes(&self, function: &str) -> &[String] {
        let map = self.function_nodes.get_or_init(|| {
            let mut map: BTreeMap<String, Vec<String>> = BTreeMap::new();
            for (node, function) in &self.topology.node_function {
                map.entry(function.clone()).or_default().push(node.clone());
            }
            map
        });
        map.get(function).map(Vec::as_slice).unwrap_or(&[])
    }

    /// The function a node is assigned to
    pub fn node_function(&self, node: &str) -> Result<&str> {
        self.topology
            .node_function
            .get(node)
            .map(String::as_str)
            .ok_or_else(|| RoostError::UnknownNode {
                name: node.to_string(),
            })
    }

    /// Ordered role names for a node, from its function
    pub fn node_rolename_list(&self, node: &str) -> Result<&[String]> {
        let function = self.node_function(node)?;
        self.topology
            .function_roles
            .get(function)
            .map(Vec::as_slice)
            .ok_or_else(|| RoostError::UnknownFunction {
                name: function.to_string(),
                node: node.to_string(),
            })
    }

    /// Role arguments a group sets for a role
    pub fn group_role_arguments(&self, group: &str, role: &str) -> Result<Option<&RoleArguments>> {
        if !self.group_members.contains_key(group) {
            return Err(RoostError::UnknownGroup {
                name: group.to_string(),
            });
        }
        Ok(self.groups.get(group).and_then(|g| g.roles.get(role)))
    }

    /// A fully-dereferenced role instance for a node
    ///
    /// The first call for a (node, role) pair resolves the role; later calls
    /// return the same instance.
    pub fn node_role(
        &self,
        secrets: &dyn SecretStore,
        node: &str,
        role: &str,
    ) -> Result<Arc<dyn Role>> {
        let key = (node.to_string(), role.to_string());
        if let Some(instance) = self.role_cache.borrow().get(&key) {
            return Ok(Arc::clone(instance));
        }

        {
            let mut resolving = self.resolving.borrow_mut();
            if let Some(start) = resolving.iter().position(|entry| *entry == key) {
                let mut chain: Vec<String> =
                    resolving[start..].iter().map(|(_, r)| r.clone()).collect();
                chain.push(role.to_string());
                return Err(RoostError::RoleResolutionCycle {
                    node: node.to_string(),
                    chain,
                });
            }
            resolving.push(key.clone());
        }

        let result = self.resolve_role(secrets, node, role);
        self.resolving.borrow_mut().pop();

        let instance = result.map_err(|e| {
            error!(node = %node, role = %role, error = %e, "Failed to resolve role");
            e
        })?;
        self.role_cache
            .borrow_mut()
            .insert(key, Arc::clone(&instance));
        Ok(instance)
    }

    /// All role instances for a node, in function order
    pub fn node_role_list(
        &self,
        secrets: &dyn SecretStore,
        node: &str,
    ) -> Result<Vec<Arc<dyn Role>>> {
        self.node_rolename_list(node)?
            .iter()
            .map(|role| self.node_role(secrets, node, role))
            .collect()
    }

    fn resolve_role(
        &self,
        secrets: &dyn SecretStore,
        node: &str,
        role: &str,
    ) -> Result<Arc<dyn Role>> {
        let definition = self
            .roles
            .get(role)
            .cloned()
            .ok_or_else(|| RoostError::UnknownRole {
                name: role.to_string(),
                node: node.to_string(),
            })?;
        let node_definition = self.node(node)?;

        let arguments = collect_role_arguments(self, &node_definition, &definition, role)?;
        let mut resolved = Map::new();
        for (key, argument) in arguments {
            let value = match argument {
                RoleArgument::Value(value) => value,
                RoleArgument::Reference(reference) => {
                    debug!(node = %node, role = %role, argument = %key, "Dereferencing {}", reference);
                    reference.dereference(node, self, secrets)?
                }
            };
            resolved.insert(key, value);
        }

        let base = RoleBase {
            name: role.to_string(),
            node: node_definition,
            files: RoleFiles {
                directory: self.role_directory.as_ref().map(|dir| dir.join(role)),
                embedded: definition.files(),
            },
        };
        let instance = definition.construct(base, resolved)?;
        debug!(node = %node, role = %role, "Resolved role");
        Ok(instance)
    }
}

impl std::fmt::Debug for HostStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostStore")
            .field("topology", &self.topology)
            .field("nodes", &self.nodes.keys().collect::<Vec<_>>())
            .field("roles", &self.roles)
            .field("references", &self.references)
            .finish_non_exhaustive()
    }
}
