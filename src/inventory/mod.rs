// SPDX-License-Identifier: AGPL-3.0-or-later
//! The site inventory
//!
//! An inventory is composed of:
//!
//! * **Nodes**: machines that can be configured, one TOML file each under `nodes/`
//! * **Groups**: collections of nodes that share role arguments, under `groups/`.
//!   The `universal` group is implicit and contains every node.
//! * **Functions**: named, ordered role lists; every node has exactly one
//! * **Roles**: units of configuration registered in a [`RoleRegistry`]
//!
//! [`HostStore`] ties these together and resolves fully-dereferenced role
//! instances for a node.

mod hosts;
mod node;
mod reference;
mod roles;
mod secrets;

pub use hosts::{HostStore, Topology};
pub use node::{InventoryGroup, InventoryNode, RoleArguments};
pub use reference::{
    ArgumentReference, ReferenceRegistry, ReferenceResolver, RoleArgument, SitedataResolver,
    REFERENCE_KEY,
};
pub use roles::{
    collect_role_arguments, Role, RoleBase, RoleDefinition, RoleFile, RoleFiles, RoleRegistry,
};
pub use secrets::{
    get_inherited_secret, Collection, EncryptionRequest, Secret, SecretStore, CONTROLLER_ENTITY,
};

/// The implicit group every node belongs to, with the lowest override priority
pub const UNIVERSAL_GROUP: &str = "universal";
