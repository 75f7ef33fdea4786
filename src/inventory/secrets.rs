// SPDX-License-Identifier: AGPL-3.0-or-later
//! Secret store interface and secret inheritance

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use tracing::debug;

use super::{HostStore, InventoryNode};
use crate::error::{Result, RoostError};

/// The only entity name used in the `special` collection
pub const CONTROLLER_ENTITY: &str = "controller";

/// A partition of the secret store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Collection {
    /// Secrets for one node, keyed by node name
    Node,
    /// Secrets for the members of a group, keyed by group name
    Group,
    /// Secrets only the controller can decrypt
    Special,
}

/// An encrypted value that can be decrypted on demand
pub trait Secret: Send + Sync + fmt::Debug {
    /// The encrypted value as stored
    fn ciphertext(&self) -> &str;

    /// Decrypt the value. Implementations cache the plaintext for the
    /// lifetime of the instance.
    fn decrypt(&self) -> Result<String>;
}

/// What to encrypt and for whom
#[derive(Debug, Clone, Default)]
pub struct EncryptionRequest {
    /// Name to store the secret under; required when `store` is set
    pub name: String,
    /// The plaintext
    pub value: String,
    /// Nodes that can decrypt
    pub nodes: Vec<String>,
    /// Groups whose members can decrypt
    pub groups: Vec<String>,
    /// Encrypt for (and store in) the controller's special collection
    pub controller_key: bool,
    /// Persist the ciphertext; persisted secrets always include the controller key
    pub store: bool,
}

/// Secret storage and encryption
///
/// Secrets live in three collections. `Node` and `Group` entities are named
/// after the node or group; `Special` only uses [`CONTROLLER_ENTITY`].
pub trait SecretStore {
    /// Names of the secrets stored for an entity
    fn list_secrets(&self, collection: Collection, entity: &str) -> Result<Vec<String>>;

    /// Retrieve a secret. Fails with `SecretNotFound` when absent.
    fn get_secret(
        &self,
        collection: Collection,
        entity: &str,
        name: &str,
    ) -> Result<Arc<dyn Secret>>;

    /// Encrypt a value for nodes, groups and optionally the controller,
    /// persisting it when requested. Returns the ciphertext either way.
    fn encrypt_secret(&self, hosts: &HostStore, request: &EncryptionRequest) -> Result<String>;

    /// Apply `key=value` arguments given on the command line
    fn apply_cli_arguments(&mut self, args: &BTreeMap<String, String>) -> Result<()>;

    /// Find the decryption key declared by a node, if any
    fn find_node_key(&self, node: &InventoryNode) -> Result<Option<PathBuf>>;
}

/// Get a secret for a node, inheriting from its groups if necessary
///
/// The node's own collection wins. Groups are searched in reverse
/// membership order, so `universal` is searched last.
pub fn get_inherited_secret(
    hosts: &HostStore,
    secrets: &dyn SecretStore,
    node: &str,
    name: &str,
) -> Result<Arc<dyn Secret>> {
    match secrets.get_secret(Collection::Node, node, name) {
        Ok(secret) => return Ok(secret),
        Err(RoostError::SecretNotFound { .. }) => {}
        Err(e) => return Err(e),
    }

    let searched: Vec<String> = hosts.node_groups(node)?.iter().rev().cloned().collect();
    for group in &searched {
        match secrets.get_secret(Collection::Group, group, name) {
            Ok(secret) => {
                debug!(node = %node, group = %group, secret = %name, "Inherited secret from group");
                return Ok(secret);
            }
            Err(RoostError::SecretNotFound { .. }) => continue,
            Err(e) => return Err(e),
        }
    }

    Err(RoostError::SecretNotFound {
        name: name.to_string(),
        scope: format!(
            "node '{}' (also searched groups: {})",
            node,
            searched.join(", ")
        ),
    })
}

impl Collection {
    /// All collections
    pub const ALL: [Collection; 3] = [Collection::Node, Collection::Group, Collection::Special];

    /// Collection name as used on the command line
    pub fn as_str(&self) -> &'static str {
        match self {
            Collection::Node => "node",
            Collection::Group => "group",
            Collection::Special => "special",
        }
    }
}

impl fmt::Display for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Collection {
    type Err = RoostError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "node" => Ok(Collection::Node),
            "group" => Ok(Collection::Group),
            "special" => Ok(Collection::Special),
            other => Err(RoostError::InvalidConfig {
                message: format!("Unknown secret collection '{}'", other),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collection_names_round_trip() {
        for collection in Collection::ALL {
            assert_eq!(collection.as_str().parse::<Collection>().unwrap(), collection);
        }
        assert!("nodes".parse::<Collection>().is_err());
    }
}
