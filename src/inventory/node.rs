// SPDX-License-Identifier: AGPL-3.0-or-later
//! Node and group definitions

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use super::RoleArgument;
use crate::error::{Result, RoostError};

/// Role arguments for one role, keyed by argument name
pub type RoleArguments = BTreeMap<String, RoleArgument>;

/// A machine managed by roost
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InventoryNode {
    /// Node name, taken from the file name
    #[serde(skip)]
    pub name: String,

    /// Hostname or IP address used to connect over SSH
    pub address: String,

    /// Username used to connect over SSH
    #[serde(default = "default_user")]
    pub user: String,

    /// Age public key secrets are encrypted to
    #[serde(default)]
    pub age_pubkey: Option<String>,

    /// Path to the node's age private key on the node itself.
    /// Falls back to `node_fallback_age_path` from the site config.
    #[serde(default)]
    pub age_key_path: Option<PathBuf>,

    /// SSH host key fingerprint
    #[serde(default)]
    pub ssh_host_fingerprint: Option<String>,

    /// Role arguments for this node, keyed by role name
    #[serde(default)]
    pub roles: BTreeMap<String, RoleArguments>,

    /// Site-specific data (serial numbers, locations, notes)
    #[serde(default)]
    pub sitedata: BTreeMap<String, serde_json::Value>,

    /// Refuse `apply` unless forced; useful for inspecting early boot state
    #[serde(default)]
    pub testing_do_not_apply: bool,
}

/// Role arguments shared by the members of a group
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InventoryGroup {
    /// Group name, taken from the file name
    #[serde(skip)]
    pub name: String,

    /// Role arguments for members of this group, keyed by role name
    #[serde(default)]
    pub roles: BTreeMap<String, RoleArguments>,

    /// Site-specific data
    #[serde(default)]
    pub sitedata: BTreeMap<String, serde_json::Value>,
}

impl InventoryNode {
    /// Create a node with no role arguments
    pub fn new(name: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            address: address.into(),
            user: default_user(),
            age_pubkey: None,
            age_key_path: None,
            ssh_host_fingerprint: None,
            roles: BTreeMap::new(),
            sitedata: BTreeMap::new(),
            testing_do_not_apply: false,
        }
    }

    /// Set one role argument
    pub fn with_role_argument(
        mut self,
        role: &str,
        key: &str,
        value: impl Into<RoleArgument>,
    ) -> Self {
        self.roles
            .entry(role.to_string())
            .or_default()
            .insert(key.to_string(), value.into());
        self
    }

    /// Set the age public key
    pub fn with_age_pubkey(mut self, pubkey: impl Into<String>) -> Self {
        self.age_pubkey = Some(pubkey.into());
        self
    }

    /// `user@address`, the SSH destination for this node
    pub fn ssh_destination(&self) -> String {
        format!("{}@{}", self.user, self.address)
    }

    /// Load a node definition from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P, name: &str) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(RoostError::UnknownNode {
                name: name.to_string(),
            });
        }

        let contents = std::fs::read_to_string(path)?;
        let mut node: InventoryNode =
            toml::from_str(&contents).map_err(|e| RoostError::InvalidConfig {
                message: format!("{}: {}", path.display(), e),
            })?;
        node.name = name.to_string();
        Ok(node)
    }
}

impl InventoryGroup {
    /// Create a group with no role arguments
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Set one role argument
    pub fn with_role_argument(
        mut self,
        role: &str,
        key: &str,
        value: impl Into<RoleArgument>,
    ) -> Self {
        self.roles
            .entry(role.to_string())
            .or_default()
            .insert(key.to_string(), value.into());
        self
    }

    /// Load a group definition from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P, name: &str) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(RoostError::UnknownGroup {
                name: name.to_string(),
            });
        }

        let contents = std::fs::read_to_string(path)?;
        let mut group: InventoryGroup =
            toml::from_str(&contents).map_err(|e| RoostError::InvalidConfig {
                message: format!("{}: {}", path.display(), e),
            })?;
        group.name = name.to_string();
        Ok(group)
    }
}

fn default_user() -> String {
    "root".to_string()
}
