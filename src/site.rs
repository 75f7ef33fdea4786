// SPDX-License-Identifier: AGPL-3.0-or-later
//! A site directory loaded into memory
//!
//! ```text
//! site.toml
//! controller.secrets.json
//! nodes/<node>.toml
//! nodes/<node>.secrets.json
//! groups/<group>.toml
//! groups/<group>.secrets.json
//! roles/<role>/<file>
//! ```

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::agesecrets::{AgeEngine, AgeKey, AgeSecretStore, RageEngine};
use crate::config::{SiteConfig, SITE_CONFIG_FILE};
use crate::error::{Result, RoostError};
use crate::inventory::{
    HostStore, InventoryGroup, InventoryNode, ReferenceRegistry, RoleRegistry, SecretStore,
    UNIVERSAL_GROUP,
};
use crate::localhost::Localhost;

/// Directory holding node definitions
pub const NODES_DIR: &str = "nodes";
/// Directory holding group definitions
pub const GROUPS_DIR: &str = "groups";
/// Directory holding site-specific role files
pub const ROLES_DIR: &str = "roles";

/// Options for applying roles to a node
#[derive(Debug, Clone, Default)]
pub struct ApplyOptions {
    /// Apply only these roles, in function order; all roles when empty
    pub roles: Vec<String>,
    /// Apply even if the node sets `testing_do_not_apply`
    pub force: bool,
}

/// Everything needed to resolve and apply roles for a site
pub struct Site {
    root: PathBuf,
    config: SiteConfig,
    hosts: HostStore,
    secrets: AgeSecretStore,
    key_overridden: bool,
}

impl Site {
    /// Load a site with the built-in roles and the in-process age engine
    pub fn load(root: impl AsRef<Path>) -> Result<Self> {
        Self::load_with(
            root,
            crate::roles::builtin(),
            ReferenceRegistry::builtin(),
            Arc::new(RageEngine::new()),
        )
    }

    /// Load a site with custom registries and engine
    pub fn load_with(
        root: impl AsRef<Path>,
        roles: RoleRegistry,
        references: ReferenceRegistry,
        engine: Arc<dyn AgeEngine>,
    ) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        let config = SiteConfig::from_file(root.join(SITE_CONFIG_FILE))?;
        info!(site = %config.name, root = %root.display(), "Loading site");

        let mut hosts = HostStore::from_config(&config)
            .with_roles(roles)
            .with_references(references)
            .with_role_directory(root.join(ROLES_DIR));

        for name in config.node_function_map.keys() {
            let path = node_file(&root, name);
            if path.exists() {
                hosts = hosts.with_node(InventoryNode::from_file(&path, name)?);
            } else {
                warn!(node = %name, path = %path.display(), "Node has no definition file");
            }
        }

        let group_names =
            std::iter::once(UNIVERSAL_GROUP).chain(config.groups.keys().map(String::as_str));
        for name in group_names {
            let path = group_file(&root, name);
            if path.exists() {
                hosts = hosts.with_group(InventoryGroup::from_file(&path, name)?);
            } else {
                debug!(group = %name, "Group has no definition file");
            }
        }

        let secrets = AgeSecretStore::from_config(&root, &config.secrets, engine);

        Ok(Self {
            root,
            config,
            hosts,
            secrets,
            key_overridden: false,
        })
    }

    /// The site directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The site configuration
    pub fn config(&self) -> &SiteConfig {
        &self.config
    }

    /// The inventory
    pub fn hosts(&self) -> &HostStore {
        &self.hosts
    }

    /// The secret store
    pub fn secrets(&self) -> &AgeSecretStore {
        &self.secrets
    }

    /// Apply `--secret-store-arguments`
    ///
    /// A key given here takes precedence over any key a node declares.
    pub fn apply_secret_store_arguments(&mut self, args: &BTreeMap<String, String>) -> Result<()> {
        self.secrets.apply_cli_arguments(args)?;
        if !args.is_empty() {
            self.key_overridden = true;
        }
        Ok(())
    }

    /// Paths copied to nodes on deployment
    pub fn deploy_sources(&self) -> Vec<PathBuf> {
        [SITE_CONFIG_FILE, NODES_DIR, GROUPS_DIR, ROLES_DIR]
            .iter()
            .map(|entry| self.root.join(entry))
            .filter(|path| path.exists())
            .collect()
    }

    /// Resolve and apply the roles of a node
    ///
    /// Roles are applied in function order and the first failure stops the
    /// run. Returns the names of the roles applied.
    pub async fn apply(
        &mut self,
        node: &str,
        options: &ApplyOptions,
        localhost: &Localhost,
    ) -> Result<Vec<String>> {
        let definition = self.hosts.node(node)?;
        if definition.testing_do_not_apply && !options.force {
            return Err(RoostError::ApplyRefused {
                node: node.to_string(),
            });
        }

        if !self.key_overridden {
            if let Some(key) = self.secrets.find_node_key(&definition)? {
                debug!(node = %node, key = %key.display(), "Using the node's own key");
                self.secrets.set_decryption_key(key);
            }
        }

        let names = self.hosts.node_rolename_list(node)?.to_vec();
        for wanted in &options.roles {
            if !names.contains(wanted) {
                return Err(RoostError::UnknownRole {
                    name: wanted.clone(),
                    node: node.to_string(),
                });
            }
        }

        let mut applied = Vec::new();
        for name in names {
            if !options.roles.is_empty() && !options.roles.contains(&name) {
                continue;
            }
            let role = self.hosts.node_role(&self.secrets, node, &name)?;
            info!(node = %node, role = %name, "Applying role");
            role.apply(localhost).await.map_err(|e| {
                warn!(node = %node, role = %name, error = %e, "Role failed");
                e
            })?;
            applied.push(name);
        }

        info!(node = %node, roles = applied.len(), "Applied node");
        Ok(applied)
    }

    /// Write a new site skeleton
    ///
    /// Creates `site.toml`, a `universal` group, one example node and a
    /// controller keypair at `controller.age` (never deployed). Returns the
    /// example node's keypair, whose private half belongs on the node.
    pub fn init(root: impl AsRef<Path>, name: &str, engine: &dyn AgeEngine) -> Result<AgeKey> {
        let root = root.as_ref();
        let config_path = root.join(SITE_CONFIG_FILE);
        if config_path.exists() {
            return Err(RoostError::InvalidConfig {
                message: format!("{} already exists", config_path.display()),
            });
        }

        let controller = engine.generate_keypair()?;
        controller.write_to(root.join("controller.age"))?;
        let node = engine.generate_keypair()?;

        fs::create_dir_all(root.join(NODES_DIR))?;
        fs::create_dir_all(root.join(GROUPS_DIR))?;
        fs::create_dir_all(root.join(ROLES_DIR))?;

        fs::write(
            &config_path,
            format!(
                r#"name = {name}
description = ""

[secrets]
controller_age_pub = "{controller}"
controller_age_path = "controller.age"
node_fallback_age_path = "/etc/roost/node.age"

[groups]

[node_function_map]
example = "base"

[function_role_map]
base = "settz motd"
"#,
                name = toml::Value::String(name.to_string()),
                controller = controller.public,
            ),
        )?;

        fs::write(
            group_file(root, UNIVERSAL_GROUP),
            "[roles.settz]\ntimezone = \"UTC\"\n",
        )?;
        fs::write(
            node_file(root, "example"),
            format!(
                r#"address = "example.internal"
age_pubkey = "{}"

[roles.motd]
message = "Configured by roost."
"#,
                node.public
            ),
        )?;

        info!(site = %name, root = %root.display(), "Initialized site");
        Ok(node)
    }
}

impl std::fmt::Debug for Site {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Site")
            .field("root", &self.root)
            .field("name", &self.config.name)
            .field("hosts", &self.hosts)
            .field("secrets", &self.secrets)
            .finish()
    }
}

/// Path of a node's definition file
pub fn node_file(root: &Path, name: &str) -> PathBuf {
    root.join(NODES_DIR).join(format!("{}.toml", name))
}

/// Path of a group's definition file
pub fn group_file(root: &Path, name: &str) -> PathBuf {
    root.join(GROUPS_DIR).join(format!("{}.toml", name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_init_then_load() {
        let temp_dir = tempdir().unwrap();
        let node_key = Site::init(temp_dir.path(), "lab", &RageEngine::new()).unwrap();

        let site = Site::load(temp_dir.path()).unwrap();
        assert_eq!(site.config().name, "lab");
        assert_eq!(
            site.secrets().decryption_key(),
            Some(temp_dir.path().join("controller.age").as_path())
        );
        let example = site.hosts().node("example").unwrap();
        assert_eq!(example.age_pubkey.as_deref(), Some(node_key.public.as_str()));
        assert_eq!(site.hosts().node_rolename_list("example").unwrap(), ["settz", "motd"]);

        assert!(Site::init(temp_dir.path(), "lab", &RageEngine::new()).is_err());
    }

    #[test]
    fn test_init_quotes_site_name() {
        let temp_dir = tempdir().unwrap();
        let name = "lab \"west\" \\ rack\n2";
        Site::init(temp_dir.path(), name, &RageEngine::new()).unwrap();

        let site = Site::load(temp_dir.path()).unwrap();
        assert_eq!(site.config().name, name);
        assert_eq!(site.hosts().nodes().collect::<Vec<_>>(), ["example"]);
    }

    #[test]
    fn test_deploy_sources_skip_keys() {
        let temp_dir = tempdir().unwrap();
        Site::init(temp_dir.path(), "lab", &RageEngine::new()).unwrap();
        let site = Site::load(temp_dir.path()).unwrap();

        let sources = site.deploy_sources();
        assert!(sources.contains(&temp_dir.path().join(SITE_CONFIG_FILE)));
        assert!(sources.contains(&temp_dir.path().join(NODES_DIR)));
        assert!(!sources.iter().any(|p| p.ends_with("controller.age")));
    }

    #[test]
    fn test_missing_node_file_is_tolerated() {
        let temp_dir = tempdir().unwrap();
        fs::write(
            temp_dir.path().join(SITE_CONFIG_FILE),
            "name = \"lab\"\n[node_function_map]\nghost = \"base\"\n",
        )
        .unwrap();

        let site = Site::load(temp_dir.path()).unwrap();
        assert_eq!(site.hosts().nodes().collect::<Vec<_>>(), vec!["ghost"]);
        assert!(matches!(
            site.hosts().node("ghost"),
            Err(RoostError::UnknownNode { .. })
        ));
    }
}
