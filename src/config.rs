// SPDX-License-Identifier: AGPL-3.0-or-later
//! Site configuration for Kea-Roost
//!
//! A site is a directory whose root holds `site.toml`. The file assigns nodes
//! to groups and functions, lists the roles of every function, and tells the
//! secret store where the age keys live.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::error::{Result, RoostError};
use crate::inventory::UNIVERSAL_GROUP;

/// Name of the configuration file at the root of every site
pub const SITE_CONFIG_FILE: &str = "site.toml";

/// Main configuration structure for a site
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SiteConfig {
    /// Site name
    pub name: String,

    /// Human-readable description
    #[serde(default)]
    pub description: String,

    /// Secret store configuration
    #[serde(default)]
    pub secrets: SecretsConfig,

    /// Group name to member nodes
    #[serde(default)]
    pub groups: BTreeMap<String, NameList>,

    /// Node name to function name
    #[serde(default)]
    pub node_function_map: BTreeMap<String, String>,

    /// Function name to ordered role names
    #[serde(default)]
    pub function_role_map: BTreeMap<String, NameList>,

    /// Deployment configuration
    #[serde(default)]
    pub deploy: DeployConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// A list of names, written either as a TOML array or as one
/// whitespace/newline separated string
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "NameListRepr", into = "Vec<String>")]
pub struct NameList(pub Vec<String>);

#[derive(Deserialize)]
#[serde(untagged)]
enum NameListRepr {
    Text(String),
    List(Vec<String>),
}

impl From<NameListRepr> for NameList {
    fn from(repr: NameListRepr) -> Self {
        match repr {
            NameListRepr::Text(text) => {
                NameList(text.split_whitespace().map(str::to_string).collect())
            }
            NameListRepr::List(items) => NameList(items),
        }
    }
}

impl From<NameList> for Vec<String> {
    fn from(list: NameList) -> Self {
        list.0
    }
}

/// Age secret store configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SecretsConfig {
    /// Controller public key; every persisted secret is also encrypted to it
    #[serde(default)]
    pub controller_age_pub: String,

    /// Path to the controller private key (present only on the controller)
    #[serde(default)]
    pub controller_age_path: Option<PathBuf>,

    /// Default location of a node's private key on the node itself
    #[serde(default)]
    pub node_fallback_age_path: Option<PathBuf>,
}

/// Deployment configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeployConfig {
    /// Maximum number of nodes deployed to at once
    #[serde(default = "default_parallelism")]
    pub parallelism: usize,

    /// Timeout for each remote operation in seconds
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,

    /// Where the site is copied to on the remote node
    #[serde(default = "default_remote_path")]
    pub remote_path: String,

    /// Roost executable on the remote node
    #[serde(default = "default_remote_command")]
    pub remote_command: String,

    /// Extra options passed to ssh and scp
    #[serde(default)]
    pub ssh_options: Vec<String>,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format (text, json)
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for DeployConfig {
    fn default() -> Self {
        Self {
            parallelism: default_parallelism(),
            timeout_secs: default_timeout(),
            remote_path: default_remote_path(),
            remote_command: default_remote_command(),
            ssh_options: Vec::new(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl Default for SiteConfig {
    fn default() -> Self {
        Self {
            name: "roost".to_string(),
            description: String::new(),
            secrets: SecretsConfig::default(),
            groups: BTreeMap::new(),
            node_function_map: BTreeMap::new(),
            function_role_map: BTreeMap::new(),
            deploy: DeployConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl SiteConfig {
    /// Load configuration from a TOML file
    ///
    /// Relative key paths in `[secrets]` are resolved against the directory
    /// holding the file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(RoostError::ConfigNotFound {
                path: path.display().to_string(),
            });
        }

        let contents = std::fs::read_to_string(path)?;
        let mut config = Self::from_toml(&contents)?;

        if let Some(root) = path.parent() {
            config.secrets.resolve_relative_to(root);
        }

        Ok(config)
    }

    /// Parse and validate configuration from TOML text
    pub fn from_toml(contents: &str) -> Result<Self> {
        let config: SiteConfig = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(RoostError::InvalidConfig {
                message: "Site name cannot be empty".to_string(),
            });
        }

        if self.groups.contains_key(UNIVERSAL_GROUP) {
            return Err(RoostError::InvalidConfig {
                message: format!(
                    "Group '{}' is implicit and cannot be listed under [groups]",
                    UNIVERSAL_GROUP
                ),
            });
        }

        for (group, members) in &self.groups {
            for member in &members.0 {
                if !self.node_function_map.contains_key(member) {
                    return Err(RoostError::InvalidConfig {
                        message: format!(
                            "Group '{}' lists node '{}', which is missing from [node_function_map]",
                            group, member
                        ),
                    });
                }
            }
        }

        if self.deploy.parallelism == 0 {
            return Err(RoostError::InvalidConfig {
                message: "deploy.parallelism must be at least 1".to_string(),
            });
        }

        Ok(())
    }
}

impl SecretsConfig {
    fn resolve_relative_to(&mut self, root: &Path) {
        for path in [
            &mut self.controller_age_path,
            &mut self.node_fallback_age_path,
        ]
        .into_iter()
        .flatten()
        {
            if path.is_relative() {
                *path = root.join(&*path);
            }
        }
    }

    /// Candidate private key paths, in the order they are tried
    pub fn decryption_key_candidates(&self) -> Vec<PathBuf> {
        self.controller_age_path
            .iter()
            .chain(self.node_fallback_age_path.iter())
            .cloned()
            .collect()
    }
}

// Default value functions

fn default_parallelism() -> usize {
    4
}

fn default_timeout() -> u64 {
    600 // 10 minutes
}

fn default_remote_path() -> String {
    "/tmp/roost-site".to_string()
}

fn default_remote_command() -> String {
    "roost".to_string()
}

fn default_log_level() -> String {
    "warn".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const EXAMPLE: &str = r#"
        name = "example"
        description = "An example site"

        [secrets]
        controller_age_pub = "age1controller"
        controller_age_path = "controller.age"
        node_fallback_age_path = "/etc/roost/node.age"

        [groups]
        group1 = "node1 node2"
        group2 = ["node2"]

        [node_function_map]
        node1 = "func1"
        node2 = "func1"

        [function_role_map]
        func1 = """
            settz
            motd
        """

        [deploy]
        parallelism = 8
    "#;

    #[test]
    fn test_default_config() {
        let config = SiteConfig::default();
        assert_eq!(config.name, "roost");
        assert_eq!(config.deploy.parallelism, 4);
        assert_eq!(config.logging.level, "warn");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_name_lists() {
        let config = SiteConfig::from_toml(EXAMPLE).unwrap();
        assert_eq!(config.groups["group1"].0, vec!["node1", "node2"]);
        assert_eq!(config.groups["group2"].0, vec!["node2"]);
        assert_eq!(config.function_role_map["func1"].0, vec!["settz", "motd"]);
        assert_eq!(config.deploy.parallelism, 8);
        assert_eq!(config.deploy.timeout_secs, 600);
    }

    #[test]
    fn test_relative_key_paths_resolve_against_site_root() {
        let temp_dir = tempdir().unwrap();
        let path = temp_dir.path().join(SITE_CONFIG_FILE);
        std::fs::write(&path, EXAMPLE).unwrap();

        let config = SiteConfig::from_file(&path).unwrap();
        assert_eq!(
            config.secrets.controller_age_path,
            Some(temp_dir.path().join("controller.age"))
        );
        assert_eq!(
            config.secrets.node_fallback_age_path,
            Some(PathBuf::from("/etc/roost/node.age"))
        );
        assert_eq!(config.secrets.decryption_key_candidates().len(), 2);
    }

    #[test]
    fn test_missing_file() {
        let err = SiteConfig::from_file("/nonexistent/site.toml").unwrap_err();
        assert!(matches!(err, RoostError::ConfigNotFound { .. }));
    }

    #[test]
    fn test_explicit_universal_group_rejected() {
        let toml_content = r#"
            name = "bad"
            [groups]
            universal = "node1"
            [node_function_map]
            node1 = "func1"
        "#;
        assert!(SiteConfig::from_toml(toml_content).is_err());
    }

    #[test]
    fn test_group_member_without_function_rejected() {
        let toml_content = r#"
            name = "bad"
            [groups]
            group1 = "ghost"
        "#;
        let err = SiteConfig::from_toml(toml_content).unwrap_err();
        assert!(err.to_string().contains("ghost"));
    }

    #[test]
    fn test_empty_name_rejected() {
        let mut config = SiteConfig::default();
        config.name = String::new();
        assert!(config.validate().is_err());
    }
}
