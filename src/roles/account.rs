// SPDX-License-Identifier: AGPL-3.0-or-later
//! Local user accounts

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::fmt;
use tracing::{debug, info};

use crate::error::{Result, RoostError};
use crate::inventory::{Role, RoleBase, RoleDefinition};
use crate::localhost::Localhost;

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AccountArgs {
    pub username: String,
    /// Usually a secret reference
    #[serde(default)]
    pub password: Option<String>,
    pub shell: String,
    #[serde(default)]
    pub home: Option<String>,
    #[serde(default)]
    pub groups: Vec<String>,
}

impl fmt::Debug for AccountArgs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccountArgs")
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "[REDACTED]"))
            .field("shell", &self.shell)
            .field("home", &self.home)
            .field("groups", &self.groups)
            .finish()
    }
}

/// Creates a local user and sets its password
#[derive(Debug)]
pub struct Account {
    base: RoleBase,
    args: AccountArgs,
}

pub fn definition() -> RoleDefinition {
    RoleDefinition::new(|base, args: AccountArgs| Account { base, args })
        .with_default("shell", "/bin/sh")
        .with_default("groups", Value::Array(Vec::new()))
}

impl Account {
    /// Home directory, which need not exist until the role is applied
    pub fn homedir(&self) -> String {
        self.args
            .home
            .clone()
            .unwrap_or_else(|| format!("/home/{}", self.args.username))
    }

    async fn user_exists(&self, localhost: &Localhost) -> Result<bool> {
        if !localhost.exists("/etc/passwd") {
            return Ok(false);
        }
        let passwd = localhost.read_file("/etc/passwd").await?;
        let prefix = format!("{}:", self.args.username);
        Ok(passwd.lines().any(|line| line.starts_with(&prefix)))
    }
}

#[async_trait]
impl Role for Account {
    fn base(&self) -> &RoleBase {
        &self.base
    }

    async fn apply(&self, localhost: &Localhost) -> Result<()> {
        let username = &self.args.username;
        if username.is_empty() || username.contains(':') {
            return Err(RoostError::RoleFailed {
                role: self.name().to_string(),
                message: format!("Invalid username '{}'", username),
            });
        }

        let homedir = self.homedir();
        if self.user_exists(localhost).await? {
            debug!(user = %username, "User already exists");
        } else {
            let mut args = vec!["-m", "-d", homedir.as_str(), "-s", self.args.shell.as_str()];
            let groups = self.args.groups.join(",");
            if !groups.is_empty() {
                args.extend(["-G", groups.as_str()]);
            }
            args.push(username);
            localhost.run("useradd", &args).await?;
            info!(user = %username, home = %homedir, "Created user");
        }

        if let Some(password) = &self.args.password {
            localhost
                .run_with_input("chpasswd", &[], &format!("{}:{}\n", username, password))
                .await?;
            info!(user = %username, "Set password");
        }
        Ok(())
    }

    fn calculations(&self) -> Map<String, Value> {
        let mut calcs = Map::new();
        calcs.insert("username".to_string(), Value::String(self.args.username.clone()));
        calcs.insert("homedir".to_string(), Value::String(self.homedir()));
        calcs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inventory::{InventoryNode, RoleFiles};
    use serde_json::json;
    use std::sync::Arc;
    use tempfile::tempdir;

    fn account(args: Value) -> Arc<dyn Role> {
        let base = RoleBase {
            name: "account".to_string(),
            node: Arc::new(InventoryNode::new("node1", "10.0.0.1")),
            files: RoleFiles::default(),
        };
        let mut merged = definition().defaults().clone();
        if let Value::Object(args) = args {
            merged.extend(args);
        }
        definition().construct(base, merged).unwrap()
    }

    #[test]
    fn test_homedir_calculation() {
        let role = account(json!({"username": "ops"}));
        assert_eq!(role.calculations()["homedir"], json!("/home/ops"));

        let role = account(json!({"username": "svc", "home": "/srv/svc"}));
        assert_eq!(role.calculations()["homedir"], json!("/srv/svc"));
    }

    #[test]
    fn test_debug_hides_password() {
        let role = account(json!({"username": "ops", "password": "hunter2"}));
        let debug = format!("{:?}", role);
        assert!(!debug.contains("hunter2"));
        assert!(debug.contains("REDACTED"));
    }

    #[test]
    fn test_groups_must_be_a_list() {
        let base = RoleBase {
            name: "account".to_string(),
            node: Arc::new(InventoryNode::new("node1", "10.0.0.1")),
            files: RoleFiles::default(),
        };
        let mut args = definition().defaults().clone();
        args.insert("username".to_string(), json!("ops"));
        args.insert("groups".to_string(), json!("wheel"));
        assert!(matches!(
            definition().construct(base, args),
            Err(RoostError::InvalidRoleArguments { .. })
        ));
    }

    #[tokio::test]
    async fn test_apply_dry_run() {
        let temp_dir = tempdir().unwrap();
        let localhost = Localhost::new().with_root(temp_dir.path()).with_dry_run(true);
        let role = account(json!({"username": "ops", "password": "pw", "groups": ["wheel"]}));
        role.apply(&localhost).await.unwrap();
    }

    #[tokio::test]
    async fn test_rejects_bad_username() {
        let localhost = Localhost::new().with_dry_run(true);
        let role = account(json!({"username": "a:b"}));
        assert!(role.apply(&localhost).await.is_err());
    }
}
