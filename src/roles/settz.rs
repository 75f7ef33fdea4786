// SPDX-License-Identifier: AGPL-3.0-or-later
//! Set the system timezone

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::info;

use crate::error::{Result, RoostError};
use crate::inventory::{Role, RoleBase, RoleDefinition};
use crate::localhost::Localhost;

const ZONEINFO: &str = "/usr/share/zoneinfo";

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SettzArgs {
    pub timezone: String,
}

/// Points `/etc/localtime` at a zoneinfo file and records the zone in `/etc/timezone`
#[derive(Debug)]
pub struct Settz {
    base: RoleBase,
    args: SettzArgs,
}

impl Settz {
    pub fn timezone(&self) -> &str {
        &self.args.timezone
    }
}

pub fn definition() -> RoleDefinition {
    RoleDefinition::new(|base, args: SettzArgs| Settz { base, args }).with_default("timezone", "UTC")
}

#[async_trait]
impl Role for Settz {
    fn base(&self) -> &RoleBase {
        &self.base
    }

    async fn apply(&self, localhost: &Localhost) -> Result<()> {
        let timezone = &self.args.timezone;
        if timezone.split('/').any(|part| part.is_empty() || part == "..") {
            return Err(RoostError::RoleFailed {
                role: self.name().to_string(),
                message: format!("Invalid timezone '{}'", timezone),
            });
        }

        let zonefile = format!("{}/{}", ZONEINFO, timezone);
        if !localhost.is_dry_run() && !localhost.exists(&zonefile) {
            return Err(RoostError::RoleFailed {
                role: self.name().to_string(),
                message: format!("No zoneinfo for '{}' at {}", timezone, zonefile),
            });
        }

        localhost.copy_file(&zonefile, "/etc/localtime").await?;
        localhost
            .write_file("/etc/timezone", &format!("{}\n", timezone), Some(0o644))
            .await?;
        info!(node = %self.base.node.name, timezone = %timezone, "Set timezone");
        Ok(())
    }

    fn calculations(&self) -> Map<String, Value> {
        let mut calcs = Map::new();
        calcs.insert("timezone".to_string(), Value::String(self.args.timezone.clone()));
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

    fn settz(timezone: &str) -> Arc<dyn Role> {
        let base = RoleBase {
            name: "settz".to_string(),
            node: Arc::new(InventoryNode::new("node1", "10.0.0.1")),
            files: RoleFiles::default(),
        };
        let mut args = Map::new();
        args.insert("timezone".to_string(), json!(timezone));
        definition().construct(base, args).unwrap()
    }

    #[tokio::test]
    async fn test_apply_sets_timezone() {
        let temp_dir = tempdir().unwrap();
        let localhost = Localhost::new().with_root(temp_dir.path());
        localhost
            .write_file("/usr/share/zoneinfo/US/Pacific", "TZif-pacific", None)
            .await
            .unwrap();

        settz("US/Pacific").apply(&localhost).await.unwrap();

        assert_eq!(localhost.read_file("/etc/localtime").await.unwrap(), "TZif-pacific");
        assert_eq!(localhost.read_file("/etc/timezone").await.unwrap(), "US/Pacific\n");
    }

    #[tokio::test]
    async fn test_unknown_zone_fails() {
        let temp_dir = tempdir().unwrap();
        let localhost = Localhost::new().with_root(temp_dir.path());
        assert!(settz("Mars/Olympus").apply(&localhost).await.is_err());
        assert!(settz("../../etc/passwd").apply(&localhost).await.is_err());
    }

    #[test]
    fn test_calculates_timezone() {
        assert_eq!(settz("UTC").calculations()["timezone"], json!("UTC"));
    }
}
