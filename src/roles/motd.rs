// SPDX-License-Identifier: AGPL-3.0-or-later
//! Message of the day

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::info;

use crate::error::Result;
use crate::inventory::{Role, RoleBase, RoleDefinition};
use crate::localhost::Localhost;

const TEMPLATE: &str = "motd.template";

static FILES: &[(&str, &str)] = &[(TEMPLATE, include_str!("motd.template"))];

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MotdArgs {
    pub message: String,
    pub path: String,
}

/// Renders `motd.template` into the message of the day
///
/// A site can replace the template with `roles/motd/motd.template`.
#[derive(Debug)]
pub struct Motd {
    base: RoleBase,
    args: MotdArgs,
}

pub fn definition() -> RoleDefinition {
    RoleDefinition::new(|base, args: MotdArgs| Motd { base, args })
        .with_default("message", "")
        .with_default("path", "/etc/motd")
        .with_files(FILES)
}

impl Motd {
    /// The rendered message
    pub fn render(&self) -> Result<String> {
        let template = self.role_file(TEMPLATE)?.read_to_string()?;
        Ok(template
            .replace("{node}", &self.base.node.name)
            .replace("{address}", &self.base.node.address)
            .replace("{message}", self.args.message.trim_end()))
    }
}

#[async_trait]
impl Role for Motd {
    fn base(&self) -> &RoleBase {
        &self.base
    }

    async fn apply(&self, localhost: &Localhost) -> Result<()> {
        let contents = self.render()?;
        localhost
            .write_file(&self.args.path, &contents, Some(0o644))
            .await?;
        info!(node = %self.base.node.name, path = %self.args.path, "Wrote message of the day");
        Ok(())
    }

    fn calculations(&self) -> Map<String, Value> {
        let mut calcs = Map::new();
        calcs.insert("path".to_string(), Value::String(self.args.path.clone()));
        calcs
    }
}
