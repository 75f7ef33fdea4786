// SPDX-License-Identifier: AGPL-3.0-or-later
//! Roles shipped with roost
//!
//! | role      | arguments                                    | calculations           |
//! |-----------|----------------------------------------------|------------------------|
//! | `settz`   | `timezone`                                   | `timezone`             |
//! | `motd`    | `message`, `path`                            | `path`                 |
//! | `account` | `username`, `password`, `shell`, `home`, `groups` | `username`, `homedir` |

pub mod account;
pub mod motd;
pub mod settz;

use crate::inventory::RoleRegistry;

/// A registry holding every built-in role
pub fn builtin() -> RoleRegistry {
    RoleRegistry::new()
        .with("account", account::definition())
        .with("motd", motd::definition())
        .with("settz", settz::definition())
}
