// SPDX-License-Identifier: AGPL-3.0-or-later
//! Kea-Roost: inventory-driven configuration management for the Kea ecosystem
//!
//! A site describes nodes, the groups they belong to and the function each
//! one performs. Each function is an ordered list of roles. Roost resolves
//! every role's arguments for a node, layering role defaults, group
//! arguments and node arguments, and dereferences secrets, calculations and
//! site data before the role ever sees them.
//!
//! # Features
//!
//! * **Layered arguments:** `universal` group, then other groups, then the node
//! * **Age secrets:** per-node, per-group and controller-only collections
//! * **References:** role arguments may point at secrets, other roles'
//!   calculations or custom resolvers
//! * **Deployment:** copy the site to nodes and apply it over SSH

pub mod agesecrets;
pub mod config;
pub mod deploy;
pub mod error;
pub mod inventory;
pub mod localhost;
pub mod roles;
pub mod site;
pub mod validate;

pub use config::SiteConfig;
pub use error::{Result, RoostError};
pub use site::{ApplyOptions, Site};
