// SPDX-License-Identifier: AGPL-3.0-or-later
//! Structural checks for a site

use std::collections::BTreeSet;
use std::fmt;
use std::fs;
use std::path::Path;

use crate::site::{node_file, Site, GROUPS_DIR, NODES_DIR};

/// How serious a problem is
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    /// Worth knowing, but the site still works
    Warning,
    /// Some node cannot be applied
    Error,
}

/// One problem found in a site
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Issue {
    pub severity: Severity,
    pub message: String,
}

/// Every problem found in a site
#[derive(Debug, Default)]
pub struct ValidationReport {
    pub issues: Vec<Issue>,
}

impl ValidationReport {
    /// True if there are no errors; warnings are allowed
    pub fn is_valid(&self) -> bool {
        self.errors().next().is_none()
    }

    pub fn errors(&self) -> impl Iterator<Item = &Issue> {
        self.issues.iter().filter(|i| i.severity == Severity::Error)
    }

    pub fn warnings(&self) -> impl Iterator<Item = &Issue> {
        self.issues.iter().filter(|i| i.severity == Severity::Warning)
    }

    fn error(&mut self, message: String) {
        self.issues.push(Issue {
            severity: Severity::Error,
            message,
        });
    }

    fn warning(&mut self, message: String) {
        self.issues.push(Issue {
            severity: Severity::Warning,
            message,
        });
    }
}

impl fmt::Display for Issue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self.severity {
            Severity::Warning => "warning",
            Severity::Error => "error",
        };
        write!(f, "{}: {}", label, self.message)
    }
}

/// Check a loaded site for problems that would only surface at apply time
///
/// Does not decrypt anything or resolve role arguments.
pub fn validate(site: &Site) -> ValidationReport {
    let mut report = ValidationReport::default();
    let hosts = site.hosts();
    let config = site.config();

    for node in hosts.nodes() {
        let definition = match hosts.node(node) {
            Ok(definition) => definition,
            Err(_) => {
                report.error(format!(
                    "Node '{}' has no definition at {}",
                    node,
                    node_file(site.root(), node).display()
                ));
                continue;
            }
        };
        if definition.age_pubkey.is_none() {
            report.warning(format!(
                "Node '{}' has no age_pubkey; secrets cannot be encrypted for it",
                node
            ));
        }
        for role in definition.roles.keys() {
            if !hosts.role_registry().contains(role) {
                report.warning(format!("Node '{}' sets arguments for unknown role '{}'", node, role));
            }
        }
        if let Err(e) = hosts.node_rolename_list(node) {
            report.error(e.to_string());
        }
    }

    for (function, roles) in &hosts.topology().function_roles {
        for role in roles {
            if !hosts.role_registry().contains(role) {
                report.error(format!("Function '{}' lists unknown role '{}'", function, role));
            }
        }
        if hosts.function_nodes(function).is_empty() {
            report.warning(format!("Function '{}' has no nodes", function));
        }
    }

    for group in hosts.groups() {
        if let Some(definition) = hosts.group(group) {
            for role in definition.roles.keys() {
                if !hosts.role_registry().contains(role) {
                    report.warning(format!(
                        "Group '{}' sets arguments for unknown role '{}'",
                        group, role
                    ));
                }
            }
        }
    }

    let known_nodes: BTreeSet<&str> = hosts.nodes().collect();
    for stem in definition_stems(&site.root().join(NODES_DIR)) {
        if !known_nodes.contains(stem.as_str()) {
            report.warning(format!(
                "nodes/{}.toml is not listed in [node_function_map]",
                stem
            ));
        }
    }
    let known_groups: BTreeSet<&str> = hosts.groups().into_iter().collect();
    for stem in definition_stems(&site.root().join(GROUPS_DIR)) {
        if !known_groups.contains(stem.as_str()) {
            report.warning(format!("groups/{}.toml is not listed in [groups]", stem));
        }
    }

    if config.secrets.controller_age_pub.is_empty() {
        report.error("[secrets] controller_age_pub is not set".to_string());
    }
    if site.secrets().decryption_key().is_none() {
        report.warning("No decryption key found; secrets cannot be decrypted here".to_string());
    }

    report
}

/// File stems of `*.toml` files in a directory
fn definition_stems(dir: &Path) -> Vec<String> {
    let Ok(entries) = fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut stems: Vec<String> = entries
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.extension().is_some_and(|ext| ext == "toml"))
        .filter_map(|path| path.file_stem().map(|s| s.to_string_lossy().to_string()))
        .collect();
    stems.sort();
    stems
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agesecrets::RageEngine;
    use tempfile::tempdir;

    #[test]
    fn test_fresh_site_is_valid() {
        let temp_dir = tempdir().unwrap();
        Site::init(temp_dir.path(), "lab", &RageEngine::new()).unwrap();
        let report = validate(&Site::load(temp_dir.path()).unwrap());
        assert!(report.is_valid(), "{:?}", report.issues);
        assert_eq!(report.warnings().count(), 0);
    }

    #[test]
    fn test_reports_structural_problems() {
        let temp_dir = tempdir().unwrap();
        let root = temp_dir.path();
        fs::create_dir_all(root.join(NODES_DIR)).unwrap();
        fs::write(
            root.join("site.toml"),
            r#"
                name = "broken"
                [node_function_map]
                node1 = "web"
                node2 = "db"
                [function_role_map]
                web = "settz nginx"
            "#,
        )
        .unwrap();
        fs::write(root.join("nodes/node1.toml"), "address = \"10.0.0.1\"\n").unwrap();
        fs::write(root.join("nodes/stray.toml"), "address = \"10.0.0.9\"\n").unwrap();

        let report = validate(&Site::load(root).unwrap());
        assert!(!report.is_valid());

        let errors: Vec<String> = report.errors().map(|i| i.message.clone()).collect();
        assert!(errors.iter().any(|m| m.contains("'node2' has no definition")));
        assert!(errors.iter().any(|m| m.contains("unknown role 'nginx'")));
        assert!(errors.iter().any(|m| m.contains("controller_age_pub")));

        let warnings: Vec<String> = report.warnings().map(|i| i.to_string()).collect();
        assert!(warnings.iter().any(|m| m.contains("stray.toml")));
        assert!(warnings.iter().any(|m| m.contains("'node1' has no age_pubkey")));
    }
}
