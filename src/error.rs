// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for Kea-Roost

use std::path::PathBuf;

use thiserror::Error;

/// Result type alias for Kea-Roost operations
pub type Result<T> = std::result::Result<T, RoostError>;

/// Errors that can occur while loading a site, resolving roles or handling secrets
#[derive(Error, Debug)]
pub enum RoostError {
    /// Site configuration file not found
    #[error("Configuration file not found: {path}")]
    ConfigNotFound { path: String },

    /// Invalid site configuration
    #[error("Invalid configuration: {message}")]
    InvalidConfig { message: String },

    /// A node name with no definition in the inventory
    #[error("Unknown node: {name}")]
    UnknownNode { name: String },

    /// A function name with no role list
    #[error("Unknown function '{name}' (assigned to node '{node}')")]
    UnknownFunction { name: String, node: String },

    /// A role name with no registered definition
    #[error("Unknown role '{name}' requested for node '{node}'")]
    UnknownRole { name: String, node: String },

    /// A group name with no definition in the inventory
    #[error("Unknown group: {name}")]
    UnknownGroup { name: String },

    /// Secret absent from the entity and every inherited scope
    #[error("Secret '{name}' not found for {scope}")]
    SecretNotFound { name: String, scope: String },

    /// No usable private key in the current context
    #[error("No age private key available to decrypt secrets{}", context_suffix(.context))]
    DecryptionKeyMissing { context: Option<String> },

    /// A key file or key string could not be parsed
    #[error("Malformed key material at {path}: {message}")]
    MalformedKeyMaterial { path: String, message: String },

    /// A node has no public key, so nothing can be encrypted for it
    #[error("Node '{node}' has no age public key")]
    MissingPublicKey { node: String },

    /// Encryption or decryption failed inside the crypto engine
    #[error("Crypto operation failed: {message}")]
    Crypto { message: String },

    /// Resolved arguments do not satisfy the role's shape
    #[error("Invalid arguments for role '{role}' on node '{node}': {message}")]
    InvalidRoleArguments {
        role: String,
        node: String,
        message: String,
    },

    /// Two non-universal groups set the same role argument to different values
    #[error(
        "Groups '{first}' and '{second}' both set '{key}' for role '{role}' on node '{node}'"
    )]
    GroupArgumentConflict {
        node: String,
        role: String,
        key: String,
        first: String,
        second: String,
    },

    /// A calculation reference chain revisits a role already being resolved
    #[error("Role resolution cycle on node '{node}': {}", .chain.join(" -> "))]
    RoleResolutionCycle { node: String, chain: Vec<String> },

    /// A calculation reference names a key the role does not calculate
    #[error("Role '{role}' on node '{node}' has no calculation named '{key}'")]
    CalculationNotFound {
        node: String,
        role: String,
        key: String,
    },

    /// A custom reference tag with no registered resolver
    #[error("No resolver registered for reference type '{tag}'")]
    UnknownReference { tag: String },

    /// Applying a role failed
    #[error("Role '{role}' failed: {message}")]
    RoleFailed { role: String, message: String },

    /// Node is marked as not-to-be-applied
    #[error("Refusing to apply node '{node}': testing_do_not_apply is set")]
    ApplyRefused { node: String },

    /// Remote transport operation failed
    #[error("Remote operation on '{target}' failed: {message}")]
    Transport { target: String, message: String },

    /// Command not found on the local system
    #[error("Command not found: {command}")]
    CommandNotFound { command: String },

    /// Key file path that should exist does not
    #[error("Key file not found: {}", .path.display())]
    KeyFileNotFound { path: PathBuf },

    /// IO error wrapper
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    /// TOML parsing error
    #[error("TOML parse error: {0}")]
    TomlError(#[from] toml::de::Error),

    /// JSON parsing error
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),
}

fn context_suffix(context: &Option<String>) -> String {
    match context {
        Some(context) => format!(" ({})", context),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cycle_message_lists_chain() {
        let err = RoostError::RoleResolutionCycle {
            node: "node1".to_string(),
            chain: vec!["a".to_string(), "b".to_string(), "a".to_string()],
        };
        assert_eq!(
            err.to_string(),
            "Role resolution cycle on node 'node1': a -> b -> a"
        );
    }

    #[test]
    fn test_decryption_key_missing_context() {
        let bare = RoostError::DecryptionKeyMissing { context: None };
        assert_eq!(bare.to_string(), "No age private key available to decrypt secrets");

        let with_context = RoostError::DecryptionKeyMissing {
            context: Some("secret 'db'".to_string()),
        };
        assert!(with_context.to_string().ends_with("(secret 'db')"));
    }
}
