// SPDX-License-Identifier: AGPL-3.0-or-later
//! Secret store backed by age-encrypted JSON files in the site directory
//!
//! Layout:
//!
//! * `nodes/<node>.secrets.json`
//! * `groups/<group>.secrets.json`
//! * `controller.secrets.json` for the `special` collection
//!
//! Each file is one JSON object mapping secret names to armored ciphertext.

use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

use tracing::{debug, info};

use super::AgeEngine;
use crate::config::SecretsConfig;
use crate::error::{Result, RoostError};
use crate::inventory::{
    Collection, EncryptionRequest, HostStore, InventoryNode, Secret, SecretStore,
    CONTROLLER_ENTITY,
};

/// The one argument accepted by `--secret-store-arguments`
pub const AGE_KEY_ARGUMENT: &str = "age_key";

const SECRETS_SUFFIX: &str = ".secrets.json";

type SecretFile = BTreeMap<String, Arc<AgeSecret>>;

/// Age secret file store
///
/// Decrypts with the first existing key among the paths it is given (the
/// controller key, then the node fallback key), or with a key set later
/// through [`SecretStore::apply_cli_arguments`].
pub struct AgeSecretStore {
    root: PathBuf,
    controller_age_pub: String,
    decryption_key: Option<PathBuf>,
    engine: Arc<dyn AgeEngine>,
    cache: RefCell<BTreeMap<(Collection, String), SecretFile>>,
}

/// An age-encrypted value
///
/// Decrypted at most once; the plaintext is kept for the life of the value.
pub struct AgeSecret {
    ciphertext: String,
    key_path: Option<PathBuf>,
    engine: Arc<dyn AgeEngine>,
    plaintext: OnceLock<String>,
}

impl AgeSecret {
    /// Wrap ciphertext, to be decrypted with the key at `key_path`
    pub fn new(
        ciphertext: impl Into<String>,
        key_path: Option<PathBuf>,
        engine: Arc<dyn AgeEngine>,
    ) -> Self {
        Self {
            ciphertext: ciphertext.into(),
            key_path,
            engine,
            plaintext: OnceLock::new(),
        }
    }
}

impl Secret for AgeSecret {
    fn ciphertext(&self) -> &str {
        &self.ciphertext
    }

    fn decrypt(&self) -> Result<String> {
        if let Some(plaintext) = self.plaintext.get() {
            return Ok(plaintext.clone());
        }
        let key_path = self
            .key_path
            .as_deref()
            .ok_or(RoostError::DecryptionKeyMissing { context: None })?;
        let plaintext = self.engine.decrypt(&self.ciphertext, key_path)?;
        Ok(self.plaintext.get_or_init(|| plaintext).clone())
    }
}

impl fmt::Debug for AgeSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgeSecret")
            .field("key_path", &self.key_path)
            .field("decrypted", &self.plaintext.get().is_some())
            .finish_non_exhaustive()
    }
}

impl AgeSecretStore {
    /// Create a store rooted at a site directory
    ///
    /// `key_candidates` are tried in order; the first that exists becomes the
    /// decryption key. If none exists, secrets can still be listed and
    /// encrypted, but not decrypted.
    pub fn new(
        root: impl Into<PathBuf>,
        controller_age_pub: impl Into<String>,
        key_candidates: &[PathBuf],
        engine: Arc<dyn AgeEngine>,
    ) -> Self {
        let mut decryption_key = None;
        for candidate in key_candidates {
            if candidate.exists() {
                debug!(path = %candidate.display(), "Found decryption key");
                decryption_key = Some(candidate.clone());
                break;
            }
            debug!(path = %candidate.display(), "No decryption key");
        }

        Self {
            root: root.into(),
            controller_age_pub: controller_age_pub.into(),
            decryption_key,
            engine,
            cache: RefCell::new(BTreeMap::new()),
        }
    }

    /// Create a store from the `[secrets]` section of a site configuration
    pub fn from_config(
        root: impl Into<PathBuf>,
        config: &SecretsConfig,
        engine: Arc<dyn AgeEngine>,
    ) -> Self {
        Self::new(
            root,
            config.controller_age_pub.clone(),
            &config.decryption_key_candidates(),
            engine,
        )
    }

    /// The key used for decryption, if one was found
    pub fn decryption_key(&self) -> Option<&Path> {
        self.decryption_key.as_deref()
    }

    /// Decrypt with a different key from now on
    pub fn set_decryption_key(&mut self, path: impl Into<PathBuf>) {
        self.decryption_key = Some(path.into());
        self.cache.borrow_mut().clear();
    }

    /// The controller's public key
    pub fn controller_age_pub(&self) -> &str {
        &self.controller_age_pub
    }

    /// The engine doing the encryption
    pub fn engine(&self) -> &Arc<dyn AgeEngine> {
        &self.engine
    }

    /// Path of the file holding an entity's secrets
    pub fn secrets_file(&self, collection: Collection, entity: &str) -> Result<PathBuf> {
        let filename = format!("{}{}", entity, SECRETS_SUFFIX);
        match collection {
            Collection::Node => Ok(self.root.join("nodes").join(filename)),
            Collection::Group => Ok(self.root.join("groups").join(filename)),
            Collection::Special if entity == CONTROLLER_ENTITY => Ok(self.root.join(filename)),
            Collection::Special => Err(RoostError::InvalidConfig {
                message: format!(
                    "The special collection only holds '{}' secrets, not '{}'",
                    CONTROLLER_ENTITY, entity
                ),
            }),
        }
    }

    fn read_file(&self, collection: Collection, entity: &str) -> Result<BTreeMap<String, String>> {
        // Only the controller has special secrets; anyone else simply has none
        if collection == Collection::Special && entity != CONTROLLER_ENTITY {
            return Ok(BTreeMap::new());
        }
        let path = self.secrets_file(collection, entity)?;
        if !path.exists() {
            return Ok(BTreeMap::new());
        }
        let contents = fs::read_to_string(&path)?;
        serde_json::from_str(&contents).map_err(|e| RoostError::InvalidConfig {
            message: format!("{}: {}", path.display(), e),
        })
    }

    fn load(&self, collection: Collection, entity: &str) -> Result<SecretFile> {
        let key = (collection, entity.to_string());
        if let Some(secrets) = self.cache.borrow().get(&key) {
            return Ok(secrets.clone());
        }

        let secrets: SecretFile = self
            .read_file(collection, entity)?
            .into_iter()
            .map(|(name, ciphertext)| {
                let secret = AgeSecret::new(
                    ciphertext,
                    self.decryption_key.clone(),
                    Arc::clone(&self.engine),
                );
                (name, Arc::new(secret))
            })
            .collect();

        self.cache.borrow_mut().insert(key, secrets.clone());
        Ok(secrets)
    }

    fn save(&self, collection: Collection, entity: &str, name: &str, ciphertext: &str) -> Result<()> {
        let path = self.secrets_file(collection, entity)?;
        let mut contents = self.read_file(collection, entity)?;
        contents.insert(name.to_string(), ciphertext.to_string());

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut json = serde_json::to_string_pretty(&contents)?;
        json.push('\n');
        fs::write(&path, json)?;

        self.cache
            .borrow_mut()
            .remove(&(collection, entity.to_string()));
        info!(collection = %collection, entity = %entity, secret = %name, "Stored secret");
        Ok(())
    }
}

impl SecretStore for AgeSecretStore {
    fn list_secrets(&self, collection: Collection, entity: &str) -> Result<Vec<String>> {
        Ok(self.load(collection, entity)?.into_keys().collect())
    }

    fn get_secret(
        &self,
        collection: Collection,
        entity: &str,
        name: &str,
    ) -> Result<Arc<dyn Secret>> {
        self.load(collection, entity)?
            .remove(name)
            .map(|secret| secret as Arc<dyn Secret>)
            .ok_or_else(|| RoostError::SecretNotFound {
                name: name.to_string(),
                scope: format!("{} '{}'", collection, entity),
            })
    }

    fn encrypt_secret(&self, hosts: &HostStore, request: &EncryptionRequest) -> Result<String> {
        if request.store && request.name.is_empty() {
            return Err(RoostError::InvalidConfig {
                message: "A stored secret needs a name".to_string(),
            });
        }
        if request.store
            && request.nodes.is_empty()
            && request.groups.is_empty()
            && !request.controller_key
        {
            return Err(RoostError::InvalidConfig {
                message: format!(
                    "Secret '{}' has nowhere to be stored: name a node, a group or the controller",
                    request.name
                ),
            });
        }

        let mut recipients: BTreeSet<&str> = request.nodes.iter().map(String::as_str).collect();
        for group in &request.groups {
            recipients.extend(hosts.group_members(group)?.iter().map(String::as_str));
        }

        let mut pubkeys = BTreeSet::new();
        for recipient in &recipients {
            let node = hosts.node(recipient)?;
            let pubkey = node
                .age_pubkey
                .clone()
                .ok_or_else(|| RoostError::MissingPublicKey {
                    node: recipient.to_string(),
                })?;
            pubkeys.insert(pubkey);
        }

        if request.controller_key || request.store {
            if self.controller_age_pub.is_empty() {
                return Err(RoostError::MissingPublicKey {
                    node: CONTROLLER_ENTITY.to_string(),
                });
            }
            pubkeys.insert(self.controller_age_pub.clone());
        }

        let pubkeys: Vec<String> = pubkeys.into_iter().collect();
        let ciphertext = self.engine.encrypt(&request.value, &pubkeys)?;
        debug!(
            secret = %request.name,
            nodes = ?recipients,
            keys = pubkeys.len(),
            "Encrypted secret"
        );

        if request.store {
            for node in &request.nodes {
                self.save(Collection::Node, node, &request.name, &ciphertext)?;
            }
            for group in &request.groups {
                self.save(Collection::Group, group, &request.name, &ciphertext)?;
            }
            if request.controller_key {
                self.save(
                    Collection::Special,
                    CONTROLLER_ENTITY,
                    &request.name,
                    &ciphertext,
                )?;
            }
        }

        Ok(ciphertext)
    }

    fn apply_cli_arguments(&mut self, args: &BTreeMap<String, String>) -> Result<()> {
        for (key, value) in args {
            if key == AGE_KEY_ARGUMENT {
                self.set_decryption_key(value);
            } else {
                return Err(RoostError::InvalidConfig {
                    message: format!(
                        "Unknown secret store argument '{}' (expected '{}')",
                        key, AGE_KEY_ARGUMENT
                    ),
                });
            }
        }
        Ok(())
    }

    fn find_node_key(&self, node: &InventoryNode) -> Result<Option<PathBuf>> {
        match &node.age_key_path {
            Some(path) if path.exists() => Ok(Some(path.clone())),
            Some(path) => Err(RoostError::KeyFileNotFound { path: path.clone() }),
            None => Ok(None),
        }
    }
}

impl fmt::Debug for AgeSecretStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgeSecretStore")
            .field("root", &self.root)
            .field("controller_age_pub", &self.controller_age_pub)
            .field("decryption_key", &self.decryption_key)
            .field("engine", &self.engine)
            .finish_non_exhaustive()
    }
}
