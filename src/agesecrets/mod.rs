// SPDX-License-Identifier: AGPL-3.0-or-later
//! Age-encrypted secret storage
//!
//! Every node has an age keypair; its public key lives in the node's
//! inventory file and the private key only on the node itself. The
//! controller has a keypair too, and every stored secret is encrypted to it.

mod cli;
mod engine;
mod key;
mod store;

use std::fmt::Debug;
use std::path::Path;

pub use cli::AgeCliEngine;
pub use engine::RageEngine;
pub use key::AgeKey;
pub use store::{AgeSecret, AgeSecretStore, AGE_KEY_ARGUMENT};

use crate::error::Result;

/// The encryption capability the secret store is built on
pub trait AgeEngine: Send + Sync + Debug {
    /// Encrypt to every recipient public key, returning ASCII-armored ciphertext
    fn encrypt(&self, plaintext: &str, recipients: &[String]) -> Result<String>;

    /// Decrypt armored ciphertext with the private key stored at `identity`
    fn decrypt(&self, ciphertext: &str, identity: &Path) -> Result<String>;

    /// Create a new keypair
    fn generate_keypair(&self) -> Result<AgeKey>;
}
