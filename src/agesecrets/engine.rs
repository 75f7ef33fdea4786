// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-process age encryption

use age::armor::{ArmoredReader, ArmoredWriter, Format};
use age::secrecy::ExposeSecret;
use chrono::Utc;
use std::io::{Read, Write};
use std::path::Path;
use tracing::debug;

use super::{AgeEngine, AgeKey};
use crate::error::{Result, RoostError};

/// Age encryption using the `age` crate, with no external binaries
#[derive(Debug, Default, Clone)]
pub struct RageEngine;

impl RageEngine {
    /// Create an engine
    pub fn new() -> Self {
        Self
    }
}

fn crypto_error(e: impl std::fmt::Display) -> RoostError {
    RoostError::Crypto {
        message: e.to_string(),
    }
}

impl AgeEngine for RageEngine {
    fn encrypt(&self, plaintext: &str, recipients: &[String]) -> Result<String> {
        let parsed = recipients
            .iter()
            .map(|recipient| {
                recipient
                    .parse::<age::x25519::Recipient>()
                    .map(|r| Box::new(r) as Box<dyn age::Recipient + Send>)
                    .map_err(|e| RoostError::MalformedKeyMaterial {
                        path: recipient.clone(),
                        message: e.to_string(),
                    })
            })
            .collect::<Result<Vec<_>>>()?;

        let encryptor = age::Encryptor::with_recipients(parsed).ok_or_else(|| RoostError::Crypto {
            message: "no recipients to encrypt to".to_string(),
        })?;

        let mut encrypted = vec![];
        let armor = ArmoredWriter::wrap_output(&mut encrypted, Format::AsciiArmor)?;
        let mut writer = encryptor.wrap_output(armor).map_err(crypto_error)?;
        writer.write_all(plaintext.as_bytes())?;
        writer.finish().and_then(|armor| armor.finish())?;

        debug!(recipients = recipients.len(), "Encrypted value");
        String::from_utf8(encrypted).map_err(crypto_error)
    }

    fn decrypt(&self, ciphertext: &str, identity: &Path) -> Result<String> {
        let key = match AgeKey::from_file(identity) {
            Ok(key) => key,
            Err(RoostError::KeyFileNotFound { path }) => {
                return Err(RoostError::DecryptionKeyMissing {
                    context: Some(format!("{} does not exist", path.display())),
                })
            }
            Err(e) => return Err(e),
        };
        let identity_key: age::x25519::Identity =
            key.secret
                .parse()
                .map_err(|e: &str| RoostError::MalformedKeyMaterial {
                    path: identity.display().to_string(),
                    message: e.to_string(),
                })?;

        let armored = ArmoredReader::new(ciphertext.as_bytes());
        let age::Decryptor::Recipients(decryptor) =
            age::Decryptor::new(armored).map_err(crypto_error)?
        else {
            return Err(RoostError::Crypto {
                message: "passphrase-encrypted values are not supported".to_string(),
            });
        };

        let mut reader = decryptor
            .decrypt(std::iter::once(&identity_key as &dyn age::Identity))
            .map_err(|e| match e {
                age::DecryptError::NoMatchingKeys => RoostError::DecryptionKeyMissing {
                    context: Some(format!(
                        "{} is not a recipient of this value",
                        identity.display()
                    )),
                },
                other => crypto_error(other),
            })?;

        let mut plaintext = String::new();
        reader.read_to_string(&mut plaintext)?;
        Ok(plaintext)
    }

    fn generate_keypair(&self) -> Result<AgeKey> {
        let identity = age::x25519::Identity::generate();
        Ok(AgeKey {
            secret: identity.to_string().expose_secret().clone(),
            public: identity.to_public().to_string(),
            created: Utc::now().into(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_encrypt_decrypt_for_each_recipient() {
        let temp_dir = tempdir().unwrap();
        let engine = RageEngine::new();
        let alice = engine.generate_keypair().unwrap();
        let bob = engine.generate_keypair().unwrap();
        let alice_path = temp_dir.path().join("alice.age");
        let bob_path = temp_dir.path().join("bob.age");
        alice.write_to(&alice_path).unwrap();
        bob.write_to(&bob_path).unwrap();

        let ciphertext = engine
            .encrypt("p4ssw0rd", &[alice.public.clone(), bob.public.clone()])
            .unwrap();
        assert!(ciphertext.starts_with("-----BEGIN AGE ENCRYPTED FILE-----"));
        assert!(!ciphertext.contains("p4ssw0rd"));

        assert_eq!(engine.decrypt(&ciphertext, &alice_path).unwrap(), "p4ssw0rd");
        assert_eq!(engine.decrypt(&ciphertext, &bob_path).unwrap(), "p4ssw0rd");
    }

    #[test]
    fn test_wrong_key_is_missing_key() {
        let temp_dir = tempdir().unwrap();
        let engine = RageEngine::new();
        let alice = engine.generate_keypair().unwrap();
        let mallory = engine.generate_keypair().unwrap();
        let mallory_path = temp_dir.path().join("mallory.age");
        mallory.write_to(&mallory_path).unwrap();

        let ciphertext = engine.encrypt("secret", &[alice.public]).unwrap();
        assert!(matches!(
            engine.decrypt(&ciphertext, &mallory_path),
            Err(RoostError::DecryptionKeyMissing { .. })
        ));
        assert!(matches!(
            engine.decrypt(&ciphertext, &temp_dir.path().join("absent.age")),
            Err(RoostError::DecryptionKeyMissing { .. })
        ));
    }

    #[test]
    fn test_bad_recipient_rejected() {
        let engine = RageEngine::new();
        assert!(matches!(
            engine.encrypt("x", &["age1nope".to_string()]),
            Err(RoostError::MalformedKeyMaterial { .. })
        ));
        assert!(matches!(engine.encrypt("x", &[]), Err(RoostError::Crypto { .. })));
    }
}
