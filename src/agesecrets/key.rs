// SPDX-License-Identifier: AGPL-3.0-or-later
//! Age keypairs in `age-keygen` format

use chrono::{DateTime, FixedOffset, SecondsFormat, Utc};
use std::fmt;
use std::fs;
use std::io::Write;
use std::path::Path;

use crate::error::{Result, RoostError};

const CREATED_PREFIX: &str = "# created: ";
const PUBLIC_KEY_PREFIX: &str = "# public key: ";

/// An age keypair
#[derive(Clone, PartialEq, Eq)]
pub struct AgeKey {
    /// The `AGE-SECRET-KEY-1...` line
    pub secret: String,
    /// The `age1...` recipient
    pub public: String,
    /// When the key was created
    pub created: DateTime<FixedOffset>,
}

impl AgeKey {
    /// Parse a key from `age-keygen` output
    ///
    /// Accepts the three-line form:
    ///
    /// ```text
    /// # created: 2022-09-28T16:01:22-05:00
    /// # public key: age14e42u048nehghjj3ch9mmnkdh4nsujn774klqxn02mznppx3gflsuj6y5m
    /// AGE-SECRET-KEY-1ASKGXED4DVGUH7SA50DHE2UHAYQ00PV87N2RQ5J5S6AUN9MLNSGQ3TKFGJ
    /// ```
    ///
    /// or a lone secret key line, in which case the public key is derived and
    /// the creation time is now.
    pub fn parse(contents: &str) -> std::result::Result<Self, String> {
        let lines: Vec<&str> = contents
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .collect();

        match lines.as_slice() {
            [created, public, secret] => {
                let created = created
                    .strip_prefix(CREATED_PREFIX)
                    .ok_or_else(|| format!("expected a '{}' line", CREATED_PREFIX.trim()))?;
                let created = DateTime::parse_from_rfc3339(created)
                    .map_err(|e| format!("bad creation time '{}': {}", created, e))?;
                let public = public
                    .strip_prefix(PUBLIC_KEY_PREFIX)
                    .ok_or_else(|| format!("expected a '{}' line", PUBLIC_KEY_PREFIX.trim()))?;
                Ok(Self {
                    secret: secret.to_string(),
                    public: public.to_string(),
                    created,
                })
            }
            [secret] => {
                let identity: age::x25519::Identity = secret.parse().map_err(|e: &str| e.to_string())?;
                Ok(Self {
                    secret: secret.to_string(),
                    public: identity.to_public().to_string(),
                    created: Utc::now().into(),
                })
            }
            _ => Err(format!(
                "expected 1 or 3 non-empty lines, found {}",
                lines.len()
            )),
        }
    }

    /// Load a key from a file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(RoostError::KeyFileNotFound {
                path: path.to_path_buf(),
            });
        }
        let contents = fs::read_to_string(path)?;
        Self::parse(&contents).map_err(|message| RoostError::MalformedKeyMaterial {
            path: path.display().to_string(),
            message,
        })
    }

    /// The key in `age-keygen` file format
    pub fn to_file_contents(&self) -> String {
        format!(
            "{}{}\n{}{}\n{}\n",
            CREATED_PREFIX,
            self.created.to_rfc3339_opts(SecondsFormat::Secs, false),
            PUBLIC_KEY_PREFIX,
            self.public,
            self.secret
        )
    }

    /// Write the key to a new file readable only by its owner
    ///
    /// Refuses to overwrite an existing file.
    pub fn write_to<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        #[cfg(unix)]
        let mut file = {
            use std::os::unix::fs::OpenOptionsExt;
            fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .mode(0o600)
                .open(path)?
        };

        #[cfg(not(unix))]
        let mut file = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)?;

        file.write_all(self.to_file_contents().as_bytes())?;
        Ok(())
    }
}

impl fmt::Debug for AgeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgeKey")
            .field("public", &self.public)
            .field("created", &self.created)
            .field("secret", &"[REDACTED]")
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use age::secrecy::ExposeSecret;
    use tempfile::tempdir;

    const KEYGEN_OUTPUT: &str = "\
# created: 2022-09-28T16:01:22-05:00
# public key: age14e42u048nehghjj3ch9mmnkdh4nsujn774klqxn02mznppx3gflsuj6y5m
AGE-SECRET-KEY-1ASKGXED4DVGUH7SA50DHE2UHAYQ00PV87N2RQ5J5S6AUN9MLNSGQ3TKFGJ
";

    #[test]
    fn test_parse_keygen_output() {
        let key = AgeKey::parse(KEYGEN_OUTPUT).unwrap();
        assert_eq!(
            key.public,
            "age14e42u048nehghjj3ch9mmnkdh4nsujn774klqxn02mznppx3gflsuj6y5m"
        );
        assert!(key.secret.starts_with("AGE-SECRET-KEY-1"));
        assert_eq!(key.created.offset().local_minus_utc(), -5 * 3600);
    }

    #[test]
    fn test_parse_bare_secret_derives_public_key() {
        let identity = age::x25519::Identity::generate();
        let secret = identity.to_string().expose_secret().clone();

        let key = AgeKey::parse(&format!("{}\n", secret)).unwrap();
        assert_eq!(key.public, identity.to_public().to_string());
    }

    #[test]
    fn test_parse_rejects_other_shapes() {
        assert!(AgeKey::parse("").is_err());
        assert!(AgeKey::parse("a\nb").is_err());
        assert!(AgeKey::parse("not a key").is_err());
        assert!(AgeKey::parse("# made: yesterday\n# public key: age1x\nAGE-SECRET-KEY-1X").is_err());
    }

    #[test]
    fn test_from_file_reports_path() {
        let temp_dir = tempdir().unwrap();
        let path = temp_dir.path().join("broken.age");
        fs::write(&path, "one\ntwo\n").unwrap();

        match AgeKey::from_file(&path).unwrap_err() {
            RoostError::MalformedKeyMaterial { path: reported, .. } => {
                assert_eq!(reported, path.display().to_string());
            }
            other => panic!("unexpected error: {other}"),
        }

        assert!(matches!(
            AgeKey::from_file(temp_dir.path().join("missing.age")),
            Err(RoostError::KeyFileNotFound { .. })
        ));
    }

    #[test]
    fn test_write_and_reload() {
        let temp_dir = tempdir().unwrap();
        let path = temp_dir.path().join("keys/node1.age");
        let key = AgeKey::parse(KEYGEN_OUTPUT).unwrap();

        key.write_to(&path).unwrap();
        assert_eq!(AgeKey::from_file(&path).unwrap(), key);
        assert!(key.write_to(&path).is_err());

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(&path).unwrap().permissions().mode() & 0o777;
            assert_eq!(mode, 0o600);
        }
    }

    #[test]
    fn test_debug_redacts_secret() {
        let key = AgeKey::parse(KEYGEN_OUTPUT).unwrap();
        let debug = format!("{:?}", key);
        assert!(!debug.contains("AGE-SECRET-KEY"));
        assert!(debug.contains("REDACTED"));
    }
}
