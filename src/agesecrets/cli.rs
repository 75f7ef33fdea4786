// SPDX-License-Identifier: AGPL-3.0-or-later
//! Age encryption through the `age` and `age-keygen` binaries

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Output, Stdio};
use tracing::debug;

use super::{AgeEngine, AgeKey};
use crate::error::{Result, RoostError};

/// Age encryption by running the reference `age` tools
#[derive(Debug, Clone)]
pub struct AgeCliEngine {
    age: PathBuf,
    age_keygen: PathBuf,
}

impl Default for AgeCliEngine {
    fn default() -> Self {
        Self {
            age: PathBuf::from("age"),
            age_keygen: PathBuf::from("age-keygen"),
        }
    }
}

impl AgeCliEngine {
    /// Use `age` and `age-keygen` from `PATH`
    pub fn new() -> Self {
        Self::default()
    }

    /// Use binaries at specific locations
    pub fn with_binaries(age: impl Into<PathBuf>, age_keygen: impl Into<PathBuf>) -> Self {
        Self {
            age: age.into(),
            age_keygen: age_keygen.into(),
        }
    }

    fn run(&self, program: &Path, args: &[&str], input: Option<&str>) -> Result<String> {
        debug!(program = %program.display(), "Running age tool");

        let mut command = Command::new(program);
        command
            .args(args)
            .stdin(if input.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = command.spawn().map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => RoostError::CommandNotFound {
                command: program.display().to_string(),
            },
            _ => RoostError::IoError(e),
        })?;

        // Feed stdin from a second thread so a full stdout pipe cannot stall us
        let stdin = child.stdin.take();
        let output = std::thread::scope(|scope| -> Result<Output> {
            let feeder = match (input, stdin) {
                (Some(input), Some(mut stdin)) => {
                    Some(scope.spawn(move || stdin.write_all(input.as_bytes())))
                }
                _ => None,
            };
            let output = child.wait_with_output()?;
            if let Some(feeder) = feeder {
                match feeder.join() {
                    Ok(Err(e)) if e.kind() != std::io::ErrorKind::BrokenPipe => {
                        return Err(RoostError::IoError(e))
                    }
                    Ok(_) => {}
                    Err(_) => {
                        return Err(RoostError::Crypto {
                            message: format!("writing to {} panicked", program.display()),
                        })
                    }
                }
            }
            Ok(output)
        })?;
        if !output.status.success() {
            return Err(RoostError::Crypto {
                message: format!(
                    "{} failed with status {}: {}",
                    program.display(),
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            });
        }

        String::from_utf8(output.stdout).map_err(|e| RoostError::Crypto {
            message: e.to_string(),
        })
    }
}

impl AgeEngine for AgeCliEngine {
    fn encrypt(&self, plaintext: &str, recipients: &[String]) -> Result<String> {
        if recipients.is_empty() {
            return Err(RoostError::Crypto {
                message: "no recipients to encrypt to".to_string(),
            });
        }
        let mut args = vec!["--armor"];
        for recipient in recipients {
            args.push("--recipient");
            args.push(recipient);
        }
        self.run(&self.age, &args, Some(plaintext))
    }

    fn decrypt(&self, ciphertext: &str, identity: &Path) -> Result<String> {
        if !identity.exists() {
            return Err(RoostError::DecryptionKeyMissing {
                context: Some(format!("{} does not exist", identity.display())),
            });
        }
        let identity = identity.display().to_string();
        self.run(
            &self.age,
            &["--decrypt", "--identity", &identity],
            Some(ciphertext),
        )
    }

    fn generate_keypair(&self) -> Result<AgeKey> {
        let output = self.run(&self.age_keygen, &[], None)?;
        AgeKey::parse(&output).map_err(|message| RoostError::MalformedKeyMaterial {
            path: self.age_keygen.display().to_string(),
            message,
        })
    }
}
