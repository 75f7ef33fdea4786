// SPDX-License-Identifier: AGPL-3.0-or-later
//! The machine roles are applied to
//!
//! Roles never touch the filesystem or spawn processes directly; they go
//! through [`Localhost`], which can be pointed at an alternate root directory
//! or put in dry-run mode.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, info};

use crate::error::{Result, RoostError};

/// Default timeout for commands run by roles
pub const DEFAULT_COMMAND_TIMEOUT_SECS: u64 = 300;

/// Local machine operations for roles
#[derive(Debug, Clone)]
pub struct Localhost {
    root: PathBuf,
    dry_run: bool,
    timeout_secs: u64,
}

impl Default for Localhost {
    fn default() -> Self {
        Self {
            root: PathBuf::from("/"),
            dry_run: false,
            timeout_secs: DEFAULT_COMMAND_TIMEOUT_SECS,
        }
    }
}

impl Localhost {
    /// Operate on the real root filesystem
    pub fn new() -> Self {
        Self::default()
    }

    /// Treat `root` as `/` for file operations
    pub fn with_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.root = root.into();
        self
    }

    /// Log instead of changing anything
    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// Timeout for each command
    pub fn with_timeout_secs(mut self, timeout_secs: u64) -> Self {
        self.timeout_secs = timeout_secs;
        self
    }

    /// Whether this is a dry run
    pub fn is_dry_run(&self) -> bool {
        self.dry_run
    }

    /// Map an absolute path on the managed system to a real path
    pub fn path(&self, path: impl AsRef<Path>) -> PathBuf {
        let path = path.as_ref();
        self.root
            .join(path.strip_prefix("/").unwrap_or(path))
    }

    /// Whether a path exists
    pub fn exists(&self, path: impl AsRef<Path>) -> bool {
        self.path(path).exists()
    }

    /// Run a command, returning its standard output
    pub async fn run(&self, program: &str, args: &[&str]) -> Result<String> {
        self.execute(program, args, None).await
    }

    /// Run a command with data on its standard input
    ///
    /// The input is not logged.
    pub async fn run_with_input(&self, program: &str, args: &[&str], input: &str) -> Result<String> {
        self.execute(program, args, Some(input)).await
    }

    async fn execute(&self, program: &str, args: &[&str], input: Option<&str>) -> Result<String> {
        let command_line = std::iter::once(program)
            .chain(args.iter().copied())
            .collect::<Vec<_>>()
            .join(" ");
        info!(command = %command_line, "Running command");

        if self.dry_run {
            return Ok(format!("[DRY RUN] Would execute: {}", command_line));
        }

        let mut command = Command::new(program);
        command
            .args(args)
            .stdin(if input.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command.spawn().map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => RoostError::CommandNotFound {
                command: program.to_string(),
            },
            _ => RoostError::IoError(e),
        })?;

        // stdin is fed while output is drained; both run under the timeout
        let stdin = child.stdin.take();
        let feed = async move {
            if let (Some(input), Some(mut stdin)) = (input, stdin) {
                match stdin.write_all(input.as_bytes()).await {
                    Err(e) if e.kind() != std::io::ErrorKind::BrokenPipe => return Err(e),
                    _ => {}
                }
            }
            Ok(())
        };
        let run = async {
            let (fed, output) = tokio::join!(feed, child.wait_with_output());
            fed?;
            output
        };

        let duration = Duration::from_secs(self.timeout_secs);
        match timeout(duration, run).await {
            Ok(Ok(output)) => {
                let stdout = String::from_utf8_lossy(&output.stdout).to_string();
                if output.status.success() {
                    debug!(command = %command_line, "Command succeeded");
                    Ok(stdout)
                } else {
                    let stderr = String::from_utf8_lossy(&output.stderr);
                    Err(RoostError::RoleFailed {
                        role: program.to_string(),
                        message: format!(
                            "Command failed with status {}: {}",
                            output.status,
                            stderr.trim()
                        ),
                    })
                }
            }
            Ok(Err(e)) => Err(RoostError::RoleFailed {
                role: program.to_string(),
                message: format!("Failed to execute command: {}", e),
            }),
            Err(_) => Err(RoostError::RoleFailed {
                role: program.to_string(),
                message: format!("Command timed out after {} seconds", self.timeout_secs),
            }),
        }
    }

    /// Read a file
    pub async fn read_file(&self, path: impl AsRef<Path>) -> Result<String> {
        Ok(tokio::fs::read_to_string(self.path(path)).await?)
    }

    /// Write a file, creating parent directories, optionally setting its mode
    pub async fn write_file(
        &self,
        path: impl AsRef<Path>,
        contents: &str,
        mode: Option<u32>,
    ) -> Result<()> {
        let target = self.path(&path);
        info!(path = %path.as_ref().display(), "Writing file");

        if self.dry_run {
            return Ok(());
        }

        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&target, contents).await?;
        if let Some(mode) = mode {
            set_mode(&target, mode).await?;
        }
        Ok(())
    }

    /// Copy a file within the managed system
    pub async fn copy_file(&self, from: impl AsRef<Path>, to: impl AsRef<Path>) -> Result<()> {
        let source = self.path(&from);
        let target = self.path(&to);
        info!(
            from = %from.as_ref().display(),
            to = %to.as_ref().display(),
            "Copying file"
        );

        if self.dry_run {
            return Ok(());
        }

        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        // Replace rather than write through, in case the target is a symlink
        if tokio::fs::symlink_metadata(&target).await.is_ok() {
            tokio::fs::remove_file(&target).await?;
        }
        tokio::fs::copy(&source, &target).await?;
        Ok(())
    }
}

#[cfg(unix)]
async fn set_mode(path: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(mode)).await?;
    Ok(())
}

#[cfg(not(unix))]
async fn set_mode(_path: &Path, _mode: u32) -> Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_paths_map_under_root() {
        let localhost = Localhost::new().with_root("/srv/chroot");
        assert_eq!(localhost.path("/etc/motd"), PathBuf::from("/srv/chroot/etc/motd"));
        assert_eq!(localhost.path("etc/motd"), PathBuf::from("/srv/chroot/etc/motd"));
        assert_eq!(Localhost::new().path("/etc/motd"), PathBuf::from("/etc/motd"));
    }

    #[tokio::test]
    async fn test_write_read_and_copy() {
        let temp_dir = tempdir().unwrap();
        let localhost = Localhost::new().with_root(temp_dir.path());

        localhost.write_file("/etc/timezone", "UTC\n", Some(0o644)).await.unwrap();
        assert_eq!(localhost.read_file("/etc/timezone").await.unwrap(), "UTC\n");

        localhost.copy_file("/etc/timezone", "/etc/copy").await.unwrap();
        localhost.copy_file("/etc/timezone", "/etc/copy").await.unwrap();
        assert!(localhost.exists("/etc/copy"));
    }

    #[tokio::test]
    async fn test_dry_run_changes_nothing() {
        let temp_dir = tempdir().unwrap();
        let localhost = Localhost::new().with_root(temp_dir.path()).with_dry_run(true);

        localhost.write_file("/etc/motd", "hi", None).await.unwrap();
        assert!(!localhost.exists("/etc/motd"));

        let output = localhost.run("useradd", &["ops"]).await.unwrap();
        assert!(output.contains("[DRY RUN]"));
        assert!(output.contains("useradd ops"));
    }

    #[tokio::test]
    async fn test_run_command() {
        let localhost = Localhost::new();
        let output = localhost.run("echo", &["hello"]).await.unwrap();
        assert_eq!(output.trim(), "hello");

        let output = localhost.run_with_input("cat", &[], "piped").await.unwrap();
        assert_eq!(output, "piped");
    }

    #[tokio::test]
    async fn test_run_failures() {
        let localhost = Localhost::new();
        assert!(matches!(
            localhost.run("definitely-not-a-command-roost", &[]).await,
            Err(RoostError::CommandNotFound { .. })
        ));
        assert!(matches!(
            localhost.run("false", &[]).await,
            Err(RoostError::RoleFailed { .. })
        ));

        let slow = Localhost::new().with_timeout_secs(1);
        let err = slow.run("sleep", &["5"]).await.unwrap_err();
        assert!(err.to_string().contains("timed out"));
    }

    #[tokio::test]
    async fn test_large_input_is_streamed() {
        let localhost = Localhost::new().with_timeout_secs(30);
        let input = "y".repeat(1 << 20);
        let output = localhost.run_with_input("cat", &[], &input).await.unwrap();
        assert_eq!(output.len(), input.len());
    }

    #[tokio::test]
    async fn test_timeout_covers_writing_input() {
        // sleep never reads, so writing 1 MiB blocks until the timeout
        let localhost = Localhost::new().with_timeout_secs(1);
        let input = "y".repeat(1 << 20);
        let err = localhost
            .run_with_input("sleep", &["30"], &input)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("timed out"));
    }
}
