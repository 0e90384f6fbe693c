//! Privileged platform primitives
//!
//! Everything that needs root (file attributes, systemd, archives) goes
//! through the [`Platform`] trait so the engines can be exercised without it.

use crate::error::PlatformError;
use async_trait::async_trait;
use std::path::Path;
use std::process::Output;
use tokio::process::Command;
use tracing::debug;

/// Operations the agent needs from the host
#[async_trait]
pub trait Platform: Send + Sync {
    /// Whether the immutable attribute is set on `path`
    async fn query_immutable(&self, path: &Path) -> Result<bool, PlatformError>;

    /// Set the immutable attribute on `path`
    async fn set_immutable(&self, path: &Path) -> Result<(), PlatformError>;

    /// Whether the service unit is active
    async fn query_service_active(&self, name: &str) -> Result<bool, PlatformError>;

    /// Restart the service unit
    async fn restart_service(&self, name: &str) -> Result<(), PlatformError>;

    /// Pack the contents of `src` into the gzip tarball `dest`
    async fn create_archive(&self, src: &Path, dest: &Path) -> Result<(), PlatformError>;

    /// Unpack `archive` into `dest`
    async fn extract_archive(&self, archive: &Path, dest: &Path) -> Result<(), PlatformError>;
}

/// Linux implementation on top of e2fsprogs, systemd and tar
#[derive(Debug, Clone, Default)]
pub struct SystemPlatform;

impl SystemPlatform {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Platform for SystemPlatform {
    async fn query_immutable(&self, path: &Path) -> Result<bool, PlatformError> {
        let output = Command::new("lsattr").arg("-d").arg(path).output().await?;
        let target = path.display().to_string();
        check("lsattr", &target, &output)?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(parse_lsattr(&stdout))
    }

    async fn set_immutable(&self, path: &Path) -> Result<(), PlatformError> {
        let output = Command::new("chattr").arg("+i").arg(path).output().await?;
        check("chattr +i", &path.display().to_string(), &output)
    }

    async fn query_service_active(&self, name: &str) -> Result<bool, PlatformError> {
        // Exit status carries the answer; stdout is empty with --quiet
        let status = Command::new("systemctl")
            .args(["is-active", "--quiet", name])
            .status()
            .await?;
        debug!("systemctl is-active {} -> {:?}", name, status.code());
        Ok(status.success())
    }

    async fn restart_service(&self, name: &str) -> Result<(), PlatformError> {
        let output = Command::new("systemctl").args(["restart", name]).output().await?;
        check("systemctl restart", name, &output)
    }

    async fn create_archive(&self, src: &Path, dest: &Path) -> Result<(), PlatformError> {
        let output = Command::new("tar")
            .arg("-czf")
            .arg(dest)
            .arg("-C")
            .arg(src)
            .arg(".")
            .output()
            .await?;
        check("tar create", &src.display().to_string(), &output)
    }

    async fn extract_archive(&self, archive: &Path, dest: &Path) -> Result<(), PlatformError> {
        let output = Command::new("tar")
            .arg("-xzf")
            .arg(archive)
            .arg("-C")
            .arg(dest)
            .output()
            .await?;
        check("tar extract", &archive.display().to_string(), &output)
    }
}

/// Map a finished command to a result, classifying privilege failures
fn check(action: &'static str, target: &str, output: &Output) -> Result<(), PlatformError> {
    if output.status.success() {
        return Ok(());
    }

    let message = String::from_utf8_lossy(&output.stderr).trim().to_string();
    let message = if message.is_empty() {
        format!("exit status {}", output.status)
    } else {
        message
    };

    if is_privilege_message(&message) {
        Err(PlatformError::Denied {
            action,
            target: target.to_string(),
            message,
        })
    } else {
        Err(PlatformError::Failed {
            action,
            target: target.to_string(),
            message,
        })
    }
}

fn is_privilege_message(message: &str) -> bool {
    ["Operation not permitted", "Permission denied", "Access denied", "Interactive authentication required"]
        .iter()
        .any(|m| message.contains(m))
}

/// `lsattr -d` prints `<flags> <path>`; the `i` flag marks immutability
fn parse_lsattr(stdout: &str) -> bool {
    stdout
        .lines()
        .next()
        .and_then(|line| line.split_whitespace().next())
        .is_some_and(|flags| flags.contains('i'))
}

#[cfg(test)]
pub(crate) mod testing {
    //! Recording fake used by engine tests

    use super::*;
    use std::collections::{HashMap, HashSet};
    use std::path::PathBuf;
    use std::sync::Mutex;

    #[derive(Default)]
    pub struct FakePlatform {
        pub immutable: Mutex<HashSet<PathBuf>>,
        pub deny_set: Mutex<HashSet<PathBuf>>,
        pub active: Mutex<HashMap<String, bool>>,
        /// Restarting brings the service back up
        pub restart_heals: Mutex<bool>,
        pub restart_fails: Mutex<bool>,
        pub set_calls: Mutex<Vec<PathBuf>>,
        pub restart_calls: Mutex<Vec<String>>,
    }

    impl FakePlatform {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn set_active(&self, name: &str, up: bool) {
            self.active.lock().unwrap().insert(name.to_string(), up);
        }

        pub fn restarts(&self) -> usize {
            self.restart_calls.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl Platform for FakePlatform {
        async fn query_immutable(&self, path: &Path) -> Result<bool, PlatformError> {
            Ok(self.immutable.lock().unwrap().contains(path))
        }

        async fn set_immutable(&self, path: &Path) -> Result<(), PlatformError> {
            self.set_calls.lock().unwrap().push(path.to_path_buf());
            if self.deny_set.lock().unwrap().contains(path) {
                return Err(PlatformError::Denied {
                    action: "chattr +i",
                    target: path.display().to_string(),
                    message: "Operation not permitted".to_string(),
                });
            }
            self.immutable.lock().unwrap().insert(path.to_path_buf());
            Ok(())
        }

        async fn query_service_active(&self, name: &str) -> Result<bool, PlatformError> {
            Ok(self.active.lock().unwrap().get(name).copied().unwrap_or(false))
        }

        async fn restart_service(&self, name: &str) -> Result<(), PlatformError> {
            self.restart_calls.lock().unwrap().push(name.to_string());
            if *self.restart_fails.lock().unwrap() {
                return Err(PlatformError::Failed {
                    action: "systemctl restart",
                    target: name.to_string(),
                    message: "Job failed".to_string(),
                });
            }
            if *self.restart_heals.lock().unwrap() {
                self.set_active(name, true);
            }
            Ok(())
        }

        async fn create_archive(&self, src: &Path, dest: &Path) -> Result<(), PlatformError> {
            std::fs::write(dest, src.display().to_string())?;
            Ok(())
        }

        async fn extract_archive(&self, archive: &Path, dest: &Path) -> Result<(), PlatformError> {
            std::fs::copy(archive, dest.join("restored"))?;
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_lsattr() {
        assert!(parse_lsattr("----i---------e------- /etc/passwd\n"));
        assert!(!parse_lsattr("--------------e------- /etc/passwd\n"));
        assert!(!parse_lsattr(""));
    }

    #[test]
    fn test_privilege_message() {
        assert!(is_privilege_message("chattr: Operation not permitted while setting flags on /etc/passwd"));
        assert!(!is_privilege_message("chattr: No such file or directory"));
    }
}
