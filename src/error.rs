//! Error types shared by the policy store and platform adapter

use std::path::PathBuf;
use thiserror::Error;

/// Policy and agent configuration errors
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ConfigError {
    #[error("Configuration file not found: {path}")]
    Missing { path: PathBuf },

    #[error("Malformed configuration in {path} at line {line}: {message}")]
    Malformed {
        path: PathBuf,
        line: usize,
        message: String,
    },

    #[error("Configuration section not found: {0}")]
    SectionNotFound(String),

    #[error("Entry {index} out of range for section {section} ({len} entries)")]
    EntryOutOfRange {
        section: String,
        index: usize,
        len: usize,
    },

    #[error("IO error on configuration: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid YAML configuration: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Failure of a privileged platform primitive
#[derive(Debug, Error)]
pub enum PlatformError {
    #[error("Permission denied: {action} {target}: {message}")]
    Denied {
        action: &'static str,
        target: String,
        message: String,
    },

    #[error("{action} {target} failed: {message}")]
    Failed {
        action: &'static str,
        target: String,
        message: String,
    },

    #[error("IO error invoking platform primitive: {0}")]
    Io(#[from] std::io::Error),
}

impl PlatformError {
    /// Whether the failure was a privilege restriction
    pub fn is_denied(&self) -> bool {
        matches!(self, PlatformError::Denied { .. })
            || matches!(self, PlatformError::Io(e) if e.kind() == std::io::ErrorKind::PermissionDenied)
    }
}
