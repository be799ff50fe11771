//! Error and warning types shared by the discovery and gathering engines.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised by filesystem-facing operations.
#[derive(Debug, Error)]
pub enum GatherError {
    /// Permission denied for a path.
    #[error("Permission denied: {path}")]
    PermissionDenied { path: PathBuf },

    /// Path not found.
    #[error("Path not found: {path}")]
    NotFound { path: PathBuf },

    /// Generic I/O error.
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Path is expected to be a directory.
    #[error("Not a directory: {path}")]
    NotADirectory { path: PathBuf },

    /// The platform service backing an operation is not available.
    #[error("Unsupported operation: {message}")]
    Unsupported { message: String },

    /// Invalid configuration.
    #[error("Invalid configuration: {message}")]
    InvalidConfig { message: String },
}

impl From<derive_builder::UninitializedFieldError> for GatherError {
    fn from(err: derive_builder::UninitializedFieldError) -> Self {
        Self::InvalidConfig {
            message: err.to_string(),
        }
    }
}

impl GatherError {
    /// Create a configuration error.
    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            message: message.into(),
        }
    }

    /// Create an I/O error with path context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        let path = path.into();
        match source.kind() {
            std::io::ErrorKind::PermissionDenied => Self::PermissionDenied { path },
            std::io::ErrorKind::NotFound => Self::NotFound { path },
            _ => Self::Io { path, source },
        }
    }
}

/// Failure reported by an asset file reader.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ReadError {
    /// The file references a format version that is not registered yet.
    ///
    /// Retryable until the host reports that startup is complete.
    #[error("Custom version missing: {message}")]
    CustomVersionMissing { message: String },

    /// The file could not be opened or parsed.
    #[error("Read failed: {message}")]
    Failed { message: String },
}

impl ReadError {
    /// Create a terminal read failure.
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed {
            message: message.into(),
        }
    }

    /// Whether the failure may succeed later.
    pub fn is_custom_version_missing(&self) -> bool {
        matches!(self, Self::CustomVersionMissing { .. })
    }
}

/// Kind of gather warning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WarningKind {
    /// A directory listing failed.
    EnumerationFailed,
    /// An asset file could not be read.
    ReadFailed,
    /// Two files resolved to the same package with different extensions.
    ExtensionMismatch,
}

/// Non-fatal warning encountered while discovering or gathering.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatherWarning {
    /// Path where the warning occurred.
    pub path: PathBuf,
    /// Human-readable message.
    pub message: String,
    /// Kind of warning.
    pub kind: WarningKind,
}

impl GatherWarning {
    /// Create a new warning.
    pub fn new(path: impl Into<PathBuf>, message: impl Into<String>, kind: WarningKind) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
            kind,
        }
    }

    /// Create a read failure warning.
    pub fn read_failed(path: impl Into<PathBuf>, error: &ReadError) -> Self {
        let path = path.into();
        Self {
            message: format!("Could not read file: {error}"),
            path,
            kind: WarningKind::ReadFailed,
        }
    }

    /// Create an extension mismatch warning.
    pub fn extension_mismatch(path: impl Into<PathBuf>, package_name: &str, previous: &str) -> Self {
        let path = path.into();
        Self {
            message: format!(
                "Package {package_name} has been found with two different extensions; keeping {} over .{previous}",
                path.display()
            ),
            path,
            kind: WarningKind::ExtensionMismatch,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gather_error_io() {
        let err = GatherError::io(
            "/test/path",
            std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
        );
        assert!(matches!(err, GatherError::PermissionDenied { .. }));

        let err = GatherError::io(
            "/test/path",
            std::io::Error::new(std::io::ErrorKind::NotFound, "gone"),
        );
        assert!(matches!(err, GatherError::NotFound { .. }));
    }

    #[test]
    fn test_read_error_retryable() {
        let missing = ReadError::CustomVersionMissing {
            message: "PluginVersion".into(),
        };
        assert!(missing.is_custom_version_missing());
        assert!(!ReadError::failed("corrupt").is_custom_version_missing());
    }

    #[test]
    fn test_warning_creation() {
        let warning = GatherWarning::read_failed("/game/A.pkg", &ReadError::failed("bad header"));
        assert_eq!(warning.kind, WarningKind::ReadFailed);
        assert!(warning.message.contains("bad header"));
    }
}
