//! DG-prefixed error types with structured error codes.

#![allow(missing_docs)]

use std::path::{Path, PathBuf};

use thiserror::Error;

/// Shared `Result` alias for the project.
pub type Result<T> = std::result::Result<T, GlassError>;

/// Top-level error type for DEEPGLASS.
#[derive(Debug, Error)]
pub enum GlassError {
    #[error("[DG-1001] invalid configuration: {details}")]
    InvalidConfig { details: String },

    #[error("[DG-1002] configuration parse failure in {context}: {details}")]
    ConfigParse {
        context: &'static str,
        details: String,
    },

    #[error("[DG-2001] {path} cannot be read: {details}")]
    IoUnavailable { path: PathBuf, details: String },

    #[error("[DG-2002] memory at {address:#x} in PID {pid} cannot be read")]
    MemoryUnavailable { pid: u32, address: u64 },

    #[error("[DG-2003] malformed image: {details}")]
    MalformedImage { details: String },

    #[error("[DG-3001] access denied for {path}")]
    AccessDenied { path: PathBuf },

    #[error("[DG-3002] IO failure at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("[DG-3003] {operation} timed out after {millis} ms")]
    Timeout {
        operation: &'static str,
        millis: u64,
    },

    #[error("[DG-3004] worker pool task failed: {details}")]
    TaskFailed { details: String },

    #[error("[DG-4001] report initialization failure at {path}: {details}")]
    ReportInit { path: PathBuf, details: String },

    #[error("[DG-4002] serialization failure in {context}: {details}")]
    Serialization {
        context: &'static str,
        details: String,
    },

    #[error("[DG-9000] runtime failure: {details}")]
    Runtime { details: String },
}

impl GlassError {
    /// Stable machine-parseable error code.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::InvalidConfig { .. } => "DG-1001",
            Self::ConfigParse { .. } => "DG-1002",
            Self::IoUnavailable { .. } => "DG-2001",
            Self::MemoryUnavailable { .. } => "DG-2002",
            Self::MalformedImage { .. } => "DG-2003",
            Self::AccessDenied { .. } => "DG-3001",
            Self::Io { .. } => "DG-3002",
            Self::Timeout { .. } => "DG-3003",
            Self::TaskFailed { .. } => "DG-3004",
            Self::ReportInit { .. } => "DG-4001",
            Self::Serialization { .. } => "DG-4002",
            Self::Runtime { .. } => "DG-9000",
        }
    }

    /// Whether the error aborts the whole run. Everything except a failed
    /// results-directory initialization is survivable (the engines log and
    /// continue with whatever SuspectSet exists).
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::ReportInit { .. })
    }

    /// Convenience constructor for IO errors with a known path.
    #[must_use]
    pub fn io(path: impl AsRef<Path>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }

    /// Convenience constructor for unreadable files and directories.
    #[must_use]
    pub fn unavailable(path: impl AsRef<Path>, details: impl Into<String>) -> Self {
        Self::IoUnavailable {
            path: path.as_ref().to_path_buf(),
            details: details.into(),
        }
    }

    /// Convenience constructor for PE parse violations.
    #[must_use]
    pub fn malformed(details: impl Into<String>) -> Self {
        Self::MalformedImage {
            details: details.into(),
        }
    }
}

impl From<serde_json::Error> for GlassError {
    fn from(value: serde_json::Error) -> Self {
        Self::Serialization {
            context: "serde_json",
            details: value.to_string(),
        }
    }
}

impl From<toml::de::Error> for GlassError {
    fn from(value: toml::de::Error) -> Self {
        Self::ConfigParse {
            context: "toml",
            details: value.to_string(),
        }
    }
}
