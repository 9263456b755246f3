//! SSG-prefixed error types with structured error codes.

#![allow(missing_docs)]

use std::path::{Path, PathBuf};

use thiserror::Error;

/// Shared `Result` alias for the project.
pub type Result<T> = std::result::Result<T, SageError>;

/// Top-level error type for Storage Sage.
#[derive(Debug, Error)]
pub enum SageError {
    #[error("[SSG-1001] invalid configuration: {details}")]
    InvalidConfig { details: String },

    #[error("[SSG-1002] missing configuration file: {path}")]
    MissingConfig { path: PathBuf },

    #[error("[SSG-1003] configuration parse failure in {context}: {details}")]
    ConfigParse {
        context: &'static str,
        details: String,
    },

    #[error("[SSG-1101] invalid schedule: {details}")]
    Schedule { details: String },

    #[error("[SSG-2001] filesystem stats failure for {path}: {details}")]
    FsStats { path: PathBuf, details: String },

    #[error("[SSG-2101] serialization failure in {context}: {details}")]
    Serialization {
        context: &'static str,
        details: String,
    },

    #[error("[SSG-2102] SQL failure in {context}: {details}")]
    Sql {
        context: &'static str,
        details: String,
    },

    #[error("[SSG-2201] tampering detected for {path}: {details}")]
    Tampering { path: PathBuf, details: String },

    #[error("[SSG-2202] restore denied for {path}: {reason}")]
    RestoreDenied { path: PathBuf, reason: String },

    #[error("[SSG-2301] another instance holds {path} (pid {pid})")]
    LockContention { path: PathBuf, pid: String },

    #[error("[SSG-3002] IO failure at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("[SSG-3003] channel closed in component {component}")]
    ChannelClosed { component: &'static str },

    #[error("[SSG-3100] operation canceled")]
    Canceled,

    #[error("[SSG-3900] runtime failure: {details}")]
    Runtime { details: String },
}

impl SageError {
    /// Stable machine-parseable error code.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::InvalidConfig { .. } => "SSG-1001",
            Self::MissingConfig { .. } => "SSG-1002",
            Self::ConfigParse { .. } => "SSG-1003",
            Self::Schedule { .. } => "SSG-1101",
            Self::FsStats { .. } => "SSG-2001",
            Self::Serialization { .. } => "SSG-2101",
            Self::Sql { .. } => "SSG-2102",
            Self::Tampering { .. } => "SSG-2201",
            Self::RestoreDenied { .. } => "SSG-2202",
            Self::LockContention { .. } => "SSG-2301",
            Self::Io { .. } => "SSG-3002",
            Self::ChannelClosed { .. } => "SSG-3003",
            Self::Canceled => "SSG-3100",
            Self::Runtime { .. } => "SSG-3900",
        }
    }

    /// Whether retrying might resolve the failure.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Io { .. }
                | Self::ChannelClosed { .. }
                | Self::FsStats { .. }
                | Self::Sql { .. }
                | Self::Runtime { .. }
        )
    }

    /// Convenience constructor for IO errors with a known path.
    #[must_use]
    pub fn io(path: impl AsRef<Path>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }
}

#[cfg(feature = "sqlite")]
impl From<rusqlite::Error> for SageError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Sql {
            context: "rusqlite",
            details: value.to_string(),
        }
    }
}

impl From<serde_json::Error> for SageError {
    fn from(value: serde_json::Error) -> Self {
        Self::Serialization {
            context: "serde_json",
            details: value.to_string(),
        }
    }
}

impl From<toml::de::Error> for SageError {
    fn from(value: toml::de::Error) -> Self {
        Self::ConfigParse {
            context: "toml",
            details: value.to_string(),
        }
    }
}
