//! Error handling module for the driver disk loader
//!
//! Provides centralized error handling with proper error types using thiserror.
//! Package, archive, staging and media errors all flow through `DriverDiskError`.

use nix::errno::Errno;
use std::path::PathBuf;
use thiserror::Error;

/// Main error type for the driver disk loader
#[derive(Error, Debug)]
pub enum DriverDiskError {
    /// IO errors without a more specific location
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// IO errors tied to a specific path (archive writes, copies)
    #[error("IO error on {}: {source}", path.display())]
    IoAt {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The file is not an RPM package at all
    #[error("{0} is not an RPM package")]
    NotAPackage(String),

    /// The file looked like a package but its headers could not be read
    #[error("Error reading header from {package}: {reason}")]
    ReadError { package: String, reason: String },

    /// cpio payload decoding errors
    #[error("Archive error: {0}")]
    Archive(String),

    /// A package failed the capability predicate
    #[error("Unmet dependency in {package}: {reason}")]
    UnmetDependency { package: String, reason: String },

    /// Staging directories could not be created
    #[error("Unable to create staging directory {}: {source}", path.display())]
    Staging {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Mounted tree is not a driver disk for this product
    #[error("Invalid driver disk: {0}")]
    InvalidDisk(String),

    /// Mount failures
    #[error("Mount error: {0}")]
    Mount(String),

    /// A scratch mountpoint could not be released; nothing can safely continue
    #[error("Unable to unmount {}: {errno}", path.display())]
    StuckMount { path: PathBuf, errno: Errno },

    /// Copying the package directory off the disk failed
    #[error("Copy error: {0}")]
    Copy(String),

    /// The extraction batch for one disk did not succeed
    #[error("Extraction of driver disk #{sequence} failed")]
    Extraction { sequence: u32 },

    /// Unrecognised kickstart-style source string
    #[error("Unknown driver disk kickstart source: {0}")]
    UnknownSource(String),

    /// Remote image retrieval failed
    #[error("Unable to retrieve driver disk image: {0}")]
    Fetch(String),

    /// Configuration errors (loading, parsing, validation)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Terminal/UI errors
    #[error("Terminal error: {0}")]
    Terminal(String),

    /// System errors (commands, processes)
    #[error("System error: {0}")]
    System(String),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias for driver disk operations
pub type Result<T> = std::result::Result<T, DriverDiskError>;

// Convenient error constructors
impl DriverDiskError {
    /// Create a header read error for a package
    pub fn read_error(package: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ReadError {
            package: package.into(),
            reason: reason.into(),
        }
    }

    /// Create an archive error
    pub fn archive(msg: impl Into<String>) -> Self {
        Self::Archive(msg.into())
    }

    /// Create an unmet dependency error
    pub fn unmet_dependency(package: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::UnmetDependency {
            package: package.into(),
            reason: reason.into(),
        }
    }

    /// Attach a path to an IO error
    pub fn io_at(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::IoAt {
            path: path.into(),
            source,
        }
    }

    /// Create an invalid disk error
    pub fn invalid_disk(msg: impl Into<String>) -> Self {
        Self::InvalidDisk(msg.into())
    }

    /// Create a mount error
    pub fn mount(msg: impl Into<String>) -> Self {
        Self::Mount(msg.into())
    }

    /// Create a copy error
    pub fn copy(msg: impl Into<String>) -> Self {
        Self::Copy(msg.into())
    }

    /// Create a fetch error
    pub fn fetch(msg: impl Into<String>) -> Self {
        Self::Fetch(msg.into())
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a terminal error
    pub fn terminal(msg: impl Into<String>) -> Self {
        Self::Terminal(msg.into())
    }

    /// Create a system error
    pub fn system(msg: impl Into<String>) -> Self {
        Self::System(msg.into())
    }

    /// Errors that make a single package unusable without touching the disk
    pub fn is_package_unreadable(&self) -> bool {
        matches!(self, Self::NotAPackage(_) | Self::ReadError { .. } | Self::Io(_))
    }

    /// Errors the acquisition flow turns into backward navigation
    pub fn is_back_signal(&self) -> bool {
        matches!(self, Self::InvalidDisk(_))
    }

    /// Errors after which the process must not continue
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::StuckMount { .. })
    }
}
