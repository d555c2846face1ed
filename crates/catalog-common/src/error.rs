//! Error types for catalog resolution and remote dataset access.

use thiserror::Error;

/// Result type alias using CatalogError.
pub type CatalogResult<T> = Result<T, CatalogError>;

/// Primary error type for catalog operations.
#[derive(Debug, Error)]
pub enum CatalogError {
    // === Registry Errors ===
    #[error("Malformed descriptor {source_name}: {message}")]
    MalformedDescriptor {
        source_name: String,
        message: String,
    },

    #[error("Dataset '{name}' redefined by {source_name}")]
    ConflictingEntry { name: String, source_name: String },

    #[error("Unknown dataset: {0}")]
    UnknownDataset(String),

    // === Access Errors ===
    #[error("Remote access to {location} failed after {attempts} attempt(s): {message}")]
    RemoteAccess {
        location: String,
        message: String,
        attempts: u32,
    },

    #[error("Unsupported driver: {0}")]
    UnsupportedDriver(String),

    #[error("CRS mismatch: entry declares {declared}, asset embeds {embedded}")]
    CrsMismatch { declared: String, embedded: String },

    // === Data Errors ===
    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("Invalid asset {location}: {message}")]
    InvalidAsset { location: String, message: String },

    #[error("Unknown variable: {0}")]
    UnknownVariable(String),

    #[error("Invalid window: {0}")]
    InvalidWindow(String),

    // === Infrastructure Errors ===
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl CatalogError {
    pub fn malformed(source_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::MalformedDescriptor {
            source_name: source_name.into(),
            message: message.into(),
        }
    }

    pub fn remote(location: impl Into<String>, message: impl Into<String>) -> Self {
        Self::RemoteAccess {
            location: location.into(),
            message: message.into(),
            attempts: 1,
        }
    }

    pub fn invalid_asset(location: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidAsset {
            location: location.into(),
            message: message.into(),
        }
    }

    /// Whether a retry has a chance of succeeding.
    ///
    /// Only transport failures are retryable; every other variant describes
    /// a condition that a second attempt would hit again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, CatalogError::RemoteAccess { .. })
    }

    /// Short machine-friendly kind, used as a log/metric label.
    pub fn kind(&self) -> &'static str {
        match self {
            CatalogError::MalformedDescriptor { .. } => "malformed_descriptor",
            CatalogError::ConflictingEntry { .. } => "conflicting_entry",
            CatalogError::UnknownDataset(_) => "unknown_dataset",
            CatalogError::RemoteAccess { .. } => "remote_access",
            CatalogError::UnsupportedDriver(_) => "unsupported_driver",
            CatalogError::CrsMismatch { .. } => "crs_mismatch",
            CatalogError::UnsupportedFormat(_) => "unsupported_format",
            CatalogError::InvalidAsset { .. } => "invalid_asset",
            CatalogError::UnknownVariable(_) => "unknown_variable",
            CatalogError::InvalidWindow(_) => "invalid_window",
            CatalogError::Config(_) => "config",
            CatalogError::Internal(_) => "internal",
        }
    }
}

impl From<std::io::Error> for CatalogError {
    fn from(err: std::io::Error) -> Self {
        CatalogError::Internal(err.to_string())
    }
}

impl From<serde_json::Error> for CatalogError {
    fn from(err: serde_json::Error) -> Self {
        CatalogError::Internal(format!("JSON error: {}", err))
    }
}
