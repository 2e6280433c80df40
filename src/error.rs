//! Error taxonomy shared by the tree, the adapters and the harvesters.

use thiserror::Error;

/// Errors surfaced by catalog operations.
///
/// Request-path callers translate these into transport status codes via
/// [`CatalogError::status_code`]; harvester loops only log them.
#[derive(Error, Debug)]
pub enum CatalogError {
    /// Synthetic id is missing its prefix or delimiter, or the payload does
    /// not decode
    #[error("Malformed entry id '{id}': {reason}")]
    MalformedId { id: String, reason: String },

    /// Target vanished upstream or never existed
    #[error("Entry not found: {0}")]
    NotFound(String),

    /// The permission resolver denied the action
    #[error("Permission denied: {action} on {entry_id}")]
    PermissionDenied { entry_id: String, action: String },

    /// FTP or HTTP source could not be reached
    #[error("Source unavailable: {locator}: {reason}")]
    SourceUnavailable { locator: String, reason: String },

    /// Invalid harvester definition or daemon configuration
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Source document could not be parsed
    #[error("Failed to parse {locator}: {reason}")]
    Parse { locator: String, reason: String },

    /// Storage collaborator failure
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, CatalogError>;

impl CatalogError {
    pub fn malformed_id(id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::MalformedId {
            id: id.into(),
            reason: reason.into(),
        }
    }

    pub fn unavailable(locator: impl Into<String>, reason: impl ToString) -> Self {
        Self::SourceUnavailable {
            locator: locator.into(),
            reason: reason.to_string(),
        }
    }

    pub fn parse(locator: impl Into<String>, reason: impl ToString) -> Self {
        Self::Parse {
            locator: locator.into(),
            reason: reason.to_string(),
        }
    }

    /// HTTP-equivalent status code for the front end.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::MalformedId { .. } => 400,
            Self::NotFound(_) => 404,
            Self::PermissionDenied { .. } => 403,
            Self::SourceUnavailable { .. } => 503,
            Self::Configuration(_) | Self::Parse { .. } | Self::Storage(_) | Self::Io(_) => 500,
        }
    }

    /// Whether retrying later (next harvester pass, next request) may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::SourceUnavailable { .. })
    }
}
