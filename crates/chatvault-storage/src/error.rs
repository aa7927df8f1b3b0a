use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    /// Network or backend failure. `transient` failures may be retried.
    #[error("{destination} unavailable during {action}: {message}")]
    Unavailable {
        destination: String,
        action: String,
        message: String,
        transient: bool,
    },

    #[error("not found: {0}")]
    NotFound(String),

    /// Object exists but cannot be parsed
    #[error("corrupt remote object {path}: {message}")]
    Corrupt { path: String, message: String },

    #[error("storage configuration: {0}")]
    Config(String),
}

impl StorageError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StorageError::Unavailable { transient: true, .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::NotFound(_))
    }
}
