use thiserror::Error;

use crate::{initialization::InitializationError, persistence::error::PersistenceError};

/// Why the engine could not be prepared for start.
#[derive(Debug, Error)]
pub enum AppContextError {
    /// `app.yaml` is missing or malformed.
    #[error("Failed to read app.yaml: {0}")]
    Config(#[from] config::ConfigError),

    /// The database could not be opened or migrated.
    #[error("Failed to open the database: {0}")]
    Persistence(#[from] PersistenceError),

    /// A resource file was rejected.
    #[error("Failed to load resource files: {0}")]
    Initialization(#[from] InitializationError),
}
