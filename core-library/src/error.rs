use thiserror::Error;

#[derive(Error, Debug)]
pub enum LibraryError {
    #[error("sqlite: {0}")]
    Database(#[from] rusqlite::Error),

    /// A stored JSON column no longer decodes.
    #[error("bad stored record: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The store has no usable database yet (init not run, or it failed).
    #[error("media library has not been initialized")]
    NotInitialized,

    /// The MRL is already indexed.
    #[error("{0} is already in the library")]
    Conflict(String),

    #[error("{field}: {message}")]
    InvalidInput { field: String, message: String },

    /// A row whose key disagrees with the record stored in it.
    #[error("row {id} is corrupted: {message}")]
    Corrupted { id: i64, message: String },
}

impl LibraryError {
    pub fn invalid(field: &str, message: impl Into<String>) -> Self {
        LibraryError::InvalidInput {
            field: field.to_string(),
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, LibraryError>;
