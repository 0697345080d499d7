use thiserror::Error;

/// Failures reported by host collaborators.
#[derive(Error, Debug)]
pub enum BridgeError {
    /// The entry point could not be listed at all (unmounted, deleted, denied).
    #[error("{0} cannot be reached")]
    Unreachable(String),

    /// A file was listed but the scanner could not stat or read it.
    #[error("scanner failure: {0}")]
    OperationFailed(String),

    /// Metadata extraction failed for one file.
    #[error("cannot parse {mrl}: {message}")]
    Parse { mrl: String, message: String },

    /// The host log sink rejected an entry.
    #[error("log sink rejected entry: {0}")]
    Sink(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl BridgeError {
    /// The MRL a parse failure refers to.
    pub fn mrl(&self) -> Option<&str> {
        match self {
            BridgeError::Parse { mrl, .. } => Some(mrl),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, BridgeError>;
