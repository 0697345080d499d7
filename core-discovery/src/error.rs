use thiserror::Error;

#[derive(Error, Debug)]
pub enum DiscoveryError {
    #[error("Invalid entry point: {0:?}")]
    InvalidEntryPoint(String),

    #[error("Discovery worker is not running")]
    Stopped,

    #[error("Failed to spawn discovery worker: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("Invalid state transition from {from} to {to}: {reason}")]
    InvalidStateTransition {
        from: String,
        to: String,
        reason: String,
    },

    #[error("Invalid discovery state: {0}")]
    InvalidState(String),
}

pub type Result<T> = std::result::Result<T, DiscoveryError>;
