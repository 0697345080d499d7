use thiserror::Error;

/// Errors surfaced by [`MediaLibrary`](crate::MediaLibrary).
#[derive(Error, Debug)]
pub enum CoreError {
    /// `init` was called on a handle that was never constructed.
    #[error("media library has no configuration; construct it first")]
    NotConstructed,

    /// A discovery operation was requested before `start`.
    #[error("discovery is not running; start the media library first")]
    NotStarted,

    #[error(transparent)]
    Config(#[from] core_runtime::Error),

    #[error(transparent)]
    Library(#[from] core_library::LibraryError),

    #[error(transparent)]
    Discovery(#[from] core_discovery::DiscoveryError),
}

pub type Result<T> = std::result::Result<T, CoreError>;
