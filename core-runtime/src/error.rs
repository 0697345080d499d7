use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// A `LibraryConfig` or `DiscoverySettings` value was rejected.
    #[error("invalid library configuration: {0}")]
    Config(String),

    /// The tracing subscriber could not be built or installed.
    #[error("logging setup failed: {0}")]
    Logging(String),
}

pub type Result<T> = std::result::Result<T, Error>;
