use thiserror::Error;

/// Errors surfaced by configuration loading and top-level setup.
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("unknown network {0:?}")]
    UnknownNetwork(String),
}

pub type Result<T> = std::result::Result<T, Error>;
