//! Error types for mail workers and the message store

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid source URL: {0}")]
    Url(#[from] url::ParseError),

    #[error("Filesystem watch error: {0}")]
    Watch(String),

    #[error("Worker has not been configured")]
    NotConfigured,

    #[error("No directory selected")]
    NoDirectorySelected,

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid directory: {0}")]
    InvalidDirectory(String),

    #[error("Unsupported backend: {0}")]
    UnsupportedBackend(String),

    /// Returned by a backend handler that has no implementation for an action.
    /// The dispatch loop turns it into an `Unsupported` event rather than an error.
    #[error("Unsupported action")]
    Unsupported,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<mailparse::MailParseError> for Error {
    fn from(err: mailparse::MailParseError) -> Self {
        Error::Parse(err.to_string())
    }
}

impl From<notify::Error> for Error {
    fn from(err: notify::Error) -> Self {
        Error::Watch(err.to_string())
    }
}

impl From<::config::ConfigError> for Error {
    fn from(err: ::config::ConfigError) -> Self {
        Error::Config(err.to_string())
    }
}
