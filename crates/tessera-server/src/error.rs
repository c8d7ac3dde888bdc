//! Server errors.

use thiserror::Error;

/// Errors that stop the server.
#[derive(Error, Debug)]
pub enum ServerError {
    /// The bind address did not parse or could not be bound.
    #[error("bind error: {0}")]
    BindError(String),

    /// I/O error on the listener.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
