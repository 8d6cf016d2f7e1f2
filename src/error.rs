//! Crate-wide error type.

use std::io;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// A datagram or payload could not be decoded into a message.
    #[error("codec error: {0}")]
    Json(#[from] serde_json::Error),

    /// Key material or an encryption step was rejected.
    #[error("{0}")]
    Crypto(&'static str),

    /// A handler-level contract violation. The text is what the remote
    /// party sees in the `error` field of the reply.
    #[error("{0}")]
    Protocol(String),

    /// The underlying transport refused the operation.
    #[error("{0}")]
    Transport(&'static str),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl Error {
    pub fn protocol<S: Into<String>>(text: S) -> Self {
        Error::Protocol(text.into())
    }
}
