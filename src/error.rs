//! Error types.
//!
//! Application-level outcomes (404, 500) are responses, not `Error`s. These
//! types cover the failures around them: the listener, configuration,
//! writes to a response, and handlers that fail.

use std::io;

/// Error returned by a handler. Anything `Into<BoxError>` works, including
/// `std::io::Error`, `String` and `&'static str`.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// The error type returned by perch's fallible server operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The configured address could not be bound or listened on.
    #[error("failed to listen on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// The configured listen address is not an IP address.
    #[error("invalid listen address `{0}`")]
    Address(String),

    /// A configuration document could not be parsed.
    #[error("invalid configuration: {0}")]
    Config(#[from] toml::de::Error),

    #[error("io: {0}")]
    Io(#[from] io::Error),
}

/// Why a write to a [`Response`](crate::Response) was refused.
#[derive(Clone, Debug, thiserror::Error, Eq, PartialEq)]
pub enum ResponseError {
    /// Status and headers can no longer change.
    #[error("headers already sent")]
    HeadersSent,

    /// The body was already terminated with `end()`.
    #[error("response already ended")]
    Ended,

    /// The connection behind this response is gone.
    #[error("connection closed")]
    Closed,
}

/// A handler that did not settle successfully.
#[derive(Debug, thiserror::Error)]
pub enum HandlerFailure {
    #[error("handler returned an error: {0}")]
    Returned(BoxError),

    #[error("handler panicked: {0}")]
    Panicked(String),
}

impl HandlerFailure {
    pub fn is_panic(&self) -> bool {
        matches!(self, Self::Panicked(_))
    }
}
