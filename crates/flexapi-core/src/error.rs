//! Error types for flexapi.
//!
//! All fallible operations across the library return [`Result<T>`], which
//! uses [`Error`] as the error type. Background tasks never surface these
//! directly; they translate failures into lifecycle events instead.

/// The error type for all flexapi operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A transport-level error (socket connect, read, write, TLS handshake).
    #[error("transport error: {0}")]
    Transport(String),

    /// A protocol-level error (malformed line, bad VITA-49 header).
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Timed out establishing a connection.
    #[error("timeout waiting for response")]
    Timeout,

    /// An invalid parameter was supplied by the caller.
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    /// No connection to the radio has been established.
    #[error("not connected")]
    NotConnected,

    /// A connection attempt was made while one is already active.
    #[error("already connected")]
    AlreadyConnected,

    /// The connection to the radio was lost before a reply arrived.
    #[error("connection lost")]
    ConnectionLost,

    /// TLS setup for a WAN connection failed.
    #[error("TLS error: {0}")]
    Tls(String),

    /// Every candidate UDP port was already in use.
    #[error("no free UDP port in {attempts} attempt(s) starting at {first_port}")]
    BindExhausted {
        /// First port that was tried.
        first_port: u16,
        /// Number of consecutive ports tried.
        attempts: u16,
    },

    /// An underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A convenience `Result` alias using [`Error`] as the error type.
pub type Result<T> = std::result::Result<T, Error>;
