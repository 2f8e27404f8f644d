//! Error types for connection configuration.

use std::fmt;

/// Errors raised synchronously by configuration setters.
///
/// Runtime transport failures are never reported here; they surface as the
/// connection's terminal close signal instead (see [`crate::Closable`]).
#[derive(Debug)]
pub enum Error {
    /// A timer duration was out of range. Raised before any timer state is
    /// touched, so a rejected call leaves the previous timer running.
    InvalidArgument(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::InvalidArgument(msg) => write!(f, "invalid argument: {}", msg),
        }
    }
}

impl std::error::Error for Error {}
