//! Error types for flexcache

use std::fmt;
use std::io;

/// Result type alias for flexcache operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised around the cache
///
/// Cache lookups and stores never fail; these only come from configuration
/// and from purging the materialized output repository.
#[derive(Debug)]
pub enum Error {
    /// I/O error
    Io(io::Error),

    /// Invalid configuration value
    Config(String),

    /// Malformed configuration property
    Parse(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "I/O error: {}", e),
            Error::Config(msg) => write!(f, "Invalid cache configuration: {}", msg),
            Error::Parse(msg) => write!(f, "Parse error: {}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Io(err)
    }
}
