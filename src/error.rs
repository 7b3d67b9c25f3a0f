//! Error types for portforward.

use thiserror::Error;

/// Main error type for portforward.
#[derive(Debug, Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("dial timeout")]
    DialTimeout,

    #[error("read timeout")]
    ReadTimeout,

    #[error("connection closed")]
    Closed,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Returns true for the deadline-based errors that arise from idle
    /// endpoints rather than a fault in the transport.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::ReadTimeout | Error::DialTimeout)
    }
}

/// Result type alias for portforward operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_config_detail() {
        let err = Error::Config("unknown method [push]".to_string());
        assert!(err.to_string().contains("unknown method [push]"));
    }

    #[test]
    fn io_error_converts() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        let err: Error = io.into();
        assert!(matches!(err, Error::Io(_)));
        assert!(err.to_string().contains("refused"));
    }

    #[test]
    fn timeouts_are_timeouts() {
        assert!(Error::ReadTimeout.is_timeout());
        assert!(Error::DialTimeout.is_timeout());
        assert!(!Error::Closed.is_timeout());
    }
}
