/// Unified error handling for the framegate proxy
///
/// Every data-path error is scoped to a single client connection: it ends the
/// session it occurred in and nothing else. Only configuration errors and a
/// failure to bind the listening socket are fatal to the process.
use std::io;
use thiserror::Error;

/// Main error type for framegate operations
#[derive(Debug, Error)]
pub enum ProxyError {
    /// Malformed or oversized frame
    #[error("Frame error: {0}")]
    Frame(#[from] FrameError),

    /// No backend could be selected for a routing key
    #[error("Routing error: {0}")]
    Routing(#[from] RoutingError),

    /// Backend connection pool errors
    #[error("Pool error: {0}")]
    Pool(#[from] PoolError),

    /// Socket-level errors outside of frame decoding
    #[error("Network error: {0}")]
    Io(#[from] io::Error),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// The listening socket could not be bound
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// A configured deadline elapsed
    #[error("Operation timed out: {operation}")]
    Timeout { operation: String },
}

/// Framing errors; always fatal to the connection they occur on
#[derive(Debug, Error)]
pub enum FrameError {
    /// Declared length cannot hold the 4-byte routing key
    #[error("Incorrect frame size ({len}): too short to carry a routing key")]
    TooShort { len: u32 },

    /// Stream ended before the declared number of bytes arrived
    #[error("Frame truncated: expected {expected} bytes")]
    Truncated { expected: usize },

    /// Declared or encoded length exceeds the configured maximum
    #[error("Frame of {len} bytes exceeds maximum of {max} bytes")]
    TooLarge { len: usize, max: usize },

    #[error("Frame I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Routing errors
#[derive(Debug, Error)]
pub enum RoutingError {
    #[error("No backend available for routing key {key}")]
    NoBackend { key: u32 },
}

/// Backend connection pool errors
#[derive(Debug, Error)]
pub enum PoolError {
    /// Creating a new backend connection failed
    #[error("Failed to dial backend {backend}: {source}")]
    DialFailed {
        backend: String,
        #[source]
        source: io::Error,
    },

    /// No connection became available before the acquire deadline
    #[error("Connection pool for {backend} exhausted after {waited_ms}ms")]
    Exhausted { backend: String, waited_ms: u64 },

    /// The pool was closed while waiting
    #[error("Connection pool for {backend} is closed")]
    Closed { backend: String },
}

/// Configuration-specific errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Serialize error: {0}")]
    SerializeError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),
}

/// Result type alias for framegate operations
pub type ProxyResult<T> = Result<T, ProxyError>;

impl ProxyError {
    /// Create a timeout error
    pub fn timeout<S: Into<String>>(operation: S) -> Self {
        ProxyError::Timeout {
            operation: operation.into(),
        }
    }

    /// Whether the error must stop the whole process rather than one session
    pub fn is_process_fatal(&self) -> bool {
        matches!(self, ProxyError::Config(_) | ProxyError::Bind { .. })
    }

    /// Get error severity level
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            ProxyError::Config(_) => ErrorSeverity::Critical,
            ProxyError::Bind { .. } => ErrorSeverity::Critical,
            ProxyError::Frame(FrameError::Io(_)) => ErrorSeverity::Info,
            ProxyError::Frame(FrameError::Truncated { .. }) => ErrorSeverity::Info,
            ProxyError::Frame(_) => ErrorSeverity::Warning,
            ProxyError::Io(_) => ErrorSeverity::Info,
            ProxyError::Timeout { .. } => ErrorSeverity::Warning,
            ProxyError::Pool(_) => ErrorSeverity::Error,
            ProxyError::Routing(_) => ErrorSeverity::Error,
        }
    }
}

/// Error severity levels for logging and monitoring
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSeverity {
    /// Critical errors that require immediate attention
    Critical,
    /// Errors that affect functionality but don't crash the system
    Error,
    /// Warnings about potential issues
    Warning,
    /// Informational messages about expected disconnects
    Info,
}

impl FrameError {
    /// Map an I/O error from `read_exact` onto the frame taxonomy
    pub(crate) fn from_read(err: io::Error, expected: usize) -> Self {
        if err.kind() == io::ErrorKind::UnexpectedEof {
            FrameError::Truncated { expected }
        } else {
            FrameError::Io(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = ProxyError::from(RoutingError::NoBackend { key: 7 });
        assert_eq!(
            error.to_string(),
            "Routing error: No backend available for routing key 7"
        );

        let error = ProxyError::from(FrameError::TooLarge { len: 20, max: 10 });
        assert_eq!(
            error.to_string(),
            "Frame error: Frame of 20 bytes exceeds maximum of 10 bytes"
        );
    }

    #[test]
    fn test_error_severity() {
        let config_error = ProxyError::Config(ConfigError::ValidationError("test".to_string()));
        assert_eq!(config_error.severity(), ErrorSeverity::Critical);

        let pool_error = ProxyError::Pool(PoolError::DialFailed {
            backend: "127.0.0.1:1".to_string(),
            source: io::Error::new(io::ErrorKind::ConnectionRefused, "test"),
        });
        assert_eq!(pool_error.severity(), ErrorSeverity::Error);

        let eof = ProxyError::Frame(FrameError::Truncated { expected: 4 });
        assert_eq!(eof.severity(), ErrorSeverity::Info);

        let bind_error = ProxyError::Bind {
            addr: "0.0.0.0:9090".to_string(),
            source: io::Error::from(io::ErrorKind::AddrInUse),
        };
        assert_eq!(bind_error.severity(), ErrorSeverity::Critical);
        assert_eq!(ProxyError::timeout("client read").severity(), ErrorSeverity::Warning);
    }

    #[test]
    fn test_process_fatal() {
        let config_error = ProxyError::Config(ConfigError::ValidationError("test".to_string()));
        assert!(config_error.is_process_fatal());

        let bind_error = ProxyError::Bind {
            addr: "0.0.0.0:9090".to_string(),
            source: io::Error::from(io::ErrorKind::AddrInUse),
        };
        assert!(bind_error.is_process_fatal());

        let network_error =
            ProxyError::Io(io::Error::new(io::ErrorKind::ConnectionReset, "test"));
        assert!(!network_error.is_process_fatal());
    }

    #[test]
    fn test_unexpected_eof_maps_to_truncated() {
        let err = FrameError::from_read(io::Error::from(io::ErrorKind::UnexpectedEof), 12);
        assert!(matches!(err, FrameError::Truncated { expected: 12 }));

        let err = FrameError::from_read(io::Error::from(io::ErrorKind::ConnectionReset), 12);
        assert!(matches!(err, FrameError::Io(_)));
    }
}
