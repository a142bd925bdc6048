//! Error types for Coffer operations
//!
//! All Coffer errors are represented by the CofferError enum, which carries
//! enough context (paths, offsets, limits) for debugging and recovery.

use std::error::Error;
use std::fmt;
use std::path::PathBuf;

/// Coffer error types with detailed context
#[derive(Debug, Clone)]
pub enum CofferError {
    /// Key absent from the index
    NotFound,

    /// Key present but its entry's expiry has elapsed.
    /// The read path prunes the index entry before returning this.
    Expired,

    /// Key empty or exceeding the configured maximum length
    InvalidKey {
        /// Length of the offending key
        length: usize,
        /// Configured maximum
        max: usize,
    },

    /// Value exceeding the configured maximum length
    InvalidValue {
        /// Length of the offending value
        length: usize,
        /// Configured maximum
        max: usize,
    },

    /// An argument outside its allowed set (recovery mode, config field)
    InvalidArgument {
        /// Human-readable description
        message: String,
    },

    /// Operation attempted after close()
    Closed,

    /// Framing or payload could not be parsed
    Malformed {
        /// File in which the bad frame lives
        path: PathBuf,
        /// Byte offset of the frame's length header
        offset: u64,
        /// Description of what failed to parse
        reason: String,
    },

    /// I/O operation failed
    Io {
        /// The file path where the error occurred
        path: Option<PathBuf>,
        /// The underlying I/O error kind
        kind: std::io::ErrorKind,
        /// Human-readable description preserving the OS cause
        message: String,
    },

    /// Backup checksum mismatch or missing manifest
    Corrupt {
        /// Backup directory that failed verification
        path: PathBuf,
        /// Description of the corruption
        reason: String,
    },

    /// Operation requested on a backend that lacks it
    Unsupported {
        /// The unsupported operation
        operation: &'static str,
    },
}

impl fmt::Display for CofferError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CofferError::NotFound => write!(f, "key not found"),

            CofferError::Expired => write!(f, "key has expired"),

            CofferError::InvalidKey { length, max } => {
                if *length == 0 {
                    write!(f, "invalid key: empty")
                } else {
                    write!(f, "invalid key: {} bytes exceeds limit of {} bytes", length, max)
                }
            }

            CofferError::InvalidValue { length, max } => {
                write!(f, "invalid value: {} bytes exceeds limit of {} bytes", length, max)
            }

            CofferError::InvalidArgument { message } => {
                write!(f, "invalid argument: {}", message)
            }

            CofferError::Closed => write!(f, "store is closed"),

            CofferError::Malformed { path, offset, reason } => {
                write!(f, "malformed record in {} at offset {}: {}", path.display(), offset, reason)
            }

            CofferError::Io { path, kind, message } => {
                if let Some(path) = path {
                    write!(f, "I/O error in {}: {} ({})", path.display(), message, kind)
                } else {
                    write!(f, "I/O error: {} ({})", message, kind)
                }
            }

            CofferError::Corrupt { path, reason } => {
                write!(f, "corrupt backup {}: {}", path.display(), reason)
            }

            CofferError::Unsupported { operation } => {
                write!(f, "operation not supported by this backend: {}", operation)
            }
        }
    }
}

impl Error for CofferError {}

/// Convert std::io::Error to CofferError::Io
impl From<std::io::Error> for CofferError {
    fn from(err: std::io::Error) -> Self {
        CofferError::Io {
            path: None,
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

/// Result type alias for Coffer operations
pub type CofferResult<T> = Result<T, CofferError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = CofferError::Malformed {
            path: PathBuf::from("/tmp/data.db"),
            offset: 4096,
            reason: "frame length exceeds remaining file".to_string(),
        };

        let display = format!("{}", err);
        assert!(display.contains("malformed record"));
        assert!(display.contains("4096"));
        assert!(display.contains("/tmp/data.db"));
    }

    #[test]
    fn test_empty_key_display() {
        let err = CofferError::InvalidKey { length: 0, max: 1024 };
        assert_eq!(format!("{}", err), "invalid key: empty");
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let err: CofferError = io_err.into();

        match err {
            CofferError::Io { kind, .. } => assert_eq!(kind, std::io::ErrorKind::PermissionDenied),
            _ => panic!("Expected Io error"),
        }
    }
}
