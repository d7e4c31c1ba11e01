// Error types for the ndstore hierarchical array store.
// Lock contention is never an error: acquisition retries until it wins
// (or, for the bounded variant, until the deadline expires).

use std::error::Error;
use std::fmt;
use std::io;

/// Main error type for store operations.
#[derive(Debug)]
pub enum NdStoreError {
    /// I/O operation failed
    Io {
        context: String,
        source: io::Error,
    },

    /// Invalid input: bad path component, malformed location string,
    /// unknown mode, or a value the backend cannot persist
    Validation {
        reason: String,
    },

    /// Append-mode rank or trailing-dimension mismatch
    ShapeMismatch {
        name: String,
        expected: Vec<usize>,
        found: Vec<usize>,
    },

    /// Container file content could not be parsed
    Corrupt {
        path: String,
        reason: String,
    },

    /// Bounded-wait lock acquisition expired
    Timeout {
        operation: String,
        duration_ms: u64,
    },
}

impl fmt::Display for NdStoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NdStoreError::Io { context, source } => {
                write!(f, "I/O error during {}: {}", context, source)
            }

            NdStoreError::Validation { reason } => {
                write!(f, "Validation error: {}", reason)
            }

            NdStoreError::ShapeMismatch { name, expected, found } => {
                write!(
                    f,
                    "Shape mismatch for dataset '{}': expected trailing shape {:?}, found {:?}",
                    name, expected, found
                )
            }

            NdStoreError::Corrupt { path, reason } => {
                write!(f, "Container '{}' is corrupt: {}", path, reason)
            }

            NdStoreError::Timeout { operation, duration_ms } => {
                write!(f, "Operation '{}' timed out after {}ms", operation, duration_ms)
            }
        }
    }
}

impl Error for NdStoreError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            NdStoreError::Io { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// Result type alias for store operations
pub type Result<T> = std::result::Result<T, NdStoreError>;

/// Helper trait for adding context to io::Errors
pub trait IoContext<T> {
    fn io_context(self, context: impl Into<String>) -> Result<T>;
}

impl<T> IoContext<T> for io::Result<T> {
    fn io_context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| NdStoreError::Io {
            context: context.into(),
            source: e,
        })
    }
}

impl NdStoreError {
    pub fn validation(reason: impl Into<String>) -> Self {
        NdStoreError::Validation { reason: reason.into() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_display() {
        let err = NdStoreError::validation("path key 'a=b' contains '='");
        let msg = format!("{}", err);
        assert!(msg.contains("Validation error"));
        assert!(msg.contains("a=b"));
    }

    #[test]
    fn test_shape_mismatch_display() {
        let err = NdStoreError::ShapeMismatch {
            name: "loss".to_string(),
            expected: vec![1, 3],
            found: vec![1, 4],
        };
        let msg = format!("{}", err);
        assert!(msg.contains("loss"));
        assert!(msg.contains("[1, 3]"));
        assert!(msg.contains("[1, 4]"));
    }

    #[test]
    fn test_io_context() {
        let io_err = io::Error::new(io::ErrorKind::PermissionDenied, "access denied");
        let result: io::Result<()> = Err(io_err);

        let store_result = result.io_context("opening container file");
        assert!(store_result.is_err());

        let err = store_result.unwrap_err();
        let msg = format!("{}", err);
        assert!(msg.contains("opening container file"));
        assert!(msg.contains("access denied"));
    }
}
