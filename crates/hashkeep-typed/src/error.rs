//! Error types for the typed value layer

use std::error::Error;
use std::fmt;

use hashkeep_core::HdbError;

/// Failures of typed reads and writes.
#[derive(Debug, Clone)]
pub enum TypedError {
    /// The engine call itself failed
    Engine(HdbError),

    /// Stored value does not start with a known kind tag
    UnknownTag {
        /// The first byte found
        tag: u8,
    },

    /// Stored payload has the wrong length for its kind
    BadLength {
        /// Kind named by the tag
        kind: &'static str,
        /// Payload bytes the kind requires
        expected: usize,
        /// Payload bytes present
        actual: usize,
    },

    /// A string value is not valid UTF-8
    InvalidUtf8 {
        /// Decoder message
        message: String,
    },

    /// Stored value has no tag byte at all
    Empty,

    /// Value has a different kind than the caller asked for
    KindMismatch {
        /// Kind the caller asked for
        expected: &'static str,
        /// Kind actually stored
        found: &'static str,
    },
}

impl fmt::Display for TypedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TypedError::Engine(err) => write!(f, "{}", err),
            TypedError::UnknownTag { tag } => write!(f, "unknown value tag 0x{:02x}", tag),
            TypedError::BadLength { kind, expected, actual } => {
                write!(f, "{} value needs {} payload bytes, found {}", kind, expected, actual)
            }
            TypedError::InvalidUtf8 { message } => write!(f, "string value is not UTF-8: {}", message),
            TypedError::Empty => write!(f, "stored value is empty, no tag byte"),
            TypedError::KindMismatch { expected, found } => {
                write!(f, "expected a {} value, found {}", expected, found)
            }
        }
    }
}

impl Error for TypedError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            TypedError::Engine(err) => Some(err),
            _ => None,
        }
    }
}

impl From<HdbError> for TypedError {
    fn from(err: HdbError) -> Self {
        TypedError::Engine(err)
    }
}

/// Result type for typed operations
pub type TypedResult<T> = Result<T, TypedError>;
