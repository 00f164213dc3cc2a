//! # CINDER Error Handling
//!
//! One error type for the whole stack.
//!
//! Error handling in CINDER follows these principles:
//! - Errors are typed and categorized
//! - No panics in production code paths
//! - Errors are `Copy` so a stream can hold one as its sticky error
//! - Errors are `no_std` compatible

use core::fmt;

// =============================================================================
// RESULT TYPE
// =============================================================================

/// CINDER Result type alias
pub type Result<T> = core::result::Result<T, Error>;

// =============================================================================
// ERROR ENUM
// =============================================================================

/// CINDER unified error type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum Error {
    // =========================================================================
    // Generic Errors
    // =========================================================================
    /// Invalid parameter provided
    InvalidParameter,
    /// Resource not found
    NotFound,
    /// Operation not supported on this hardware or platform
    NotSupported,
    /// Operation not valid in the current lifecycle state
    InvalidState,
    /// A bounded wait did not observe the fence in time
    Timeout,
    /// Resource is busy
    Busy,

    // =========================================================================
    // Resource Errors
    // =========================================================================
    /// A builder table or the configured buffer cannot hold the request
    InsufficientResources,
    /// Out of memory
    OutOfMemory,
    /// Write past the space reserved by `begin`
    BufferOverflow,

    // =========================================================================
    // Submission Errors
    // =========================================================================
    /// The channel rejected or failed a submission
    SubmissionFailed,
    /// Malformed command word
    InvalidCommand,
    /// The control transport returned an OS error code
    TransportError(i32),
}

impl Error {
    /// Whether retrying the same operation can succeed
    pub const fn is_recoverable(&self) -> bool {
        matches!(self, Self::Timeout | Self::Busy)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            // Generic
            Self::InvalidParameter => write!(f, "invalid parameter"),
            Self::NotFound => write!(f, "resource not found"),
            Self::NotSupported => write!(f, "operation not supported"),
            Self::InvalidState => write!(f, "invalid state"),
            Self::Timeout => write!(f, "operation timed out"),
            Self::Busy => write!(f, "resource busy"),

            // Resource
            Self::InsufficientResources => write!(f, "insufficient resources"),
            Self::OutOfMemory => write!(f, "out of memory"),
            Self::BufferOverflow => write!(f, "buffer overflow"),

            // Submission
            Self::SubmissionFailed => write!(f, "submission failed"),
            Self::InvalidCommand => write!(f, "invalid command"),
            Self::TransportError(code) => write!(f, "transport error: {}", code),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for Error {}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::string::ToString;

    #[test]
    fn test_display() {
        assert_eq!(Error::Timeout.to_string(), "operation timed out");
        assert_eq!(Error::TransportError(-5).to_string(), "transport error: -5");
    }

    #[test]
    fn test_recoverable() {
        assert!(Error::Timeout.is_recoverable());
        assert!(!Error::SubmissionFailed.is_recoverable());
        assert!(!Error::InsufficientResources.is_recoverable());
    }
}
