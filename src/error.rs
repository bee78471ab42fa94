//! Error types for gralloc-mapper.

use thiserror::Error;

/// Result type alias using gralloc-mapper's Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for buffer mapping operations.
#[derive(Error, Debug)]
pub enum Error {
    /// The descriptor is malformed, or the buffer is not in a state that
    /// allows the requested operation (lock after unregister, unlock
    /// without lock, ...).
    #[error("invalid buffer handle: {0}")]
    InvalidHandle(String),

    /// The buffer type cannot support the requested operation.
    #[error("unsupported operation: {0}")]
    Unsupported(String),

    /// The pixel format tag has no known plane layout.
    #[error("unsupported pixel format: {0:#x}")]
    UnsupportedFormat(u32),

    /// The backend could not establish or release a mapping.
    #[error("mapping failed for buffer {id:#x}: {source}")]
    MappingFailed {
        /// Identifier of the buffer being mapped or unmapped.
        id: u64,
        /// Underlying system error.
        #[source]
        source: rustix::io::Errno,
    },

    /// A process tried to unmap a mapping created by another process.
    ///
    /// `unregister` logs this and reports success instead of returning it.
    #[error("buffer {id:#x} was mapped by pid {owner}, not by pid {caller}")]
    CrossProcessViolation {
        /// Identifier of the buffer.
        id: u64,
        /// Process that created the mapping.
        owner: u32,
        /// Process that attempted the unmap.
        caller: u32,
    },

    /// Descriptor wire data failed validation (rkyv).
    #[error("descriptor validation failed: {0}")]
    ValidationFailed(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// System call error (via rustix).
    #[error("system error: {0}")]
    System(#[from] rustix::io::Errno),
}

impl Error {
    /// Wrap a backend errno as a [`Error::MappingFailed`] for buffer `id`.
    pub(crate) fn mapping(id: u64, source: rustix::io::Errno) -> Self {
        Error::MappingFailed { id, source }
    }
}
