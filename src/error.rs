use thiserror::Error;

/// Error taxonomy for the random-block manager.
///
/// Variant names follow the kind names from the manager's error surface
/// (`enoent`, `io`, `erange`, `enospc`, `invalid-config`) rather than the
/// underlying Rust cause, so callers can match on *what went wrong* without
/// reaching into an opaque error chain.
#[derive(Debug, Error)]
pub enum RbmError {
    /// No valid superblock at the expected address, or the device itself
    /// was not found.
    #[error("no valid superblock found: {0}")]
    NotFound(String),

    /// Generic device I/O failure, including bitmap/superblock CRC
    /// mismatches and decode failures.
    #[error("device I/O error: {0}")]
    Io(String),

    /// Address or length outside `[0, end - start)`.
    #[error("address or length out of range: {0}")]
    OutOfRange(String),

    /// The allocator could not satisfy the requested size.
    #[error("no space left on device")]
    NoSpace,

    /// Nonsensical mkfs geometry (e.g. `total_size < 2 * block_size`).
    #[error("invalid device configuration: {0}")]
    InvalidConfig(String),
}

impl From<std::io::Error> for RbmError {
    fn from(e: std::io::Error) -> Self {
        RbmError::Io(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, RbmError>;
