//! Crate-wide error type.
//!
//! Crashes, hangs and timeouts of the fuzz target are *data* carried in
//! `ExecutionResult`, never errors. Errors are reserved for the fuzzer's own
//! failures: bad configuration, an unspawnable target, a broken shared-memory
//! channel, and so on.

use std::path::PathBuf;

pub type GrizzlyResult<T> = Result<T, GrizzlyError>;

#[derive(Debug, thiserror::Error)]
pub enum GrizzlyError {
    /// Invalid configuration, surfaced at startup.
    #[error("configuration error: {0}")]
    Config(String),

    /// The target binary could not be executed at all.
    #[error("failed to spawn target {target}: {reason}")]
    Spawn { target: PathBuf, reason: String },

    /// System-V shared memory allocation or attach failure.
    #[error("shared memory error: {0}")]
    Shm(String),

    /// Checkpoint read/write or schema failure.
    #[error("checkpoint error: {0}")]
    Checkpoint(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}
