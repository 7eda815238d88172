// Adaptor error definitions
//
// Every failure an adaptor can report to the broker. Adaptors never retry;
// the broker maps these onto wire error codes.

use thiserror::Error;

use crate::types::{TargetId, ThreadId};

pub type AdaptorResult<T> = Result<T, AdaptorError>;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AdaptorError {
    #[error("No such target: {0}")]
    NoSuchTarget(TargetId),

    #[error("Target {0} is busy")]
    TargetBusy(TargetId),

    #[error("No such thread: {0}")]
    NoSuchThread(ThreadId),

    #[error("Unsupported architecture: {0}")]
    UnknownArchitecture(String),

    #[error("0x{0:X} is not a valid pointer")]
    InvalidPointer(u64),

    #[error("Failed reading {length} bytes of memory at 0x{address:x}")]
    FailedRead { address: u64, length: u64 },

    #[error("Failed writing {length} bytes of memory at 0x{address:x}")]
    FailedWrite { address: u64, length: u64 },

    #[error("Operation not supported by this debugger host: {0}")]
    Unsupported(&'static str),

    #[error("Debugger host error: {0}")]
    Host(String),
}

impl AdaptorError {
    /// Wrap an arbitrary host failure message.
    pub fn host(message: impl Into<String>) -> Self {
        AdaptorError::Host(message.into())
    }
}
