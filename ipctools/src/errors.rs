use std::io;

use thiserror::Error;

use crate::list::Offset;

pub type Result<T> = std::result::Result<T, IpcError>;

#[derive(Debug, Error)]
pub enum IpcError {
    #[error("shared object '{name}' already exists")]
    AlreadyExists { name: String },

    #[error("shared object '{name}' not found")]
    NotFound { name: String },

    #[error("permission denied for shared object '{name}'")]
    PermissionDenied { name: String },

    #[error("resource exhausted: {reason}")]
    ResourceExhausted { reason: String },

    #[error("out of shared memory: requested {requested} bytes, largest free run is {largest_free} bytes")]
    OutOfMemory { requested: usize, largest_free: usize },

    #[error("segment corrupted at offset {offset:#x}: {reason}")]
    Corruption { offset: Offset, reason: String },

    #[error("node at offset {offset:#x} is not linked")]
    NotLinked { offset: Offset },

    #[error("invalid state: {0}")]
    InvalidState(&'static str),

    #[error("timed out after {timeout_ms}ms acquiring the shared lock")]
    LockTimeout { timeout_ms: u64 },

    #[error("shared lock error: {0}")]
    Lock(String),

    #[error("queue '{name}' has been closed")]
    QueueClosed { name: String },

    #[error("segment '{name}' has been destroyed by its owner")]
    SegmentDestroyed { name: String },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("shared memory error: {0}")]
    SharedMemory(#[from] shared_memory::ShmemError),

    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl IpcError {
    pub(crate) fn corruption(offset: Offset, reason: impl Into<String>) -> Self {
        IpcError::Corruption {
            offset,
            reason: reason.into(),
        }
    }

    // raw_sync reports failures as boxed, non-Send errors; keep only the text.
    pub(crate) fn lock(err: Box<dyn std::error::Error>) -> Self {
        IpcError::Lock(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn out_of_memory_reports_sizes() {
        let err = IpcError::OutOfMemory {
            requested: 4096,
            largest_free: 128,
        };
        let text = err.to_string();
        assert!(text.contains("4096"));
        assert!(text.contains("128"));
    }

    #[test]
    fn io_errors_convert() {
        let err: IpcError = io::Error::new(io::ErrorKind::Other, "boom").into();
        assert!(matches!(err, IpcError::Io(_)));
    }
}
