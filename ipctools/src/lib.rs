//! Shared-memory IPC primitives: a named segment with a fixed arena
//! allocator, offset-linked intrusive lists, a blocking cross-process FIFO
//! and a multi-process logger built on top of them.

pub mod allocator;
pub mod errors;
pub mod list;
pub mod logger;
pub mod queue;
pub mod segment;

#[cfg(test)]
mod tests;

pub use allocator::{ArenaStats, Block, ShmAllocator};
pub use errors::{IpcError, Result};
pub use logger::{Category, Enqueued, Level, LogEntry, LogMessage, Logger, LoggerConfig, Record};
pub use queue::SharedQueue;
pub use segment::{Segment, ShmemConfig};
