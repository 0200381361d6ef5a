//! Multi-process logger carried over a [`SharedQueue`].
//!
//! Producers in any attached process stamp and enqueue fixed-size
//! [`LogMessage`]s; a collector drains them. Category and level masks are
//! per handle and filter before anything is allocated. Every enqueue also
//! posts to a named-pipe [`Readiness`] signal whose descriptor a collector
//! can poll instead of blocking in `dequeue`.

mod message;
mod notify;

use std::fmt;
use std::ops::Deref;
use std::os::fd::RawFd;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Local;
use serde_derive::{Deserialize, Serialize};

use crate::allocator::{Block, ShmAllocator};
use crate::errors::{IpcError, Result};
use crate::queue::SharedQueue;

pub use message::{
    format_timestamp, Category, Level, LogMessage, MESSAGE_LEN, ORIGINATOR_LEN, SYSLOG_FACILITY,
    TIME_LEN, WIRE_SIZE,
};
pub use notify::Readiness;

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggerConfig {
    /// Registry name of the logger's queue within the segment.
    pub name: String,
    /// Directory holding the readiness fifo.
    pub fifo_dir: PathBuf,
    pub category_mask: Category,
    pub level_mask: Level,
}

impl Default for LoggerConfig {
    fn default() -> LoggerConfig {
        LoggerConfig {
            name: "logger".to_string(),
            fifo_dir: std::env::temp_dir(),
            category_mask: Category::ALL,
            level_mask: Level::ALL,
        }
    }
}

impl LoggerConfig {
    pub fn new(name: impl Into<String>) -> LoggerConfig {
        LoggerConfig {
            name: name.into(),
            ..Default::default()
        }
    }

    fn fifo_path(&self, segment: &str) -> PathBuf {
        self.fifo_dir.join(format!("ipt_{}_{}.fifo", segment, self.name))
    }
}

pub enum Body<'r> {
    Text(&'r str),
    Args(fmt::Arguments<'r>),
}

/// A record to log: what [`Logger::enqueue`] stamps and copies into the segment.
pub struct Record<'r> {
    pub category: Category,
    pub level: Level,
    pub originator: &'r str,
    pub body: Body<'r>,
}

impl<'r> Record<'r> {
    pub fn new(category: Category, level: Level, originator: &'r str, text: &'r str) -> Record<'r> {
        Record {
            category,
            level,
            originator,
            body: Body::Text(text),
        }
    }

    pub fn with_args(
        category: Category,
        level: Level,
        originator: &'r str,
        args: fmt::Arguments<'r>,
    ) -> Record<'r> {
        Record {
            category,
            level,
            originator,
            body: Body::Args(args),
        }
    }

    fn to_message(&self, time: &str) -> LogMessage {
        match &self.body {
            Body::Text(text) => LogMessage::new(
                self.category,
                self.level,
                self.originator,
                time,
                format_args!("{}", text),
            ),
            Body::Args(args) => {
                LogMessage::new(self.category, self.level, self.originator, time, *args)
            }
        }
    }
}

/// Formats and enqueues a record: `ipt_log!(logger, category, level, originator, "fmt", args..)`.
#[macro_export]
macro_rules! ipt_log {
    ($logger:expr, $category:expr, $level:expr, $originator:expr, $($arg:tt)+) => {
        $logger.enqueue(&$crate::logger::Record::with_args(
            $category,
            $level,
            $originator,
            format_args!($($arg)+),
        ))
    };
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Enqueued {
    Queued,
    /// Rejected by this handle's masks; nothing was allocated.
    Filtered,
}

/// A dequeued message. Give it back with [`Logger::free`].
#[must_use = "a log entry that is not freed leaks arena space"]
pub struct LogEntry<'a> {
    block: Block<'a>,
    message: LogMessage,
}

impl Deref for LogEntry<'_> {
    type Target = LogMessage;

    fn deref(&self) -> &LogMessage {
        &self.message
    }
}

impl fmt::Debug for LogEntry<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LogEntry")
            .field("offset", &self.block.offset())
            .field("message", &self.message)
            .finish()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum State {
    Ready,
    Closed,
}

pub struct Logger<'a> {
    readiness: Readiness,
    queue: SharedQueue<'a>,
    category_mask: Category,
    level_mask: Level,
    state: State,
}

impl<'a> Logger<'a> {
    /// Creates the logger's queue and readiness fifo in `alloc`'s segment.
    pub fn create(cfg: &LoggerConfig, alloc: &'a ShmAllocator) -> Result<Logger<'a>> {
        let queue = SharedQueue::create(&cfg.name, alloc)?;
        let readiness = Readiness::create(&cfg.fifo_path(alloc.segment().name()))?;
        tracing::info!(logger = %cfg.name, fifo = %readiness.path().display(), "created logger");
        Ok(Logger::with_parts(cfg, queue, readiness))
    }

    pub fn attach(cfg: &LoggerConfig, alloc: &'a ShmAllocator) -> Result<Logger<'a>> {
        let queue = SharedQueue::attach(&cfg.name, alloc)?;
        let readiness = Readiness::open(&cfg.fifo_path(alloc.segment().name()))?;
        tracing::debug!(logger = %cfg.name, "attached logger");
        Ok(Logger::with_parts(cfg, queue, readiness))
    }

    fn with_parts(cfg: &LoggerConfig, queue: SharedQueue<'a>, readiness: Readiness) -> Logger<'a> {
        Logger {
            readiness,
            queue,
            category_mask: cfg.category_mask,
            level_mask: cfg.level_mask,
            state: State::Ready,
        }
    }

    fn ensure_ready(&self) -> Result<()> {
        match self.state {
            State::Ready => Ok(()),
            State::Closed => Err(IpcError::InvalidState("logger is closed")),
        }
    }

    pub fn name(&self) -> &str {
        self.queue.name()
    }

    pub fn fifo_path(&self) -> &Path {
        self.readiness.path()
    }

    pub fn allocator(&self) -> Result<&'a ShmAllocator> {
        self.ensure_ready()?;
        Ok(self.queue.allocator())
    }

    pub fn enqueue(&self, record: &Record<'_>) -> Result<Enqueued> {
        self.ensure_ready()?;
        if !self.category_mask.intersects(record.category) || !self.level_mask.intersects(record.level) {
            return Ok(Enqueued::Filtered);
        }
        let message = record.to_message(&format_timestamp(&Local::now()));
        let mut block = self.queue.allocator().malloc(WIRE_SIZE)?;
        message.write_to(&mut block);
        self.queue.enqueue(block)?;
        if let Err(e) = self.readiness.notify() {
            tracing::warn!(logger = %self.name(), error = %e, "failed to post readiness");
        }
        Ok(Enqueued::Queued)
    }

    fn entry(&self, block: Block<'a>) -> Result<LogEntry<'a>> {
        let settled = self.readiness.settle(|| Ok(!self.queue.is_empty()?));
        if let Err(e) = settled {
            tracing::warn!(logger = %self.name(), error = %e, "failed to settle readiness");
        }
        match LogMessage::read_from(&block) {
            Some(message) => Ok(LogEntry { block, message }),
            None => {
                let offset = block.offset();
                self.queue.allocator().free(block)?;
                Err(IpcError::corruption(offset, "queued block is too small for a log message"))
            }
        }
    }

    /// Waits until a message is available.
    pub fn dequeue(&self) -> Result<LogEntry<'a>> {
        self.ensure_ready()?;
        let block = self.queue.dequeue()?;
        self.entry(block)
    }

    pub fn dequeue_timed(&self, timeout: Duration) -> Result<Option<LogEntry<'a>>> {
        self.ensure_ready()?;
        match self.queue.dequeue_timed(timeout)? {
            Some(block) => Ok(Some(self.entry(block)?)),
            None => Ok(None),
        }
    }

    /// Non-blocking take, for collectors driven by [`Logger::fd`].
    pub fn try_dequeue(&self) -> Result<Option<LogEntry<'a>>> {
        self.ensure_ready()?;
        match self.queue.try_dequeue()? {
            Some(block) => Ok(Some(self.entry(block)?)),
            None => {
                self.readiness.drain()?;
                Ok(None)
            }
        }
    }

    pub fn free(&self, entry: LogEntry<'a>) -> Result<()> {
        self.ensure_ready()?;
        self.queue.allocator().free(entry.block)
    }

    /// Visits a snapshot of the pending messages, head to tail.
    ///
    /// The snapshot is copied under the segment lock and visited after it is
    /// released, so `visitor` may log. Nothing is dequeued.
    pub fn for_each<C, F>(&self, mut visitor: F, ctx: &mut C) -> Result<usize>
    where
        F: FnMut(&LogMessage, &mut C),
    {
        self.ensure_ready()?;
        let mut pending = Vec::new();
        self.queue.walk(|payload| {
            if let Some(message) = LogMessage::read_from(payload) {
                pending.push(message);
            }
        })?;
        for message in &pending {
            visitor(message, ctx);
        }
        Ok(pending.len())
    }

    pub fn syslog_priority(&self, message: &LogMessage) -> Result<u8> {
        self.ensure_ready()?;
        Ok(message.syslog_priority())
    }

    /// Descriptor that turns readable while messages are pending.
    pub fn fd(&self) -> Result<RawFd> {
        self.ensure_ready()?;
        Ok(self.readiness.raw_fd())
    }

    pub fn category_mask(&self) -> Result<Category> {
        self.ensure_ready()?;
        Ok(self.category_mask)
    }

    pub fn level_mask(&self) -> Result<Level> {
        self.ensure_ready()?;
        Ok(self.level_mask)
    }

    pub fn set_category(&mut self, category: Category) -> Result<()> {
        self.ensure_ready()?;
        self.category_mask = self.category_mask | category;
        Ok(())
    }

    pub fn set_level(&mut self, level: Level) -> Result<()> {
        self.ensure_ready()?;
        self.level_mask = self.level_mask | level;
        Ok(())
    }

    pub fn unset_category(&mut self, category: Category) -> Result<()> {
        self.ensure_ready()?;
        self.category_mask = self.category_mask & !category;
        Ok(())
    }

    pub fn unset_level(&mut self, level: Level) -> Result<()> {
        self.ensure_ready()?;
        self.level_mask = self.level_mask & !level;
        Ok(())
    }

    pub fn is_category_set(&self, category: Category) -> Result<bool> {
        self.ensure_ready()?;
        Ok(self.category_mask.intersects(category))
    }

    pub fn is_level_set(&self, level: Level) -> Result<bool> {
        self.ensure_ready()?;
        Ok(self.level_mask.intersects(level))
    }

    /// Ends this handle. On the creating handle the queue is closed too,
    /// which fails every attached handle's waits with `QueueClosed`.
    pub fn close(&mut self) -> Result<()> {
        self.ensure_ready()?;
        self.state = State::Closed;
        if self.queue.is_owner() {
            self.queue.close()?;
        }
        Ok(())
    }
}
