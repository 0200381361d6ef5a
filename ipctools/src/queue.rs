//! FIFO of allocator blocks shared between processes.
//!
//! Items are linked through the link field of their own block header, so
//! enqueueing never allocates. The list is guarded by the segment mutex;
//! consumers sleep on an auto-reset, process-shared event that lives in the
//! queue's header block.
//!
//! Waiting is a predicate loop: a consumer re-checks the list after every
//! wakeup, and one that takes an item while more remain signals again so a
//! collapsed signal never leaves a second consumer asleep. Waits are cut into
//! slices of at most a second so closure and segment destruction are noticed.
//!
//! Every handle is counted in the header. The header block goes back to the
//! allocator when the queue is closed and the last handle drops.
//!
//! Processes must not fork while inside a queue call.

use std::mem::{self, offset_of};
use std::thread;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use raw_sync::events::{Event, EventImpl, EventInit, EventState};
use raw_sync::Timeout;

use crate::allocator::{Block, ShmAllocator, BLOCK_HEADER_SIZE, TAG_QUEUED, TAG_USED};
use crate::errors::{IpcError, Result};
use crate::list::{IntrusiveList, ListHead, Offset};
use crate::segment::SegmentView;

const QUEUE_MAGIC: u64 = u64::from_le_bytes(*b"IPTQUEUE");
const EVENT_AT: Offset = 64;
const EVENT_REGION: usize = 256;
const QUEUE_BLOCK_SIZE: usize = EVENT_AT as usize + EVENT_REGION;
const WAIT_SLICE: Duration = Duration::from_secs(1);
const RETRY_PAUSE: Duration = Duration::from_millis(1);
const CLOCK_MARGIN_NS: u32 = 1_000_000;

#[repr(C)]
#[derive(Clone, Copy)]
struct QueueHeader {
    magic: u64,
    list: ListHead,
    closed: u32,
    handles: u32,
}

const _: () = assert!(mem::size_of::<QueueHeader>() <= EVENT_AT as usize);

pub struct SharedQueue<'a> {
    alloc: &'a ShmAllocator,
    name: String,
    // Payload offset of the QueueHeader.
    header: Offset,
    event: Box<dyn EventImpl>,
    owner: bool,
}

impl<'a> SharedQueue<'a> {
    /// Creates a queue and registers it under `name` in the allocator.
    pub fn create(name: &str, alloc: &'a ShmAllocator) -> Result<SharedQueue<'a>> {
        let (header, event) = alloc.segment().with_lock(|view| {
            if ShmAllocator::lookup_locked(view, name)?.is_some() {
                return Err(IpcError::AlreadyExists {
                    name: name.to_string(),
                });
            }
            let (block, _) = ShmAllocator::malloc_locked(view, QUEUE_BLOCK_SIZE)?;
            let header = block + BLOCK_HEADER_SIZE as Offset;
            view.write(
                header,
                QueueHeader {
                    magic: QUEUE_MAGIC,
                    list: ListHead::default(),
                    closed: 0,
                    handles: 1,
                },
            )?;
            let event_mem = view.ptr(header + EVENT_AT, EVENT_REGION)?;
            if Event::size_of(Some(event_mem)) > EVENT_REGION {
                ShmAllocator::free_locked(view, block)?;
                return Err(IpcError::InvalidConfig(
                    "process-shared event does not fit the queue header".to_string(),
                ));
            }
            // SAFETY: event_mem points at EVENT_REGION bytes this queue owns.
            let (event, _) = match unsafe { Event::new(event_mem, true) } {
                Ok(created) => created,
                Err(e) => {
                    ShmAllocator::free_locked(view, block)?;
                    return Err(IpcError::lock(e));
                }
            };
            if let Err(e) = ShmAllocator::register_locked(view, name, block) {
                ShmAllocator::free_locked(view, block)?;
                return Err(e);
            }
            Ok((header, event))
        })?;

        tracing::debug!(segment = %alloc.segment().name(), queue = %name, "created shared queue");

        Ok(SharedQueue {
            alloc,
            name: name.to_string(),
            header,
            event,
            owner: true,
        })
    }

    /// Binds to a queue another handle created under `name`.
    pub fn attach(name: &str, alloc: &'a ShmAllocator) -> Result<SharedQueue<'a>> {
        let (header, event) = alloc.segment().with_lock(|view| {
            let block = ShmAllocator::lookup_locked(view, name)?.ok_or_else(|| IpcError::NotFound {
                name: name.to_string(),
            })?;
            let header = block + BLOCK_HEADER_SIZE as Offset;
            let state: QueueHeader = view.read(header)?;
            if state.magic != QUEUE_MAGIC {
                return Err(IpcError::corruption(header, "registered object is not a queue"));
            }
            if state.closed != 0 {
                return Err(IpcError::QueueClosed {
                    name: name.to_string(),
                });
            }
            let event_mem = view.ptr(header + EVENT_AT, EVENT_REGION)?;
            // SAFETY: the creator initialised the event in place before registering the queue.
            let (event, _) = unsafe { Event::from_existing(event_mem) }.map_err(IpcError::lock)?;
            view.write(header + offset_of!(QueueHeader, handles) as Offset, state.handles + 1)?;
            Ok((header, event))
        })?;

        tracing::debug!(segment = %alloc.segment().name(), queue = %name, "attached shared queue");

        Ok(SharedQueue {
            alloc,
            name: name.to_string(),
            header,
            event,
            owner: false,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_owner(&self) -> bool {
        self.owner
    }

    pub fn allocator(&self) -> &'a ShmAllocator {
        self.alloc
    }

    fn list(&self) -> IntrusiveList {
        IntrusiveList::at(self.header + offset_of!(QueueHeader, list) as Offset)
    }

    fn closed_at(&self) -> Offset {
        self.header + offset_of!(QueueHeader, closed) as Offset
    }

    fn handles_at(&self) -> Offset {
        self.header + offset_of!(QueueHeader, handles) as Offset
    }

    fn ensure_open(&self, view: &SegmentView<'_>) -> Result<()> {
        if view.read::<u32>(self.closed_at())? != 0 {
            return Err(IpcError::QueueClosed {
                name: self.name.clone(),
            });
        }
        Ok(())
    }

    fn signal(&self) -> Result<()> {
        self.event.set(EventState::Signaled).map_err(IpcError::lock)
    }

    /// Appends `block` and wakes one waiting consumer.
    ///
    /// On a closed queue the block is returned to the allocator and
    /// `QueueClosed` is reported. A block whose header is not in the held
    /// state is left exactly as found.
    pub fn enqueue(&self, block: Block<'a>) -> Result<()> {
        if block.allocator().segment().name() != self.alloc.segment().name() {
            return Err(IpcError::InvalidState("block belongs to another segment"));
        }
        let offset = block.offset();
        self.alloc.segment().with_lock(|view| {
            ShmAllocator::expect_tag(view, offset, TAG_USED)?;
            if let Err(e) = self.ensure_open(view) {
                ShmAllocator::free_locked(view, offset)?;
                return Err(e);
            }
            self.list().insert_tail(view, offset)?;
            ShmAllocator::retag(view, offset, TAG_USED, TAG_QUEUED).map(|_| ())
        })?;
        block.into_offset();
        self.signal()
    }

    /// Takes the head without waiting.
    pub fn try_dequeue(&self) -> Result<Option<Block<'a>>> {
        let taken = self.alloc.segment().with_lock(|view| {
            self.ensure_open(view)?;
            let list = self.list();
            let Some(offset) = list.front(view)? else {
                return Ok(None);
            };
            ShmAllocator::expect_tag(view, offset, TAG_QUEUED)?;
            list.remove_head(view)?;
            let len = ShmAllocator::retag(view, offset, TAG_QUEUED, TAG_USED)?;
            Ok(Some((offset, len, list.len(view)? > 0)))
        })?;
        match taken {
            None => Ok(None),
            Some((offset, len, more)) => {
                if more {
                    self.signal()?;
                }
                Ok(Some(self.alloc.adopt(offset, len)))
            }
        }
    }

    // Like try_dequeue, but passes a terminal condition on to the next waiter.
    fn take(&self) -> Result<Option<Block<'a>>> {
        match self.try_dequeue() {
            Err(e @ IpcError::QueueClosed { .. }) | Err(e @ IpcError::SegmentDestroyed { .. }) => {
                if let Err(signal_err) = self.signal() {
                    tracing::warn!(queue = %self.name, error = %signal_err, "failed to pass on closure wakeup");
                }
                Err(e)
            }
            other => other,
        }
    }

    /// Sleeps until signalled or until `limit` passes. Callers re-check the
    /// list afterwards, so a wait that ends for any reason is not an error.
    fn wait_for_signal(&self, limit: Duration) {
        let started = Instant::now();
        if self.event.wait(Timeout::Val(event_wait_span(limit))).is_ok() {
            return;
        }
        // Expired, or refused outright. Bound the retry rate either way.
        let elapsed = started.elapsed();
        if elapsed < RETRY_PAUSE {
            thread::sleep(limit.saturating_sub(elapsed).min(RETRY_PAUSE));
        }
    }

    /// Blocks until an item is available.
    pub fn dequeue(&self) -> Result<Block<'a>> {
        loop {
            if let Some(block) = self.take()? {
                return Ok(block);
            }
            self.wait_for_signal(WAIT_SLICE);
        }
    }

    /// Blocks for at most `timeout`; `Ok(None)` when nothing arrived.
    pub fn dequeue_timed(&self, timeout: Duration) -> Result<Option<Block<'a>>> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(block) = self.take()? {
                return Ok(Some(block));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            self.wait_for_signal((deadline - now).min(WAIT_SLICE));
        }
    }

    pub fn len(&self) -> Result<usize> {
        self.alloc
            .segment()
            .with_lock(|view| Ok(self.list().len(view)? as usize))
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Visits every pending payload from head to tail without dequeuing.
    ///
    /// `visit` runs under the segment lock and must not call back into the
    /// segment. Returns the number of items visited.
    pub fn walk<F>(&self, mut visit: F) -> Result<usize>
    where
        F: FnMut(&[u8]),
    {
        self.alloc.segment().with_lock(|view| {
            self.ensure_open(view)?;
            let list = self.list();
            let mut visited = 0;
            let mut cursor = list.front(view)?;
            while let Some(node) = cursor {
                let len = ShmAllocator::payload_len(view, node)?;
                visit(view.bytes(node + BLOCK_HEADER_SIZE as Offset, len)?);
                visited += 1;
                cursor = list.next(view, node)?;
            }
            Ok(visited)
        })
    }

    /// Closes the queue for every attached handle.
    ///
    /// Pending items go back to the allocator, the name is released, and all
    /// waiters wake with `QueueClosed`. The header block, which holds the
    /// event, is freed once every handle has dropped.
    pub fn close(&self) -> Result<()> {
        let drained = self.alloc.segment().with_lock(|view| {
            if view.read::<u32>(self.closed_at())? != 0 {
                return Ok(None);
            }
            view.write(self.closed_at(), 1u32)?;
            let list = self.list();
            let mut drained = 0usize;
            while let Some(offset) = list.remove_head(view)? {
                ShmAllocator::retag(view, offset, TAG_QUEUED, TAG_USED)?;
                ShmAllocator::free_locked(view, offset)?;
                drained += 1;
            }
            match ShmAllocator::unregister_locked(view, &self.name) {
                Ok(_) | Err(IpcError::NotFound { .. }) => {}
                Err(e) => return Err(e),
            }
            Ok(Some(drained))
        })?;
        if let Some(drained) = drained {
            tracing::debug!(queue = %self.name, drained, "closed shared queue");
            self.signal()?;
        }
        Ok(())
    }

    // Drops this handle's count; the last handle of a closed queue frees the header.
    fn release(&self) -> Result<bool> {
        self.alloc.segment().with_lock(|view| {
            let handles = view.read::<u32>(self.handles_at())?;
            if handles == 0 {
                return Err(IpcError::corruption(self.handles_at(), "queue handle count underflow"));
            }
            view.write(self.handles_at(), handles - 1)?;
            if handles > 1 || view.read::<u32>(self.closed_at())? == 0 {
                return Ok(false);
            }
            ShmAllocator::free_locked(view, self.header - BLOCK_HEADER_SIZE as Offset)?;
            Ok(true)
        })
    }
}

/// Clamps `limit` so the absolute deadline raw_sync derives from it is a
/// valid timespec. It adds the sub-second part to the realtime clock's
/// nanoseconds without carrying into seconds, and a wait with an
/// out-of-range deadline fails at once. A clamped wait ends early at the
/// next second boundary and the caller's loop waits again.
fn event_wait_span(limit: Duration) -> Duration {
    let now_ns = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|since| since.subsec_nanos())
        .unwrap_or(0);
    let room = 1_000_000_000u32.saturating_sub(now_ns.saturating_add(CLOCK_MARGIN_NS));
    Duration::new(limit.as_secs(), limit.subsec_nanos().min(room))
}

impl Drop for SharedQueue<'_> {
    fn drop(&mut self) {
        if self.alloc.segment().is_destroyed() {
            return;
        }
        if self.owner {
            if let Err(e) = self.close() {
                tracing::warn!(queue = %self.name, error = %e, "failed to close shared queue");
            }
        }
        match self.release() {
            Ok(true) => tracing::debug!(queue = %self.name, "freed shared queue header"),
            Ok(false) => {}
            Err(e) => tracing::warn!(queue = %self.name, error = %e, "failed to release shared queue"),
        }
    }
}
