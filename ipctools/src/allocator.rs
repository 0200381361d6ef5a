//! Fixed-arena allocator over a shared segment.
//!
//! Free runs form an address-ordered [`IntrusiveList`] whose links live in
//! the block headers themselves. `malloc` is first fit and carves from the
//! tail of the chosen run so the run keeps its place in the list; `free`
//! re-inserts in address order and merges with both neighbours.
//!
//! The allocator also keeps a small registry of named objects so a queue or
//! logger created in one process can be found by name in another.

use std::fmt;
use std::mem::{self, offset_of};
use std::ops::{Deref, DerefMut};
use std::slice;

use crate::errors::{IpcError, Result};
use crate::list::{IntrusiveList, Link, ListHead, Offset, NIL};
use crate::segment::{Segment, SegmentView, ShmemConfig, DATA_AT};

pub const BLOCK_ALIGN: usize = 16;
pub const NAME_LEN: usize = 32;
pub const REGISTRY_SLOTS: usize = 16;

pub(crate) const TAG_FREE: u32 = u32::from_le_bytes(*b"FREE");
pub(crate) const TAG_USED: u32 = u32::from_le_bytes(*b"USED");
pub(crate) const TAG_QUEUED: u32 = u32::from_le_bytes(*b"QUED");

/// Header in front of every block. The link comes first so a block's offset
/// is also its list node offset.
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub(crate) struct BlockHeader {
    pub link: Link,
    pub size: u64,
    pub tag: u32,
    reserved: u32,
}

pub(crate) const BLOCK_HEADER_SIZE: usize = mem::size_of::<BlockHeader>();
const MIN_BLOCK: u64 = (BLOCK_HEADER_SIZE + BLOCK_ALIGN) as u64;
const SIZE_FIELD: Offset = offset_of!(BlockHeader, size) as Offset;
const TAG_FIELD: Offset = offset_of!(BlockHeader, tag) as Offset;

#[repr(C)]
#[derive(Clone, Copy)]
struct RegistryEntry {
    name: [u8; NAME_LEN],
    offset: Offset,
}

#[repr(C)]
#[derive(Clone, Copy)]
struct ArenaHeader {
    arena_start: Offset,
    arena_end: Offset,
    free: ListHead,
    free_bytes: u64,
    allocated_blocks: u64,
    registry: [RegistryEntry; REGISTRY_SLOTS],
}

const ARENA_START_AT: Offset = DATA_AT + offset_of!(ArenaHeader, arena_start) as Offset;
const ARENA_END_AT: Offset = DATA_AT + offset_of!(ArenaHeader, arena_end) as Offset;
const FREE_BYTES_AT: Offset = DATA_AT + offset_of!(ArenaHeader, free_bytes) as Offset;
const ALLOCATED_AT: Offset = DATA_AT + offset_of!(ArenaHeader, allocated_blocks) as Offset;
const REGISTRY_AT: Offset = DATA_AT + offset_of!(ArenaHeader, registry) as Offset;
const FREE_LIST: IntrusiveList =
    IntrusiveList::at(DATA_AT + offset_of!(ArenaHeader, free) as Offset);

#[inline]
const fn align_up(value: u64, align: u64) -> u64 {
    (value + align - 1) & !(align - 1)
}

#[inline]
fn registry_entry_at(slot: usize) -> Offset {
    REGISTRY_AT + (slot * mem::size_of::<RegistryEntry>()) as Offset
}

fn encode_name(name: &str) -> Result<[u8; NAME_LEN]> {
    // One byte stays zero so the stored name is always terminated.
    if name.is_empty() || name.len() >= NAME_LEN {
        return Err(IpcError::InvalidConfig(format!(
            "object name '{}' must be 1..{} bytes",
            name, NAME_LEN
        )));
    }
    let mut key = [0u8; NAME_LEN];
    key[..name.len()].copy_from_slice(name.as_bytes());
    Ok(key)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ArenaStats {
    pub segment_size: usize,
    pub arena_size: usize,
    pub free_bytes: usize,
    pub largest_free: usize,
    pub free_runs: usize,
    pub allocated_blocks: usize,
}

/// A block held by this process: off every list and not yet freed.
///
/// Moving the token into [`crate::SharedQueue::enqueue`] or
/// [`ShmAllocator::free`] is the only way to give the block up, so the same
/// block can never sit in two places. Dropping it leaks the block.
#[must_use = "a block that is neither enqueued nor freed leaks arena space"]
pub struct Block<'a> {
    alloc: &'a ShmAllocator,
    offset: Offset,
    len: usize,
}

impl<'a> Block<'a> {
    /// Segment-relative offset of the block header.
    pub fn offset(&self) -> Offset {
        self.offset
    }

    pub fn allocator(&self) -> &'a ShmAllocator {
        self.alloc
    }

    pub(crate) fn into_offset(self) -> Offset {
        self.offset
    }
}

impl Deref for Block<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        // SAFETY: the range was validated when the token was issued and the
        // token grants exclusive ownership of the payload.
        unsafe {
            let ptr = self.alloc.segment.base_ptr().add(self.offset as usize + BLOCK_HEADER_SIZE);
            slice::from_raw_parts(ptr, self.len)
        }
    }
}

impl DerefMut for Block<'_> {
    fn deref_mut(&mut self) -> &mut [u8] {
        // SAFETY: as in `deref`.
        unsafe {
            let ptr = self.alloc.segment.base_ptr().add(self.offset as usize + BLOCK_HEADER_SIZE);
            slice::from_raw_parts_mut(ptr, self.len)
        }
    }
}

impl fmt::Debug for Block<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Block")
            .field("offset", &self.offset)
            .field("len", &self.len)
            .finish()
    }
}

pub struct ShmAllocator {
    segment: Segment,
}

impl ShmAllocator {
    /// Creates the named segment and formats its arena as one free run.
    pub fn create(cfg: &ShmemConfig) -> Result<ShmAllocator> {
        ShmAllocator::new(Segment::create(cfg)?)
    }

    pub fn attach(cfg: &ShmemConfig) -> Result<ShmAllocator> {
        ShmAllocator::new(Segment::attach(cfg)?)
    }

    /// Takes over a segment: a freshly created one is formatted and
    /// published, an attached one has its arena bounds checked.
    pub fn new(segment: Segment) -> Result<ShmAllocator> {
        if segment.is_owner() && !segment.is_published() {
            Self::format(&segment)?;
            segment.publish();
        } else {
            Self::validate(&segment)?;
        }
        Ok(ShmAllocator { segment })
    }

    fn format(segment: &Segment) -> Result<()> {
        segment.with_lock(|view| {
            let arena_start = align_up(DATA_AT + mem::size_of::<ArenaHeader>() as Offset, 64);
            let arena_end = view.len() as Offset & !(BLOCK_ALIGN as Offset - 1);
            if arena_end < arena_start + MIN_BLOCK {
                return Err(IpcError::InvalidConfig(format!(
                    "segment of {} bytes leaves no arena",
                    view.len()
                )));
            }
            view.bytes_mut(DATA_AT, mem::size_of::<ArenaHeader>())?.fill(0);
            view.write(ARENA_START_AT, arena_start)?;
            view.write(ARENA_END_AT, arena_end)?;
            FREE_LIST.init(view)?;

            let size = arena_end - arena_start;
            view.write(
                arena_start,
                BlockHeader {
                    link: Link::UNLINKED,
                    size,
                    tag: TAG_FREE,
                    reserved: 0,
                },
            )?;
            FREE_LIST.insert_tail(view, arena_start)?;
            view.write(FREE_BYTES_AT, size)?;
            view.write(ALLOCATED_AT, 0u64)
        })
    }

    fn validate(segment: &Segment) -> Result<()> {
        segment.with_lock(|view| {
            let start: Offset = view.read(ARENA_START_AT)?;
            let end: Offset = view.read(ARENA_END_AT)?;
            if start < DATA_AT || end > view.len() as Offset || start >= end {
                return Err(IpcError::corruption(ARENA_START_AT, "arena bounds out of range"));
            }
            Ok(())
        })
    }

    pub fn segment(&self) -> &Segment {
        &self.segment
    }

    /// Allocates at least `size` payload bytes, zero filled.
    pub fn malloc(&self, size: usize) -> Result<Block<'_>> {
        let (offset, len) = self.segment.with_lock(|view| Self::malloc_locked(view, size))?;
        tracing::trace!(segment = %self.segment.name(), offset, len, "malloc");
        Ok(Block {
            alloc: self,
            offset,
            len,
        })
    }

    pub fn free(&self, block: Block<'_>) -> Result<()> {
        if !std::ptr::eq(block.alloc, self)
            && block.alloc.segment.name() != self.segment.name()
        {
            return Err(IpcError::InvalidState("block belongs to another segment"));
        }
        let offset = block.into_offset();
        self.segment.with_lock(|view| Self::free_locked(view, offset))?;
        tracing::trace!(segment = %self.segment.name(), offset, "free");
        Ok(())
    }

    pub fn stats(&self) -> Result<ArenaStats> {
        self.segment.with_lock(|view| {
            let start: Offset = view.read(ARENA_START_AT)?;
            let end: Offset = view.read(ARENA_END_AT)?;
            let mut largest = 0u64;
            let mut runs = 0usize;
            let mut cursor = FREE_LIST.front(view)?;
            while let Some(run) = cursor {
                let header: BlockHeader = view.read(run)?;
                largest = largest.max(header.size);
                runs += 1;
                cursor = FREE_LIST.next(view, run)?;
            }
            Ok(ArenaStats {
                segment_size: view.len(),
                arena_size: (end - start) as usize,
                free_bytes: view.read::<u64>(FREE_BYTES_AT)? as usize,
                largest_free: largest as usize,
                free_runs: runs,
                allocated_blocks: view.read::<u64>(ALLOCATED_AT)? as usize,
            })
        })
    }

    pub fn register(&self, name: &str, offset: Offset) -> Result<()> {
        self.segment.with_lock(|view| Self::register_locked(view, name, offset))
    }

    pub fn lookup(&self, name: &str) -> Result<Option<Offset>> {
        self.segment.with_lock(|view| Self::lookup_locked(view, name))
    }

    pub fn unregister(&self, name: &str) -> Result<Offset> {
        self.segment.with_lock(|view| Self::unregister_locked(view, name))
    }

    /// Issues a token for a block that was just taken off a list.
    pub(crate) fn adopt(&self, offset: Offset, len: usize) -> Block<'_> {
        Block {
            alloc: self,
            offset,
            len,
        }
    }

    /// Payload capacity of the block at `offset`.
    pub(crate) fn payload_len(view: &SegmentView<'_>, offset: Offset) -> Result<usize> {
        Ok(Self::read_block(view, offset)?.size as usize - BLOCK_HEADER_SIZE)
    }

    fn read_block(view: &SegmentView<'_>, offset: Offset) -> Result<BlockHeader> {
        let start: Offset = view.read(ARENA_START_AT)?;
        let end: Offset = view.read(ARENA_END_AT)?;
        if offset < start || offset >= end || (offset - start) % BLOCK_ALIGN as Offset != 0 {
            return Err(IpcError::corruption(offset, "offset is not a block in the arena"));
        }
        let header: BlockHeader = view.read(offset)?;
        if header.size < MIN_BLOCK || offset + header.size > end {
            return Err(IpcError::corruption(
                offset,
                format!("block size {} out of range", header.size),
            ));
        }
        Ok(header)
    }

    /// Reads a block header and checks it carries the `expected` tag.
    pub(crate) fn expect_tag(view: &SegmentView<'_>, offset: Offset, expected: u32) -> Result<BlockHeader> {
        let header = Self::read_block(view, offset)?;
        if header.tag != expected {
            return Err(match header.tag {
                TAG_FREE => IpcError::corruption(offset, "block is on the free list"),
                TAG_QUEUED => IpcError::InvalidState("block is still linked in a queue"),
                TAG_USED => IpcError::InvalidState("block is held by a process, not linked"),
                _ => IpcError::corruption(offset, "unknown block tag"),
            });
        }
        Ok(header)
    }

    /// Changes a block's ownership tag, checking the state it leaves.
    /// Returns the payload capacity.
    pub(crate) fn retag(view: &mut SegmentView<'_>, offset: Offset, from: u32, to: u32) -> Result<usize> {
        let header = Self::expect_tag(view, offset, from)?;
        view.write(offset + TAG_FIELD, to)?;
        Ok(header.size as usize - BLOCK_HEADER_SIZE)
    }

    pub(crate) fn malloc_locked(view: &mut SegmentView<'_>, size: usize) -> Result<(Offset, usize)> {
        let padded = (size as u64)
            .checked_add(BLOCK_HEADER_SIZE as u64 + BLOCK_ALIGN as u64 - 1)
            .map(|v| v & !(BLOCK_ALIGN as u64 - 1))
            .unwrap_or(u64::MAX)
            .max(MIN_BLOCK);

        let mut largest = 0u64;
        let mut cursor = FREE_LIST.front(view)?;
        while let Some(run) = cursor {
            let header = Self::read_block(view, run)?;
            if header.tag != TAG_FREE {
                return Err(IpcError::corruption(run, "non-free block on the free list"));
            }
            if header.size >= padded {
                let rest = header.size - padded;
                let (offset, taken) = if rest >= MIN_BLOCK {
                    view.write(run + SIZE_FIELD, rest)?;
                    (run + rest, padded)
                } else {
                    FREE_LIST.remove(view, run)?;
                    (run, header.size)
                };
                view.write(
                    offset,
                    BlockHeader {
                        link: Link::UNLINKED,
                        size: taken,
                        tag: TAG_USED,
                        reserved: 0,
                    },
                )?;
                let len = taken as usize - BLOCK_HEADER_SIZE;
                view.bytes_mut(offset + BLOCK_HEADER_SIZE as Offset, len)?.fill(0);

                let free_bytes: u64 = view.read(FREE_BYTES_AT)?;
                view.write(FREE_BYTES_AT, free_bytes - taken)?;
                let allocated: u64 = view.read(ALLOCATED_AT)?;
                view.write(ALLOCATED_AT, allocated + 1)?;
                return Ok((offset, len));
            }
            largest = largest.max(header.size);
            cursor = FREE_LIST.next(view, run)?;
        }
        Err(IpcError::OutOfMemory {
            requested: size,
            largest_free: (largest as usize).saturating_sub(BLOCK_HEADER_SIZE),
        })
    }

    pub(crate) fn free_locked(view: &mut SegmentView<'_>, offset: Offset) -> Result<()> {
        let header = Self::expect_tag(view, offset, TAG_USED)?;
        let allocated: u64 = view.read(ALLOCATED_AT)?;
        if allocated == 0 {
            return Err(IpcError::corruption(ALLOCATED_AT, "allocation count underflow"));
        }

        let mut prev = None;
        let mut cursor = FREE_LIST.front(view)?;
        while let Some(run) = cursor {
            if run == offset {
                return Err(IpcError::corruption(offset, "block is already free"));
            }
            if run > offset {
                break;
            }
            prev = Some(run);
            cursor = FREE_LIST.next(view, run)?;
        }
        // Nothing has been written yet; from here on the block joins the list.
        FREE_LIST.insert_after(view, prev, offset)?;
        view.write(offset + TAG_FIELD, TAG_FREE)?;

        let free_bytes: u64 = view.read(FREE_BYTES_AT)?;
        view.write(FREE_BYTES_AT, free_bytes + header.size)?;
        view.write(ALLOCATED_AT, allocated - 1)?;

        let mut size = header.size;
        if let Some(next) = cursor {
            if offset + size == next {
                let next_header = Self::read_block(view, next)?;
                FREE_LIST.remove(view, next)?;
                view.write(next + TAG_FIELD, 0u32)?;
                size += next_header.size;
                view.write(offset + SIZE_FIELD, size)?;
            }
        }
        if let Some(prev) = prev {
            let prev_header = Self::read_block(view, prev)?;
            if prev + prev_header.size == offset {
                FREE_LIST.remove(view, offset)?;
                view.write(offset + TAG_FIELD, 0u32)?;
                view.write(prev + SIZE_FIELD, prev_header.size + size)?;
            }
        }
        Ok(())
    }

    pub(crate) fn register_locked(view: &mut SegmentView<'_>, name: &str, offset: Offset) -> Result<()> {
        let key = encode_name(name)?;
        let mut vacant = None;
        for slot in 0..REGISTRY_SLOTS {
            let entry: RegistryEntry = view.read(registry_entry_at(slot))?;
            if entry.offset == NIL {
                vacant.get_or_insert(slot);
            } else if entry.name == key {
                return Err(IpcError::AlreadyExists {
                    name: name.to_string(),
                });
            }
        }
        let slot = vacant.ok_or_else(|| IpcError::ResourceExhausted {
            reason: format!("all {} registry slots are in use", REGISTRY_SLOTS),
        })?;
        view.write(registry_entry_at(slot), RegistryEntry { name: key, offset })
    }

    pub(crate) fn lookup_locked(view: &SegmentView<'_>, name: &str) -> Result<Option<Offset>> {
        let key = encode_name(name)?;
        for slot in 0..REGISTRY_SLOTS {
            let entry: RegistryEntry = view.read(registry_entry_at(slot))?;
            if entry.offset != NIL && entry.name == key {
                return Ok(Some(entry.offset));
            }
        }
        Ok(None)
    }

    pub(crate) fn unregister_locked(view: &mut SegmentView<'_>, name: &str) -> Result<Offset> {
        let key = encode_name(name)?;
        for slot in 0..REGISTRY_SLOTS {
            let at = registry_entry_at(slot);
            let entry: RegistryEntry = view.read(at)?;
            if entry.offset != NIL && entry.name == key {
                view.write(
                    at,
                    RegistryEntry {
                        name: [0; NAME_LEN],
                        offset: NIL,
                    },
                )?;
                return Ok(entry.offset);
            }
        }
        Err(IpcError::NotFound {
            name: name.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::test_config;

    #[test]
    fn malloc_free_restores_free_space() {
        let alloc = ShmAllocator::create(&test_config("alloc_restore", 256 * 1024)).unwrap();
        let before = alloc.stats().unwrap();
        assert_eq!(before.free_runs, 1);
        assert_eq!(before.allocated_blocks, 0);

        for round in 0..10 {
            let mut blocks = Vec::new();
            for i in 0..40usize {
                blocks.push(alloc.malloc(1 + (i * 37 + round * 11) % 700).unwrap());
            }
            // Free in an interleaved order to exercise both merge directions.
            let mut odd = Vec::new();
            for (i, block) in blocks.into_iter().enumerate() {
                if i % 2 == 0 {
                    alloc.free(block).unwrap();
                } else {
                    odd.push(block);
                }
            }
            for block in odd.into_iter().rev() {
                alloc.free(block).unwrap();
            }
        }

        let after = alloc.stats().unwrap();
        assert_eq!(after, before);
    }

    #[test]
    fn blocks_are_disjoint_and_writable() {
        let alloc = ShmAllocator::create(&test_config("alloc_disjoint", 64 * 1024)).unwrap();
        let mut a = alloc.malloc(100).unwrap();
        let mut b = alloc.malloc(100).unwrap();
        assert!(a.len() >= 100);
        assert_eq!(a.offset() % BLOCK_ALIGN as Offset, 0);
        assert!(a.iter().all(|&byte| byte == 0));
        a.fill(0xaa);
        b.fill(0xbb);
        assert!(a.iter().all(|&byte| byte == 0xaa));
        let (lo, hi) = if a.offset() < b.offset() { (&a, &b) } else { (&b, &a) };
        assert!(lo.offset() + (BLOCK_HEADER_SIZE + lo.len()) as Offset <= hi.offset());
        alloc.free(a).unwrap();
        alloc.free(b).unwrap();
    }

    #[test]
    fn out_of_memory_reports_largest_run() {
        let alloc = ShmAllocator::create(&test_config("alloc_oom", 16 * 1024)).unwrap();
        let stats = alloc.stats().unwrap();
        match alloc.malloc(stats.arena_size) {
            Err(IpcError::OutOfMemory { requested, largest_free }) => {
                assert_eq!(requested, stats.arena_size);
                assert_eq!(largest_free, stats.largest_free - BLOCK_HEADER_SIZE);
            }
            other => panic!("expected OutOfMemory, got {:?}", other),
        }

        let mut held = Vec::new();
        loop {
            match alloc.malloc(256) {
                Ok(block) => held.push(block),
                Err(IpcError::OutOfMemory { .. }) => break,
                Err(e) => panic!("unexpected error {}", e),
            }
        }
        assert!(!held.is_empty());
        for block in held {
            alloc.free(block).unwrap();
        }
        assert_eq!(alloc.stats().unwrap(), stats);
    }

    #[test]
    fn neighbours_coalesce() {
        let alloc = ShmAllocator::create(&test_config("alloc_merge", 64 * 1024)).unwrap();
        let a = alloc.malloc(64).unwrap();
        let b = alloc.malloc(64).unwrap();
        let c = alloc.malloc(64).unwrap();
        let d = alloc.malloc(64).unwrap();
        alloc.free(b).unwrap();
        alloc.free(d).unwrap();
        assert!(alloc.stats().unwrap().free_runs >= 2);
        alloc.free(c).unwrap();
        alloc.free(a).unwrap();
        let stats = alloc.stats().unwrap();
        assert_eq!(stats.free_runs, 1);
        assert_eq!(stats.free_bytes, stats.arena_size);
    }

    #[test]
    fn attached_handle_shares_the_arena() {
        let cfg = test_config("alloc_attach", 64 * 1024);
        let owner = ShmAllocator::create(&cfg).unwrap();
        let peer = ShmAllocator::attach(&cfg).unwrap();
        let mut block = owner.malloc(32).unwrap();
        block[..5].copy_from_slice(b"hello");
        let offset = block.offset();

        let stats = peer.stats().unwrap();
        assert_eq!(stats.allocated_blocks, 1);
        let seen = peer
            .segment()
            .with_lock(|view| Ok(view.bytes(offset + BLOCK_HEADER_SIZE as Offset, 5)?.to_vec()))
            .unwrap();
        assert_eq!(seen, b"hello");
        owner.free(block).unwrap();
        assert_eq!(peer.stats().unwrap().allocated_blocks, 0);
    }

    #[test]
    fn failed_free_leaves_block_untouched() {
        let alloc = ShmAllocator::create(&test_config("alloc_bad_free", 64 * 1024)).unwrap();
        let block = alloc.malloc(64).unwrap();
        let offset = block.offset();
        let len = block.len();

        // A free list that already names the block, as a stray write could leave it.
        alloc
            .segment()
            .with_lock(|view| FREE_LIST.insert_tail(view, offset))
            .unwrap();
        let before = alloc.stats().unwrap();
        let err = alloc.free(block).unwrap_err();
        assert!(matches!(err, IpcError::Corruption { .. }), "{:?}", err);

        let tag = alloc
            .segment()
            .with_lock(|view| Ok(view.read::<BlockHeader>(offset)?.tag))
            .unwrap();
        assert_eq!(tag, TAG_USED);
        assert_eq!(alloc.stats().unwrap(), before);

        // Repair the list and the block frees normally.
        alloc
            .segment()
            .with_lock(|view| FREE_LIST.remove(view, offset))
            .unwrap();
        alloc.free(alloc.adopt(offset, len)).unwrap();
        let stats = alloc.stats().unwrap();
        assert_eq!(stats.allocated_blocks, 0);
        assert_eq!(stats.free_bytes, stats.arena_size);
    }

    #[test]
    fn free_rejects_queued_block() {
        let alloc = ShmAllocator::create(&test_config("alloc_queued_free", 64 * 1024)).unwrap();
        let block = alloc.malloc(16).unwrap();
        let (offset, len) = (block.offset(), block.len());
        alloc
            .segment()
            .with_lock(|view| ShmAllocator::retag(view, offset, TAG_USED, TAG_QUEUED))
            .unwrap();
        assert!(matches!(alloc.free(block), Err(IpcError::InvalidState(_))));
        assert_eq!(alloc.stats().unwrap().allocated_blocks, 1);

        alloc
            .segment()
            .with_lock(|view| ShmAllocator::retag(view, offset, TAG_QUEUED, TAG_USED))
            .unwrap();
        alloc.free(alloc.adopt(offset, len)).unwrap();
        assert_eq!(alloc.stats().unwrap().allocated_blocks, 0);
    }

    #[test]
    fn registry_names_objects() {
        let alloc = ShmAllocator::create(&test_config("alloc_registry", 64 * 1024)).unwrap();
        alloc.register("queue", 4096).unwrap();
        assert_eq!(alloc.lookup("queue").unwrap(), Some(4096));
        assert_eq!(alloc.lookup("other").unwrap(), None);
        assert!(matches!(
            alloc.register("queue", 8192),
            Err(IpcError::AlreadyExists { .. })
        ));
        assert!(matches!(
            alloc.register(&"x".repeat(NAME_LEN), 8192),
            Err(IpcError::InvalidConfig(_))
        ));
        assert_eq!(alloc.unregister("queue").unwrap(), 4096);
        assert!(matches!(alloc.unregister("queue"), Err(IpcError::NotFound { .. })));

        for slot in 0..REGISTRY_SLOTS {
            alloc.register(&format!("obj{}", slot), 4096).unwrap();
        }
        assert!(matches!(
            alloc.register("overflow", 4096),
            Err(IpcError::ResourceExhausted { .. })
        ));
    }
}
