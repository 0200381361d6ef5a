//! Named shared-memory segment with a process-shared lock in its header.
//!
//! Layout of every segment:
//!
//! ```text
//! 0          Preamble { magic, state, version, size }
//! LOCK_AT    raw_sync process-shared mutex (LOCK_REGION bytes)
//! DATA_AT    owned by the allocator: arena header, then the arena
//! ```
//!
//! All shared state except `state` is only touched through [`Segment::with_lock`].

use std::marker::PhantomData;
use std::mem;
use std::ptr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use raw_sync::locks::{LockImpl, LockInit, Mutex};
use raw_sync::Timeout;
use serde_derive::{Deserialize, Serialize};
use shared_memory::{Shmem, ShmemConf, ShmemError};

use crate::errors::{IpcError, Result};
use crate::list::{Link, LinkArena, ListHead, Offset};

pub const SEGMENT_MAGIC: u64 = u64::from_le_bytes(*b"IPTSHM01");
pub const SEGMENT_VERSION: u32 = 1;

pub const MIN_SEGMENT_SIZE: usize = 4096;

const LOCK_AT: usize = 64;
const LOCK_REGION: usize = 256;
pub(crate) const DATA_AT: Offset = (LOCK_AT + LOCK_REGION) as Offset;

const STATE_INITIALIZING: u32 = 0;
const STATE_READY: u32 = 1;
const STATE_DESTROYED: u32 = 2;

const OS_ID_PREFIX: &str = "/ipt_";
const MAX_NAME_LEN: usize = 200;

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ShmemConfig {
    /// Logical segment name, mapped to the OS object `/ipt_<name>`.
    pub name: String,
    /// Total segment size in bytes, header included.
    pub size: usize,
    /// Upper bound on waiting for the shared lock before an operation fails.
    pub lock_timeout_ms: u64,
}

impl Default for ShmemConfig {
    fn default() -> ShmemConfig {
        ShmemConfig {
            name: "ipctools".to_string(),
            size: 1024 * 1024,
            lock_timeout_ms: 5_000,
        }
    }
}

impl ShmemConfig {
    pub fn new(name: impl Into<String>, size: usize) -> ShmemConfig {
        ShmemConfig {
            name: name.into(),
            size,
            ..Default::default()
        }
    }

    /// The lock timeout rounded up to whole seconds. raw_sync builds its
    /// absolute deadline without carrying nanoseconds into seconds, so only
    /// whole-second timed waits are reliable.
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_secs(self.lock_timeout_ms.div_ceil(1000))
    }

    fn os_id(&self) -> String {
        format!("{}{}", OS_ID_PREFIX, self.name)
    }

    fn validate_name(&self) -> Result<()> {
        if self.name.is_empty() || self.name.len() > MAX_NAME_LEN || self.name.contains('/') {
            return Err(IpcError::InvalidConfig(format!(
                "segment name '{}' must be 1..={} bytes without '/'",
                self.name, MAX_NAME_LEN
            )));
        }
        Ok(())
    }
}

#[repr(C)]
struct Preamble {
    magic: u64,
    state: AtomicU32,
    version: u32,
    size: u64,
}

/// A process-local attachment to a named segment.
///
/// The creating handle is the owner: dropping it marks the segment destroyed
/// and removes the OS name. Mappings held by other processes stay valid
/// until they drop their own handle.
pub struct Segment {
    // Declared before `shmem` so the lock is released before the unmap.
    lock: Box<dyn LockImpl>,
    shmem: Shmem,
    name: String,
    lock_timeout: Duration,
}

fn classify_errno(errno: u32, name: &str) -> Option<IpcError> {
    let name = name.to_string();
    match errno as i32 {
        libc::ENOENT => Some(IpcError::NotFound { name }),
        libc::EACCES | libc::EPERM => Some(IpcError::PermissionDenied { name }),
        libc::ENOSPC | libc::ENOMEM | libc::EMFILE | libc::ENFILE => {
            Some(IpcError::ResourceExhausted {
                reason: format!("cannot map segment '{}' (errno {})", name, errno),
            })
        }
        _ => None,
    }
}

fn map_shmem_error(err: ShmemError, name: &str) -> IpcError {
    match err {
        ShmemError::MappingIdExists => IpcError::AlreadyExists {
            name: name.to_string(),
        },
        ShmemError::MapCreateFailed(errno) | ShmemError::MapOpenFailed(errno) => {
            classify_errno(errno, name).unwrap_or(IpcError::SharedMemory(err))
        }
        other => IpcError::SharedMemory(other),
    }
}

/// Opens the OS object once the creator has sized it. Between `shm_open`
/// and `ftruncate` the object exists but is empty, and mapping it fails
/// with EINVAL.
fn open_sized(cfg: &ShmemConfig, deadline: Instant) -> Result<Shmem> {
    loop {
        match ShmemConf::new().os_id(cfg.os_id()).open() {
            Ok(shmem) if shmem.len() >= MIN_SEGMENT_SIZE => return Ok(shmem),
            Ok(shmem) => {
                tracing::trace!(name = %cfg.name, len = shmem.len(), "segment not sized yet");
            }
            Err(ShmemError::MapOpenFailed(errno)) if errno as i32 == libc::EINVAL => {
                tracing::trace!(name = %cfg.name, "segment not sized yet");
            }
            Err(e) => return Err(map_shmem_error(e, &cfg.name)),
        }
        if Instant::now() >= deadline {
            return Err(IpcError::InvalidState("segment was never sized"));
        }
        thread::sleep(Duration::from_millis(1));
    }
}

impl Segment {
    pub fn create(cfg: &ShmemConfig) -> Result<Segment> {
        cfg.validate_name()?;
        if cfg.size < MIN_SEGMENT_SIZE {
            return Err(IpcError::InvalidConfig(format!(
                "segment size {} is below the minimum {}",
                cfg.size, MIN_SEGMENT_SIZE
            )));
        }

        let shmem = ShmemConf::new()
            .size(cfg.size)
            .os_id(cfg.os_id())
            .create()
            .map_err(|e| map_shmem_error(e, &cfg.name))?;
        let base = shmem.as_ptr();

        // SAFETY: the mapping is fresh, at least MIN_SEGMENT_SIZE long and page aligned.
        let lock = unsafe {
            ptr::write_bytes(base, 0, DATA_AT as usize);
            ptr::write(
                base as *mut Preamble,
                Preamble {
                    magic: SEGMENT_MAGIC,
                    state: AtomicU32::new(STATE_INITIALIZING),
                    version: SEGMENT_VERSION,
                    size: shmem.len() as u64,
                },
            );
            let lock_mem = base.add(LOCK_AT);
            if Mutex::size_of(Some(lock_mem)) > LOCK_REGION {
                return Err(IpcError::InvalidConfig(
                    "process-shared mutex does not fit its header region".to_string(),
                ));
            }
            let (lock, _) = Mutex::new(lock_mem, base).map_err(IpcError::lock)?;
            lock
        };

        tracing::debug!(name = %cfg.name, size = shmem.len(), "created shared memory segment");

        Ok(Segment {
            lock,
            shmem,
            name: cfg.name.clone(),
            lock_timeout: cfg.lock_timeout(),
        })
    }

    pub fn attach(cfg: &ShmemConfig) -> Result<Segment> {
        cfg.validate_name()?;
        let deadline = Instant::now() + cfg.lock_timeout();
        let shmem = open_sized(cfg, deadline)?;
        let base = shmem.as_ptr();
        // SAFETY: the mapping is at least MIN_SEGMENT_SIZE bytes and page aligned.
        let preamble = unsafe { &*(base as *const Preamble) };

        // The creator may still be initialising the header.
        loop {
            match preamble.state.load(Ordering::Acquire) {
                STATE_READY => break,
                STATE_DESTROYED => {
                    return Err(IpcError::SegmentDestroyed {
                        name: cfg.name.clone(),
                    })
                }
                _ if Instant::now() >= deadline => {
                    return Err(IpcError::InvalidState("segment never finished initialising"))
                }
                _ => thread::sleep(Duration::from_millis(1)),
            }
        }
        if preamble.magic != SEGMENT_MAGIC || preamble.version != SEGMENT_VERSION {
            return Err(IpcError::corruption(0, "bad segment magic or version"));
        }
        if preamble.size != shmem.len() as u64 {
            return Err(IpcError::corruption(
                0,
                format!("header size {} does not match mapping {}", preamble.size, shmem.len()),
            ));
        }

        // SAFETY: the creator initialised a process-shared mutex at LOCK_AT before publishing READY.
        let (lock, _) = unsafe { Mutex::from_existing(base.add(LOCK_AT), base) }.map_err(IpcError::lock)?;

        tracing::debug!(name = %cfg.name, size = shmem.len(), "attached shared memory segment");

        Ok(Segment {
            lock,
            shmem,
            name: cfg.name.clone(),
            lock_timeout: cfg.lock_timeout(),
        })
    }

    /// Publishes the segment to attachers. Called by the allocator once the
    /// data region is initialised.
    pub(crate) fn publish(&self) {
        self.preamble().state.store(STATE_READY, Ordering::Release);
    }

    pub(crate) fn is_published(&self) -> bool {
        self.preamble().state.load(Ordering::Acquire) == STATE_READY
    }

    /// Explicit teardown; equivalent to dropping the handle.
    pub fn destroy(self) {}

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.shmem.len()
    }

    pub fn is_owner(&self) -> bool {
        self.shmem.is_owner()
    }

    pub fn is_destroyed(&self) -> bool {
        self.preamble().state.load(Ordering::Acquire) == STATE_DESTROYED
    }

    pub fn lock_timeout(&self) -> Duration {
        self.lock_timeout
    }

    /// Base of this process's mapping. Only meaningful for comparisons and
    /// diagnostics; shared state never stores it.
    pub fn local_base(&self) -> *const u8 {
        self.shmem.as_ptr()
    }

    fn preamble(&self) -> &Preamble {
        // SAFETY: every live Segment maps at least MIN_SEGMENT_SIZE bytes with a Preamble at 0.
        unsafe { &*(self.shmem.as_ptr() as *const Preamble) }
    }

    pub(crate) fn ensure_live(&self) -> Result<()> {
        if self.is_destroyed() {
            return Err(IpcError::SegmentDestroyed {
                name: self.name.clone(),
            });
        }
        Ok(())
    }

    /// Runs `f` while holding the segment's process-shared mutex.
    pub fn with_lock<R, F>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&mut SegmentView<'_>) -> Result<R>,
    {
        self.ensure_live()?;
        let _guard = self
            .lock
            .try_lock(Timeout::Val(self.lock_timeout))
            .map_err(|e| {
                tracing::warn!(name = %self.name, error = %e, "failed to acquire segment lock");
                IpcError::LockTimeout {
                    timeout_ms: self.lock_timeout.as_millis() as u64,
                }
            })?;
        self.ensure_live()?;
        let mut view = SegmentView {
            base: self.shmem.as_ptr(),
            len: self.shmem.len(),
            _lock: PhantomData,
        };
        f(&mut view)
    }

    /// Base of the local mapping, for blocks the caller exclusively owns.
    pub(crate) fn base_ptr(&self) -> *mut u8 {
        self.shmem.as_ptr()
    }
}

impl Drop for Segment {
    fn drop(&mut self) {
        if self.shmem.is_owner() {
            self.preamble().state.store(STATE_DESTROYED, Ordering::Release);
            tracing::debug!(name = %self.name, "destroyed shared memory segment");
        }
    }
}

fn check_range(len: usize, offset: Offset, size: usize, align: usize) -> Result<()> {
    let end = (offset as usize).checked_add(size);
    match end {
        Some(end) if end <= len && offset as usize % align == 0 => Ok(()),
        _ => Err(IpcError::corruption(
            offset,
            format!("access of {} bytes outside a {} byte segment", size, len),
        )),
    }
}

/// The segment as seen while the shared lock is held.
///
/// Offsets are translated against this process's mapping on every access.
pub struct SegmentView<'s> {
    base: *mut u8,
    len: usize,
    _lock: PhantomData<&'s mut Segment>,
}

impl<'s> SegmentView<'s> {
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn read<T: Copy>(&self, offset: Offset) -> Result<T> {
        check_range(self.len, offset, mem::size_of::<T>(), mem::align_of::<T>())?;
        // SAFETY: bounds and alignment checked; the lock serialises writers.
        Ok(unsafe { ptr::read(self.base.add(offset as usize) as *const T) })
    }

    pub fn write<T: Copy>(&mut self, offset: Offset, value: T) -> Result<()> {
        check_range(self.len, offset, mem::size_of::<T>(), mem::align_of::<T>())?;
        // SAFETY: bounds and alignment checked; the lock serialises writers.
        unsafe { ptr::write(self.base.add(offset as usize) as *mut T, value) };
        Ok(())
    }

    pub fn bytes(&self, offset: Offset, len: usize) -> Result<&[u8]> {
        check_range(self.len, offset, len, 1)?;
        // SAFETY: bounds checked; the slice cannot outlive the lock.
        Ok(unsafe { std::slice::from_raw_parts(self.base.add(offset as usize), len) })
    }

    pub fn bytes_mut(&mut self, offset: Offset, len: usize) -> Result<&mut [u8]> {
        check_range(self.len, offset, len, 1)?;
        // SAFETY: bounds checked; the slice cannot outlive the lock.
        Ok(unsafe { std::slice::from_raw_parts_mut(self.base.add(offset as usize), len) })
    }

    /// Raw pointer for objects that manage their own synchronisation.
    pub(crate) fn ptr(&self, offset: Offset, len: usize) -> Result<*mut u8> {
        check_range(self.len, offset, len, 1)?;
        // SAFETY: bounds checked.
        Ok(unsafe { self.base.add(offset as usize) })
    }
}

impl LinkArena for SegmentView<'_> {
    fn load_link(&self, node: Offset) -> Result<Link> {
        self.read(node)
    }

    fn store_link(&mut self, node: Offset, link: Link) -> Result<()> {
        self.write(node, link)
    }

    fn load_head(&self, list: Offset) -> Result<ListHead> {
        self.read(list)
    }

    fn store_head(&mut self, list: Offset, head: ListHead) -> Result<()> {
        self.write(list, head)
    }
}
