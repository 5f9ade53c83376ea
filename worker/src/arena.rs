use std::ffi::c_void;
use std::fs::File;
use std::num::NonZeroUsize;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicI32, AtomicU32, AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::sys::mman::{mmap, munmap, shm_open, shm_unlink, MapFlags, ProtFlags};
use nix::sys::stat::Mode;
use thiserror::Error;
use tracing::info;

use crate::lifecycle::WorkerStatus;

/// Identifies the arena format; an ASCII tag ("VTX3") plus a version field.
pub const MAGIC: u64 = 0x5654_5833_0000_0001;

pub const FORMAT_VERSION: u32 = 1;

/// Fixed number of worker slots in every arena.
pub const MAX_SLOTS: usize = 256;

pub const HEADER_BYTES: usize = 64;
pub const SLOT_BYTES: usize = 64;

/// Byte offset where the tensor region begins: header + slot table.
pub const TENSOR_REGION_OFFSET: usize = HEADER_BYTES + MAX_SLOTS * SLOT_BYTES;

pub const DEFAULT_ARENA_BYTES: usize = 64 * 1024 * 1024;

/// Arena header at offset 0 of the mapped region.
///
/// Layout is part of the cross-process contract and must never change
/// without bumping [`FORMAT_VERSION`]:
///
/// | offset | width | field       |
/// |--------|-------|-------------|
/// | 0      | 8     | magic       |
/// | 8      | 4     | version     |
/// | 12     | 4     | num_slots   |
/// | 16     | 8     | arena_size  |
/// | 24     | 8     | arena_used  |
/// | 32     | 4     | lock        |
/// | 36     | 28    | reserved    |
///
/// `magic`, `version`, `num_slots` and `arena_size` are written once at
/// creation and read-only afterwards. `arena_used` may only advance while
/// `lock` is held.
#[repr(C)]
pub struct ArenaHeader {
    pub magic: u64,
    pub version: u32,
    pub num_slots: u32,
    pub arena_size: u64,
    pub arena_used: AtomicU64,
    pub lock: AtomicU32,
    reserved: [u8; 28],
}

/// One worker's liveness record, 64 bytes, single-writer (the owning
/// worker), multi-reader (the supervisor).
///
/// | offset | width | field             |
/// |--------|-------|-------------------|
/// | 0      | 4     | pid               |
/// | 4      | 4     | status            |
/// | 8      | 8     | last_heartbeat_ms |
/// | 16     | 8     | current_job       |
/// | 24     | 4     | progress (f32)    |
/// | 28     | 36    | reserved          |
#[repr(C)]
pub struct WorkerSlot {
    pid: AtomicI32,
    status: AtomicU32,
    last_heartbeat_ms: AtomicU64,
    current_job: AtomicU64,
    progress_bits: AtomicU32,
    reserved: [u8; 36],
}

const _: () = assert!(std::mem::size_of::<ArenaHeader>() == HEADER_BYTES);
const _: () = assert!(std::mem::size_of::<WorkerSlot>() == SLOT_BYTES);

impl WorkerSlot {
    pub fn pid(&self) -> i32 {
        self.pid.load(Ordering::Acquire)
    }

    pub fn status(&self) -> WorkerStatus {
        WorkerStatus::from(self.status.load(Ordering::Acquire))
    }

    pub fn last_heartbeat_ms(&self) -> u64 {
        self.last_heartbeat_ms.load(Ordering::Acquire)
    }

    pub fn current_job(&self) -> u64 {
        self.current_job.load(Ordering::Acquire)
    }

    pub fn progress(&self) -> f32 {
        f32::from_bits(self.progress_bits.load(Ordering::Acquire))
    }
}

#[derive(Debug, Error)]
pub enum ArenaError {
    #[error("arena magic mismatch: found {found:#018x}, expected {expected:#018x}")]
    MagicMismatch { found: u64, expected: u64 },
    #[error("arena format version {found} not supported (expected {expected})")]
    VersionMismatch { found: u32, expected: u32 },
    #[error("arena of {size} bytes is smaller than the {min}-byte fixed layout")]
    TooSmall { size: usize, min: usize },
    #[error("slot index {index} out of range (max {max})")]
    SlotOutOfRange { index: usize, max: usize },
    #[error("tensor region full: requested {requested} bytes, {available} available")]
    TensorRegionFull { requested: u64, available: u64 },
    #[error("shared memory operation failed: {0}")]
    Os(#[from] Errno),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Memory-mapped shared arena: header, slot table, tensor region.
///
/// All slot mutations go through atomics bound directly onto the mapping,
/// so every write is immediately visible to other processes mapping the
/// same region; there is no flush step. The mapping lives until `Drop`.
#[derive(Debug)]
pub struct Arena {
    map: NonNull<c_void>,
    len: usize,
}

unsafe impl Send for Arena {}
unsafe impl Sync for Arena {}

impl Arena {
    /// Map the named region, creating and initializing it if absent.
    ///
    /// Reopening an initialized region leaves its header untouched and
    /// only validates magic and version.
    pub fn open_or_create(name: &str, size: usize) -> Result<Self, ArenaError> {
        let mode = Mode::from_bits_truncate(0o600);
        let (file, created) = match shm_open(name, OFlag::O_CREAT | OFlag::O_EXCL | OFlag::O_RDWR, mode) {
            Ok(fd) => (File::from(fd), true),
            Err(Errno::EEXIST) => (File::from(shm_open(name, OFlag::O_RDWR, Mode::empty())?), false),
            Err(errno) => return Err(errno.into()),
        };

        if created {
            file.set_len(size as u64)?;
        }
        let len = file.metadata()?.len() as usize;

        let arena = Self::map_region(&file, len)?;
        if created {
            arena.initialize(len);
            info!(name, size = len, "created shared memory arena");
        }
        arena.validate()?;
        Ok(arena)
    }

    /// Map an existing named region; never creates.
    pub fn open(name: &str) -> Result<Self, ArenaError> {
        let file = File::from(shm_open(name, OFlag::O_RDWR, Mode::empty())?);
        let len = file.metadata()?.len() as usize;
        let arena = Self::map_region(&file, len)?;
        arena.validate()?;
        Ok(arena)
    }

    /// Remove the named region from the OS namespace. Existing mappings
    /// stay valid until unmapped.
    pub fn unlink(name: &str) -> Result<(), ArenaError> {
        Ok(shm_unlink(name)?)
    }

    fn map_region(file: &File, len: usize) -> Result<Self, ArenaError> {
        if len < TENSOR_REGION_OFFSET {
            return Err(ArenaError::TooSmall { size: len, min: TENSOR_REGION_OFFSET });
        }
        let length = NonZeroUsize::new(len)
            .ok_or(ArenaError::TooSmall { size: 0, min: TENSOR_REGION_OFFSET })?;
        let map = unsafe {
            mmap(
                None,
                length,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
                file,
                0,
            )?
        };

        Ok(Self { map, len })
    }

    /// Populate the header of a freshly created, zero-filled region.
    /// Magic is written last so a concurrent opener never sees a valid
    /// magic ahead of the other fields.
    fn initialize(&self, len: usize) {
        let header = unsafe { &mut *self.map.as_ptr().cast::<ArenaHeader>() };
        header.version = FORMAT_VERSION;
        header.num_slots = MAX_SLOTS as u32;
        header.arena_size = len as u64;
        header.arena_used = AtomicU64::new(0);
        header.lock = AtomicU32::new(0);
        header.magic = MAGIC;
    }

    fn validate(&self) -> Result<(), ArenaError> {
        let header = self.header();
        if header.magic != MAGIC {
            return Err(ArenaError::MagicMismatch { found: header.magic, expected: MAGIC });
        }
        if header.version != FORMAT_VERSION {
            return Err(ArenaError::VersionMismatch {
                found: header.version,
                expected: FORMAT_VERSION,
            });
        }
        Ok(())
    }

    pub fn header(&self) -> &ArenaHeader {
        unsafe { &*self.map.as_ptr().cast::<ArenaHeader>() }
    }

    pub fn slot(&self, index: usize) -> Result<&WorkerSlot, ArenaError> {
        let max = self.header().num_slots as usize;
        if index >= max {
            return Err(ArenaError::SlotOutOfRange { index, max });
        }
        let slots = unsafe {
            self.map.as_ptr().cast::<u8>().add(HEADER_BYTES).cast::<WorkerSlot>()
        };
        Ok(unsafe { &*slots.add(index) })
    }

    /// Claim a slot for this process and mark it BOOTING.
    pub fn register(&self, slot_index: usize) -> Result<(), ArenaError> {
        let slot = self.slot(slot_index)?;
        slot.pid.store(std::process::id() as i32, Ordering::Release);
        slot.current_job.store(0, Ordering::Release);
        slot.progress_bits.store(0f32.to_bits(), Ordering::Release);
        slot.last_heartbeat_ms.store(now_ms(), Ordering::Release);
        slot.status.store(WorkerStatus::Booting as u32, Ordering::Release);
        Ok(())
    }

    pub fn set_status(&self, slot_index: usize, status: WorkerStatus) -> Result<(), ArenaError> {
        self.slot(slot_index)?.status.store(status as u32, Ordering::Release);
        Ok(())
    }

    pub fn update_heartbeat(&self, slot_index: usize) -> Result<(), ArenaError> {
        self.slot(slot_index)?.last_heartbeat_ms.store(now_ms(), Ordering::Release);
        Ok(())
    }

    pub fn set_progress(&self, slot_index: usize, fraction: f32) -> Result<(), ArenaError> {
        let clamped = fraction.clamp(0.0, 1.0);
        self.slot(slot_index)?.progress_bits.store(clamped.to_bits(), Ordering::Release);
        Ok(())
    }

    pub fn set_current_job(&self, slot_index: usize, job: u64) -> Result<(), ArenaError> {
        self.slot(slot_index)?.current_job.store(job, Ordering::Release);
        Ok(())
    }

    /// Reserve `size_bytes` in the tensor region and return the absolute
    /// byte offset of the reservation.
    ///
    /// Advancing `arena_used` is the only arena-wide structural mutation
    /// and requires the header lock; slot fields never take it.
    pub fn alloc(&self, size_bytes: u64) -> Result<u64, ArenaError> {
        let header = self.header();
        while header
            .lock
            .compare_exchange(0, 1, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            std::hint::spin_loop();
        }

        let used = header.arena_used.load(Ordering::Relaxed);
        let capacity = header.arena_size - TENSOR_REGION_OFFSET as u64;
        let result = if size_bytes > capacity - used {
            Err(ArenaError::TensorRegionFull { requested: size_bytes, available: capacity - used })
        } else {
            header.arena_used.store(used + size_bytes, Ordering::Relaxed);
            Ok(TENSOR_REGION_OFFSET as u64 + used)
        };

        header.lock.store(0, Ordering::Release);
        result
    }

    /// Bytes currently allocated out of the tensor region.
    pub fn used(&self) -> u64 {
        self.header().arena_used.load(Ordering::Acquire)
    }

    pub fn size(&self) -> usize {
        self.len
    }
}

impl Drop for Arena {
    fn drop(&mut self) {
        let _ = unsafe { munmap(self.map, self.len) };
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn test_name(tag: &str) -> String {
        format!("/lattice-test-{}-{}", std::process::id(), tag)
    }

    fn test_size() -> usize {
        TENSOR_REGION_OFFSET + 1024 * 1024
    }

    #[test]
    fn create_initializes_header() {
        let name = test_name("create");
        let arena = Arena::open_or_create(&name, test_size()).unwrap();
        let header = arena.header();
        assert_eq!(header.magic, MAGIC);
        assert_eq!(header.version, FORMAT_VERSION);
        assert_eq!(header.num_slots, MAX_SLOTS as u32);
        assert_eq!(header.arena_size, test_size() as u64);
        assert_eq!(arena.used(), 0);

        let second = Arena::open(&name).unwrap();
        assert_eq!(second.header().magic, MAGIC);
        assert_eq!(second.header().arena_size, test_size() as u64);
        assert_eq!(second.size(), arena.size());

        Arena::unlink(&name).unwrap();
    }

    #[test]
    fn reopen_does_not_reinitialize() {
        let name = test_name("reopen");
        let arena = Arena::open_or_create(&name, test_size()).unwrap();
        arena.register(7).unwrap();
        arena.set_status(7, WorkerStatus::Busy).unwrap();
        arena.alloc(4096).unwrap();

        let again = Arena::open_or_create(&name, test_size()).unwrap();
        assert_eq!(again.used(), 4096);
        let slot = again.slot(7).unwrap();
        assert_eq!(slot.pid(), std::process::id() as i32);
        assert_eq!(slot.status(), WorkerStatus::Busy);

        Arena::unlink(&name).unwrap();
    }

    #[test]
    fn register_bounds() {
        let name = test_name("bounds");
        let arena = Arena::open_or_create(&name, test_size()).unwrap();
        assert!(matches!(
            arena.register(MAX_SLOTS),
            Err(ArenaError::SlotOutOfRange { index: 256, max: 256 })
        ));
        arena.register(MAX_SLOTS - 1).unwrap();
        assert_eq!(arena.slot(MAX_SLOTS - 1).unwrap().status(), WorkerStatus::Booting);

        Arena::unlink(&name).unwrap();
    }

    #[test]
    fn status_transitions_keep_slot_identity() {
        let name = test_name("identity");
        let arena = Arena::open_or_create(&name, test_size()).unwrap();
        arena.register(3).unwrap();
        arena.set_status(3, WorkerStatus::Busy).unwrap();
        arena.set_status(3, WorkerStatus::Idle).unwrap();

        let slot = arena.slot(3).unwrap();
        assert_eq!(slot.status(), WorkerStatus::Idle);
        assert_eq!(slot.pid(), std::process::id() as i32);

        Arena::unlink(&name).unwrap();
    }

    #[test]
    fn alloc_advances_watermark() {
        let name = test_name("alloc");
        let arena = Arena::open_or_create(&name, test_size()).unwrap();

        let first = arena.alloc(1024).unwrap();
        assert_eq!(first, TENSOR_REGION_OFFSET as u64);
        let second = arena.alloc(1024).unwrap();
        assert_eq!(second, TENSOR_REGION_OFFSET as u64 + 1024);
        assert_eq!(arena.used(), 2048);

        let err = arena.alloc(u64::MAX).unwrap_err();
        assert!(matches!(err, ArenaError::TensorRegionFull { .. }));
        assert_eq!(arena.used(), 2048);

        Arena::unlink(&name).unwrap();
    }

    #[test]
    fn progress_is_clamped() {
        let name = test_name("progress");
        let arena = Arena::open_or_create(&name, test_size()).unwrap();
        arena.register(0).unwrap();

        arena.set_progress(0, 5.0).unwrap();
        assert_eq!(arena.slot(0).unwrap().progress(), 1.0);
        arena.set_progress(0, -2.0).unwrap();
        assert_eq!(arena.slot(0).unwrap().progress(), 0.0);
        arena.set_progress(0, 0.25).unwrap();
        assert_eq!(arena.slot(0).unwrap().progress(), 0.25);

        Arena::unlink(&name).unwrap();
    }

    #[test]
    fn corrupt_magic_is_fatal() {
        let name = test_name("magic");
        let mode = Mode::from_bits_truncate(0o600);
        let fd = shm_open(name.as_str(), OFlag::O_CREAT | OFlag::O_EXCL | OFlag::O_RDWR, mode).unwrap();
        let mut file = File::from(fd);
        file.set_len(test_size() as u64).unwrap();
        file.write_all(b"notmagic").unwrap();

        let err = Arena::open_or_create(&name, test_size()).unwrap_err();
        assert!(matches!(err, ArenaError::MagicMismatch { .. }));

        Arena::unlink(&name).unwrap();
    }
}
