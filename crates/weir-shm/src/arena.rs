//! Named shared-memory arenas with a portable-handle object directory.
//!
//! An arena is a named, growable POSIX shared-memory segment. Offset 0 holds
//! a `repr(C)` header: magic and layout version, an init futex the creator
//! releases once the header is written, the published segment size, a
//! bump-allocation cursor, a process attach count, and a fixed table of named
//! objects guarded by a futex [`Mutex`].
//!
//! Cross-process references never use raw addresses. An object is referred to
//! by [`Handle`], a byte offset from the segment base, and every process
//! converts handles to addresses against its own mapping.
//!
//! # Layout
//!
//! ```text
//! +--------------------------------------------------------------+
//! | ArenaHeader (64 bytes)                                       |
//! |   magic "WEIRSHM\0", layout version, init futex              |
//! |   current_size, alloc cursor, attach count, directory lock   |
//! +--------------------------------------------------------------+
//! | Directory (MAX_NAMED_OBJECTS entries, 64 bytes each)         |
//! |   name, offset, length -- immutable once published           |
//! +--------------------------------------------------------------+
//! | Bump-allocated objects (named slots, pixel buffers, ...)     |
//! +--------------------------------------------------------------+
//! ```

use std::ffi::CString;
use std::mem::{align_of, offset_of, size_of};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crate::error::ArenaError;
use crate::futex;
use crate::map::{self, Mapping, PAGE_SIZE, page_align_up};
use crate::sync::Mutex;

/// Magic bytes identifying a weir arena segment.
pub const ARENA_MAGIC: [u8; 8] = *b"WEIRSHM\0";

/// Bumped whenever the header or directory layout changes.
pub const ARENA_LAYOUT_VERSION: u32 = 1;

/// Fixed virtual reservation per mapping; also the growth ceiling.
pub const ARENA_RESERVE: usize = 1 << 30;

/// Smallest segment we ever create. Enough for the header, the directory
/// and a synchronization node.
pub const MIN_ARENA_SIZE: usize = PAGE_SIZE;

/// Capacity of the named-object directory.
pub const MAX_NAMED_OBJECTS: usize = 8;

/// Longest accepted object name, in bytes.
pub const MAX_OBJECT_NAME: usize = 40;

const INIT_WAIT: Duration = Duration::from_secs(5);

/// An opaque offset-based reference to bytes in an arena.
///
/// Valid in any process that has mapped the same named segment; raw
/// addresses are not.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct Handle(u64);

impl Handle {
    /// Offset 0 is the header, never an object.
    pub const NULL: Handle = Handle(0);

    pub fn from_offset(offset: u64) -> Self {
        Handle(offset)
    }

    pub fn offset(self) -> u64 {
        self.0
    }

    pub fn is_null(self) -> bool {
        self.0 == 0
    }
}

/// One directory entry (64 bytes). Written under the directory lock,
/// immutable once `dir_len` is advanced past it.
#[repr(C)]
struct DirEntry {
    name: [u8; MAX_OBJECT_NAME],
    name_len: u8,
    _pad: [u8; 7],
    offset: u64,
    len: u64,
}

const _: () = assert!(size_of::<DirEntry>() == 64);

/// Arena header at offset 0 (64 bytes + directory).
#[repr(C)]
struct ArenaHeader {
    magic: [u8; 8],
    layout_version: u32,
    /// Futex word: 0 while the creator is initializing, 1 once ready.
    init_done: AtomicU32,
    /// Published segment size; grows monotonically.
    current_size: AtomicU64,
    /// Bump cursor for [`Arena::allocate`].
    alloc_cursor: AtomicU64,
    /// Processes currently attached; last detach unlinks the segment.
    attach_count: AtomicU32,
    /// Entries in use; advanced (release) after an entry is fully written.
    dir_len: AtomicU32,
    /// Guards directory writes and file growth.
    meta_lock: Mutex,
    _pad: [u8; 20],
    entries: [DirEntry; MAX_NAMED_OBJECTS],
}

const HEADER_SIZE: usize = size_of::<ArenaHeader>();
const ENTRIES_OFFSET: usize = offset_of!(ArenaHeader, entries);
const _: () = assert!(HEADER_SIZE == 64 + MAX_NAMED_OBJECTS * 64);
const _: () = assert!(ENTRIES_OFFSET == 64);

impl ArenaHeader {
    fn validate(&self) -> Result<(), ArenaError> {
        if self.magic != ARENA_MAGIC {
            return Err(ArenaError::BadLayout("bad magic"));
        }
        if self.layout_version != ARENA_LAYOUT_VERSION {
            return Err(ArenaError::BadLayout("layout version mismatch"));
        }
        Ok(())
    }
}

/// A named, process-shared memory arena.
///
/// Every participant holds its own `Arena` value (its own mapping of the
/// segment). Dropping the value detaches; the last detach unlinks the
/// segment from the namespace.
#[derive(Debug)]
pub struct Arena {
    map: Mapping,
    name: String,
}

// SAFETY: all shared state inside the mapping is driven through atomics and
// the futex primitives; the Mapping itself is Send + Sync.
unsafe impl Send for Arena {}
unsafe impl Sync for Arena {}

impl Arena {
    /// Open the named arena, creating it at `size` bytes (at least
    /// [`MIN_ARENA_SIZE`]) if it does not exist. Idempotent: any number of
    /// processes may race this; exactly one initializes the header and the
    /// rest block until it is ready. An existing arena smaller than `size`
    /// is grown, never shrunk.
    pub fn open_or_create(name: &str, size: usize) -> Result<Self, ArenaError> {
        let shm_name = shm_object_name(name)?;
        let size = page_align_up(size.max(MIN_ARENA_SIZE));
        if size > ARENA_RESERVE {
            return Err(ArenaError::TooLarge {
                requested: size,
                max: ARENA_RESERVE,
            });
        }

        if let Some(map) = Mapping::create_excl(&shm_name, ARENA_RESERVE)? {
            if let Err(e) = map.grow_file(size) {
                // Nobody can ever attach to a never-initialized segment;
                // take the name back out of the namespace.
                let _ = map::unlink(&shm_name);
                return Err(e);
            }
            init_header(&map, size);
            tracing::debug!(arena = name, size, "created shared arena");
            return Ok(Arena {
                map,
                name: name.to_owned(),
            });
        }

        let arena = Self::attach(Mapping::open(&shm_name, ARENA_RESERVE)?, name)?;
        if size as u64 > arena.header().current_size.load(Ordering::Acquire) {
            arena.grow_to(size)?;
        }
        Ok(arena)
    }

    /// Open the named arena, failing with [`ArenaError::NotFound`] if it
    /// does not exist.
    pub fn open_existing(name: &str) -> Result<Self, ArenaError> {
        let shm_name = shm_object_name(name)?;
        Self::attach(Mapping::open(&shm_name, ARENA_RESERVE)?, name)
    }

    /// Unlink the named segment regardless of attach count. Operator remedy
    /// for segments leaked by crashed processes; running participants keep
    /// their mappings. Returns whether the name existed.
    pub fn purge(name: &str) -> Result<bool, ArenaError> {
        let shm_name = shm_object_name(name)?;
        let existed = map::unlink(&shm_name)?;
        if existed {
            tracing::debug!(arena = name, "purged shared arena");
        }
        Ok(existed)
    }

    /// Join an existing segment. The `Arena` value is only constructed
    /// once the header is validated and our attach is counted, so its drop
    /// path is always in balance.
    fn attach(map: Mapping, name: &str) -> Result<Self, ArenaError> {
        // The creator may still be between shm_open and ftruncate.
        map.await_file_len(MIN_ARENA_SIZE, INIT_WAIT)?;

        // SAFETY: the first page is mapped and holds the header; mutable
        // fields are atomics.
        let header = unsafe { &*(map.base() as *const ArenaHeader) };
        let deadline = Instant::now() + INIT_WAIT;
        while header.init_done.load(Ordering::Acquire) == 0 {
            if Instant::now() >= deadline {
                return Err(ArenaError::InitTimeout {
                    name: name.to_owned(),
                });
            }
            futex::wait(&header.init_done, 0, Some(Duration::from_millis(50)));
        }
        header.validate()?;
        header.attach_count.fetch_add(1, Ordering::AcqRel);
        // Catch up with any growth published before we attached.
        let size = header.current_size.load(Ordering::Acquire) as usize;

        let arena = Arena {
            map,
            name: name.to_owned(),
        };
        arena.map.ensure(size)?;
        tracing::debug!(arena = name, size, "attached to shared arena");
        Ok(arena)
    }

    #[inline]
    fn header(&self) -> &ArenaHeader {
        // SAFETY: offset 0 of an attached arena always holds an initialized
        // header; all mutable fields are atomics or futex primitives.
        unsafe { &*(self.map.base() as *const ArenaHeader) }
    }

    #[inline]
    fn entry_ptr(&self, index: usize) -> *mut DirEntry {
        debug_assert!(index < MAX_NAMED_OBJECTS);
        // SAFETY: the directory lies inside the always-mapped first page.
        unsafe { (self.map.base().add(ENTRIES_OFFSET) as *mut DirEntry).add(index) }
    }

    /// The arena's name (without the shm namespace prefix).
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Published capacity in bytes.
    pub fn capacity(&self) -> u64 {
        self.header().current_size.load(Ordering::Acquire)
    }

    /// Grow the segment so its capacity is at least `size` bytes.
    pub fn grow_to(&self, size: usize) -> Result<(), ArenaError> {
        let size = page_align_up(size);
        if size > ARENA_RESERVE {
            return Err(ArenaError::TooLarge {
                requested: size,
                max: ARENA_RESERVE,
            });
        }
        let header = self.header();
        if (size as u64) > header.current_size.load(Ordering::Acquire) {
            header.meta_lock.lock();
            let cur = header.current_size.load(Ordering::Acquire) as usize;
            if size > cur {
                if let Err(e) = self.map.grow_file(size) {
                    header.meta_lock.unlock();
                    return Err(e);
                }
                header.current_size.store(size as u64, Ordering::Release);
                tracing::debug!(arena = %self.name, from = cur, to = size, "grew shared arena");
            }
            header.meta_lock.unlock();
        }
        let published = self.header().current_size.load(Ordering::Acquire) as usize;
        self.map.ensure(published)
    }

    /// Allocate `len` bytes at `align` and return a portable handle.
    pub fn allocate(&self, len: usize, align: usize) -> Result<Handle, ArenaError> {
        assert!(align.is_power_of_two() && align <= PAGE_SIZE);
        let header = self.header();
        let capacity = header.current_size.load(Ordering::Acquire);
        loop {
            let cur = header.alloc_cursor.load(Ordering::Relaxed);
            let start = (cur + align as u64 - 1) & !(align as u64 - 1);
            let end = start + len as u64;
            if end > capacity {
                return Err(ArenaError::OutOfSpace {
                    requested: len,
                    capacity,
                });
            }
            if header
                .alloc_cursor
                .compare_exchange(cur, end, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                return Ok(Handle(start));
            }
        }
    }

    /// Allocate and in-place initialize a named object, registering it in
    /// the directory. `init` runs under the directory lock, so a concurrent
    /// [`find`](Self::find) can never observe a half-initialized object.
    pub fn construct(
        &self,
        object: &str,
        len: usize,
        align: usize,
        init: impl FnOnce(*mut u8),
    ) -> Result<Handle, ArenaError> {
        validate_object_name(object)?;
        let header = self.header();
        header.meta_lock.lock();

        let result = (|| {
            if self.lookup(object).is_some() {
                return Err(ArenaError::NameCollision {
                    name: object.to_owned(),
                });
            }
            let index = header.dir_len.load(Ordering::Relaxed) as usize;
            if index >= MAX_NAMED_OBJECTS {
                return Err(ArenaError::DirectoryFull {
                    cap: MAX_NAMED_OBJECTS,
                });
            }
            let handle = self.allocate(len, align)?;
            init(self.to_address(handle)?);

            // SAFETY: index < MAX_NAMED_OBJECTS and the directory lock is
            // held; the entry becomes visible only via the dir_len release
            // below.
            let entry = unsafe { &mut *self.entry_ptr(index) };
            entry.name = [0; MAX_OBJECT_NAME];
            entry.name[..object.len()].copy_from_slice(object.as_bytes());
            entry.name_len = object.len() as u8;
            entry.offset = handle.offset();
            entry.len = len as u64;
            header.dir_len.store(index as u32 + 1, Ordering::Release);
            Ok(handle)
        })();

        header.meta_lock.unlock();
        result
    }

    /// Look up a named object. Lock-free: published entries are immutable.
    pub fn find(&self, object: &str) -> Option<Handle> {
        self.lookup(object)
    }

    fn lookup(&self, object: &str) -> Option<Handle> {
        let n = self.header().dir_len.load(Ordering::Acquire) as usize;
        for i in 0..n {
            // SAFETY: entries below dir_len are fully written and never
            // mutated again.
            let entry = unsafe { &*self.entry_ptr(i) };
            if &entry.name[..entry.name_len as usize] == object.as_bytes() {
                return Some(Handle(entry.offset));
            }
        }
        None
    }

    /// Convert a handle to an address in this process. Maps any pages
    /// published by other participants since we attached.
    pub fn to_address(&self, handle: Handle) -> Result<*mut u8, ArenaError> {
        let size = self.header().current_size.load(Ordering::Acquire);
        if handle.is_null() || handle.offset() >= size {
            return Err(ArenaError::BadHandle {
                offset: handle.offset(),
            });
        }
        self.map.ensure(size as usize)?;
        Ok(self.address_unchecked(handle))
    }

    /// Convert a local address back to a portable handle.
    pub fn to_handle(&self, addr: *const u8) -> Handle {
        let offset = addr as u64 - self.map.base() as u64;
        debug_assert!(offset < self.header().current_size.load(Ordering::Acquire));
        Handle(offset)
    }

    #[inline]
    fn address_unchecked(&self, handle: Handle) -> *mut u8 {
        // SAFETY: offset checked (or freshly allocated) against the
        // published size, which our mapping covers.
        unsafe { self.map.base().add(handle.offset() as usize) }
    }

    /// Typed view of a named or allocated object.
    ///
    /// # Safety
    ///
    /// The handle must refer to a properly initialized `T` whose layout is
    /// identical in every process mapping this arena.
    pub unsafe fn typed<T>(&self, handle: Handle) -> Result<*mut T, ArenaError> {
        let addr = self.to_address(handle)?;
        debug_assert!((addr as usize).is_multiple_of(align_of::<T>()));
        Ok(addr as *mut T)
    }
}

impl Drop for Arena {
    fn drop(&mut self) {
        let remaining = self.header().attach_count.fetch_sub(1, Ordering::AcqRel) - 1;
        if remaining == 0 {
            // Last one out removes the name. A process crashing before this
            // point leaks the segment; see [`Arena::purge`].
            match map::unlink(self.map.shm_name()) {
                Ok(_) => tracing::debug!(arena = %self.name, "unlinked shared arena"),
                Err(e) => tracing::warn!(arena = %self.name, error = %e, "unlink failed"),
            }
        }
    }
}

/// Creator-side header initialization. Runs before the `Arena` value
/// exists; openers are parked on the init futex until the final store.
fn init_header(map: &Mapping, size: usize) {
    // SAFETY: we are the creator (O_EXCL winner) and nobody else gets past
    // the init futex until init_done is set below, so this is the only
    // reference to the header.
    let header = unsafe { &mut *(map.base() as *mut ArenaHeader) };
    header.magic = ARENA_MAGIC;
    header.layout_version = ARENA_LAYOUT_VERSION;
    header.current_size = AtomicU64::new(size as u64);
    header.alloc_cursor = AtomicU64::new(HEADER_SIZE as u64);
    header.attach_count = AtomicU32::new(1);
    header.dir_len = AtomicU32::new(0);
    header.meta_lock.init();
    // Directory entries start zeroed; fresh file pages already are.
    header.init_done = AtomicU32::new(1);
    futex::wake_all(&header.init_done);
}

fn shm_object_name(name: &str) -> Result<CString, ArenaError> {
    validate_arena_name(name)?;
    CString::new(format!("/{name}")).map_err(|_| ArenaError::InvalidName {
        name: name.to_owned(),
        reason: "interior NUL",
    })
}

fn validate_arena_name(name: &str) -> Result<(), ArenaError> {
    if name.is_empty() {
        return Err(ArenaError::InvalidName {
            name: name.to_owned(),
            reason: "empty",
        });
    }
    if name.len() > MAX_OBJECT_NAME {
        return Err(ArenaError::InvalidName {
            name: name.to_owned(),
            reason: "longer than MAX_OBJECT_NAME",
        });
    }
    if !name.bytes().all(|b| b.is_ascii_graphic() && b != b'/') {
        return Err(ArenaError::InvalidName {
            name: name.to_owned(),
            reason: "must be printable ASCII without '/'",
        });
    }
    Ok(())
}

fn validate_object_name(name: &str) -> Result<(), ArenaError> {
    if name.is_empty() || name.len() > MAX_OBJECT_NAME {
        return Err(ArenaError::InvalidName {
            name: name.to_owned(),
            reason: "object names must be 1..=MAX_OBJECT_NAME bytes",
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_size() {
        assert_eq!(size_of::<ArenaHeader>(), 576);
    }

    #[test]
    fn handle_null() {
        assert!(Handle::NULL.is_null());
        assert!(!Handle::from_offset(64).is_null());
    }

    #[test]
    fn name_validation() {
        assert!(validate_arena_name("cam_frames_sh_mem").is_ok());
        assert!(validate_arena_name("").is_err());
        assert!(validate_arena_name("a/b").is_err());
        assert!(validate_arena_name("spaced name").is_err());
        assert!(validate_arena_name(&"x".repeat(MAX_OBJECT_NAME + 1)).is_err());
    }
}
