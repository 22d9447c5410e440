//! POSIX shared-memory mappings with a stable base address.
//!
//! A [`Mapping`] reserves a fixed `PROT_NONE` virtual range up front and
//! installs file pages into it with `MAP_FIXED`. Growing the segment
//! therefore never moves the base, so raw addresses derived from arena
//! handles stay valid for the life of the mapping even when another process
//! extends the file underneath us.

use std::ffi::CString;
use std::io;
use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use crate::error::ArenaError;

/// Page size assumed for all layout math. `sysconf` agrees on every platform
/// this crate targets.
pub const PAGE_SIZE: usize = 4096;

pub fn page_align_up(len: usize) -> usize {
    (len + PAGE_SIZE - 1) & !(PAGE_SIZE - 1)
}

fn os_err(op: &'static str) -> ArenaError {
    ArenaError::Io {
        op,
        source: io::Error::last_os_error(),
    }
}

/// A mapped POSIX shared-memory object.
#[derive(Debug)]
pub struct Mapping {
    base: *mut u8,
    reserved: usize,
    /// Bytes of the reservation currently backed by file pages.
    mapped: AtomicUsize,
    fd: libc::c_int,
    shm_name: CString,
    /// Serializes page installs within this process.
    grow: StdMutex<()>,
}

// SAFETY: the mapping is plain memory; all structured access to it is
// synchronized by the arena and node protocols layered on top.
unsafe impl Send for Mapping {}
unsafe impl Sync for Mapping {}

impl Mapping {
    /// Try to create the named segment exclusively. Returns `Ok(None)` if it
    /// already exists; the caller then goes through [`Mapping::open`].
    ///
    /// The new segment has length zero; the creator must [`grow_file`] it
    /// before anything can be installed.
    pub fn create_excl(shm_name: &CString, reserved: usize) -> Result<Option<Self>, ArenaError> {
        // SAFETY: shm_name is a valid NUL-terminated string.
        let fd = unsafe {
            libc::shm_open(
                shm_name.as_ptr(),
                libc::O_RDWR | libc::O_CREAT | libc::O_EXCL,
                0o600 as libc::mode_t,
            )
        };
        if fd < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EEXIST) {
                return Ok(None);
            }
            return Err(ArenaError::Io {
                op: "shm_open",
                source: err,
            });
        }
        Self::from_fd(fd, shm_name.clone(), reserved).map(Some)
    }

    /// Open an existing named segment.
    pub fn open(shm_name: &CString, reserved: usize) -> Result<Self, ArenaError> {
        // SAFETY: shm_name is a valid NUL-terminated string.
        let fd = unsafe { libc::shm_open(shm_name.as_ptr(), libc::O_RDWR, 0) };
        if fd < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::ENOENT) {
                return Err(ArenaError::NotFound {
                    name: shm_name.to_string_lossy().into_owned(),
                });
            }
            return Err(ArenaError::Io {
                op: "shm_open",
                source: err,
            });
        }
        Self::from_fd(fd, shm_name.clone(), reserved)
    }

    fn from_fd(fd: libc::c_int, shm_name: CString, reserved: usize) -> Result<Self, ArenaError> {
        debug_assert!(reserved.is_multiple_of(PAGE_SIZE));

        // SAFETY: anonymous PROT_NONE reservation; never touched until file
        // pages are installed over it.
        let base = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                reserved,
                libc::PROT_NONE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            // SAFETY: fd is the one we just opened.
            unsafe { libc::close(fd) };
            return Err(os_err("mmap"));
        }

        Ok(Self {
            base: base as *mut u8,
            reserved,
            mapped: AtomicUsize::new(0),
            fd,
            shm_name,
            grow: StdMutex::new(()),
        })
    }

    #[inline]
    pub fn base(&self) -> *mut u8 {
        self.base
    }

    #[inline]
    pub fn mapped_len(&self) -> usize {
        self.mapped.load(Ordering::Acquire)
    }

    pub fn reserved_len(&self) -> usize {
        self.reserved
    }

    /// Extend the underlying file to `len` bytes and install the new pages.
    /// Cross-process ordering of concurrent growth is the arena's problem;
    /// this only serializes within the process.
    pub fn grow_file(&self, len: usize) -> Result<(), ArenaError> {
        let len = page_align_up(len);
        if len > self.reserved {
            return Err(ArenaError::TooLarge {
                requested: len,
                max: self.reserved,
            });
        }
        // SAFETY: fd is open for writing.
        if unsafe { libc::ftruncate(self.fd, len as libc::off_t) } != 0 {
            return Err(os_err("ftruncate"));
        }
        self.ensure(len)
    }

    /// Make sure at least `len` bytes of the file are installed locally.
    /// The file must already be that large (the grower publishes the new
    /// size only after its `ftruncate`).
    pub fn ensure(&self, len: usize) -> Result<(), ArenaError> {
        let len = page_align_up(len);
        if len <= self.mapped.load(Ordering::Acquire) {
            return Ok(());
        }
        let _guard = self.grow.lock().expect("mapping grow lock poisoned");
        let mapped = self.mapped.load(Ordering::Acquire);
        if len <= mapped {
            return Ok(());
        }
        if len > self.reserved {
            return Err(ArenaError::TooLarge {
                requested: len,
                max: self.reserved,
            });
        }
        if self.file_len()? < len {
            return Err(ArenaError::BadLayout("mapping ahead of file size"));
        }

        // SAFETY: [base+mapped, base+len) lies inside our own PROT_NONE
        // reservation, and MAP_FIXED replaces exactly that range with file
        // pages at the matching offset.
        let addr = unsafe {
            libc::mmap(
                self.base.add(mapped) as *mut libc::c_void,
                len - mapped,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED | libc::MAP_FIXED,
                self.fd,
                mapped as libc::off_t,
            )
        };
        if addr == libc::MAP_FAILED {
            return Err(os_err("mmap"));
        }
        self.mapped.store(len, Ordering::Release);
        Ok(())
    }

    pub fn file_len(&self) -> Result<usize, ArenaError> {
        // SAFETY: zeroed stat buffer is a valid out-parameter.
        let mut st: libc::stat = unsafe { std::mem::zeroed() };
        // SAFETY: fd is open; st points to a live buffer.
        if unsafe { libc::fstat(self.fd, &mut st) } != 0 {
            return Err(os_err("fstat"));
        }
        Ok(st.st_size as usize)
    }

    /// Spin (politely) until the creator has grown the file to at least
    /// `len` bytes, then install those pages.
    pub fn await_file_len(&self, len: usize, timeout: Duration) -> Result<(), ArenaError> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.file_len()? >= len {
                return self.ensure(len);
            }
            if Instant::now() >= deadline {
                return Err(ArenaError::InitTimeout {
                    name: self.shm_name.to_string_lossy().into_owned(),
                });
            }
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    pub fn shm_name(&self) -> &CString {
        &self.shm_name
    }
}

impl Drop for Mapping {
    fn drop(&mut self) {
        // SAFETY: base/reserved describe the reservation made in from_fd.
        unsafe {
            libc::munmap(self.base as *mut libc::c_void, self.reserved);
            libc::close(self.fd);
        }
    }
}

/// Remove a named segment from the namespace. Existing mappings stay valid.
/// Returns `Ok(false)` if the name did not exist.
pub fn unlink(shm_name: &CString) -> Result<bool, ArenaError> {
    // SAFETY: shm_name is a valid NUL-terminated string.
    if unsafe { libc::shm_unlink(shm_name.as_ptr()) } == 0 {
        return Ok(true);
    }
    let err = io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ENOENT) {
        return Ok(false);
    }
    Err(ArenaError::Io {
        op: "shm_unlink",
        source: err,
    })
}
