//! Owned shared-memory mappings.
//!
//! A [`MappedRegion`] is a scoped owner over one `mmap`'d range. It knows
//! nothing about rings, headers, or notification flags — those are layered
//! on top in [`crate::ring`] and [`crate::channel`]. Release happens on
//! every exit path, including unwind, because it lives in `Drop`.

use std::io;

/// An identifier for a shared-memory object, exchanged during the handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShmId(pub String);

impl ShmId {
    fn generate(role: &str) -> Self {
        // PID + a coarse counter is enough entropy for a same-host, same-boot
        // object name; uniqueness across reuse is not a goal here (the OS
        // namespace is cleaned up by `Drop` well before PIDs wrap).
        static COUNTER: std::sync::atomic::AtomicU64 = std::sync::atomic::AtomicU64::new(0);
        let n = COUNTER.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        Self(format!("/talon-{role}-{}-{n}", std::process::id()))
    }
}

/// A scoped owner over a single `mmap`'d shared-memory region.
pub struct MappedRegion {
    ptr: *mut u8,
    len: usize,
    id: ShmId,
    owns_object: bool,
    #[cfg(unix)]
    fd: std::os::unix::io::RawFd,
}

// Safety: all mutation inside the mapping goes through atomics or is
// externally synchronized by the ring/channel invariants built on top.
unsafe impl Send for MappedRegion {}
unsafe impl Sync for MappedRegion {}

impl MappedRegion {
    /// Create and map a new shared-memory object of `len` bytes, owned by
    /// this process (this side created it, so this side unlinks it on drop).
    #[cfg(unix)]
    pub fn create(role: &str, len: usize) -> io::Result<Self> {
        let id = ShmId::generate(role);
        let (ptr, fd) = Self::open_raw(&id, len, true)?;
        Ok(Self {
            ptr,
            len,
            id,
            owns_object: true,
            fd,
        })
    }

    /// Open a shared-memory object created by the peer.
    #[cfg(unix)]
    pub fn open(id: ShmId, len: usize) -> io::Result<Self> {
        let (ptr, fd) = Self::open_raw(&id, len, false)?;
        Ok(Self {
            ptr,
            len,
            id,
            owns_object: false,
            fd,
        })
    }

    #[cfg(unix)]
    fn open_raw(id: &ShmId, len: usize, create: bool) -> io::Result<(*mut u8, std::os::unix::io::RawFd)> {
        use std::ffi::CString;
        let c_name = CString::new(id.0.as_str())
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "shm name has interior NUL"))?;

        unsafe {
            let flags = if create {
                libc::O_CREAT | libc::O_RDWR | libc::O_EXCL
            } else {
                libc::O_RDWR
            };
            let fd = libc::shm_open(c_name.as_ptr(), flags, 0o600);
            if fd < 0 {
                return Err(io::Error::last_os_error());
            }
            if create && libc::ftruncate(fd, len as libc::off_t) < 0 {
                let err = io::Error::last_os_error();
                libc::close(fd);
                libc::shm_unlink(c_name.as_ptr());
                return Err(err);
            }
            let ptr = libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            );
            if ptr == libc::MAP_FAILED {
                let err = io::Error::last_os_error();
                libc::close(fd);
                if create {
                    libc::shm_unlink(c_name.as_ptr());
                }
                return Err(err);
            }
            Ok((ptr as *mut u8, fd))
        }
    }

    /// The identifier to hand to the peer so it can `open` this region.
    pub fn id(&self) -> &ShmId {
        &self.id
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr
    }

    /// A read-only view of the whole mapping.
    ///
    /// # Safety contract
    /// Bytes covered by an atomic cell elsewhere in this crate must not be
    /// read through this slice concurrently with a racing atomic write;
    /// callers only use this for the inert data region.
    pub fn view(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr, self.len) }
    }

    pub fn view_mut(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr, self.len) }
    }
}

#[cfg(unix)]
impl Drop for MappedRegion {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.ptr as *mut libc::c_void, self.len);
            libc::close(self.fd);
            if self.owns_object {
                if let Ok(c_name) = std::ffi::CString::new(self.id.0.as_str()) {
                    libc::shm_unlink(c_name.as_ptr());
                }
            }
        }
    }
}
