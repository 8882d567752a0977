//! OS mapping primitives used by the memory backends.
//!
//! - [`ShmObject`]: a named POSIX shared-memory object (`shm_open`).
//! - [`MappedRegion`]: a read-write mapping, either of a window of a
//!   [`ShmObject`] or anonymous and process-private.
//! - [`page_size`]: the system page size, the granularity of mapping offsets.

use memmap2::{MmapMut, MmapOptions};
use std::{
    ffi::CString,
    fs::File,
    io,
    os::fd::{FromRawFd, OwnedFd},
    sync::OnceLock,
};

/// Returns the system page size in bytes.
pub fn page_size() -> usize {
    static PAGE_SIZE: OnceLock<usize> = OnceLock::new();
    *PAGE_SIZE.get_or_init(|| {
        // SAFETY: sysconf has no preconditions.
        let sz = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if sz <= 0 { 4096 } else { sz as usize }
    })
}

/// Normalizes a shared-memory object name to the `/name` form `shm_open` expects.
pub fn shm_name(url: &str) -> String {
    if url.starts_with('/') {
        url.to_string()
    } else {
        format!("/{url}")
    }
}

fn c_name(name: &str) -> io::Result<CString> {
    CString::new(name).map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))
}

/// A named POSIX shared-memory object.
///
/// Dropping the object closes the descriptor but leaves the name in place;
/// removing it is always explicit through [`ShmObject::unlink`].
pub struct ShmObject {
    file: File,
    name: String,
}

impl ShmObject {
    /// Create a fresh object at `url` sized to `size_bytes`, replacing any stale one.
    pub fn create(url: &str, size_bytes: u64) -> io::Result<Self> {
        let name = shm_name(url);
        let cname = c_name(&name)?;
        // A stale object from a crashed run is not an error.
        // SAFETY: cname is a valid null-terminated string.
        unsafe { libc::shm_unlink(cname.as_ptr()) };

        // SAFETY: cname is valid; flags and mode are valid POSIX constants.
        let fd = unsafe {
            libc::shm_open(
                cname.as_ptr(),
                libc::O_CREAT | libc::O_EXCL | libc::O_RDWR,
                0o666 as libc::mode_t,
            )
        };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: fd was just returned by shm_open and is owned by nobody else.
        let file = File::from(unsafe { OwnedFd::from_raw_fd(fd) });
        if let Err(e) = file.set_len(size_bytes) {
            // SAFETY: cname is still valid.
            unsafe { libc::shm_unlink(cname.as_ptr()) };
            return Err(e);
        }
        Ok(Self { file, name })
    }

    /// Open an existing object read-write.
    pub fn open(url: &str) -> io::Result<Self> {
        let name = shm_name(url);
        let cname = c_name(&name)?;
        // SAFETY: cname is valid; O_RDWR without O_CREAT only opens.
        let fd = unsafe { libc::shm_open(cname.as_ptr(), libc::O_RDWR, 0o666 as libc::mode_t) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: fd was just returned by shm_open.
        let file = File::from(unsafe { OwnedFd::from_raw_fd(fd) });
        Ok(Self { file, name })
    }

    /// Remove the object name. Existing mappings stay valid until unmapped.
    pub fn unlink(url: &str) -> io::Result<()> {
        let cname = c_name(&shm_name(url))?;
        // SAFETY: cname is a valid null-terminated string.
        if unsafe { libc::shm_unlink(cname.as_ptr()) } < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Size of the object in bytes.
    pub fn len(&self) -> io::Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Map `len` bytes starting at `offset` (must be page aligned) read-write and shared.
    pub fn map(&self, offset: u64, len: usize) -> io::Result<MappedRegion> {
        // SAFETY: the object stays open while mapped; other processes may write
        // concurrently, so callers only access the region through raw pointers
        // and atomics.
        let mmap = unsafe { MmapOptions::new().offset(offset).len(len).map_mut(&self.file)? };
        Ok(MappedRegion { mmap })
    }
}

/// A read-write memory mapping.
pub struct MappedRegion {
    mmap: MmapMut,
}

impl MappedRegion {
    /// Map `len` zeroed bytes that are private to this process.
    pub fn anonymous(len: usize) -> io::Result<Self> {
        let mmap = MmapOptions::new().len(len).map_anon()?;
        Ok(Self { mmap })
    }

    /// Return raw pointer to start of the mapping
    #[inline]
    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.mmap.as_mut_ptr()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.mmap.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.mmap.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_url(tag: &str) -> String {
        format!("/tessera_mmap_{tag}_{}", std::process::id())
    }

    #[test]
    fn page_size_is_power_of_two() {
        assert!(page_size().is_power_of_two());
    }

    #[test]
    fn shm_name_adds_leading_slash() {
        assert_eq!(shm_name("bus"), "/bus");
        assert_eq!(shm_name("/bus"), "/bus");
    }

    /// Two mappings of the same object observe each other's writes.
    #[test]
    fn shm_object_is_shared_between_mappings() {
        let url = test_url("shared");
        let page = page_size();
        let obj = ShmObject::create(&url, (page * 2) as u64).expect("create");
        assert_eq!(obj.len().expect("len"), (page * 2) as u64);

        let mut a = obj.map(page as u64, page).expect("map a");
        let reopened = ShmObject::open(&url).expect("open");
        let mut b = reopened.map(page as u64, page).expect("map b");

        unsafe { a.as_mut_ptr().write(0xAB) };
        assert_eq!(unsafe { b.as_mut_ptr().read() }, 0xAB);

        ShmObject::unlink(&url).expect("unlink");
        assert!(ShmObject::open(&url).is_err());
    }

    #[test]
    fn anonymous_region_is_zeroed() {
        let mut region = MappedRegion::anonymous(4096).expect("anon");
        assert_eq!(region.len(), 4096);
        let first = unsafe { region.as_mut_ptr().read() };
        assert_eq!(first, 0);
    }
}
