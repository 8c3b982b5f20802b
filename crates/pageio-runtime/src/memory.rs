//! Page-aligned anonymous memory
//!
//! Backs the in-memory image. The mapping is page-aligned so that every
//! `PAGE_SIZE` chunk of it can be published as a `Page`.

use std::ptr::NonNull;

use pageio_core::error::{IoError, Result};
use pageio_core::{kdebug, kwarn, PAGE_SIZE};

/// Anonymous private mapping, rounded up to whole pages.
pub struct AlignedBuf {
    base: NonNull<u8>,
    len: usize,
    mapped: usize,
    locked: bool,
}

// Safety: plain memory owned by this value
unsafe impl Send for AlignedBuf {}
unsafe impl Sync for AlignedBuf {}

impl AlignedBuf {
    /// Map `len` zeroed bytes. A zero length still maps one page.
    pub fn new(len: usize) -> Result<Self> {
        let mapped = len.max(1).div_ceil(PAGE_SIZE) * PAGE_SIZE;
        let base = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                mapped,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(IoError::Mmap(mapped));
        }
        let base = NonNull::new(base as *mut u8).ok_or(IoError::Mmap(mapped))?;
        kdebug!("mapped {} bytes at {:p}", mapped, base.as_ptr());
        Ok(AlignedBuf { base, len, mapped, locked: false })
    }

    /// Try to keep the mapping resident. Failure is logged, not fatal.
    pub fn pin(&mut self) -> bool {
        if self.locked {
            return true;
        }
        let ret = unsafe { libc::mlock(self.base.as_ptr() as *const libc::c_void, self.mapped) };
        if ret != 0 {
            kwarn!(
                "mlock of {} bytes failed: {}",
                self.mapped,
                std::io::Error::last_os_error()
            );
            return false;
        }
        self.locked = true;
        true
    }

    #[inline]
    pub fn as_ptr(&self) -> *const u8 {
        self.base.as_ptr()
    }

    #[inline]
    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.base.as_ptr()
    }

    /// Requested length (the mapping itself may be longer)
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Whole pages mapped
    #[inline]
    pub fn num_pages(&self) -> usize {
        self.mapped / PAGE_SIZE
    }

    /// Start of page `idx` of the mapping.
    pub fn page_ptr(&self, idx: usize) -> Option<NonNull<u8>> {
        if idx >= self.num_pages() {
            return None;
        }
        // Safety: in bounds of the mapping
        NonNull::new(unsafe { self.base.as_ptr().add(idx * PAGE_SIZE) })
    }

    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.base.as_ptr(), self.len) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.base.as_ptr(), self.len) }
    }
}

impl Drop for AlignedBuf {
    fn drop(&mut self) {
        unsafe {
            if self.locked {
                libc::munlock(self.base.as_ptr() as *const libc::c_void, self.mapped);
            }
            libc::munmap(self.base.as_ptr() as *mut libc::c_void, self.mapped);
        }
    }
}

impl std::fmt::Debug for AlignedBuf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AlignedBuf")
            .field("len", &self.len)
            .field("pages", &self.num_pages())
            .field("locked", &self.locked)
            .finish()
    }
}
