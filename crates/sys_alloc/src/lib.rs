//! Anonymous, optionally over-aligned memory reservations.
//!
//! The nursery reserves its whole chunk arena once at startup. Chunks must be
//! aligned to their own size so that the chunk owning any interior address can
//! be found by masking, which is stricter than what `mmap`/`VirtualAlloc`
//! guarantee on their own.

use std::io;

#[cfg(unix)]
mod unix;
#[cfg(unix)]
use unix as os;

#[cfg(windows)]
mod windows;
#[cfg(windows)]
use windows as os;

pub use os::page_size;

/// Returns the system allocation granularity.
///
/// On Windows, this is typically 64KB. On Unix, this is the page size.
pub fn allocation_granularity() -> usize {
    #[cfg(windows)]
    {
        os::allocation_granularity()
    }
    #[cfg(unix)]
    {
        os::page_size()
    }
}

/// A committed, readable and writable anonymous mapping.
///
/// The region is released when this handle is dropped.
pub struct Mmap {
    inner: os::MmapInner,
}

impl Mmap {
    /// Returns a pointer to the start of the mapping.
    pub fn ptr(&self) -> *mut u8 {
        self.inner.ptr()
    }

    /// Returns the length of the mapping in bytes.
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Returns `true` if the mapping is empty. Mappings are never empty.
    pub fn is_empty(&self) -> bool {
        self.inner.len() == 0
    }

    /// Returns `true` if `addr` lies inside the mapping.
    pub fn contains(&self, addr: usize) -> bool {
        let start = self.ptr() as usize;
        addr >= start && addr < start + self.len()
    }
}

unsafe impl Send for Mmap {}
unsafe impl Sync for Mmap {}

/// Configuration for creating a memory mapping.
#[derive(Debug, Clone)]
pub struct MmapOptions {
    len: usize,
    align: usize,
    populate: bool,
}

impl MmapOptions {
    /// Creates a new `MmapOptions` with length 0 and page alignment.
    /// You must set a length before mapping.
    pub fn new() -> Self {
        Self {
            len: 0,
            align: 0,
            populate: false,
        }
    }

    /// Sets the length of the mapping in bytes.
    pub fn len(mut self, len: usize) -> Self {
        self.len = len;
        self
    }

    /// Requires the start of the mapping to be a multiple of `align`.
    ///
    /// `align` must be a power of two. Values at or below the allocation
    /// granularity are satisfied by the OS directly; larger values are met by
    /// over-reserving and trimming.
    pub fn align(mut self, align: usize) -> Self {
        self.align = align;
        self
    }

    /// Sets whether to pre-populate (prefault) the page tables.
    ///
    /// On Linux, this adds `MAP_POPULATE`.
    pub fn populate(mut self, populate: bool) -> Self {
        self.populate = populate;
        self
    }

    /// Creates an anonymous memory map.
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` for a zero length or a non power of two
    /// alignment, and the OS error if the reservation fails.
    ///
    /// # Safety
    ///
    /// The returned pointer is valid only while the `Mmap` is alive; callers
    /// handing out raw addresses into it must not let them outlive it.
    pub unsafe fn map_anon(&self) -> io::Result<Mmap> {
        if self.len == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "length must be greater than 0",
            ));
        }
        if self.align != 0 && !self.align.is_power_of_two() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "alignment must be a power of two",
            ));
        }

        let align = self.align.max(allocation_granularity());
        let inner = unsafe { os::MmapInner::map_aligned(self.len, align, self.populate)? };
        debug_assert_eq!(inner.ptr() as usize % align, 0);

        Ok(Mmap { inner })
    }
}

impl Default for MmapOptions {
    fn default() -> Self {
        Self::new()
    }
}
