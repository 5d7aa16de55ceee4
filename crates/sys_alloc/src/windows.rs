use std::io::{self, Error};
use std::mem;
use std::ptr;

#[cfg(not(miri))]
use windows_sys::Win32::System::Memory::{
    VirtualAlloc, VirtualFree, MEM_COMMIT, MEM_RELEASE, MEM_RESERVE, PAGE_READWRITE,
};
#[cfg(not(miri))]
use windows_sys::Win32::System::SystemInformation::{GetSystemInfo, SYSTEM_INFO};

/// Returns the system allocation granularity.
///
/// On Windows, `VirtualAlloc` address must be aligned to this value (typically 64KB),
/// which is often larger than the page size (typically 4KB).
pub fn allocation_granularity() -> usize {
    #[cfg(miri)]
    {
        65536
    }
    #[cfg(not(miri))]
    unsafe {
        let mut info: SYSTEM_INFO = mem::zeroed();
        GetSystemInfo(&mut info);
        match info.dwAllocationGranularity as usize {
            0 => 65536,
            gran => gran,
        }
    }
}

pub fn page_size() -> usize {
    #[cfg(miri)]
    {
        4096
    }
    #[cfg(not(miri))]
    unsafe {
        let mut info: SYSTEM_INFO = mem::zeroed();
        GetSystemInfo(&mut info);
        match info.dwPageSize as usize {
            0 => 4096,
            size => size,
        }
    }
}

pub struct MmapInner {
    ptr: *mut std::ffi::c_void,
    len: usize,
    #[cfg(miri)]
    align: usize,
}

/// Attempts before giving up on racing other threads for an aligned window.
#[cfg(not(miri))]
const ALIGNED_RESERVE_ATTEMPTS: usize = 8;

impl MmapInner {
    /// Maps `len` bytes whose start is a multiple of `align`.
    ///
    /// `VirtualFree` cannot release part of a reservation, so over-aligned
    /// requests probe with a padded reservation, release it, and then ask for
    /// the aligned address inside it.
    pub unsafe fn map_aligned(len: usize, align: usize, _populate: bool) -> io::Result<Self> {
        #[cfg(miri)]
        {
            use std::alloc::{alloc_zeroed, Layout};
            let layout = Layout::from_size_align(len, align)
                .map_err(|_| Error::from(io::ErrorKind::InvalidInput))?;
            let ptr = unsafe { alloc_zeroed(layout) };
            if ptr.is_null() {
                return Err(Error::from(io::ErrorKind::OutOfMemory));
            }
            Ok(Self {
                ptr: ptr.cast::<std::ffi::c_void>(),
                len,
                align,
            })
        }
        #[cfg(not(miri))]
        {
            let flags = MEM_COMMIT | MEM_RESERVE;
            if align <= allocation_granularity() {
                let ptr = unsafe { VirtualAlloc(ptr::null(), len, flags, PAGE_READWRITE) };
                if ptr.is_null() {
                    return Err(Error::last_os_error());
                }
                return Ok(Self { ptr, len });
            }

            let padded = len
                .checked_add(align)
                .ok_or_else(|| Error::from(io::ErrorKind::InvalidInput))?;
            for _ in 0..ALIGNED_RESERVE_ATTEMPTS {
                let probe = unsafe { VirtualAlloc(ptr::null(), padded, MEM_RESERVE, PAGE_READWRITE) };
                if probe.is_null() {
                    return Err(Error::last_os_error());
                }
                let start = (probe as usize + align - 1) & !(align - 1);
                unsafe { VirtualFree(probe, 0, MEM_RELEASE) };

                let ptr = unsafe {
                    VirtualAlloc(start as *const std::ffi::c_void, len, flags, PAGE_READWRITE)
                };
                if !ptr.is_null() {
                    return Ok(Self { ptr, len });
                }
            }
            Err(Error::from(io::ErrorKind::AddrInUse))
        }
    }

    pub const fn ptr(&self) -> *mut u8 {
        self.ptr.cast::<u8>()
    }

    pub const fn len(&self) -> usize {
        self.len
    }
}

impl Drop for MmapInner {
    fn drop(&mut self) {
        if self.len > 0 {
            unsafe {
                #[cfg(miri)]
                {
                    use std::alloc::{dealloc, Layout};
                    let layout = Layout::from_size_align_unchecked(self.len, self.align);
                    dealloc(self.ptr.cast::<u8>(), layout);
                }
                #[cfg(not(miri))]
                {
                    // MEM_RELEASE requires dwSize to be 0
                    VirtualFree(self.ptr, 0, MEM_RELEASE);
                }
            }
        }
    }
}

unsafe impl Send for MmapInner {}
unsafe impl Sync for MmapInner {}
