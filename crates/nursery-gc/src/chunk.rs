//! The chunk arena backing the nursery.
//!
//! The whole arena is reserved and committed once. Chunks are aligned to
//! their own size, so the trailer of the chunk containing any nursery
//! address is found by masking, the same way a page header is found from an
//! object pointer.

use std::io;
use std::mem;

use sys_alloc::{Mmap, MmapOptions};

/// log2 of the chunk size.
pub const CHUNK_SHIFT: usize = 20;

/// Size of each chunk (1 MiB, chunk aligned).
pub const CHUNK_SIZE: usize = 1 << CHUNK_SHIFT;

/// Mask for extracting the chunk base from an address.
pub const CHUNK_MASK: usize = !(CHUNK_SIZE - 1);

/// Bytes per chunk available to the bump allocator.
pub const CHUNK_USABLE: usize = CHUNK_SIZE - mem::size_of::<ChunkTrailer>();

/// Location tag stored in nursery chunk trailers.
pub const LOCATION_NURSERY: u32 = 0x4e55_5253; // "NURS"

/// Metadata stored in the last bytes of every chunk.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkTrailer {
    /// Identity of the runtime that owns the chunk. Written once.
    pub runtime_id: u64,
    /// Which space the chunk belongs to.
    pub location: u32,
    /// Index of the chunk within its arena.
    pub index: u32,
}

/// A contiguous, chunk-aligned reservation of `count` chunks.
pub struct ChunkArena {
    map: Mmap,
    count: usize,
}

impl ChunkArena {
    /// Reserve and commit `count` chunks owned by `runtime_id`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` for a zero count and the OS error if the
    /// address space cannot be reserved.
    pub fn reserve(count: usize, runtime_id: u64) -> io::Result<Self> {
        if count == 0 || u32::try_from(count).is_err() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "chunk count must be between 1 and u32::MAX",
            ));
        }
        let len = count
            .checked_mul(CHUNK_SIZE)
            .ok_or_else(|| io::Error::from(io::ErrorKind::InvalidInput))?;

        // SAFETY: The mapping is owned by the arena and outlives every
        // address handed out from it.
        let map = unsafe { MmapOptions::new().len(len).align(CHUNK_SIZE).map_anon()? };

        let arena = Self { map, count };
        for index in 0..count {
            let trailer = ChunkTrailer {
                runtime_id,
                location: LOCATION_NURSERY,
                #[allow(clippy::cast_possible_truncation)]
                index: index as u32,
            };
            // SAFETY: The trailer slot lies inside the committed mapping and
            // the chunk base is aligned, so the trailer is suitably aligned.
            #[allow(clippy::cast_ptr_alignment)]
            unsafe {
                (arena.chunk_end(index) as *mut ChunkTrailer).write(trailer);
            }
        }
        Ok(arena)
    }

    /// Number of committed chunks.
    #[must_use]
    pub const fn count(&self) -> usize {
        self.count
    }

    /// First address of the arena.
    #[must_use]
    pub fn start(&self) -> usize {
        self.map.ptr() as usize
    }

    /// One past the last address of the arena.
    #[must_use]
    pub fn end(&self) -> usize {
        self.start() + self.map.len()
    }

    /// Returns `true` if `addr` lies anywhere in the committed arena.
    #[must_use]
    #[inline]
    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.start() && addr < self.end()
    }

    /// First allocatable address of chunk `index`.
    #[must_use]
    #[inline]
    pub fn chunk_start(&self, index: usize) -> usize {
        debug_assert!(index < self.count);
        self.start() + (index << CHUNK_SHIFT)
    }

    /// One past the last allocatable address of chunk `index`; the trailer
    /// starts here.
    #[must_use]
    #[inline]
    pub fn chunk_end(&self, index: usize) -> usize {
        self.chunk_start(index) + CHUNK_USABLE
    }

    /// Index of the chunk containing `addr`.
    #[must_use]
    pub fn chunk_index(&self, addr: usize) -> Option<usize> {
        self.contains(addr).then(|| (addr - self.start()) >> CHUNK_SHIFT)
    }
}

/// Read the trailer of the chunk containing `addr`.
///
/// # Safety
///
/// `addr` must lie inside a live [`ChunkArena`].
#[must_use]
pub unsafe fn chunk_trailer(addr: usize) -> ChunkTrailer {
    let trailer = ((addr & CHUNK_MASK) + CHUNK_USABLE) as *const ChunkTrailer;
    // SAFETY: Caller guarantees the chunk is live; every chunk has a trailer.
    unsafe { trailer.read() }
}

/// Identity of the runtime owning the chunk that contains `addr`.
///
/// # Safety
///
/// `addr` must lie inside a live [`ChunkArena`].
#[must_use]
pub unsafe fn chunk_owner(addr: usize) -> u64 {
    unsafe { chunk_trailer(addr) }.runtime_id
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_chunks_rejected() {
        let err = ChunkArena::reserve(0, 1).err().unwrap();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[test]
    fn test_arena_is_chunk_aligned() {
        let arena = ChunkArena::reserve(3, 7).unwrap();
        assert_eq!(arena.start() & !CHUNK_MASK, 0);
        assert_eq!(arena.end() - arena.start(), 3 * CHUNK_SIZE);
        assert_eq!(arena.chunk_start(2), arena.start() + 2 * CHUNK_SIZE);
    }

    #[test]
    fn test_trailer_written_once_per_chunk() {
        let arena = ChunkArena::reserve(4, 42).unwrap();
        for index in 0..4 {
            let interior = arena.chunk_start(index) + 1234;
            let trailer = unsafe { chunk_trailer(interior) };
            assert_eq!(trailer.runtime_id, 42);
            assert_eq!(unsafe { chunk_owner(interior) }, 42);
            assert_eq!(trailer.location, LOCATION_NURSERY);
            assert_eq!(trailer.index as usize, index);
            assert_eq!(arena.chunk_index(interior), Some(index));
        }
        assert_eq!(arena.chunk_index(arena.end()), None);
    }
}
