//! Tenured storage: `BiBOP` (Big Bag of Pages) size-class pages.
//!
//! Promoted cells are copied here. Memory is divided into 4KB pages and
//! every page holds blocks of a single size class, so the block size of any
//! tenured cell is found from its address by masking down to the page
//! header. Blocks larger than the biggest class get dedicated pages.
//!
//! The tenured generation is never collected by this crate; the heap only
//! grows and reports how close it is to its configured ceiling.

use std::alloc::{alloc, dealloc, Layout};
use std::collections::HashSet;
use std::ptr::NonNull;

// ============================================================================
// Constants
// ============================================================================

/// Size of each memory page (4KB aligned).
pub const PAGE_SIZE: usize = 4096;

/// Mask for extracting page address from a pointer.
pub const PAGE_MASK: usize = !(PAGE_SIZE - 1);

/// Magic number for validating tenured pages ("TEND" in ASCII).
pub const MAGIC_TENURED_PAGE: u32 = 0x5445_4e44;

/// Size classes for tenured blocks.
pub const SIZE_CLASSES: [usize; 8] = [16, 32, 64, 128, 256, 512, 1024, 2048];

/// Blocks larger than this get dedicated pages.
pub const MAX_SMALL_OBJECT_SIZE: usize = 2048;

const FLAG_LARGE: u8 = 0x01;

// ============================================================================
// SizeClass
// ============================================================================

/// A tenured allocation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizeClass {
    /// Index into [`SIZE_CLASSES`].
    Small(u8),
    /// Exact byte size of a block above [`MAX_SMALL_OBJECT_SIZE`].
    Large(usize),
}

impl SizeClass {
    /// Smallest class that holds `bytes`.
    #[must_use]
    pub const fn for_size(bytes: usize) -> Self {
        if bytes > MAX_SMALL_OBJECT_SIZE {
            return Self::Large(bytes);
        }
        let mut index = 0;
        while SIZE_CLASSES[index] < bytes {
            index += 1;
        }
        #[allow(clippy::cast_possible_truncation)]
        Self::Small(index as u8)
    }

    /// Usable bytes of a block of this class.
    #[must_use]
    pub const fn bytes(self) -> usize {
        match self {
            Self::Small(index) => SIZE_CLASSES[index as usize],
            Self::Large(bytes) => bytes,
        }
    }
}

// ============================================================================
// TenuredAllocator - the collector's view of the old generation
// ============================================================================

/// Allocation service the minor collector promotes into.
pub trait TenuredAllocator {
    /// Allocate an uninitialized, 16-byte aligned block of `class`.
    ///
    /// Returns `None` when memory is exhausted.
    fn allocate(&mut self, class: SizeClass) -> Option<NonNull<u8>>;

    /// Total bytes handed out so far.
    fn bytes_allocated(&self) -> usize;

    /// Returns `true` once usage has reached the configured ceiling.
    fn is_near_limit(&self) -> bool;
}

// ============================================================================
// PageHeader - Metadata at the start of each page
// ============================================================================

/// Metadata stored at the beginning of each page.
#[repr(C)]
pub struct PageHeader {
    /// Magic number to validate this is a tenured page.
    pub magic: u32,
    /// Size of each block in bytes.
    pub block_size: u32,
    /// Maximum number of blocks in this page.
    pub obj_count: u16,
    /// Bitflags (`is_large_object`).
    pub flags: u8,
    _padding: [u8; 5],
}

impl PageHeader {
    /// Calculate the header size, rounded up to block alignment.
    #[must_use]
    pub const fn header_size(block_size: usize) -> usize {
        let base = std::mem::size_of::<Self>();
        (base + block_size - 1) & !(block_size - 1)
    }

    /// Calculate maximum blocks per page for a given block size.
    #[must_use]
    pub const fn max_objects(block_size: usize) -> usize {
        (PAGE_SIZE - Self::header_size(block_size)) / block_size
    }

    /// Returns `true` for a dedicated large-object page.
    #[must_use]
    pub const fn is_large(&self) -> bool {
        self.flags & FLAG_LARGE != 0
    }
}

// ============================================================================
// Segment - Size-class based page pool
// ============================================================================

/// A segment manages pages of a specific size class.
pub struct Segment<const BLOCK_SIZE: usize> {
    /// All pages in this segment.
    pages: Vec<NonNull<PageHeader>>,
    /// Bump pointer for fast allocation.
    bump_ptr: *mut u8,
    /// End of allocatable region in current page.
    bump_end: *const u8,
}

impl<const BLOCK_SIZE: usize> Segment<BLOCK_SIZE> {
    /// Create a new empty segment.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            pages: Vec::new(),
            bump_ptr: std::ptr::null_mut(),
            bump_end: std::ptr::null(),
        }
    }

    /// Allocate a new page for this segment.
    fn allocate_page(&mut self) -> Option<NonNull<PageHeader>> {
        let layout = Layout::from_size_align(PAGE_SIZE, PAGE_SIZE).ok()?;

        // SAFETY: Layout is valid and non-zero sized
        let ptr = NonNull::new(unsafe { alloc(layout) })?;

        // SAFETY: ptr is page-aligned, which is more strict than PageHeader's alignment.
        #[allow(clippy::cast_ptr_alignment)]
        let header = ptr.cast::<PageHeader>();

        // SAFETY: We just allocated this memory
        unsafe {
            header.as_ptr().write(PageHeader {
                magic: MAGIC_TENURED_PAGE,
                #[allow(clippy::cast_possible_truncation)]
                block_size: BLOCK_SIZE as u32,
                #[allow(clippy::cast_possible_truncation)]
                obj_count: PageHeader::max_objects(BLOCK_SIZE) as u16,
                flags: 0,
                _padding: [0; 5],
            });
        }
        self.pages.push(header);

        let header_size = PageHeader::header_size(BLOCK_SIZE);
        self.bump_ptr = unsafe { ptr.as_ptr().add(header_size) };
        self.bump_end = unsafe { ptr.as_ptr().add(PAGE_SIZE) };

        Some(header)
    }

    /// Allocate one block.
    ///
    /// Returns the block and, if a fresh page had to be mapped, that page.
    pub fn allocate(&mut self) -> Option<(NonNull<u8>, Option<NonNull<PageHeader>>)> {
        // Fast path: bump allocation
        if (self.bump_ptr as usize) + BLOCK_SIZE <= self.bump_end as usize {
            let ptr = self.bump_ptr;
            self.bump_ptr = unsafe { self.bump_ptr.add(BLOCK_SIZE) };
            // SAFETY: bump_ptr is non-null once a page exists
            return Some((unsafe { NonNull::new_unchecked(ptr) }, None));
        }

        // Slow path: need a new page
        let page = self.allocate_page()?;
        let ptr = self.bump_ptr;
        self.bump_ptr = unsafe { self.bump_ptr.add(BLOCK_SIZE) };
        Some((unsafe { NonNull::new_unchecked(ptr) }, Some(page)))
    }

    /// Get all pages in this segment.
    #[must_use]
    pub fn pages(&self) -> &[NonNull<PageHeader>] {
        &self.pages
    }
}

impl<const BLOCK_SIZE: usize> Default for Segment<BLOCK_SIZE> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const BLOCK_SIZE: usize> Drop for Segment<BLOCK_SIZE> {
    fn drop(&mut self) {
        let layout = Layout::from_size_align(PAGE_SIZE, PAGE_SIZE).unwrap();
        for page in &self.pages {
            // SAFETY: Pages were allocated with this layout
            unsafe {
                dealloc(page.as_ptr().cast(), layout);
            }
        }
    }
}

// ============================================================================
// TenuredHeap
// ============================================================================

/// The provided [`TenuredAllocator`].
pub struct TenuredHeap {
    segment_16: Segment<16>,
    segment_32: Segment<32>,
    segment_64: Segment<64>,
    segment_128: Segment<128>,
    segment_256: Segment<256>,
    segment_512: Segment<512>,
    segment_1024: Segment<1024>,
    segment_2048: Segment<2048>,
    /// Dedicated pages for blocks larger than 2KB, with their layouts.
    large_objects: Vec<(NonNull<PageHeader>, Layout)>,
    /// Addresses of every page owned by this heap.
    page_set: HashSet<usize>,
    /// Total bytes handed out.
    total_allocated: usize,
    /// Ceiling checked by [`TenuredAllocator::is_near_limit`].
    limit: usize,
}

impl TenuredHeap {
    /// Create an empty heap with no ceiling.
    #[must_use]
    pub fn new() -> Self {
        Self::with_limit(usize::MAX)
    }

    /// Create an empty heap that reports itself near its limit once `limit`
    /// bytes have been allocated.
    #[must_use]
    pub fn with_limit(limit: usize) -> Self {
        Self {
            segment_16: Segment::new(),
            segment_32: Segment::new(),
            segment_64: Segment::new(),
            segment_128: Segment::new(),
            segment_256: Segment::new(),
            segment_512: Segment::new(),
            segment_1024: Segment::new(),
            segment_2048: Segment::new(),
            large_objects: Vec::new(),
            page_set: HashSet::new(),
            total_allocated: 0,
            limit,
        }
    }

    /// Allocate a large block on dedicated pages.
    fn alloc_large(&mut self, size: usize) -> Option<NonNull<u8>> {
        let header_size = std::mem::size_of::<PageHeader>();
        let alloc_size = (header_size + size).div_ceil(PAGE_SIZE) * PAGE_SIZE;
        let layout = Layout::from_size_align(alloc_size, PAGE_SIZE).ok()?;

        // SAFETY: Layout is valid
        let ptr = NonNull::new(unsafe { alloc(layout) })?;

        // SAFETY: ptr is page-aligned, which is more strict than PageHeader's alignment.
        #[allow(clippy::cast_ptr_alignment)]
        let header = ptr.cast::<PageHeader>();
        // SAFETY: We just allocated this memory
        unsafe {
            header.as_ptr().write(PageHeader {
                magic: MAGIC_TENURED_PAGE,
                block_size: u32::try_from(size).unwrap_or(u32::MAX),
                obj_count: 1,
                flags: FLAG_LARGE,
                _padding: [0; 5],
            });
        }
        self.large_objects.push((header, layout));
        self.page_set.insert(ptr.as_ptr() as usize);

        Some(unsafe { NonNull::new_unchecked(ptr.as_ptr().add(header_size)) })
    }

    /// Returns the block size of the tenured block starting at `addr`, or
    /// `None` if `addr` is not in a page owned by this heap.
    #[must_use]
    pub fn block_size_of(&self, addr: usize) -> Option<usize> {
        let page = addr & PAGE_MASK;
        if !self.page_set.contains(&page) {
            return None;
        }
        // SAFETY: The page is owned by this heap and starts with a header.
        let header = unsafe { &*(page as *const PageHeader) };
        debug_assert_eq!(header.magic, MAGIC_TENURED_PAGE);
        Some(header.block_size as usize)
    }

    /// Returns `true` if `addr` lies in a page owned by this heap.
    #[must_use]
    pub fn contains(&self, addr: usize) -> bool {
        self.page_set.contains(&(addr & PAGE_MASK))
    }

    /// Number of pages owned by this heap.
    #[must_use]
    pub fn page_count(&self) -> usize {
        self.page_set.len()
    }

    fn segment_pages(&self) -> impl Iterator<Item = NonNull<PageHeader>> + '_ {
        self.segment_16
            .pages()
            .iter()
            .chain(self.segment_32.pages())
            .chain(self.segment_64.pages())
            .chain(self.segment_128.pages())
            .chain(self.segment_256.pages())
            .chain(self.segment_512.pages())
            .chain(self.segment_1024.pages())
            .chain(self.segment_2048.pages())
            .copied()
    }
}

impl Default for TenuredHeap {
    fn default() -> Self {
        Self::new()
    }
}

impl TenuredAllocator for TenuredHeap {
    fn allocate(&mut self, class: SizeClass) -> Option<NonNull<u8>> {
        let (ptr, page) = match class {
            SizeClass::Large(size) => (self.alloc_large(size)?, None),
            SizeClass::Small(0) => self.segment_16.allocate()?,
            SizeClass::Small(1) => self.segment_32.allocate()?,
            SizeClass::Small(2) => self.segment_64.allocate()?,
            SizeClass::Small(3) => self.segment_128.allocate()?,
            SizeClass::Small(4) => self.segment_256.allocate()?,
            SizeClass::Small(5) => self.segment_512.allocate()?,
            SizeClass::Small(6) => self.segment_1024.allocate()?,
            SizeClass::Small(_) => self.segment_2048.allocate()?,
        };
        if let Some(page) = page {
            self.page_set.insert(page.as_ptr() as usize);
        }
        self.total_allocated += class.bytes();
        Some(ptr)
    }

    fn bytes_allocated(&self) -> usize {
        self.total_allocated
    }

    fn is_near_limit(&self) -> bool {
        self.total_allocated >= self.limit
    }
}

impl Drop for TenuredHeap {
    fn drop(&mut self) {
        debug_assert_eq!(
            self.segment_pages().count() + self.large_objects.len(),
            self.page_set.len()
        );
        for &(page, layout) in &self.large_objects {
            // SAFETY: Large pages were allocated with the stored layout
            unsafe { dealloc(page.as_ptr().cast(), layout) };
        }
    }
}
