//! General-purpose heap for out-of-line slot and element buffers.
//!
//! Buffers owned by tenured cells, and huge buffers owned by nursery cells,
//! live here. Sizes are always given in words so the allocator does not need
//! to store them.

use std::alloc::{self, Layout};
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::cell::{Value, WORD};

/// Allocator for out-of-line buffers.
///
/// Every buffer returned by [`BufferAllocator::alloc`] is zero filled and
/// word aligned. A buffer must be freed or reallocated with the same word
/// count it was allocated with.
pub trait BufferAllocator {
    /// Allocate a zeroed buffer of `words` words. Returns `None` on failure.
    fn alloc(&self, words: usize) -> Option<NonNull<Value>>;

    /// Grow or shrink a buffer. Words past `old_words` are zeroed.
    ///
    /// On failure the original buffer is left untouched.
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by this allocator with `old_words`.
    unsafe fn realloc(
        &self,
        ptr: NonNull<Value>,
        old_words: usize,
        new_words: usize,
    ) -> Option<NonNull<Value>>;

    /// Release a buffer.
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by this allocator with `words` and must
    /// not be used afterwards.
    unsafe fn free(&self, ptr: NonNull<Value>, words: usize);

    /// Bytes currently allocated and not yet freed.
    fn bytes_in_use(&self) -> usize;
}

fn layout_for(words: usize) -> Option<Layout> {
    Layout::array::<Value>(words.max(1)).ok()
}

/// [`BufferAllocator`] backed by the global allocator.
#[derive(Debug, Default)]
pub struct SystemBuffers {
    in_use: AtomicUsize,
}

impl SystemBuffers {
    /// Create a new allocator with nothing in use.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            in_use: AtomicUsize::new(0),
        }
    }
}

impl BufferAllocator for SystemBuffers {
    fn alloc(&self, words: usize) -> Option<NonNull<Value>> {
        let layout = layout_for(words)?;
        // SAFETY: The layout has a non-zero size.
        let ptr = NonNull::new(unsafe { alloc::alloc_zeroed(layout) })?;
        self.in_use.fetch_add(words * WORD, Ordering::Relaxed);
        Some(ptr.cast())
    }

    unsafe fn realloc(
        &self,
        ptr: NonNull<Value>,
        old_words: usize,
        new_words: usize,
    ) -> Option<NonNull<Value>> {
        let old_layout = layout_for(old_words)?;
        let new_layout = layout_for(new_words)?;
        // SAFETY: Caller guarantees `ptr` came from `alloc` with `old_words`.
        let raw = unsafe { alloc::realloc(ptr.as_ptr().cast(), old_layout, new_layout.size()) };
        let new = NonNull::new(raw.cast::<Value>())?;
        if new_words > old_words {
            // SAFETY: The tail lies inside the new allocation.
            unsafe { ptr::write_bytes(new.as_ptr().add(old_words), 0, new_words - old_words) };
        }
        self.in_use.fetch_add(new_words * WORD, Ordering::Relaxed);
        self.in_use.fetch_sub(old_words * WORD, Ordering::Relaxed);
        Some(new)
    }

    unsafe fn free(&self, ptr: NonNull<Value>, words: usize) {
        let Some(layout) = layout_for(words) else {
            return;
        };
        // SAFETY: Caller guarantees `ptr` came from `alloc` with `words`.
        unsafe { alloc::dealloc(ptr.as_ptr().cast(), layout) };
        self.in_use.fetch_sub(words * WORD, Ordering::Relaxed);
    }

    fn bytes_in_use(&self) -> usize {
        self.in_use.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_is_zeroed() {
        let buffers = SystemBuffers::new();
        let ptr = buffers.alloc(8).unwrap();
        for i in 0..8 {
            assert!(unsafe { *ptr.as_ptr().add(i) }.is_null());
        }
        assert_eq!(buffers.bytes_in_use(), 8 * WORD);
        unsafe { buffers.free(ptr, 8) };
        assert_eq!(buffers.bytes_in_use(), 0);
    }

    #[test]
    fn test_realloc_preserves_prefix_and_zeroes_tail() {
        let buffers = SystemBuffers::new();
        let ptr = buffers.alloc(2).unwrap();
        unsafe {
            *ptr.as_ptr() = Value::from_int(1);
            *ptr.as_ptr().add(1) = Value::from_int(2);
        }
        let grown = unsafe { buffers.realloc(ptr, 2, 64) }.unwrap();
        unsafe {
            assert_eq!((*grown.as_ptr()).as_int(), Some(1));
            assert_eq!((*grown.as_ptr().add(1)).as_int(), Some(2));
            assert!((*grown.as_ptr().add(63)).is_null());
        }
        assert_eq!(buffers.bytes_in_use(), 64 * WORD);
        unsafe { buffers.free(grown, 64) };
        assert_eq!(buffers.bytes_in_use(), 0);
    }
}
