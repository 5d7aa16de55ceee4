//! The bump-pointer nursery.
//!
//! The nursery commits `max_chunks` chunks once and allocates linearly
//! through a prefix of `active_chunks` of them. Slot and element buffers that
//! are too large to bump allocate live in the general-purpose heap and are
//! tracked in the huge-buffer registry until their owner is promoted or dies.
//!
//! # Invariants
//!
//! - `chunk_start(current_chunk) <= position <= current_end <= chunk_end(current_chunk)`.
//! - When `current_end != chunk_end(current_chunk)` it equals `position`,
//!   which routes the next allocation through the slow path. This is how a
//!   disabled nursery and a live forwarding ledger are handled without a
//!   check on the fast path.
//! - The nursery is empty iff `current_chunk == 0` and `position` is at the
//!   start of chunk 0.

use std::collections::HashMap;
use std::io;
use std::ptr::{self, NonNull};

use crate::buffers::{BufferAllocator, SystemBuffers};
use crate::cell::{CellHeader, CellPtr, ObjectKind, TypeInfo, Value, WORD};
use crate::chunk::{ChunkArena, CHUNK_USABLE};
use crate::config::NurseryConfig;
use crate::gc::worklist::ForwardingLedger;

/// Smallest allocation the nursery accepts.
pub const MIN_CELL_SIZE: usize = 2 * WORD;

/// Byte pattern written over swept nursery memory when poisoning is on.
#[cfg(any(test, feature = "test-util"))]
pub const POISON_BYTE: u8 = 0xDB;

/// The young generation.
pub struct Nursery {
    arena: ChunkArena,
    /// Bump cursor.
    position: usize,
    /// Allocation limit for the fast path.
    current_end: usize,
    current_chunk: usize,
    active_chunks: usize,
    enabled: bool,
    /// Huge-buffer registry: buffer address -> size in words.
    huge: HashMap<usize, usize>,
    /// Huge buffers copied into promoted cells this cycle, freed by the
    /// sweep once forwarding queries are done.
    absorbed: Vec<(usize, usize)>,
    buffers: Box<dyn BufferAllocator>,
    ledger: ForwardingLedger,
    /// The ledger describes the last cycle and is cleared by the next
    /// allocation.
    ledger_live: bool,
    config: NurseryConfig,
}

impl Nursery {
    /// Create a nursery using the global allocator for out-of-line buffers.
    ///
    /// # Errors
    ///
    /// Returns an error if `config` is invalid or the chunk arena cannot be
    /// reserved.
    pub fn new(config: NurseryConfig, runtime_id: u64) -> io::Result<Self> {
        Self::with_buffers(config, runtime_id, Box::new(SystemBuffers::new()))
    }

    /// Create a nursery with a custom general-purpose heap.
    ///
    /// # Errors
    ///
    /// See [`Nursery::new`].
    pub fn with_buffers(
        config: NurseryConfig,
        runtime_id: u64,
        buffers: Box<dyn BufferAllocator>,
    ) -> io::Result<Self> {
        config.validate()?;
        let arena = ChunkArena::reserve(config.max_chunks, runtime_id)?;
        let start = arena.chunk_start(0);
        let end = arena.chunk_end(0);
        Ok(Self {
            arena,
            position: start,
            current_end: end,
            current_chunk: 0,
            active_chunks: config.initial_chunks,
            enabled: true,
            huge: HashMap::new(),
            absorbed: Vec::new(),
            buffers,
            ledger: ForwardingLedger::new(),
            ledger_live: false,
            config,
        })
    }

    // ========================================================================
    // Bump allocation
    // ========================================================================

    /// Allocate `size` bytes of uninitialized nursery memory.
    ///
    /// Returns `None` when the nursery is disabled, every active chunk is
    /// full, or `size` can never fit a chunk; the caller is expected to
    /// collect or allocate elsewhere.
    ///
    /// # Panics
    ///
    /// Debug builds panic if `size` is below [`MIN_CELL_SIZE`].
    #[inline]
    pub fn allocate(&mut self, size: usize) -> Option<NonNull<u8>> {
        debug_assert!(size >= MIN_CELL_SIZE, "allocation of {size} bytes");
        let size = size.checked_next_multiple_of(WORD)?;
        if size <= self.current_end - self.position {
            return Some(self.bump(size));
        }
        self.allocate_slow(size)
    }

    #[inline]
    fn bump(&mut self, size: usize) -> NonNull<u8> {
        let addr = self.position;
        self.position += size;
        // SAFETY: Chunk addresses are never null.
        unsafe { NonNull::new_unchecked(addr as *mut u8) }
    }

    #[cold]
    fn allocate_slow(&mut self, size: usize) -> Option<NonNull<u8>> {
        if !self.enabled || size > CHUNK_USABLE {
            return None;
        }
        if self.ledger_live {
            self.ledger.clear();
            self.ledger_live = false;
        }
        self.current_end = self.arena.chunk_end(self.current_chunk);
        if size > self.current_end - self.position {
            if self.current_chunk + 1 >= self.active_chunks {
                return None;
            }
            self.set_current_chunk(self.current_chunk + 1);
        }
        Some(self.bump(size))
    }

    fn set_current_chunk(&mut self, index: usize) {
        self.current_chunk = index;
        self.position = self.arena.chunk_start(index);
        self.current_end = self.arena.chunk_end(index);
    }

    /// Allocate a cell of type `info` with `slot_count` slots.
    ///
    /// Slots are placed directly after the fixed part when they fit the
    /// inline budget, otherwise in a huge buffer. The cell and its slots are
    /// zeroed.
    pub fn allocate_object(&mut self, info: &TypeInfo, slot_count: usize) -> Option<CellPtr> {
        let inline = slot_count <= self.config.inline_slot_budget;
        let size = info.fixed_size + if inline { slot_count * WORD } else { 0 };
        let cell = self.allocate_cell(info, size)?;

        if slot_count > 0 {
            let slots = if inline {
                // SAFETY: The inline slots were allocated with the cell.
                unsafe { cell.as_ptr().cast::<u8>().add(info.fixed_size).cast::<Value>() }
            } else {
                self.allocate_huge(slot_count)?.as_ptr()
            };
            // SAFETY: The cell was just initialized.
            unsafe { cell.set_slots(slots, slot_count) };
        }
        Some(cell)
    }

    /// Allocate a cell of type `info` with room for `capacity` element units.
    ///
    /// Byte buffers start with their length equal to `capacity`; arrays
    /// start empty.
    ///
    /// # Panics
    ///
    /// Panics if `info` has no element storage.
    pub fn allocate_array(&mut self, info: &TypeInfo, capacity: usize) -> Option<CellPtr> {
        assert_ne!(info.kind, ObjectKind::Plain, "{} has no elements", info.name);
        let words = info.element_words(capacity);
        let inline = words <= self.config.inline_slot_budget;
        let size = info.fixed_size + if inline { words * WORD } else { 0 };
        let cell = self.allocate_cell(info, size)?;

        if words > 0 {
            let elements = if inline {
                // SAFETY: The inline elements were allocated with the cell.
                unsafe { cell.as_ptr().cast::<u8>().add(info.fixed_size).cast::<Value>() }
            } else {
                self.allocate_buffer(words)?.as_ptr()
            };
            // SAFETY: The cell was just initialized.
            unsafe { cell.set_elements(elements, capacity) };
        }
        if info.kind == ObjectKind::ByteBuffer {
            // SAFETY: `capacity` was just stored.
            unsafe { cell.set_element_len(capacity) };
        }
        Some(cell)
    }

    fn allocate_cell(&mut self, info: &TypeInfo, size: usize) -> Option<CellPtr> {
        let mem = self.allocate(size.max(MIN_CELL_SIZE))?;
        // SAFETY: `mem` spans `size` bytes of nursery memory.
        unsafe {
            ptr::write_bytes(mem.as_ptr(), 0, size);
            #[allow(clippy::cast_ptr_alignment)]
            let header = mem.as_ptr().cast::<CellHeader>();
            (*header).type_id = info.id;
            Some(CellPtr::from_raw(NonNull::new_unchecked(header)))
        }
    }

    // ========================================================================
    // Out-of-line buffers
    // ========================================================================

    /// Allocate a zeroed slot array of `count` words for `owner`.
    ///
    /// Tenured owners get general-purpose heap memory. Nursery owners get
    /// nursery memory up to the configured maximum, else a registered huge
    /// buffer.
    pub fn allocate_slots(&mut self, owner: CellPtr, count: usize) -> Option<NonNull<Value>> {
        self.allocate_buffer_for(owner, count)
    }

    /// Allocate a zeroed element array of `words` words for `owner`.
    ///
    /// See [`Nursery::allocate_slots`].
    pub fn allocate_elements(&mut self, owner: CellPtr, words: usize) -> Option<NonNull<Value>> {
        self.allocate_buffer_for(owner, words)
    }

    fn allocate_buffer_for(&mut self, owner: CellPtr, words: usize) -> Option<NonNull<Value>> {
        if self.is_inside(owner.addr()) {
            self.allocate_buffer(words)
        } else {
            self.buffers.alloc(words)
        }
    }

    /// Buffer for a nursery-resident owner.
    fn allocate_buffer(&mut self, words: usize) -> Option<NonNull<Value>> {
        if words <= self.config.max_nursery_slots {
            let bytes = (words * WORD).max(MIN_CELL_SIZE);
            if let Some(mem) = self.allocate(bytes) {
                // SAFETY: Freshly bumped nursery memory.
                unsafe { ptr::write_bytes(mem.as_ptr(), 0, bytes) };
                return Some(mem.cast());
            }
        }
        self.allocate_huge(words)
    }

    fn allocate_huge(&mut self, words: usize) -> Option<NonNull<Value>> {
        let buffer = self.buffers.alloc(words)?;
        if self.huge.try_reserve(1).is_err() {
            // SAFETY: Nothing else has seen the buffer.
            unsafe { self.buffers.free(buffer, words) };
            return None;
        }
        self.huge.insert(buffer.as_ptr() as usize, words);
        Some(buffer)
    }

    /// Resize a slot array of `owner` from `old_count` to `new_count` words.
    ///
    /// Returns the (possibly moved) array; on failure the old array is
    /// untouched. Shrinking nursery memory keeps the old array.
    ///
    /// # Safety
    ///
    /// `old` must be `owner`'s current slot array with `old_count` words, or
    /// null when `old_count` is zero.
    pub unsafe fn reallocate_slots(
        &mut self,
        owner: CellPtr,
        old: *mut Value,
        old_count: usize,
        new_count: usize,
    ) -> Option<NonNull<Value>> {
        unsafe { self.reallocate_buffer(owner, old, old_count, new_count) }
    }

    /// Resize an element array of `owner`, in words.
    ///
    /// # Safety
    ///
    /// See [`Nursery::reallocate_slots`].
    pub unsafe fn reallocate_elements(
        &mut self,
        owner: CellPtr,
        old: *mut Value,
        old_words: usize,
        new_words: usize,
    ) -> Option<NonNull<Value>> {
        unsafe { self.reallocate_buffer(owner, old, old_words, new_words) }
    }

    unsafe fn reallocate_buffer(
        &mut self,
        owner: CellPtr,
        old: *mut Value,
        old_words: usize,
        new_words: usize,
    ) -> Option<NonNull<Value>> {
        let Some(old) = NonNull::new(old) else {
            return self.allocate_buffer_for(owner, new_words);
        };
        let old_addr = old.as_ptr() as usize;

        if !self.is_inside(old_addr) {
            let registered = self.huge.contains_key(&old_addr);
            // SAFETY: Out-of-nursery buffers come from `self.buffers`.
            let new = unsafe { self.buffers.realloc(old, old_words, new_words) }?;
            if registered {
                self.huge.remove(&old_addr);
                self.huge.insert(new.as_ptr() as usize, new_words);
            }
            return Some(new);
        }

        if new_words <= old_words {
            return Some(old);
        }
        let new = self.allocate_buffer(new_words)?;
        // SAFETY: Both buffers are valid for `old_words` words and distinct.
        unsafe { ptr::copy_nonoverlapping(old.as_ptr(), new.as_ptr(), old_words) };
        Some(new)
    }

    /// Release a slot array. Nursery memory is left for the next sweep.
    ///
    /// # Safety
    ///
    /// `slots` must be a live slot array of `count` words that is not used
    /// afterwards.
    pub unsafe fn free_slots(&mut self, slots: *mut Value, count: usize) {
        unsafe { self.free_buffer(slots, count) };
    }

    /// Release an element array of `words` words.
    ///
    /// # Safety
    ///
    /// See [`Nursery::free_slots`].
    pub unsafe fn free_elements(&mut self, elements: *mut Value, words: usize) {
        unsafe { self.free_buffer(elements, words) };
    }

    unsafe fn free_buffer(&mut self, buffer: *mut Value, words: usize) {
        let Some(buffer) = NonNull::new(buffer) else {
            return;
        };
        let addr = buffer.as_ptr() as usize;
        if self.is_inside(addr) {
            return;
        }
        self.huge.remove(&addr);
        // SAFETY: Caller guarantees the buffer is live and unused afterwards.
        unsafe { self.buffers.free(buffer, words) };
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// Returns `true` iff `addr` lies in the committed nursery range,
    /// regardless of which chunks are active.
    #[must_use]
    #[inline]
    pub fn is_inside(&self, addr: usize) -> bool {
        self.arena.contains(addr)
    }

    /// Returns `true` if nothing has been allocated since the last sweep.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.current_chunk == 0 && self.position == self.arena.chunk_start(0)
    }

    /// Returns `true` if allocation is enabled.
    #[must_use]
    pub const fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Number of chunks allocation may use.
    #[must_use]
    pub const fn active_chunks(&self) -> usize {
        self.active_chunks
    }

    /// Number of committed chunks.
    #[must_use]
    pub const fn max_chunks(&self) -> usize {
        self.arena.count()
    }

    /// Index of the chunk being bump allocated.
    #[must_use]
    pub const fn current_chunk(&self) -> usize {
        self.current_chunk
    }

    /// Usable bytes in the active chunks.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.active_chunks * CHUNK_USABLE
    }

    /// Bytes consumed since the last sweep, counting the unused tail of
    /// every chunk already left behind.
    #[must_use]
    pub fn used_bytes(&self) -> usize {
        self.current_chunk * CHUNK_USABLE + (self.position - self.arena.chunk_start(self.current_chunk))
    }

    /// First address of the committed range.
    #[must_use]
    pub fn start(&self) -> usize {
        self.arena.start()
    }

    /// One past the last address of the committed range.
    #[must_use]
    pub fn end(&self) -> usize {
        self.arena.end()
    }

    /// Number of registered huge buffers.
    #[must_use]
    pub fn huge_count(&self) -> usize {
        self.huge.len()
    }

    /// Returns `true` if `addr` is a registered huge buffer.
    #[must_use]
    pub fn is_huge(&self, addr: usize) -> bool {
        self.huge.contains_key(&addr)
    }

    /// The general-purpose heap.
    #[must_use]
    pub fn buffers(&self) -> &dyn BufferAllocator {
        &*self.buffers
    }

    /// The nursery configuration.
    #[must_use]
    pub const fn config(&self) -> &NurseryConfig {
        &self.config
    }

    // ========================================================================
    // Enable / disable
    // ========================================================================

    /// Allow allocation again.
    ///
    /// # Panics
    ///
    /// Panics if the nursery is not empty.
    pub fn enable(&mut self) {
        assert!(self.is_empty(), "nursery must be empty to enable");
        self.enabled = true;
    }

    /// Make every allocation fail until [`Nursery::enable`] is called.
    ///
    /// # Panics
    ///
    /// Panics if the nursery is not empty.
    pub fn disable(&mut self) {
        assert!(self.is_empty(), "nursery must be empty to disable");
        self.enabled = false;
        self.current_end = self.position;
    }

    // ========================================================================
    // Forwarding
    // ========================================================================

    /// New address of the cell that lived at `addr` before the last
    /// collection.
    ///
    /// Only meaningful between the end of a collection and the next
    /// allocation. Returns `None` for addresses outside the nursery and for
    /// cells that were not promoted.
    #[must_use]
    pub fn forwarded_address(&self, addr: usize) -> Option<CellPtr> {
        if !self.is_inside(addr) {
            return None;
        }
        self.ledger.lookup(addr)
    }

    /// Redirect a raw pointer into a slot or element buffer that was moved
    /// by the last collection. This covers nursery buffers and huge buffers
    /// whose contents were copied into the promoted cell.
    ///
    /// Pointers into buffers that did not move are left untouched.
    pub fn forward_buffer_pointer<T>(&self, ptr: &mut *mut T) {
        let addr = *ptr as usize;
        if let Some(new) = self.ledger.buffer_lookup(addr) {
            *ptr = new as *mut T;
        }
    }

    // ========================================================================
    // Collector support
    // ========================================================================

    pub(crate) fn begin_cycle(&mut self) {
        self.ledger.clear();
        self.ledger_live = false;
    }

    pub(crate) const fn ledger(&self) -> &ForwardingLedger {
        &self.ledger
    }

    pub(crate) fn ledger_mut(&mut self) -> &mut ForwardingLedger {
        &mut self.ledger
    }

    /// Remove `addr` from the huge registry, returning its size in words.
    pub(crate) fn unregister_huge(&mut self, addr: usize) -> Option<usize> {
        self.huge.remove(&addr)
    }

    /// Queue an unregistered huge buffer whose contents were copied out for
    /// release at the end of the cycle.
    pub(crate) fn defer_free(&mut self, addr: usize, words: usize) {
        self.absorbed.push((addr, words));
    }

    pub(crate) fn set_active_chunks(&mut self, count: usize) {
        debug_assert!(count >= 1 && count <= self.max_chunks());
        self.active_chunks = count;
    }

    /// Free every huge buffer still registered and reset the cursor to the
    /// first chunk. Returns the number of buffers freed.
    pub(crate) fn sweep(&mut self) -> usize {
        let freed = self.huge.len();
        for (addr, words) in self.huge.drain() {
            // SAFETY: Registered buffers come from `self.buffers` and their
            // owners died in this cycle.
            unsafe { self.buffers.free(NonNull::new_unchecked(addr as *mut Value), words) };
        }
        for (addr, words) in self.absorbed.drain(..) {
            // SAFETY: Absorbed buffers come from `self.buffers` and nothing
            // refers to them once the cycle's forwarding queries are done.
            unsafe { self.buffers.free(NonNull::new_unchecked(addr as *mut Value), words) };
        }

        #[cfg(any(test, feature = "test-util"))]
        if self.config.poison {
            self.poison_used();
        }

        self.set_current_chunk(0);
        self.current_end = self.position;
        self.ledger_live = true;
        freed
    }

    #[cfg(any(test, feature = "test-util"))]
    fn poison_used(&self) {
        for index in 0..=self.current_chunk {
            let start = self.arena.chunk_start(index);
            let end = if index == self.current_chunk {
                self.position
            } else {
                self.arena.chunk_end(index)
            };
            // SAFETY: The range lies in committed nursery memory that holds
            // only evacuated or dead cells.
            unsafe { ptr::write_bytes(start as *mut u8, POISON_BYTE, end - start) };
        }
    }
}

impl Drop for Nursery {
    fn drop(&mut self) {
        let absorbed = self.absorbed.iter().map(|(addr, words)| (addr, words));
        for (&addr, &words) in self.huge.iter().chain(absorbed) {
            // SAFETY: Registered buffers come from `self.buffers`.
            unsafe {
                self.buffers
                    .free(NonNull::new_unchecked(addr as *mut Value), words);
            }
        }
    }
}

impl std::fmt::Debug for Nursery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Nursery")
            .field("start", &format_args!("{:#x}", self.start()))
            .field("used_bytes", &self.used_bytes())
            .field("current_chunk", &self.current_chunk)
            .field("active_chunks", &self.active_chunks)
            .field("enabled", &self.enabled)
            .field("huge_buffers", &self.huge.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cell::TypeRegistry;

    fn nursery(config: NurseryConfig) -> Nursery {
        Nursery::new(config, 1).unwrap()
    }

    #[test]
    fn test_fast_path_bumps() {
        let mut n = nursery(NurseryConfig::default());
        assert!(n.is_empty());
        let a = n.allocate(24).unwrap().as_ptr() as usize;
        let b = n.allocate(16).unwrap().as_ptr() as usize;
        assert_eq!(a, n.start());
        assert_eq!(b, a + 24);
        assert_eq!(n.used_bytes(), 40);
        assert!(!n.is_empty());
    }

    #[test]
    fn test_sizes_round_to_words() {
        let mut n = nursery(NurseryConfig::default());
        let a = n.allocate(17).unwrap().as_ptr() as usize;
        let b = n.allocate(16).unwrap().as_ptr() as usize;
        assert_eq!(b - a, 24);
    }

    #[test]
    fn test_oversized_request_fails() {
        let mut n = nursery(NurseryConfig::default().max_chunks(2).initial_chunks(2));
        assert!(n.allocate(CHUNK_USABLE + 8).is_none());
        assert!(n.allocate(CHUNK_USABLE).is_some());
    }

    #[test]
    fn test_sweep_resets_and_frees_huge() {
        let mut types = TypeRegistry::new();
        let id = types.register("Wide", ObjectKind::Plain, 32, &[]);
        let mut n = nursery(NurseryConfig::default().poison(true));

        let cell = n.allocate_object(types.get(id), 40).unwrap();
        assert_eq!(n.huge_count(), 1);
        assert!(n.is_huge(unsafe { cell.slots() } as usize));
        assert_eq!(n.buffers().bytes_in_use(), 40 * WORD);

        assert_eq!(n.sweep(), 1);
        assert!(n.is_empty());
        assert_eq!(n.huge_count(), 0);
        assert_eq!(n.buffers().bytes_in_use(), 0);

        let header = unsafe { std::slice::from_raw_parts(cell.addr() as *const u8, 32) };
        assert!(header.iter().all(|&b| b == POISON_BYTE));
    }

    #[test]
    fn test_byte_buffer_length_in_bytes() {
        let mut types = TypeRegistry::new();
        let id = types.register("Bytes", ObjectKind::ByteBuffer, 32, &[]);
        let mut n = nursery(NurseryConfig::default());

        let small = n.allocate_array(types.get(id), 100).unwrap();
        unsafe {
            // 13 words fit the inline budget.
            assert_eq!(small.elements() as usize, small.addr() + 32);
            assert_eq!(small.element_len(), 100);
        }

        let cell = n.allocate_array(types.get(id), 200).unwrap();
        unsafe {
            assert_eq!(cell.element_len(), 200);
            assert_eq!(cell.element_capacity(), 200);
            // 25 words: out of line but still bump allocated.
            assert_ne!(cell.elements() as usize, cell.addr() + 32);
            assert!(n.is_inside(cell.elements() as usize));
        }
        assert_eq!(n.huge_count(), 0);
    }

    #[test]
    fn test_reallocate_nursery_buffer() {
        let mut types = TypeRegistry::new();
        let id = types.register("Obj", ObjectKind::Plain, 32, &[]);
        let mut n = nursery(NurseryConfig::default());
        let cell = n.allocate_object(types.get(id), 4).unwrap();
        unsafe {
            cell.set_slot(3, Value::from_int(7));

            let same = n.reallocate_slots(cell, cell.slots(), 4, 2).unwrap();
            assert_eq!(same.as_ptr(), cell.slots());

            let grown = n.reallocate_slots(cell, cell.slots(), 4, 32).unwrap();
            assert_ne!(grown.as_ptr(), cell.slots());
            assert!(n.is_inside(grown.as_ptr() as usize));
            assert_eq!((*grown.as_ptr().add(3)).as_int(), Some(7));
            assert!((*grown.as_ptr().add(31)).is_null());
        }
    }
}
