//! The runtime context.
//!
//! A [`Runtime`] owns one nursery together with everything a minor
//! collection touches: the store buffer, the tenured heap, the type
//! registry, the root table and the registered collaborators. There is no
//! global state; every operation goes through the runtime it belongs to.

use std::alloc::{handle_alloc_error, Layout};
use std::io;
use std::ptr;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::buffers::{BufferAllocator, SystemBuffers};
use crate::cell::{CellHeader, CellPtr, ObjectKind, TypeId, TypeInfo, TypeRegistry, Value, WORD};
use crate::config::NurseryConfig;
use crate::gc::minor::{self, CollectReason};
use crate::gc::pretenure::PretenureSampler;
use crate::gc::tenure::SlotKind;
use crate::heap::{SizeClass, TenuredAllocator, TenuredHeap, MAX_SMALL_OBJECT_SIZE};
use crate::metrics::MinorMetrics;
use crate::nursery::Nursery;
use crate::roots::{CodeCache, RootSource, RootTable};
use crate::store_buffer::StoreBuffer;

static NEXT_RUNTIME_ID: AtomicU64 = AtomicU64::new(1);

/// Owner of a nursery and its collaborators.
pub struct Runtime {
    id: u64,
    pub(crate) nursery: Nursery,
    pub(crate) store_buffer: StoreBuffer,
    pub(crate) tenured: Box<dyn TenuredAllocator>,
    pub(crate) types: TypeRegistry,
    pub(crate) roots: RootTable,
    pub(crate) sources: Vec<Box<dyn RootSource>>,
    pub(crate) code_cache: Option<Box<dyn CodeCache>>,
    pub(crate) sampler: PretenureSampler,
    pub(crate) pretenure_candidates: Vec<TypeId>,
    pub(crate) gc_suppressed: usize,
    pub(crate) last_metrics: Option<MinorMetrics>,
    pub(crate) total_collections: usize,
}

impl Runtime {
    /// Create a runtime with the provided tenured heap and the global
    /// allocator for out-of-line buffers.
    ///
    /// # Errors
    ///
    /// Returns an error if `config` is invalid or the nursery cannot reserve
    /// its chunks.
    pub fn new(config: NurseryConfig) -> io::Result<Self> {
        Self::with_parts(
            config,
            Box::new(TenuredHeap::new()),
            Box::new(SystemBuffers::new()),
        )
    }

    /// Create a runtime with custom tenured and general-purpose heaps.
    ///
    /// # Errors
    ///
    /// See [`Runtime::new`].
    pub fn with_parts(
        config: NurseryConfig,
        tenured: Box<dyn TenuredAllocator>,
        buffers: Box<dyn BufferAllocator>,
    ) -> io::Result<Self> {
        let id = NEXT_RUNTIME_ID.fetch_add(1, Ordering::Relaxed);
        Ok(Self {
            id,
            nursery: Nursery::with_buffers(config, id, buffers)?,
            store_buffer: StoreBuffer::new(),
            tenured,
            types: TypeRegistry::new(),
            roots: RootTable::new(),
            sources: Vec::new(),
            code_cache: None,
            sampler: PretenureSampler::new(),
            pretenure_candidates: Vec::new(),
            gc_suppressed: 0,
            last_metrics: None,
            total_collections: 0,
        })
    }

    /// Replace the store buffer, e.g. to set a different overflow limit.
    ///
    /// # Panics
    ///
    /// Panics if the current store buffer is not empty.
    #[must_use]
    pub fn with_store_buffer(mut self, store_buffer: StoreBuffer) -> Self {
        assert!(self.store_buffer.is_empty(), "store buffer in use");
        self.store_buffer = store_buffer;
        self
    }

    /// Identity written into every chunk trailer of this runtime's nursery.
    #[must_use]
    pub const fn id(&self) -> u64 {
        self.id
    }

    // ========================================================================
    // Types
    // ========================================================================

    /// Register a cell type. See [`TypeRegistry::register`].
    pub fn register_type(
        &mut self,
        name: &'static str,
        kind: ObjectKind,
        fixed_size: usize,
        ref_offsets: &[usize],
    ) -> TypeId {
        self.types.register(name, kind, fixed_size, ref_offsets)
    }

    /// The type registry.
    #[must_use]
    pub const fn types(&self) -> &TypeRegistry {
        &self.types
    }

    // ========================================================================
    // Allocation
    // ========================================================================

    /// Allocate a zeroed cell with `slot_count` slots.
    ///
    /// Tries the nursery first, collecting once if it is full, and falls
    /// back to the tenured heap when the nursery stays unavailable.
    pub fn new_object(&mut self, type_id: TypeId, slot_count: usize) -> CellPtr {
        self.allocate_with_retry(type_id, |nursery, info| {
            nursery.allocate_object(info, slot_count)
        })
        .unwrap_or_else(|| self.new_tenured_object(type_id, slot_count))
    }

    /// Allocate a zeroed array or byte buffer cell with `capacity` element
    /// units. Falls back to the tenured heap like [`Runtime::new_object`].
    ///
    /// # Panics
    ///
    /// Panics if the type has no element storage.
    pub fn new_array(&mut self, type_id: TypeId, capacity: usize) -> CellPtr {
        self.allocate_with_retry(type_id, |nursery, info| {
            nursery.allocate_array(info, capacity)
        })
        .unwrap_or_else(|| self.new_tenured_array(type_id, capacity))
    }

    fn allocate_with_retry(
        &mut self,
        type_id: TypeId,
        mut alloc: impl FnMut(&mut Nursery, &TypeInfo) -> Option<CellPtr>,
    ) -> Option<CellPtr> {
        if self.store_buffer.is_full() {
            self.collect(CollectReason::FullStoreBuffer, None);
        }
        if let Some(cell) = alloc(&mut self.nursery, self.types.get(type_id)) {
            return Some(cell);
        }
        self.collect(CollectReason::OutOfNursery, None)?;
        alloc(&mut self.nursery, self.types.get(type_id))
    }

    /// Allocate a zeroed cell directly in the tenured heap.
    pub fn new_tenured_object(&mut self, type_id: TypeId, slot_count: usize) -> CellPtr {
        let fixed_size = self.types.get(type_id).fixed_size;
        let budget = self.nursery.config().inline_slot_budget;
        let inline = slot_count <= budget && fixed_size + slot_count * WORD <= MAX_SMALL_OBJECT_SIZE;
        let size = fixed_size + if inline { slot_count * WORD } else { 0 };
        let cell = self.tenured_cell(type_id, size);

        if slot_count > 0 {
            let slots = if inline {
                // SAFETY: The inline slots were allocated with the cell.
                unsafe { cell.as_ptr().cast::<u8>().add(fixed_size).cast::<Value>() }
            } else {
                self.heap_buffer(slot_count)
            };
            // SAFETY: The cell was just initialized.
            unsafe { cell.set_slots(slots, slot_count) };
        }
        cell
    }

    /// Allocate a zeroed array or byte buffer cell directly in the tenured
    /// heap.
    ///
    /// # Panics
    ///
    /// Panics if the type has no element storage.
    pub fn new_tenured_array(&mut self, type_id: TypeId, capacity: usize) -> CellPtr {
        let info = self.types.get(type_id);
        assert_ne!(info.kind, ObjectKind::Plain, "{} has no elements", info.name);
        let (kind, fixed_size, words) = (info.kind, info.fixed_size, info.element_words(capacity));
        let inline = fixed_size + words * WORD <= MAX_SMALL_OBJECT_SIZE;
        let size = fixed_size + if inline { words * WORD } else { 0 };
        let cell = self.tenured_cell(type_id, size);

        if words > 0 {
            let elements = if inline {
                // SAFETY: The inline elements were allocated with the cell.
                unsafe { cell.as_ptr().cast::<u8>().add(fixed_size).cast::<Value>() }
            } else {
                self.heap_buffer(words)
            };
            // SAFETY: The cell was just initialized.
            unsafe { cell.set_elements(elements, capacity) };
        }
        if kind == ObjectKind::ByteBuffer {
            // SAFETY: `capacity` was just stored.
            unsafe { cell.set_element_len(capacity) };
        }
        cell
    }

    fn tenured_cell(&mut self, type_id: TypeId, size: usize) -> CellPtr {
        let class = SizeClass::for_size(size);
        let Some(block) = self.tenured.allocate(class) else {
            handle_alloc_error(
                Layout::from_size_align(class.bytes(), 16).unwrap_or(Layout::new::<CellHeader>()),
            );
        };
        // SAFETY: `block` holds at least `size` bytes.
        unsafe {
            ptr::write_bytes(block.as_ptr(), 0, size);
            let header = block.cast::<CellHeader>();
            (*header.as_ptr()).type_id = type_id;
            CellPtr::from_raw(header)
        }
    }

    fn heap_buffer(&self, words: usize) -> *mut Value {
        match self.nursery.buffers().alloc(words) {
            Some(buffer) => buffer.as_ptr(),
            None => handle_alloc_error(
                Layout::array::<Value>(words).unwrap_or(Layout::new::<Value>()),
            ),
        }
    }

    // ========================================================================
    // Barriered stores
    // ========================================================================

    /// Store `value` into the reference field at `offset` of `cell`,
    /// recording the edge if it points from outside into the nursery.
    ///
    /// # Safety
    ///
    /// `cell` must be live and `offset` one of its reference offsets.
    pub unsafe fn write_field(&mut self, cell: CellPtr, offset: usize, value: Value) {
        unsafe {
            cell.set_field(offset, value);
            if self.needs_barrier(cell, value) {
                self.store_buffer.put_value(cell.field_ptr(offset));
            }
        }
    }

    /// Store `value` into slot `index` of `cell` with a post barrier.
    ///
    /// # Safety
    ///
    /// `cell` must be live and `index` below its slot count.
    pub unsafe fn write_slot(&mut self, cell: CellPtr, index: usize, value: Value) {
        unsafe {
            cell.set_slot(index, value);
            if self.needs_barrier(cell, value) {
                self.store_buffer.put_slots(cell, SlotKind::Slots, index, 1);
            }
        }
    }

    /// Store `value` into element `index` of an array cell with a post
    /// barrier.
    ///
    /// # Safety
    ///
    /// `cell` must be a live array and `index` below its length.
    pub unsafe fn write_element(&mut self, cell: CellPtr, index: usize, value: Value) {
        unsafe {
            cell.set_element(index, value);
            if self.needs_barrier(cell, value) {
                self.store_buffer.put_slots(cell, SlotKind::Elements, index, 1);
            }
        }
    }

    fn needs_barrier(&self, cell: CellPtr, value: Value) -> bool {
        !self.nursery.is_inside(cell.addr())
            && value
                .as_cell()
                .is_some_and(|target| self.nursery.is_inside(target.addr()))
    }

    // ========================================================================
    // Collection
    // ========================================================================

    /// Run a minor collection.
    ///
    /// Returns `None` without doing anything if collection is suppressed,
    /// the nursery is disabled, or it is already empty. When pretenuring
    /// fires, hot types go to `pretenure_out` if given, else they are kept
    /// for [`Runtime::take_pretenure_candidates`].
    pub fn collect(
        &mut self,
        reason: CollectReason,
        pretenure_out: Option<&mut Vec<TypeId>>,
    ) -> Option<MinorMetrics> {
        minor::collect(self, reason, pretenure_out)
    }

    /// Run `f` with minor collection suppressed.
    ///
    /// Suppression is lifted when `f` returns or unwinds.
    pub fn with_gc_suppressed<R>(&mut self, f: impl FnOnce(&mut Self) -> R) -> R {
        self.gc_suppressed += 1;
        let mut guard = SuppressGuard(self);
        f(&mut *guard.0)
    }

    /// Returns `true` while inside [`Runtime::with_gc_suppressed`].
    #[must_use]
    pub const fn is_gc_suppressed(&self) -> bool {
        self.gc_suppressed > 0
    }

    /// Metrics of the most recent collection.
    #[must_use]
    pub const fn last_metrics(&self) -> Option<MinorMetrics> {
        self.last_metrics
    }

    /// Take the types reported by collections that had no output list.
    pub fn take_pretenure_candidates(&mut self) -> Vec<TypeId> {
        std::mem::take(&mut self.pretenure_candidates)
    }

    // ========================================================================
    // Components
    // ========================================================================

    /// The nursery.
    #[must_use]
    pub const fn nursery(&self) -> &Nursery {
        &self.nursery
    }

    /// The nursery, mutably.
    pub fn nursery_mut(&mut self) -> &mut Nursery {
        &mut self.nursery
    }

    /// The store buffer.
    #[must_use]
    pub const fn store_buffer(&self) -> &StoreBuffer {
        &self.store_buffer
    }

    /// The store buffer, mutably.
    pub fn store_buffer_mut(&mut self) -> &mut StoreBuffer {
        &mut self.store_buffer
    }

    /// The tenured heap.
    #[must_use]
    pub fn tenured(&self) -> &dyn TenuredAllocator {
        &*self.tenured
    }

    /// The global roots.
    #[must_use]
    pub const fn roots(&self) -> &RootTable {
        &self.roots
    }

    /// The global roots, mutably.
    pub fn roots_mut(&mut self) -> &mut RootTable {
        &mut self.roots
    }

    /// Register an extra root source, marked every cycle after the root
    /// table.
    pub fn add_root_source(&mut self, source: Box<dyn RootSource>) {
        self.sources.push(source);
    }

    /// Install the code cache notified after promotion.
    pub fn set_code_cache(&mut self, cache: Box<dyn CodeCache>) {
        self.code_cache = Some(cache);
    }
}

/// Lifts one level of collection suppression when dropped.
struct SuppressGuard<'a>(&'a mut Runtime);

impl Drop for SuppressGuard<'_> {
    fn drop(&mut self) {
        self.0.gc_suppressed -= 1;
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("id", &self.id)
            .field("nursery", &self.nursery)
            .field("store_buffer", &self.store_buffer)
            .field("tenured_bytes", &self.tenured.bytes_allocated())
            .field("roots", &self.roots.len())
            .field("total_collections", &self.total_collections)
            .finish_non_exhaustive()
    }
}

