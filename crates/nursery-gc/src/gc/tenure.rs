//! Promotion of nursery cells into tenured storage.
//!
//! [`MinorTracer`] is the promote-and-rewrite primitive handed to every root
//! source. Promoting a cell copies it once, records the move in the
//! forwarding ledger and queues the copy; [`MinorTracer::drain`] then scans
//! queued copies until no reachable nursery edge remains.

use std::alloc::{handle_alloc_error, Layout};
use std::ptr::{self, NonNull};

use crate::cell::{CellHeader, CellPtr, ObjectKind, TypeRegistry, Value, WORD};
use crate::gc::pretenure::PretenureSampler;
use crate::heap::{SizeClass, TenuredAllocator, MAX_SMALL_OBJECT_SIZE};
use crate::nursery::Nursery;

/// Counters accumulated by one cycle's promotions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleStats {
    /// Cells copied out of the nursery.
    pub promoted_objects: usize,
    /// Tenured block bytes plus freshly allocated out-of-line bytes.
    pub promoted_bytes: usize,
    /// Huge buffers whose ownership passed to a promoted cell.
    pub huge_transferred: usize,
}

/// Which array of a cell a store buffer range refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SlotKind {
    /// The slot array.
    Slots,
    /// The element array of an `Array` cell.
    Elements,
}

/// The promote-and-rewrite primitive.
pub struct MinorTracer<'a> {
    nursery: &'a mut Nursery,
    tenured: &'a mut dyn TenuredAllocator,
    types: &'a TypeRegistry,
    stats: CycleStats,
}

impl<'a> MinorTracer<'a> {
    pub(crate) fn new(
        nursery: &'a mut Nursery,
        tenured: &'a mut dyn TenuredAllocator,
        types: &'a TypeRegistry,
    ) -> Self {
        Self {
            nursery,
            tenured,
            types,
            stats: CycleStats::default(),
        }
    }

    /// The nursery being collected.
    #[must_use]
    pub fn nursery(&self) -> &Nursery {
        self.nursery
    }

    /// Counters so far.
    #[must_use]
    pub const fn stats(&self) -> CycleStats {
        self.stats
    }

    // ========================================================================
    // Edge tracing
    // ========================================================================

    /// Promote the cell `value` refers to, if it is in the nursery, and
    /// rewrite `value` to the new address.
    #[inline]
    pub fn trace_value(&mut self, value: &mut Value) {
        if let Some(cell) = value.as_cell() {
            if self.nursery.is_inside(cell.addr()) {
                *value = Value::from_cell(self.promote(cell));
            }
        }
    }

    /// Like [`MinorTracer::trace_value`] for a typed cell edge.
    #[inline]
    pub fn trace_cell(&mut self, cell: &mut CellPtr) {
        if self.nursery.is_inside(cell.addr()) {
            *cell = self.promote(*cell);
        }
    }

    /// Like [`MinorTracer::trace_cell`] for a raw, possibly null, edge.
    pub fn trace_raw_cell(&mut self, edge: &mut *mut CellHeader) {
        if let Some(mut cell) = NonNull::new(*edge).map(|ptr| unsafe { CellPtr::from_raw(ptr) }) {
            self.trace_cell(&mut cell);
            *edge = cell.as_ptr();
        }
    }

    /// Trace every reference held by `cell`.
    ///
    /// # Safety
    ///
    /// `cell` must be a live cell outside the nursery.
    pub unsafe fn trace_contents(&mut self, cell: CellPtr) {
        let types = self.types;
        // SAFETY: Caller guarantees the cell is live.
        unsafe {
            let info = types.get(cell.type_id());
            for &offset in &info.ref_offsets {
                self.trace_value(&mut *cell.field_ptr(offset));
            }
            let slots = cell.slots();
            for index in 0..cell.slot_count() {
                self.trace_value(&mut *slots.add(index));
            }
            if info.kind == ObjectKind::Array {
                let elements = cell.elements();
                for index in 0..cell.element_len() {
                    self.trace_value(&mut *elements.add(index));
                }
            }
        }
    }

    /// Trace `count` entries of `owner`'s slot or element array starting at
    /// `start`. The range is clamped to the live part of the array.
    ///
    /// # Safety
    ///
    /// `owner` must be a live cell outside the nursery.
    pub unsafe fn trace_range(
        &mut self,
        owner: CellPtr,
        kind: SlotKind,
        start: usize,
        count: usize,
    ) {
        // SAFETY: Caller guarantees the cell is live.
        unsafe {
            let (base, len) = match kind {
                SlotKind::Slots => (owner.slots(), owner.slot_count()),
                SlotKind::Elements => {
                    if self.types.get(owner.type_id()).kind != ObjectKind::Array {
                        return;
                    }
                    (owner.elements(), owner.element_len())
                }
            };
            let end = start.saturating_add(count).min(len);
            for index in start.min(end)..end {
                self.trace_value(&mut *base.add(index));
            }
        }
    }

    /// Scan promoted cells in promotion order until none are left.
    pub fn drain(&mut self, sampler: &mut PretenureSampler) {
        while let Some(cell) = self.nursery.ledger_mut().next_pending() {
            // SAFETY: Queued cells are tenured copies made this cycle.
            unsafe {
                sampler.record(cell.type_id());
                self.trace_contents(cell);
            }
        }
    }

    // ========================================================================
    // Promotion
    // ========================================================================

    /// Returns the tenured address of `cell`, copying it out of the nursery
    /// on first use in this cycle. Cells outside the nursery are returned
    /// unchanged.
    pub fn promote(&mut self, cell: CellPtr) -> CellPtr {
        if !self.nursery.is_inside(cell.addr()) {
            return cell;
        }
        if let Some(forwarded) = self.nursery.ledger().lookup(cell.addr()) {
            return forwarded;
        }
        // SAFETY: Unforwarded nursery cells reachable from roots are live.
        unsafe { self.move_to_tenured(cell) }
    }

    unsafe fn move_to_tenured(&mut self, cell: CellPtr) -> CellPtr {
        let types = self.types;
        let budget = self.nursery.config().inline_slot_budget;

        // SAFETY: Caller guarantees the cell is live.
        let (info, slot_count, old_slots, element_len, element_capacity, old_elements) = unsafe {
            (
                types.get(cell.type_id()),
                cell.slot_count(),
                cell.slots(),
                cell.element_len(),
                cell.element_capacity(),
                cell.elements(),
            )
        };

        // Arrays are right-sized to their length; byte buffers keep their
        // capacity.
        let wanted_capacity = match info.kind {
            ObjectKind::Plain => 0,
            ObjectKind::Array => element_len,
            ObjectKind::ByteBuffer => element_capacity,
        };
        let element_words = info.element_words(wanted_capacity);

        let mut size = info.fixed_size;
        let inline_slots = slot_count > 0
            && slot_count <= budget
            && size + slot_count * WORD <= MAX_SMALL_OBJECT_SIZE;
        let slots_offset = size;
        if inline_slots {
            size += slot_count * WORD;
        }
        let inline_elements =
            element_words > 0 && size + element_words * WORD <= MAX_SMALL_OBJECT_SIZE;
        let elements_offset = size;
        if inline_elements {
            size += element_words * WORD;
        }

        let class = SizeClass::for_size(size);
        let Some(block) = self.tenured.allocate(class) else {
            handle_alloc_error(
                Layout::from_size_align(class.bytes(), 16).unwrap_or(Layout::new::<CellHeader>()),
            );
        };
        self.stats.promoted_bytes += class.bytes();

        // SAFETY: `block` holds at least `size` bytes and does not overlap
        // the nursery.
        let new = unsafe {
            ptr::copy_nonoverlapping(cell.as_ptr().cast::<u8>(), block.as_ptr(), info.fixed_size);
            CellPtr::from_raw(block.cast())
        };

        let new_slots = if slot_count == 0 {
            ptr::null_mut()
        } else {
            let inline_dst = inline_slots
                .then(|| unsafe { block.as_ptr().add(slots_offset).cast::<Value>() });
            unsafe { self.move_buffer(old_slots, slot_count, slot_count, inline_dst) }.0
        };

        let (new_elements, new_capacity) = if element_words == 0 {
            (ptr::null_mut(), 0)
        } else {
            let inline_dst = inline_elements
                .then(|| unsafe { block.as_ptr().add(elements_offset).cast::<Value>() });
            let (moved, kept) = unsafe {
                self.move_buffer(old_elements, element_words, element_words, inline_dst)
            };
            (moved, if kept { element_capacity } else { wanted_capacity })
        };

        // SAFETY: `new` is a fully copied cell.
        unsafe {
            new.set_slots(new_slots, slot_count);
            new.set_elements(new_elements, new_capacity);
            if info.kind == ObjectKind::Array && new_capacity == 0 {
                new.set_element_len(0);
            }
        }

        self.nursery.ledger_mut().forward(cell, new);
        self.stats.promoted_objects += 1;
        new
    }

    /// Move one out-of-line array of a promoted cell.
    ///
    /// Copies `copy_words` words to `inline_dst`, or to a fresh buffer of
    /// `alloc_words` words. A huge buffer that does not fit inline is
    /// handed over as is. Returns the new array and whether the original
    /// buffer was kept.
    unsafe fn move_buffer(
        &mut self,
        old: *mut Value,
        copy_words: usize,
        alloc_words: usize,
        inline_dst: Option<*mut Value>,
    ) -> (*mut Value, bool) {
        if old.is_null() {
            return (ptr::null_mut(), false);
        }
        let old_addr = old as usize;

        if !self.nursery.is_inside(old_addr) {
            let Some(words) = self.nursery.unregister_huge(old_addr) else {
                // Not ours to move.
                return (old, true);
            };
            let Some(dst) = inline_dst else {
                self.stats.huge_transferred += 1;
                return (old, true);
            };
            // SAFETY: The huge buffer holds at least `copy_words` words and
            // stays allocated until the sweep.
            unsafe { ptr::copy_nonoverlapping(old, dst, copy_words) };
            if copy_words > 0 {
                self.nursery
                    .ledger_mut()
                    .forward_buffer(old_addr, dst as usize, copy_words * WORD);
            }
            self.nursery.defer_free(old_addr, words);
            return (dst, false);
        }

        let dst = match inline_dst {
            Some(dst) => dst,
            None => {
                let Some(fresh) = self.nursery.buffers().alloc(alloc_words) else {
                    handle_alloc_error(
                        Layout::array::<Value>(alloc_words).unwrap_or(Layout::new::<Value>()),
                    );
                };
                self.stats.promoted_bytes += alloc_words * WORD;
                fresh.as_ptr()
            }
        };
        // SAFETY: Source is nursery memory, destination is tenured or heap
        // memory; both hold `copy_words` words.
        unsafe { ptr::copy_nonoverlapping(old, dst, copy_words) };
        if copy_words > 0 {
            self.nursery
                .ledger_mut()
                .forward_buffer(old_addr, dst as usize, copy_words * WORD);
        }
        (dst, false)
    }
}
