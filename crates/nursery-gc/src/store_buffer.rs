//! Remembered set of tenured-to-nursery edges.
//!
//! Write barriers record the *location* of every edge that may point from
//! outside the nursery into it. Each kind of location has its own
//! deduplicated set. A minor collection traces every recorded location that
//! is not itself inside the nursery and then clears the buffer.

use std::collections::HashSet;
use std::fmt;

use crate::cell::{CellHeader, CellPtr, Value};
use crate::gc::tenure::{MinorTracer, SlotKind};

/// Number of recorded edges after which the buffer reports itself full.
pub const DEFAULT_STORE_BUFFER_LIMIT: usize = 16 * 1024;

/// A range of a cell's slot or element array.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlotsEdge {
    /// The tenured cell owning the array.
    pub owner: CellPtr,
    /// Which array.
    pub kind: SlotKind,
    /// First index.
    pub start: usize,
    /// Number of entries.
    pub count: usize,
}

/// An edge the collector cannot describe structurally.
pub trait GenericEdge {
    /// Trace the nursery references behind this edge.
    fn trace(&mut self, tracer: &mut MinorTracer<'_>);
}

/// The store buffer.
pub struct StoreBuffer {
    values: HashSet<*mut Value>,
    cells: HashSet<*mut *mut CellHeader>,
    slots: HashSet<SlotsEdge>,
    whole_cells: HashSet<CellPtr>,
    relocatable_values: HashSet<*mut Value>,
    relocatable_cells: HashSet<*mut *mut CellHeader>,
    generic: Vec<Box<dyn GenericEdge>>,
    limit: usize,
    overflowed: bool,
}

impl Default for StoreBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl StoreBuffer {
    /// Create an empty buffer with the default limit.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity_limit(DEFAULT_STORE_BUFFER_LIMIT)
    }

    /// Create an empty buffer that overflows after `limit` entries.
    #[must_use]
    pub fn with_capacity_limit(limit: usize) -> Self {
        Self {
            values: HashSet::new(),
            cells: HashSet::new(),
            slots: HashSet::new(),
            whole_cells: HashSet::new(),
            relocatable_values: HashSet::new(),
            relocatable_cells: HashSet::new(),
            generic: Vec::new(),
            limit,
            overflowed: false,
        }
    }

    fn note_insert(&mut self) {
        if self.len() >= self.limit {
            self.overflowed = true;
        }
    }

    /// Record a `Value` location.
    ///
    /// # Safety
    ///
    /// `edge` must stay valid until the next collection or until removed.
    pub unsafe fn put_value(&mut self, edge: *mut Value) {
        self.values.insert(edge);
        self.note_insert();
    }

    /// Record a raw cell pointer location.
    ///
    /// # Safety
    ///
    /// See [`StoreBuffer::put_value`].
    pub unsafe fn put_cell(&mut self, edge: *mut *mut CellHeader) {
        self.cells.insert(edge);
        self.note_insert();
    }

    /// Record `count` entries of `owner`'s slot or element array.
    ///
    /// # Safety
    ///
    /// `owner` must be a tenured cell that stays live until the next
    /// collection.
    pub unsafe fn put_slots(&mut self, owner: CellPtr, kind: SlotKind, start: usize, count: usize) {
        self.slots.insert(SlotsEdge {
            owner,
            kind,
            start,
            count,
        });
        self.note_insert();
    }

    /// Record every reference held by `cell`.
    ///
    /// # Safety
    ///
    /// `cell` must be a tenured cell that stays live until the next
    /// collection.
    pub unsafe fn put_whole_cell(&mut self, cell: CellPtr) {
        self.whole_cells.insert(cell);
        self.note_insert();
    }

    /// Record a `Value` location that may later be overwritten or freed.
    ///
    /// # Safety
    ///
    /// The location must stay valid until removed with
    /// [`StoreBuffer::remove_relocatable_value`] or the next collection.
    pub unsafe fn put_relocatable_value(&mut self, edge: *mut Value) {
        self.relocatable_values.insert(edge);
        self.note_insert();
    }

    /// Forget a relocatable `Value` location.
    pub fn remove_relocatable_value(&mut self, edge: *mut Value) {
        self.relocatable_values.remove(&edge);
    }

    /// Record a raw cell pointer location that may later be freed.
    ///
    /// # Safety
    ///
    /// See [`StoreBuffer::put_relocatable_value`].
    pub unsafe fn put_relocatable_cell(&mut self, edge: *mut *mut CellHeader) {
        self.relocatable_cells.insert(edge);
        self.note_insert();
    }

    /// Forget a relocatable cell pointer location.
    pub fn remove_relocatable_cell(&mut self, edge: *mut *mut CellHeader) {
        self.relocatable_cells.remove(&edge);
    }

    /// Record an opaque edge.
    pub fn put_generic(&mut self, edge: Box<dyn GenericEdge>) {
        self.generic.push(edge);
        self.note_insert();
    }

    /// Total recorded entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
            + self.cells.len()
            + self.slots.len()
            + self.whole_cells.len()
            + self.relocatable_values.len()
            + self.relocatable_cells.len()
            + self.generic.len()
    }

    /// Returns `true` if nothing is recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns `true` once the limit was reached since the last clear.
    #[must_use]
    pub const fn is_full(&self) -> bool {
        self.overflowed
    }

    /// Drop every entry.
    pub fn clear(&mut self) {
        self.values.clear();
        self.cells.clear();
        self.slots.clear();
        self.whole_cells.clear();
        self.relocatable_values.clear();
        self.relocatable_cells.clear();
        self.generic.clear();
        self.overflowed = false;
    }

    /// Promote through every recorded edge. Locations inside the nursery
    /// are skipped; their owners are either promoted and rescanned or dead.
    pub fn mark_edges(&mut self, tracer: &mut MinorTracer<'_>) {
        let outside = |tracer: &MinorTracer<'_>, addr: usize| !tracer.nursery().is_inside(addr);

        // SAFETY: Put operations require recorded locations to stay valid
        // until the collection.
        unsafe {
            for &edge in self.values.iter().chain(&self.relocatable_values) {
                if outside(tracer, edge as usize) {
                    tracer.trace_value(&mut *edge);
                }
            }
            for &edge in self.cells.iter().chain(&self.relocatable_cells) {
                if outside(tracer, edge as usize) {
                    tracer.trace_raw_cell(&mut *edge);
                }
            }
            for edge in &self.slots {
                if outside(tracer, edge.owner.addr()) {
                    tracer.trace_range(edge.owner, edge.kind, edge.start, edge.count);
                }
            }
            for &cell in &self.whole_cells {
                if outside(tracer, cell.addr()) {
                    tracer.trace_contents(cell);
                }
            }
        }
        for edge in &mut self.generic {
            edge.trace(tracer);
        }
    }
}

impl fmt::Debug for StoreBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreBuffer")
            .field("values", &self.values.len())
            .field("cells", &self.cells.len())
            .field("slots", &self.slots.len())
            .field("whole_cells", &self.whole_cells.len())
            .field("relocatable_values", &self.relocatable_values.len())
            .field("relocatable_cells", &self.relocatable_cells.len())
            .field("generic", &self.generic.len())
            .field("overflowed", &self.overflowed)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entries_are_deduplicated() {
        let mut buffer = StoreBuffer::new();
        let mut slot = Value::NULL;
        unsafe {
            buffer.put_value(&mut slot);
            buffer.put_value(&mut slot);
        }
        assert_eq!(buffer.len(), 1);
    }

    #[test]
    fn test_overflow_and_clear() {
        let mut buffer = StoreBuffer::with_capacity_limit(2);
        let mut a = Value::NULL;
        let mut b = Value::NULL;
        unsafe { buffer.put_value(&mut a) };
        assert!(!buffer.is_full());
        unsafe { buffer.put_relocatable_value(&mut b) };
        assert!(buffer.is_full());

        buffer.clear();
        assert!(buffer.is_empty());
        assert!(!buffer.is_full());
    }

    #[test]
    fn test_remove_relocatable() {
        let mut buffer = StoreBuffer::new();
        let mut a = Value::NULL;
        let mut p: *mut CellHeader = std::ptr::null_mut();
        unsafe {
            buffer.put_relocatable_value(&mut a);
            buffer.put_relocatable_cell(&mut p);
        }
        assert_eq!(buffer.len(), 2);
        buffer.remove_relocatable_value(&mut a);
        buffer.remove_relocatable_cell(&mut p);
        assert!(buffer.is_empty());
    }
}
