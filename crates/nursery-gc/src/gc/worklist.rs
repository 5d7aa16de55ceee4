//! Forwarding ledger and promotion worklist.
//!
//! Promotion never rewrites evacuated nursery memory. Instead the ledger
//! records `old -> new` for every promoted cell and every relocated
//! out-of-line buffer, and queues each promoted cell for scanning. A cell is
//! copied at most once per cycle because [`ForwardingLedger::lookup`] is
//! consulted before copying.
//!
//! # Invariants
//!
//! - Every cell in the pending queue has exactly one entry in `cells`.
//! - Keys of `cells` are nursery addresses. Keys of `buffers` are nursery
//!   addresses or huge buffers absorbed into a promoted cell.
//! - Values never point into the nursery.

use std::collections::{BTreeMap, HashMap, VecDeque};

use crate::cell::CellPtr;

/// Side tables mapping evacuated nursery addresses to their new homes.
#[derive(Debug, Default)]
pub struct ForwardingLedger {
    cells: HashMap<usize, CellPtr>,
    /// Old buffer start -> (new buffer start, byte length).
    buffers: BTreeMap<usize, (usize, usize)>,
    pending: VecDeque<CellPtr>,
}

impl ForwardingLedger {
    /// Create an empty ledger.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that the cell at `old` now lives at `new` and queue `new` for
    /// scanning.
    pub fn forward(&mut self, old: CellPtr, new: CellPtr) {
        let previous = self.cells.insert(old.addr(), new);
        debug_assert!(previous.is_none(), "{old:?} promoted twice");
        self.pending.push_back(new);
    }

    /// New location of the cell that used to live at `addr`.
    #[must_use]
    #[inline]
    pub fn lookup(&self, addr: usize) -> Option<CellPtr> {
        self.cells.get(&addr).copied()
    }

    /// Next promoted cell to scan, in promotion order.
    pub fn next_pending(&mut self) -> Option<CellPtr> {
        self.pending.pop_front()
    }

    /// Number of promoted cells not yet scanned.
    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Record that the `bytes` long buffer at `old` was copied to `new`.
    pub fn forward_buffer(&mut self, old: usize, new: usize, bytes: usize) {
        self.buffers.insert(old, (new, bytes));
    }

    /// New location of `addr`, which may point anywhere inside a forwarded
    /// buffer.
    #[must_use]
    pub fn buffer_lookup(&self, addr: usize) -> Option<usize> {
        let (&old, &(new, bytes)) = self.buffers.range(..=addr).next_back()?;
        (addr < old + bytes).then(|| new + (addr - old))
    }

    /// Number of forwarded cells.
    #[must_use]
    pub fn len(&self) -> usize {
        self.cells.len()
    }

    /// Returns `true` if nothing has been forwarded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.cells.is_empty() && self.buffers.is_empty() && self.pending.is_empty()
    }

    /// Forget every record. Capacity is kept for the next cycle.
    pub fn clear(&mut self) {
        self.cells.clear();
        self.buffers.clear();
        self.pending.clear();
    }
}
