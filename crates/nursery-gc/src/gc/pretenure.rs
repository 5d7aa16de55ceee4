//! Lossy per-type promotion sampling.

use crate::cell::TypeId;

/// Number of entries in the sample table.
pub const SAMPLE_ENTRIES: usize = 16;

#[derive(Debug, Clone, Copy, Default)]
struct Entry {
    type_id: Option<TypeId>,
    count: usize,
}

/// Fixed-size table counting promotions per type during one cycle.
///
/// A type whose slot is held by a different type is not counted. Recording
/// never allocates.
#[derive(Debug, Default)]
pub struct PretenureSampler {
    entries: [Entry; SAMPLE_ENTRIES],
}

const fn slot_for(type_id: TypeId) -> usize {
    (type_id.0.wrapping_mul(0x9E37_79B9) >> 16) as usize % SAMPLE_ENTRIES
}

impl PretenureSampler {
    /// Create an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one promotion of `type_id`.
    #[inline]
    pub fn record(&mut self, type_id: TypeId) {
        let entry = &mut self.entries[slot_for(type_id)];
        match entry.type_id {
            Some(current) if current == type_id => entry.count += 1,
            Some(_) => {}
            None => {
                entry.type_id = Some(type_id);
                entry.count = 1;
            }
        }
    }

    /// Sampled promotions of `type_id`. Zero if its slot belongs to another
    /// type.
    #[must_use]
    pub fn count_for(&self, type_id: TypeId) -> usize {
        let entry = &self.entries[slot_for(type_id)];
        if entry.type_id == Some(type_id) {
            entry.count
        } else {
            0
        }
    }

    /// Types promoted more than `threshold` times.
    #[must_use]
    pub fn hot_types(&self, threshold: usize) -> Vec<TypeId> {
        self.entries
            .iter()
            .filter(|entry| entry.count > threshold)
            .filter_map(|entry| entry.type_id)
            .collect()
    }

    /// Forget all samples.
    pub fn reset(&mut self) {
        self.entries = [Entry::default(); SAMPLE_ENTRIES];
    }
}
