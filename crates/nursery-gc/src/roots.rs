//! Root tracking.
//!
//! The [`RootTable`] holds the runtime's global roots. Other subsystems that
//! own references into the heap (a debugger, an inspector, caches) implement
//! [`RootSource`] and are asked to mark their edges every cycle. A JIT that
//! caches raw addresses implements [`CodeCache`] and is told when a cycle
//! has moved objects.

use crate::cell::Value;
use crate::gc::tenure::MinorTracer;
use crate::nursery::Nursery;

// ============================================================================
// RootTable - Global roots
// ============================================================================

/// Handle to an entry of a [`RootTable`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RootId(usize);

/// Global roots, addressed by [`RootId`].
///
/// Entries are rewritten in place when a collection moves the cell they
/// refer to, so always read a root back through [`RootTable::get`] after a
/// collection.
#[derive(Debug, Default)]
pub struct RootTable {
    /// Root values; `None` marks a free entry.
    roots: Vec<Option<Value>>,
    /// Indices of free entries.
    free: Vec<usize>,
}

impl RootTable {
    /// Create a new empty table.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            roots: Vec::new(),
            free: Vec::new(),
        }
    }

    /// Register a new root.
    pub fn add(&mut self, value: Value) -> RootId {
        if let Some(index) = self.free.pop() {
            self.roots[index] = Some(value);
            RootId(index)
        } else {
            self.roots.push(Some(value));
            RootId(self.roots.len() - 1)
        }
    }

    /// Current value of a root, or `None` if it was removed.
    #[must_use]
    pub fn get(&self, id: RootId) -> Option<Value> {
        self.roots.get(id.0).copied().flatten()
    }

    /// Overwrite a live root.
    ///
    /// # Panics
    ///
    /// Panics if `id` was removed.
    pub fn set(&mut self, id: RootId, value: Value) {
        let entry = &mut self.roots[id.0];
        assert!(entry.is_some(), "root {id:?} was removed");
        *entry = Some(value);
    }

    /// Unregister a root, returning its last value.
    pub fn remove(&mut self, id: RootId) -> Option<Value> {
        let value = self.roots.get_mut(id.0)?.take()?;
        self.free.push(id.0);
        Some(value)
    }

    /// Get the number of live roots.
    #[must_use]
    pub fn len(&self) -> usize {
        self.roots.len() - self.free.len()
    }

    /// Check if there are no live roots.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Iterate over all live roots.
    pub fn iter(&self) -> impl Iterator<Item = Value> + '_ {
        self.roots.iter().filter_map(|root| *root)
    }

    /// Promote every root that refers into the nursery.
    pub fn mark_nursery_edges(&mut self, tracer: &mut MinorTracer<'_>) {
        for value in self.roots.iter_mut().flatten() {
            tracer.trace_value(value);
        }
    }
}

// ============================================================================
// Collaborator traits
// ============================================================================

/// A subsystem holding references that must keep nursery cells alive.
pub trait RootSource {
    /// Pass every reference this source owns to `tracer` and store back the
    /// rewritten value.
    fn mark_nursery_edges(&mut self, tracer: &mut MinorTracer<'_>);
}

/// A code cache holding raw addresses of cells or of their buffers.
pub trait CodeCache {
    /// Called once per cycle after every live cell has been promoted and
    /// before the nursery is swept. Use [`Nursery::forwarded_address`] and
    /// [`Nursery::forward_buffer_pointer`] to repair cached addresses.
    fn fixup_after_minor_gc(&mut self, nursery: &Nursery);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_get_remove() {
        let mut roots = RootTable::new();
        let a = roots.add(Value::from_int(1));
        let b = roots.add(Value::from_int(2));
        assert_eq!(roots.len(), 2);
        assert_eq!(roots.get(b), Some(Value::from_int(2)));

        assert_eq!(roots.remove(a), Some(Value::from_int(1)));
        assert_eq!(roots.remove(a), None);
        assert_eq!(roots.get(a), None);
        assert_eq!(roots.len(), 1);

        // Freed entries are reused.
        let c = roots.add(Value::NULL);
        assert_eq!(c, a);
        assert_eq!(roots.iter().count(), 2);
    }

    #[test]
    fn test_set() {
        let mut roots = RootTable::new();
        let a = roots.add(Value::NULL);
        roots.set(a, Value::from_int(5));
        assert_eq!(roots.get(a), Some(Value::from_int(5)));
    }

    #[test]
    #[should_panic(expected = "was removed")]
    fn test_set_removed_panics() {
        let mut roots = RootTable::new();
        let a = roots.add(Value::NULL);
        roots.remove(a);
        roots.set(a, Value::NULL);
    }
}
