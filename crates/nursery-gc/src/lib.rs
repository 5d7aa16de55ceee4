//! A bump-allocated young generation with a copying minor collector.
//!
//! `nursery-gc` gives a managed runtime near-free allocation for short-lived
//! cells and reclaims them by copying the survivors into tenured storage.
//!
//! # Overview
//!
//! - [`Nursery`]: chunked bump allocator plus the registry of huge
//!   out-of-line buffers owned by nursery cells
//! - [`Runtime`]: the context object owning the nursery, the
//!   [`StoreBuffer`], the tenured heap, the type registry and the roots
//! - [`Runtime::collect`]: one minor collection; survivors are promoted
//!   breadth first through a forwarding side table, the nursery is resized
//!   from the promotion rate, and hot types are reported for pretenuring
//!
//! # Quick Start
//!
//! ```
//! use nursery_gc::{CollectReason, NurseryConfig, ObjectKind, Runtime, Value};
//!
//! let mut rt = Runtime::new(NurseryConfig::default()).unwrap();
//! // Header plus two reference fields.
//! let node = rt.register_type("Node", ObjectKind::Plain, 48, &[32, 40]);
//!
//! let a = rt.new_object(node, 0);
//! let b = rt.new_object(node, 0);
//! unsafe { a.set_field(32, Value::from_cell(b)) };
//! let root = rt.roots_mut().add(Value::from_cell(a));
//!
//! rt.collect(CollectReason::Api, None);
//!
//! let a = rt.roots().get(root).and_then(Value::as_cell).unwrap();
//! assert!(!rt.nursery().is_inside(a.addr()));
//! assert!(rt.nursery().is_empty());
//! ```
//!
//! # Thread Safety
//!
//! A [`Runtime`] is single threaded. A collection runs synchronously on the
//! mutator's thread and never overlaps allocation.

#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod buffers;
pub mod cell;
pub mod chunk;
pub mod config;
pub mod gc;
pub mod heap;
pub mod metrics;
mod nursery;
mod roots;
mod runtime;
pub mod store_buffer;
mod tracing;

// Re-export public API
pub use buffers::{BufferAllocator, SystemBuffers};
pub use cell::{CellHeader, CellPtr, ObjectKind, TypeId, TypeInfo, TypeRegistry, Value};
pub use config::NurseryConfig;
pub use gc::{CollectReason, CycleStats, MinorTracer, SlotKind};
pub use heap::{SizeClass, TenuredAllocator, TenuredHeap};
pub use metrics::{gc_history, global_metrics, GcHistory, GlobalMetrics, MinorMetrics};
pub use nursery::{Nursery, MIN_CELL_SIZE};
pub use roots::{CodeCache, RootId, RootSource, RootTable};
pub use runtime::Runtime;
pub use store_buffer::{GenericEdge, StoreBuffer};
pub use crate::tracing::GcId;

#[cfg(any(test, feature = "test-util"))]
pub use nursery::POISON_BYTE;

/// Helpers for stress testing embedders.
#[cfg(any(test, feature = "test-util"))]
pub mod test_util {
    use crate::{CollectReason, MinorMetrics, Runtime};

    /// Forces a minor collection after every `period` allocations.
    ///
    /// Call [`StressCollector::after_allocation`] after each allocation to
    /// shake out missing roots and barriers.
    #[derive(Debug, Clone)]
    pub struct StressCollector {
        period: usize,
        count: usize,
        collections: usize,
    }

    impl StressCollector {
        /// Collect after every `period` allocations.
        ///
        /// # Panics
        ///
        /// Panics if `period` is zero.
        #[must_use]
        pub fn new(period: usize) -> Self {
            assert!(period > 0, "period must be positive");
            Self {
                period,
                count: 0,
                collections: 0,
            }
        }

        /// Count one allocation and collect if the period elapsed.
        pub fn after_allocation(&mut self, rt: &mut Runtime) -> Option<MinorMetrics> {
            self.count += 1;
            if self.count < self.period {
                return None;
            }
            self.count = 0;
            let metrics = rt.collect(CollectReason::Api, None);
            if metrics.is_some() {
                self.collections += 1;
            }
            metrics
        }

        /// Number of collections this helper triggered.
        #[must_use]
        pub const fn collections(&self) -> usize {
            self.collections
        }
    }
}
