//! Collector tracing support.
//!
//! When the `tracing` feature is enabled, every minor collection opens a
//! `minor_gc` span and one span per phase, and emits `debug!` events for the
//! resize and pretenuring decisions. Without the feature these helpers
//! compile to nothing.

#[cfg(feature = "tracing")]
pub mod internal {
    use std::sync::atomic::{AtomicU64, Ordering};
    use tracing::{span, Level};

    /// Phases of a minor collection.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum MinorPhase {
        /// Store buffer, root table and root sources.
        Roots,
        /// Draining the promotion worklist.
        Promote,
        /// Adaptive sizing and pretenuring.
        Resize,
        /// Freeing dead huge buffers and resetting the cursor.
        Sweep,
    }

    /// Stable identifier correlating all events of one collection.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct GcId(pub u64);

    static NEXT_GC_ID: AtomicU64 = AtomicU64::new(1);

    /// Generate the next unique GC ID.
    pub fn next_gc_id() -> GcId {
        GcId(NEXT_GC_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Create a span for the entire collection.
    pub fn trace_minor_gc(reason: &str, gc_id: GcId) -> span::EnteredSpan {
        span!(Level::DEBUG, "minor_gc", reason = reason, gc_id = gc_id.0).entered()
    }

    /// Create a span for one phase.
    pub fn trace_phase(phase: MinorPhase) -> span::EnteredSpan {
        span!(Level::DEBUG, "minor_gc_phase", phase = ?phase).entered()
    }

    /// Log the resize decision.
    pub fn log_resize(promotion_rate: f64, before: usize, after: usize) {
        tracing::debug!(promotion_rate, before, after, "nursery_resize");
    }

    /// Log reported pretenuring candidates.
    pub fn log_pretenure(candidates: usize) {
        tracing::debug!(candidates, "pretenure_candidates");
    }

    /// Log the end of a collection.
    pub fn log_collection_end(objects_promoted: usize, bytes_promoted: usize, huge_freed: usize) {
        tracing::debug!(objects_promoted, bytes_promoted, huge_freed, "minor_gc_end");
    }

    /// Log that the safety valve disabled the nursery.
    pub fn log_nursery_disabled(tenured_bytes: usize) {
        tracing::warn!(tenured_bytes, "tenured heap near limit; nursery disabled");
    }
}

#[cfg(not(feature = "tracing"))]
pub mod internal {
    /// Stub type when tracing is disabled.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct GcId(pub u64);

    /// Stub function when tracing is disabled.
    pub const fn next_gc_id() -> GcId {
        GcId(0)
    }
}

pub use internal::GcId;
