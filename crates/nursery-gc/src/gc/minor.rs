//! One minor collection, start to finish.
//!
//! The cycle runs synchronously on the caller's thread:
//!
//! 1. bail out if suppressed, disabled or empty
//! 2. promote through the store buffer
//! 3. promote through the root table and every root source
//! 4. drain the promotion queue to a fixed point
//! 5. let the code cache repair cached addresses
//! 6. resize the nursery from the promotion rate
//! 7. report pretenuring candidates
//! 8. sweep huge buffers, reset the cursor and clear the store buffer
//! 9. disable the nursery if the tenured heap reached its limit

use std::time::Instant;

use crate::cell::TypeId;
use crate::gc::sizing::next_active_chunks;
use crate::gc::tenure::MinorTracer;
use crate::metrics::{record_metrics, MinorMetrics, PhaseTimer};
use crate::runtime::Runtime;
#[cfg(feature = "tracing")]
use crate::tracing::internal::{
    log_collection_end, log_nursery_disabled, log_pretenure, log_resize, trace_minor_gc,
    trace_phase, MinorPhase,
};
use crate::tracing::internal::next_gc_id;

/// Why a minor collection was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CollectReason {
    /// Explicit request by the embedder.
    Api,
    /// An allocation found every active chunk full.
    OutOfNursery,
    /// The store buffer reached its limit.
    FullStoreBuffer,
    /// The nursery must be emptied, e.g. before a major collection.
    EvictNursery,
}

impl CollectReason {
    /// Short name used in logs.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Api => "api",
            Self::OutOfNursery => "out_of_nursery",
            Self::FullStoreBuffer => "full_store_buffer",
            Self::EvictNursery => "evict_nursery",
        }
    }
}

#[allow(clippy::cast_precision_loss)]
fn ratio(numerator: usize, denominator: usize) -> f64 {
    if denominator == 0 {
        0.0
    } else {
        numerator as f64 / denominator as f64
    }
}

/// Run one minor collection over `rt`.
///
/// Hot types are appended to `pretenure_out` when given, otherwise kept on
/// the runtime for [`Runtime::take_pretenure_candidates`].
pub(crate) fn collect(
    rt: &mut Runtime,
    reason: CollectReason,
    pretenure_out: Option<&mut Vec<TypeId>>,
) -> Option<MinorMetrics> {
    if rt.gc_suppressed > 0 || !rt.nursery.is_enabled() || rt.nursery.is_empty() {
        return None;
    }

    let gc_id = next_gc_id();
    #[cfg(feature = "tracing")]
    let _span = trace_minor_gc(reason.as_str(), gc_id);
    #[cfg(not(feature = "tracing"))]
    let _ = gc_id;

    let start = Instant::now();
    let mut timer = PhaseTimer::new();

    let Runtime {
        nursery,
        store_buffer,
        tenured,
        types,
        roots,
        sources,
        code_cache,
        sampler,
        pretenure_candidates,
        ..
    } = rt;

    let nursery_used = nursery.used_bytes();
    let nursery_capacity = nursery.capacity();
    let chunks_before = nursery.active_chunks();
    let store_buffer_overflowed = store_buffer.is_full();

    nursery.begin_cycle();
    sampler.reset();

    let stats = {
        let mut tracer = MinorTracer::new(nursery, &mut **tenured, types);

        timer.start();
        {
            #[cfg(feature = "tracing")]
            let _phase = trace_phase(MinorPhase::Roots);
            store_buffer.mark_edges(&mut tracer);
            roots.mark_nursery_edges(&mut tracer);
            for source in sources.iter_mut() {
                source.mark_nursery_edges(&mut tracer);
            }
        }
        timer.end_roots();

        timer.start();
        {
            #[cfg(feature = "tracing")]
            let _phase = trace_phase(MinorPhase::Promote);
            tracer.drain(sampler);
        }
        timer.end_promote();

        tracer.stats()
    };
    debug_assert_eq!(nursery.ledger().pending_len(), 0);

    if let Some(cache) = code_cache.as_mut() {
        cache.fixup_after_minor_gc(nursery);
    }

    let config = *nursery.config();
    let promotion_rate = ratio(stats.promoted_bytes, nursery_capacity);
    let pretenure_triggered;
    {
        #[cfg(feature = "tracing")]
        let _phase = trace_phase(MinorPhase::Resize);

        let chunks_after = next_active_chunks(
            chunks_before,
            nursery.max_chunks(),
            promotion_rate,
            config.grow_threshold,
            config.shrink_threshold,
        );
        nursery.set_active_chunks(chunks_after);
        #[cfg(feature = "tracing")]
        log_resize(promotion_rate, chunks_before, chunks_after);

        pretenure_triggered = promotion_rate > config.pretenure_rate
            || reason == CollectReason::FullStoreBuffer
            || store_buffer_overflowed;
        if pretenure_triggered {
            let hot = sampler.hot_types(config.pretenure_count);
            #[cfg(feature = "tracing")]
            log_pretenure(hot.len());
            match pretenure_out {
                Some(out) => out.extend(hot),
                None => pretenure_candidates.extend(hot),
            }
        }
    }

    timer.start();
    let huge_buffers_freed = {
        #[cfg(feature = "tracing")]
        let _phase = trace_phase(MinorPhase::Sweep);
        let freed = nursery.sweep();
        store_buffer.clear();
        freed
    };
    timer.end_sweep();

    let nursery_disabled = tenured.is_near_limit();
    if nursery_disabled {
        nursery.disable();
        #[cfg(feature = "tracing")]
        log_nursery_disabled(tenured.bytes_allocated());
    }

    #[cfg(feature = "tracing")]
    log_collection_end(
        stats.promoted_objects,
        stats.promoted_bytes,
        huge_buffers_freed,
    );

    rt.total_collections += 1;
    let metrics = MinorMetrics {
        reason,
        duration: start.elapsed(),
        root_duration: timer.roots,
        promote_duration: timer.promote,
        sweep_duration: timer.sweep,
        objects_promoted: stats.promoted_objects,
        bytes_promoted: stats.promoted_bytes,
        nursery_used,
        nursery_capacity,
        promotion_rate,
        chunks_before,
        chunks_after: rt.nursery.active_chunks(),
        huge_buffers_freed,
        pretenure_triggered,
        nursery_disabled,
        total_collections: rt.total_collections,
    };
    record_metrics(&metrics);
    rt.last_metrics = Some(metrics);
    Some(metrics)
}
