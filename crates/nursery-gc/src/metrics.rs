//! Minor collection metrics and statistics.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{const_mutex, Mutex};

use crate::gc::CollectReason;

/// Statistics from one minor collection.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MinorMetrics {
    /// Why the collection ran.
    pub reason: CollectReason,
    /// Duration of the whole collection.
    pub duration: Duration,
    /// Duration of root discovery (store buffer, roots, root sources).
    pub root_duration: Duration,
    /// Duration of the fixed-point promotion phase.
    pub promote_duration: Duration,
    /// Duration of the sweep phase.
    pub sweep_duration: Duration,
    /// Number of cells promoted.
    pub objects_promoted: usize,
    /// Bytes promoted, including fresh out-of-line buffers.
    pub bytes_promoted: usize,
    /// Nursery bytes in use when the collection started.
    pub nursery_used: usize,
    /// Nursery capacity when the collection started.
    pub nursery_capacity: usize,
    /// `bytes_promoted / nursery_capacity`.
    pub promotion_rate: f64,
    /// Active chunks before resizing.
    pub chunks_before: usize,
    /// Active chunks after resizing.
    pub chunks_after: usize,
    /// Huge buffers freed by the sweep.
    pub huge_buffers_freed: usize,
    /// Whether pretenuring candidates were computed.
    pub pretenure_triggered: bool,
    /// Whether the nursery was disabled because the tenured heap is full.
    pub nursery_disabled: bool,
    /// Total minor collections run by this runtime, including this one.
    pub total_collections: usize,
}

impl Default for MinorMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl MinorMetrics {
    /// Create a new `MinorMetrics` with all fields set to zero/defaults.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            reason: CollectReason::Api,
            duration: Duration::ZERO,
            root_duration: Duration::ZERO,
            promote_duration: Duration::ZERO,
            sweep_duration: Duration::ZERO,
            objects_promoted: 0,
            bytes_promoted: 0,
            nursery_used: 0,
            nursery_capacity: 0,
            promotion_rate: 0.0,
            chunks_before: 0,
            chunks_after: 0,
            huge_buffers_freed: 0,
            pretenure_triggered: false,
            nursery_disabled: false,
            total_collections: 0,
        }
    }
}

/// Internal helper for capturing phase durations.
///
/// # Example
///
/// ```
/// use nursery_gc::metrics::PhaseTimer;
///
/// let mut timer = PhaseTimer::new();
/// timer.start();
/// // ... root discovery ...
/// timer.end_roots();
/// timer.start();
/// // ... promotion ...
/// timer.end_promote();
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct PhaseTimer {
    /// Root discovery time.
    pub roots: Duration,
    /// Promotion time.
    pub promote: Duration,
    /// Sweep time.
    pub sweep: Duration,
    current_start: Option<Instant>,
}

impl PhaseTimer {
    /// Create a new `PhaseTimer` with all durations set to zero.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            roots: Duration::ZERO,
            promote: Duration::ZERO,
            sweep: Duration::ZERO,
            current_start: None,
        }
    }

    /// Start timing a phase.
    pub fn start(&mut self) {
        self.current_start = Some(Instant::now());
    }

    fn take(&mut self) -> Duration {
        self.current_start
            .take()
            .map_or(Duration::ZERO, |start| start.elapsed())
    }

    /// End the root phase and record its duration.
    pub fn end_roots(&mut self) {
        self.roots = self.take();
    }

    /// End the promotion phase and record its duration.
    pub fn end_promote(&mut self) {
        self.promote = self.take();
    }

    /// End the sweep phase and record its duration.
    pub fn end_sweep(&mut self) {
        self.sweep = self.take();
    }
}

/// Process-level cumulative minor collection statistics.
///
/// # Example
///
/// ```
/// use nursery_gc::global_metrics;
///
/// let metrics = global_metrics();
/// println!("Minor collections: {}", metrics.total_collections());
/// ```
#[derive(Debug)]
pub struct GlobalMetrics {
    collections: AtomicUsize,
    objects_promoted: AtomicUsize,
    bytes_promoted: AtomicUsize,
    pause_ns: AtomicU64,
    pretenure_triggers: AtomicUsize,
    nursery_disables: AtomicUsize,
}

impl Default for GlobalMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl GlobalMetrics {
    /// Create a new `GlobalMetrics` with all counters initialized to zero.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            collections: AtomicUsize::new(0),
            objects_promoted: AtomicUsize::new(0),
            bytes_promoted: AtomicUsize::new(0),
            pause_ns: AtomicU64::new(0),
            pretenure_triggers: AtomicUsize::new(0),
            nursery_disables: AtomicUsize::new(0),
        }
    }

    /// Returns the total number of minor collections performed.
    #[inline]
    #[must_use]
    pub fn total_collections(&self) -> usize {
        self.collections.load(Ordering::Relaxed)
    }

    /// Returns the total number of cells promoted.
    #[inline]
    #[must_use]
    pub fn total_objects_promoted(&self) -> usize {
        self.objects_promoted.load(Ordering::Relaxed)
    }

    /// Returns the total number of bytes promoted.
    #[inline]
    #[must_use]
    pub fn total_bytes_promoted(&self) -> usize {
        self.bytes_promoted.load(Ordering::Relaxed)
    }

    /// Returns the total pause time in nanoseconds.
    #[inline]
    #[must_use]
    pub fn total_pause_ns(&self) -> u64 {
        self.pause_ns.load(Ordering::Relaxed)
    }

    /// Returns how many collections computed pretenuring candidates.
    #[inline]
    #[must_use]
    pub fn total_pretenure_triggers(&self) -> usize {
        self.pretenure_triggers.load(Ordering::Relaxed)
    }

    /// Returns how many collections disabled the nursery.
    #[inline]
    #[must_use]
    pub fn total_nursery_disables(&self) -> usize {
        self.nursery_disables.load(Ordering::Relaxed)
    }
}

static GLOBAL_METRICS: GlobalMetrics = GlobalMetrics::new();

/// Get the global cumulative minor collection metrics.
#[must_use]
pub fn global_metrics() -> &'static GlobalMetrics {
    &GLOBAL_METRICS
}

/// Ring buffer size for the collection history.
const HISTORY_SIZE: usize = 64;

struct HistoryRing {
    buffer: [MinorMetrics; HISTORY_SIZE],
    write_idx: usize,
}

/// Fixed-size ring buffer of recent [`MinorMetrics`] snapshots, shared by
/// every runtime in the process.
///
/// # Example
///
/// ```
/// use nursery_gc::gc_history;
///
/// let history = gc_history();
/// println!("Average pause (last 10): {:?}", history.average_pause_time(10));
/// ```
pub struct GcHistory {
    ring: Mutex<HistoryRing>,
}

impl std::fmt::Debug for GcHistory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GcHistory")
            .field("total_recorded", &self.total_recorded())
            .finish()
    }
}

impl Default for GcHistory {
    fn default() -> Self {
        Self::new()
    }
}

impl GcHistory {
    /// Create a new `GcHistory` with an empty buffer.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            ring: const_mutex(HistoryRing {
                buffer: [MinorMetrics::new(); HISTORY_SIZE],
                write_idx: 0,
            }),
        }
    }

    fn push(&self, metrics: MinorMetrics) {
        let mut ring = self.ring.lock();
        let idx = ring.write_idx;
        ring.buffer[idx % HISTORY_SIZE] = metrics;
        ring.write_idx += 1;
    }

    /// Get the total number of metrics recorded.
    ///
    /// This may exceed the buffer size.
    #[must_use]
    pub fn total_recorded(&self) -> usize {
        self.ring.lock().write_idx
    }

    /// Get the most recent `n` snapshots, oldest first.
    #[must_use]
    pub fn recent(&self, n: usize) -> Vec<MinorMetrics> {
        let ring = self.ring.lock();
        let total = ring.write_idx;
        let n = n.min(HISTORY_SIZE).min(total);
        (total - n..total)
            .map(|i| ring.buffer[i % HISTORY_SIZE])
            .collect()
    }

    /// Compute the average pause time from the most recent `n` collections.
    ///
    /// Returns `Duration::ZERO` if no collections have been recorded.
    #[must_use]
    pub fn average_pause_time(&self, n: usize) -> Duration {
        let recent = self.recent(n);
        if recent.is_empty() {
            return Duration::ZERO;
        }
        let total_ns: u128 = recent.iter().map(|m| m.duration.as_nanos()).sum();
        Duration::from_nanos(
            (total_ns / recent.len() as u128)
                .try_into()
                .unwrap_or(u64::MAX),
        )
    }

    /// Get the maximum pause time from the most recent `n` collections.
    #[must_use]
    pub fn max_pause_time(&self, n: usize) -> Duration {
        self.recent(n)
            .iter()
            .map(|m| m.duration)
            .max()
            .unwrap_or(Duration::ZERO)
    }
}

static GC_HISTORY: GcHistory = GcHistory::new();

/// Get the process-wide collection history.
#[must_use]
pub fn gc_history() -> &'static GcHistory {
    &GC_HISTORY
}

/// Record metrics for a finished collection.
pub(crate) fn record_metrics(metrics: &MinorMetrics) {
    let g = global_metrics();
    g.collections.fetch_add(1, Ordering::Relaxed);
    g.objects_promoted
        .fetch_add(metrics.objects_promoted, Ordering::Relaxed);
    g.bytes_promoted
        .fetch_add(metrics.bytes_promoted, Ordering::Relaxed);
    g.pause_ns.fetch_add(
        metrics.duration.as_nanos().try_into().unwrap_or(u64::MAX),
        Ordering::Relaxed,
    );
    if metrics.pretenure_triggered {
        g.pretenure_triggers.fetch_add(1, Ordering::Relaxed);
    }
    if metrics.nursery_disabled {
        g.nursery_disables.fetch_add(1, Ordering::Relaxed);
    }

    GC_HISTORY.push(*metrics);
}
