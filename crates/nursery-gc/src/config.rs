//! Nursery tuning knobs.

use std::io;

/// Default for [`NurseryConfig::max_chunks`]: 16 MiB of committed chunks.
pub const DEFAULT_MAX_CHUNKS: usize = 16;
/// Default for [`NurseryConfig::initial_chunks`].
pub const DEFAULT_INITIAL_CHUNKS: usize = 1;
/// Default for [`NurseryConfig::inline_slot_budget`].
pub const DEFAULT_INLINE_SLOT_BUDGET: usize = 16;
/// Default for [`NurseryConfig::max_nursery_slots`].
pub const DEFAULT_MAX_NURSERY_SLOTS: usize = 128;
/// Default for [`NurseryConfig::grow_threshold`].
pub const DEFAULT_GROW_THRESHOLD: f64 = 0.05;
/// Default for [`NurseryConfig::shrink_threshold`].
pub const DEFAULT_SHRINK_THRESHOLD: f64 = 0.01;
/// Default for [`NurseryConfig::pretenure_rate`].
pub const DEFAULT_PRETENURE_RATE: f64 = 0.8;
/// Default for [`NurseryConfig::pretenure_count`].
pub const DEFAULT_PRETENURE_COUNT: usize = 3000;

/// Configuration for a [`Nursery`](crate::Nursery).
///
/// ```
/// use nursery_gc::NurseryConfig;
///
/// let config = NurseryConfig::default().max_chunks(4).initial_chunks(2);
/// assert_eq!(config.max_chunks, 4);
/// ```
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NurseryConfig {
    /// Chunks committed at startup; the upper bound for adaptive sizing.
    pub max_chunks: usize,
    /// Chunks active before the first resize decision.
    pub initial_chunks: usize,
    /// Slots (or element words) stored inline with a cell.
    pub inline_slot_budget: usize,
    /// Largest out-of-line buffer, in words, bump allocated in the nursery.
    pub max_nursery_slots: usize,
    /// Promotion rate above which the nursery doubles.
    pub grow_threshold: f64,
    /// Promotion rate below which the nursery loses a chunk.
    pub shrink_threshold: f64,
    /// Promotion rate above which pretenuring candidates are reported.
    pub pretenure_rate: f64,
    /// Sampled promotions a type needs before it is reported.
    pub pretenure_count: usize,
    /// Fill swept nursery memory with `0xDB`.
    #[cfg(any(test, feature = "test-util"))]
    pub poison: bool,
}

impl Default for NurseryConfig {
    fn default() -> Self {
        Self {
            max_chunks: DEFAULT_MAX_CHUNKS,
            initial_chunks: DEFAULT_INITIAL_CHUNKS,
            inline_slot_budget: DEFAULT_INLINE_SLOT_BUDGET,
            max_nursery_slots: DEFAULT_MAX_NURSERY_SLOTS,
            grow_threshold: DEFAULT_GROW_THRESHOLD,
            shrink_threshold: DEFAULT_SHRINK_THRESHOLD,
            pretenure_rate: DEFAULT_PRETENURE_RATE,
            pretenure_count: DEFAULT_PRETENURE_COUNT,
            #[cfg(any(test, feature = "test-util"))]
            poison: false,
        }
    }
}

impl NurseryConfig {
    /// Sets the number of committed chunks.
    #[must_use]
    pub const fn max_chunks(mut self, n: usize) -> Self {
        self.max_chunks = n;
        self
    }

    /// Sets the number of initially active chunks.
    #[must_use]
    pub const fn initial_chunks(mut self, n: usize) -> Self {
        self.initial_chunks = n;
        self
    }

    /// Sets the inline slot budget.
    #[must_use]
    pub const fn inline_slot_budget(mut self, n: usize) -> Self {
        self.inline_slot_budget = n;
        self
    }

    /// Sets the largest buffer bump allocated in the nursery.
    #[must_use]
    pub const fn max_nursery_slots(mut self, n: usize) -> Self {
        self.max_nursery_slots = n;
        self
    }

    /// Sets the grow and shrink promotion-rate thresholds.
    #[must_use]
    pub const fn resize_thresholds(mut self, grow: f64, shrink: f64) -> Self {
        self.grow_threshold = grow;
        self.shrink_threshold = shrink;
        self
    }

    /// Sets the pretenuring promotion-rate and count thresholds.
    #[must_use]
    pub const fn pretenure_thresholds(mut self, rate: f64, count: usize) -> Self {
        self.pretenure_rate = rate;
        self.pretenure_count = count;
        self
    }

    /// Enables poisoning of swept nursery memory.
    #[cfg(any(test, feature = "test-util"))]
    #[must_use]
    pub const fn poison(mut self, poison: bool) -> Self {
        self.poison = poison;
        self
    }

    pub(crate) fn validate(&self) -> io::Result<()> {
        let invalid = |msg: &str| Err(io::Error::new(io::ErrorKind::InvalidInput, msg.to_owned()));

        if self.max_chunks == 0 {
            return invalid("max_chunks must be at least 1");
        }
        if self.initial_chunks == 0 || self.initial_chunks > self.max_chunks {
            return invalid("initial_chunks must be between 1 and max_chunks");
        }
        if self.shrink_threshold > self.grow_threshold {
            return invalid("shrink threshold must not exceed grow threshold");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        assert!(NurseryConfig::default().validate().is_ok());
    }

    #[test]
    fn test_initial_above_max_rejected() {
        let config = NurseryConfig::default().max_chunks(2).initial_chunks(3);
        assert_eq!(
            config.validate().unwrap_err().kind(),
            io::ErrorKind::InvalidInput
        );
    }

    #[test]
    fn test_inverted_thresholds_rejected() {
        let config = NurseryConfig::default().resize_thresholds(0.01, 0.05);
        assert!(config.validate().is_err());
    }
}
