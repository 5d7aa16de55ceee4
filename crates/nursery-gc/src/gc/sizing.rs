//! Adaptive nursery sizing.

/// Active chunk count for the next cycle given the promotion rate of the
/// cycle that just finished.
///
/// Doubles above `grow`, drops one chunk below `shrink`, and always stays
/// within `1..=max`.
#[must_use]
pub fn next_active_chunks(current: usize, max: usize, rate: f64, grow: f64, shrink: f64) -> usize {
    let next = if rate > grow {
        current.saturating_mul(2)
    } else if rate < shrink {
        current.saturating_sub(1)
    } else {
        current
    };
    next.clamp(1, max.max(1))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_grow_doubles_up_to_max() {
        assert_eq!(next_active_chunks(1, 16, 0.06, 0.05, 0.01), 2);
        assert_eq!(next_active_chunks(4, 16, 0.5, 0.05, 0.01), 8);
        assert_eq!(next_active_chunks(12, 16, 0.5, 0.05, 0.01), 16);
        assert_eq!(next_active_chunks(16, 16, 0.5, 0.05, 0.01), 16);
    }

    #[test]
    fn test_shrink_floors_at_one() {
        assert_eq!(next_active_chunks(4, 16, 0.0, 0.05, 0.01), 3);
        assert_eq!(next_active_chunks(1, 16, 0.0, 0.05, 0.01), 1);
    }

    #[test]
    fn test_in_band_unchanged() {
        assert_eq!(next_active_chunks(4, 16, 0.03, 0.05, 0.01), 4);
        assert_eq!(next_active_chunks(4, 16, 0.05, 0.05, 0.01), 4);
        assert_eq!(next_active_chunks(4, 16, 0.01, 0.05, 0.01), 4);
    }
}
