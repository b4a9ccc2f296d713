//! Assertions over ingestion outcomes.

use crate::reading::Reading;
use std::collections::HashSet;

/// Assert every saved cursor is strictly greater than the one before it.
///
/// # Panics
/// Panics with the offending pair if the history ever goes backwards or repeats.
pub fn assert_checkpoint_monotonic(history: &[usize]) {
    for pair in history.windows(2) {
        assert!(
            pair[1] > pair[0],
            "checkpoint did not advance: {} then {} (history {history:?})",
            pair[0],
            pair[1]
        );
    }
}

/// Assert no two readings share a `(ts, aula)` key.
///
/// # Panics
/// Panics naming the first duplicated key.
pub fn assert_unique_natural_keys(readings: &[Reading]) {
    let mut seen = HashSet::with_capacity(readings.len());
    for r in readings {
        assert!(
            seen.insert(r.natural_key()),
            "duplicate natural key {}",
            r.natural_key()
        );
    }
}

/// Assert two reading sets are equal regardless of order.
///
/// # Panics
/// Panics if the multisets differ.
pub fn assert_readings_unordered_equal(actual: &[Reading], expected: &[Reading]) {
    let mut a = actual.to_vec();
    let mut e = expected.to_vec();
    a.sort_by(|x, y| (&x.ts, &x.aula, x.co2_ppm).cmp(&(&y.ts, &y.aula, y.co2_ppm)));
    e.sort_by(|x, y| (&x.ts, &x.aula, x.co2_ppm).cmp(&(&y.ts, &y.aula, y.co2_ppm)));
    assert_eq!(a, e, "reading sets differ");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn monotonic_history_passes() {
        assert_checkpoint_monotonic(&[15, 30, 37]);
        assert_checkpoint_monotonic(&[]);
    }

    #[test]
    #[should_panic(expected = "did not advance")]
    fn repeated_cursor_fails() {
        assert_checkpoint_monotonic(&[15, 15]);
    }

    #[test]
    #[should_panic(expected = "duplicate natural key")]
    fn duplicate_keys_fail() {
        let r = Reading::new("2024-01-01T00:00:00", "a", 500);
        assert_unique_natural_keys(&[r.clone(), r]);
    }
}
