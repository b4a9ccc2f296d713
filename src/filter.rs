//! Range-based outlier classification.
//!
//! [`OutlierFilter::classify`] splits a batch into valid readings and
//! [`QuarantinedReading`]s. A reading is an outlier iff
//! `co2_ppm < lower || co2_ppm > upper`; both bounds are inclusive-valid.
//! The filter is pure: persisting the quarantined side is the caller's job.
//!
//! ```
//! use airbeam::config::OutlierBounds;
//! use airbeam::filter::OutlierFilter;
//! use airbeam::reading::Reading;
//!
//! let filter = OutlierFilter::new(OutlierBounds::default());
//! let split = filter.classify(vec![
//!     Reading::new("2024-01-01T00:00:00", "aula_101", 612),
//!     Reading::new("2024-01-01T00:00:15", "aula_101", 6200),
//! ]);
//! assert_eq!(split.valid.len(), 1);
//! assert_eq!(split.quarantined.len(), 1);
//! ```

use crate::config::OutlierBounds;
use crate::reading::{QuarantinedReading, Reading};
use std::fmt;

/// Which bound a reading violated, and by how much.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoundViolation {
    BelowLower { value: i64, bounds: OutlierBounds },
    AboveUpper { value: i64, bounds: OutlierBounds },
}

impl BoundViolation {
    /// Distance from the violated bound.
    #[must_use]
    pub const fn excess(&self) -> u64 {
        match *self {
            Self::BelowLower { value, bounds } => bounds.lower.abs_diff(value),
            Self::AboveUpper { value, bounds } => value.abs_diff(bounds.upper),
        }
    }
}

impl fmt::Display for BoundViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (value, bounds, side, bound) = match *self {
            Self::BelowLower { value, bounds } => (value, bounds, "below lower", bounds.lower),
            Self::AboveUpper { value, bounds } => (value, bounds, "above upper", bounds.upper),
        };
        write!(
            f,
            "Outlier: {value} ppm {side} bound {bound} by {} ppm (valid range [{}, {}])",
            self.excess(),
            bounds.lower,
            bounds.upper
        )
    }
}

impl std::error::Error for BoundViolation {}

/// Result of classifying one batch. Both sides preserve input order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Classified {
    pub valid: Vec<Reading>,
    pub quarantined: Vec<QuarantinedReading>,
}

/// Stateless range filter.
#[derive(Debug, Clone, Copy, Default)]
pub struct OutlierFilter {
    bounds: OutlierBounds,
}

impl OutlierFilter {
    #[must_use]
    pub const fn new(bounds: OutlierBounds) -> Self {
        Self { bounds }
    }

    #[must_use]
    pub const fn bounds(&self) -> OutlierBounds {
        self.bounds
    }

    /// Check a single reading.
    ///
    /// # Errors
    /// Returns the violated bound when the reading is an outlier.
    pub const fn check(&self, reading: &Reading) -> Result<(), BoundViolation> {
        let value = reading.co2_ppm;
        let bounds = self.bounds;
        if bounds.contains(value) {
            Ok(())
        } else if value < bounds.lower {
            Err(BoundViolation::BelowLower { value, bounds })
        } else {
            Err(BoundViolation::AboveUpper { value, bounds })
        }
    }

    /// Split a batch into valid and quarantined readings.
    #[must_use]
    pub fn classify(&self, batch: Vec<Reading>) -> Classified {
        let mut out = Classified {
            valid: Vec::with_capacity(batch.len()),
            quarantined: Vec::new(),
        };
        for reading in batch {
            match self.check(&reading) {
                Ok(()) => out.valid.push(reading),
                Err(violation) => out.quarantined.push(QuarantinedReading {
                    reading,
                    reason: violation.to_string(),
                }),
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn r(ppm: i64) -> Reading {
        Reading::new("2024-01-01T00:00:00", "aula_101", ppm)
    }

    #[test]
    fn bounds_are_inclusive() {
        let f = OutlierFilter::default();
        let split = f.classify(vec![r(300), r(5000), r(299), r(5001)]);
        let valid: Vec<i64> = split.valid.iter().map(|r| r.co2_ppm).collect();
        let bad: Vec<i64> = split.quarantined.iter().map(|q| q.reading.co2_ppm).collect();
        assert_eq!(valid, vec![300, 5000]);
        assert_eq!(bad, vec![299, 5001]);
    }

    #[test]
    fn zero_sentinel_is_always_quarantined() {
        let f = OutlierFilter::default();
        assert!(matches!(f.check(&r(0)), Err(BoundViolation::BelowLower { .. })));
    }

    #[test]
    fn reason_names_value_bounds_and_excess() {
        let f = OutlierFilter::default();
        let split = f.classify(vec![r(6200)]);
        let reason = &split.quarantined[0].reason;
        assert!(reason.contains("6200"));
        assert!(reason.contains("[300, 5000]"));
        assert!(reason.contains("by 1200 ppm"));
        assert!(reason.contains("above upper"));
    }

    #[test]
    fn extreme_values_are_quarantined_with_exact_excess() {
        let f = OutlierFilter::default();
        let split = f.classify(vec![r(i64::MIN), r(i64::MAX)]);
        assert!(split.valid.is_empty());
        assert_eq!(split.quarantined.len(), 2);

        let low = f.check(&r(i64::MIN)).unwrap_err();
        assert_eq!(low.excess(), 300u64 + (1u64 << 63));
        let high = f.check(&r(i64::MAX)).unwrap_err();
        assert_eq!(high.excess(), i64::MAX as u64 - 5000);
        assert!(split.quarantined[0].reason.contains(&low.excess().to_string()));
        assert!(split.quarantined[1].reason.contains("above upper"));
    }

    #[test]
    fn custom_bounds() {
        let f = OutlierFilter::new(OutlierBounds::new(400, 450));
        let split = f.classify(vec![r(399), r(400), r(450), r(451)]);
        assert_eq!(split.valid.len(), 2);
        assert!(split.quarantined[0].reason.contains("by 1 ppm"));
    }
}
