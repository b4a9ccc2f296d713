//! Reading fixtures and NDJSON helpers.

use crate::reading::Reading;
use chrono::{Duration, NaiveDate, NaiveDateTime};

/// Room used by every fixture.
pub const FIXTURE_ROOM: &str = "aula_101";

fn fixture_epoch() -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2024, 3, 7)
        .and_then(|d| d.and_hms_opt(9, 0, 0))
        .unwrap_or_default()
}

/// Timestamp `seconds` after 2024-03-07T09:00:00, formatted like the producer.
#[must_use]
pub fn fixture_ts(seconds: i64) -> String {
    (fixture_epoch() + Duration::seconds(seconds))
        .format("%Y-%m-%dT%H:%M:%S%.f")
        .to_string()
}

/// The `i`-th fixture reading: 15 s apart, in [`FIXTURE_ROOM`].
#[must_use]
pub fn reading_at(i: usize, co2_ppm: i64) -> Reading {
    let secs = i64::try_from(i).unwrap_or(i64::MAX / 15) * 15;
    Reading::new(fixture_ts(secs), FIXTURE_ROOM, co2_ppm)
}

/// `n` valid readings cycling through 600..=690 ppm.
///
/// ```
/// use airbeam::testing::sample_readings;
///
/// let r = sample_readings(3);
/// assert_eq!(r.len(), 3);
/// assert!(r.iter().all(|r| (300..=5000).contains(&r.co2_ppm)));
/// ```
#[must_use]
pub fn sample_readings(n: usize) -> Vec<Reading> {
    (0..n)
        .map(|i| reading_at(i, 600 + i64::try_from(i % 10).unwrap_or(0) * 10))
        .collect()
}

/// Serialize one reading as an NDJSON line (no trailing newline).
#[must_use]
pub fn to_line(reading: &Reading) -> String {
    serde_json::to_string(reading).unwrap_or_default()
}

/// Serialize readings as NDJSON lines.
#[must_use]
pub fn to_lines(readings: &[Reading]) -> Vec<String> {
    readings.iter().map(to_line).collect()
}
