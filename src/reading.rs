//! Sensor reading types and the parse boundary for raw log lines.
//!
//! A [`Reading`] is one CO2 sample as produced by the log source. Its identity
//! for deduplication is the [`NaturalKey`] `(ts, aula)`; no synthetic id is
//! introduced anywhere in the crate.
//!
//! Raw lines are first decoded into [`RawReading`], where every field is
//! optional, and then promoted to a [`Reading`] by [`RawReading::into_reading`]:
//! - a missing or non-numeric `co2_ppm` becomes `0`, which always falls below
//!   the lower bound and is therefore routed to quarantine;
//! - a missing `ts`/`aula`, or a `ts` that is not an ISO-8601 timestamp, makes
//!   the line malformed (it cannot be keyed or partitioned).

use anyhow::{Context, Result, anyhow, bail};
use chrono::{DateTime, Datelike, NaiveDateTime, Timelike};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// One CO2 sample for one room.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Reading {
    /// ISO-8601 timestamp, kept verbatim as it appears in the log.
    pub ts: String,
    /// Room identifier.
    pub aula: String,
    /// CO2 concentration in ppm.
    pub co2_ppm: i64,
}

impl Reading {
    pub fn new(ts: impl Into<String>, aula: impl Into<String>, co2_ppm: i64) -> Self {
        Self {
            ts: ts.into(),
            aula: aula.into(),
            co2_ppm,
        }
    }

    /// The deduplication key of this reading.
    #[must_use]
    pub fn natural_key(&self) -> NaturalKey {
        NaturalKey {
            ts: self.ts.clone(),
            aula: self.aula.clone(),
        }
    }

    /// Parse `ts` into a naive wall-clock datetime.
    ///
    /// # Errors
    /// Returns an error if `ts` is not a supported ISO-8601 form.
    pub fn timestamp(&self) -> Result<NaiveDateTime> {
        parse_timestamp(&self.ts)
    }

    /// Partition coordinates derived from `ts`.
    ///
    /// # Errors
    /// Returns an error if `ts` cannot be parsed.
    pub fn partition(&self) -> Result<PartitionCoords> {
        Ok(PartitionCoords::from_datetime(&self.timestamp()?))
    }
}

/// A reading that failed the range check, with a human-readable reason.
///
/// Serializes flat: the record fields plus `reason`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuarantinedReading {
    #[serde(flatten)]
    pub reading: Reading,
    pub reason: String,
}

/// `(ts, aula)`: the identity of a reading for deduplication.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NaturalKey {
    pub ts: String,
    pub aula: String,
}

impl fmt::Display for NaturalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.ts, self.aula)
    }
}

/// Hive-style partition coordinates derived from a reading timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PartitionCoords {
    pub year: i32,
    pub month: u32,
    pub day: u32,
    pub hour: u32,
}

impl PartitionCoords {
    #[must_use]
    pub fn from_datetime(dt: &NaiveDateTime) -> Self {
        Self {
            year: dt.year(),
            month: dt.month(),
            day: dt.day(),
            hour: dt.hour(),
        }
    }

    /// Relative directory for this partition, e.g. `year=2024/month=03/day=07/hour=09`.
    #[must_use]
    pub fn relative_path(&self) -> String {
        format!(
            "year={:04}/month={:02}/day={:02}/hour={:02}",
            self.year, self.month, self.day, self.hour
        )
    }
}

impl fmt::Display for PartitionCoords {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.relative_path())
    }
}

/// A reading as persisted in the partitioned archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveEntry {
    pub reading: Reading,
    pub partition: PartitionCoords,
}

impl ArchiveEntry {
    /// # Errors
    /// Returns an error if the reading timestamp cannot be parsed.
    pub fn from_reading(reading: Reading) -> Result<Self> {
        let partition = reading.partition()?;
        Ok(Self { reading, partition })
    }
}

/// Line-level view of a log record before validation. Unknown fields are ignored.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawReading {
    #[serde(default)]
    pub ts: Option<String>,
    #[serde(default)]
    pub aula: Option<String>,
    #[serde(default)]
    pub co2_ppm: Option<Value>,
}

impl RawReading {
    /// Decode one NDJSON line.
    ///
    /// # Errors
    /// Returns an error if the line is not a JSON object.
    pub fn parse_line(line: &str) -> Result<Self> {
        serde_json::from_str(line).context("decode JSON object")
    }

    /// Promote to a [`Reading`].
    ///
    /// # Errors
    /// Returns an error if `ts` or `aula` is missing, or `ts` is not a timestamp.
    pub fn into_reading(self) -> Result<Reading> {
        let ts = self.ts.ok_or_else(|| anyhow!("missing field `ts`"))?;
        let aula = self.aula.ok_or_else(|| anyhow!("missing field `aula`"))?;
        if aula.is_empty() {
            bail!("empty field `aula`");
        }
        parse_timestamp(&ts)?;
        Ok(Reading {
            ts,
            aula,
            co2_ppm: measurement_or_zero(self.co2_ppm.as_ref()),
        })
    }
}

/// Absent, null or non-numeric measurements collapse to 0.
fn measurement_or_zero(value: Option<&Value>) -> i64 {
    match value {
        Some(Value::Number(n)) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.is_finite()).map(|f| f.trunc() as i64))
            .unwrap_or(0),
        _ => 0,
    }
}

/// Parse the timestamp forms the producer emits.
///
/// Accepts RFC 3339 with an offset (the local wall-clock part is kept) and
/// naive `YYYY-MM-DDTHH:MM:SS[.f]`, with `T` or a space as separator.
///
/// # Errors
/// Returns an error naming the rejected input.
pub fn parse_timestamp(ts: &str) -> Result<NaiveDateTime> {
    let ts = ts.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(ts) {
        return Ok(dt.naive_local());
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(ts, fmt) {
            return Ok(dt);
        }
    }
    bail!("unparsable timestamp {ts:?}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_measurement_defaults_to_zero() {
        let raw = RawReading::parse_line(r#"{"ts":"2024-03-07T09:15:00","aula":"aula_101"}"#).unwrap();
        let r = raw.into_reading().unwrap();
        assert_eq!(r.co2_ppm, 0);
    }

    #[test]
    fn non_numeric_measurement_defaults_to_zero() {
        let raw = RawReading::parse_line(
            r#"{"ts":"2024-03-07T09:15:00","aula":"aula_101","co2_ppm":"high"}"#,
        )
        .unwrap();
        assert_eq!(raw.into_reading().unwrap().co2_ppm, 0);
    }

    #[test]
    fn missing_key_fields_are_rejected() {
        let raw = RawReading::parse_line(r#"{"aula":"aula_101","co2_ppm":500}"#).unwrap();
        assert!(raw.into_reading().is_err());
        let raw = RawReading::parse_line(r#"{"ts":"yesterday","aula":"a","co2_ppm":500}"#).unwrap();
        assert!(raw.into_reading().is_err());
    }

    #[test]
    fn partition_coords_are_zero_padded() {
        let r = Reading::new("2024-03-07T09:15:00.123456", "aula_101", 612);
        let p = r.partition().unwrap();
        assert_eq!(p.relative_path(), "year=2024/month=03/day=07/hour=09");
    }

    #[test]
    fn offset_timestamps_keep_wall_clock() {
        let dt = parse_timestamp("2024-03-07T23:59:59+05:00").unwrap();
        assert_eq!(PartitionCoords::from_datetime(&dt).hour, 23);
    }

    #[test]
    fn quarantined_reading_serializes_flat() {
        let q = QuarantinedReading {
            reading: Reading::new("2024-03-07T09:15:00", "aula_101", 6000),
            reason: "too high".into(),
        };
        let v: Value = serde_json::to_value(&q).unwrap();
        assert_eq!(v["co2_ppm"], 6000);
        assert_eq!(v["reason"], "too high");
        assert_eq!(v["aula"], "aula_101");
    }
}
