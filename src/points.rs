use chrono::{DateTime, LocalResult, NaiveDateTime, TimeDelta, TimeZone, Utc};
use chrono_tz::Tz;
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::{debug, warn};

use crate::apsystems::RawReport;
use crate::apsystems::report::{Reading, ReadingError};
use crate::config::PortalConfig;

/// The portal's timestamps run this far behind the site's wall clock.
pub const SKEW_CORRECTION_MS: i64 = 8 * 60 * 60 * 1000;

/// Zone the corrected timestamps are wall-clock times in.
pub const SOURCE_TIMEZONE: Tz = chrono_tz::US::Eastern;

pub type Tags = BTreeMap<String, String>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TimestampError {
    #[error("timestamp {0} ms is out of range")]
    OutOfRange(i64),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FieldValue {
    Integer(i64),
    Float(f64),
}

/// One record destined for the time-series store.
#[derive(Debug, Clone, PartialEq)]
pub struct Point {
    pub measurement: String,
    pub fields: BTreeMap<String, FieldValue>,
    pub tags: Tags,
    /// Nanoseconds since the UTC epoch.
    pub time_ns: i64,
}

impl Point {
    fn new(measurement: &str, fields: &[(&str, FieldValue)], tags: &Tags, time_ns: i64) -> Self {
        Self {
            measurement: measurement.to_string(),
            fields: fields
                .iter()
                .map(|(name, value)| (name.to_string(), *value))
                .collect(),
            tags: tags.clone(),
            time_ns,
        }
    }
}

/// How a day's report treats readings that fail to convert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseMode {
    /// The first bad reading fails the whole day.
    Strict,
    /// Bad readings are skipped and reported next to the points.
    Lenient,
}

#[derive(Debug, Default)]
pub struct DayBatch {
    pub points: Vec<Point>,
    pub skipped: Vec<ReadingError>,
}

/// Tags attached to every point of a run.
pub fn run_tags(portal: &PortalConfig) -> Tags {
    [
        ("device_id", format!("apsystems-ecu-{}", portal.ecu_id)),
        ("apsystems_system_id", portal.system_id.clone()),
        ("location_general", portal.location_general.clone()),
        ("location_specific", "Roof".to_string()),
        ("description", "Solar Panels".to_string()),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v))
    .collect()
}

/// Map a raw portal timestamp to UTC nanoseconds.
///
/// The skew correction is applied first, and the result is then read as a
/// wall-clock time in [`SOURCE_TIMEZONE`]. Ambiguous wall times resolve to
/// the earlier instant; wall times inside a spring-forward gap keep the
/// offset in effect after the transition.
pub fn corrected_timestamp_ns(raw_ms: i64) -> Result<i64, TimestampError> {
    let out_of_range = || TimestampError::OutOfRange(raw_ms);

    let corrected = raw_ms
        .checked_add(SKEW_CORRECTION_MS)
        .ok_or_else(out_of_range)?;
    let wall_clock: NaiveDateTime = DateTime::from_timestamp_millis(corrected)
        .ok_or_else(out_of_range)?
        .naive_utc();

    let local = match SOURCE_TIMEZONE.from_local_datetime(&wall_clock) {
        LocalResult::Single(t) => t,
        LocalResult::Ambiguous(earliest, _) => earliest,
        LocalResult::None => {
            let after_gap = SOURCE_TIMEZONE
                .from_local_datetime(&(wall_clock + TimeDelta::hours(1)))
                .earliest()
                .ok_or_else(out_of_range)?;
            after_gap - TimeDelta::hours(1)
        }
    };

    local
        .with_timezone(&Utc)
        .timestamp_nanos_opt()
        .ok_or_else(out_of_range)
}

/// The composite record plus the two single-value records for one reading.
pub fn points_for_reading(reading: &Reading, tags: &Tags) -> Result<[Point; 3], TimestampError> {
    let time_ns = corrected_timestamp_ns(reading.timestamp_ms)?;
    let power = reading.power_w;
    let energy = reading.energy_kwh;

    Ok([
        Point::new(
            "apsystems",
            &[
                ("power_w", FieldValue::Integer(power)),
                ("energy_kWh", FieldValue::Float(energy)),
            ],
            tags,
            time_ns,
        ),
        // Generic per-quantity records shared with other gateways.
        Point::new(
            "power_w",
            &[("value", FieldValue::Float(power as f64))],
            tags,
            time_ns,
        ),
        Point::new(
            "energy_kWh",
            &[("value", FieldValue::Float(energy))],
            tags,
            time_ns,
        ),
    ])
}

/// Shape every reading of a day's report into points.
pub fn build_day_batch(
    report: &RawReport,
    tags: &Tags,
    mode: ParseMode,
) -> Result<DayBatch, ReadingError> {
    if report.is_empty() {
        debug!("report has no samples");
        return Ok(DayBatch {
            points: Vec::new(),
            skipped: Vec::new(),
        });
    }

    let mut batch = DayBatch {
        points: Vec::with_capacity(report.len() * 3),
        skipped: Vec::new(),
    };

    for index in 0..report.len() {
        let shaped = report.reading(index).and_then(|reading| {
            points_for_reading(&reading, tags)
                .map_err(|e| ReadingError::new(index, e.to_string()))
        });

        match (shaped, mode) {
            (Ok(points), _) => batch.points.extend(points),
            (Err(e), ParseMode::Lenient) => {
                warn!(error = %e, "skipping reading");
                batch.skipped.push(e);
            }
            (Err(e), ParseMode::Strict) => return Err(e),
        }
    }

    Ok(batch)
}
