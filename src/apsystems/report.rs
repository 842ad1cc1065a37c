use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

/// Daily report body as returned by the portal: three parallel arrays.
#[derive(Debug, Clone, Deserialize)]
pub struct RawReport {
    pub time: Vec<Value>,
    pub power: Vec<Value>,
    pub energy: Vec<Value>,
}

/// One sample slot of the daily report.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Reading {
    /// Milliseconds since epoch, still carrying the portal's clock skew.
    pub timestamp_ms: i64,
    pub power_w: i64,
    pub energy_kwh: f64,
}

#[derive(Error, Debug, Clone, PartialEq)]
#[error("reading {index}: {reason}")]
pub struct ReadingError {
    pub index: usize,
    pub reason: String,
}

impl ReadingError {
    pub fn new(index: usize, reason: impl Into<String>) -> Self {
        Self {
            index,
            reason: reason.into(),
        }
    }
}

impl RawReport {
    /// Number of sample slots; the `time` array drives iteration.
    pub fn len(&self) -> usize {
        self.time.len()
    }

    pub fn is_empty(&self) -> bool {
        self.time.is_empty()
    }

    pub fn reading(&self, index: usize) -> Result<Reading, ReadingError> {
        let timestamp_ms = coerce_timestamp(slot(&self.time, index, "time")?)
            .map_err(|reason| ReadingError::new(index, format!("time: {reason}")))?;
        let power_w = coerce_int(slot(&self.power, index, "power")?)
            .map_err(|reason| ReadingError::new(index, format!("power: {reason}")))?;
        let energy_kwh = coerce_float(slot(&self.energy, index, "energy")?)
            .map_err(|reason| ReadingError::new(index, format!("energy: {reason}")))?;

        Ok(Reading {
            timestamp_ms,
            power_w,
            energy_kwh,
        })
    }
}

fn slot<'a>(values: &'a [Value], index: usize, name: &str) -> Result<&'a Value, ReadingError> {
    values
        .get(index)
        .ok_or_else(|| ReadingError::new(index, format!("missing {name} value")))
}

fn coerce_timestamp(value: &Value) -> Result<i64, String> {
    match value {
        Value::Number(n) => number_to_i64(n),
        other => Err(format!("expected a number, got {other}")),
    }
}

/// Integer coercion: JSON integers, fractional numbers truncated toward zero,
/// or strings holding an integer.
fn coerce_int(value: &Value) -> Result<i64, String> {
    match value {
        Value::Number(n) => number_to_i64(n),
        Value::String(s) => s
            .trim()
            .parse::<i64>()
            .map_err(|_| format!("{s:?} is not an integer")),
        other => Err(format!("cannot convert {other} to an integer")),
    }
}

fn coerce_float(value: &Value) -> Result<f64, String> {
    match value {
        Value::Number(n) => n.as_f64().ok_or_else(|| format!("{n} is not a float")),
        Value::String(s) => s
            .trim()
            .parse::<f64>()
            .map_err(|_| format!("{s:?} is not a number")),
        other => Err(format!("cannot convert {other} to a float")),
    }
}

fn number_to_i64(n: &serde_json::Number) -> Result<i64, String> {
    if let Some(i) = n.as_i64() {
        return Ok(i);
    }
    match n.as_f64() {
        Some(f) if f.is_finite() && f.abs() < i64::MAX as f64 => Ok(f.trunc() as i64),
        _ => Err(format!("{n} does not fit an integer")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn report(body: Value) -> RawReport {
        serde_json::from_value(body).unwrap()
    }

    #[test]
    fn test_reading_coercion() {
        let r = report(json!({
            "time": [1719806400000_i64, 1719806700000.0],
            "power": ["120", 87.9],
            "energy": [0.5, "1.25"],
        }));

        assert_eq!(r.len(), 2);
        assert_eq!(
            r.reading(0).unwrap(),
            Reading {
                timestamp_ms: 1719806400000,
                power_w: 120,
                energy_kwh: 0.5,
            }
        );
        let second = r.reading(1).unwrap();
        assert_eq!(second.timestamp_ms, 1719806700000);
        assert_eq!(second.power_w, 87);
        assert_eq!(second.energy_kwh, 1.25);
    }

    #[test]
    fn test_reading_rejects_non_integer_power() {
        let r = report(json!({
            "time": [1, 2, 3],
            "power": ["12.5", null, "abc"],
            "energy": [1.0, 1.0, 1.0],
        }));

        for idx in 0..3 {
            let err = r.reading(idx).unwrap_err();
            assert_eq!(err.index, idx);
            assert!(err.reason.starts_with("power:"), "{}", err.reason);
        }
    }

    #[test]
    fn test_reading_missing_parallel_entry() {
        let r = report(json!({
            "time": [1, 2],
            "power": [10],
            "energy": [0.1, 0.2],
        }));

        assert!(r.reading(0).is_ok());
        let err = r.reading(1).unwrap_err();
        assert_eq!(err.reason, "missing power value");
    }

    #[test]
    fn test_report_requires_all_arrays() {
        let parsed: Result<RawReport, _> =
            serde_json::from_value(json!({"time": [], "power": []}));
        assert!(parsed.is_err());
    }

    #[test]
    fn test_report_ignores_extra_keys() {
        let r = report(json!({
            "time": [], "power": [], "energy": [], "total": "0.0"
        }));
        assert!(r.is_empty());
    }
}
