//! Wire normalizer.
//!
//! Converts raw device payloads into canonical [`Reading`]s. Devices in the
//! field speak several dialects: JSON objects or arrays with assorted field
//! spellings, `{ "data": [...] }` envelopes, newline-delimited JSON, and
//! plain delimited text lines. Timestamps arrive as epoch seconds, epoch
//! milliseconds or date strings.
//!
//! Normalization never fails. Records that cannot be turned into a complete
//! reading are counted in [`Normalized::rejected`] and dropped; a record with
//! a missing or garbled mandatory channel is never filled in with zeros.

use std::sync::OnceLock;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use regex::Regex;
use serde_json::{Map, Value};

use crate::reading::Reading;

/// Numeric timestamps at or above this are already milliseconds.
const MILLIS_THRESHOLD: f64 = 1e12;

const TIME_KEYS: &[&str] = &["timestamp", "ts", "time"];
const ECG_KEYS: &[&str] = &["ecg", "ECG", "e"];
const PPG_KEYS: &[&str] = &["ppg", "PPG", "p"];
const HEART_RATE_KEYS: &[&str] = &["heartRate", "hr"];
const SPO2_KEYS: &[&str] = &["spo2", "SpO2"];

/// Which channels a payload is expected to carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldSet {
    /// Socket frames: `ecg` and `ppg` are both mandatory.
    Push,
    /// Polled samples: `ecg` is mandatory, `heartRate` and `spo2` optional.
    Pull,
}

/// Result of normalizing one payload.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Normalized {
    /// Accepted readings, in payload order.
    pub readings: Vec<Reading>,
    /// Number of records that were dropped.
    pub rejected: usize,
}

impl Normalized {
    pub fn is_empty(&self) -> bool {
        self.readings.is_empty()
    }
}

/// Current wall-clock time in epoch milliseconds.
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// Normalize one raw payload, using the current time for samples without a
/// usable timestamp.
pub fn normalize_payload(text: &str, fields: FieldSet) -> Normalized {
    normalize_payload_at(text, fields, now_millis())
}

/// Normalize one raw payload with an explicit fallback time.
pub fn normalize_payload_at(text: &str, fields: FieldSet, now: i64) -> Normalized {
    let mut out = Normalized::default();
    let text = text.trim();
    if text.is_empty() {
        return out;
    }

    if let Ok(value) = serde_json::from_str::<Value>(text) {
        collect_value(&value, fields, now, &mut out);
        return out;
    }

    // Not a single JSON document: one record per line, each either JSON or
    // delimited text.
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if line.starts_with('{') || line.starts_with('[') {
            if let Ok(value) = serde_json::from_str::<Value>(line) {
                collect_value(&value, fields, now, &mut out);
                continue;
            }
        }
        match normalize_line(line, fields, now) {
            Some(reading) => out.readings.push(reading),
            None => out.rejected += 1,
        }
    }

    out
}

/// Normalize an already-decoded JSON value.
pub fn normalize_value(value: &Value, fields: FieldSet, now: i64) -> Normalized {
    let mut out = Normalized::default();
    collect_value(value, fields, now, &mut out);
    out
}

fn collect_value(value: &Value, fields: FieldSet, now: i64, out: &mut Normalized) {
    match value {
        Value::Array(items) => {
            for item in items {
                collect_value(item, fields, now, out);
            }
        }
        Value::Object(map) => {
            if let Some(Value::Array(items)) = map.get("data") {
                if !has_any(map, ECG_KEYS) {
                    for item in items {
                        collect_value(item, fields, now, out);
                    }
                    return;
                }
            }
            match normalize_record(map, fields, now) {
                Some(reading) => out.readings.push(reading),
                None => out.rejected += 1,
            }
        }
        _ => out.rejected += 1,
    }
}

/// A channel value pulled out of a record.
#[derive(Debug, Clone, Copy, PartialEq)]
enum Channel {
    Missing,
    Invalid,
    Value(f64),
}

impl Channel {
    fn from_json(value: Option<&Value>) -> Self {
        match value {
            None => Channel::Missing,
            Some(v) => match coerce_number(v) {
                Some(n) => Channel::Value(n),
                None => Channel::Invalid,
            },
        }
    }

    fn from_text(field: Option<&str>) -> Self {
        match field {
            None => Channel::Missing,
            Some(s) => match parse_finite(s) {
                Some(n) => Channel::Value(n),
                None => Channel::Invalid,
            },
        }
    }

    fn required(self) -> Option<f64> {
        match self {
            Channel::Value(n) => Some(n),
            _ => None,
        }
    }

    /// `Err` only when the channel is present but unusable.
    fn optional(self) -> Result<Option<f64>, ()> {
        match self {
            Channel::Missing => Ok(None),
            Channel::Invalid => Err(()),
            Channel::Value(n) => Ok(Some(n)),
        }
    }
}

fn normalize_record(map: &Map<String, Value>, fields: FieldSet, now: i64) -> Option<Reading> {
    let timestamp = normalize_timestamp(first_present(map, TIME_KEYS), now);
    let ecg = Channel::from_json(first_present(map, ECG_KEYS)).required()?;
    let ppg = Channel::from_json(first_present(map, PPG_KEYS));
    let heart_rate = Channel::from_json(first_present(map, HEART_RATE_KEYS)).optional().ok()?;
    let spo2 = Channel::from_json(first_present(map, SPO2_KEYS)).optional().ok()?;

    let ppg = match fields {
        FieldSet::Push => Some(ppg.required()?),
        FieldSet::Pull => ppg.optional().ok()?,
    };

    Some(Reading {
        timestamp,
        ecg,
        ppg,
        heart_rate,
        spo2,
    })
}

/// Normalize one delimited text line.
///
/// Fields are separated by runs of `,`, `;` or tab. Push lines are
/// `timestamp, ecg, ppg`; pull lines are `timestamp, ecg, heartRate[, spo2]`.
pub fn normalize_line(line: &str, fields: FieldSet, now: i64) -> Option<Reading> {
    let parts: Vec<&str> = delimiter()
        .split(line)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect();
    if parts.len() < 3 {
        return None;
    }

    let timestamp = timestamp_from_str(parts[0]).unwrap_or(now);
    let ecg = Channel::from_text(Some(parts[1])).required()?;

    match fields {
        FieldSet::Push => {
            let ppg = Channel::from_text(Some(parts[2])).required()?;
            Some(Reading::ecg_ppg(timestamp, ecg, ppg))
        }
        FieldSet::Pull => {
            let heart_rate = Channel::from_text(Some(parts[2])).required()?;
            let spo2 = Channel::from_text(parts.get(3).copied()).optional().ok()?;
            Some(Reading::ecg_vitals(timestamp, ecg, Some(heart_rate), spo2))
        }
    }
}

fn delimiter() -> &'static Regex {
    static DELIMITER: OnceLock<Regex> = OnceLock::new();
    DELIMITER.get_or_init(|| Regex::new(r"[\t,;]+").expect("delimiter pattern is valid"))
}

/// Normalize a JSON timestamp to epoch milliseconds, falling back to `now`.
pub fn normalize_timestamp(value: Option<&Value>, now: i64) -> i64 {
    match value {
        Some(Value::Number(n)) => n.as_f64().and_then(scale_epoch).unwrap_or(now),
        Some(Value::String(s)) => timestamp_from_str(s).unwrap_or(now),
        _ => now,
    }
}

/// Convert a numeric epoch value in seconds or milliseconds to milliseconds.
pub fn scale_epoch(t: f64) -> Option<i64> {
    if !t.is_finite() {
        return None;
    }
    let millis = if t >= MILLIS_THRESHOLD { t } else { t * 1000.0 };
    Some(millis.round() as i64)
}

fn timestamp_from_str(s: &str) -> Option<i64> {
    let s = s.trim();
    if let Some(t) = parse_finite(s) {
        return scale_epoch(t);
    }
    parse_datetime(s)
}

/// Parse a date/time string to epoch milliseconds.
fn parse_datetime(s: &str) -> Option<i64> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.timestamp_millis());
    }
    if let Ok(dt) = DateTime::parse_from_rfc2822(s) {
        return Some(dt.timestamp_millis());
    }

    let formats = [
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%d %H:%M:%S",
        "%Y-%m-%dT%H:%M:%S%.f",
        "%Y-%m-%dT%H:%M:%S",
    ];
    for fmt in &formats {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(dt.and_utc().timestamp_millis());
        }
    }

    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc().timestamp_millis())
}

fn coerce_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64().filter(|n| n.is_finite()),
        Value::String(s) => parse_finite(s),
        _ => None,
    }
}

fn parse_finite(s: &str) -> Option<f64> {
    s.trim().parse::<f64>().ok().filter(|n| n.is_finite())
}

/// First non-null value among synonym keys.
fn first_present<'a>(map: &'a Map<String, Value>, keys: &[&str]) -> Option<&'a Value> {
    keys.iter()
        .filter_map(|k| map.get(*k))
        .find(|v| !v.is_null())
}

fn has_any(map: &Map<String, Value>, keys: &[&str]) -> bool {
    first_present(map, keys).is_some()
}
