//! Telemetry payload access and correlation key types
//!
//! The feed is an external contract: JSON objects whose field names
//! sometimes arrive with a leading space, and whose values mix strings,
//! booleans and numbers. Everything here normalizes that mess once so the
//! services can compare correlation keys without caring where they came
//! from.

use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use fuelwatch_common::{Error, Result};
use serde_json::{Map, Value};
use std::fmt;

/// Payload field carrying the boundary flag ("start" / "end")
pub const FIELD_BOUNDARY: &str = "CycleState";
/// Payload field naming the inspection cycle
pub const FIELD_CYCLE_NAME: &str = "CycleName";
/// Payload field naming the fuel element under inspection
pub const FIELD_FUEL_ELEMENT: &str = "FuelElement";
/// Payload field carrying the control-pointer id (the field known to
/// arrive with an embedded leading space)
pub const FIELD_POINTER_ID: &str = "PointerId";
/// Payload field flagging a defect on the current snapshot
pub const FIELD_DEFECT: &str = "DefectFlag";

/// Correlation-key equality: surrounding whitespace trimmed, case ignored.
///
/// `" 5"` equals `"5"`; `"05"` does NOT equal `"5"` — keys are opaque
/// strings, never numbers.
pub fn key_eq(a: &str, b: &str) -> bool {
    a.trim().eq_ignore_ascii_case(b.trim())
}

/// Derived product identifier, safe to use as a folder name
pub fn product_code(cycle_name: &str, fuel_element: &str) -> String {
    format!("{}-{}", cycle_name, fuel_element)
        .replace([':', '/', '\\'], "-")
}

// ============================================================================
// Snapshot payload
// ============================================================================

/// Parsed view over one raw snapshot's JSON payload
#[derive(Debug, Clone)]
pub struct SnapshotPayload(Map<String, Value>);

impl SnapshotPayload {
    /// Parse a raw feed line; anything but a JSON object is malformed.
    pub fn parse(raw: &str) -> Result<SnapshotPayload> {
        let value: Value = serde_json::from_str(raw)
            .map_err(|e| Error::Parse(format!("payload is not valid JSON: {e}")))?;
        match value {
            Value::Object(map) => Ok(SnapshotPayload(map)),
            other => Err(Error::Parse(format!(
                "payload must be a JSON object, found {}",
                type_name(&other)
            ))),
        }
    }

    /// Empty payload, used when a stored row fails to re-parse.
    pub fn empty() -> SnapshotPayload {
        SnapshotPayload(Map::new())
    }

    /// Extract a field value as a trimmed string.
    ///
    /// Looks the field up under its own name and under the leading-space
    /// variant the feed emits. Booleans map to presence (`false` means
    /// missing); the literals "false"/"none"/"null" and empty strings count
    /// as missing too.
    pub fn field(&self, name: &str) -> Option<String> {
        let spaced = format!(" {name}");
        for key in [name, spaced.as_str()] {
            let Some(value) = self.0.get(key) else {
                continue;
            };
            match value {
                Value::Bool(false) | Value::Null => continue,
                Value::Bool(true) => return Some("true".to_string()),
                Value::Number(n) => return Some(n.to_string()),
                Value::String(s) => {
                    let trimmed = s.trim();
                    if trimmed.is_empty() {
                        continue;
                    }
                    let lower = trimmed.to_ascii_lowercase();
                    if lower == "false" || lower == "none" || lower == "null" {
                        continue;
                    }
                    return Some(trimmed.to_string());
                }
                _ => continue,
            }
        }
        None
    }

    /// Truthiness of a flag-like field: `true`, `"true"`, `"1"`, `"yes"`
    /// and the number 1 all count as set.
    pub fn flag(&self, name: &str) -> bool {
        let spaced = format!(" {name}");
        for key in [name, spaced.as_str()] {
            let Some(value) = self.0.get(key) else {
                continue;
            };
            let truthy = match value {
                Value::Bool(b) => *b,
                Value::String(s) => {
                    matches!(s.trim().to_ascii_lowercase().as_str(), "true" | "1" | "yes")
                }
                Value::Number(n) => n.as_i64() == Some(1),
                _ => false,
            };
            if truthy {
                return true;
            }
        }
        false
    }

    /// Boundary flag of this snapshot
    pub fn boundary(&self) -> BoundaryFlag {
        BoundaryFlag::parse(self.field(FIELD_BOUNDARY).as_deref())
    }

    /// Capture timestamp from the `datetime` (fallback `timestamp`) field
    pub fn capture_timestamp(&self) -> Option<NaiveDateTime> {
        self.field("datetime")
            .or_else(|| self.field("timestamp"))
            .and_then(|raw| parse_feed_timestamp(&raw))
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// Parse an ISO-8601-ish feed timestamp, tolerating `T` separators, a
/// trailing `Z`, and fractional seconds.
pub fn parse_feed_timestamp(raw: &str) -> Option<NaiveDateTime> {
    let normalized = raw.trim().trim_end_matches('Z').replace('T', " ");
    NaiveDateTime::parse_from_str(&normalized, "%Y-%m-%d %H:%M:%S%.f").ok()
}

// ============================================================================
// Boundary flag
// ============================================================================

/// Cycle boundary flag carried in [`FIELD_BOUNDARY`].
///
/// Anything that isn't exactly a start or end marker is "no transition" —
/// ambiguous values never move the segmenter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoundaryFlag {
    Start,
    End,
    NoTransition,
}

impl BoundaryFlag {
    pub fn parse(value: Option<&str>) -> BoundaryFlag {
        match value.map(|v| v.trim().to_ascii_lowercase()) {
            Some(v) if v == "start" => BoundaryFlag::Start,
            Some(v) if v == "end" => BoundaryFlag::End,
            _ => BoundaryFlag::NoTransition,
        }
    }
}

// ============================================================================
// Natural key
// ============================================================================

/// Deterministic cycle identity: name, fuel element, first capture time
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NaturalKey {
    pub cycle_name: String,
    pub fuel_element: String,
    pub started_at: NaiveDateTime,
}

impl fmt::Display for NaturalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}-{}@{}",
            self.cycle_name, self.fuel_element, self.started_at
        )
    }
}

// ============================================================================
// Staged photo file names
// ============================================================================

/// Extensions accepted for staged photos (case-insensitive)
pub const PHOTO_EXTENSIONS: [&str; 4] = ["bmp", "jpg", "jpeg", "png"];

/// Why a staged file name failed to parse
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PhotoNameError {
    #[error("extension is not one of bmp/jpg/jpeg/png")]
    UnsupportedExtension,
    #[error("expected 5 underscore-separated fields, found {0}")]
    FieldCount(usize),
    #[error("defect flag must be OK or NOK, found {0:?}")]
    BadDefectFlag(String),
    #[error("capture timestamp must be 12 digits DDMMYYHHMMSS, found {0:?}")]
    BadTimestamp(String),
}

/// Metadata encoded in a staged photo file name:
/// `<cycle>_<pointer>_<OK|NOK>_<fuel-element>_<DDMMYYHHMMSS>.<ext>`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedPhotoName {
    pub file_name: String,
    pub cycle_name: String,
    pub pointer_id: String,
    pub defect: bool,
    pub fuel_element: String,
    pub captured_at: NaiveDateTime,
}

impl StagedPhotoName {
    pub fn parse(file_name: &str) -> std::result::Result<StagedPhotoName, PhotoNameError> {
        let (stem, ext) = file_name
            .rsplit_once('.')
            .ok_or(PhotoNameError::UnsupportedExtension)?;
        if !PHOTO_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()) {
            return Err(PhotoNameError::UnsupportedExtension);
        }

        let fields: Vec<&str> = stem.split('_').collect();
        if fields.len() != 5 {
            return Err(PhotoNameError::FieldCount(fields.len()));
        }

        let defect = match fields[2].trim().to_ascii_uppercase().as_str() {
            "OK" => false,
            "NOK" => true,
            other => return Err(PhotoNameError::BadDefectFlag(other.to_string())),
        };

        let captured_at = parse_photo_timestamp(fields[4].trim())
            .ok_or_else(|| PhotoNameError::BadTimestamp(fields[4].to_string()))?;

        Ok(StagedPhotoName {
            file_name: file_name.to_string(),
            cycle_name: fields[0].trim().to_string(),
            pointer_id: fields[1].trim().to_string(),
            defect,
            fuel_element: fields[3].trim().to_string(),
            captured_at,
        })
    }

    /// Render a capture time the way file names encode it (DDMMYYHHMMSS)
    pub fn format_timestamp(ts: &NaiveDateTime) -> String {
        ts.format("%d%m%y%H%M%S").to_string()
    }
}

/// Parse the 12-digit DDMMYYHHMMSS stamp; years are 2000-based.
fn parse_photo_timestamp(raw: &str) -> Option<NaiveDateTime> {
    if raw.len() != 12 || !raw.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let num = |range: std::ops::Range<usize>| raw[range].parse::<u32>().ok();
    let day = num(0..2)?;
    let month = num(2..4)?;
    let year = 2000 + num(4..6)? as i32;
    let hour = num(6..8)?;
    let minute = num(8..10)?;
    let second = num(10..12)?;

    let date = NaiveDate::from_ymd_opt(year, month, day)?;
    let time = NaiveTime::from_hms_opt(hour, minute, second)?;
    Some(NaiveDateTime::new(date, time))
}
