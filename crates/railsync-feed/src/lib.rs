//! Feed handoff: loads flattened record batches and applies the transform
//! stage that turns loosely typed rows into validated [`FeedRecord`]s.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{NaiveDate, NaiveTime};
use railsync_core::FeedRecord;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, info};

pub const CRATE_NAME: &str = "railsync-feed";

/// One flattened row exactly as the extraction stage emits it.
pub type RawRecord = serde_json::Map<String, JsonValue>;

pub const REQUIRED_COLUMNS: [&str; 17] = [
    "service_uid",
    "train_identity",
    "station_name",
    "station_crs",
    "origin_name",
    "destination_name",
    "scheduled_arr_time",
    "actual_arr_time",
    "scheduled_dep_time",
    "actual_dep_time",
    "operator_name",
    "service_date",
    "platform",
    "platform_changed",
    "cancelled",
    "cancel_reason",
    "service_type",
];

/// Rows missing any of these are dropped rather than loaded.
pub const CRITICAL_COLUMNS: [&str; 11] = [
    "service_uid",
    "train_identity",
    "station_name",
    "station_crs",
    "origin_name",
    "destination_name",
    "operator_name",
    "service_date",
    "platform",
    "platform_changed",
    "cancelled",
];

const TIME_FORMAT: &str = "%H%M";
const DATE_FORMAT: &str = "%Y-%m-%d";

#[derive(Debug, Error)]
pub enum FeedError {
    #[error("missing required columns: {}", .0.join(", "))]
    MissingColumns(Vec<String>),
    #[error("record {index} is not a JSON object")]
    NotAnObject { index: usize },
    #[error("batch is not a JSON array: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DropCounts {
    pub non_train: usize,
    pub missing_critical: usize,
    pub bad_date: usize,
}

impl DropCounts {
    pub fn total(&self) -> usize {
        self.non_train + self.missing_critical + self.bad_date
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NormalizedBatch {
    pub records: Vec<FeedRecord>,
    pub dropped: DropCounts,
}

pub fn parse_raw_batch(text: &str) -> Result<Vec<RawRecord>, FeedError> {
    let values: Vec<JsonValue> = serde_json::from_str(text)?;
    values
        .into_iter()
        .enumerate()
        .map(|(index, value)| match value {
            JsonValue::Object(map) => Ok(map),
            _ => Err(FeedError::NotAnObject { index }),
        })
        .collect()
}

pub fn load_raw_batch(path: impl AsRef<Path>) -> Result<Vec<RawRecord>> {
    let path = path.as_ref();
    let text = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    parse_raw_batch(&text).with_context(|| format!("parsing {}", path.display()))
}

/// Run the transform stage over a raw batch.
///
/// A column is considered present when at least one row carries the key, so
/// sparse rows are tolerated while a feed that lost a field entirely is
/// rejected. An empty batch normalizes to an empty batch.
pub fn normalize(raw: Vec<RawRecord>) -> Result<NormalizedBatch, FeedError> {
    if raw.is_empty() {
        return Ok(NormalizedBatch::default());
    }
    check_required_columns(&raw)?;

    let initial = raw.len();
    let mut dropped = DropCounts::default();
    let mut records = Vec::with_capacity(initial);

    for row in raw {
        if !is_train(&row) {
            dropped.non_train += 1;
            continue;
        }
        if let Some(column) = first_missing_critical(&row) {
            debug!(column, service_uid = ?text_field(&row, "service_uid"), "dropping row with missing critical data");
            dropped.missing_critical += 1;
            continue;
        }
        let Some(service_date) = text_field(&row, "service_date").and_then(|s| parse_date(&s)) else {
            debug!(service_uid = ?text_field(&row, "service_uid"), "dropping row with unparseable service_date");
            dropped.bad_date += 1;
            continue;
        };

        records.push(FeedRecord {
            service_uid: required_text(&row, "service_uid"),
            train_identity: required_text(&row, "train_identity"),
            station_name: required_text(&row, "station_name"),
            station_crs: required_text(&row, "station_crs"),
            origin_name: required_text(&row, "origin_name"),
            destination_name: required_text(&row, "destination_name"),
            scheduled_arr_time: time_field(&row, "scheduled_arr_time"),
            actual_arr_time: time_field(&row, "actual_arr_time"),
            scheduled_dep_time: time_field(&row, "scheduled_dep_time"),
            actual_dep_time: time_field(&row, "actual_dep_time"),
            operator_name: required_text(&row, "operator_name"),
            service_date,
            platform: text_field(&row, "platform"),
            platform_changed: coerce_bool(row.get("platform_changed")),
            cancelled: coerce_bool(row.get("cancelled")),
            cancel_reason: text_field(&row, "cancel_reason"),
        });
    }

    debug!(
        initial,
        non_train = dropped.non_train,
        missing_critical = dropped.missing_critical,
        bad_date = dropped.bad_date,
        "transform dropped rows"
    );
    info!(rows = records.len(), "feed batch normalized");
    Ok(NormalizedBatch { records, dropped })
}

fn check_required_columns(raw: &[RawRecord]) -> Result<(), FeedError> {
    let missing = REQUIRED_COLUMNS
        .iter()
        .filter(|col| !raw.iter().any(|row| row.contains_key(**col)))
        .map(|col| col.to_string())
        .collect::<Vec<_>>();
    if missing.is_empty() {
        Ok(())
    } else {
        Err(FeedError::MissingColumns(missing))
    }
}

fn is_train(row: &RawRecord) -> bool {
    text_field(row, "service_type")
        .map(|t| t.eq_ignore_ascii_case("train"))
        .unwrap_or(false)
}

fn first_missing_critical(row: &RawRecord) -> Option<&'static str> {
    CRITICAL_COLUMNS
        .iter()
        .copied()
        .find(|col| matches!(row.get(*col), None | Some(JsonValue::Null)))
}

fn text_field(row: &RawRecord, key: &str) -> Option<String> {
    match row.get(key)? {
        JsonValue::String(s) => Some(s.clone()),
        JsonValue::Number(n) => Some(n.to_string()),
        JsonValue::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn required_text(row: &RawRecord, key: &str) -> String {
    text_field(row, key).unwrap_or_default()
}

fn time_field(row: &RawRecord, key: &str) -> Option<NaiveTime> {
    text_field(row, key).and_then(|s| parse_hhmm(&s))
}

/// Parse a `HHMM` time. Empty or malformed values are treated as absent.
pub fn parse_hhmm(value: &str) -> Option<NaiveTime> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }
    NaiveTime::parse_from_str(value, TIME_FORMAT).ok()
}

pub fn parse_date(value: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(value.trim(), DATE_FORMAT).ok()
}

/// Lower-cased text of the value decides: `true`/`1` and `false`/`0` map
/// directly, and any other present value, `1.0` or `0.0` included, is
/// `true`. An absent value is `false`.
pub fn coerce_bool(value: Option<&JsonValue>) -> bool {
    let text = match value {
        None => return false,
        Some(JsonValue::Bool(b)) => return *b,
        Some(JsonValue::String(s)) => s.to_lowercase(),
        Some(other) => other.to_string(),
    };
    !matches!(text.as_str(), "false" | "0")
}
