//! Core domain model for chanlake: archive unit identity, warehouse row types,
//! and the generic relation shape shared by the warehouse, validation, and export.

use std::fmt;

use chrono::{DateTime, Datelike, NaiveDate, Utc, Weekday};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

pub const CRATE_NAME: &str = "chanlake-core";

/// Media discriminator value marking a message that carries a photo.
pub const PHOTO_MEDIA_SENTINEL: &str = "MessageMediaPhoto";

/// Timestamp layout used by captured message payloads (`2025-07-14 09:12:44+00:00`).
pub const POSTED_AT_FORMAT: &str = "%Y-%m-%d %H:%M:%S%:z";

/// Parse a payload timestamp in [`POSTED_AT_FORMAT`], falling back to RFC 3339.
pub fn parse_posted_at(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    DateTime::parse_from_str(raw, POSTED_AT_FORMAT)
        .or_else(|_| DateTime::parse_from_rfc3339(raw))
        .ok()
        .map(|ts| ts.with_timezone(&Utc))
}

/// Relation names produced by the pipeline.
pub mod relations {
    pub const RAW_MESSAGES: &str = "raw_messages";
    pub const RAW_IMAGE_DETECTIONS: &str = "raw_image_detections";
    pub const STG_MESSAGES: &str = "stg_telegram_messages";
    pub const STG_DETECTIONS: &str = "stg_image_detections";
    pub const DIM_CHANNELS: &str = "dim_channels";
    pub const DIM_DATES: &str = "dim_dates";
    pub const FCT_MESSAGES: &str = "fct_messages";
    pub const FCT_DETECTIONS: &str = "fct_image_detections";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitKind {
    Message,
    Detections,
}

impl UnitKind {
    /// Top-level archive directory holding units of this kind.
    pub fn archive_dir(self) -> &'static str {
        match self {
            UnitKind::Message => "telegram_messages",
            UnitKind::Detections => "image_detections",
        }
    }

    pub fn from_archive_dir(dir: &str) -> Option<Self> {
        match dir {
            "telegram_messages" => Some(UnitKind::Message),
            "image_detections" => Some(UnitKind::Detections),
            _ => None,
        }
    }
}

/// Identity of one archive unit: `{capture_date, channel, record_id}` within a kind.
///
/// The display form doubles as the ledger key and the archive-relative path stem,
/// e.g. `telegram_messages/2025-07-14/chemedapp/1`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct UnitKey {
    pub kind: UnitKind,
    pub capture_date: NaiveDate,
    pub channel: String,
    pub record_id: String,
}

impl UnitKey {
    pub fn new(
        kind: UnitKind,
        capture_date: NaiveDate,
        channel: impl Into<String>,
        record_id: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            capture_date,
            channel: channel.into(),
            record_id: record_id.into(),
        }
    }

    pub fn message(capture_date: NaiveDate, channel: &str, record_id: &str) -> Self {
        Self::new(UnitKind::Message, capture_date, channel, record_id)
    }

    pub fn ledger_key(&self) -> String {
        self.to_string()
    }

    /// Inverse of the display form. Returns `None` for anything that is not
    /// `{kind_dir}/{YYYY-MM-DD}/{channel}/{record_id}`.
    pub fn parse(key: &str) -> Option<Self> {
        let mut parts = key.split('/');
        let kind = UnitKind::from_archive_dir(parts.next()?)?;
        let capture_date = NaiveDate::parse_from_str(parts.next()?, "%Y-%m-%d").ok()?;
        let channel = parts.next()?;
        let record_id = parts.next()?;
        if parts.next().is_some() || channel.is_empty() || record_id.is_empty() {
            return None;
        }
        Some(Self::new(kind, capture_date, channel, record_id))
    }
}

impl fmt::Display for UnitKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}",
            self.kind.archive_dir(),
            self.capture_date.format("%Y-%m-%d"),
            self.channel,
            self.record_id
        )
    }
}

/// Result of a lenient cast: failures become `NULL` downstream instead of aborting.
#[derive(Debug, Clone, PartialEq)]
pub enum Coerced<T> {
    Value(T),
    Missing,
    Invalid(String),
}

impl<T> Coerced<T> {
    pub fn into_option(self) -> Option<T> {
        match self {
            Coerced::Value(value) => Some(value),
            Coerced::Missing | Coerced::Invalid(_) => None,
        }
    }

    pub fn is_invalid(&self) -> bool {
        matches!(self, Coerced::Invalid(_))
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Coerced<U> {
        match self {
            Coerced::Value(value) => Coerced::Value(f(value)),
            Coerced::Missing => Coerced::Missing,
            Coerced::Invalid(raw) => Coerced::Invalid(raw),
        }
    }
}

/// Loaded payload of one message archive unit. Owned by the loader.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawRecord {
    pub unit_key: String,
    pub capture_date: NaiveDate,
    pub channel: String,
    pub record_id: String,
    pub payload: JsonValue,
    pub content_hash: String,
    pub loaded_at: DateTime<Utc>,
}

/// One detected object loaded from a detection sidecar.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawDetection {
    pub detection_id: i64,
    pub message_id: i64,
    pub channel: String,
    pub image_path: String,
    pub object_class: String,
    pub confidence_score: f64,
    pub bounding_box: Option<String>,
    pub loaded_at: DateTime<Utc>,
}

/// Object-detection output written next to the archive by an external detector,
/// one sidecar per photo-bearing message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionSidecar {
    pub message_id: i64,
    pub image_path: String,
    #[serde(default)]
    pub detections: Vec<SidecarDetection>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SidecarDetection {
    pub object_class: String,
    pub confidence: f64,
    /// `[x1, y1, x2, y2]` pixel coordinates.
    #[serde(default)]
    pub bounding_box: Option<Vec<f64>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StagedMessage {
    /// Channel username of the archive partition; ids are only unique within it.
    pub channel: String,
    pub message_id: Option<i64>,
    pub channel_id: Option<i64>,
    pub posted_at: Option<DateTime<Utc>>,
    pub text: Option<String>,
    pub view_count: Option<i64>,
    pub sender_id: Option<i64>,
    pub has_photo: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StagedDetection {
    pub detection_id: i64,
    pub channel: String,
    pub message_id: i64,
    pub image_path: String,
    pub object_class: String,
    pub confidence_score: f64,
    pub bounding_box: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DimChannel {
    pub channel_id: i64,
    pub channel_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DimDate {
    pub date_day: NaiveDate,
    pub year: i32,
    pub month: u32,
    pub day_of_month: u32,
    /// ISO weekday, Monday = 1.
    pub day_of_week: u32,
    pub day_name: String,
    pub week_of_year: u32,
    pub quarter: u32,
    pub is_weekend: bool,
}

impl DimDate {
    pub fn for_day(date_day: NaiveDate) -> Self {
        let weekday = date_day.weekday();
        Self {
            date_day,
            year: date_day.year(),
            month: date_day.month(),
            day_of_month: date_day.day(),
            day_of_week: weekday.number_from_monday(),
            day_name: weekday_name(weekday).to_string(),
            week_of_year: date_day.iso_week().week(),
            quarter: (date_day.month() - 1) / 3 + 1,
            is_weekend: matches!(weekday, Weekday::Sat | Weekday::Sun),
        }
    }
}

fn weekday_name(weekday: Weekday) -> &'static str {
    match weekday {
        Weekday::Mon => "Monday",
        Weekday::Tue => "Tuesday",
        Weekday::Wed => "Wednesday",
        Weekday::Thu => "Thursday",
        Weekday::Fri => "Friday",
        Weekday::Sat => "Saturday",
        Weekday::Sun => "Sunday",
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FactMessage {
    pub channel: String,
    pub message_id: Option<i64>,
    pub channel_id: Option<i64>,
    pub date_day: Option<NaiveDate>,
    pub posted_at: Option<DateTime<Utc>>,
    pub message_text: Option<String>,
    pub message_length: Option<i64>,
    pub view_count: Option<i64>,
    pub sender_id: Option<i64>,
    pub has_photo: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FactDetection {
    pub detection_id: i64,
    pub channel: String,
    pub message_id: i64,
    pub channel_id: Option<i64>,
    pub date_day: Option<NaiveDate>,
    pub image_path: String,
    pub object_class: String,
    pub confidence_score: f64,
    pub bounding_box: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ColumnType {
    Integer,
    Real,
    Text,
    Boolean,
    Date,
    Timestamp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColumnDef {
    pub name: &'static str,
    pub ty: ColumnType,
    pub nullable: bool,
}

impl ColumnDef {
    pub const fn required(name: &'static str, ty: ColumnType) -> Self {
        Self { name, ty, nullable: false }
    }

    pub const fn nullable(name: &'static str, ty: ColumnType) -> Self {
        Self { name, ty, nullable: true }
    }
}

/// A single cell of a rebuilt relation.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Boolean(bool),
    Date(NaiveDate),
    Timestamp(DateTime<Utc>),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Canonical text used for equality in key checks; `None` for `NULL`.
    pub fn key(&self) -> Option<String> {
        match self {
            Value::Null => None,
            Value::Integer(v) => Some(v.to_string()),
            Value::Real(v) => Some(v.to_string()),
            Value::Text(v) => Some(v.clone()),
            Value::Boolean(v) => Some(v.to_string()),
            Value::Date(v) => Some(v.format("%Y-%m-%d").to_string()),
            Value::Timestamp(v) => Some(v.to_rfc3339()),
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Integer(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Integer(i64::from(v))
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Value::Integer(i64::from(v))
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Real(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Boolean(v)
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<NaiveDate> for Value {
    fn from(v: NaiveDate) -> Self {
        Value::Date(v)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(v: DateTime<Utc>) -> Self {
        Value::Timestamp(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Value::Null)
    }
}

/// Row types that can be materialized as a named relation.
pub trait Row {
    const RELATION: &'static str;

    fn columns() -> Vec<ColumnDef>;
    fn values(&self) -> Vec<Value>;
}

/// Untyped, column-ordered snapshot of a relation.
#[derive(Debug, Clone, PartialEq)]
pub struct Table {
    pub name: String,
    pub columns: Vec<ColumnDef>,
    pub rows: Vec<Vec<Value>>,
}

impl Table {
    pub fn new(name: impl Into<String>, columns: Vec<ColumnDef>) -> Self {
        Self {
            name: name.into(),
            columns,
            rows: Vec::new(),
        }
    }

    pub fn from_rows<R: Row>(rows: &[R]) -> Self {
        Self {
            name: R::RELATION.to_string(),
            columns: R::columns(),
            rows: rows.iter().map(Row::values).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    pub fn column_values<'a>(&'a self, name: &str) -> Option<impl Iterator<Item = &'a Value> + 'a> {
        let idx = self.column_index(name)?;
        Some(self.rows.iter().map(move |row| &row[idx]))
    }
}

/// Column layout for any relation rebuilt by the transform DAG.
pub fn relation_columns(relation: &str) -> Option<Vec<ColumnDef>> {
    match relation {
        relations::STG_MESSAGES => Some(StagedMessage::columns()),
        relations::STG_DETECTIONS => Some(StagedDetection::columns()),
        relations::DIM_CHANNELS => Some(DimChannel::columns()),
        relations::DIM_DATES => Some(DimDate::columns()),
        relations::FCT_MESSAGES => Some(FactMessage::columns()),
        relations::FCT_DETECTIONS => Some(FactDetection::columns()),
        _ => None,
    }
}

use ColumnType::{Boolean, Date, Integer, Real, Text, Timestamp};

impl Row for StagedMessage {
    const RELATION: &'static str = relations::STG_MESSAGES;

    fn columns() -> Vec<ColumnDef> {
        vec![
            ColumnDef::required("channel", Text),
            ColumnDef::nullable("message_id", Integer),
            ColumnDef::nullable("channel_id", Integer),
            ColumnDef::nullable("posted_at", Timestamp),
            ColumnDef::nullable("text", Text),
            ColumnDef::nullable("view_count", Integer),
            ColumnDef::nullable("sender_id", Integer),
            ColumnDef::required("has_photo", Boolean),
        ]
    }

    fn values(&self) -> Vec<Value> {
        vec![
            self.channel.as_str().into(),
            self.message_id.into(),
            self.channel_id.into(),
            self.posted_at.into(),
            self.text.clone().into(),
            self.view_count.into(),
            self.sender_id.into(),
            self.has_photo.into(),
        ]
    }
}

impl Row for StagedDetection {
    const RELATION: &'static str = relations::STG_DETECTIONS;

    fn columns() -> Vec<ColumnDef> {
        vec![
            ColumnDef::required("detection_id", Integer),
            ColumnDef::required("channel", Text),
            ColumnDef::required("message_id", Integer),
            ColumnDef::required("image_path", Text),
            ColumnDef::required("object_class", Text),
            ColumnDef::required("confidence_score", Real),
            ColumnDef::nullable("bounding_box", Text),
        ]
    }

    fn values(&self) -> Vec<Value> {
        vec![
            self.detection_id.into(),
            self.channel.as_str().into(),
            self.message_id.into(),
            self.image_path.as_str().into(),
            self.object_class.as_str().into(),
            self.confidence_score.into(),
            self.bounding_box.clone().into(),
        ]
    }
}

impl Row for DimChannel {
    const RELATION: &'static str = relations::DIM_CHANNELS;

    fn columns() -> Vec<ColumnDef> {
        vec![
            ColumnDef::required("channel_id", Integer),
            ColumnDef::required("channel_name", Text),
        ]
    }

    fn values(&self) -> Vec<Value> {
        vec![self.channel_id.into(), self.channel_name.as_str().into()]
    }
}

impl Row for DimDate {
    const RELATION: &'static str = relations::DIM_DATES;

    fn columns() -> Vec<ColumnDef> {
        vec![
            ColumnDef::required("date_day", Date),
            ColumnDef::required("year", Integer),
            ColumnDef::required("month", Integer),
            ColumnDef::required("day_of_month", Integer),
            ColumnDef::required("day_of_week", Integer),
            ColumnDef::required("day_name", Text),
            ColumnDef::required("week_of_year", Integer),
            ColumnDef::required("quarter", Integer),
            ColumnDef::required("is_weekend", Boolean),
        ]
    }

    fn values(&self) -> Vec<Value> {
        vec![
            self.date_day.into(),
            self.year.into(),
            self.month.into(),
            self.day_of_month.into(),
            self.day_of_week.into(),
            self.day_name.as_str().into(),
            self.week_of_year.into(),
            self.quarter.into(),
            self.is_weekend.into(),
        ]
    }
}

impl Row for FactMessage {
    const RELATION: &'static str = relations::FCT_MESSAGES;

    fn columns() -> Vec<ColumnDef> {
        vec![
            ColumnDef::required("channel", Text),
            ColumnDef::nullable("message_id", Integer),
            ColumnDef::nullable("channel_id", Integer),
            ColumnDef::nullable("date_day", Date),
            ColumnDef::nullable("posted_at", Timestamp),
            ColumnDef::nullable("message_text", Text),
            ColumnDef::nullable("message_length", Integer),
            ColumnDef::nullable("view_count", Integer),
            ColumnDef::nullable("sender_id", Integer),
            ColumnDef::required("has_photo", Boolean),
        ]
    }

    fn values(&self) -> Vec<Value> {
        vec![
            self.channel.as_str().into(),
            self.message_id.into(),
            self.channel_id.into(),
            self.date_day.into(),
            self.posted_at.into(),
            self.message_text.clone().into(),
            self.message_length.into(),
            self.view_count.into(),
            self.sender_id.into(),
            self.has_photo.into(),
        ]
    }
}

impl Row for FactDetection {
    const RELATION: &'static str = relations::FCT_DETECTIONS;

    fn columns() -> Vec<ColumnDef> {
        vec![
            ColumnDef::required("detection_id", Integer),
            ColumnDef::required("channel", Text),
            ColumnDef::required("message_id", Integer),
            ColumnDef::nullable("channel_id", Integer),
            ColumnDef::nullable("date_day", Date),
            ColumnDef::required("image_path", Text),
            ColumnDef::required("object_class", Text),
            ColumnDef::required("confidence_score", Real),
            ColumnDef::nullable("bounding_box", Text),
        ]
    }

    fn values(&self) -> Vec<Value> {
        vec![
            self.detection_id.into(),
            self.channel.as_str().into(),
            self.message_id.into(),
            self.channel_id.into(),
            self.date_day.into(),
            self.image_path.as_str().into(),
            self.object_class.as_str().into(),
            self.confidence_score.into(),
            self.bounding_box.clone().into(),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn day(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn unit_key_display_parses_back() {
        let key = UnitKey::message(day(2025, 7, 14), "chemedapp", "42");
        assert_eq!(key.to_string(), "telegram_messages/2025-07-14/chemedapp/42");
        assert_eq!(UnitKey::parse(&key.ledger_key()), Some(key));
    }

    #[test]
    fn unit_key_rejects_foreign_layouts() {
        assert_eq!(UnitKey::parse("images/2025-07-14/chemedapp/42"), None);
        assert_eq!(UnitKey::parse("telegram_messages/2025-13-40/chemedapp/42"), None);
        assert_eq!(UnitKey::parse("telegram_messages/2025-07-14/chemedapp"), None);
        assert_eq!(UnitKey::parse("telegram_messages/2025-07-14/chemedapp/42/x"), None);
    }

    #[test]
    fn posted_at_accepts_payload_and_rfc3339_layouts() {
        let a = parse_posted_at("2025-07-14 09:30:00+03:00").unwrap();
        let b = parse_posted_at("2025-07-14T06:30:00Z").unwrap();
        assert_eq!(a, b);
        assert!(parse_posted_at("14/07/2025").is_none());
    }

    #[test]
    fn coerced_invalid_becomes_null() {
        let bad: Coerced<i64> = Coerced::Invalid("abc".into());
        assert!(bad.is_invalid());
        assert_eq!(bad.into_option(), None);
        assert_eq!(Coerced::Value(3).map(|v| v * 2).into_option(), Some(6));
    }

    #[test]
    fn dim_date_attributes() {
        let row = DimDate::for_day(day(2025, 7, 14));
        assert_eq!(row.day_of_week, 1);
        assert_eq!(row.day_name, "Monday");
        assert_eq!(row.quarter, 3);
        assert_eq!(row.week_of_year, 29);
        assert!(!row.is_weekend);
        assert!(DimDate::for_day(day(2025, 7, 13)).is_weekend);
    }

    #[test]
    fn table_from_rows_keeps_column_order() {
        let rows = vec![DimChannel { channel_id: 7, channel_name: "Channel 7".into() }];
        let table = Table::from_rows(&rows);
        assert_eq!(table.name, relations::DIM_CHANNELS);
        assert_eq!(table.column_index("channel_name"), Some(1));
        let ids: Vec<_> = table.column_values("channel_id").unwrap().cloned().collect();
        assert_eq!(ids, vec![Value::Integer(7)]);
        assert_eq!(Value::from(None::<i64>), Value::Null);
    }
}
