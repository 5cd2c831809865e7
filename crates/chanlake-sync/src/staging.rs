//! Raw → staged projections.
//!
//! Casting is lenient: a field that cannot be coerced becomes `NULL` and is
//! counted, the row itself is always emitted.

use std::collections::BTreeMap;

use chanlake_core::{
    parse_posted_at, relations, Coerced, RawDetection, RawRecord, StagedDetection, StagedMessage,
    PHOTO_MEDIA_SENTINEL,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value as JsonValue;

/// Per-column count of values that failed to cast and were nulled.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CoercionCounts(pub BTreeMap<String, usize>);

impl CoercionCounts {
    fn note<T>(&mut self, relation: &str, column: &str, value: &Coerced<T>) {
        if value.is_invalid() {
            *self.0.entry(format!("{relation}.{column}")).or_default() += 1;
        }
    }

    pub fn total(&self) -> usize {
        self.0.values().sum()
    }

    pub fn merge(&mut self, other: CoercionCounts) {
        for (column, n) in other.0 {
            *self.0.entry(column).or_default() += n;
        }
    }
}

fn path<'a>(payload: &'a JsonValue, fields: &[&str]) -> Option<&'a JsonValue> {
    fields.iter().try_fold(payload, |value, field| value.get(field))
}

pub fn cast_integer(value: Option<&JsonValue>) -> Coerced<i64> {
    match value {
        None | Some(JsonValue::Null) => Coerced::Missing,
        Some(JsonValue::Number(n)) => match n.as_i64() {
            Some(v) => Coerced::Value(v),
            None => Coerced::Invalid(n.to_string()),
        },
        Some(JsonValue::String(s)) => match s.trim().parse::<i64>() {
            Ok(v) => Coerced::Value(v),
            Err(_) => Coerced::Invalid(s.clone()),
        },
        Some(other) => Coerced::Invalid(other.to_string()),
    }
}

pub fn cast_timestamp(value: Option<&JsonValue>) -> Coerced<DateTime<Utc>> {
    match value {
        None | Some(JsonValue::Null) => Coerced::Missing,
        Some(JsonValue::String(s)) => match parse_posted_at(s) {
            Some(ts) => Coerced::Value(ts),
            None => Coerced::Invalid(s.clone()),
        },
        Some(other) => Coerced::Invalid(other.to_string()),
    }
}

pub fn cast_text(value: Option<&JsonValue>) -> Coerced<String> {
    match value {
        None | Some(JsonValue::Null) => Coerced::Missing,
        Some(JsonValue::String(s)) => Coerced::Value(s.clone()),
        Some(JsonValue::Number(n)) => Coerced::Value(n.to_string()),
        Some(JsonValue::Bool(b)) => Coerced::Value(b.to_string()),
        Some(other) => Coerced::Invalid(other.to_string()),
    }
}

fn has_photo(payload: &JsonValue) -> bool {
    path(payload, &["media", "_"]).and_then(JsonValue::as_str) == Some(PHOTO_MEDIA_SENTINEL)
}

pub fn stage_message(raw: &RawRecord, counts: &mut CoercionCounts) -> StagedMessage {
    let payload = &raw.payload;
    let rel = relations::STG_MESSAGES;

    let message_id = cast_integer(path(payload, &["id"]));
    let channel_id = cast_integer(path(payload, &["peer_id", "channel_id"]));
    let posted_at = cast_timestamp(path(payload, &["date"]));
    let text = cast_text(path(payload, &["message"]));
    let view_count = cast_integer(path(payload, &["views"]));
    let sender_id = cast_integer(path(payload, &["from_id", "user_id"]));

    counts.note(rel, "message_id", &message_id);
    counts.note(rel, "channel_id", &channel_id);
    counts.note(rel, "posted_at", &posted_at);
    counts.note(rel, "text", &text);
    counts.note(rel, "view_count", &view_count);
    counts.note(rel, "sender_id", &sender_id);

    StagedMessage {
        channel: raw.channel.clone(),
        message_id: message_id.into_option(),
        channel_id: channel_id.into_option(),
        posted_at: posted_at.into_option(),
        text: text.into_option(),
        view_count: view_count.into_option(),
        sender_id: sender_id.into_option(),
        has_photo: has_photo(payload),
    }
}

pub fn stage_messages(raw: &[RawRecord]) -> (Vec<StagedMessage>, CoercionCounts) {
    let mut counts = CoercionCounts::default();
    let rows = raw.iter().map(|r| stage_message(r, &mut counts)).collect();
    (rows, counts)
}

pub fn stage_detections(raw: &[RawDetection]) -> Vec<StagedDetection> {
    raw.iter()
        .map(|r| StagedDetection {
            detection_id: r.detection_id,
            channel: r.channel.clone(),
            message_id: r.message_id,
            image_path: r.image_path.clone(),
            object_class: r.object_class.clone(),
            confidence_score: r.confidence_score,
            bounding_box: r.bounding_box.clone(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, TimeZone};
    use serde_json::json;

    fn raw(payload: JsonValue) -> RawRecord {
        RawRecord {
            unit_key: "telegram_messages/2025-07-14/chemedapp/1".into(),
            capture_date: NaiveDate::from_ymd_opt(2025, 7, 14).unwrap(),
            channel: "chemedapp".into(),
            record_id: "1".into(),
            payload,
            content_hash: "x".into(),
            loaded_at: Utc::now(),
        }
    }

    #[test]
    fn message_fields_are_extracted_and_typed() {
        let mut counts = CoercionCounts::default();
        let row = stage_message(
            &raw(json!({
                "id": 2,
                "peer_id": {"channel_id": 1399000001},
                "date": "2025-07-14 09:30:00+00:00",
                "message": "New arrivals",
                "views": "87",
                "from_id": {"user_id": 55501},
                "media": {"_": "MessageMediaPhoto"}
            })),
            &mut counts,
        );
        assert_eq!(row.channel, "chemedapp");
        assert_eq!(row.message_id, Some(2));
        assert_eq!(row.channel_id, Some(1399000001));
        assert_eq!(
            row.posted_at,
            Some(Utc.with_ymd_and_hms(2025, 7, 14, 9, 30, 0).unwrap())
        );
        assert_eq!(row.text.as_deref(), Some("New arrivals"));
        assert_eq!(row.view_count, Some(87));
        assert_eq!(row.sender_id, Some(55501));
        assert!(row.has_photo);
        assert_eq!(counts.total(), 0);
    }

    #[test]
    fn failed_casts_become_null_without_dropping_the_row() {
        let (rows, counts) = stage_messages(&[
            raw(json!({"id": 1, "views": "lots", "date": "yesterday", "media": null})),
            raw(json!({"id": "abc", "peer_id": {"channel_id": [1]}})),
        ]);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].view_count, None);
        assert_eq!(rows[0].posted_at, None);
        assert!(!rows[0].has_photo);
        assert_eq!(rows[1].message_id, None);
        assert_eq!(rows[1].channel_id, None);
        assert_eq!(counts.total(), 4);
        assert_eq!(counts.0.get("stg_telegram_messages.view_count"), Some(&1));
    }

    #[test]
    fn missing_fields_are_null_but_not_counted() {
        let (rows, counts) = stage_messages(&[raw(json!({"id": 5}))]);
        assert_eq!(rows[0].text, None);
        assert_eq!(rows[0].sender_id, None);
        assert_eq!(counts.total(), 0);
    }

    #[test]
    fn only_the_photo_sentinel_sets_has_photo() {
        let (rows, _) = stage_messages(&[
            raw(json!({"id": 1, "media": {"_": "MessageMediaDocument"}})),
            raw(json!({"id": 2, "media": "MessageMediaPhoto"})),
        ]);
        assert!(rows.iter().all(|r| !r.has_photo));
    }
}
