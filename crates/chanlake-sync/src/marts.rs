//! Dimension and fact builders. Each is a pure function of its inputs and is
//! rebuilt in full on every run.

use std::collections::{BTreeSet, HashMap, HashSet};

use chanlake_core::{
    DimChannel, DimDate, FactDetection, FactMessage, StagedDetection, StagedMessage,
};
use chrono::{Months, NaiveDate, Utc};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransformContext {
    /// Upper bound of the date spine, inclusive.
    pub today: NaiveDate,
    /// Oldest year the date spine reaches back to, counted from `today`.
    pub date_spine_years: u32,
}

impl TransformContext {
    pub fn new(today: NaiveDate, date_spine_years: u32) -> Self {
        Self {
            today,
            date_spine_years,
        }
    }

    pub fn today_utc(date_spine_years: u32) -> Self {
        Self::new(Utc::now().date_naive(), date_spine_years)
    }

    fn horizon_start(&self) -> NaiveDate {
        self.today
            .checked_sub_months(Months::new(self.date_spine_years.saturating_mul(12)))
            .unwrap_or(NaiveDate::MIN)
    }
}

pub fn channel_display_name(channel_id: i64) -> String {
    format!("Channel {channel_id}")
}

pub fn build_dim_channels(messages: &[StagedMessage]) -> Vec<DimChannel> {
    messages
        .iter()
        .filter_map(|m| m.channel_id)
        .collect::<BTreeSet<_>>()
        .into_iter()
        .map(|channel_id| DimChannel {
            channel_id,
            channel_name: channel_display_name(channel_id),
        })
        .collect()
}

/// One row per day from the earliest message date (clamped to the horizon)
/// through `ctx.today`.
pub fn build_dim_dates(messages: &[StagedMessage], ctx: &TransformContext) -> Vec<DimDate> {
    let Some(earliest) = messages
        .iter()
        .filter_map(|m| m.posted_at)
        .map(|ts| ts.date_naive())
        .min()
    else {
        return Vec::new();
    };

    let start = earliest.max(ctx.horizon_start());
    start
        .iter_days()
        .take_while(|day| *day <= ctx.today)
        .map(DimDate::for_day)
        .collect()
}

pub fn build_fct_messages(messages: &[StagedMessage], dates: &[DimDate]) -> Vec<FactMessage> {
    let known_days: HashSet<NaiveDate> = dates.iter().map(|d| d.date_day).collect();
    messages
        .iter()
        .map(|m| {
            let date_day = m
                .posted_at
                .map(|ts| ts.date_naive())
                .filter(|day| known_days.contains(day));
            FactMessage {
                channel: m.channel.clone(),
                message_id: m.message_id,
                channel_id: m.channel_id,
                date_day,
                posted_at: m.posted_at,
                message_text: m.text.clone(),
                message_length: m.text.as_ref().map(|t| t.chars().count() as i64),
                view_count: m.view_count,
                sender_id: m.sender_id,
                has_photo: m.has_photo,
            }
        })
        .collect()
}

/// Detections join their message on `(channel, message_id)`; message ids repeat
/// across channels. Unmatched detections keep NULL channel and date keys.
pub fn build_fct_detections(
    detections: &[StagedDetection],
    messages: &[FactMessage],
) -> Vec<FactDetection> {
    let mut by_message: HashMap<(&str, i64), &FactMessage> = HashMap::new();
    for message in messages {
        if let Some(id) = message.message_id {
            by_message.entry((message.channel.as_str(), id)).or_insert(message);
        }
    }

    detections
        .iter()
        .map(|d| {
            let parent = by_message.get(&(d.channel.as_str(), d.message_id));
            FactDetection {
                detection_id: d.detection_id,
                channel: d.channel.clone(),
                message_id: d.message_id,
                channel_id: parent.and_then(|m| m.channel_id),
                date_day: parent.and_then(|m| m.date_day),
                image_path: d.image_path.clone(),
                object_class: d.object_class.clone(),
                confidence_score: d.confidence_score,
                bounding_box: d.bounding_box.clone(),
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, TimeZone};

    fn day(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn at(y: i32, m: u32, d: u32) -> Option<DateTime<Utc>> {
        Utc.with_ymd_and_hms(y, m, d, 12, 0, 0).single()
    }

    fn msg(id: i64, channel: Option<i64>, posted_at: Option<DateTime<Utc>>) -> StagedMessage {
        msg_in("chemedapp", id, channel, posted_at)
    }

    fn msg_in(
        username: &str,
        id: i64,
        channel: Option<i64>,
        posted_at: Option<DateTime<Utc>>,
    ) -> StagedMessage {
        StagedMessage {
            channel: username.to_string(),
            message_id: Some(id),
            channel_id: channel,
            posted_at,
            text: Some("héllo".into()),
            view_count: None,
            sender_id: None,
            has_photo: false,
        }
    }

    #[test]
    fn channels_are_distinct_sorted_and_named() {
        let dims = build_dim_channels(&[
            msg(1, Some(20), None),
            msg(2, Some(10), None),
            msg(3, Some(20), None),
            msg(4, None, None),
        ]);
        let ids: Vec<_> = dims.iter().map(|d| d.channel_id).collect();
        assert_eq!(ids, vec![10, 20]);
        assert_eq!(dims[0].channel_name, "Channel 10");
    }

    #[test]
    fn date_spine_runs_from_first_message_to_today() {
        let ctx = TransformContext::new(day(2025, 7, 16), 5);
        let dates = build_dim_dates(&[msg(1, Some(1), at(2025, 7, 14))], &ctx);
        let days: Vec<_> = dates.iter().map(|d| d.date_day).collect();
        assert_eq!(days, vec![day(2025, 7, 14), day(2025, 7, 15), day(2025, 7, 16)]);
    }

    #[test]
    fn date_spine_is_clamped_to_horizon_and_empty_without_dates() {
        let ctx = TransformContext::new(day(2025, 7, 16), 1);
        let dates = build_dim_dates(&[msg(1, Some(1), at(2019, 1, 1))], &ctx);
        assert_eq!(dates.first().map(|d| d.date_day), Some(day(2024, 7, 16)));
        assert_eq!(dates.len(), 366);

        assert!(build_dim_dates(&[msg(1, Some(1), None)], &ctx).is_empty());
        let future = build_dim_dates(&[msg(1, Some(1), at(2026, 1, 1))], &ctx);
        assert!(future.is_empty());
    }

    #[test]
    fn message_fact_keeps_rows_outside_the_spine_with_null_date() {
        let ctx = TransformContext::new(day(2025, 7, 16), 5);
        let staged = vec![
            msg(1, Some(1), at(2025, 7, 14)),
            msg(2, Some(1), at(2026, 1, 1)),
            msg(3, Some(1), None),
        ];
        let dates = build_dim_dates(&staged, &ctx);
        let facts = build_fct_messages(&staged, &dates);
        assert_eq!(facts.len(), 3);
        assert_eq!(facts[0].date_day, Some(day(2025, 7, 14)));
        assert_eq!(facts[1].date_day, None);
        assert_eq!(facts[2].date_day, None);
        assert_eq!(facts[0].message_length, Some(5));
    }

    #[test]
    fn detection_fact_inherits_keys_or_nulls_for_orphans() {
        let ctx = TransformContext::new(day(2025, 7, 16), 5);
        let staged = vec![msg(2, Some(77), at(2025, 7, 14))];
        let facts = build_fct_messages(&staged, &build_dim_dates(&staged, &ctx));
        let detection = |id, message_id| StagedDetection {
            detection_id: id,
            channel: "chemedapp".to_string(),
            message_id,
            image_path: "images/x.jpg".into(),
            object_class: "bottle".into(),
            confidence_score: 0.9,
            bounding_box: None,
        };

        let out = build_fct_detections(&[detection(1, 2), detection(2, 999)], &facts);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].channel_id, Some(77));
        assert_eq!(out[0].date_day, Some(day(2025, 7, 14)));
        assert_eq!(out[1].channel_id, None);
        assert_eq!(out[1].date_day, None);
    }

    #[test]
    fn detection_fact_joins_within_its_own_channel() {
        let ctx = TransformContext::new(day(2025, 7, 16), 5);
        let staged = vec![
            msg_in("chemedapp", 2, Some(111), at(2025, 7, 14)),
            msg_in("tikvahpharma", 2, Some(222), at(2025, 7, 15)),
        ];
        let facts = build_fct_messages(&staged, &build_dim_dates(&staged, &ctx));
        let detection = |id, channel: &str| StagedDetection {
            detection_id: id,
            channel: channel.to_string(),
            message_id: 2,
            image_path: format!("images/{channel}/2.jpg"),
            object_class: "bottle".into(),
            confidence_score: 0.9,
            bounding_box: None,
        };

        let out = build_fct_detections(
            &[
                detection(1, "tikvahpharma"),
                detection(2, "chemedapp"),
                detection(3, "lobelia4cosmetics"),
            ],
            &facts,
        );
        assert_eq!(out[0].channel_id, Some(222));
        assert_eq!(out[0].date_day, Some(day(2025, 7, 15)));
        assert_eq!(out[1].channel_id, Some(111));
        assert_eq!(out[1].date_day, Some(day(2025, 7, 14)));
        assert_eq!(out[2].channel_id, None);
        assert_eq!(out[2].date_day, None);
    }
}
