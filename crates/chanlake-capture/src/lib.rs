//! Capture-source contracts + the export-file capture adapter.
//!
//! A capture source hands over already-fetched channel messages; this crate only
//! decides where they land in the raw archive. Network and session handling of the
//! messaging platform live outside the pipeline.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chanlake_core::{parse_posted_at, PHOTO_MEDIA_SENTINEL};
use chanlake_storage::{record_identifier, ArchiveError, ArchiveStore, WriteOutcome};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::fs;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "chanlake-capture";

/// Channels captured when none are named explicitly.
pub const DEFAULT_CHANNELS: [&str; 3] = ["chemedapp", "lobelia4cosmetics", "tikvahpharma"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptureContext {
    pub run_id: Uuid,
    pub captured_at: DateTime<Utc>,
}

impl CaptureContext {
    pub fn now() -> Self {
        Self {
            run_id: Uuid::new_v4(),
            captured_at: Utc::now(),
        }
    }
}

/// One message as handed over by a capture source.
#[derive(Debug, Clone, PartialEq)]
pub struct CapturedMessage {
    pub channel: String,
    pub record_id: String,
    pub payload: JsonValue,
    pub photo: Option<Vec<u8>>,
}

impl CapturedMessage {
    pub fn from_payload(channel: &str, payload: JsonValue) -> Result<Self, CaptureError> {
        let record_id = record_identifier(&payload)?;
        Ok(Self {
            channel: channel.to_string(),
            record_id,
            payload,
            photo: None,
        })
    }

    pub fn has_photo(&self) -> bool {
        self.payload
            .get("media")
            .and_then(|m| m.get("_"))
            .and_then(JsonValue::as_str)
            == Some(PHOTO_MEDIA_SENTINEL)
    }

    /// Partition date: the message's own posting date, or the capture date when
    /// the payload date is absent or unreadable.
    pub fn partition_date(&self, ctx: &CaptureContext) -> NaiveDate {
        self.payload
            .get("date")
            .and_then(JsonValue::as_str)
            .and_then(parse_posted_at)
            .map(|ts| ts.date_naive())
            .unwrap_or_else(|| ctx.captured_at.date_naive())
    }
}

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("reading {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("parsing {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("export file {} is not a JSON array of messages", .0.display())]
    NotAnArray(PathBuf),

    #[error(transparent)]
    Archive(#[from] ArchiveError),
}

#[async_trait]
pub trait CaptureSource: Send + Sync {
    fn source_id(&self) -> &str;

    async fn fetch_channel(
        &self,
        ctx: &CaptureContext,
        channel: &str,
    ) -> Result<Vec<CapturedMessage>, CaptureError>;
}

/// Reads channel exports from a directory: `{root}/{channel}.json` holds a JSON
/// array of message objects, `{root}/media/{channel}/{id}.jpg` the photos.
#[derive(Debug, Clone)]
pub struct ExportDirSource {
    root: PathBuf,
    limit: Option<usize>,
}

impl ExportDirSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            limit: None,
        }
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn export_path(&self, channel: &str) -> PathBuf {
        self.root.join(format!("{channel}.json"))
    }

    fn media_path(&self, channel: &str, record_id: &str) -> PathBuf {
        self.root
            .join("media")
            .join(channel)
            .join(format!("{record_id}.jpg"))
    }
}

#[async_trait]
impl CaptureSource for ExportDirSource {
    fn source_id(&self) -> &str {
        "export-dir"
    }

    async fn fetch_channel(
        &self,
        _ctx: &CaptureContext,
        channel: &str,
    ) -> Result<Vec<CapturedMessage>, CaptureError> {
        let path = self.export_path(channel);
        let exists = fs::try_exists(&path).await.map_err(|source| CaptureError::Io {
            path: path.clone(),
            source,
        })?;
        if !exists {
            warn!(channel, path = %path.display(), "no export file for channel");
            return Ok(Vec::new());
        }

        let text = fs::read_to_string(&path)
            .await
            .map_err(|source| CaptureError::Io {
                path: path.clone(),
                source,
            })?;
        let value: JsonValue = serde_json::from_str(&text).map_err(|source| CaptureError::Parse {
            path: path.clone(),
            source,
        })?;
        let JsonValue::Array(items) = value else {
            return Err(CaptureError::NotAnArray(path));
        };

        let mut messages = Vec::with_capacity(items.len());
        for payload in items.into_iter().take(self.limit.unwrap_or(usize::MAX)) {
            let mut message = match CapturedMessage::from_payload(channel, payload) {
                Ok(message) => message,
                Err(err) => {
                    warn!(channel, error = %err, "skipping exported message");
                    continue;
                }
            };
            if message.has_photo() {
                let media = self.media_path(channel, &message.record_id);
                match fs::read(&media).await {
                    Ok(bytes) => message.photo = Some(bytes),
                    Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                    Err(source) => return Err(CaptureError::Io { path: media, source }),
                }
            }
            messages.push(message);
        }
        Ok(messages)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ChannelCaptureSummary {
    pub channel: String,
    pub messages_written: usize,
    pub messages_already_present: usize,
    pub media_written: usize,
    pub failures: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CaptureSummary {
    pub run_id: Uuid,
    pub source_id: String,
    pub channels: Vec<ChannelCaptureSummary>,
}

impl CaptureSummary {
    pub fn messages_written(&self) -> usize {
        self.channels.iter().map(|c| c.messages_written).sum()
    }
}

/// Pull every channel from `source` and write its messages into the archive.
///
/// A channel that cannot be fetched is reported and skipped; the other channels
/// still run. Only archive I/O failures abort.
pub async fn capture_into_archive(
    source: &dyn CaptureSource,
    store: &ArchiveStore,
    ctx: &CaptureContext,
    channels: &[String],
) -> Result<CaptureSummary, CaptureError> {
    let mut summaries = Vec::with_capacity(channels.len());
    for channel in channels {
        let span = info_span!("capture_channel", run_id = %ctx.run_id, channel = %channel);
        let summary = capture_channel(source, store, ctx, channel)
            .instrument(span)
            .await?;
        info!(
            channel = %summary.channel,
            written = summary.messages_written,
            already_present = summary.messages_already_present,
            media = summary.media_written,
            failures = summary.failures.len(),
            "channel capture finished"
        );
        summaries.push(summary);
    }

    Ok(CaptureSummary {
        run_id: ctx.run_id,
        source_id: source.source_id().to_string(),
        channels: summaries,
    })
}

async fn capture_channel(
    source: &dyn CaptureSource,
    store: &ArchiveStore,
    ctx: &CaptureContext,
    channel: &str,
) -> Result<ChannelCaptureSummary, CaptureError> {
    let mut summary = ChannelCaptureSummary {
        channel: channel.to_string(),
        ..Default::default()
    };

    let messages = match source.fetch_channel(ctx, channel).await {
        Ok(messages) => messages,
        Err(err) => {
            warn!(channel, error = %err, "channel capture failed");
            summary.failures.push(err.to_string());
            return Ok(summary);
        }
    };

    for message in messages {
        let date = message.partition_date(ctx);
        let unit = match store.write_record(&message.payload, date, &message.channel).await {
            Ok(unit) => unit,
            Err(err @ (ArchiveError::MissingIdentifier | ArchiveError::InvalidComponent(_))) => {
                summary
                    .failures
                    .push(format!("{}: {err}", message.record_id));
                continue;
            }
            Err(err) => return Err(err.into()),
        };
        match unit.outcome {
            WriteOutcome::Written => summary.messages_written += 1,
            WriteOutcome::AlreadyPresent => summary.messages_already_present += 1,
        }

        if let Some(photo) = &message.photo {
            let media = store
                .write_media(date, &message.channel, &message.record_id, photo)
                .await?;
            if media.outcome == WriteOutcome::Written {
                summary.media_written += 1;
            }
        }
    }
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chanlake_core::UnitKind;
    use serde_json::json;
    use tempfile::tempdir;

    fn fixture_root() -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR")).join("../../fixtures/capture")
    }

    fn ctx() -> CaptureContext {
        CaptureContext {
            run_id: Uuid::nil(),
            captured_at: DateTime::parse_from_rfc3339("2025-07-20T08:00:00Z")
                .unwrap()
                .with_timezone(&Utc),
        }
    }

    fn read_snapshot(path: &Path) -> JsonValue {
        serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap()
    }

    #[test]
    fn photo_sentinel_and_partition_date_come_from_payload() {
        let msg = CapturedMessage::from_payload(
            "chemedapp",
            json!({"id": 2, "date": "2025-07-14 09:30:00+00:00", "media": {"_": "MessageMediaPhoto"}}),
        )
        .unwrap();
        assert!(msg.has_photo());
        assert_eq!(msg.partition_date(&ctx()), NaiveDate::from_ymd_opt(2025, 7, 14).unwrap());

        let undated = CapturedMessage::from_payload(
            "chemedapp",
            json!({"id": 3, "date": "yesterday", "media": {"_": "MessageMediaDocument"}}),
        )
        .unwrap();
        assert!(!undated.has_photo());
        assert_eq!(undated.partition_date(&ctx()), NaiveDate::from_ymd_opt(2025, 7, 20).unwrap());
    }

    #[tokio::test]
    async fn golden_archive_layout_for_export_fixture() {
        let dir = tempdir().unwrap();
        let store = ArchiveStore::new(dir.path());
        let source = ExportDirSource::new(fixture_root());
        let channels: Vec<String> = DEFAULT_CHANNELS.iter().map(|c| c.to_string()).collect();

        let summary = capture_into_archive(&source, &store, &ctx(), &channels)
            .await
            .unwrap();
        assert_eq!(summary.messages_written(), 3);
        assert_eq!(summary.channels[0].media_written, 1);
        assert!(summary.channels[1].failures.is_empty());

        let keys: Vec<String> = store
            .list_units(UnitKind::Message)
            .await
            .unwrap()
            .iter()
            .map(ToString::to_string)
            .collect();
        let expected = read_snapshot(&fixture_root().join("expected_units.json"));
        assert_eq!(json!(keys), expected);
        assert!(dir
            .path()
            .join("images/2025-07-14/chemedapp/2.jpg")
            .exists());
    }

    #[tokio::test]
    async fn recapture_is_first_write_wins() {
        let dir = tempdir().unwrap();
        let store = ArchiveStore::new(dir.path());
        let source = ExportDirSource::new(fixture_root());
        let channels = vec!["chemedapp".to_string()];

        capture_into_archive(&source, &store, &ctx(), &channels)
            .await
            .unwrap();
        let again = capture_into_archive(&source, &store, &ctx(), &channels)
            .await
            .unwrap();
        assert_eq!(again.messages_written(), 0);
        assert_eq!(again.channels[0].messages_already_present, 3);
        assert_eq!(again.channels[0].media_written, 0);
    }

    #[tokio::test]
    async fn export_limit_caps_messages_per_channel() {
        let source = ExportDirSource::new(fixture_root()).with_limit(2);
        let messages = source.fetch_channel(&ctx(), "chemedapp").await.unwrap();
        assert_eq!(messages.len(), 2);
    }
}
