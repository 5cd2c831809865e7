//! Immutable raw archive + warehouse storage for chanlake.
//!
//! The archive is a date/channel partitioned directory tree with one JSON file per
//! captured record. The warehouse is a SQLite database holding the load ledger,
//! raw relations, and every relation rebuilt by the transform DAG.

use std::path::{Path, PathBuf};

use chanlake_core::{DetectionSidecar, UnitKey, UnitKind};
use chrono::NaiveDate;
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};
use uuid::Uuid;

mod error;
mod ledger;
mod memory;
mod warehouse;

pub use error::{ArchiveError, Result, WarehouseError};
pub use ledger::{CommitOutcome, Ledger, LoadTarget, NewDetection};
pub use memory::MemoryWarehouse;
pub use warehouse::{RunLock, Warehouse};

pub const CRATE_NAME: &str = "chanlake-storage";

/// Directory under the archive root holding photo media.
pub const MEDIA_DIR: &str = "images";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Written,
    /// A unit with the same identity already exists; the earlier write is kept.
    AlreadyPresent,
}

#[derive(Debug, Clone)]
pub struct ArchiveUnit {
    pub key: UnitKey,
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
    pub outcome: WriteOutcome,
}

#[derive(Debug, Clone)]
pub struct StoredMedia {
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub outcome: WriteOutcome,
}

/// Partitioned raw archive rooted at a directory.
///
/// Writes are first-write-wins: a unit that already exists is never replaced.
#[derive(Debug, Clone)]
pub struct ArchiveStore {
    root: PathBuf,
}

impl ArchiveStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    pub fn unit_relative_path(key: &UnitKey) -> PathBuf {
        PathBuf::from(key.kind.archive_dir())
            .join(key.capture_date.format("%Y-%m-%d").to_string())
            .join(&key.channel)
            .join(format!("{}.json", key.record_id))
    }

    pub fn unit_path(&self, key: &UnitKey) -> PathBuf {
        self.root.join(Self::unit_relative_path(key))
    }

    pub fn media_relative_path(capture_date: NaiveDate, channel: &str, record_id: &str) -> PathBuf {
        PathBuf::from(MEDIA_DIR)
            .join(capture_date.format("%Y-%m-%d").to_string())
            .join(channel)
            .join(format!("{record_id}.jpg"))
    }

    /// Archive one captured message. The record must carry an `id`; any other
    /// fields are kept verbatim.
    pub async fn write_record(
        &self,
        record: &JsonValue,
        capture_date: NaiveDate,
        channel: &str,
    ) -> Result<ArchiveUnit, ArchiveError> {
        let record_id = record_identifier(record)?;
        let key = UnitKey::new(
            UnitKind::Message,
            capture_date,
            path_component(channel)?,
            path_component(&record_id)?,
        );
        let bytes = serde_json::to_vec_pretty(record)?;
        self.write_unit(key, &bytes).await
    }

    pub async fn write_detections(
        &self,
        sidecar: &DetectionSidecar,
        capture_date: NaiveDate,
        channel: &str,
    ) -> Result<ArchiveUnit, ArchiveError> {
        let key = UnitKey::new(
            UnitKind::Detections,
            capture_date,
            path_component(channel)?,
            sidecar.message_id.to_string(),
        );
        let bytes = serde_json::to_vec_pretty(sidecar)?;
        self.write_unit(key, &bytes).await
    }

    pub async fn write_media(
        &self,
        capture_date: NaiveDate,
        channel: &str,
        record_id: &str,
        bytes: &[u8],
    ) -> Result<StoredMedia, ArchiveError> {
        let relative_path = Self::media_relative_path(
            capture_date,
            path_component(channel)?,
            path_component(record_id)?,
        );
        let absolute_path = self.root.join(&relative_path);
        let outcome = write_no_clobber(&absolute_path, bytes).await?;
        Ok(StoredMedia {
            relative_path,
            absolute_path,
            outcome,
        })
    }

    async fn write_unit(&self, key: UnitKey, bytes: &[u8]) -> Result<ArchiveUnit, ArchiveError> {
        let relative_path = Self::unit_relative_path(&key);
        let absolute_path = self.root.join(&relative_path);
        let outcome = write_no_clobber(&absolute_path, bytes).await?;

        let (content_hash, byte_size) = match outcome {
            WriteOutcome::Written => (Self::sha256_hex(bytes), bytes.len()),
            WriteOutcome::AlreadyPresent => {
                let existing = fs::read(&absolute_path)
                    .await
                    .map_err(ArchiveError::io(&absolute_path))?;
                (Self::sha256_hex(&existing), existing.len())
            }
        };
        debug!(unit = %key, ?outcome, "archive unit write");

        Ok(ArchiveUnit {
            key,
            content_hash,
            relative_path,
            absolute_path,
            byte_size,
            outcome,
        })
    }

    pub async fn read_unit(&self, key: &UnitKey) -> Result<Vec<u8>, ArchiveError> {
        let path = self.unit_path(key);
        fs::read(&path).await.map_err(ArchiveError::io(&path))
    }

    /// Enumerate every unit of `kind` currently in the archive, in key order.
    ///
    /// Entries that do not follow the `{date}/{channel}/{id}.json` layout are skipped.
    pub async fn list_units(&self, kind: UnitKind) -> Result<Vec<UnitKey>, ArchiveError> {
        let base = self.root.join(kind.archive_dir());
        if !fs::try_exists(&base).await.map_err(ArchiveError::io(&base))? {
            return Ok(Vec::new());
        }

        let mut keys = Vec::new();
        for date_dir in sub_dirs(&base).await? {
            let Some(date_name) = file_name(&date_dir) else {
                continue;
            };
            let Ok(capture_date) = NaiveDate::parse_from_str(&date_name, "%Y-%m-%d") else {
                warn!(path = %date_dir.display(), "skipping non-date archive partition");
                continue;
            };
            for channel_dir in sub_dirs(&date_dir).await? {
                let Some(channel) = file_name(&channel_dir) else {
                    continue;
                };
                let mut entries = fs::read_dir(&channel_dir)
                    .await
                    .map_err(ArchiveError::io(&channel_dir))?;
                while let Some(entry) = entries
                    .next_entry()
                    .await
                    .map_err(ArchiveError::io(&channel_dir))?
                {
                    let path = entry.path();
                    if path.extension().and_then(|e| e.to_str()) != Some("json") {
                        continue;
                    }
                    let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                        continue;
                    };
                    if stem.starts_with('.') {
                        continue;
                    }
                    keys.push(UnitKey::new(kind, capture_date, channel.clone(), stem));
                }
            }
        }
        keys.sort();
        Ok(keys)
    }
}

/// Stable identifier of a captured record: its `id` field as text.
pub fn record_identifier(record: &JsonValue) -> Result<String, ArchiveError> {
    match record.get("id") {
        Some(JsonValue::Number(n)) => Ok(n.to_string()),
        Some(JsonValue::String(s)) if !s.trim().is_empty() => Ok(s.trim().to_string()),
        _ => Err(ArchiveError::MissingIdentifier),
    }
}

fn path_component(value: &str) -> Result<&str, ArchiveError> {
    let ok = !value.is_empty()
        && !value.starts_with('.')
        && !value.contains(['/', '\\'])
        && value.chars().all(|c| !c.is_control());
    if ok {
        Ok(value)
    } else {
        Err(ArchiveError::InvalidComponent(value.to_string()))
    }
}

/// Write bytes to `path` only if nothing is there yet: temp file, then hard link,
/// so the target is either absent or complete.
async fn write_no_clobber(path: &Path, bytes: &[u8]) -> Result<WriteOutcome, ArchiveError> {
    let parent = path
        .parent()
        .ok_or_else(|| ArchiveError::InvalidComponent(path.display().to_string()))?;
    fs::create_dir_all(parent)
        .await
        .map_err(ArchiveError::io(parent))?;

    if fs::try_exists(path).await.map_err(ArchiveError::io(path))? {
        return Ok(WriteOutcome::AlreadyPresent);
    }

    let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .map_err(ArchiveError::io(&temp_path))?;
    file.write_all(bytes)
        .await
        .map_err(ArchiveError::io(&temp_path))?;
    file.sync_all()
        .await
        .map_err(ArchiveError::io(&temp_path))?;
    drop(file);

    let linked = fs::hard_link(&temp_path, path).await;
    let _ = fs::remove_file(&temp_path).await;
    match linked {
        Ok(()) => Ok(WriteOutcome::Written),
        Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
            Ok(WriteOutcome::AlreadyPresent)
        }
        Err(err) => Err(ArchiveError::Io {
            path: path.to_path_buf(),
            source: err,
        }),
    }
}

async fn sub_dirs(dir: &Path) -> Result<Vec<PathBuf>, ArchiveError> {
    let mut out = Vec::new();
    let mut entries = fs::read_dir(dir).await.map_err(ArchiveError::io(dir))?;
    while let Some(entry) = entries.next_entry().await.map_err(ArchiveError::io(dir))? {
        let is_dir = entry
            .file_type()
            .await
            .map_err(ArchiveError::io(entry.path()))?
            .is_dir();
        if is_dir {
            out.push(entry.path());
        }
    }
    out.sort();
    Ok(out)
}

fn file_name(path: &Path) -> Option<String> {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(ToString::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    fn day() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 7, 14).expect("date")
    }

    #[test]
    fn archive_hashing_is_stable() {
        let hash = ArchiveStore::sha256_hex(b"hello world");
        assert_eq!(
            hash,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[tokio::test]
    async fn second_write_of_same_identity_is_rejected() {
        let dir = tempdir().expect("tempdir");
        let store = ArchiveStore::new(dir.path());

        let first = store
            .write_record(&json!({"id": 7, "message": "first"}), day(), "chemedapp")
            .await
            .expect("first write");
        let second = store
            .write_record(&json!({"id": 7, "message": "retry"}), day(), "chemedapp")
            .await
            .expect("second write");

        assert_eq!(first.outcome, WriteOutcome::Written);
        assert_eq!(second.outcome, WriteOutcome::AlreadyPresent);
        assert_eq!(first.content_hash, second.content_hash);
        assert_eq!(
            first.relative_path,
            PathBuf::from("telegram_messages/2025-07-14/chemedapp/7.json")
        );

        let stored: JsonValue =
            serde_json::from_slice(&store.read_unit(&first.key).await.expect("read")).expect("json");
        assert_eq!(stored["message"], "first");
    }

    #[tokio::test]
    async fn unknown_fields_are_preserved() {
        let dir = tempdir().expect("tempdir");
        let store = ArchiveStore::new(dir.path());
        let record = json!({"id": "9", "_": "Message", "reactions": {"results": []}});
        let unit = store
            .write_record(&record, day(), "tikvahpharma")
            .await
            .expect("write");
        let stored: JsonValue =
            serde_json::from_slice(&store.read_unit(&unit.key).await.expect("read")).expect("json");
        assert_eq!(stored, record);
    }

    #[tokio::test]
    async fn records_without_identifier_or_with_unsafe_channel_are_refused() {
        let dir = tempdir().expect("tempdir");
        let store = ArchiveStore::new(dir.path());
        assert!(matches!(
            store.write_record(&json!({"message": "x"}), day(), "c").await,
            Err(ArchiveError::MissingIdentifier)
        ));
        assert!(matches!(
            store.write_record(&json!({"id": 1}), day(), "../etc").await,
            Err(ArchiveError::InvalidComponent(_))
        ));
    }

    #[tokio::test]
    async fn listing_is_sorted_and_skips_foreign_entries() {
        let dir = tempdir().expect("tempdir");
        let store = ArchiveStore::new(dir.path());
        for id in [3, 1, 2] {
            store
                .write_record(&json!({"id": id}), day(), "chemedapp")
                .await
                .expect("write");
        }
        let stray = dir.path().join("telegram_messages/not-a-date/chemedapp");
        std::fs::create_dir_all(&stray).expect("mkdir");
        std::fs::write(stray.join("5.json"), b"{}").expect("write stray");
        std::fs::write(
            dir.path().join("telegram_messages/2025-07-14/chemedapp/notes.txt"),
            b"x",
        )
        .expect("write txt");

        let keys = store.list_units(UnitKind::Message).await.expect("list");
        let ids: Vec<_> = keys.iter().map(|k| k.record_id.as_str()).collect();
        assert_eq!(ids, vec!["1", "2", "3"]);
        assert!(store
            .list_units(UnitKind::Detections)
            .await
            .expect("list detections")
            .is_empty());
    }

    #[tokio::test]
    async fn media_is_written_once() {
        let dir = tempdir().expect("tempdir");
        let store = ArchiveStore::new(dir.path());
        let first = store
            .write_media(day(), "chemedapp", "2", b"jpeg-bytes")
            .await
            .expect("media");
        let second = store
            .write_media(day(), "chemedapp", "2", b"other")
            .await
            .expect("media again");
        assert_eq!(first.outcome, WriteOutcome::Written);
        assert_eq!(second.outcome, WriteOutcome::AlreadyPresent);
        assert_eq!(std::fs::read(&first.absolute_path).expect("read"), b"jpeg-bytes");
    }
}
