//! Archive → warehouse loaders.
//!
//! Both loaders scan the whole archive, skip units the ledger already holds, and
//! commit each remaining unit (raw rows + ledger entry) as one transaction. A unit
//! whose payload cannot be parsed is reported and left unloaded so a later run can
//! retry it; storage errors abort the run.

use anyhow::{Context, Result};
use chanlake_core::{DetectionSidecar, UnitKey, UnitKind};
use chanlake_storage::{
    record_identifier, ArchiveStore, CommitOutcome, LoadTarget, NewDetection,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value as JsonValue;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LoadFailure {
    pub unit_key: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LoadReport {
    pub scanned: usize,
    pub loaded: usize,
    /// Already in the ledger before this run.
    pub skipped: usize,
    /// Raw rows were already present without a ledger entry; only the entry was added.
    pub duplicates: usize,
    pub failures: Vec<LoadFailure>,
}

impl LoadReport {
    fn fail(&mut self, key: &UnitKey, reason: impl Into<String>) {
        let reason = reason.into();
        warn!(unit = %key, %reason, "skipping malformed archive unit");
        self.failures.push(LoadFailure {
            unit_key: key.ledger_key(),
            reason,
        });
    }

    fn committed(&mut self, outcome: CommitOutcome) {
        match outcome {
            CommitOutcome::Inserted => self.loaded += 1,
            CommitOutcome::Duplicate => self.duplicates += 1,
        }
    }
}

/// Load every message unit not yet recorded in the ledger.
pub async fn load_messages<T>(
    archive: &ArchiveStore,
    target: &T,
    loaded_at: DateTime<Utc>,
) -> Result<LoadReport>
where
    T: LoadTarget + ?Sized,
{
    let keys = archive
        .list_units(UnitKind::Message)
        .await
        .context("listing archived messages")?;
    let mut report = LoadReport {
        scanned: keys.len(),
        ..Default::default()
    };

    for key in keys {
        if target.is_loaded(&key).await? {
            report.skipped += 1;
            continue;
        }

        let bytes = archive
            .read_unit(&key)
            .await
            .with_context(|| format!("reading archive unit {key}"))?;
        let payload: JsonValue = match serde_json::from_slice(&bytes) {
            Ok(payload) => payload,
            Err(err) => {
                report.fail(&key, format!("invalid json: {err}"));
                continue;
            }
        };
        if !payload.is_object() {
            report.fail(&key, "payload is not a json object");
            continue;
        }
        if let Err(err) = record_identifier(&payload) {
            report.fail(&key, err.to_string());
            continue;
        }

        let content_hash = ArchiveStore::sha256_hex(&bytes);
        let outcome = target
            .commit_message(&key, &payload, &content_hash, loaded_at)
            .await
            .with_context(|| format!("committing {key}"))?;
        debug!(unit = %key, ?outcome, "message unit committed");
        report.committed(outcome);
    }

    info!(
        scanned = report.scanned,
        loaded = report.loaded,
        skipped = report.skipped,
        duplicates = report.duplicates,
        failed = report.failures.len(),
        "message load finished"
    );
    Ok(report)
}

/// Load every detection sidecar not yet recorded in the ledger.
pub async fn load_detections<T>(
    archive: &ArchiveStore,
    target: &T,
    loaded_at: DateTime<Utc>,
) -> Result<LoadReport>
where
    T: LoadTarget + ?Sized,
{
    let keys = archive
        .list_units(UnitKind::Detections)
        .await
        .context("listing archived detection sidecars")?;
    let mut report = LoadReport {
        scanned: keys.len(),
        ..Default::default()
    };

    for key in keys {
        if target.is_loaded(&key).await? {
            report.skipped += 1;
            continue;
        }

        let bytes = archive
            .read_unit(&key)
            .await
            .with_context(|| format!("reading archive unit {key}"))?;
        let sidecar: DetectionSidecar = match serde_json::from_slice(&bytes) {
            Ok(sidecar) => sidecar,
            Err(err) => {
                report.fail(&key, format!("invalid detection sidecar: {err}"));
                continue;
            }
        };
        let rows = match detection_rows(&key, &sidecar) {
            Ok(rows) => rows,
            Err(reason) => {
                report.fail(&key, reason);
                continue;
            }
        };

        let outcome = target
            .commit_detections(&key, &rows, loaded_at)
            .await
            .with_context(|| format!("committing {key}"))?;
        report.committed(outcome);
    }

    info!(
        scanned = report.scanned,
        loaded = report.loaded,
        skipped = report.skipped,
        failed = report.failures.len(),
        "detection load finished"
    );
    Ok(report)
}

fn detection_rows(key: &UnitKey, sidecar: &DetectionSidecar) -> Result<Vec<NewDetection>, String> {
    sidecar
        .detections
        .iter()
        .map(|det| {
            if !det.confidence.is_finite() {
                return Err(format!("non-finite confidence for {}", det.object_class));
            }
            let bounding_box = det
                .bounding_box
                .as_ref()
                .map(serde_json::to_string)
                .transpose()
                .map_err(|err| err.to_string())?;
            Ok(NewDetection {
                message_id: sidecar.message_id,
                channel: key.channel.clone(),
                image_path: sidecar.image_path.clone(),
                object_class: det.object_class.clone(),
                confidence_score: det.confidence,
                bounding_box,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chanlake_core::SidecarDetection;
    use chanlake_storage::{Ledger, MemoryWarehouse};
    use chrono::NaiveDate;
    use serde_json::json;
    use tempfile::tempdir;

    fn day() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 7, 14).unwrap()
    }

    #[tokio::test]
    async fn repeated_loads_do_not_duplicate_rows() {
        let dir = tempdir().unwrap();
        let archive = ArchiveStore::new(dir.path());
        for id in 1..=3 {
            archive
                .write_record(&json!({"id": id, "message": "hi"}), day(), "chemedapp")
                .await
                .unwrap();
        }
        let target = MemoryWarehouse::new();

        let first = load_messages(&archive, &target, Utc::now()).await.unwrap();
        let second = load_messages(&archive, &target, Utc::now()).await.unwrap();

        assert_eq!(first.loaded, 3);
        assert_eq!(second.loaded, 0);
        assert_eq!(second.skipped, 3);
        assert_eq!(target.raw_messages().await.unwrap().len(), 3);
        assert_eq!(target.entry_count().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn malformed_unit_is_reported_and_retried_later() {
        let dir = tempdir().unwrap();
        let archive = ArchiveStore::new(dir.path());
        archive
            .write_record(&json!({"id": 1}), day(), "chemedapp")
            .await
            .unwrap();
        let broken = dir.path().join("telegram_messages/2025-07-14/chemedapp/2.json");
        std::fs::write(&broken, b"{\"id\": 2,").unwrap();
        let target = MemoryWarehouse::new();

        let report = load_messages(&archive, &target, Utc::now()).await.unwrap();
        assert_eq!(report.loaded, 1);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(
            report.failures[0].unit_key,
            "telegram_messages/2025-07-14/chemedapp/2"
        );

        std::fs::write(&broken, b"{\"id\": 2}").unwrap();
        let retry = load_messages(&archive, &target, Utc::now()).await.unwrap();
        assert_eq!(retry.loaded, 1);
        assert_eq!(retry.skipped, 1);
        assert!(retry.failures.is_empty());
    }

    #[tokio::test]
    async fn payload_without_identifier_is_not_loaded() {
        let dir = tempdir().unwrap();
        let archive = ArchiveStore::new(dir.path());
        let path = dir.path().join("telegram_messages/2025-07-14/chemedapp/9.json");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, b"{\"message\": \"no id\"}").unwrap();
        let target = MemoryWarehouse::new();

        let report = load_messages(&archive, &target, Utc::now()).await.unwrap();
        assert_eq!(report.failures.len(), 1);
        assert_eq!(target.entry_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn sidecars_load_once_with_bounding_box_as_json() {
        let dir = tempdir().unwrap();
        let archive = ArchiveStore::new(dir.path());
        let sidecar = DetectionSidecar {
            message_id: 2,
            image_path: "images/2025-07-14/chemedapp/2.jpg".into(),
            detections: vec![
                SidecarDetection {
                    object_class: "bottle".into(),
                    confidence: 0.87,
                    bounding_box: Some(vec![10.0, 20.0, 110.0, 220.0]),
                },
                SidecarDetection {
                    object_class: "person".into(),
                    confidence: 0.55,
                    bounding_box: None,
                },
            ],
        };
        archive
            .write_detections(&sidecar, day(), "chemedapp")
            .await
            .unwrap();
        let target = MemoryWarehouse::new();

        let first = load_detections(&archive, &target, Utc::now()).await.unwrap();
        let second = load_detections(&archive, &target, Utc::now()).await.unwrap();
        assert_eq!(first.loaded, 1);
        assert_eq!(second.skipped, 1);

        let rows = target.raw_detections().await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].bounding_box.as_deref(), Some("[10.0,20.0,110.0,220.0]"));
        assert_eq!(rows[0].channel, "chemedapp");
        assert_eq!(rows[1].bounding_box, None);
    }
}
