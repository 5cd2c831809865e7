//! In-process load target. Keeps the same exactly-once contract as [`crate::Warehouse`]
//! behind a single mutex; nothing survives the process.

use std::collections::{BTreeMap, HashSet};

use async_trait::async_trait;
use chanlake_core::{RawDetection, RawRecord, UnitKey};
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use tokio::sync::Mutex;

use crate::error::Result;
use crate::ledger::{CommitOutcome, Ledger, LoadTarget, NewDetection};

#[derive(Debug, Default)]
struct MemoryState {
    ledger: BTreeMap<String, DateTime<Utc>>,
    raw_messages: BTreeMap<String, RawRecord>,
    raw_detections: Vec<RawDetection>,
    detection_identities: HashSet<(String, String, String)>,
}

#[derive(Debug, Default)]
pub struct MemoryWarehouse {
    state: Mutex<MemoryState>,
}

impl MemoryWarehouse {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Ledger for MemoryWarehouse {
    async fn is_loaded(&self, key: &UnitKey) -> Result<bool> {
        Ok(self.state.lock().await.ledger.contains_key(&key.ledger_key()))
    }

    async fn mark_loaded(&self, key: &UnitKey, loaded_at: DateTime<Utc>) -> Result<bool> {
        let mut state = self.state.lock().await;
        Ok(mark(&mut state, key, loaded_at))
    }

    async fn entry_count(&self) -> Result<u64> {
        Ok(self.state.lock().await.ledger.len() as u64)
    }
}

fn mark(state: &mut MemoryState, key: &UnitKey, loaded_at: DateTime<Utc>) -> bool {
    let ledger_key = key.ledger_key();
    if state.ledger.contains_key(&ledger_key) {
        return false;
    }
    state.ledger.insert(ledger_key, loaded_at);
    true
}

#[async_trait]
impl LoadTarget for MemoryWarehouse {
    async fn commit_message(
        &self,
        key: &UnitKey,
        payload: &JsonValue,
        content_hash: &str,
        loaded_at: DateTime<Utc>,
    ) -> Result<CommitOutcome> {
        let mut state = self.state.lock().await;
        let ledger_key = key.ledger_key();
        let outcome = if state.raw_messages.contains_key(&ledger_key) {
            CommitOutcome::Duplicate
        } else {
            state.raw_messages.insert(
                ledger_key,
                RawRecord {
                    unit_key: key.ledger_key(),
                    capture_date: key.capture_date,
                    channel: key.channel.clone(),
                    record_id: key.record_id.clone(),
                    payload: payload.clone(),
                    content_hash: content_hash.to_string(),
                    loaded_at,
                },
            );
            CommitOutcome::Inserted
        };
        mark(&mut state, key, loaded_at);
        Ok(outcome)
    }

    async fn commit_detections(
        &self,
        key: &UnitKey,
        detections: &[NewDetection],
        loaded_at: DateTime<Utc>,
    ) -> Result<CommitOutcome> {
        let mut state = self.state.lock().await;
        if state.ledger.contains_key(&key.ledger_key()) {
            return Ok(CommitOutcome::Duplicate);
        }
        for detection in detections {
            let identity = (
                detection.image_path.clone(),
                detection.object_class.clone(),
                detection.bounding_box.clone().unwrap_or_default(),
            );
            if !state.detection_identities.insert(identity) {
                continue;
            }
            let detection_id = state.raw_detections.len() as i64 + 1;
            state.raw_detections.push(RawDetection {
                detection_id,
                message_id: detection.message_id,
                channel: detection.channel.clone(),
                image_path: detection.image_path.clone(),
                object_class: detection.object_class.clone(),
                confidence_score: detection.confidence_score,
                bounding_box: detection.bounding_box.clone(),
                loaded_at,
            });
        }
        mark(&mut state, key, loaded_at);
        Ok(CommitOutcome::Inserted)
    }

    async fn raw_messages(&self) -> Result<Vec<RawRecord>> {
        Ok(self.state.lock().await.raw_messages.values().cloned().collect())
    }

    async fn raw_detections(&self) -> Result<Vec<RawDetection>> {
        Ok(self.state.lock().await.raw_detections.clone())
    }
}
