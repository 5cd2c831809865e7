//! Load ledger contract: which archive units have been committed to the warehouse.

use async_trait::async_trait;
use chanlake_core::{RawDetection, RawRecord, UnitKey};
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;

use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    /// Raw rows and the ledger entry were written together.
    Inserted,
    /// The unit was already present; nothing new was written.
    Duplicate,
}

/// A parsed detection awaiting insertion into the raw detection relation.
#[derive(Debug, Clone, PartialEq)]
pub struct NewDetection {
    pub message_id: i64,
    pub channel: String,
    pub image_path: String,
    pub object_class: String,
    pub confidence_score: f64,
    pub bounding_box: Option<String>,
}

/// Durable key-set of loaded units.
///
/// Readers may run concurrently; `mark_loaded` is atomic per key and returns
/// `false` when the key was already present.
#[async_trait]
pub trait Ledger: Send + Sync {
    async fn is_loaded(&self, key: &UnitKey) -> Result<bool>;
    async fn mark_loaded(&self, key: &UnitKey, loaded_at: DateTime<Utc>) -> Result<bool>;
    async fn entry_count(&self) -> Result<u64>;
}

/// Warehouse side of a load: raw rows plus the ledger entry, committed as one unit.
#[async_trait]
pub trait LoadTarget: Ledger {
    async fn commit_message(
        &self,
        key: &UnitKey,
        payload: &JsonValue,
        content_hash: &str,
        loaded_at: DateTime<Utc>,
    ) -> Result<CommitOutcome>;

    async fn commit_detections(
        &self,
        key: &UnitKey,
        detections: &[NewDetection],
        loaded_at: DateTime<Utc>,
    ) -> Result<CommitOutcome>;

    async fn raw_messages(&self) -> Result<Vec<RawRecord>>;
    async fn raw_detections(&self) -> Result<Vec<RawDetection>>;
}
