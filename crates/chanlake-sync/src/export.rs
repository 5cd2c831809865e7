//! Parquet snapshots of the mart relations plus a checksummed manifest.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow_array::{
    ArrayRef, BooleanArray, Date32Array, Float64Array, Int64Array, RecordBatch, StringArray,
    TimestampMicrosecondArray,
};
use arrow_schema::{DataType, Field as ArrowField, Schema, TimeUnit};
use chanlake_core::{relations, ColumnDef, ColumnType, Table, Value};
use chanlake_storage::Warehouse;
use chrono::NaiveDate;
use parquet::arrow::ArrowWriter;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::info;

/// Relations written by `export`, in manifest order.
pub const SNAPSHOT_RELATIONS: [&str; 4] = [
    relations::DIM_CHANNELS,
    relations::DIM_DATES,
    relations::FCT_MESSAGES,
    relations::FCT_DETECTIONS,
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParquetManifest {
    pub schema_version: u32,
    pub files: Vec<ParquetManifestFile>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParquetManifestFile {
    pub name: String,
    pub path: String,
    pub rows: usize,
    pub sha256: String,
    pub bytes: u64,
}

fn arrow_type(ty: ColumnType) -> DataType {
    match ty {
        ColumnType::Integer => DataType::Int64,
        ColumnType::Real => DataType::Float64,
        ColumnType::Text => DataType::Utf8,
        ColumnType::Boolean => DataType::Boolean,
        ColumnType::Date => DataType::Date32,
        ColumnType::Timestamp => DataType::Timestamp(TimeUnit::Microsecond, Some("UTC".into())),
    }
}

fn epoch_days(date: &NaiveDate) -> Option<i32> {
    let epoch = NaiveDate::from_ymd_opt(1970, 1, 1)?;
    i32::try_from(date.signed_duration_since(epoch).num_days()).ok()
}

fn column_array(table: &Table, idx: usize, column: &ColumnDef) -> ArrayRef {
    let cells = table.rows.iter().map(|row| &row[idx]);
    match column.ty {
        ColumnType::Integer => Arc::new(Int64Array::from(
            cells
                .map(|v| match v {
                    Value::Integer(n) => Some(*n),
                    _ => None,
                })
                .collect::<Vec<_>>(),
        )),
        ColumnType::Real => Arc::new(Float64Array::from(
            cells
                .map(|v| match v {
                    Value::Real(n) => Some(*n),
                    _ => None,
                })
                .collect::<Vec<_>>(),
        )),
        ColumnType::Text => Arc::new(StringArray::from(
            cells
                .map(|v| match v {
                    Value::Text(s) => Some(s.as_str()),
                    _ => None,
                })
                .collect::<Vec<_>>(),
        )),
        ColumnType::Boolean => Arc::new(BooleanArray::from(
            cells
                .map(|v| match v {
                    Value::Boolean(b) => Some(*b),
                    _ => None,
                })
                .collect::<Vec<_>>(),
        )),
        ColumnType::Date => Arc::new(Date32Array::from(
            cells
                .map(|v| match v {
                    Value::Date(d) => epoch_days(d),
                    _ => None,
                })
                .collect::<Vec<_>>(),
        )),
        ColumnType::Timestamp => Arc::new(
            TimestampMicrosecondArray::from(
                cells
                    .map(|v| match v {
                        Value::Timestamp(ts) => Some(ts.timestamp_micros()),
                        _ => None,
                    })
                    .collect::<Vec<_>>(),
            )
            .with_timezone("UTC"),
        ),
    }
}

pub fn table_batch(table: &Table) -> Result<RecordBatch> {
    let schema = Arc::new(Schema::new(
        table
            .columns
            .iter()
            .map(|c| ArrowField::new(c.name, arrow_type(c.ty), c.nullable))
            .collect::<Vec<_>>(),
    ));
    let arrays = table
        .columns
        .iter()
        .enumerate()
        .map(|(idx, column)| column_array(table, idx, column))
        .collect::<Vec<_>>();
    RecordBatch::try_new(schema, arrays)
        .with_context(|| format!("building {} record batch", table.name))
}

fn write_parquet(path: &Path, batch: RecordBatch) -> Result<()> {
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), None)
        .with_context(|| format!("opening parquet writer {}", path.display()))?;
    writer
        .write(&batch)
        .with_context(|| format!("writing record batch {}", path.display()))?;
    writer
        .close()
        .with_context(|| format!("closing parquet writer {}", path.display()))?;
    Ok(())
}

fn manifest_entry(name: &str, rows: usize, base: &Path, path: &Path) -> Result<ParquetManifestFile> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    let sha256 = hex::encode(hasher.finalize());
    let rel = path
        .strip_prefix(base)
        .unwrap_or(path)
        .display()
        .to_string();
    Ok(ParquetManifestFile {
        name: name.to_string(),
        path: rel,
        rows,
        sha256,
        bytes: bytes.len() as u64,
    })
}

/// Write `tables` under `{run_dir}/snapshots/` and return the manifest path.
pub fn write_snapshots(run_dir: &Path, tables: &[Table]) -> Result<PathBuf> {
    let snapshot_dir = run_dir.join("snapshots");
    std::fs::create_dir_all(&snapshot_dir)
        .with_context(|| format!("creating {}", snapshot_dir.display()))?;

    let mut files = Vec::with_capacity(tables.len());
    for table in tables {
        let path = snapshot_dir.join(format!("{}.parquet", table.name));
        write_parquet(&path, table_batch(table)?)?;
        files.push(manifest_entry(&table.name, table.len(), run_dir, &path)?);
    }

    let manifest = ParquetManifest {
        schema_version: 1,
        files,
    };
    let manifest_path = snapshot_dir.join("manifest.json");
    let bytes = serde_json::to_vec_pretty(&manifest).context("serializing parquet manifest")?;
    std::fs::write(&manifest_path, bytes)
        .with_context(|| format!("writing {}", manifest_path.display()))?;
    info!(manifest = %manifest_path.display(), files = manifest.files.len(), "parquet snapshots written");
    Ok(manifest_path)
}

/// Read every mart relation from the warehouse and snapshot it.
pub async fn export_marts(warehouse: &Warehouse, run_dir: &Path) -> Result<PathBuf> {
    let mut tables = Vec::with_capacity(SNAPSHOT_RELATIONS.len());
    for name in SNAPSHOT_RELATIONS {
        tables.push(
            warehouse
                .read_relation(name)
                .await
                .with_context(|| format!("reading {name} for export"))?,
        );
    }
    let run_dir = run_dir.to_path_buf();
    tokio::task::spawn_blocking(move || write_snapshots(&run_dir, &tables))
        .await
        .context("parquet export task panicked")?
}

#[cfg(test)]
mod tests {
    use super::*;
    use chanlake_core::{DimDate, FactMessage};
    use chrono::{TimeZone, Utc};
    use parquet::file::reader::{FileReader, SerializedFileReader};
    use tempfile::tempdir;

    #[test]
    fn snapshot_manifest_lists_checksummed_files() {
        let dir = tempdir().unwrap();
        let day = NaiveDate::from_ymd_opt(2025, 7, 14).unwrap();
        let dates = Table::from_rows(&[DimDate::for_day(day)]);
        let facts = Table::from_rows(&[FactMessage {
            channel: "chemedapp".into(),
            message_id: Some(1),
            channel_id: None,
            date_day: Some(day),
            posted_at: Utc.with_ymd_and_hms(2025, 7, 14, 9, 0, 0).single(),
            message_text: Some("hi".into()),
            message_length: Some(2),
            view_count: None,
            sender_id: None,
            has_photo: true,
        }]);

        let manifest_path = write_snapshots(dir.path(), &[dates, facts]).unwrap();
        let manifest: ParquetManifest =
            serde_json::from_slice(&std::fs::read(&manifest_path).unwrap()).unwrap();

        assert_eq!(manifest.files.len(), 2);
        assert_eq!(manifest.files[1].path, "snapshots/fct_messages.parquet");
        assert_eq!(manifest.files[1].sha256.len(), 64);

        let file = File::open(dir.path().join("snapshots/fct_messages.parquet")).unwrap();
        let reader = SerializedFileReader::new(file).unwrap();
        assert_eq!(reader.metadata().file_metadata().num_rows(), 1);
    }

    #[test]
    fn epoch_day_conversion() {
        assert_eq!(epoch_days(&NaiveDate::from_ymd_opt(1970, 1, 2).unwrap()), Some(1));
    }
}
