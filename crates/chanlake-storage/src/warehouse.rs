//! SQLite warehouse: load ledger, raw relations, run locks, and rebuilt relations.

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chanlake_core::{
    relation_columns, ColumnDef, ColumnType, RawDetection, RawRecord, Table, UnitKey, Value,
};
use chrono::{DateTime, NaiveDate, Utc};
use serde_json::Value as JsonValue;
use sqlx::pool::PoolConnection;
use sqlx::query::Query;
use sqlx::sqlite::{
    Sqlite, SqliteArguments, SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow,
};
use sqlx::{Row, SqliteConnection, SqlitePool};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{Result, WarehouseError};
use crate::ledger::{CommitOutcome, Ledger, LoadTarget, NewDetection};

/// Warehouse DDL; idempotent thanks to `IF NOT EXISTS`.
const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS load_ledger (
    unit_key   TEXT PRIMARY KEY,
    loaded_at  TEXT NOT NULL
);

-- Owned by the loader. One row per loaded message unit; never updated.
CREATE TABLE IF NOT EXISTS raw_messages (
    unit_key     TEXT PRIMARY KEY,
    capture_date TEXT NOT NULL,
    channel      TEXT NOT NULL,
    record_id    TEXT NOT NULL,
    payload      TEXT NOT NULL,   -- verbatim captured JSON
    content_hash TEXT NOT NULL,
    loaded_at    TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS raw_image_detections (
    detection_id     INTEGER PRIMARY KEY AUTOINCREMENT,
    message_id       INTEGER NOT NULL,
    channel          TEXT NOT NULL,
    image_path       TEXT NOT NULL,
    object_class     TEXT NOT NULL,
    confidence_score REAL NOT NULL,
    bounding_box     TEXT,            -- JSON [x1, y1, x2, y2] or NULL
    loaded_at        TEXT NOT NULL
);

CREATE UNIQUE INDEX IF NOT EXISTS raw_image_detections_identity
    ON raw_image_detections(image_path, object_class, IFNULL(bounding_box, ''));
CREATE INDEX IF NOT EXISTS raw_image_detections_message_idx
    ON raw_image_detections(message_id);

CREATE TABLE IF NOT EXISTS run_locks (
    name        TEXT PRIMARY KEY,
    holder      TEXT NOT NULL,
    acquired_at TEXT NOT NULL
);
";

/// A held run-level lock. Release it with [`Warehouse::release_lock`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunLock {
    pub name: String,
    pub holder: String,
    pub acquired_at: DateTime<Utc>,
}

/// SQLite-backed warehouse. Cloning is cheap; the pool is shared.
#[derive(Debug, Clone)]
pub struct Warehouse {
    pool: SqlitePool,
}

impl Warehouse {
    /// Open (or create) the warehouse at a `sqlite:` URL and apply the schema.
    pub async fn connect(database_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)?;
        Self::open_with(options, 4).await
    }

    pub async fn open_path(path: impl AsRef<Path>) -> Result<Self> {
        let options = SqliteConnectOptions::new().filename(path.as_ref());
        Self::open_with(options, 4).await
    }

    /// In-memory warehouse on a single connection, for tests.
    pub async fn open_in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        Self::open_with(options, 1).await
    }

    async fn open_with(options: SqliteConnectOptions, max_connections: u32) -> Result<Self> {
        let options = options
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(10));
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;
        let warehouse = Self { pool };
        warehouse.migrate().await?;
        Ok(warehouse)
    }

    pub async fn migrate(&self) -> Result<()> {
        sqlx::raw_sql(SCHEMA).execute(&self.pool).await?;
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// BEGIN IMMEDIATE takes the write lock up front so concurrent writers queue
    /// instead of failing to upgrade a read transaction.
    async fn begin_immediate(&self) -> Result<PoolConnection<Sqlite>> {
        let mut conn = self.pool.acquire().await?;
        sqlx::query("BEGIN IMMEDIATE").execute(&mut *conn).await?;
        Ok(conn)
    }

    /// Commit on success, roll back otherwise. A failed COMMIT is rolled back too
    /// so the connection never returns to the pool inside a transaction.
    async fn finish<T>(conn: &mut SqliteConnection, result: Result<T>) -> Result<T> {
        let outcome = match result {
            Ok(value) => sqlx::query("COMMIT")
                .execute(&mut *conn)
                .await
                .map(|_| value)
                .map_err(WarehouseError::from),
            Err(err) => Err(err),
        };
        if outcome.is_err() {
            rollback(conn).await;
        }
        outcome
    }

    pub async fn raw_message_count(&self) -> Result<u64> {
        count(&self.pool, "SELECT COUNT(*) FROM raw_messages").await
    }

    pub async fn raw_detection_count(&self) -> Result<u64> {
        count(&self.pool, "SELECT COUNT(*) FROM raw_image_detections").await
    }

    /// Take the named run lock. A lock older than `stale_after` is assumed to
    /// belong to a crashed run and is taken over.
    pub async fn acquire_lock(&self, name: &str, stale_after: Duration) -> Result<RunLock> {
        let lock = RunLock {
            name: name.to_string(),
            holder: format!("pid{}-{}", std::process::id(), Uuid::new_v4()),
            acquired_at: Utc::now(),
        };
        let mut conn = self.begin_immediate().await?;
        let result = Self::acquire_in(&mut conn, &lock, stale_after).await;
        Self::finish(&mut conn, result).await?;
        Ok(lock)
    }

    async fn acquire_in(
        conn: &mut SqliteConnection,
        lock: &RunLock,
        stale_after: Duration,
    ) -> Result<()> {
        let existing = sqlx::query("SELECT holder, acquired_at FROM run_locks WHERE name = ?")
            .bind(&lock.name)
            .fetch_optional(&mut *conn)
            .await?;

        if let Some(row) = existing {
            let holder: String = row.try_get("holder")?;
            let acquired_at = parse_timestamp("run_locks", "acquired_at", &row.try_get::<String, _>("acquired_at")?)?;
            let fresh = (lock.acquired_at - acquired_at)
                .to_std()
                .map(|age| age < stale_after)
                .unwrap_or(true);
            if fresh {
                return Err(WarehouseError::LockHeld {
                    name: lock.name.clone(),
                    holder,
                    acquired_at,
                });
            }
            warn!(lock = %lock.name, %holder, %acquired_at, "taking over stale run lock");
        }

        sqlx::query("INSERT OR REPLACE INTO run_locks (name, holder, acquired_at) VALUES (?, ?, ?)")
            .bind(&lock.name)
            .bind(&lock.holder)
            .bind(lock.acquired_at.to_rfc3339())
            .execute(&mut *conn)
            .await?;
        Ok(())
    }

    pub async fn release_lock(&self, lock: &RunLock) -> Result<()> {
        let released = sqlx::query("DELETE FROM run_locks WHERE name = ? AND holder = ?")
            .bind(&lock.name)
            .bind(&lock.holder)
            .execute(&self.pool)
            .await?
            .rows_affected();
        if released == 0 {
            warn!(lock = %lock.name, holder = %lock.holder, "run lock was already released or taken over");
        }
        Ok(())
    }

    /// Replace a relation wholesale: build `{name}__next`, then swap it in.
    /// Readers observe either the old or the new relation, never a mix.
    pub async fn replace_relation(&self, table: &Table) -> Result<()> {
        if relation_columns(&table.name).is_none() {
            return Err(WarehouseError::UnknownRelation(table.name.clone()));
        }
        let mut conn = self.begin_immediate().await?;
        let result = Self::rebuild_in(&mut conn, table).await;
        Self::finish(&mut conn, result).await?;
        info!(relation = %table.name, rows = table.len(), "relation rebuilt");
        Ok(())
    }

    async fn rebuild_in(conn: &mut SqliteConnection, table: &Table) -> Result<()> {
        let shadow = format!("{}__next", table.name);
        sqlx::query(&format!("DROP TABLE IF EXISTS \"{shadow}\""))
            .execute(&mut *conn)
            .await?;
        sqlx::query(&create_table_sql(&shadow, &table.columns))
            .execute(&mut *conn)
            .await?;

        let insert = insert_sql(&shadow, &table.columns);
        for row in &table.rows {
            let mut query = sqlx::query(&insert);
            for value in row {
                query = bind_value(query, value);
            }
            query.execute(&mut *conn).await?;
        }

        sqlx::query(&format!("DROP TABLE IF EXISTS \"{}\"", table.name))
            .execute(&mut *conn)
            .await?;
        sqlx::query(&format!("ALTER TABLE \"{shadow}\" RENAME TO \"{}\"", table.name))
            .execute(&mut *conn)
            .await?;
        Ok(())
    }

    pub async fn relation_exists(&self, name: &str) -> Result<bool> {
        let found: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?")
                .bind(name)
                .fetch_one(&self.pool)
                .await?;
        Ok(found > 0)
    }

    /// Read back a rebuilt relation in insertion order.
    pub async fn read_relation(&self, name: &str) -> Result<Table> {
        let columns =
            relation_columns(name).ok_or_else(|| WarehouseError::UnknownRelation(name.to_string()))?;
        if !self.relation_exists(name).await? {
            return Err(WarehouseError::MissingRelation(name.to_string()));
        }

        let select = format!(
            "SELECT {} FROM \"{name}\" ORDER BY rowid",
            columns
                .iter()
                .map(|c| format!("\"{}\"", c.name))
                .collect::<Vec<_>>()
                .join(", ")
        );
        let rows = sqlx::query(&select).fetch_all(&self.pool).await?;

        let mut table = Table::new(name, columns.clone());
        for row in rows {
            let mut values = Vec::with_capacity(columns.len());
            for (idx, column) in columns.iter().enumerate() {
                values.push(decode_value(&row, idx, name, column)?);
            }
            table.rows.push(values);
        }
        Ok(table)
    }
}

#[async_trait]
impl Ledger for Warehouse {
    async fn is_loaded(&self, key: &UnitKey) -> Result<bool> {
        let found: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM load_ledger WHERE unit_key = ?")
            .bind(key.ledger_key())
            .fetch_one(&self.pool)
            .await?;
        Ok(found > 0)
    }

    async fn mark_loaded(&self, key: &UnitKey, loaded_at: DateTime<Utc>) -> Result<bool> {
        let mut conn = self.pool.acquire().await?;
        mark_in(&mut conn, key, loaded_at).await
    }

    async fn entry_count(&self) -> Result<u64> {
        count(&self.pool, "SELECT COUNT(*) FROM load_ledger").await
    }
}

#[async_trait]
impl LoadTarget for Warehouse {
    async fn commit_message(
        &self,
        key: &UnitKey,
        payload: &JsonValue,
        content_hash: &str,
        loaded_at: DateTime<Utc>,
    ) -> Result<CommitOutcome> {
        let payload = serde_json::to_string(payload)?;
        let mut conn = self.begin_immediate().await?;
        let result = insert_message_in(&mut conn, key, &payload, content_hash, loaded_at).await;
        Self::finish(&mut conn, result).await
    }

    async fn commit_detections(
        &self,
        key: &UnitKey,
        detections: &[NewDetection],
        loaded_at: DateTime<Utc>,
    ) -> Result<CommitOutcome> {
        let mut conn = self.begin_immediate().await?;
        let result = insert_detections_in(&mut conn, key, detections, loaded_at).await;
        Self::finish(&mut conn, result).await
    }

    async fn raw_messages(&self) -> Result<Vec<RawRecord>> {
        let rows = sqlx::query(
            "SELECT unit_key, capture_date, channel, record_id, payload, content_hash, loaded_at
             FROM raw_messages ORDER BY unit_key",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| -> Result<RawRecord> {
                let capture_date: String = row.try_get("capture_date")?;
                let payload: String = row.try_get("payload")?;
                let loaded_at: String = row.try_get("loaded_at")?;
                Ok(RawRecord {
                    unit_key: row.try_get("unit_key")?,
                    capture_date: parse_date("raw_messages", "capture_date", &capture_date)?,
                    channel: row.try_get("channel")?,
                    record_id: row.try_get("record_id")?,
                    payload: serde_json::from_str(&payload)?,
                    content_hash: row.try_get("content_hash")?,
                    loaded_at: parse_timestamp("raw_messages", "loaded_at", &loaded_at)?,
                })
            })
            .collect()
    }

    async fn raw_detections(&self) -> Result<Vec<RawDetection>> {
        let rows = sqlx::query(
            "SELECT detection_id, message_id, channel, image_path, object_class,
                    confidence_score, bounding_box, loaded_at
             FROM raw_image_detections ORDER BY detection_id",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| -> Result<RawDetection> {
                let loaded_at: String = row.try_get("loaded_at")?;
                Ok(RawDetection {
                    detection_id: row.try_get("detection_id")?,
                    message_id: row.try_get("message_id")?,
                    channel: row.try_get("channel")?,
                    image_path: row.try_get("image_path")?,
                    object_class: row.try_get("object_class")?,
                    confidence_score: row.try_get("confidence_score")?,
                    bounding_box: row.try_get("bounding_box")?,
                    loaded_at: parse_timestamp("raw_image_detections", "loaded_at", &loaded_at)?,
                })
            })
            .collect()
    }
}

async fn rollback(conn: &mut SqliteConnection) {
    if let Err(err) = sqlx::query("ROLLBACK").execute(&mut *conn).await {
        // SQLite reports "no transaction is active" once a failed COMMIT has
        // already ended it.
        debug!(error = %err, "rollback skipped");
    }
}

async fn count(pool: &SqlitePool, sql: &str) -> Result<u64> {
    let n: i64 = sqlx::query_scalar(sql).fetch_one(pool).await?;
    Ok(n.max(0) as u64)
}

async fn mark_in(conn: &mut SqliteConnection, key: &UnitKey, loaded_at: DateTime<Utc>) -> Result<bool> {
    let marked = sqlx::query(
        "INSERT INTO load_ledger (unit_key, loaded_at) VALUES (?, ?) ON CONFLICT(unit_key) DO NOTHING",
    )
    .bind(key.ledger_key())
    .bind(loaded_at.to_rfc3339())
    .execute(&mut *conn)
    .await?
    .rows_affected();
    Ok(marked > 0)
}

async fn insert_message_in(
    conn: &mut SqliteConnection,
    key: &UnitKey,
    payload: &str,
    content_hash: &str,
    loaded_at: DateTime<Utc>,
) -> Result<CommitOutcome> {
    // A raw row without a ledger entry is left behind only by an interrupted
    // non-transactional writer; the conflict clause keeps it single.
    let inserted = sqlx::query(
        "INSERT INTO raw_messages
            (unit_key, capture_date, channel, record_id, payload, content_hash, loaded_at)
         VALUES (?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT(unit_key) DO NOTHING",
    )
    .bind(key.ledger_key())
    .bind(key.capture_date.format("%Y-%m-%d").to_string())
    .bind(&key.channel)
    .bind(&key.record_id)
    .bind(payload)
    .bind(content_hash)
    .bind(loaded_at.to_rfc3339())
    .execute(&mut *conn)
    .await?
    .rows_affected();

    mark_in(conn, key, loaded_at).await?;

    Ok(if inserted > 0 {
        CommitOutcome::Inserted
    } else {
        CommitOutcome::Duplicate
    })
}

async fn insert_detections_in(
    conn: &mut SqliteConnection,
    key: &UnitKey,
    detections: &[NewDetection],
    loaded_at: DateTime<Utc>,
) -> Result<CommitOutcome> {
    let already: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM load_ledger WHERE unit_key = ?")
        .bind(key.ledger_key())
        .fetch_one(&mut *conn)
        .await?;
    if already > 0 {
        return Ok(CommitOutcome::Duplicate);
    }

    for detection in detections {
        sqlx::query(
            "INSERT OR IGNORE INTO raw_image_detections
                (message_id, channel, image_path, object_class, confidence_score, bounding_box, loaded_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(detection.message_id)
        .bind(&detection.channel)
        .bind(&detection.image_path)
        .bind(&detection.object_class)
        .bind(detection.confidence_score)
        .bind(detection.bounding_box.as_deref())
        .bind(loaded_at.to_rfc3339())
        .execute(&mut *conn)
        .await?;
    }

    mark_in(conn, key, loaded_at).await?;
    Ok(CommitOutcome::Inserted)
}

fn sql_type(ty: ColumnType) -> &'static str {
    match ty {
        ColumnType::Integer | ColumnType::Boolean => "INTEGER",
        ColumnType::Real => "REAL",
        ColumnType::Text | ColumnType::Date | ColumnType::Timestamp => "TEXT",
    }
}

fn create_table_sql(name: &str, columns: &[ColumnDef]) -> String {
    let cols = columns
        .iter()
        .map(|c| {
            let null = if c.nullable { "" } else { " NOT NULL" };
            format!("\"{}\" {}{null}", c.name, sql_type(c.ty))
        })
        .collect::<Vec<_>>()
        .join(", ");
    format!("CREATE TABLE \"{name}\" ({cols})")
}

fn insert_sql(name: &str, columns: &[ColumnDef]) -> String {
    let names = columns
        .iter()
        .map(|c| format!("\"{}\"", c.name))
        .collect::<Vec<_>>()
        .join(", ");
    let params = vec!["?"; columns.len()].join(", ");
    format!("INSERT INTO \"{name}\" ({names}) VALUES ({params})")
}

fn bind_value<'q>(
    query: Query<'q, Sqlite, SqliteArguments<'q>>,
    value: &'q Value,
) -> Query<'q, Sqlite, SqliteArguments<'q>> {
    match value {
        Value::Null => query.bind(None::<String>),
        Value::Integer(v) => query.bind(*v),
        Value::Real(v) => query.bind(*v),
        Value::Text(v) => query.bind(v.as_str()),
        Value::Boolean(v) => query.bind(*v),
        Value::Date(v) => query.bind(v.format("%Y-%m-%d").to_string()),
        Value::Timestamp(v) => query.bind(v.to_rfc3339()),
    }
}

fn decode_value(row: &SqliteRow, idx: usize, relation: &str, column: &ColumnDef) -> Result<Value> {
    let value = match column.ty {
        ColumnType::Integer => row.try_get::<Option<i64>, _>(idx)?.into(),
        ColumnType::Real => row.try_get::<Option<f64>, _>(idx)?.into(),
        ColumnType::Text => row.try_get::<Option<String>, _>(idx)?.into(),
        ColumnType::Boolean => row.try_get::<Option<bool>, _>(idx)?.into(),
        ColumnType::Date => match row.try_get::<Option<String>, _>(idx)? {
            Some(raw) => Value::Date(parse_date(relation, column.name, &raw)?),
            None => Value::Null,
        },
        ColumnType::Timestamp => match row.try_get::<Option<String>, _>(idx)? {
            Some(raw) => Value::Timestamp(parse_timestamp(relation, column.name, &raw)?),
            None => Value::Null,
        },
    };
    Ok(value)
}

fn parse_date(relation: &str, column: &str, raw: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(raw, "%Y-%m-%d").map_err(|_| WarehouseError::Decode {
        relation: relation.to_string(),
        column: column.to_string(),
        value: raw.to_string(),
    })
}

fn parse_timestamp(relation: &str, column: &str, raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|_| WarehouseError::Decode {
            relation: relation.to_string(),
            column: column.to_string(),
            value: raw.to_string(),
        })
}
