//! SQLite schema, snapshot ledger and the incremental infraction loader.

use std::collections::{BTreeSet, HashSet};
use std::str::FromStr;

use anyhow::{Context, Result};
use chrono::{NaiveDate, Utc};
use dinesafe_core::{ColumnValue, InfractionIdentity, InfractionRecord, SnapshotId, TargetSchema};
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::{QueryBuilder, Row, Sqlite};
use tracing::{info, warn};

use crate::config::TableNames;

/// Conservative bind-parameter limit of SQLite builds before 3.32.
const MAX_BIND_PARAMS: usize = 999;

pub async fn connect_database(database_url: &str) -> Result<SqlitePool> {
    let options = SqliteConnectOptions::from_str(database_url)
        .with_context(|| format!("parsing database url {database_url}"))?
        .create_if_missing(true);

    let in_memory = database_url.contains(":memory:") || database_url.contains("mode=memory");
    if !in_memory {
        if let Some(parent) = options
            .get_filename()
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
        {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating database directory {}", parent.display()))?;
        }
    }

    let pool_options = if in_memory {
        // Each connection to an in-memory database would see its own empty database.
        SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
    } else {
        SqlitePoolOptions::new().max_connections(4)
    };

    pool_options
        .connect_with(options)
        .await
        .with_context(|| format!("connecting to {database_url}"))
}

/// Create the infractions, geocoding cache and snapshot ledger tables if missing.
pub async fn prepare_database(
    pool: &SqlitePool,
    tables: &TableNames,
    schema: &TargetSchema,
) -> Result<()> {
    tables.validate()?;
    let infractions = &tables.infractions;
    let geocoded = &tables.geocoded;
    let ledger = tables.ledger();

    let columns = schema
        .columns()
        .iter()
        .map(|c| format!("{} {}", c.name(), c.sql_type().as_sql()))
        .collect::<Vec<_>>()
        .join(",\n    ");

    let statements = [
        format!("CREATE TABLE IF NOT EXISTS {infractions} (\n    {columns}\n)"),
        format!("CREATE INDEX IF NOT EXISTS idx_{infractions}_filename ON {infractions} (filename)"),
        format!(
            "CREATE INDEX IF NOT EXISTS idx_{infractions}_inspection \
             ON {infractions} (establishment_id, inspection_id)"
        ),
        format!(
            "CREATE TABLE IF NOT EXISTS {geocoded} (
    address TEXT NOT NULL,
    neighbourhood TEXT,
    locality TEXT,
    formatted_address TEXT,
    postal_code TEXT,
    latitude REAL,
    longitude REAL
)"
        ),
        format!("CREATE INDEX IF NOT EXISTS idx_{geocoded}_address ON {geocoded} (address)"),
        format!(
            "CREATE TABLE IF NOT EXISTS {ledger} (
    snapshot_id TEXT PRIMARY KEY,
    loaded_at TEXT NOT NULL,
    rows_seen INTEGER NOT NULL,
    rows_inserted INTEGER NOT NULL
)"
        ),
    ];

    for sql in &statements {
        sqlx::query(sql)
            .execute(pool)
            .await
            .with_context(|| format!("preparing database: {}", first_line(sql)))?;
    }
    info!(%infractions, %geocoded, %ledger, "database prepared");
    Ok(())
}

fn first_line(sql: &str) -> &str {
    sql.lines().next().unwrap_or(sql)
}

/// Snapshots with rows in the infractions table or an entry in the ledger.
pub async fn loaded_snapshot_ids(
    pool: &SqlitePool,
    tables: &TableNames,
) -> Result<BTreeSet<SnapshotId>> {
    let sql = format!(
        "SELECT DISTINCT filename FROM {} WHERE filename IS NOT NULL \
         UNION SELECT snapshot_id FROM {}",
        tables.infractions,
        tables.ledger()
    );
    let names: Vec<String> = sqlx::query_scalar(&sql)
        .fetch_all(pool)
        .await
        .with_context(|| format!("reading loaded snapshots of {}", tables.infractions))?;

    let mut ids = BTreeSet::new();
    for name in names {
        match SnapshotId::parse(&name) {
            Ok(id) => {
                ids.insert(id);
            }
            Err(err) => warn!(filename = %name, error = %err, "ignoring unrecognized filename"),
        }
    }
    Ok(ids)
}

async fn existing_identities(
    pool: &SqlitePool,
    table: &str,
) -> Result<HashSet<InfractionIdentity>> {
    let sql = format!(
        "SELECT establishment_id, inspection_id, inspection_date, infraction_details, \
         severity, action, court_outcome, amount_fined FROM {table}"
    );
    let rows = sqlx::query(&sql)
        .fetch_all(pool)
        .await
        .with_context(|| format!("reading existing infractions of {table}"))?;

    let mut identities = HashSet::with_capacity(rows.len());
    for row in rows {
        let establishment_id: Option<i64> = row.try_get(0)?;
        let inspection_id: Option<i64> = row.try_get(1)?;
        let inspection_date: Option<String> = row.try_get(2)?;
        let date = inspection_date
            .as_deref()
            .and_then(|d| NaiveDate::parse_from_str(d, "%Y-%m-%d").ok());
        let (Some(establishment_id), Some(inspection_id), Some(inspection_date)) =
            (establishment_id, inspection_id, date)
        else {
            continue;
        };
        identities.insert(InfractionIdentity {
            establishment_id,
            inspection_id,
            inspection_date,
            infraction_details: row.try_get(3)?,
            severity: row.try_get(4)?,
            action: row.try_get(5)?,
            court_outcome: row.try_get(6)?,
            amount_fined_bits: row.try_get::<Option<f64>, _>(7)?.map(f64::to_bits),
        });
    }
    Ok(identities)
}

/// Normalized rows of one snapshot, in file order.
#[derive(Debug, Clone)]
pub struct SnapshotRecords {
    pub snapshot: SnapshotId,
    pub records: Vec<InfractionRecord>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct LoadOutcome {
    pub rows_seen: usize,
    pub rows_inserted: usize,
    pub rows_skipped: usize,
    pub snapshots_loaded: Vec<SnapshotId>,
    /// Every snapshot recorded after the load.
    pub recorded_snapshots: Vec<SnapshotId>,
}

/// Append new snapshots to the infractions table.
///
/// Rows are deduplicated across the given snapshots (first occurrence wins) and against
/// rows already stored. Inserts and ledger entries commit in one transaction.
pub async fn load_snapshots(
    pool: &SqlitePool,
    tables: &TableNames,
    schema: &TargetSchema,
    snapshots: Vec<SnapshotRecords>,
) -> Result<LoadOutcome> {
    if snapshots.is_empty() {
        info!(table = %tables.infractions, "no new data to append; did nothing");
        let recorded = loaded_snapshot_ids(pool, tables).await?;
        return Ok(LoadOutcome {
            recorded_snapshots: recorded.into_iter().collect(),
            ..LoadOutcome::default()
        });
    }

    let mut seen = existing_identities(pool, &tables.infractions).await?;
    let mut outcome = LoadOutcome::default();
    let mut to_insert: Vec<&InfractionRecord> = Vec::new();
    let mut ledger_rows = Vec::with_capacity(snapshots.len());

    for batch in &snapshots {
        let before = to_insert.len();
        for record in &batch.records {
            if seen.insert(record.identity()) {
                to_insert.push(record);
            }
        }
        let inserted = to_insert.len() - before;
        outcome.rows_seen += batch.records.len();
        outcome.snapshots_loaded.push(batch.snapshot.clone());
        ledger_rows.push((batch.snapshot.clone(), batch.records.len(), inserted));
    }
    outcome.rows_inserted = to_insert.len();
    outcome.rows_skipped = outcome.rows_seen - outcome.rows_inserted;

    info!(
        table = %tables.infractions,
        rows = outcome.rows_inserted,
        skipped = outcome.rows_skipped,
        "appending data to database table"
    );

    let column_list = schema.column_names().join(", ");
    let rows_per_statement = (MAX_BIND_PARAMS / schema.columns().len().max(1)).max(1);

    let mut tx = pool.begin().await.context("starting load transaction")?;
    for chunk in to_insert.chunks(rows_per_statement) {
        let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new(format!(
            "INSERT INTO {} ({}) ",
            tables.infractions, column_list
        ));
        builder.push_values(chunk, |mut row, record| {
            for column in schema.columns() {
                match record.value(*column) {
                    ColumnValue::Integer(v) => {
                        row.push_bind(v);
                    }
                    ColumnValue::Real(v) => {
                        row.push_bind(v);
                    }
                    ColumnValue::Text(v) => {
                        row.push_bind(v);
                    }
                    ColumnValue::Date(d) => {
                        row.push_bind(d.format("%Y-%m-%d").to_string());
                    }
                }
            }
        });
        builder
            .build()
            .execute(&mut *tx)
            .await
            .with_context(|| format!("inserting into {}", tables.infractions))?;
    }

    let loaded_at = Utc::now().to_rfc3339();
    let ledger_sql = format!(
        "INSERT INTO {} (snapshot_id, loaded_at, rows_seen, rows_inserted) VALUES (?, ?, ?, ?) \
         ON CONFLICT(snapshot_id) DO UPDATE SET loaded_at = excluded.loaded_at, \
         rows_seen = excluded.rows_seen, rows_inserted = excluded.rows_inserted",
        tables.ledger()
    );
    for (snapshot, seen_rows, inserted) in &ledger_rows {
        sqlx::query(&ledger_sql)
            .bind(snapshot.as_str())
            .bind(&loaded_at)
            .bind(*seen_rows as i64)
            .bind(*inserted as i64)
            .execute(&mut *tx)
            .await
            .with_context(|| format!("recording snapshot {snapshot} in {}", tables.ledger()))?;
    }
    tx.commit().await.context("committing load transaction")?;

    outcome.recorded_snapshots = loaded_snapshot_ids(pool, tables).await?.into_iter().collect();
    Ok(outcome)
}

pub async fn count_rows(pool: &SqlitePool, table: &str) -> Result<i64> {
    sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {table}"))
        .fetch_one(pool)
        .await
        .with_context(|| format!("counting rows of {table}"))
}
