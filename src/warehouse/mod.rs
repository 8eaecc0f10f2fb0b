//! SQLite table store.
//!
//! Raw partitions are append-only tables keyed by event identity. Derived
//! tables are only ever replaced wholesale: rows go into a staging table,
//! are counted, then renamed over the production name inside the same
//! transaction that renames the old copy to an `archive__` name. Readers
//! see either the old table or the new one.

pub mod schema;

use crate::error::{PipelineError, Result};
use crate::model::RawTransferEvent;
use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection, OpenFlags, TransactionBehavior};
use schema::{check_name, quote, Table};
use serde::de::DeserializeOwned;
use std::fs::{self, File};
use std::io::{BufRead, BufReader};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

pub mod tables {
    /// Per-worker raw partitions are named `raw_transfers__w{id}`.
    pub const RAW_TRANSFERS_PREFIX: &str = "raw_transfers__";
    pub const TRADES: &str = "trades_canonical_v1";
    pub const ENRICHED_TRADES: &str = "trades_enriched_v1";
    pub const MARKETS: &str = "markets";
    pub const RESOLUTIONS: &str = "resolutions";
    pub const PRICES: &str = "price_observations";
    pub const WALLET_ALIASES: &str = "wallet_aliases";
    pub const WALLET_PNL: &str = "wallet_pnl_v1";
    pub const WALLET_CATEGORY_PNL: &str = "wallet_category_pnl_v1";

    pub fn raw_partition(worker_id: usize) -> String {
        format!("{}w{}", RAW_TRANSFERS_PREFIX, worker_id)
    }
}

pub const ARCHIVE_PREFIX: &str = "archive__";
const STAGING_SUFFIX: &str = "__staging";
const DB_FILE: &str = "warehouse.sqlite";

const PRAGMAS: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
"#;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct UpsertReport {
    pub inserted: usize,
    pub unchanged: usize,
    pub total_rows: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwapReport {
    pub table: String,
    pub rows: usize,
    pub archived_as: Option<String>,
}

fn table_exists(conn: &Connection, name: &str) -> Result<bool> {
    let n: i64 = conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
        params![name],
        |row| row.get(0),
    )?;
    Ok(n > 0)
}

fn rename_sql(from: &str, to: &str) -> String {
    format!("ALTER TABLE {} RENAME TO {}", quote(from), quote(to))
}

fn count_rows(conn: &Connection, name: &str) -> Result<usize> {
    let sql = format!("SELECT COUNT(*) FROM {}", quote(name));
    let n: i64 = conn.query_row(&sql, [], |row| row.get(0))?;
    Ok(n as usize)
}

#[derive(Clone)]
pub struct Warehouse {
    conn: Arc<Mutex<Connection>>,
}

impl Warehouse {
    /// Open (or create) `warehouse.sqlite` under `root`.
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref();
        fs::create_dir_all(root)?;
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX;
        let conn = Connection::open_with_flags(root.join(DB_FILE), flags)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute_batch(PRAGMAS)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn exists(&self, name: &str) -> Result<bool> {
        table_exists(&self.conn.lock(), name)
    }

    /// Production tables whose name starts with `prefix`, sorted.
    pub fn list_tables(&self, prefix: &str) -> Result<Vec<String>> {
        let conn = self.conn.lock();
        let mut stmt =
            conn.prepare("SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name")?;
        let names = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(names
            .into_iter()
            .filter(|n| n.starts_with(prefix))
            .filter(|n| !n.starts_with(ARCHIVE_PREFIX) && !n.ends_with(STAGING_SUFFIX))
            .collect())
    }

    pub fn read_table<T: Table>(&self, name: &str) -> Result<Vec<T>> {
        check_name(name)?;
        let conn = self.conn.lock();
        if !table_exists(&conn, name)? {
            return Err(PipelineError::TableNotFound(name.to_string()));
        }
        let mut stmt = conn.prepare(&schema::select_sql::<T>(name))?;
        let width = T::COLUMNS.len();
        let raw = stmt
            .query_map([], |row| {
                (0..width)
                    .map(|i| row.get::<_, SqlValue>(i))
                    .collect::<rusqlite::Result<Vec<SqlValue>>>()
            })?
            .collect::<std::result::Result<Vec<Vec<SqlValue>>, _>>()?;
        raw.into_iter().map(|values| schema::from_sql_row(name, values)).collect()
    }

    /// Missing tables read as empty; for optional external feeds.
    pub fn read_table_or_empty<T: Table>(&self, name: &str) -> Result<Vec<T>> {
        match self.read_table(name) {
            Err(PipelineError::TableNotFound(_)) => Ok(Vec::new()),
            other => other,
        }
    }

    pub fn row_count(&self, name: &str) -> Result<usize> {
        check_name(name)?;
        let conn = self.conn.lock();
        if !table_exists(&conn, name)? {
            return Err(PipelineError::TableNotFound(name.to_string()));
        }
        count_rows(&conn, name)
    }

    /// Insert raw events keyed by (tx hash, log index, batch index) in one
    /// transaction. Re-ingesting an already stored event is a no-op.
    pub fn upsert_raw_events(
        &self,
        name: &str,
        events: &[RawTransferEvent],
    ) -> Result<UpsertReport> {
        check_name(name)?;
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        tx.execute_batch(&schema::create_sql::<RawTransferEvent>(name))?;
        let mut inserted = 0;
        {
            let sql = schema::insert_sql::<RawTransferEvent>("INSERT OR IGNORE", name);
            let mut stmt = tx.prepare(&sql)?;
            for event in events {
                inserted += stmt.execute(params_from_iter(schema::to_sql_row(name, event)?))?;
            }
        }
        let total_rows = count_rows(&tx, name)?;
        tx.commit()?;

        let report = UpsertReport {
            inserted,
            unchanged: events.len() - inserted,
            total_rows,
        };
        debug!(
            "upsert {}: +{} ({} unchanged, {} total)",
            name, report.inserted, report.unchanged, report.total_rows
        );
        Ok(report)
    }

    /// Rebuild-and-swap for a single table. `validate` runs on the complete
    /// row set before anything is written; a failing gate leaves production
    /// untouched.
    pub fn replace_table<T, F>(&self, name: &str, rows: &[T], validate: F) -> Result<SwapReport>
    where
        T: Table,
        F: FnOnce(&[T]) -> Result<()>,
    {
        validate(rows)?;
        let mut swaps = self.replace_tables(&[(name, rows)], |_, _| Ok(()))?;
        swaps
            .pop()
            .ok_or_else(|| PipelineError::validation(name, "swap produced no table"))
    }

    /// Swap several tables at once. Every table is validated first, then
    /// all of them are staged and renamed in one transaction, so either all
    /// new tables are visible or none are.
    pub fn replace_tables<T, F>(
        &self,
        targets: &[(&str, &[T])],
        validate: F,
    ) -> Result<Vec<SwapReport>>
    where
        T: Table,
        F: Fn(&str, &[T]) -> Result<()>,
    {
        for (name, rows) in targets {
            check_name(name)?;
            validate(name, rows)?;
        }

        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let mut swaps = Vec::with_capacity(targets.len());
        for (name, rows) in targets {
            let staging = format!("{}{}", name, STAGING_SUFFIX);
            tx.execute_batch(&format!("DROP TABLE IF EXISTS {}", quote(&staging)))?;
            tx.execute_batch(&schema::create_sql::<T>(&staging))?;
            {
                let mut stmt = tx.prepare(&schema::insert_sql::<T>("INSERT", &staging))?;
                for row in rows.iter() {
                    stmt.execute(params_from_iter(schema::to_sql_row(name, row)?))?;
                }
            }
            let staged = count_rows(&tx, &staging)?;
            if staged != rows.len() {
                return Err(PipelineError::validation(
                    name,
                    format!("staged {} of {} rows", staged, rows.len()),
                ));
            }

            let archived_as = if table_exists(&tx, name)? {
                let archive = format!("{}{}__previous", ARCHIVE_PREFIX, name);
                tx.execute_batch(&format!("DROP TABLE IF EXISTS {}", quote(&archive)))?;
                tx.execute_batch(&rename_sql(name, &archive))?;
                Some(archive)
            } else {
                None
            };
            tx.execute_batch(&rename_sql(&staging, name))?;
            swaps.push(SwapReport {
                table: name.to_string(),
                rows: rows.len(),
                archived_as,
            });
        }
        tx.commit()?;

        for swap in &swaps {
            info!("swapped {} into production ({} rows)", swap.table, swap.rows);
        }
        Ok(swaps)
    }

    /// Retire a table under an explicit archival name so it cannot be
    /// mistaken for a canonical source.
    pub fn archive(&self, name: &str) -> Result<String> {
        check_name(name)?;
        let conn = self.conn.lock();
        if !table_exists(&conn, name)? {
            return Err(PipelineError::TableNotFound(name.to_string()));
        }
        let archive = format!("{}{}__{}", ARCHIVE_PREFIX, name, Utc::now().format("%Y%m%dT%H%M%S"));
        conn.execute_batch(&rename_sql(name, &archive))?;
        info!("archived {} as {}", name, archive);
        Ok(archive)
    }
}

/// Read a JSONL feed file; a malformed line is reported with its position.
pub fn read_jsonl<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    let reader = BufReader::new(File::open(path)?);
    let mut rows = Vec::new();
    for (n, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let row = serde_json::from_str(&line).map_err(|e| {
            PipelineError::DataQuality(format!("{}:{}: {}", path.display(), n + 1, e))
        })?;
        rows.push(row);
    }
    Ok(rows)
}
