//! Column layout of every warehouse table.
//!
//! Rows go through `serde_json::Value` on their way in and out of SQLite,
//! so the serde field names of each row type are the column names.
//! Decimals keep their exact text form; nested lists are stored as JSON.

use crate::error::{PipelineError, Result};
use crate::model::{
    EnrichedTrade, Market, PriceObservation, RawTransferEvent, ReconstructedTrade, Resolution,
    WalletAlias, WalletPnl,
};
use rusqlite::types::Value as SqlValue;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnKind {
    Integer,
    Text,
    Bool,
    Json,
}

impl ColumnKind {
    fn sql_type(&self) -> &'static str {
        match self {
            ColumnKind::Integer | ColumnKind::Bool => "INTEGER",
            ColumnKind::Text | ColumnKind::Json => "TEXT",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Column {
    pub name: &'static str,
    pub kind: ColumnKind,
}

impl Column {
    pub const fn int(name: &'static str) -> Self {
        Self { name, kind: ColumnKind::Integer }
    }

    pub const fn text(name: &'static str) -> Self {
        Self { name, kind: ColumnKind::Text }
    }

    pub const fn flag(name: &'static str) -> Self {
        Self { name, kind: ColumnKind::Bool }
    }

    pub const fn json(name: &'static str) -> Self {
        Self { name, kind: ColumnKind::Json }
    }
}

/// A row type with a fixed SQLite layout.
pub trait Table: Serialize + DeserializeOwned {
    const COLUMNS: &'static [Column];
    /// Columns of the table's UNIQUE constraint, if any.
    const UNIQUE: &'static [&'static str] = &[];
}

/// Table names are interpolated into SQL, so only `[A-Za-z0-9_]` is allowed.
pub fn check_name(name: &str) -> Result<()> {
    if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(PipelineError::SchemaMismatch(format!("invalid table name {:?}", name)));
    }
    Ok(())
}

pub fn quote(ident: &str) -> String {
    format!("\"{}\"", ident)
}

fn column_list<T: Table>() -> String {
    T::COLUMNS.iter().map(|c| quote(c.name)).collect::<Vec<_>>().join(", ")
}

pub fn create_sql<T: Table>(name: &str) -> String {
    let mut defs: Vec<String> = T::COLUMNS
        .iter()
        .map(|c| format!("{} {}", quote(c.name), c.kind.sql_type()))
        .collect();
    if !T::UNIQUE.is_empty() {
        let key: Vec<String> = T::UNIQUE.iter().map(|c| quote(c)).collect();
        defs.push(format!("UNIQUE ({})", key.join(", ")));
    }
    format!("CREATE TABLE IF NOT EXISTS {} ({})", quote(name), defs.join(", "))
}

/// `verb` is `INSERT` or `INSERT OR IGNORE`.
pub fn insert_sql<T: Table>(verb: &str, name: &str) -> String {
    let placeholders: Vec<String> = (1..=T::COLUMNS.len()).map(|i| format!("?{}", i)).collect();
    format!(
        "{} INTO {} ({}) VALUES ({})",
        verb,
        quote(name),
        column_list::<T>(),
        placeholders.join(", ")
    )
}

pub fn select_sql<T: Table>(name: &str) -> String {
    format!("SELECT {} FROM {} ORDER BY rowid", column_list::<T>(), quote(name))
}

pub fn to_sql_row<T: Table>(table: &str, row: &T) -> Result<Vec<SqlValue>> {
    let mut fields = match serde_json::to_value(row)? {
        Value::Object(map) => map,
        other => {
            return Err(PipelineError::SchemaMismatch(format!(
                "{}: row is not a record: {}",
                table, other
            )))
        }
    };
    let mut values = Vec::with_capacity(T::COLUMNS.len());
    for column in T::COLUMNS {
        let value = fields.remove(column.name).unwrap_or(Value::Null);
        values.push(encode(table, column, value)?);
    }
    if let Some(extra) = fields.keys().next() {
        return Err(PipelineError::SchemaMismatch(format!(
            "{}: field {} has no column",
            table, extra
        )));
    }
    Ok(values)
}

pub fn from_sql_row<T: Table>(table: &str, values: Vec<SqlValue>) -> Result<T> {
    let mut fields = Map::new();
    for (column, value) in T::COLUMNS.iter().zip(values) {
        fields.insert(column.name.to_string(), decode(table, column, value)?);
    }
    serde_json::from_value(Value::Object(fields))
        .map_err(|e| PipelineError::DataQuality(format!("{}: {}", table, e)))
}

fn mismatch(table: &str, column: &Column, found: impl std::fmt::Debug) -> PipelineError {
    PipelineError::SchemaMismatch(format!(
        "{}.{}: expected {:?}, found {:?}",
        table, column.name, column.kind, found
    ))
}

fn encode(table: &str, column: &Column, value: Value) -> Result<SqlValue> {
    Ok(match (column.kind, value) {
        (_, Value::Null) => SqlValue::Null,
        (ColumnKind::Integer, Value::Number(n)) => match n.as_i64() {
            Some(i) => SqlValue::Integer(i),
            None => {
                return Err(PipelineError::DataQuality(format!(
                    "{}.{}: {} does not fit a 64-bit integer",
                    table, column.name, n
                )))
            }
        },
        (ColumnKind::Bool, Value::Bool(b)) => SqlValue::Integer(i64::from(b)),
        (ColumnKind::Text, Value::String(s)) => SqlValue::Text(s),
        (ColumnKind::Json, v) => SqlValue::Text(serde_json::to_string(&v)?),
        (_, other) => return Err(mismatch(table, column, other)),
    })
}

fn decode(table: &str, column: &Column, value: SqlValue) -> Result<Value> {
    Ok(match (column.kind, value) {
        (_, SqlValue::Null) => Value::Null,
        (ColumnKind::Integer, SqlValue::Integer(i)) => Value::from(i),
        (ColumnKind::Bool, SqlValue::Integer(i)) => Value::Bool(i != 0),
        (ColumnKind::Text, SqlValue::Text(s)) => Value::String(s),
        (ColumnKind::Json, SqlValue::Text(s)) => serde_json::from_str(&s)?,
        (_, other) => return Err(mismatch(table, column, other)),
    })
}

impl Table for RawTransferEvent {
    const COLUMNS: &'static [Column] = &[
        Column::text("tx_hash"),
        Column::int("log_index"),
        Column::int("batch_index"),
        Column::int("block_number"),
        Column::int("block_timestamp"),
        Column::text("contract"),
        Column::text("kind"),
        Column::text("operator"),
        Column::text("from"),
        Column::text("to"),
        Column::text("token_id"),
        Column::text("amount"),
    ];
    const UNIQUE: &'static [&'static str] = &["tx_hash", "log_index", "batch_index"];
}

impl Table for ReconstructedTrade {
    const COLUMNS: &'static [Column] = &[
        Column::text("tx_hash"),
        Column::text("wallet"),
        Column::text("condition_id"),
        Column::int("outcome_index"),
        Column::text("token_id"),
        Column::text("direction"),
        Column::text("kind"),
        Column::text("shares"),
        Column::text("price"),
        Column::text("usd_value"),
        Column::text("usdc_delta"),
        Column::text("confidence"),
        Column::text("quality"),
        Column::int("block_number"),
        Column::int("block_timestamp"),
    ];
    const UNIQUE: &'static [&'static str] = &["tx_hash", "wallet", "token_id", "kind"];
}

impl Table for EnrichedTrade {
    const COLUMNS: &'static [Column] = &[
        Column::text("tx_hash"),
        Column::text("wallet"),
        Column::text("condition_id"),
        Column::int("outcome_index"),
        Column::text("token_id"),
        Column::text("direction"),
        Column::text("kind"),
        Column::text("shares"),
        Column::text("price"),
        Column::text("usd_value"),
        Column::text("usdc_delta"),
        Column::text("confidence"),
        Column::text("quality"),
        Column::int("block_number"),
        Column::int("block_timestamp"),
        Column::text("question"),
        Column::text("category"),
        Column::text("market_source"),
        Column::json("payout_numerators"),
        Column::int("payout_denominator"),
        Column::int("winning_index"),
        Column::text("resolution_source"),
    ];
    const UNIQUE: &'static [&'static str] = &["tx_hash", "wallet", "token_id", "kind"];
}

impl Table for Market {
    const COLUMNS: &'static [Column] = &[
        Column::text("condition_id"),
        Column::text("question"),
        Column::json("outcomes"),
        Column::json("tokens"),
        Column::text("category"),
        Column::flag("closed"),
        Column::text("volume"),
        Column::text("source"),
        Column::int("updated_at"),
        Column::flag("canonical"),
    ];
}

impl Table for Resolution {
    const COLUMNS: &'static [Column] = &[
        Column::text("condition_id"),
        Column::json("payout_numerators"),
        Column::int("payout_denominator"),
        Column::int("winning_index"),
        Column::int("resolved_at"),
        Column::text("source"),
    ];
}

impl Table for WalletAlias {
    const COLUMNS: &'static [Column] = &[Column::text("address"), Column::text("wallet")];
    const UNIQUE: &'static [&'static str] = &["address"];
}

impl Table for PriceObservation {
    const COLUMNS: &'static [Column] = &[
        Column::text("condition_id"),
        Column::int("outcome_index"),
        Column::text("price"),
        Column::int("observed_at"),
    ];
}

impl Table for WalletPnl {
    const COLUMNS: &'static [Column] = &[
        Column::text("wallet"),
        Column::text("category"),
        Column::text("realized_pnl"),
        Column::text("unrealized_pnl"),
        Column::text("total_pnl"),
        Column::text("cost_basis"),
        Column::int("trade_count"),
        Column::int("resolved_positions"),
        Column::int("open_positions"),
        Column::int("unpriced_positions"),
        Column::int("winning_positions"),
        Column::text("win_rate"),
        Column::text("roi"),
        Column::int("quarantined_trades"),
        Column::text("status"),
    ];
}
