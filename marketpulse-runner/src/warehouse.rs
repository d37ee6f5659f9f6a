//! Warehouse table: one row per instrument, keyed by canonical symbol.
//!
//! Schema: `symbol` (primary key), `payload` (the full dataset as JSON),
//! `loaded_at` (set on every write). An upsert matches on `symbol` only and
//! replaces payload and timestamp wholesale.

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum WarehouseError {
    #[error("warehouse connection to {target} failed: {message}")]
    Connect { target: String, message: String },

    #[error("invalid table name '{0}'")]
    InvalidTable(String),

    #[error("warehouse statement failed: {0}")]
    Sql(#[from] rusqlite::Error),

    #[error("row for {symbol} is unreadable: {message}")]
    BadRow { symbol: String, message: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertAction {
    Inserted,
    Updated,
}

/// A warehouse row as read back.
#[derive(Debug, Clone, PartialEq)]
pub struct WarehouseRow {
    pub symbol: String,
    pub payload: serde_json::Value,
    pub loaded_at: DateTime<Utc>,
}

/// Warehouse write/read surface used by the upserter.
pub trait Warehouse {
    /// Create the table if it does not exist.
    fn ensure_table(&mut self) -> Result<(), WarehouseError>;

    fn begin(&mut self) -> Result<(), WarehouseError>;
    fn commit(&mut self) -> Result<(), WarehouseError>;
    fn rollback(&mut self) -> Result<(), WarehouseError>;

    /// Insert the row if `symbol` is absent, else replace payload and load timestamp.
    fn upsert(&mut self, symbol: &str, payload_json: &str) -> Result<UpsertAction, WarehouseError>;

    fn row(&self, symbol: &str) -> Result<Option<WarehouseRow>, WarehouseError>;

    /// All rows ordered by symbol.
    fn rows(&self) -> Result<Vec<WarehouseRow>, WarehouseError>;
}

/// Opens warehouse sessions. Connection happens inside the LOAD phase so a
/// refused connection fails that phase.
pub trait WarehouseConnector {
    fn describe(&self) -> String;
    fn connect(&self) -> Result<Box<dyn Warehouse>, WarehouseError>;
}

/// `name` or `schema.name`, each part a plain SQL identifier.
pub fn validate_table_name(name: &str) -> Result<(), WarehouseError> {
    let part_ok = |p: &str| {
        let mut chars = p.chars();
        matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
            && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
    };
    let parts: Vec<&str> = name.split('.').collect();
    if parts.len() > 2 || !parts.iter().all(|p| part_ok(p)) {
        return Err(WarehouseError::InvalidTable(name.to_string()));
    }
    Ok(())
}

/// SQLite-backed warehouse.
pub struct SqliteWarehouse {
    conn: Connection,
    table: String,
}

impl SqliteWarehouse {
    pub fn open(path: &Path, table: &str) -> Result<Self, WarehouseError> {
        validate_table_name(table)?;
        let conn = Connection::open(path).map_err(|e| WarehouseError::Connect {
            target: path.display().to_string(),
            message: e.to_string(),
        })?;
        Ok(Self {
            conn,
            table: table.to_string(),
        })
    }

    pub fn open_in_memory(table: &str) -> Result<Self, WarehouseError> {
        validate_table_name(table)?;
        let conn = Connection::open_in_memory().map_err(|e| WarehouseError::Connect {
            target: ":memory:".into(),
            message: e.to_string(),
        })?;
        Ok(Self {
            conn,
            table: table.to_string(),
        })
    }

    /// Whether the table exists, without creating it.
    pub fn has_table(&self) -> Result<bool, WarehouseError> {
        let (master, name) = match self.table.split_once('.') {
            Some((schema, name)) => (format!("{schema}.sqlite_master"), name),
            None => ("sqlite_master".to_string(), self.table.as_str()),
        };
        let found: i64 = self.conn.query_row(
            &format!("SELECT COUNT(*) FROM {master} WHERE type = 'table' AND name = ?1"),
            params![name],
            |r| r.get(0),
        )?;
        Ok(found > 0)
    }

    fn decode_row(
        symbol: String,
        payload: String,
        loaded_at: String,
    ) -> Result<WarehouseRow, WarehouseError> {
        let payload = serde_json::from_str(&payload).map_err(|e| WarehouseError::BadRow {
            symbol: symbol.clone(),
            message: format!("payload: {e}"),
        })?;
        let loaded_at = DateTime::parse_from_rfc3339(&loaded_at)
            .map_err(|e| WarehouseError::BadRow {
                symbol: symbol.clone(),
                message: format!("loaded_at: {e}"),
            })?
            .with_timezone(&Utc);
        Ok(WarehouseRow {
            symbol,
            payload,
            loaded_at,
        })
    }
}

impl Warehouse for SqliteWarehouse {
    fn ensure_table(&mut self) -> Result<(), WarehouseError> {
        self.conn.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS {} (
                symbol    TEXT PRIMARY KEY NOT NULL,
                payload   TEXT NOT NULL CHECK (json_valid(payload)),
                loaded_at TEXT NOT NULL
            );",
            self.table
        ))?;
        Ok(())
    }

    fn begin(&mut self) -> Result<(), WarehouseError> {
        self.conn.execute_batch("BEGIN IMMEDIATE")?;
        Ok(())
    }

    fn commit(&mut self) -> Result<(), WarehouseError> {
        self.conn.execute_batch("COMMIT")?;
        Ok(())
    }

    fn rollback(&mut self) -> Result<(), WarehouseError> {
        self.conn.execute_batch("ROLLBACK")?;
        Ok(())
    }

    fn upsert(&mut self, symbol: &str, payload_json: &str) -> Result<UpsertAction, WarehouseError> {
        let exists = self
            .conn
            .query_row(
                &format!("SELECT 1 FROM {} WHERE symbol = ?1", self.table),
                params![symbol],
                |_| Ok(()),
            )
            .optional()?
            .is_some();

        let loaded_at = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
        self.conn.execute(
            &format!(
                "INSERT INTO {} (symbol, payload, loaded_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(symbol) DO UPDATE SET
                     payload = excluded.payload,
                     loaded_at = excluded.loaded_at",
                self.table
            ),
            params![symbol, payload_json, loaded_at],
        )?;

        Ok(if exists {
            UpsertAction::Updated
        } else {
            UpsertAction::Inserted
        })
    }

    fn row(&self, symbol: &str) -> Result<Option<WarehouseRow>, WarehouseError> {
        let raw = self
            .conn
            .query_row(
                &format!(
                    "SELECT symbol, payload, loaded_at FROM {} WHERE symbol = ?1",
                    self.table
                ),
                params![symbol],
                |r| Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?, r.get::<_, String>(2)?)),
            )
            .optional()?;
        raw.map(|(s, p, t)| Self::decode_row(s, p, t)).transpose()
    }

    fn rows(&self) -> Result<Vec<WarehouseRow>, WarehouseError> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT symbol, payload, loaded_at FROM {} ORDER BY symbol",
            self.table
        ))?;
        let raw = stmt
            .query_map([], |r| {
                Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?, r.get::<_, String>(2)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        raw.into_iter()
            .map(|(s, p, t)| Self::decode_row(s, p, t))
            .collect()
    }
}

/// Connects to a SQLite database file. The parent directory must already exist.
#[derive(Debug, Clone)]
pub struct SqliteConnector {
    path: PathBuf,
    table: String,
}

impl SqliteConnector {
    pub fn new(path: impl Into<PathBuf>, table: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            table: table.into(),
        }
    }
}

impl WarehouseConnector for SqliteConnector {
    fn describe(&self) -> String {
        format!("sqlite://{} ({})", self.path.display(), self.table)
    }

    fn connect(&self) -> Result<Box<dyn Warehouse>, WarehouseError> {
        Ok(Box::new(SqliteWarehouse::open(&self.path, &self.table)?))
    }
}
