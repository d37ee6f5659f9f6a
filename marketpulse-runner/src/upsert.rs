//! Warehouse upserter — syncs every persisted dataset into the warehouse table.
//!
//! The row key is read from each dataset's metadata, not from its object key,
//! so a renamed object still lands on the right row. Each upsert is
//! independent and commutative; running twice over unchanged datasets rewrites
//! identical payloads.
//!
//! Batch semantics depend on [`UpsertMode`]:
//! - `PerRow`: rows committed before a failure stay committed; the run still fails
//! - `Atomic`: the whole batch is one transaction, rolled back on any failure

use crate::warehouse::{UpsertAction, Warehouse, WarehouseError};
use marketpulse_core::domain::InstrumentDataset;
use marketpulse_core::store::{ObjectStore, StoreError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpsertMode {
    #[default]
    PerRow,
    Atomic,
}

#[derive(Debug, Error)]
pub enum UpsertError {
    #[error("listing datasets failed: {0}")]
    List(#[source] StoreError),

    #[error("reading '{key}' failed: {source}")]
    Read {
        key: String,
        #[source]
        source: StoreError,
    },

    #[error("dataset '{key}' is unreadable: {message}")]
    Corrupt { key: String, message: String },

    #[error("dataset '{key}' has no symbol in its metadata")]
    MissingSymbol { key: String },

    #[error("upsert of {symbol} failed: {source}")]
    Statement {
        symbol: String,
        #[source]
        source: WarehouseError,
    },

    #[error("warehouse transaction failed: {0}")]
    Transaction(#[source] WarehouseError),
}

/// What one upserter run wrote.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpsertSummary {
    pub inserted: Vec<String>,
    pub updated: Vec<String>,
    /// Keys listed but gone by the time they were read.
    pub vanished: Vec<String>,
    /// BLAKE3 over the sorted (symbol, payload) pairs written.
    pub digest: String,
}

impl UpsertSummary {
    pub fn total(&self) -> usize {
        self.inserted.len() + self.updated.len()
    }
}

pub struct WarehouseUpserter<'a> {
    store: &'a dyn ObjectStore,
    prefix: String,
    mode: UpsertMode,
}

impl<'a> WarehouseUpserter<'a> {
    pub fn new(store: &'a dyn ObjectStore, prefix: &str, mode: UpsertMode) -> Self {
        Self {
            store,
            prefix: prefix.trim_matches('/').to_string(),
            mode,
        }
    }

    /// Dataset keys currently under the prefix.
    pub fn dataset_keys(&self) -> Result<Vec<String>, UpsertError> {
        let mut keys = self
            .store
            .list(&format!("{}/", self.prefix))
            .map_err(UpsertError::List)?;
        keys.retain(|k| k.ends_with(".json"));
        Ok(keys)
    }

    pub fn run(&self, warehouse: &mut dyn Warehouse) -> Result<UpsertSummary, UpsertError> {
        let keys = self.dataset_keys()?;
        info!(datasets = keys.len(), mode = ?self.mode, "upserting datasets into warehouse");

        if self.mode == UpsertMode::Atomic {
            warehouse.begin().map_err(UpsertError::Transaction)?;
        }

        let mut written = BTreeMap::new();
        let result = self.upsert_all(&keys, warehouse, &mut written);

        match (self.mode, result) {
            (UpsertMode::Atomic, Ok(summary)) => {
                warehouse.commit().map_err(UpsertError::Transaction)?;
                Ok(summary)
            }
            (UpsertMode::Atomic, Err(e)) => {
                if let Err(rb) = warehouse.rollback() {
                    error!(error = %rb, "rollback after failed batch also failed");
                }
                error!(error = %e, "batch rolled back, no rows changed");
                Err(e)
            }
            (UpsertMode::PerRow, Ok(summary)) => Ok(summary),
            (UpsertMode::PerRow, Err(e)) => {
                error!(
                    error = %e,
                    committed = written.len(),
                    "batch stopped; rows upserted before the failure stay committed"
                );
                Err(e)
            }
        }
    }

    fn upsert_all(
        &self,
        keys: &[String],
        warehouse: &mut dyn Warehouse,
        written: &mut BTreeMap<String, String>,
    ) -> Result<UpsertSummary, UpsertError> {
        let mut summary = UpsertSummary::default();

        for key in keys {
            let bytes = match self.store.get(key) {
                Ok(Some(bytes)) => bytes,
                Ok(None) => {
                    warn!(key = %key, "dataset disappeared after listing, skipping");
                    summary.vanished.push(key.clone());
                    continue;
                }
                Err(source) => {
                    return Err(UpsertError::Read {
                        key: key.clone(),
                        source,
                    })
                }
            };

            let dataset =
                InstrumentDataset::from_json_slice(&bytes).map_err(|e| UpsertError::Corrupt {
                    key: key.clone(),
                    message: e.to_string(),
                })?;
            let symbol = dataset
                .warehouse_symbol()
                .ok_or_else(|| UpsertError::MissingSymbol { key: key.clone() })?
                .to_string();
            let payload = serde_json::to_string(&dataset).map_err(|e| UpsertError::Corrupt {
                key: key.clone(),
                message: e.to_string(),
            })?;

            if written.contains_key(&symbol) {
                warn!(symbol = %symbol, key = %key, "several datasets claim the same symbol; last one wins");
            }

            let action = warehouse
                .upsert(&symbol, &payload)
                .map_err(|source| UpsertError::Statement {
                    symbol: symbol.clone(),
                    source,
                })?;
            info!(symbol = %symbol, days = dataset.day_count(), action = ?action, "upserted");

            match action {
                UpsertAction::Inserted => summary.inserted.push(symbol.clone()),
                UpsertAction::Updated => summary.updated.push(symbol.clone()),
            }
            written.insert(symbol, payload);
        }

        summary.digest = digest(written);
        Ok(summary)
    }
}

fn digest(written: &BTreeMap<String, String>) -> String {
    let mut hasher = blake3::Hasher::new();
    for (symbol, payload) in written {
        hasher.update(symbol.as_bytes());
        hasher.update(&[0]);
        hasher.update(payload.as_bytes());
        hasher.update(&[0]);
    }
    hasher.finalize().to_hex().to_string()
}
