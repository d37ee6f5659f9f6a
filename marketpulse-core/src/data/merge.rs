//! Dataset merger — folds a fresh fetch into an instrument's persisted history.
//!
//! Rules:
//! - Dates are the key. New dates are added, dates present in both take the
//!   fresh values (the provider revises recent days, deeper history repeats).
//! - No previously known date is ever removed.
//! - Metadata is replaced by the fresh metadata, stamped with the canonical symbol.
//! - The merged dataset is written back as one whole object.
//!
//! A missing object and an empty dataset are the same thing here. Any other
//! read failure is an error so that a flaky bucket never looks like "no history".

use super::provider::DataError;
use crate::domain::{Instrument, InstrumentDataset};
use crate::store::{ObjectStore, JSON_CONTENT_TYPE};
use serde::{Deserialize, Serialize};
use tracing::info;

/// What a merge changed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeStats {
    pub symbol: String,
    pub previous_days: usize,
    pub fetched_days: usize,
    /// Dates that were not known before.
    pub added_days: usize,
    /// Known dates whose values changed.
    pub revised_days: usize,
    pub total_days: usize,
}

/// Merge `fresh` into `existing` (absent = empty).
pub fn merge_series(
    existing: Option<InstrumentDataset>,
    fresh: InstrumentDataset,
    canonical_symbol: &str,
) -> (InstrumentDataset, MergeStats) {
    let mut merged = existing.unwrap_or_default();
    let previous_days = merged.series.len();
    let fetched_days = fresh.series.len();
    let mut added_days = 0;
    let mut revised_days = 0;

    for (date, record) in fresh.series {
        match merged.series.insert(date, record) {
            None => added_days += 1,
            Some(old) if old != record => revised_days += 1,
            Some(_) => {}
        }
    }

    merged.meta = fresh.meta;
    merged.meta.canonical_symbol = Some(canonical_symbol.to_string());

    let stats = MergeStats {
        symbol: canonical_symbol.to_string(),
        previous_days,
        fetched_days,
        added_days,
        revised_days,
        total_days: merged.series.len(),
    };
    (merged, stats)
}

/// Owns read-modify-write of per-instrument datasets under one key prefix.
pub struct DatasetMerger<'a> {
    store: &'a dyn ObjectStore,
    prefix: String,
}

impl<'a> DatasetMerger<'a> {
    pub fn new(store: &'a dyn ObjectStore, prefix: &str) -> Self {
        Self {
            store,
            prefix: prefix.trim_matches('/').to_string(),
        }
    }

    /// `{prefix}/{SYMBOL}.json`
    pub fn dataset_key(&self, symbol: &str) -> String {
        format!("{}/{symbol}.json", self.prefix)
    }

    /// Load the persisted dataset. `Ok(None)` when it has never been written.
    pub fn load(&self, symbol: &str) -> Result<Option<InstrumentDataset>, DataError> {
        let key = self.dataset_key(symbol);
        match self.store.get(&key)? {
            None => Ok(None),
            Some(bytes) => InstrumentDataset::from_json_slice(&bytes)
                .map(Some)
                .map_err(|e| DataError::CorruptDataset {
                    key,
                    message: e.to_string(),
                }),
        }
    }

    /// Merge a fresh fetch into the stored dataset and persist the result.
    pub fn merge(
        &self,
        instrument: &Instrument,
        fresh: InstrumentDataset,
    ) -> Result<MergeStats, DataError> {
        let existing = self.load(&instrument.symbol)?;
        let (merged, stats) = merge_series(existing, fresh, &instrument.symbol);

        let body = merged.to_json_bytes().map_err(|e| DataError::Encode {
            symbol: instrument.symbol.clone(),
            message: e.to_string(),
        })?;
        self.store
            .put(&self.dataset_key(&instrument.symbol), &body, JSON_CONTENT_TYPE)?;

        info!(
            symbol = %stats.symbol,
            total_days = stats.total_days,
            added = stats.added_days,
            revised = stats.revised_days,
            "updated dataset"
        );
        Ok(stats)
    }
}
