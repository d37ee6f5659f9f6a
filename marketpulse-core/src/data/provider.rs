//! Data provider trait and structured error types.
//!
//! The DataProvider trait abstracts over the market data source so the fetch
//! phase can run against the real provider or a substitute in tests.

use crate::domain::{Instrument, InstrumentDataset};
use crate::store::StoreError;
use thiserror::Error;

/// Errors from fetching and merging.
///
/// Fetch-side variants are all skip-worthy: the instrument gets no data this
/// run and the pipeline moves on. Merge-side variants abort only the instrument
/// being merged.
#[derive(Debug, Error)]
pub enum DataError {
    #[error("HTTP {status} for {symbol}")]
    Http { symbol: String, status: u16 },

    #[error("network error for {symbol}: {message}")]
    Transport { symbol: String, message: String },

    #[error("provider throttled {symbol}: {message}")]
    RateLimited { symbol: String, message: String },

    #[error("provider rejected {symbol}: {message}")]
    ProviderRejected { symbol: String, message: String },

    #[error("no daily series for {symbol}: unknown issue")]
    MissingSeries { symbol: String },

    #[error("response format changed for {symbol}: {message}")]
    Malformed { symbol: String, message: String },

    #[error("storage error: {0}")]
    Store(#[from] StoreError),

    #[error("stored dataset '{key}' is unreadable: {message}")]
    CorruptDataset { key: String, message: String },

    #[error("failed to encode dataset for {symbol}: {message}")]
    Encode { symbol: String, message: String },
}

impl DataError {
    /// Whether the instrument should just be skipped for this run.
    pub fn is_skippable(&self) -> bool {
        matches!(
            self,
            DataError::Http { .. }
                | DataError::Transport { .. }
                | DataError::RateLimited { .. }
                | DataError::ProviderRejected { .. }
                | DataError::MissingSeries { .. }
                | DataError::Malformed { .. }
        )
    }
}

/// Result of a successful fetch for a single instrument.
#[derive(Debug, Clone)]
pub struct FetchResult {
    /// Canonical symbol.
    pub symbol: String,
    /// Spelling that was sent to the provider.
    pub request_symbol: String,
    /// Metadata plus every daily record the provider currently returns.
    pub dataset: InstrumentDataset,
    pub source: String,
}

/// Trait for market data providers.
///
/// One call fetches the full daily series the provider knows for one instrument.
/// Pacing is applied by the caller, not the provider.
pub trait DataProvider: Send + Sync {
    /// Human-readable name of this provider.
    fn name(&self) -> &str;

    fn fetch(&self, instrument: &Instrument) -> Result<FetchResult, DataError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fetch_failures_are_skippable() {
        let sym = || "AAA".to_string();
        assert!(DataError::Http { symbol: sym(), status: 500 }.is_skippable());
        assert!(DataError::Transport { symbol: sym(), message: "timeout".into() }.is_skippable());
        assert!(DataError::RateLimited { symbol: sym(), message: "slow down".into() }.is_skippable());
        assert!(DataError::ProviderRejected { symbol: sym(), message: "bad".into() }.is_skippable());
        assert!(DataError::MissingSeries { symbol: sym() }.is_skippable());
        assert!(DataError::Malformed { symbol: sym(), message: "eof".into() }.is_skippable());
    }

    #[test]
    fn merge_failures_are_not_skippable() {
        let corrupt = DataError::CorruptDataset {
            key: "alphavantage/AAA.json".into(),
            message: "expected value".into(),
        };
        assert!(!corrupt.is_skippable());
        let store = DataError::Store(StoreError::Unavailable("down".into()));
        assert!(!store.is_skippable());
    }
}
