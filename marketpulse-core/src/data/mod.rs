//! Fetching, pacing and merging of daily series.

pub mod alpha_vantage;
pub mod merge;
pub mod pacing;
pub mod provider;

pub use alpha_vantage::AlphaVantageProvider;
pub use merge::{merge_series, DatasetMerger, MergeStats};
pub use pacing::{fetch_paced, Pacer, Pause, ThreadSleep};
pub use provider::{DataError, DataProvider, FetchResult};
