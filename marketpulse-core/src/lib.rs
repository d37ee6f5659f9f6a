//! MarketPulse Core — domain records, provider fetcher, object storage, dataset merging.
//!
//! This crate contains the incremental-synchronization heart of the pipeline:
//! - Typed instrument, daily record and dataset types with a stable JSON wire form
//! - Data provider trait and the Alpha Vantage implementation, with call pacing
//! - Object store trait with filesystem and in-memory backends
//! - Dataset merger (date-keyed, new-wins, history-preserving)

pub mod data;
pub mod domain;
pub mod store;
