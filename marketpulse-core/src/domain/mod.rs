//! Domain types: instruments, daily records, per-instrument datasets.

pub mod dataset;
pub mod instrument;

pub use dataset::{DailyRecord, DatasetMeta, InstrumentDataset};
pub use instrument::{Instrument, InstrumentError, InstrumentList};
