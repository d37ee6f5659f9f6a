//! Fetch phase: pull every instrument once, merge each success into its stored dataset.
//!
//! Provider failures skip the instrument. Merge failures, and any fetch error
//! that is not the provider's fault, abort only that instrument; the loop
//! always visits the whole list.

use crate::report::{FetchSummary, InstrumentOutcome};
use marketpulse_core::data::{fetch_paced, DataProvider, DatasetMerger, Pacer};
use marketpulse_core::domain::{Instrument, InstrumentDataset, InstrumentList};
use tracing::{debug, info, warn};

/// Progress callbacks for the fetch loop.
pub trait FetchProgress {
    fn on_start(&self, symbol: &str, index: usize, total: usize);
    fn on_complete(&self, index: usize, total: usize, outcome: &InstrumentOutcome);
    fn on_batch_complete(&self, summary: &FetchSummary);
}

/// Reports progress as structured log events.
pub struct TracingProgress;

impl FetchProgress for TracingProgress {
    fn on_start(&self, symbol: &str, index: usize, total: usize) {
        info!(symbol, "[{}/{}] fetching", index + 1, total);
    }

    fn on_complete(&self, _index: usize, _total: usize, outcome: &InstrumentOutcome) {
        match outcome {
            InstrumentOutcome::Merged { stats } => info!(
                symbol = %stats.symbol,
                fetched = stats.fetched_days,
                added = stats.added_days,
                "merged"
            ),
            InstrumentOutcome::Skipped { symbol, reason } => {
                warn!(symbol = %symbol, reason = %reason, "skipped")
            }
            InstrumentOutcome::MergeFailed { symbol, error } => {
                warn!(symbol = %symbol, error = %error, "merge failed")
            }
        }
    }

    fn on_batch_complete(&self, summary: &FetchSummary) {
        info!(
            merged = summary.merged(),
            skipped = summary.skipped(),
            merge_failures = summary.merge_failures(),
            "fetch phase complete"
        );
    }
}

/// Sequential, paced fetch-and-merge over `instruments` in declared order.
pub fn fetch_and_merge(
    provider: &dyn DataProvider,
    merger: &DatasetMerger<'_>,
    pacer: &Pacer,
    instruments: &InstrumentList,
    progress: &dyn FetchProgress,
) -> FetchSummary {
    let total = instruments.len();
    let mut summary = FetchSummary::default();

    for (i, instrument) in instruments.iter().enumerate() {
        progress.on_start(&instrument.symbol, i, total);

        let outcome = match fetch_paced(provider, instrument, pacer) {
            Err(e) if e.is_skippable() => InstrumentOutcome::Skipped {
                symbol: instrument.symbol.clone(),
                reason: e.to_string(),
            },
            Err(e) => InstrumentOutcome::MergeFailed {
                symbol: instrument.symbol.clone(),
                error: e.to_string(),
            },
            Ok(fetched) => {
                debug!(
                    symbol = %fetched.symbol,
                    request_symbol = %fetched.request_symbol,
                    source = %fetched.source,
                    days = fetched.dataset.series.len(),
                    "fetched"
                );
                merge_outcome(merger, instrument, fetched.dataset)
            }
        };

        progress.on_complete(i, total, &outcome);
        summary.outcomes.push(outcome);
    }

    progress.on_batch_complete(&summary);
    summary
}

fn merge_outcome(
    merger: &DatasetMerger<'_>,
    instrument: &Instrument,
    dataset: InstrumentDataset,
) -> InstrumentOutcome {
    match merger.merge(instrument, dataset) {
        Ok(stats) => InstrumentOutcome::Merged { stats },
        Err(e) => InstrumentOutcome::MergeFailed {
            symbol: instrument.symbol.clone(),
            error: e.to_string(),
        },
    }
}
