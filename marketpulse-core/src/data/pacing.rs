//! Fixed-interval pacing between provider calls.
//!
//! The free provider tier allows a handful of calls per minute, so every call,
//! successful or not and including the last one of a run, is followed by the
//! same pause.

use super::provider::{DataError, DataProvider, FetchResult};
use crate::domain::Instrument;
use std::sync::Arc;
use std::time::Duration;

/// Blocking pause primitive.
pub trait Pause: Send + Sync {
    fn pause(&self, duration: Duration);
}

/// Sleeps the current thread.
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadSleep;

impl Pause for ThreadSleep {
    fn pause(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// Enforces a fixed delay after each provider call.
#[derive(Clone)]
pub struct Pacer {
    interval: Duration,
    pause: Arc<dyn Pause>,
}

impl std::fmt::Debug for Pacer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pacer")
            .field("interval", &self.interval)
            .finish_non_exhaustive()
    }
}

impl Pacer {
    pub fn new(interval: Duration) -> Self {
        Self::with_pause(interval, Arc::new(ThreadSleep))
    }

    pub fn with_pause(interval: Duration, pause: Arc<dyn Pause>) -> Self {
        Self { interval, pause }
    }

    /// No delay at all (tests, replays against a local mirror).
    pub fn none() -> Self {
        Self::new(Duration::ZERO)
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn after_call(&self) {
        if !self.interval.is_zero() {
            self.pause.pause(self.interval);
        }
    }
}

/// One provider call followed by one pacing pause, whatever the outcome.
pub fn fetch_paced(
    provider: &dyn DataProvider,
    instrument: &Instrument,
    pacer: &Pacer,
) -> Result<FetchResult, DataError> {
    let result = provider.fetch(instrument);
    pacer.after_call();
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::InstrumentDataset;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingPause {
        pauses: Mutex<Vec<Duration>>,
    }

    impl Pause for RecordingPause {
        fn pause(&self, duration: Duration) {
            self.pauses.lock().unwrap().push(duration);
        }
    }

    struct FixedProvider {
        fail: bool,
    }

    impl DataProvider for FixedProvider {
        fn name(&self) -> &str {
            "fixed"
        }

        fn fetch(&self, instrument: &Instrument) -> Result<FetchResult, DataError> {
            if self.fail {
                return Err(DataError::Http {
                    symbol: instrument.symbol.clone(),
                    status: 500,
                });
            }
            Ok(FetchResult {
                symbol: instrument.symbol.clone(),
                request_symbol: instrument.request_symbol().to_string(),
                dataset: InstrumentDataset::default(),
                source: "fixed".into(),
            })
        }
    }

    #[test]
    fn pauses_after_success() {
        let rec = Arc::new(RecordingPause::default());
        let pacer = Pacer::with_pause(Duration::from_secs(15), rec.clone());
        let result = fetch_paced(&FixedProvider { fail: false }, &Instrument::new("AAA"), &pacer);
        assert!(result.is_ok());
        assert_eq!(*rec.pauses.lock().unwrap(), vec![Duration::from_secs(15)]);
    }

    #[test]
    fn pauses_after_failure_too() {
        let rec = Arc::new(RecordingPause::default());
        let pacer = Pacer::with_pause(Duration::from_secs(15), rec.clone());
        let result = fetch_paced(&FixedProvider { fail: true }, &Instrument::new("BBB"), &pacer);
        assert!(result.is_err());
        assert_eq!(rec.pauses.lock().unwrap().len(), 1);
    }

    #[test]
    fn zero_interval_never_pauses() {
        let rec = Arc::new(RecordingPause::default());
        let pacer = Pacer::with_pause(Duration::ZERO, rec.clone());
        pacer.after_call();
        pacer.after_call();
        assert!(rec.pauses.lock().unwrap().is_empty());
    }
}
