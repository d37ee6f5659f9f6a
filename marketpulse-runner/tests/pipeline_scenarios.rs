//! End-to-end pipeline runs against an in-memory bucket and a temp SQLite warehouse.

mod common;

use common::{dataset, date, rec, MockServer, ScriptedProvider};
use marketpulse_core::data::{AlphaVantageProvider, DataProvider, DatasetMerger, Pacer};
use marketpulse_core::domain::{Instrument, InstrumentDataset, InstrumentList};
use marketpulse_core::store::{MemoryObjectStore, ObjectStore, JSON_CONTENT_TYPE};
use marketpulse_runner::{
    CollaboratorError, InstrumentOutcome, Notifier, NotifyError, Phase, PhaseStatus, Pipeline,
    PipelineOptions, Refresher, RunHistory, RunLock, RunReport, SqliteConnector, SqliteWarehouse,
    Transformer, UpsertMode, Warehouse,
};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

const TABLE: &str = "RAW_ALPHAVANTAGE";
const PREFIX: &str = "alphavantage";

#[derive(Clone, Default)]
struct Counter(Arc<AtomicUsize>);

impl Counter {
    fn get(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }
    fn hit(&self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

struct CountingTransformer {
    calls: Counter,
    fail: bool,
}

impl Transformer for CountingTransformer {
    fn name(&self) -> &str {
        "counting"
    }
    fn run(&self) -> Result<(), CollaboratorError> {
        self.calls.hit();
        if self.fail {
            return Err(CollaboratorError::NonZeroExit {
                program: "dbt".into(),
                status: "exit status: 1".into(),
                stderr: "compilation error".into(),
            });
        }
        Ok(())
    }
}

struct CountingRefresher(Counter);

impl Refresher for CountingRefresher {
    fn name(&self) -> &str {
        "counting"
    }
    fn run(&self) -> Result<(), CollaboratorError> {
        self.0.hit();
        Ok(())
    }
}

struct CountingNotifier(Counter);

impl Notifier for CountingNotifier {
    fn name(&self) -> &str {
        "counting"
    }
    fn notify_failure(&self, _report: &RunReport) -> Result<(), NotifyError> {
        self.0.hit();
        Ok(())
    }
}

struct Harness {
    dir: TempDir,
    store: Arc<MemoryObjectStore>,
    provider: ScriptedProvider,
    transforms: Counter,
    refreshes: Counter,
    notifications: Counter,
}

impl Harness {
    fn new() -> Self {
        Self {
            dir: tempfile::tempdir().unwrap(),
            store: Arc::new(MemoryObjectStore::new()),
            provider: ScriptedProvider::default(),
            transforms: Counter::default(),
            refreshes: Counter::default(),
            notifications: Counter::default(),
        }
    }

    fn warehouse_path(&self) -> PathBuf {
        self.dir.path().join("warehouse.db")
    }

    fn pipeline(&self, symbols: &[&str]) -> Pipeline {
        self.pipeline_with(symbols, &self.warehouse_path(), false)
    }

    fn pipeline_with(&self, symbols: &[&str], warehouse: &Path, failing_transform: bool) -> Pipeline {
        self.pipeline_over(Box::new(self.provider.clone()), symbols, warehouse, failing_transform)
    }

    fn pipeline_over(
        &self,
        provider: Box<dyn DataProvider>,
        symbols: &[&str],
        warehouse: &Path,
        failing_transform: bool,
    ) -> Pipeline {
        let symbols: Vec<String> = symbols.iter().map(|s| s.to_string()).collect();
        let instruments = InstrumentList::from_symbols(&symbols, &BTreeMap::new()).unwrap();
        Pipeline::new(
            provider,
            self.store.clone(),
            Box::new(SqliteConnector::new(warehouse, TABLE)),
            instruments,
            PipelineOptions::default(),
        )
        .with_pacer(Pacer::none())
        .with_transformer(Box::new(CountingTransformer {
            calls: self.transforms.clone(),
            fail: failing_transform,
        }))
        .with_refresher(Box::new(CountingRefresher(self.refreshes.clone())))
        .with_notifier(Box::new(CountingNotifier(self.notifications.clone())))
    }

    fn stored(&self, symbol: &str) -> Option<InstrumentDataset> {
        DatasetMerger::new(&*self.store, PREFIX).load(symbol).unwrap()
    }

    fn warehouse(&self) -> SqliteWarehouse {
        let mut wh = SqliteWarehouse::open(&self.warehouse_path(), TABLE).unwrap();
        wh.ensure_table().unwrap();
        wh
    }
}

#[test]
fn first_fetch_creates_dataset_and_row() {
    let h = Harness::new();
    h.provider
        .respond("AAA", dataset("AAA", &[("2024-01-01", 10.0), ("2024-01-02", 11.0)]));

    let report = h.pipeline(&["AAA"]).run();

    assert!(report.is_success(), "{:?}", report.failure);
    assert_eq!(report.phases_run(), Phase::ALL.to_vec());

    let stored = h.stored("AAA").unwrap();
    let expected: BTreeMap<_, _> = [(date("2024-01-01"), rec(10.0)), (date("2024-01-02"), rec(11.0))]
        .into_iter()
        .collect();
    assert_eq!(stored.series, expected);

    let row = h.warehouse().row("AAA").unwrap().unwrap();
    assert_eq!(row.payload, serde_json::to_value(&stored).unwrap());
    assert_eq!(h.transforms.get(), 1);
    assert_eq!(h.refreshes.get(), 1);
    assert_eq!(h.notifications.get(), 0);
}

#[test]
fn later_fetch_overwrites_and_extends() {
    let h = Harness::new();
    DatasetMerger::new(&*h.store, PREFIX)
        .merge(&Instrument::new("AAA"), dataset("AAA", &[("2024-01-01", 10.0)]))
        .unwrap();
    h.provider
        .respond("AAA", dataset("AAA", &[("2024-01-01", 10.5), ("2024-01-02", 11.0)]));

    let report = h.pipeline(&["AAA"]).run();
    assert!(report.is_success());

    let stored = h.stored("AAA").unwrap();
    assert_eq!(stored.day_count(), 2);
    assert_eq!(stored.series[&date("2024-01-01")], rec(10.5));
    assert_eq!(stored.series[&date("2024-01-02")], rec(11.0));
}

#[test]
fn http_failure_skips_instrument_and_run_continues() {
    let h = Harness::new();
    h.provider.respond("AAA", dataset("AAA", &[("2024-01-02", 11.0)]));
    // BBB has no scripted response: HTTP 500

    let report = h.pipeline(&["BBB", "AAA"]).run();

    assert!(report.is_success());
    assert_eq!(h.provider.calls(), ["BBB", "AAA"]);
    let fetch = report.fetch.as_ref().unwrap();
    assert!(matches!(fetch.outcome("BBB"), Some(InstrumentOutcome::Skipped { .. })));
    assert!(h.stored("BBB").is_none());

    let wh = h.warehouse();
    assert!(wh.row("BBB").unwrap().is_none());
    assert!(wh.row("AAA").unwrap().is_some());
}

#[test]
fn load_updates_existing_and_inserts_new_rows() {
    let h = Harness::new();
    let merger = DatasetMerger::new(&*h.store, PREFIX);
    merger
        .merge(&Instrument::new("AAA"), dataset("AAA", &[("2024-01-01", 10.0)]))
        .unwrap();

    let first = h.pipeline(&["AAA"]).run_load();
    assert_eq!(first.load.as_ref().unwrap().inserted, ["AAA"]);
    let before = h.warehouse().row("AAA").unwrap().unwrap();

    merger
        .merge(&Instrument::new("AAA"), dataset("AAA", &[("2024-01-02", 12.0)]))
        .unwrap();
    merger
        .merge(&Instrument::new("BBB"), dataset("BBB", &[("2024-01-02", 5.0)]))
        .unwrap();

    let report = h.pipeline(&["AAA", "BBB"]).run_load();
    assert!(report.is_success());
    let load = report.load.as_ref().unwrap();
    assert_eq!(load.updated, ["AAA"]);
    assert_eq!(load.inserted, ["BBB"]);
    assert_eq!(report.phases_run(), [Phase::Load]);

    let rows = h.warehouse().rows().unwrap();
    assert_eq!(rows.len(), 2);
    assert!(rows[0].loaded_at >= before.loaded_at);
    assert_eq!(
        rows[0].payload["Time Series (Daily)"].as_object().unwrap().len(),
        2
    );
}

#[test]
fn throttled_response_leaves_stored_dataset_untouched() {
    let h = Harness::new();
    DatasetMerger::new(&*h.store, PREFIX)
        .merge(&Instrument::new("AAA"), dataset("AAA", &[("2024-01-01", 10.0)]))
        .unwrap();
    let before = h.store.get("alphavantage/AAA.json").unwrap().unwrap();

    let server = MockServer::start(|_, _, _| {
        (200, r#"{"Note": "Our standard API call frequency is 5 calls per minute."}"#.into())
    });
    let provider =
        AlphaVantageProvider::new("demo-key", format!("{}/query", server.url), Duration::from_secs(5))
            .unwrap();

    let report = h
        .pipeline_over(Box::new(provider), &["AAA"], &h.warehouse_path(), false)
        .run();

    let fetch = report.fetch.as_ref().unwrap();
    assert!(matches!(fetch.outcome("AAA"), Some(InstrumentOutcome::Skipped { .. })));
    assert_eq!(server.requests().len(), 1);
    assert_eq!(h.store.get("alphavantage/AAA.json").unwrap().unwrap(), before);
}

#[test]
fn warehouse_connection_failure_stops_before_transform() {
    let h = Harness::new();
    h.provider.respond("AAA", dataset("AAA", &[("2024-01-02", 11.0)]));
    let unreachable = h.dir.path().join("missing-dir").join("warehouse.db");

    let report = h.pipeline_with(&["AAA"], &unreachable, false).run();

    assert_eq!(report.failed_phase(), Some(Phase::Load));
    assert_eq!(report.phases_run(), [Phase::Fetch, Phase::Load]);
    assert_eq!(report.phase_status(Phase::Fetch), Some(PhaseStatus::Succeeded));
    assert!(report.failure.as_ref().unwrap().message.contains("cannot connect"));
    assert_eq!(h.transforms.get(), 0);
    assert_eq!(h.refreshes.get(), 0);
    assert_eq!(h.notifications.get(), 1);
    // fetched data is kept for the next run
    assert!(h.stored("AAA").is_some());
}

#[test]
fn transform_failure_stops_before_refresh() {
    let h = Harness::new();
    h.provider.respond("AAA", dataset("AAA", &[("2024-01-02", 11.0)]));

    let report = h.pipeline_with(&["AAA"], &h.warehouse_path(), true).run();

    assert_eq!(report.failed_phase(), Some(Phase::Transform));
    assert!(report.failure.as_ref().unwrap().message.contains("compilation error"));
    assert_eq!(h.transforms.get(), 1);
    assert_eq!(h.refreshes.get(), 0);
    // LOAD committed before the failure
    assert!(h.warehouse().row("AAA").unwrap().is_some());
}

#[test]
fn missing_collaborators_are_not_configured_successes() {
    let h = Harness::new();
    h.provider.respond("AAA", dataset("AAA", &[("2024-01-02", 11.0)]));
    let instruments = InstrumentList::from_symbols(&["AAA".into()], &BTreeMap::new()).unwrap();
    let pipeline = Pipeline::new(
        Box::new(h.provider.clone()),
        h.store.clone(),
        Box::new(SqliteConnector::new(h.warehouse_path(), TABLE)),
        instruments,
        PipelineOptions {
            upsert_mode: UpsertMode::Atomic,
            ..PipelineOptions::default()
        },
    )
    .with_pacer(Pacer::none());

    let report = pipeline.run();
    assert!(report.is_success());
    assert_eq!(report.phase_status(Phase::Transform), Some(PhaseStatus::NotConfigured));
    assert_eq!(report.phase_status(Phase::Refresh), Some(PhaseStatus::NotConfigured));
}

#[test]
fn all_merges_failing_fails_fetch() {
    let h = Harness::new();
    h.provider.respond("AAA", dataset("AAA", &[("2024-01-02", 11.0)]));
    h.store
        .put("alphavantage/AAA.json", b"{broken", JSON_CONTENT_TYPE)
        .unwrap();

    let report = h.pipeline(&["AAA"]).run();

    assert_eq!(report.failed_phase(), Some(Phase::Fetch));
    assert_eq!(report.phases_run(), [Phase::Fetch]);
    assert_eq!(report.fetch.as_ref().unwrap().merge_failures(), 1);
    // corrupt payload left for a human to inspect
    assert_eq!(h.store.get("alphavantage/AAA.json").unwrap().unwrap(), b"{broken");
}

#[test]
fn one_corrupt_dataset_does_not_block_the_others() {
    let h = Harness::new();
    h.provider.respond("AAA", dataset("AAA", &[("2024-01-02", 11.0)]));
    h.provider.respond("BBB", dataset("BBB", &[("2024-01-02", 5.0)]));
    h.store
        .put("alphavantage/AAA.json", b"{broken", JSON_CONTENT_TYPE)
        .unwrap();

    let report = h.pipeline(&["AAA", "BBB"]).run_fetch();

    assert!(report.is_success());
    let fetch = report.fetch.as_ref().unwrap();
    assert_eq!(fetch.merge_failures(), 1);
    assert_eq!(fetch.merged(), 1);
    assert!(h.stored("BBB").is_some());
}

#[test]
fn held_lock_fails_the_run_at_fetch() {
    let h = Harness::new();
    h.provider.respond("AAA", dataset("AAA", &[("2024-01-02", 11.0)]));
    let _other = RunLock::acquire(&*h.store, "other-run", Duration::from_secs(3600)).unwrap();

    let report = h.pipeline(&["AAA"]).run();

    assert_eq!(report.failed_phase(), Some(Phase::Fetch));
    assert!(report.failure.as_ref().unwrap().message.contains("other-run"));
    assert!(h.provider.calls().is_empty());
    assert_eq!(h.notifications.get(), 1);
}

#[test]
fn runs_are_recorded_in_history() {
    let h = Harness::new();
    h.provider.respond("AAA", dataset("AAA", &[("2024-01-02", 11.0)]));
    let history_path = h.dir.path().join("state").join("runs.jsonl");

    let ok = h
        .pipeline(&["AAA"])
        .with_history(RunHistory::new(&history_path))
        .run();
    let failed = h
        .pipeline_with(&["AAA"], &h.dir.path().join("nope").join("wh.db"), false)
        .with_history(RunHistory::new(&history_path))
        .run_load();

    let recent = RunHistory::new(&history_path).read_recent(10).unwrap();
    assert_eq!(recent.len(), 2);
    assert_eq!(recent[0].run_id, failed.run_id);
    assert_eq!(recent[0].failed_phase(), Some(Phase::Load));
    assert_eq!(recent[1].run_id, ok.run_id);
    assert!(recent[1].is_success());
}

#[test]
fn rerun_with_unchanged_data_is_a_no_op() {
    let h = Harness::new();
    h.provider
        .respond("AAA", dataset("AAA", &[("2024-01-01", 10.0), ("2024-01-02", 11.0)]));

    let first = h.pipeline(&["AAA"]).run();
    let payload_before = h.store.get("alphavantage/AAA.json").unwrap();
    let second = h.pipeline(&["AAA"]).run();

    assert!(first.is_success() && second.is_success());
    assert_eq!(h.store.get("alphavantage/AAA.json").unwrap(), payload_before);
    assert_eq!(
        first.load.as_ref().unwrap().digest,
        second.load.as_ref().unwrap().digest
    );
    assert_eq!(second.load.as_ref().unwrap().updated, ["AAA"]);
    assert_eq!(h.warehouse().rows().unwrap().len(), 1);
}
