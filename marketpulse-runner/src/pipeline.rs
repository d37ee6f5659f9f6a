//! Pipeline orchestrator: FETCH → LOAD → TRANSFORM → REFRESH.
//!
//! A linear chain with an absorbing failure state and no retries. Every run
//! produces a [`RunReport`]; a failed run is handed to the notifiers, and every
//! run is appended to the history when one is configured.

use crate::collaborators::{Refresher, Transformer};
use crate::fetch::{fetch_and_merge, FetchProgress, TracingProgress};
use crate::history::RunHistory;
use crate::lock::RunLock;
use crate::notify::{notify_all, Notifier};
use crate::report::{Phase, PhaseError, PhaseRecord, PhaseStatus, RunReport};
use crate::upsert::{UpsertMode, WarehouseUpserter};
use crate::warehouse::WarehouseConnector;
use chrono::Utc;
use marketpulse_core::data::{DataProvider, DatasetMerger, Pacer};
use marketpulse_core::domain::InstrumentList;
use marketpulse_core::store::ObjectStore;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, info_span, warn};

/// Where the chain stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Running(Phase),
    Succeeded,
    Failed(Phase),
}

impl PipelineState {
    pub fn initial() -> Self {
        PipelineState::Running(Phase::Fetch)
    }

    /// Transition after the current phase finished. Terminal states absorb.
    pub fn advance(self, phase_ok: bool) -> Self {
        match self {
            PipelineState::Running(phase) if !phase_ok => PipelineState::Failed(phase),
            PipelineState::Running(phase) => match phase.next() {
                Some(next) => PipelineState::Running(next),
                None => PipelineState::Succeeded,
            },
            terminal => terminal,
        }
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, PipelineState::Running(_))
    }
}

#[derive(Debug, Clone)]
pub struct PipelineOptions {
    /// Object-store prefix holding one dataset per instrument.
    pub prefix: String,
    pub upsert_mode: UpsertMode,
    /// Hold the store lock for the duration of the run.
    pub exclusive: bool,
    pub lock_stale_after: Duration,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            prefix: "alphavantage".to_string(),
            upsert_mode: UpsertMode::PerRow,
            exclusive: true,
            lock_stale_after: Duration::from_secs(6 * 3600),
        }
    }
}

pub struct Pipeline {
    provider: Box<dyn DataProvider>,
    store: Arc<dyn ObjectStore>,
    warehouse: Box<dyn WarehouseConnector>,
    instruments: InstrumentList,
    options: PipelineOptions,
    pacer: Pacer,
    transformer: Option<Box<dyn Transformer>>,
    refresher: Option<Box<dyn Refresher>>,
    notifiers: Vec<Box<dyn Notifier>>,
    history: Option<RunHistory>,
    progress: Box<dyn FetchProgress>,
}

impl Pipeline {
    pub fn new(
        provider: Box<dyn DataProvider>,
        store: Arc<dyn ObjectStore>,
        warehouse: Box<dyn WarehouseConnector>,
        instruments: InstrumentList,
        options: PipelineOptions,
    ) -> Self {
        Self {
            provider,
            store,
            warehouse,
            instruments,
            options,
            pacer: Pacer::new(Duration::from_secs(15)),
            transformer: None,
            refresher: None,
            notifiers: Vec::new(),
            history: None,
            progress: Box::new(TracingProgress),
        }
    }

    pub fn with_pacer(mut self, pacer: Pacer) -> Self {
        self.pacer = pacer;
        self
    }

    pub fn with_transformer(mut self, transformer: Box<dyn Transformer>) -> Self {
        self.transformer = Some(transformer);
        self
    }

    pub fn with_refresher(mut self, refresher: Box<dyn Refresher>) -> Self {
        self.refresher = Some(refresher);
        self
    }

    pub fn with_notifier(mut self, notifier: Box<dyn Notifier>) -> Self {
        self.notifiers.push(notifier);
        self
    }

    pub fn with_history(mut self, history: RunHistory) -> Self {
        self.history = Some(history);
        self
    }

    pub fn with_progress(mut self, progress: Box<dyn FetchProgress>) -> Self {
        self.progress = progress;
        self
    }

    pub fn instruments(&self) -> &InstrumentList {
        &self.instruments
    }

    /// Full chain.
    pub fn run(&self) -> RunReport {
        self.drive(Phase::Fetch, Phase::Refresh)
    }

    pub fn run_fetch(&self) -> RunReport {
        self.drive(Phase::Fetch, Phase::Fetch)
    }

    pub fn run_load(&self) -> RunReport {
        self.drive(Phase::Load, Phase::Load)
    }

    pub fn run_transform(&self) -> RunReport {
        self.drive(Phase::Transform, Phase::Transform)
    }

    pub fn run_refresh(&self) -> RunReport {
        self.drive(Phase::Refresh, Phase::Refresh)
    }

    fn run_id(&self, first: Phase, last: Phase) -> String {
        let mut hasher = blake3::Hasher::new();
        hasher.update(Utc::now().to_rfc3339().as_bytes());
        hasher.update(&std::process::id().to_le_bytes());
        hasher.update(first.as_str().as_bytes());
        hasher.update(last.as_str().as_bytes());
        hasher.update(self.store.describe().as_bytes());
        hasher.finalize().to_hex()[..16].to_string()
    }

    /// Run phases `first..=last` through the state machine.
    fn drive(&self, first: Phase, last: Phase) -> RunReport {
        let mut report = RunReport::new(self.run_id(first, last), Utc::now());
        let span = info_span!("run", run_id = %report.run_id);
        let _guard = span.enter();
        info!(from = %first, to = %last, store = %self.store.describe(), "pipeline run started");

        let lock = if self.options.exclusive {
            match RunLock::acquire(self.store.as_ref(), &report.run_id, self.options.lock_stale_after) {
                Ok(lock) => Some(lock),
                Err(e) => {
                    let now = Utc::now();
                    report.phases.push(PhaseRecord {
                        phase: first,
                        status: PhaseStatus::Failed,
                        started_at: now,
                        finished_at: now,
                    });
                    report.failure = Some(PhaseError::new(first, e.to_string()));
                    return self.finish(report, None);
                }
            }
        } else {
            None
        };

        let mut state = PipelineState::Running(first);
        while let PipelineState::Running(phase) = state {
            let ok = self.run_phase(phase, &mut report);
            state = if ok && phase == last {
                PipelineState::Succeeded
            } else {
                state.advance(ok)
            };
        }

        self.finish(report, lock)
    }

    fn finish(&self, mut report: RunReport, lock: Option<RunLock<'_>>) -> RunReport {
        report.finished_at = Some(Utc::now());

        match &report.failure {
            Some(failure) => {
                error!(phase = %failure.phase, error = %failure.message, "pipeline run failed");
                notify_all(&self.notifiers, &report);
            }
            None => info!(phases = report.phases.len(), "pipeline run succeeded"),
        }

        if let Some(history) = &self.history {
            if let Err(e) = history.append(&report) {
                warn!(path = %history.path().display(), error = %e, "could not record run history");
            }
        }

        if let Some(lock) = lock {
            if let Err(e) = lock.release() {
                warn!(error = %e, "failed to release pipeline lock");
            }
        }
        report
    }

    /// Execute one phase and record it. Returns whether the chain may continue.
    fn run_phase(&self, phase: Phase, report: &mut RunReport) -> bool {
        let started_at = Utc::now();
        info!(%phase, "phase started");

        let result = match phase {
            Phase::Fetch => self.fetch_phase(report),
            Phase::Load => self.load_phase(report),
            Phase::Transform => self.transform_phase(),
            Phase::Refresh => self.refresh_phase(),
        };

        let status = match &result {
            Ok(status) => *status,
            Err(_) => PhaseStatus::Failed,
        };
        report.phases.push(PhaseRecord {
            phase,
            status,
            started_at,
            finished_at: Utc::now(),
        });

        match result {
            Ok(status) => {
                info!(%phase, ?status, "phase finished");
                true
            }
            Err(message) => {
                report.failure = Some(PhaseError::new(phase, message));
                false
            }
        }
    }

    fn fetch_phase(&self, report: &mut RunReport) -> Result<PhaseStatus, String> {
        let merger = DatasetMerger::new(self.store.as_ref(), &self.options.prefix);
        let summary = fetch_and_merge(
            self.provider.as_ref(),
            &merger,
            &self.pacer,
            &self.instruments,
            self.progress.as_ref(),
        );

        // Skips are never fatal; merge failures are, but only when no merge worked at all.
        let failures = summary.merge_failures();
        let all_merges_failed = failures > 0 && summary.merged() == 0;
        report.fetch = Some(summary);

        if all_merges_failed {
            return Err(format!(
                "every dataset merge failed ({failures} instruments), storage at {} looks unusable",
                self.store.describe()
            ));
        }
        Ok(PhaseStatus::Succeeded)
    }

    fn load_phase(&self, report: &mut RunReport) -> Result<PhaseStatus, String> {
        let mut warehouse = self
            .warehouse
            .connect()
            .map_err(|e| format!("cannot connect to {}: {e}", self.warehouse.describe()))?;
        warehouse.ensure_table().map_err(|e| e.to_string())?;

        let upserter = WarehouseUpserter::new(
            self.store.as_ref(),
            &self.options.prefix,
            self.options.upsert_mode,
        );
        let summary = upserter.run(warehouse.as_mut()).map_err(|e| e.to_string())?;
        info!(
            inserted = summary.inserted.len(),
            updated = summary.updated.len(),
            digest = %summary.digest,
            "warehouse load complete"
        );
        report.load = Some(summary);
        Ok(PhaseStatus::Succeeded)
    }

    fn transform_phase(&self) -> Result<PhaseStatus, String> {
        let Some(transformer) = &self.transformer else {
            info!("no transformer configured, skipping");
            return Ok(PhaseStatus::NotConfigured);
        };
        transformer.run().map_err(|e| e.to_string())?;
        info!(transformer = transformer.name(), "transformation succeeded");
        Ok(PhaseStatus::Succeeded)
    }

    fn refresh_phase(&self) -> Result<PhaseStatus, String> {
        let Some(refresher) = &self.refresher else {
            info!("no refresher configured, skipping");
            return Ok(PhaseStatus::NotConfigured);
        };
        refresher.run().map_err(|e| e.to_string())?;
        info!(refresher = refresher.name(), "refresh succeeded");
        Ok(PhaseStatus::Succeeded)
    }
}
