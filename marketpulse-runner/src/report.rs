//! Run reports: what each phase did, per-instrument outcomes, the failure if any.
//!
//! A report is produced for every invocation, printed by the CLI, handed to the
//! failure notifiers and appended to the run history.

use crate::upsert::UpsertSummary;
use chrono::{DateTime, Utc};
use marketpulse_core::data::MergeStats;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// One stage of the linear chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Phase {
    Fetch,
    Load,
    Transform,
    Refresh,
}

impl Phase {
    pub const ALL: [Phase; 4] = [Phase::Fetch, Phase::Load, Phase::Transform, Phase::Refresh];

    /// The phase that follows this one, `None` after REFRESH.
    pub fn next(self) -> Option<Phase> {
        match self {
            Phase::Fetch => Some(Phase::Load),
            Phase::Load => Some(Phase::Transform),
            Phase::Transform => Some(Phase::Refresh),
            Phase::Refresh => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Fetch => "FETCH",
            Phase::Load => "LOAD",
            Phase::Transform => "TRANSFORM",
            Phase::Refresh => "REFRESH",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A phase failure: which phase, and the underlying diagnostic.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{phase} phase failed: {message}")]
pub struct PhaseError {
    pub phase: Phase,
    pub message: String,
}

impl PhaseError {
    pub fn new(phase: Phase, message: impl Into<String>) -> Self {
        Self {
            phase,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    Succeeded,
    /// No collaborator configured for this phase.
    NotConfigured,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseRecord {
    pub phase: Phase,
    pub status: PhaseStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

/// What happened to one instrument during the fetch phase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum InstrumentOutcome {
    Merged { stats: MergeStats },
    Skipped { symbol: String, reason: String },
    MergeFailed { symbol: String, error: String },
}

impl InstrumentOutcome {
    pub fn symbol(&self) -> &str {
        match self {
            InstrumentOutcome::Merged { stats } => &stats.symbol,
            InstrumentOutcome::Skipped { symbol, .. } => symbol,
            InstrumentOutcome::MergeFailed { symbol, .. } => symbol,
        }
    }
}

/// Fetch phase result, in instrument order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FetchSummary {
    pub outcomes: Vec<InstrumentOutcome>,
}

impl FetchSummary {
    pub fn merged(&self) -> usize {
        self.count(|o| matches!(o, InstrumentOutcome::Merged { .. }))
    }

    pub fn skipped(&self) -> usize {
        self.count(|o| matches!(o, InstrumentOutcome::Skipped { .. }))
    }

    pub fn merge_failures(&self) -> usize {
        self.count(|o| matches!(o, InstrumentOutcome::MergeFailed { .. }))
    }

    pub fn outcome(&self, symbol: &str) -> Option<&InstrumentOutcome> {
        self.outcomes.iter().find(|o| o.symbol() == symbol)
    }

    fn count(&self, pred: impl Fn(&InstrumentOutcome) -> bool) -> usize {
        self.outcomes.iter().filter(|o| pred(o)).count()
    }
}

/// Full record of one pipeline invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub phases: Vec<PhaseRecord>,
    pub fetch: Option<FetchSummary>,
    pub load: Option<UpsertSummary>,
    pub failure: Option<PhaseError>,
}

impl RunReport {
    pub fn new(run_id: impl Into<String>, started_at: DateTime<Utc>) -> Self {
        Self {
            run_id: run_id.into(),
            started_at,
            finished_at: None,
            phases: Vec::new(),
            fetch: None,
            load: None,
            failure: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.failure.is_none()
    }

    pub fn failed_phase(&self) -> Option<Phase> {
        self.failure.as_ref().map(|f| f.phase)
    }

    /// Phases that were entered, in order.
    pub fn phases_run(&self) -> Vec<Phase> {
        self.phases.iter().map(|p| p.phase).collect()
    }

    pub fn phase_status(&self, phase: Phase) -> Option<PhaseStatus> {
        self.phases
            .iter()
            .find(|p| p.phase == phase)
            .map(|p| p.status)
    }
}
