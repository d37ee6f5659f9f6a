//! MarketPulse Runner — orchestration of the daily market-data pipeline.
//!
//! This crate builds on `marketpulse-core` to provide:
//! - The fetch phase (paced fetch, per-instrument merge, progress reporting)
//! - The warehouse upserter and its SQLite warehouse
//! - Transformation and dashboard-refresh collaborators
//! - The FETCH → LOAD → TRANSFORM → REFRESH orchestrator with run reports
//! - Run exclusivity, JSONL run history and failure notifications
//! - TOML configuration with secrets from the environment

pub mod collaborators;
pub mod config;
pub mod fetch;
pub mod history;
pub mod lock;
pub mod notify;
pub mod pipeline;
pub mod report;
pub mod upsert;
pub mod warehouse;

pub use collaborators::{
    CollaboratorError, CommandTransformer, MetabaseAuth, MetabaseRefresher, Refresher, Transformer,
};
pub use config::{ConfigError, PipelineConfig};
pub use fetch::{fetch_and_merge, FetchProgress, TracingProgress};
pub use history::RunHistory;
pub use lock::{LockError, RunLock, LOCK_KEY};
pub use notify::{EmailNotifier, LogNotifier, Notifier, NotifyError, WebhookNotifier};
pub use pipeline::{Pipeline, PipelineOptions, PipelineState};
pub use report::{
    FetchSummary, InstrumentOutcome, Phase, PhaseError, PhaseRecord, PhaseStatus, RunReport,
};
pub use upsert::{UpsertError, UpsertMode, UpsertSummary, WarehouseUpserter};
pub use warehouse::{
    SqliteConnector, SqliteWarehouse, UpsertAction, Warehouse, WarehouseConnector,
    WarehouseError, WarehouseRow,
};

#[cfg(test)]
mod send_sync_checks {
    use super::*;

    fn assert_send<T: Send>() {}
    fn assert_sync<T: Sync>() {}

    #[test]
    fn reports_are_send_sync() {
        assert_send::<RunReport>();
        assert_sync::<RunReport>();
        assert_send::<UpsertSummary>();
        assert_sync::<UpsertSummary>();
    }

    #[test]
    fn errors_are_send_sync() {
        assert_send::<PhaseError>();
        assert_sync::<PhaseError>();
        assert_send::<CollaboratorError>();
        assert_sync::<CollaboratorError>();
        assert_send::<ConfigError>();
        assert_sync::<ConfigError>();
    }

    #[test]
    fn handles_are_send_sync() {
        assert_send::<SqliteConnector>();
        assert_sync::<SqliteConnector>();
        assert_send::<MetabaseRefresher>();
        assert_sync::<MetabaseRefresher>();
        assert_send::<CommandTransformer>();
        assert_sync::<CommandTransformer>();
    }
}
