//! Pipeline configuration: a TOML file plus secrets from the environment.
//!
//! Every section is optional and defaults to the standard deployment: the
//! top-10 equities, a 15 second call interval, the `alphavantage` prefix and
//! the `RAW_ALPHAVANTAGE` table.

use crate::collaborators::{CommandTransformer, MetabaseRefresher};
use crate::history::RunHistory;
use crate::notify::{EmailNotifier, LogNotifier, WebhookNotifier};
use crate::pipeline::{Pipeline, PipelineOptions};
use crate::upsert::UpsertMode;
use crate::warehouse::SqliteConnector;
use marketpulse_core::data::alpha_vantage::DEFAULT_BASE_URL;
use marketpulse_core::data::{AlphaVantageProvider, Pacer};
use marketpulse_core::domain::{InstrumentError, InstrumentList};
use marketpulse_core::store::{FsObjectStore, ObjectStore};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

pub const ENV_API_KEY: &str = "ALPHAVANTAGE_API_KEY";
pub const ENV_METABASE_URL: &str = "METABASE_URL";
pub const ENV_METABASE_USER: &str = "METABASE_USER";
pub const ENV_METABASE_PASSWORD: &str = "METABASE_PASSWORD";
pub const ENV_METABASE_API_KEY: &str = "METABASE_API_KEY";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config '{path}': {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid value for {field}: {message}")]
    Invalid { field: String, message: String },

    #[error("missing secret: set {0}")]
    MissingSecret(String),

    #[error(transparent)]
    Instruments(#[from] InstrumentError),

    #[error("cannot set up {component}: {message}")]
    Setup { component: String, message: String },
}

fn setup_err(component: &str) -> impl FnOnce(String) -> ConfigError + '_ {
    move |message| ConfigError::Setup {
        component: component.to_string(),
        message,
    }
}

fn invalid(field: &str, message: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field: field.to_string(),
        message: message.into(),
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PipelineConfig {
    pub provider: ProviderConfig,
    pub instruments: InstrumentsConfig,
    pub store: StoreConfig,
    pub warehouse: WarehouseConfig,
    pub transform: Option<TransformConfig>,
    pub refresh: Option<RefreshConfig>,
    pub notify: NotifyConfig,
    pub pipeline: RunConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProviderConfig {
    /// Normally left unset here and supplied through `ALPHAVANTAGE_API_KEY`.
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
    pub base_url: String,
    pub timeout_secs: u64,
    /// Pause after every provider call, successful or not.
    pub pacing_secs: u64,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: DEFAULT_BASE_URL.to_string(),
            timeout_secs: 30,
            pacing_secs: 15,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct InstrumentsConfig {
    pub symbols: Vec<String>,
    /// Canonical symbol -> symbol the provider expects. Not inherited from the
    /// default list once `symbols` is overridden.
    #[serde(default)]
    pub aliases: BTreeMap<String, String>,
}

impl Default for InstrumentsConfig {
    fn default() -> Self {
        let defaults = InstrumentList::default_top10();
        Self {
            symbols: defaults.iter().map(|i| i.symbol.clone()).collect(),
            aliases: defaults
                .iter()
                .filter_map(|i| i.alias.clone().map(|a| (i.symbol.clone(), a)))
                .collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StoreConfig {
    /// Bucket root directory.
    pub root: PathBuf,
    pub prefix: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("data/market-raw"),
            prefix: "alphavantage".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WarehouseConfig {
    pub path: PathBuf,
    pub table: String,
    pub upsert_mode: UpsertMode,
}

impl Default for WarehouseConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("data/warehouse.db"),
            table: "RAW_ALPHAVANTAGE".to_string(),
            upsert_mode: UpsertMode::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TransformConfig {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RefreshConfig {
    pub url: String,
    #[serde(skip_serializing)]
    pub username: Option<String>,
    #[serde(skip_serializing)]
    pub password: Option<String>,
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
    /// Engine name of the warehouse connection inside Metabase.
    pub engine: String,
    pub timeout_secs: u64,
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            username: None,
            password: None,
            api_key: None,
            engine: "sqlite".to_string(),
            timeout_secs: 60,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct NotifyConfig {
    /// Log failures at error level.
    pub log: bool,
    pub email: Option<EmailConfig>,
    pub webhook: Option<WebhookConfig>,
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            log: true,
            email: None,
            webhook: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EmailConfig {
    #[serde(default = "default_sendmail")]
    pub sendmail: PathBuf,
    pub from: String,
    pub to: Vec<String>,
}

fn default_sendmail() -> PathBuf {
    PathBuf::from("/usr/sbin/sendmail")
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WebhookConfig {
    pub url: String,
    #[serde(default = "default_webhook_timeout")]
    pub timeout_secs: u64,
}

fn default_webhook_timeout() -> u64 {
    10
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RunConfig {
    /// Refuse to start while another run holds the lock.
    pub exclusive: bool,
    pub lock_stale_after_secs: u64,
    pub history_path: PathBuf,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            exclusive: true,
            lock_stale_after_secs: 6 * 3600,
            history_path: PathBuf::from("data/runs.jsonl"),
        }
    }
}

impl PipelineConfig {
    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&text)
    }

    /// Overlay secrets from the environment. `lookup` is usually `std::env::var(..).ok()`.
    ///
    /// `METABASE_URL` alone is enough to enable the refresh phase.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        if let Some(key) = get(ENV_API_KEY) {
            self.provider.api_key = Some(key);
        }

        let url = get(ENV_METABASE_URL);
        if self.refresh.is_none() && url.is_some() {
            self.refresh = Some(RefreshConfig::default());
        }
        if let Some(refresh) = self.refresh.as_mut() {
            if let Some(url) = url {
                refresh.url = url;
            }
            if let Some(user) = get(ENV_METABASE_USER) {
                refresh.username = Some(user);
            }
            if let Some(password) = get(ENV_METABASE_PASSWORD) {
                refresh.password = Some(password);
            }
            if let Some(key) = get(ENV_METABASE_API_KEY) {
                refresh.api_key = Some(key);
            }
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.provider.timeout_secs == 0 {
            return Err(invalid("provider.timeout_secs", "must be positive"));
        }
        if self.provider.base_url.trim().is_empty() {
            return Err(invalid("provider.base_url", "must not be empty"));
        }
        if self.store.prefix.trim_matches('/').is_empty() {
            return Err(invalid("store.prefix", "must not be empty"));
        }
        if self.store.prefix.trim_matches('/').starts_with("_locks") {
            return Err(invalid("store.prefix", "'_locks' is reserved"));
        }
        crate::warehouse::validate_table_name(&self.warehouse.table)
            .map_err(|e| invalid("warehouse.table", e.to_string()))?;
        self.instrument_list()?;

        if let Some(t) = &self.transform {
            if t.program.trim().is_empty() {
                return Err(invalid("transform.program", "must not be empty"));
            }
        }
        if let Some(r) = &self.refresh {
            if r.url.trim().is_empty() {
                return Err(invalid("refresh.url", format!("must be set (or export {ENV_METABASE_URL})")));
            }
            r.auth()?;
        }
        if let Some(e) = &self.notify.email {
            if e.to.is_empty() {
                return Err(invalid("notify.email.to", "needs at least one recipient"));
            }
        }
        Ok(())
    }

    pub fn instrument_list(&self) -> Result<InstrumentList, ConfigError> {
        Ok(InstrumentList::from_symbols(
            &self.instruments.symbols,
            &self.instruments.aliases,
        )?)
    }

    pub fn pacer(&self) -> Pacer {
        Pacer::new(Duration::from_secs(self.provider.pacing_secs))
    }

    pub fn provider_timeout(&self) -> Duration {
        Duration::from_secs(self.provider.timeout_secs)
    }

    pub fn require_api_key(&self) -> Result<&str, ConfigError> {
        self.provider
            .api_key
            .as_deref()
            .ok_or_else(|| ConfigError::MissingSecret(ENV_API_KEY.to_string()))
    }
}

impl PipelineConfig {
    pub fn pipeline_options(&self) -> PipelineOptions {
        PipelineOptions {
            prefix: self.store.prefix.trim_matches('/').to_string(),
            upsert_mode: self.warehouse.upsert_mode,
            exclusive: self.pipeline.exclusive,
            lock_stale_after: Duration::from_secs(self.pipeline.lock_stale_after_secs),
        }
    }

    pub fn object_store(&self) -> Arc<dyn ObjectStore> {
        Arc::new(FsObjectStore::new(&self.store.root))
    }

    pub fn warehouse_connector(&self) -> SqliteConnector {
        SqliteConnector::new(&self.warehouse.path, &self.warehouse.table)
    }

    /// Wire every configured component into a pipeline. Validates first.
    pub fn build_pipeline(&self) -> Result<Pipeline, ConfigError> {
        self.validate()?;

        let provider = AlphaVantageProvider::new(
            self.require_api_key()?,
            &self.provider.base_url,
            self.provider_timeout(),
        )
        .map_err(|e| setup_err("provider")(e.to_string()))?;

        let mut pipeline = Pipeline::new(
            Box::new(provider),
            self.object_store(),
            Box::new(self.warehouse_connector()),
            self.instrument_list()?,
            self.pipeline_options(),
        )
        .with_pacer(self.pacer())
        .with_history(RunHistory::new(&self.pipeline.history_path));

        if let Some(t) = &self.transform {
            pipeline = pipeline.with_transformer(Box::new(CommandTransformer::new(
                &t.program,
                t.args.clone(),
                t.working_dir.clone(),
            )));
        }
        if let Some(r) = &self.refresh {
            let refresher = MetabaseRefresher::new(&r.url, r.auth()?, &r.engine, r.timeout())
                .map_err(|e| setup_err("refresh")(e.to_string()))?;
            pipeline = pipeline.with_refresher(Box::new(refresher));
        }

        if self.notify.log {
            pipeline = pipeline.with_notifier(Box::new(LogNotifier));
        }
        if let Some(e) = &self.notify.email {
            pipeline = pipeline.with_notifier(Box::new(EmailNotifier::new(
                &e.sendmail,
                &e.from,
                e.to.clone(),
            )));
        }
        if let Some(w) = &self.notify.webhook {
            let webhook = WebhookNotifier::new(&w.url, Duration::from_secs(w.timeout_secs))
                .map_err(|e| setup_err("webhook")(e.to_string()))?;
            pipeline = pipeline.with_notifier(Box::new(webhook));
        }
        Ok(pipeline)
    }
}

impl RefreshConfig {
    /// API key wins over username/password when both are present.
    pub fn auth(&self) -> Result<crate::collaborators::MetabaseAuth, ConfigError> {
        use crate::collaborators::MetabaseAuth;
        if let Some(key) = &self.api_key {
            return Ok(MetabaseAuth::ApiKey(key.clone()));
        }
        match (&self.username, &self.password) {
            (Some(username), Some(password)) => Ok(MetabaseAuth::Session {
                username: username.clone(),
                password: password.clone(),
            }),
            _ => Err(ConfigError::MissingSecret(format!(
                "{ENV_METABASE_API_KEY} or {ENV_METABASE_USER}/{ENV_METABASE_PASSWORD}"
            ))),
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}
