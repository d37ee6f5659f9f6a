//! Alpha Vantage daily series provider.
//!
//! Fetches the full `TIME_SERIES_DAILY` history for one symbol per call.
//! The provider answers HTTP 200 for most soft failures, so the body is
//! inspected to tell a real series from a throttling note or an error message.
//! Neither is retried here; the caller skips the instrument for this run.

use super::provider::{DataError, DataProvider, FetchResult};
use crate::domain::{DailyRecord, DatasetMeta, Instrument, InstrumentDataset};
use chrono::NaiveDate;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, info, warn};

pub const DEFAULT_BASE_URL: &str = "https://www.alphavantage.co/query";
const PROVIDER_NAME: &str = "alpha_vantage";

/// `TIME_SERIES_DAILY` response. Only one of the blocks is normally present.
#[derive(Debug, Deserialize)]
struct DailyResponse {
    #[serde(rename = "Meta Data")]
    meta: Option<DatasetMeta>,
    #[serde(rename = "Time Series (Daily)")]
    series: Option<BTreeMap<NaiveDate, DailyRecord>>,
    #[serde(rename = "Error Message")]
    error_message: Option<String>,
    #[serde(rename = "Note")]
    note: Option<String>,
    #[serde(rename = "Information")]
    information: Option<String>,
}

/// Alpha Vantage data provider.
pub struct AlphaVantageProvider {
    client: reqwest::blocking::Client,
    base_url: String,
    api_key: String,
}

impl AlphaVantageProvider {
    pub fn new(
        api_key: impl Into<String>,
        base_url: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, DataError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| DataError::Transport {
                symbol: String::new(),
                message: format!("failed to build HTTP client: {e}"),
            })?;

        Ok(Self {
            client,
            base_url: base_url.into(),
            api_key: api_key.into(),
        })
    }

    /// Turn a response body into a dataset, or classify why there is none.
    fn parse_response(symbol: &str, body: &[u8]) -> Result<InstrumentDataset, DataError> {
        let resp: DailyResponse =
            serde_json::from_slice(body).map_err(|e| DataError::Malformed {
                symbol: symbol.to_string(),
                message: e.to_string(),
            })?;

        if let Some(series) = resp.series {
            return Ok(InstrumentDataset::new(resp.meta.unwrap_or_default(), series));
        }

        if let Some(message) = resp.error_message {
            return Err(DataError::ProviderRejected {
                symbol: symbol.to_string(),
                message,
            });
        }

        // Throttling arrives as either a Note or an Information block
        if let Some(message) = resp.note.or(resp.information) {
            return Err(DataError::RateLimited {
                symbol: symbol.to_string(),
                message,
            });
        }

        Err(DataError::MissingSeries {
            symbol: symbol.to_string(),
        })
    }
}

impl DataProvider for AlphaVantageProvider {
    fn name(&self) -> &str {
        PROVIDER_NAME
    }

    fn fetch(&self, instrument: &Instrument) -> Result<FetchResult, DataError> {
        let request_symbol = instrument.request_symbol();
        debug!(symbol = %instrument.symbol, request_symbol, "requesting full daily series");

        let resp = self
            .client
            .get(&self.base_url)
            .query(&[
                ("function", "TIME_SERIES_DAILY"),
                ("symbol", request_symbol),
                ("outputsize", "full"),
                ("apikey", self.api_key.as_str()),
            ])
            .send()
            // the request URL carries the API key
            .map_err(|e| DataError::Transport {
                symbol: instrument.symbol.clone(),
                message: e.without_url().to_string(),
            })?;

        let status = resp.status();
        if !status.is_success() {
            warn!(symbol = %instrument.symbol, status = status.as_u16(), "provider returned non-success status");
            return Err(DataError::Http {
                symbol: instrument.symbol.clone(),
                status: status.as_u16(),
            });
        }

        let body = resp.bytes().map_err(|e| DataError::Transport {
            symbol: instrument.symbol.clone(),
            message: e.without_url().to_string(),
        })?;

        let dataset = Self::parse_response(&instrument.symbol, &body)?;
        info!(symbol = %instrument.symbol, days = dataset.day_count(), "retrieved daily series");

        Ok(FetchResult {
            symbol: instrument.symbol.clone(),
            request_symbol: request_symbol.to_string(),
            dataset,
            source: PROVIDER_NAME.to_string(),
        })
    }
}
