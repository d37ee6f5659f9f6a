//! Daily records and the per-instrument dataset persisted in object storage.
//!
//! The JSON form mirrors the provider's own layout (`Meta Data` plus a
//! date-keyed `Time Series (Daily)` block, numbers encoded as strings) so that
//! the stored blobs, the warehouse payload and the downstream models all read
//! the same shape.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One date's numeric market fields for one instrument.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DailyRecord {
    #[serde(rename = "1. open", with = "wire::price")]
    pub open: f64,
    #[serde(rename = "2. high", with = "wire::price")]
    pub high: f64,
    #[serde(rename = "3. low", with = "wire::price")]
    pub low: f64,
    #[serde(rename = "4. close", with = "wire::price")]
    pub close: f64,
    #[serde(rename = "5. volume", with = "wire::volume")]
    pub volume: u64,
}

/// Provider metadata block plus provenance written by the merger.
///
/// Unknown keys are kept in `extra` and written back untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DatasetMeta {
    #[serde(rename = "1. Information", default, skip_serializing_if = "Option::is_none")]
    pub information: Option<String>,
    #[serde(rename = "2. Symbol", default, skip_serializing_if = "Option::is_none")]
    pub symbol: Option<String>,
    #[serde(rename = "3. Last Refreshed", default, skip_serializing_if = "Option::is_none")]
    pub last_refreshed: Option<String>,
    #[serde(rename = "4. Output Size", default, skip_serializing_if = "Option::is_none")]
    pub output_size: Option<String>,
    #[serde(rename = "5. Time Zone", default, skip_serializing_if = "Option::is_none")]
    pub time_zone: Option<String>,
    /// Canonical symbol of the instrument this dataset belongs to.
    #[serde(rename = "Canonical Symbol", default, skip_serializing_if = "Option::is_none")]
    pub canonical_symbol: Option<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

/// Persisted unit of state per instrument: metadata plus date-keyed records.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InstrumentDataset {
    #[serde(rename = "Meta Data", default)]
    pub meta: DatasetMeta,
    #[serde(rename = "Time Series (Daily)", default)]
    pub series: BTreeMap<NaiveDate, DailyRecord>,
}

impl InstrumentDataset {
    pub fn new(meta: DatasetMeta, series: BTreeMap<NaiveDate, DailyRecord>) -> Self {
        Self { meta, series }
    }

    pub fn day_count(&self) -> usize {
        self.series.len()
    }

    pub fn first_date(&self) -> Option<NaiveDate> {
        self.series.keys().next().copied()
    }

    pub fn last_date(&self) -> Option<NaiveDate> {
        self.series.keys().next_back().copied()
    }

    /// Symbol used as the warehouse key.
    ///
    /// Prefers the canonical provenance key; datasets written before that key
    /// existed fall back to the provider-reported symbol.
    pub fn warehouse_symbol(&self) -> Option<&str> {
        self.meta
            .canonical_symbol
            .as_deref()
            .or(self.meta.symbol.as_deref())
            .filter(|s| !s.trim().is_empty())
    }

    pub fn to_json_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec_pretty(self)
    }

    pub fn from_json_slice(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

/// Provider numbers arrive as strings; accept numbers too and always write strings.
mod wire {
    use serde::Deserialize;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Int(u64),
        Float(f64),
        Text(String),
    }

    pub mod price {
        use super::Raw;
        use serde::{de::Error, Deserialize, Deserializer, Serializer};

        pub fn serialize<S: Serializer>(value: &f64, s: S) -> Result<S::Ok, S::Error> {
            s.serialize_str(&value.to_string())
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<f64, D::Error> {
            let value = match Raw::deserialize(d)? {
                Raw::Int(v) => v as f64,
                Raw::Float(v) => v,
                Raw::Text(t) => t
                    .trim()
                    .parse::<f64>()
                    .map_err(|e| D::Error::custom(format!("invalid price '{t}': {e}")))?,
            };
            if !value.is_finite() {
                return Err(D::Error::custom(format!("non-finite price {value}")));
            }
            Ok(value)
        }
    }

    pub mod volume {
        use super::Raw;
        use serde::{de::Error, Deserialize, Deserializer, Serializer};

        pub fn serialize<S: Serializer>(value: &u64, s: S) -> Result<S::Ok, S::Error> {
            s.serialize_str(&value.to_string())
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<u64, D::Error> {
            match Raw::deserialize(d)? {
                Raw::Int(v) => Ok(v),
                Raw::Float(v) if v.is_finite() && v >= 0.0 && v.fract() == 0.0 => Ok(v as u64),
                Raw::Float(v) => Err(D::Error::custom(format!("invalid volume {v}"))),
                Raw::Text(t) => t
                    .trim()
                    .parse::<u64>()
                    .map_err(|e| D::Error::custom(format!("invalid volume '{t}': {e}"))),
            }
        }
    }
}
