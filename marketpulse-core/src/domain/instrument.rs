//! Instruments and the ordered instrument list the pipeline walks each run.
//!
//! The canonical symbol is what storage keys and warehouse rows use. Some
//! providers cannot accept every canonical spelling (`BRK.B`), so an instrument
//! may carry a provider alias that is only used when building requests.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use thiserror::Error;

/// A tracked instrument.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instrument {
    pub symbol: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
}

impl Instrument {
    pub fn new(symbol: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            alias: None,
        }
    }

    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }

    /// Spelling sent to the provider.
    pub fn request_symbol(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.symbol)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum InstrumentError {
    #[error("empty instrument symbol")]
    EmptySymbol,

    #[error("duplicate instrument '{0}'")]
    Duplicate(String),

    #[error("alias defined for '{0}', which is not in the instrument list")]
    OrphanAlias(String),
}

/// Ordered, duplicate-free list of instruments. Order is the processing order.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct InstrumentList {
    instruments: Vec<Instrument>,
}

impl InstrumentList {
    /// Build from canonical symbols plus a static alias lookup.
    pub fn from_symbols(
        symbols: &[String],
        aliases: &BTreeMap<String, String>,
    ) -> Result<Self, InstrumentError> {
        let mut seen = HashSet::new();
        let mut instruments = Vec::with_capacity(symbols.len());

        for raw in symbols {
            let symbol = raw.trim();
            if symbol.is_empty() {
                return Err(InstrumentError::EmptySymbol);
            }
            if !seen.insert(symbol.to_string()) {
                return Err(InstrumentError::Duplicate(symbol.to_string()));
            }
            let mut instrument = Instrument::new(symbol);
            if let Some(alias) = aliases.get(symbol) {
                instrument = instrument.with_alias(alias.clone());
            }
            instruments.push(instrument);
        }

        if let Some(orphan) = aliases.keys().find(|k| !seen.contains(k.as_str())) {
            return Err(InstrumentError::OrphanAlias(orphan.clone()));
        }

        Ok(Self { instruments })
    }

    /// The ten large-cap US equities tracked by default.
    pub fn default_top10() -> Self {
        let instruments = [
            "AAPL", "MSFT", "GOOGL", "AMZN", "META", "TSLA", "NVDA", "BRK.B", "V", "JPM",
        ]
        .into_iter()
        .map(|s| match s {
            "BRK.B" => Instrument::new(s).with_alias("BRK-B"),
            _ => Instrument::new(s),
        })
        .collect();
        Self { instruments }
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Instrument> {
        self.instruments.iter()
    }

    pub fn len(&self) -> usize {
        self.instruments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instruments.is_empty()
    }

    pub fn get(&self, symbol: &str) -> Option<&Instrument> {
        self.instruments.iter().find(|i| i.symbol == symbol)
    }

    pub fn symbols(&self) -> Vec<&str> {
        self.instruments.iter().map(|i| i.symbol.as_str()).collect()
    }

    /// Keep only the named symbols, preserving list order.
    pub fn select(&self, symbols: &[String]) -> Self {
        Self {
            instruments: self
                .instruments
                .iter()
                .filter(|i| symbols.iter().any(|s| s == &i.symbol))
                .cloned()
                .collect(),
        }
    }
}

impl<'a> IntoIterator for &'a InstrumentList {
    type Item = &'a Instrument;
    type IntoIter = std::slice::Iter<'a, Instrument>;

    fn into_iter(self) -> Self::IntoIter {
        self.instruments.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn syms(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn request_symbol_prefers_alias() {
        let plain = Instrument::new("AAPL");
        let aliased = Instrument::new("BRK.B").with_alias("BRK-B");
        assert_eq!(plain.request_symbol(), "AAPL");
        assert_eq!(aliased.request_symbol(), "BRK-B");
        assert_eq!(aliased.symbol, "BRK.B");
    }

    #[test]
    fn default_list_is_ordered_and_aliased() {
        let list = InstrumentList::default_top10();
        assert_eq!(list.len(), 10);
        assert_eq!(list.symbols()[0], "AAPL");
        assert_eq!(list.symbols()[9], "JPM");
        assert_eq!(list.get("BRK.B").unwrap().request_symbol(), "BRK-B");
    }

    #[test]
    fn from_symbols_applies_aliases() {
        let mut aliases = BTreeMap::new();
        aliases.insert("BRK.B".to_string(), "BRK-B".to_string());
        let list = InstrumentList::from_symbols(&syms(&["AAPL", "BRK.B"]), &aliases).unwrap();
        assert_eq!(list.get("AAPL").unwrap().alias, None);
        assert_eq!(list.get("BRK.B").unwrap().alias.as_deref(), Some("BRK-B"));
    }

    #[test]
    fn duplicates_are_rejected() {
        let err = InstrumentList::from_symbols(&syms(&["AAPL", "AAPL"]), &BTreeMap::new())
            .unwrap_err();
        assert_eq!(err, InstrumentError::Duplicate("AAPL".into()));
    }

    #[test]
    fn blank_symbol_is_rejected() {
        let err =
            InstrumentList::from_symbols(&syms(&["AAPL", "  "]), &BTreeMap::new()).unwrap_err();
        assert_eq!(err, InstrumentError::EmptySymbol);
    }

    #[test]
    fn orphan_alias_is_rejected() {
        let mut aliases = BTreeMap::new();
        aliases.insert("BRK.B".to_string(), "BRK-B".to_string());
        let err = InstrumentList::from_symbols(&syms(&["AAPL"]), &aliases).unwrap_err();
        assert_eq!(err, InstrumentError::OrphanAlias("BRK.B".into()));
    }

    #[test]
    fn select_preserves_list_order() {
        let list = InstrumentList::default_top10();
        let picked = list.select(&syms(&["JPM", "AAPL"]));
        assert_eq!(picked.symbols(), vec!["AAPL", "JPM"]);
    }
}
