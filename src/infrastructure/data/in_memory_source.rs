use crate::domain::market::data_point::MarketRecord;
use crate::domain::market::resolution::Resolution;
use crate::domain::market::subscription::DataKind;
use crate::domain::ports::{DataSource, HistoryRequest};
use anyhow::{Result, bail};
use std::collections::HashMap;
use std::sync::RwLock;
use tracing::debug;

type SeriesKey = (String, Resolution, DataKind);

/// Historical records held in memory, one ordered series per (symbol, resolution, kind).
#[derive(Default)]
pub struct InMemoryDataSource {
    series: RwLock<HashMap<SeriesKey, Vec<MarketRecord>>>,
}

impl InMemoryDataSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder form of [`insert`](Self::insert).
    pub fn with_series(
        self,
        symbol: &str,
        resolution: Resolution,
        kind: DataKind,
        records: Vec<MarketRecord>,
    ) -> Self {
        self.insert(symbol, resolution, kind, records);
        self
    }

    /// Replaces the series for the key. Records are kept in the given order.
    pub fn insert(&self, symbol: &str, resolution: Resolution, kind: DataKind, records: Vec<MarketRecord>) {
        if let Ok(mut series) = self.series.write() {
            series.insert((symbol.to_string(), resolution, kind), records);
        }
    }
}

impl DataSource for InMemoryDataSource {
    fn fetch(&self, request: &HistoryRequest) -> Result<Box<dyn Iterator<Item = MarketRecord> + Send>> {
        let Ok(series) = self.series.read() else {
            bail!("InMemoryDataSource: series lock poisoned");
        };
        let key = (request.symbol.clone(), request.resolution, request.kind);
        let records: Vec<MarketRecord> = series
            .get(&key)
            .map(|records| {
                records
                    .iter()
                    .filter(|r| request.contains(r))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        debug!(
            "InMemoryDataSource: {} {} {} -> {} records",
            request.symbol,
            request.resolution,
            request.kind,
            records.len()
        );
        Ok(Box::new(records.into_iter()))
    }
}
