//! Results sinks.
//!
//! The engine only writes to a sink; reading back is for tests and end-of-run reporting.

use crate::domain::ports::ResultsSink;
use crate::domain::trading::types::{EquityPoint, TradeRecord};
use anyhow::{Context, Result};
use serde::Serialize;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::Mutex;
use tracing::warn;

/// Keeps the equity curve and trade list in memory.
#[derive(Default)]
pub struct InMemoryResultsSink {
    equity: Mutex<Vec<EquityPoint>>,
    trades: Mutex<Vec<TradeRecord>>,
}

impl InMemoryResultsSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn equity_curve(&self) -> Vec<EquityPoint> {
        self.equity.lock().map(|e| e.clone()).unwrap_or_default()
    }

    pub fn trades(&self) -> Vec<TradeRecord> {
        self.trades.lock().map(|t| t.clone()).unwrap_or_default()
    }
}

impl ResultsSink for InMemoryResultsSink {
    fn record_equity(&self, point: EquityPoint) {
        if let Ok(mut equity) = self.equity.lock() {
            equity.push(point);
        }
    }

    fn record_trade(&self, trade: TradeRecord) {
        if let Ok(mut trades) = self.trades.lock() {
            trades.push(trade);
        }
    }
}

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ResultLine<'a> {
    Equity(&'a EquityPoint),
    Trade(&'a TradeRecord),
}

/// Appends one JSON object per line to a file.
pub struct JsonLinesResultsSink {
    writer: Mutex<BufWriter<File>>,
}

impl JsonLinesResultsSink {
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = File::create(path)
            .with_context(|| format!("Failed to create results file {}", path.display()))?;
        Ok(Self {
            writer: Mutex::new(BufWriter::new(file)),
        })
    }

    fn write_line(&self, line: &ResultLine<'_>) {
        let Ok(mut writer) = self.writer.lock() else {
            return;
        };
        let written = serde_json::to_writer(&mut *writer, line)
            .map_err(anyhow::Error::from)
            .and_then(|_| writer.write_all(b"\n").map_err(anyhow::Error::from));
        if let Err(e) = written {
            warn!("JsonLinesResultsSink: write failed: {}", e);
        }
    }
}

impl ResultsSink for JsonLinesResultsSink {
    fn record_equity(&self, point: EquityPoint) {
        self.write_line(&ResultLine::Equity(&point));
    }

    fn record_trade(&self, trade: TradeRecord) {
        self.write_line(&ResultLine::Trade(&trade));
    }

    fn flush(&self) -> Result<()> {
        let mut writer = self
            .writer
            .lock()
            .map_err(|_| anyhow::anyhow!("results writer lock poisoned"))?;
        writer.flush().context("Failed to flush results file")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::trading::types::OrderId;
    use chrono::{TimeZone, Utc};
    use rust_decimal_macros::dec;

    #[test]
    fn test_in_memory_sink_records_in_order() {
        let sink = InMemoryResultsSink::new();
        let t = Utc.with_ymd_and_hms(2024, 1, 2, 21, 0, 0).unwrap();
        sink.record_equity(EquityPoint {
            time: t,
            cash: dec!(100),
            equity: dec!(100),
        });
        sink.record_trade(TradeRecord {
            order_id: OrderId(1),
            symbol: "SPY".to_string(),
            quantity: dec!(1),
            price: dec!(50),
            fee: dec!(0),
            time: t,
        });
        assert_eq!(sink.equity_curve().len(), 1);
        assert_eq!(sink.trades()[0].price, dec!(50));
        assert!(sink.flush().is_ok());
    }

    #[test]
    fn test_json_lines_sink_writes_tagged_lines() {
        let path = std::env::temp_dir().join(format!("synctrade-results-{}.jsonl", uuid::Uuid::new_v4()));
        let sink = JsonLinesResultsSink::create(&path).unwrap();
        sink.record_equity(EquityPoint {
            time: Utc.with_ymd_and_hms(2024, 1, 2, 21, 0, 0).unwrap(),
            cash: dec!(10),
            equity: dec!(12),
        });
        sink.flush().unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        let line: serde_json::Value = serde_json::from_str(content.lines().next().unwrap()).unwrap();
        assert_eq!(line["type"], "equity");
        let _ = std::fs::remove_file(path);
    }
}
