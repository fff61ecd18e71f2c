use crate::domain::market::slice::Slice;
use crate::domain::trading::order::Order;
use crate::domain::trading::portfolio::Portfolio;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;

/// State captured when a run halts on a fault.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DiagnosticSnapshot {
    pub time: Option<DateTime<Utc>>,
    pub recent_slices: Vec<Slice>,
    pub open_orders: Vec<Order>,
    pub portfolio: Portfolio,
}

impl DiagnosticSnapshot {
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| format!("{{\"error\":\"{}\"}}", e))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RunSummary {
    pub slices: u64,
    pub data_points: u64,
    pub fill_forward_points: u64,
    pub out_of_order_points: u64,
    pub orders_submitted: u64,
    pub fills: u64,
    pub dropped_broker_events: u64,
    pub discarded_data_points: u64,
    pub final_cash: Decimal,
    pub final_equity: Decimal,
    pub realized_pnl: Decimal,
    pub halted_reason: Option<String>,
}
