use crate::domain::market::data_point::{Bar, DataPoint, SubscriptionId};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};

/// Output of one synchronizer advance: every point that belongs to the frontier time.
#[derive(Debug, Clone, PartialEq)]
pub struct FrontierBatch {
    pub time: DateTime<Utc>,
    pub points: BTreeMap<SubscriptionId, Vec<DataPoint>>,
}

impl FrontierBatch {
    pub fn new(time: DateTime<Utc>) -> Self {
        Self {
            time,
            points: BTreeMap::new(),
        }
    }

    pub fn push(&mut self, point: DataPoint) {
        self.points
            .entry(point.subscription_id)
            .or_default()
            .push(point);
    }

    pub fn is_empty(&self) -> bool {
        self.points.values().all(|points| points.is_empty())
    }

    pub fn len(&self) -> usize {
        self.points.values().map(Vec::len).sum()
    }
}

/// Immutable snapshot of all data valid at one synchronized time.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Slice {
    time: DateTime<Utc>,
    data: BTreeMap<SubscriptionId, Vec<DataPoint>>,
}

impl Slice {
    pub fn new(time: DateTime<Utc>, data: BTreeMap<SubscriptionId, Vec<DataPoint>>) -> Self {
        Self { time, data }
    }

    pub fn time(&self) -> DateTime<Utc> {
        self.time
    }

    pub fn get(&self, subscription: SubscriptionId) -> &[DataPoint] {
        self.data
            .get(&subscription)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn subscriptions(&self) -> impl Iterator<Item = SubscriptionId> + '_ {
        self.data.keys().copied()
    }

    /// All points in subscription order.
    pub fn points(&self) -> impl Iterator<Item = &DataPoint> {
        self.data.values().flatten()
    }

    pub fn points_for<'a>(&'a self, symbol: &'a str) -> impl Iterator<Item = &'a DataPoint> + 'a {
        self.points().filter(move |p| p.symbol == symbol)
    }

    /// Latest price observed for a symbol in this slice.
    ///
    /// Real points win over fill-forward copies; among equals the latest end time,
    /// then the highest subscription id, wins.
    pub fn price(&self, symbol: &str) -> Option<Decimal> {
        self.points_for(symbol)
            .max_by(|a, b| {
                (!a.is_fill_forward, a.end_time, a.subscription_id).cmp(&(
                    !b.is_fill_forward,
                    b.end_time,
                    b.subscription_id,
                ))
            })
            .map(DataPoint::price)
    }

    pub fn symbols(&self) -> BTreeSet<&str> {
        self.points().map(|p| p.symbol.as_str()).collect()
    }

    pub fn contains(&self, symbol: &str) -> bool {
        self.points().any(|p| p.symbol == symbol)
    }

    /// Bars for a symbol, in subscription order.
    pub fn bars<'a>(&'a self, symbol: &'a str) -> impl Iterator<Item = &'a Bar> + 'a {
        self.points_for(symbol).filter_map(DataPoint::as_bar)
    }

    pub fn has_out_of_order(&self) -> bool {
        self.points().any(|p| p.is_out_of_order)
    }

    pub fn len(&self) -> usize {
        self.data.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl From<FrontierBatch> for Slice {
    fn from(batch: FrontierBatch) -> Self {
        Slice::new(batch.time, batch.points)
    }
}
