use crate::domain::market::slice::Slice;
use crate::domain::strategy::insight::Insight;
use crate::domain::strategy::target::PortfolioTarget;
use crate::domain::trading::order::Order;
use crate::domain::trading::portfolio::Portfolio;
use crate::domain::trading::types::OrderRequest;
use anyhow::Result;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PipelineStage {
    Alpha,
    PortfolioConstruction,
    RiskManagement,
    Execution,
}

impl fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Read-only view of the run handed to every pipeline stage.
#[derive(Debug, Clone)]
pub struct AlgorithmState<'a> {
    pub time: DateTime<Utc>,
    pub portfolio: &'a Portfolio,
    pub open_orders: Vec<&'a Order>,
    pub prices: &'a HashMap<String, Decimal>,
    pub universe: &'a [String],
    /// Fraction of equity kept back when sizing weight targets
    pub cash_buffer: Decimal,
}

impl AlgorithmState<'_> {
    pub fn price(&self, symbol: &str) -> Option<Decimal> {
        self.prices.get(symbol).copied()
    }

    pub fn equity(&self) -> Decimal {
        self.portfolio.total_equity(self.prices)
    }

    pub fn investable_equity(&self) -> Decimal {
        self.equity() * (Decimal::ONE - self.cash_buffer)
    }

    pub fn holding(&self, symbol: &str) -> Decimal {
        self.portfolio.quantity(symbol)
    }

    /// Unfilled quantity of open orders for a symbol.
    pub fn open_quantity(&self, symbol: &str) -> Decimal {
        self.open_orders
            .iter()
            .filter(|o| o.symbol == symbol)
            .map(|o| o.remaining_quantity())
            .sum()
    }
}

pub trait AlphaModel: Send {
    fn name(&self) -> &str;

    fn update(&mut self, slice: &Slice, state: &AlgorithmState<'_>) -> Result<Vec<Insight>>;
}

pub trait PortfolioConstructionModel: Send {
    /// `insights` holds exactly one merged insight per symbol.
    fn create_targets(
        &mut self,
        insights: &[Insight],
        state: &AlgorithmState<'_>,
    ) -> Result<Vec<PortfolioTarget>>;
}

pub trait RiskManagementModel: Send {
    /// May only shrink or drop targets.
    fn manage_risk(
        &mut self,
        targets: &[PortfolioTarget],
        state: &AlgorithmState<'_>,
    ) -> Result<Vec<PortfolioTarget>>;
}

pub trait ExecutionModel: Send {
    fn execute(
        &mut self,
        targets: &[PortfolioTarget],
        state: &AlgorithmState<'_>,
    ) -> Result<Vec<OrderRequest>>;
}
