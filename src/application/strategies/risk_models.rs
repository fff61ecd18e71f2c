use crate::domain::strategy::models::{AlgorithmState, RiskManagementModel};
use crate::domain::strategy::target::{PortfolioTarget, TargetAmount};
use anyhow::Result;
use rust_decimal::Decimal;
use tracing::debug;

/// Passes targets through unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullRiskManagement;

impl RiskManagementModel for NullRiskManagement {
    fn manage_risk(
        &mut self,
        targets: &[PortfolioTarget],
        _state: &AlgorithmState<'_>,
    ) -> Result<Vec<PortfolioTarget>> {
        Ok(targets.to_vec())
    }
}

/// Caps each target at a fraction of portfolio equity.
#[derive(Debug, Clone, Copy)]
pub struct MaximumPositionSizeRisk {
    max_fraction: Decimal,
}

impl MaximumPositionSizeRisk {
    pub fn new(max_fraction: Decimal) -> Result<Self> {
        if max_fraction <= Decimal::ZERO || max_fraction > Decimal::ONE {
            anyhow::bail!("Maximum position fraction must be in (0, 1], got {}", max_fraction);
        }
        Ok(Self { max_fraction })
    }

    fn clamp(value: Decimal, limit: Decimal) -> Decimal {
        if value.abs() <= limit {
            value
        } else if value.is_sign_negative() {
            -limit
        } else {
            limit
        }
    }
}

impl RiskManagementModel for MaximumPositionSizeRisk {
    fn manage_risk(
        &mut self,
        targets: &[PortfolioTarget],
        state: &AlgorithmState<'_>,
    ) -> Result<Vec<PortfolioTarget>> {
        let equity = state.equity();
        Ok(targets
            .iter()
            .map(|target| {
                let amount = match target.amount {
                    TargetAmount::Weight(w) => TargetAmount::Weight(Self::clamp(w, self.max_fraction)),
                    TargetAmount::Quantity(q) => match state.price(&target.symbol) {
                        Some(price) if price > Decimal::ZERO => {
                            let limit = (equity * self.max_fraction / price).trunc();
                            TargetAmount::Quantity(Self::clamp(q, limit))
                        }
                        _ => TargetAmount::Quantity(q),
                    },
                };
                if amount != target.amount {
                    debug!(
                        "MaximumPositionSizeRisk: {} capped {:?} -> {:?}",
                        target.symbol, target.amount, amount
                    );
                }
                PortfolioTarget {
                    symbol: target.symbol.clone(),
                    amount,
                }
            })
            .collect())
    }
}
