use crate::domain::strategy::insight::{Insight, InsightDirection};
use crate::domain::strategy::models::{AlgorithmState, PortfolioConstructionModel};
use crate::domain::strategy::target::PortfolioTarget;
use anyhow::Result;
use rust_decimal::Decimal;

/// Splits equity evenly across every symbol with a directional insight.
///
/// Up → +1/n, Down → −1/n (0 when long-only), Flat → 0, where n counts the
/// Up and Down insights.
#[derive(Debug, Clone, Default)]
pub struct EqualWeightingPortfolioConstruction {
    long_only: bool,
}

impl EqualWeightingPortfolioConstruction {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn long_only() -> Self {
        Self { long_only: true }
    }
}

impl PortfolioConstructionModel for EqualWeightingPortfolioConstruction {
    fn create_targets(
        &mut self,
        insights: &[Insight],
        _state: &AlgorithmState<'_>,
    ) -> Result<Vec<PortfolioTarget>> {
        let directional = insights
            .iter()
            .filter(|i| match i.direction {
                InsightDirection::Up => true,
                InsightDirection::Down => !self.long_only,
                InsightDirection::Flat => false,
            })
            .count();
        let share = if directional == 0 {
            Decimal::ZERO
        } else {
            Decimal::ONE / Decimal::from(directional)
        };

        Ok(insights
            .iter()
            .map(|insight| {
                let weight = match insight.direction {
                    InsightDirection::Up => share,
                    InsightDirection::Down if !self.long_only => -share,
                    _ => Decimal::ZERO,
                };
                PortfolioTarget::weight(insight.symbol.clone(), weight)
            })
            .collect())
    }
}
