use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum TargetAmount {
    /// Absolute signed holding
    Quantity(Decimal),
    /// Signed fraction of portfolio equity
    Weight(Decimal),
}

/// Desired holding for one symbol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortfolioTarget {
    pub symbol: String,
    pub amount: TargetAmount,
}

impl PortfolioTarget {
    pub fn quantity(symbol: impl Into<String>, quantity: Decimal) -> Self {
        Self {
            symbol: symbol.into(),
            amount: TargetAmount::Quantity(quantity),
        }
    }

    pub fn weight(symbol: impl Into<String>, weight: Decimal) -> Self {
        Self {
            symbol: symbol.into(),
            amount: TargetAmount::Weight(weight),
        }
    }

    /// Resolves the target to a whole-unit signed quantity, truncating toward zero.
    ///
    /// Weights are sized against `investable_equity`; `None` when the price is unknown.
    pub fn resolve_quantity(&self, price: Option<Decimal>, investable_equity: Decimal) -> Option<Decimal> {
        match self.amount {
            TargetAmount::Quantity(quantity) => Some(quantity),
            TargetAmount::Weight(weight) => {
                let price = price.filter(|p| *p > Decimal::ZERO)?;
                Some((weight * investable_equity / price).trunc())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_weight_resolution_truncates_toward_zero() {
        let long = PortfolioTarget::weight("SPY", dec!(0.5));
        assert_eq!(long.resolve_quantity(Some(dec!(30)), dec!(1000)), Some(dec!(16)));

        let short = PortfolioTarget::weight("SPY", dec!(-0.5));
        assert_eq!(short.resolve_quantity(Some(dec!(30)), dec!(1000)), Some(dec!(-16)));
    }

    #[test]
    fn test_weight_without_price_is_unresolved() {
        let target = PortfolioTarget::weight("SPY", dec!(1));
        assert_eq!(target.resolve_quantity(None, dec!(1000)), None);
        assert_eq!(target.resolve_quantity(Some(Decimal::ZERO), dec!(1000)), None);
    }

    #[test]
    fn test_quantity_passes_through() {
        let target = PortfolioTarget::quantity("SPY", dec!(-7));
        assert_eq!(target.resolve_quantity(None, Decimal::ZERO), Some(dec!(-7)));
    }
}
