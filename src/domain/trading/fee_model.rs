use rust_decimal::Decimal;
use std::fmt::Debug;

pub trait FeeModel: Debug + Send + Sync {
    /// Fee charged for filling `quantity` (absolute) at `price`
    fn fee(&self, quantity: Decimal, price: Decimal) -> Decimal;

    /// Get description of the fee model
    fn description(&self) -> String;
}

/// Per-share commission with a per-fill minimum.
#[derive(Debug, Clone)]
pub struct ConstantFeeModel {
    pub commission_per_share: Decimal,
    pub minimum_per_order: Decimal,
}

impl ConstantFeeModel {
    pub fn new(commission_per_share: Decimal, minimum_per_order: Decimal) -> Self {
        Self {
            commission_per_share,
            minimum_per_order,
        }
    }

    pub fn zero() -> Self {
        Self::new(Decimal::ZERO, Decimal::ZERO)
    }
}

impl FeeModel for ConstantFeeModel {
    fn fee(&self, quantity: Decimal, _price: Decimal) -> Decimal {
        if quantity.is_zero() {
            return Decimal::ZERO;
        }
        (quantity.abs() * self.commission_per_share).max(self.minimum_per_order)
    }

    fn description(&self) -> String {
        format!(
            "Constant Fee Model (Com/share: {}, Min: {})",
            self.commission_per_share, self.minimum_per_order
        )
    }
}

/// Fee proportional to traded notional.
#[derive(Debug, Clone)]
pub struct PercentageFeeModel {
    pub rate: Decimal,
}

impl PercentageFeeModel {
    pub fn new(rate: Decimal) -> Self {
        Self { rate }
    }
}

impl FeeModel for PercentageFeeModel {
    fn fee(&self, quantity: Decimal, price: Decimal) -> Decimal {
        quantity.abs() * price * self.rate
    }

    fn description(&self) -> String {
        format!(
            "Percentage Fee Model ({:.3}%)",
            self.rate * Decimal::ONE_HUNDRED
        )
    }
}
