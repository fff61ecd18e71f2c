use crate::domain::trading::types::OrderSide;
use rust_decimal::Decimal;
use std::fmt::Debug;

/// Adjusts the reference price of a simulated fill.
pub trait SlippageModel: Debug + Send + Sync {
    fn execution_price(&self, price: Decimal, quantity: Decimal, side: OrderSide) -> Decimal;
}

/// Fills exactly at the reference price.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoSlippage;

impl SlippageModel for NoSlippage {
    fn execution_price(&self, price: Decimal, _quantity: Decimal, _side: OrderSide) -> Decimal {
        price
    }
}

/// Constant adverse move in basis points: buys pay more, sells receive less.
#[derive(Debug, Clone, Copy)]
pub struct FixedBpsSlippage {
    bps: Decimal,
}

impl FixedBpsSlippage {
    pub fn new(bps: Decimal) -> Self {
        Self { bps: bps.abs() }
    }
}

impl SlippageModel for FixedBpsSlippage {
    fn execution_price(&self, price: Decimal, _quantity: Decimal, side: OrderSide) -> Decimal {
        let factor = self.bps / Decimal::from(10_000);
        let adjusted = match side {
            OrderSide::Buy => price * (Decimal::ONE + factor),
            OrderSide::Sell => price * (Decimal::ONE - factor),
        };
        adjusted.round_dp(4)
    }
}
