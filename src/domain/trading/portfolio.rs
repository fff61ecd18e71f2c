use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Portfolio {
    pub cash: Decimal,
    pub starting_cash: Decimal,
    pub holdings: BTreeMap<String, Holding>,
    pub realized_pnl: Decimal,
    pub total_fees: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Holding {
    pub symbol: String,
    /// Signed; negative for short positions
    pub quantity: Decimal,
    pub average_price: Decimal,
}

/// Result of applying one fill, computed before anything is mutated.
#[derive(Debug, Clone, PartialEq)]
pub struct FillImpact {
    pub symbol: String,
    pub cash_after: Decimal,
    pub holding_after: Holding,
    pub realized: Decimal,
    pub fee: Decimal,
}

impl Portfolio {
    pub fn new(starting_cash: Decimal) -> Self {
        Self {
            cash: starting_cash,
            starting_cash,
            holdings: BTreeMap::new(),
            realized_pnl: Decimal::ZERO,
            total_fees: Decimal::ZERO,
        }
    }

    pub fn quantity(&self, symbol: &str) -> Decimal {
        self.holdings
            .get(symbol)
            .map(|h| h.quantity)
            .unwrap_or(Decimal::ZERO)
    }

    pub fn is_invested(&self) -> bool {
        self.holdings.values().any(|h| !h.quantity.is_zero())
    }

    /// Calculate total equity (cash + position value)
    pub fn total_equity(&self, current_prices: &HashMap<String, Decimal>) -> Decimal {
        let mut equity = self.cash;

        for (symbol, holding) in &self.holdings {
            if let Some(&current_price) = current_prices.get(symbol) {
                equity += holding.quantity * current_price;
            } else {
                // If no current price available, use average price (conservative)
                equity += holding.quantity * holding.average_price;
            }
        }

        equity
    }

    /// Calculate unrealized P&L for all holdings
    pub fn unrealized_pnl(&self, current_prices: &HashMap<String, Decimal>) -> Decimal {
        let mut unrealized = Decimal::ZERO;

        for (symbol, holding) in &self.holdings {
            if let Some(&current_price) = current_prices.get(symbol) {
                unrealized += holding.quantity * (current_price - holding.average_price);
            }
        }

        unrealized
    }

    /// Computes the effect of a signed fill on cash, holding and realized P&L.
    pub fn preview_fill(
        &self,
        symbol: &str,
        quantity: Decimal,
        price: Decimal,
        fee: Decimal,
    ) -> FillImpact {
        let (held, average) = self
            .holdings
            .get(symbol)
            .map(|h| (h.quantity, h.average_price))
            .unwrap_or((Decimal::ZERO, Decimal::ZERO));

        let new_quantity = held + quantity;
        let mut realized = Decimal::ZERO;

        let new_average = if new_quantity.is_zero() && held.is_zero() {
            Decimal::ZERO
        } else if held.is_zero() || held.is_sign_negative() == quantity.is_sign_negative() {
            // Opening or adding: weighted average cost
            (held * average + quantity * price) / new_quantity
        } else {
            let closed = quantity.abs().min(held.abs());
            realized = if held.is_sign_positive() {
                closed * (price - average)
            } else {
                closed * (average - price)
            };
            if new_quantity.is_zero() {
                Decimal::ZERO
            } else if new_quantity.is_sign_negative() == held.is_sign_negative() {
                average
            } else {
                // Position flipped through zero
                price
            }
        };

        FillImpact {
            symbol: symbol.to_string(),
            cash_after: self.cash - quantity * price - fee,
            holding_after: Holding {
                symbol: symbol.to_string(),
                quantity: new_quantity,
                average_price: new_average,
            },
            realized,
            fee,
        }
    }

    pub fn commit(&mut self, impact: FillImpact) {
        self.cash = impact.cash_after;
        self.realized_pnl += impact.realized;
        self.total_fees += impact.fee;
        if impact.holding_after.quantity.is_zero() {
            self.holdings.remove(&impact.symbol);
        } else {
            self.holdings.insert(impact.symbol, impact.holding_after);
        }
    }
}

impl Default for Portfolio {
    fn default() -> Self {
        Self::new(Decimal::ZERO)
    }
}
