use crate::domain::market::slice::Slice;
use crate::domain::strategy::insight::Insight;
use crate::domain::strategy::models::{AlgorithmState, AlphaModel};
use anyhow::{Context, Result};
use chrono::Duration;
use rust_decimal::prelude::ToPrimitive;
use std::collections::HashMap;
use ta::Next;
use ta::indicators::SimpleMovingAverage;
use tracing::debug;

struct SymbolState {
    fast: SimpleMovingAverage,
    slow: SimpleMovingAverage,
    samples: usize,
    fast_above: Option<bool>,
}

/// Dual simple moving average crossover.
///
/// Emits Up when the fast average crosses above the slow one and Flat when it
/// crosses back below. The first sample after warm-up only records which side the
/// fast average is on.
pub struct SmaCrossAlpha {
    fast_period: usize,
    slow_period: usize,
    insight_period: Duration,
    symbols: HashMap<String, SymbolState>,
}

impl SmaCrossAlpha {
    pub fn new(fast_period: usize, slow_period: usize) -> Result<Self> {
        if fast_period == 0 || fast_period >= slow_period {
            anyhow::bail!(
                "Invalid SMA periods: fast {} must be positive and below slow {}",
                fast_period,
                slow_period
            );
        }
        Ok(Self {
            fast_period,
            slow_period,
            insight_period: Duration::days(365),
            symbols: HashMap::new(),
        })
    }

    pub fn with_insight_period(mut self, period: Duration) -> Self {
        self.insight_period = period;
        self
    }

    fn state_for(&mut self, symbol: &str) -> Result<&mut SymbolState> {
        if !self.symbols.contains_key(symbol) {
            let state = SymbolState {
                fast: SimpleMovingAverage::new(self.fast_period)
                    .map_err(|e| anyhow::anyhow!("Invalid fast SMA period: {:?}", e))?,
                slow: SimpleMovingAverage::new(self.slow_period)
                    .map_err(|e| anyhow::anyhow!("Invalid slow SMA period: {:?}", e))?,
                samples: 0,
                fast_above: None,
            };
            self.symbols.insert(symbol.to_string(), state);
        }
        self.symbols
            .get_mut(symbol)
            .context("SMA state missing after insert")
    }
}

impl AlphaModel for SmaCrossAlpha {
    fn name(&self) -> &str {
        "SmaCross"
    }

    fn update(&mut self, slice: &Slice, state: &AlgorithmState<'_>) -> Result<Vec<Insight>> {
        let mut insights = Vec::new();
        for symbol in state.universe {
            let has_real_data = slice.points_for(symbol).any(|p| !p.is_fill_forward);
            if !has_real_data {
                continue;
            }
            let Some(price) = slice.price(symbol).and_then(|p| p.to_f64()) else {
                continue;
            };

            let slow_period = self.slow_period;
            let insight_period = self.insight_period;
            let sma = self.state_for(symbol)?;
            let fast = sma.fast.next(price);
            let slow = sma.slow.next(price);
            sma.samples += 1;
            if sma.samples < slow_period {
                continue;
            }

            let above = fast > slow;
            let previous = sma.fast_above.replace(above);
            match previous {
                Some(false) if above => {
                    debug!(
                        "SmaCross [{}]: Golden Cross (fast={:.2}, slow={:.2})",
                        symbol, fast, slow
                    );
                    insights.push(Insight::up(symbol.clone(), insight_period, slice.time()));
                }
                Some(true) if !above => {
                    debug!(
                        "SmaCross [{}]: Death Cross (fast={:.2}, slow={:.2})",
                        symbol, fast, slow
                    );
                    insights.push(Insight::flat(symbol.clone(), insight_period, slice.time()));
                }
                _ => {}
            }
        }
        Ok(insights)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::market::data_point::{DataPoint, MarketValue, SubscriptionId, Tick};
    use crate::domain::strategy::insight::InsightDirection;
    use crate::domain::trading::portfolio::Portfolio;
    use chrono::{DateTime, TimeZone, Utc};
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;
    use std::collections::BTreeMap;

    fn slice(day: i64, price: Decimal) -> Slice {
        let time: DateTime<Utc> = Utc.with_ymd_and_hms(2024, 1, 1, 21, 0, 0).unwrap() + Duration::days(day);
        let mut data = BTreeMap::new();
        data.insert(
            SubscriptionId(0),
            vec![DataPoint {
                subscription_id: SubscriptionId(0),
                symbol: "SPY".to_string(),
                time,
                end_time: time,
                value: MarketValue::Tick(Tick {
                    price,
                    size: dec!(1),
                }),
                is_fill_forward: false,
                is_out_of_order: false,
            }],
        );
        Slice::new(time, data)
    }

    fn feed(alpha: &mut SmaCrossAlpha, prices: &[Decimal]) -> Vec<(usize, Insight)> {
        let portfolio = Portfolio::new(dec!(1000));
        let prices_map = HashMap::new();
        let universe = vec!["SPY".to_string()];
        let mut out = Vec::new();
        for (i, price) in prices.iter().enumerate() {
            let s = slice(i as i64, *price);
            let state = AlgorithmState {
                time: s.time(),
                portfolio: &portfolio,
                open_orders: Vec::new(),
                prices: &prices_map,
                universe: &universe,
                cash_buffer: Decimal::ZERO,
            };
            for insight in alpha.update(&s, &state).unwrap() {
                out.push((i, insight));
            }
        }
        out
    }

    #[test]
    fn test_rejects_inverted_periods() {
        assert!(SmaCrossAlpha::new(5, 3).is_err());
        assert!(SmaCrossAlpha::new(0, 3).is_err());
    }

    #[test]
    fn test_golden_then_death_cross() {
        let mut alpha = SmaCrossAlpha::new(2, 3).unwrap();
        let prices = [
            dec!(10),
            dec!(9),
            dec!(8), // ready, fast below slow
            dec!(12), // cross up
            dec!(13),
            dec!(5), // cross down
        ];

        let insights = feed(&mut alpha, &prices);
        assert_eq!(insights.len(), 2);
        assert_eq!(insights[0].0, 3);
        assert_eq!(insights[0].1.direction, InsightDirection::Up);
        assert_eq!(insights[1].0, 5);
        assert_eq!(insights[1].1.direction, InsightDirection::Flat);
    }
}
