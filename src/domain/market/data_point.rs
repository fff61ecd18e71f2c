use chrono::{DateTime, NaiveDateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier assigned by the subscription registry in registration order.
///
/// Ordering of ids is the tie-break used wherever the engine needs a total order
/// over subscriptions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SubscriptionId(pub u32);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tick {
    pub price: Decimal,
    pub size: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Quote {
    pub bid: Decimal,
    pub ask: Decimal,
    pub bid_size: Decimal,
    pub ask_size: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MarketValue {
    Bar(Bar),
    Tick(Tick),
    Quote(Quote),
}

impl MarketValue {
    /// Reference price: bar close, trade price or quote mid.
    pub fn price(&self) -> Decimal {
        match self {
            MarketValue::Bar(bar) => bar.close,
            MarketValue::Tick(tick) => tick.price,
            MarketValue::Quote(quote) => (quote.bid + quote.ask) / Decimal::TWO,
        }
    }
}

/// Raw record produced by a data source, timestamped in the data's own time zone.
#[derive(Debug, Clone, PartialEq)]
pub struct MarketRecord {
    pub time: NaiveDateTime,
    pub end_time: NaiveDateTime,
    pub value: MarketValue,
}

impl MarketRecord {
    pub fn bar(
        time: NaiveDateTime,
        end_time: NaiveDateTime,
        open: Decimal,
        high: Decimal,
        low: Decimal,
        close: Decimal,
        volume: Decimal,
    ) -> Self {
        Self {
            time,
            end_time,
            value: MarketValue::Bar(Bar {
                open,
                high,
                low,
                close,
                volume,
            }),
        }
    }

    pub fn tick(time: NaiveDateTime, price: Decimal, size: Decimal) -> Self {
        Self {
            time,
            end_time: time,
            value: MarketValue::Tick(Tick { price, size }),
        }
    }

    pub fn quote(time: NaiveDateTime, bid: Decimal, ask: Decimal) -> Self {
        Self {
            time,
            end_time: time,
            value: MarketValue::Quote(Quote {
                bid,
                ask,
                bid_size: Decimal::ZERO,
                ask_size: Decimal::ZERO,
            }),
        }
    }
}

/// A synchronized market observation. Immutable once emitted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataPoint {
    pub subscription_id: SubscriptionId,
    pub symbol: String,
    /// Exchange timestamp (period start for bars)
    pub time: DateTime<Utc>,
    /// Emission key used by the synchronizer
    pub end_time: DateTime<Utc>,
    pub value: MarketValue,
    pub is_fill_forward: bool,
    pub is_out_of_order: bool,
}

impl DataPoint {
    pub fn price(&self) -> Decimal {
        self.value.price()
    }

    pub fn as_bar(&self) -> Option<&Bar> {
        match &self.value {
            MarketValue::Bar(bar) => Some(bar),
            _ => None,
        }
    }
}
