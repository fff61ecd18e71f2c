use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Locally assigned, monotonically increasing order identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OrderId(pub u64);

impl fmt::Display for OrderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderSide {
    Buy,
    Sell,
}

impl fmt::Display for OrderSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderSide::Buy => write!(f, "BUY"),
            OrderSide::Sell => write!(f, "SELL"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderType {
    Market,
    Limit,
    StopMarket,
    StopLimit,
    MarketOnOpen,
    MarketOnClose,
}

impl fmt::Display for OrderType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderType::Market => write!(f, "MARKET"),
            OrderType::Limit => write!(f, "LIMIT"),
            OrderType::StopMarket => write!(f, "STOP"),
            OrderType::StopLimit => write!(f, "STOP_LIMIT"),
            OrderType::MarketOnOpen => write!(f, "MOO"),
            OrderType::MarketOnClose => write!(f, "MOC"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrderStatus {
    New,
    Submitted,
    PartiallyFilled,
    Filled,
    Canceled,
    Invalid,
    UpdateSubmitted,
}

impl OrderStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Filled | OrderStatus::Canceled | OrderStatus::Invalid
        )
    }

    pub fn is_open(&self) -> bool {
        !self.is_terminal()
    }

    /// Permitted edges of the order state machine.
    pub fn can_transition_to(&self, next: OrderStatus) -> bool {
        use OrderStatus::*;
        match self {
            New => matches!(next, Submitted | Invalid | Canceled),
            Submitted => matches!(
                next,
                PartiallyFilled | Filled | Canceled | Invalid | UpdateSubmitted
            ),
            PartiallyFilled => matches!(next, PartiallyFilled | Filled | Canceled | UpdateSubmitted),
            UpdateSubmitted => matches!(
                next,
                Submitted | PartiallyFilled | Filled | Canceled | Invalid
            ),
            Filled | Canceled | Invalid => false,
        }
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RejectReason {
    InsufficientMargin,
    InvalidSymbol,
    MarketClosed,
    InvalidOrder,
    VenueError,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Order request emitted by an execution model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmitOrderRequest {
    pub symbol: String,
    /// Signed: positive buys, negative sells
    pub quantity: Decimal,
    pub order_type: OrderType,
    pub limit_price: Option<Decimal>,
    pub stop_price: Option<Decimal>,
    pub tag: String,
}

impl SubmitOrderRequest {
    pub fn market(symbol: impl Into<String>, quantity: Decimal) -> Self {
        Self {
            symbol: symbol.into(),
            quantity,
            order_type: OrderType::Market,
            limit_price: None,
            stop_price: None,
            tag: String::new(),
        }
    }

    pub fn limit(symbol: impl Into<String>, quantity: Decimal, limit_price: Decimal) -> Self {
        Self {
            order_type: OrderType::Limit,
            limit_price: Some(limit_price),
            ..Self::market(symbol, quantity)
        }
    }

    pub fn stop_market(symbol: impl Into<String>, quantity: Decimal, stop_price: Decimal) -> Self {
        Self {
            order_type: OrderType::StopMarket,
            stop_price: Some(stop_price),
            ..Self::market(symbol, quantity)
        }
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = tag.into();
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UpdateOrderFields {
    pub quantity: Option<Decimal>,
    pub limit_price: Option<Decimal>,
    pub stop_price: Option<Decimal>,
    pub tag: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum OrderRequest {
    Submit(SubmitOrderRequest),
    Cancel { order_id: OrderId },
    Update {
        order_id: OrderId,
        fields: UpdateOrderFields,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FillEvent {
    pub order_id: OrderId,
    /// Venue-unique fill identifier; fills are applied at most once per id
    pub fill_id: String,
    /// Signed like the order quantity
    pub quantity: Decimal,
    /// Venue's total filled quantity for the order after this fill, signed
    pub cumulative_quantity: Decimal,
    pub price: Decimal,
    pub fee: Decimal,
    pub time: DateTime<Utc>,
}

/// Asynchronous notifications from the brokerage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum BrokerEvent {
    Acknowledged {
        order_id: OrderId,
        broker_id: String,
        time: DateTime<Utc>,
    },
    Filled(FillEvent),
    Rejected {
        order_id: OrderId,
        reason: RejectReason,
        message: String,
        time: DateTime<Utc>,
    },
    Canceled {
        order_id: OrderId,
        time: DateTime<Utc>,
    },
    UpdateAcknowledged {
        order_id: OrderId,
        time: DateTime<Utc>,
    },
    UpdateRejected {
        order_id: OrderId,
        message: String,
        time: DateTime<Utc>,
    },
}

impl BrokerEvent {
    pub fn order_id(&self) -> OrderId {
        match self {
            BrokerEvent::Acknowledged { order_id, .. }
            | BrokerEvent::Rejected { order_id, .. }
            | BrokerEvent::Canceled { order_id, .. }
            | BrokerEvent::UpdateAcknowledged { order_id, .. }
            | BrokerEvent::UpdateRejected { order_id, .. } => *order_id,
            BrokerEvent::Filled(fill) => fill.order_id,
        }
    }

    pub fn time(&self) -> DateTime<Utc> {
        match self {
            BrokerEvent::Acknowledged { time, .. }
            | BrokerEvent::Rejected { time, .. }
            | BrokerEvent::Canceled { time, .. }
            | BrokerEvent::UpdateAcknowledged { time, .. }
            | BrokerEvent::UpdateRejected { time, .. } => *time,
            BrokerEvent::Filled(fill) => fill.time,
        }
    }
}

/// Order as the venue reports it during reconciliation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrokerOrder {
    /// Client order id echoed by the venue, when it was placed by this engine
    pub order_id: Option<OrderId>,
    pub broker_id: String,
    pub symbol: String,
    pub quantity: Decimal,
    pub filled_quantity: Decimal,
    pub average_fill_price: Decimal,
    pub status: OrderStatus,
    pub order_type: OrderType,
    pub limit_price: Option<Decimal>,
    pub stop_price: Option<Decimal>,
}

/// Order-state change delivered to strategy hooks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderEvent {
    pub order_id: OrderId,
    pub symbol: String,
    pub status: OrderStatus,
    pub fill_quantity: Decimal,
    pub fill_price: Decimal,
    pub fee: Decimal,
    pub time: DateTime<Utc>,
    pub message: String,
}

impl OrderEvent {
    pub fn is_fill(&self) -> bool {
        !self.fill_quantity.is_zero()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeRecord {
    pub order_id: OrderId,
    pub symbol: String,
    pub quantity: Decimal,
    pub price: Decimal,
    pub fee: Decimal,
    pub time: DateTime<Utc>,
}

impl From<&OrderEvent> for TradeRecord {
    fn from(event: &OrderEvent) -> Self {
        Self {
            order_id: event.order_id,
            symbol: event.symbol.clone(),
            quantity: event.fill_quantity,
            price: event.fill_price,
            fee: event.fee,
            time: event.time,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EquityPoint {
    pub time: DateTime<Utc>,
    pub cash: Decimal,
    pub equity: Decimal,
}
