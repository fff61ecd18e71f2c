use crate::domain::errors::TransactionError;
use crate::domain::trading::types::{
    OrderId, OrderSide, OrderStatus, OrderType, RejectReason, SubmitOrderRequest,
    UpdateOrderFields,
};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderFlags {
    pub reconciliation_mismatch: bool,
    /// A non-idempotent brokerage call timed out; the venue state is unknown
    pub retryable_uncertain: bool,
    /// Discovered at the venue during reconciliation
    pub adopted: bool,
    pub cancel_requested: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub id: OrderId,
    pub symbol: String,
    /// Signed: positive buys, negative sells
    pub quantity: Decimal,
    pub order_type: OrderType,
    pub limit_price: Option<Decimal>,
    pub stop_price: Option<Decimal>,
    pub status: OrderStatus,
    pub submit_time: DateTime<Utc>,
    pub broker_id: Option<String>,
    pub filled_quantity: Decimal,
    pub average_fill_price: Decimal,
    pub total_fees: Decimal,
    pub tag: String,
    pub flags: OrderFlags,
    pub rejection: Option<(RejectReason, String)>,
    pub last_update: DateTime<Utc>,
    /// Buying power held for the unfilled, exposure-increasing part
    pub reserved_margin: Decimal,
    pub pending_update: Option<UpdateOrderFields>,
}

impl Order {
    pub fn new(id: OrderId, request: SubmitOrderRequest, time: DateTime<Utc>) -> Self {
        Self {
            id,
            symbol: request.symbol,
            quantity: request.quantity,
            order_type: request.order_type,
            limit_price: request.limit_price,
            stop_price: request.stop_price,
            status: OrderStatus::New,
            submit_time: time,
            broker_id: None,
            filled_quantity: Decimal::ZERO,
            average_fill_price: Decimal::ZERO,
            total_fees: Decimal::ZERO,
            tag: request.tag,
            flags: OrderFlags::default(),
            rejection: None,
            last_update: time,
            reserved_margin: Decimal::ZERO,
            pending_update: None,
        }
    }

    pub fn side(&self) -> OrderSide {
        if self.quantity.is_sign_negative() {
            OrderSide::Sell
        } else {
            OrderSide::Buy
        }
    }

    pub fn remaining_quantity(&self) -> Decimal {
        self.quantity - self.filled_quantity
    }

    pub fn is_open(&self) -> bool {
        self.status.is_open()
    }

    /// Moves the order along a permitted edge.
    pub fn transition(
        &mut self,
        next: OrderStatus,
        time: DateTime<Utc>,
    ) -> Result<(), TransactionError> {
        if !self.status.can_transition_to(next) {
            return Err(TransactionError::InvalidTransition {
                order_id: self.id,
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        self.last_update = time;
        Ok(())
    }

    /// Status to fall back to when a pending update resolves.
    pub fn working_status(&self) -> OrderStatus {
        if self.filled_quantity.is_zero() {
            OrderStatus::Submitted
        } else {
            OrderStatus::PartiallyFilled
        }
    }
}
